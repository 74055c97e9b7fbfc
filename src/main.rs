//! Rugby CLI
//!
//! Entry point for the `rugby` command-line tool. Subcommands map onto the
//! orchestrator workflows and store maintenance operations; everything
//! else lives in the library.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rugby::env::{Environment, GitVcs, HostToolchains, JsonProject, XcodeBuilder};
use rugby::orchestrator::{CacheOutcome, Orchestrator, RugbyPaths, TargetSelector, WorkflowError};
use rugby::remote::{ArchiveFormat, RemoteConfig, RemoteTransport};
use rugby::signal::SignalHandler;
use rugby::store::BinaryStore;
use rugby::{BuildFlags, ChangeScope, WorkflowReport};

#[derive(Parser)]
#[command(name = "rugby")]
#[command(about = "Binary cache for Xcode/CocoaPods workspaces", version)]
struct Cli {
    /// Workspace root (default: current directory)
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    /// Shared rugby root (default: <workspace>/.rugby)
    #[arg(long, global = true)]
    rugby_root: Option<PathBuf>,

    /// Increase log verbosity
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct SelectionArgs {
    /// Regex selecting targets by name
    #[arg(long)]
    targets: Option<String>,

    /// Regex excluding targets by name
    #[arg(long)]
    except: Option<String>,
}

#[derive(Args, Clone)]
struct FlagArgs {
    /// Target SDK (sim or device)
    #[arg(long, default_value = "sim")]
    sdk: rugby::Sdk,

    /// Target architecture (auto, x86_64 or arm64)
    #[arg(long, default_value = "auto")]
    arch: rugby::Arch,

    /// Build configuration
    #[arg(long, default_value = "Debug")]
    config: String,

    /// Extra KEY=VALUE build arguments
    #[arg(long = "xcarg")]
    xcargs: Vec<String>,

    /// Result bundle output path
    #[arg(long)]
    result_bundle_path: Option<PathBuf>,

    /// Ignore existing cache entries and rebuild everything
    #[arg(long)]
    ignore_cache: bool,
}

impl FlagArgs {
    fn into_flags(self) -> BuildFlags {
        BuildFlags {
            sdk: self.sdk,
            arch: self.arch,
            config: self.config,
            xcargs: self.xcargs,
            result_bundle_path: self.result_bundle_path,
            ignore_cache: self.ignore_cache,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Fingerprint, reuse cached binaries and build the rest
    Build {
        #[command(flatten)]
        selection: SelectionArgs,
        #[command(flatten)]
        flags: FlagArgs,
    },

    /// Bind targets to existing cached binaries without building
    Use {
        #[command(flatten)]
        selection: SelectionArgs,
        #[command(flatten)]
        flags: FlagArgs,
    },

    /// Force-rebuild the selected targets and refresh their cache entries
    Rebuild {
        #[command(flatten)]
        selection: SelectionArgs,
        #[command(flatten)]
        flags: FlagArgs,
    },

    /// Restore the project to its pristine state
    Rollback,

    /// Re-bind binaries while keeping locally changed packages as source
    LocalChanges {
        #[command(flatten)]
        selection: SelectionArgs,
        #[command(flatten)]
        flags: FlagArgs,
    },

    /// Print test targets impacted by changes since a base ref
    Impact {
        /// Base commit reference; omit for uncommitted changes only
        #[arg(long)]
        base_ref: Option<String>,
    },

    /// Upload +latest cache entries to the remote store
    Upload {
        /// Archive format (zip or 7z)
        #[arg(long, default_value = "zip")]
        archive: String,

        /// Transfer parallelism
        #[arg(long)]
        parallelism: Option<usize>,
    },

    /// Download cache entries from the remote store
    Download {
        /// Object keys to fetch; omit to download the full listing
        keys: Vec<String>,

        /// Transfer parallelism
        #[arg(long)]
        parallelism: Option<usize>,
    },

    /// Rewrite the +latest pointer file from the store contents
    Latest,

    /// Evict least-recently-used cache entries above the usage limit
    Reclaim {
        /// Usage fraction that triggers eviction
        #[arg(long, default_value_t = 0.9)]
        limit: f64,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("rugby=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rugby=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let workspace = cli
        .workspace
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    let rugby_root = cli
        .rugby_root
        .clone()
        .unwrap_or_else(|| workspace.join(".rugby"));
    let paths = RugbyPaths::new(&workspace, &rugby_root);
    let environment = Environment::capture();

    let code = match cli.command {
        Commands::Build { selection, flags } => {
            run_build(&paths, selection, flags.into_flags())
        }
        Commands::Use { selection, flags } => {
            run_workflow(&paths, |orchestrator| {
                let selector = selector_from(&selection)?;
                orchestrator
                    .use_binaries(&selector, &flags.clone().into_flags())
                    .map(report_summary)
            })
        }
        Commands::Rebuild { selection, flags } => {
            run_workflow(&paths, |orchestrator| {
                let selector = selector_from(&selection)?;
                orchestrator
                    .rebuild(&selector, &flags.clone().into_flags())
                    .map(report_summary)
            })
        }
        Commands::Rollback => run_workflow(&paths, |orchestrator| {
            orchestrator.rollback().map(|()| {
                println!("Project restored.");
            })
        }),
        Commands::LocalChanges { selection, flags } => {
            run_workflow(&paths, |orchestrator| {
                let selector = selector_from(&selection)?;
                orchestrator
                    .source_local_changes(selector, &flags.clone().into_flags())
                    .map(report_summary)
            })
        }
        Commands::Impact { base_ref } => run_workflow(&paths, |orchestrator| {
            let scope = match &base_ref {
                Some(base) => ChangeScope::SinceRef(base.clone()),
                None => ChangeScope::Uncommitted,
            };
            orchestrator.test_impact(&scope).map(|targets| {
                for target in &targets {
                    println!("{target}");
                }
                eprintln!("{} impacted test target(s)", targets.len());
            })
        }),
        Commands::Upload {
            archive,
            parallelism,
        } => run_upload(&paths, &environment, &archive, parallelism),
        Commands::Download { keys, parallelism } => {
            run_download(&paths, &environment, keys, parallelism)
        }
        Commands::Latest => {
            let store = BinaryStore::new(paths.bin());
            match store.refresh_latest() {
                Ok(count) => {
                    println!("{count} pointer(s) written");
                    0
                }
                Err(e) => {
                    eprintln!("Error: {e}");
                    1
                }
            }
        }
        Commands::Reclaim { limit } => {
            let store = BinaryStore::new(paths.bin());
            match store.reclaim(limit, &Default::default()) {
                Ok(result) => {
                    println!(
                        "{} entr(ies) evicted, {} bytes freed",
                        result.deleted, result.freed_bytes
                    );
                    0
                }
                Err(e) => {
                    eprintln!("Error: {e}");
                    1
                }
            }
        }
    };

    process::exit(code);
}

fn selector_from(args: &SelectionArgs) -> Result<TargetSelector, WorkflowError> {
    let mut selector = TargetSelector::all();
    if let Some(pattern) = &args.targets {
        selector = selector.with_include(pattern)?;
    }
    if let Some(pattern) = &args.except {
        selector = selector.with_except(pattern)?;
    }
    Ok(selector)
}

fn make_orchestrator(paths: &RugbyPaths) -> Orchestrator {
    let project = Arc::new(JsonProject::new(
        paths.workspace.join("rugby.project.json"),
    ));
    let builder = Arc::new(XcodeBuilder::new(
        &paths.workspace,
        paths.rugby_root.join("build"),
    ));
    let vcs = Arc::new(GitVcs::new(&paths.workspace));

    let handler = SignalHandler::new();
    let cancel = handler.cancel_token();
    if let Err(e) = handler.install() {
        eprintln!("Warning: could not install signal handler: {e}");
    }

    Orchestrator::new(
        paths.clone(),
        project.clone(),
        project,
        builder,
        vcs,
        Arc::new(HostToolchains),
    )
    .with_cancel_token(cancel)
}

fn run_workflow(
    paths: &RugbyPaths,
    run: impl FnOnce(&Orchestrator) -> Result<(), WorkflowError>,
) -> i32 {
    let orchestrator = make_orchestrator(paths);
    match run(&orchestrator) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {e}");
            e.exit_code()
        }
    }
}

fn run_build(paths: &RugbyPaths, selection: SelectionArgs, flags: BuildFlags) -> i32 {
    run_workflow(paths, |orchestrator| {
        let selector = selector_from(&selection)?;
        match orchestrator.build(&selector, &flags)? {
            CacheOutcome::Done(report) => {
                report_summary(report);
                Ok(())
            }
            CacheOutcome::AlreadyPatched => {
                // The project already consumes binaries; rebuild instead of
                // surfacing an error.
                eprintln!("Project already patched, rebuilding selection...");
                orchestrator.rebuild(&selector, &flags).map(report_summary)
            }
        }
    })
}

fn report_summary(report: WorkflowReport) {
    println!(
        "{} hit(s), {} miss(es), {} imported, {} patched",
        report.hits.len(),
        report.misses.len(),
        report.imported,
        report.patched
    );
}

fn run_upload(
    paths: &RugbyPaths,
    environment: &Environment,
    archive: &str,
    parallelism: Option<usize>,
) -> i32 {
    let format = match archive {
        "zip" => ArchiveFormat::Zip,
        "7z" => ArchiveFormat::SevenZ,
        other => {
            eprintln!("Error: unknown archive format '{other}'");
            return 1;
        }
    };

    with_transport(environment, parallelism, |transport| {
        let store = BinaryStore::new(paths.bin());
        let runtime = tokio::runtime::Runtime::new()
            .map_err(|e| format!("runtime: {e}"))?;
        let results = runtime
            .block_on(transport.upload_all(&store, format))
            .map_err(|e| e.to_string())?;
        report_transfer(&results);
        Ok(())
    })
}

fn run_download(
    paths: &RugbyPaths,
    environment: &Environment,
    keys: Vec<String>,
    parallelism: Option<usize>,
) -> i32 {
    with_transport(environment, parallelism, |transport| {
        let store = BinaryStore::new(paths.bin());
        let runtime = tokio::runtime::Runtime::new()
            .map_err(|e| format!("runtime: {e}"))?;
        let results = runtime
            .block_on(transport.download_all(&store, &keys))
            .map_err(|e| e.to_string())?;
        report_transfer(&results);
        Ok(())
    })
}

fn with_transport(
    environment: &Environment,
    parallelism: Option<usize>,
    run: impl FnOnce(RemoteTransport) -> Result<(), String>,
) -> i32 {
    let mut config = match RemoteConfig::from_env(environment) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return 1;
        }
    };
    if let Some(parallelism) = parallelism {
        config.parallelism = parallelism;
    }
    let transport = match RemoteTransport::new(config) {
        Ok(transport) => transport,
        Err(e) => {
            eprintln!("Error: {e}");
            return 1;
        }
    };
    match run(transport) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {e}");
            1
        }
    }
}

fn report_transfer(results: &[rugby::ObjectResult]) {
    let ok = results.iter().filter(|r| r.ok).count();
    let failed = results.len() - ok;
    for result in results.iter().filter(|r| !r.ok) {
        eprintln!(
            "  failed: {} ({})",
            result.key,
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    println!("{ok} transferred, {failed} failed");
}
