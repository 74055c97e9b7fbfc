//! Per-object archives
//!
//! Cache entries travel as single-object archives. Zip is produced and
//! extracted natively at deflate level 1 (transfer time dominates, not
//! ratio); 7z keys are recognized for addressing but not produced here.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Archive format of a remote object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArchiveFormat {
    #[default]
    Zip,
    SevenZ,
}

impl ArchiveFormat {
    /// Object key suffix, with dot.
    pub fn suffix(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => ".zip",
            ArchiveFormat::SevenZ => ".7z",
        }
    }

    /// HTTP content type for the archive body.
    pub fn content_type(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "application/zip",
            ArchiveFormat::SevenZ => "application/x-7z-compressed",
        }
    }

    /// Detect the format from an object key.
    pub fn from_key(key: &str) -> Option<Self> {
        if key.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else if key.ends_with(".7z") {
            Some(ArchiveFormat::SevenZ)
        } else {
            None
        }
    }
}

/// Errors from archive operations
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("{operation} failed at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("unsupported archive format: {0}")]
    Unsupported(String),
}

fn io_err(operation: &'static str, path: &Path, source: io::Error) -> ArchiveError {
    ArchiveError::Io {
        operation,
        path: path.to_path_buf(),
        source,
    }
}

/// Compress a directory into a zip archive at `dest`. Entry order is
/// sorted so equal trees produce equal archives. Returns the archive size
/// in bytes.
pub fn compress_dir(dir: &Path, dest: &Path) -> Result<u64, ArchiveError> {
    let file = File::create(dest).map_err(|e| io_err("create archive", dest, e))?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(1));

    let mut paths: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.path().to_path_buf())
        .collect();
    paths.sort();

    let mut buffer = Vec::new();
    for path in paths {
        let relative = path
            .strip_prefix(dir)
            .expect("walk stays under the root")
            .to_string_lossy()
            .replace('\\', "/");
        if relative.is_empty() {
            continue;
        }
        if path.is_dir() {
            writer.add_directory(format!("{relative}/"), options)?;
        } else {
            writer.start_file(relative, options)?;
            let mut source = File::open(&path).map_err(|e| io_err("open file", &path, e))?;
            buffer.clear();
            source
                .read_to_end(&mut buffer)
                .map_err(|e| io_err("read file", &path, e))?;
            writer
                .write_all(&buffer)
                .map_err(|e| io_err("write archive", dest, e))?;
        }
    }

    writer.finish()?;
    let size = std::fs::metadata(dest)
        .map_err(|e| io_err("stat archive", dest, e))?
        .len();
    Ok(size)
}

/// Extract a zip archive into `dest`.
pub fn extract_zip(archive: &Path, dest: &Path) -> Result<(), ArchiveError> {
    let file = File::open(archive).map_err(|e| io_err("open archive", archive, e))?;
    let mut zip = ZipArchive::new(file)?;
    std::fs::create_dir_all(dest).map_err(|e| io_err("create dest", dest, e))?;
    zip.extract(dest)?;
    Ok(())
}
