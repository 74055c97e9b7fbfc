//! Remote cache transport
//!
//! Parallel compressed upload/download against an S3-compatible object
//! store. Uploads take their selection from `+latest`; downloads accept an
//! explicit key set or fall back to a bucket listing. Every object travels
//! as its own archive and every task is independent: per-object failures
//! are accumulated and reported, the batch never aborts on one.

mod archive;
mod endpoint;
mod signing;

pub use archive::{compress_dir, extract_zip, ArchiveError, ArchiveFormat};
pub use endpoint::{Endpoint, EndpointStyle, DEFAULT_REGION};
pub use signing::{
    amz_date, empty_payload_hash, encode_path, payload_hash, sign, Credentials, SigningRequest,
};

use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::env::{Clock, DebugOptions, Environment, SystemClock};
use crate::store::{BinaryStore, LatestPointer, StoreError};

/// Default transfer parallelism.
pub const DEFAULT_PARALLELISM: usize = 15;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Default per-resource (whole transfer) timeout.
pub const DEFAULT_RESOURCE_TIMEOUT: Duration = Duration::from_secs(600);

/// Archives at or above this size are memory-mapped instead of read.
pub const MMAP_THRESHOLD: u64 = 50 * 1024 * 1024;

/// Errors from the remote transport
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("missing remote setting: {0}")]
    MissingSetting(&'static str),

    #[error("remote authentication failed (403)")]
    AuthFailure,

    #[error("remote bucket not found")]
    BucketNotFound,

    #[error("remote request rejected with status {status}")]
    RequestRejected { status: u16 },

    #[error("network timeout")]
    Timeout,

    #[error("http error: {0}")]
    Http(String),

    #[error("no +latest file to select uploads from")]
    NoLatestFile,

    #[error("+latest is empty, nothing to upload")]
    EmptySelection,

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

impl From<StoreError> for RemoteError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NoLatestFile(_) => RemoteError::NoLatestFile,
            other => RemoteError::Store(other),
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RemoteError::Timeout
        } else {
            RemoteError::Http(e.to_string())
        }
    }
}

/// Remote transport configuration.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub endpoint: String,
    pub bucket: String,
    pub credentials: Credentials,
    /// Explicit region; detected from the endpoint host when absent
    pub region: Option<String>,
    /// Explicit addressing style; detected from the endpoint when absent
    pub style: Option<EndpointStyle>,
    pub parallelism: usize,
    pub request_timeout: Duration,
    pub resource_timeout: Duration,
    pub debug: DebugOptions,
}

impl RemoteConfig {
    /// Build the configuration from the captured environment.
    pub fn from_env(env: &Environment) -> Result<Self, RemoteError> {
        let remote = &env.remote;
        Ok(Self {
            endpoint: remote
                .endpoint
                .clone()
                .ok_or(RemoteError::MissingSetting("S3_ENDPOINT"))?,
            bucket: remote
                .bucket
                .clone()
                .ok_or(RemoteError::MissingSetting("S3_BUCKET"))?,
            credentials: Credentials {
                access_key: remote
                    .access_key
                    .clone()
                    .ok_or(RemoteError::MissingSetting("S3_ACCESS_KEY"))?,
                secret_key: remote
                    .secret_key
                    .clone()
                    .ok_or(RemoteError::MissingSetting("S3_SECRET_KEY"))?,
            },
            region: None,
            style: None,
            parallelism: DEFAULT_PARALLELISM,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            resource_timeout: DEFAULT_RESOURCE_TIMEOUT,
            debug: env.debug,
        })
    }
}

/// Result of transferring one object.
#[derive(Debug, Clone)]
pub struct ObjectResult {
    pub key: String,
    pub ok: bool,
    pub bytes: u64,
    pub error: Option<String>,
}

impl ObjectResult {
    fn success(key: String, bytes: u64) -> Self {
        Self {
            key,
            ok: true,
            bytes,
            error: None,
        }
    }

    fn failure(key: String, error: impl Into<String>) -> Self {
        Self {
            key,
            ok: false,
            bytes: 0,
            error: Some(error.into()),
        }
    }
}

/// The object key an entry pointer uploads to.
pub fn object_key(pointer: &LatestPointer, format: ArchiveFormat) -> String {
    format!(
        "{}/{}/{}{}",
        pointer.product,
        pointer.group,
        pointer.fingerprint,
        format.suffix()
    )
}

/// The remote transport. Credentials and signing state are immutable per
/// instance.
pub struct RemoteTransport {
    endpoint: Endpoint,
    region: String,
    credentials: Credentials,
    client: reqwest::Client,
    parallelism: usize,
    resource_timeout: Duration,
    debug: DebugOptions,
    clock: Arc<dyn Clock>,
}

impl RemoteTransport {
    pub fn new(config: RemoteConfig) -> Result<Self, RemoteError> {
        let endpoint = Endpoint::resolve(&config.endpoint, &config.bucket, config.style);
        let region = config.region.clone().unwrap_or_else(|| endpoint.region());
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            endpoint,
            region,
            credentials: config.credentials,
            client,
            parallelism: config.parallelism.max(1),
            resource_timeout: config.resource_timeout,
            debug: config.debug,
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the clock (tests pin signing timestamps through this).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &str,
        body_hash: &str,
        content_type: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let now = self.clock.now();
        let date = amz_date(now);

        let mut headers: Vec<(String, String)> = vec![
            ("host".to_string(), self.endpoint.host().to_string()),
            ("x-amz-date".to_string(), date.clone()),
            ("x-amz-content-sha256".to_string(), body_hash.to_string()),
        ];
        if let Some(ct) = content_type {
            headers.push(("content-type".to_string(), ct.to_string()));
        }

        let request = SigningRequest {
            method: method.as_str(),
            path,
            query,
            headers: &headers,
            payload_hash: body_hash,
        };
        let signature = sign(&request, &self.credentials, &self.region, now);

        if self.debug.s3_trace {
            debug!(
                canonical_request = %signature.canonical_request,
                string_to_sign = %signature.string_to_sign,
                "signed {} {}",
                method,
                path
            );
        }

        let encoded = encode_path(path);
        let url = if query.is_empty() {
            self.endpoint.url(&encoded)
        } else {
            format!("{}?{}", self.endpoint.url(&encoded), query)
        };

        let mut builder = self
            .client
            .request(method, url)
            .header("x-amz-date", signature.amz_date)
            .header("x-amz-content-sha256", body_hash)
            .header("Authorization", signature.authorization);
        if let Some(ct) = content_type {
            builder = builder.header("Content-Type", ct);
        }
        builder
    }

    /// Preflight HEAD to the bucket. 2xx and 404 are accepted (the bucket
    /// may be private but reachable); 403 aborts the batch.
    pub async fn preflight(&self) -> Result<(), RemoteError> {
        let hash = empty_payload_hash();
        let response = self
            .signed_request(
                reqwest::Method::HEAD,
                &self.endpoint.bucket_path(),
                "",
                &hash,
                None,
            )
            .send()
            .await?;

        let status = response.status().as_u16();
        match status {
            200..=299 | 404 => Ok(()),
            403 => Err(RemoteError::AuthFailure),
            other => Err(RemoteError::RequestRejected { status: other }),
        }
    }

    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), RemoteError> {
        let hash = payload_hash(&body);
        let path = self.endpoint.object_path(key);
        let response = self
            .signed_request(reqwest::Method::PUT, &path, "", &hash, Some(content_type))
            .header("Content-Length", body.len())
            .body(body)
            .send()
            .await?;

        let status = response.status().as_u16();
        match status {
            200..=299 => Ok(()),
            403 => Err(RemoteError::AuthFailure),
            other => Err(RemoteError::RequestRejected { status: other }),
        }
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>, RemoteError> {
        let hash = empty_payload_hash();
        let path = self.endpoint.object_path(key);
        let response = self
            .signed_request(reqwest::Method::GET, &path, "", &hash, None)
            .send()
            .await?;

        let status = response.status().as_u16();
        match status {
            200..=299 => Ok(response.bytes().await?.to_vec()),
            403 => Err(RemoteError::AuthFailure),
            other => Err(RemoteError::RequestRejected { status: other }),
        }
    }

    /// List object keys in the bucket (ListObjectsV2).
    pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, RemoteError> {
        let hash = empty_payload_hash();
        let query = format!("list-type=2&prefix={}", encode_path(prefix).replace('/', "%2F"));
        let response = self
            .signed_request(
                reqwest::Method::GET,
                &self.endpoint.bucket_path(),
                &query,
                &hash,
                None,
            )
            .send()
            .await?;

        let status = response.status().as_u16();
        match status {
            200..=299 => {}
            403 => return Err(RemoteError::AuthFailure),
            404 => return Err(RemoteError::BucketNotFound),
            other => return Err(RemoteError::RequestRejected { status: other }),
        }

        let body = response.text().await?;
        Ok(parse_list_keys(&body))
    }

    /// Upload every entry named by `+latest`, one archive per object.
    pub async fn upload_all(
        &self,
        store: &BinaryStore,
        format: ArchiveFormat,
    ) -> Result<Vec<ObjectResult>, RemoteError> {
        let pointers = store.read_latest()?;
        if pointers.is_empty() {
            return Err(RemoteError::EmptySelection);
        }

        self.preflight().await?;
        info!(objects = pointers.len(), parallelism = self.parallelism, "starting upload");

        let results = stream::iter(pointers.into_iter().map(|pointer| {
            let key = object_key(&pointer, format);
            async move {
                match tokio::time::timeout(
                    self.resource_timeout,
                    self.upload_one(&pointer, &key, format),
                )
                .await
                {
                    Ok(Ok(bytes)) => ObjectResult::success(key, bytes),
                    Ok(Err(e)) => {
                        warn!(key = %key, error = %e, "upload failed");
                        ObjectResult::failure(key, e.to_string())
                    }
                    Err(_) => {
                        warn!(key = %key, "upload timed out");
                        ObjectResult::failure(key, RemoteError::Timeout.to_string())
                    }
                }
            }
        }))
        .buffer_unordered(self.parallelism)
        .collect()
        .await;

        Ok(results)
    }

    async fn upload_one(
        &self,
        pointer: &LatestPointer,
        key: &str,
        format: ArchiveFormat,
    ) -> Result<u64, RemoteError> {
        if format == ArchiveFormat::SevenZ {
            return Err(RemoteError::Archive(ArchiveError::Unsupported(
                "7z archives are not produced by this transport".to_string(),
            )));
        }

        let temp = std::env::temp_dir().join(format!(
            "rugby-{}{}",
            ulid::Ulid::new().to_string().to_lowercase(),
            format.suffix()
        ));

        let result = async {
            compress_dir(&pointer.path, &temp)?;
            let body = read_archive(&temp).map_err(|e| {
                RemoteError::Archive(ArchiveError::Io {
                    operation: "read archive",
                    path: temp.clone(),
                    source: e,
                })
            })?;
            let bytes = body.len() as u64;
            self.put_object(key, body, format.content_type()).await?;
            Ok(bytes)
        }
        .await;

        // The temp archive goes away on success and failure alike.
        let _ = fs::remove_file(&temp);
        result
    }

    /// Download the given keys (or everything listed in the bucket when
    /// `keys` is empty) and unpack them into the local store.
    pub async fn download_all(
        &self,
        store: &BinaryStore,
        keys: &[String],
    ) -> Result<Vec<ObjectResult>, RemoteError> {
        self.preflight().await?;

        let keys: Vec<String> = if keys.is_empty() {
            self.list_keys("").await?
        } else {
            keys.to_vec()
        };
        info!(objects = keys.len(), parallelism = self.parallelism, "starting download");

        let results = stream::iter(keys.into_iter().map(|key| async move {
            match tokio::time::timeout(self.resource_timeout, self.download_one(store, &key)).await
            {
                Ok(Ok(bytes)) => ObjectResult::success(key, bytes),
                Ok(Err(e)) => {
                    warn!(key = %key, error = %e, "download failed");
                    ObjectResult::failure(key, e.to_string())
                }
                Err(_) => {
                    warn!(key = %key, "download timed out");
                    ObjectResult::failure(key, RemoteError::Timeout.to_string())
                }
            }
        }))
        .buffer_unordered(self.parallelism)
        .collect()
        .await;

        Ok(results)
    }

    async fn download_one(&self, store: &BinaryStore, key: &str) -> Result<u64, RemoteError> {
        let format = ArchiveFormat::from_key(key).ok_or_else(|| {
            RemoteError::Archive(ArchiveError::Unsupported(key.to_string()))
        })?;
        if format == ArchiveFormat::SevenZ {
            return Err(RemoteError::Archive(ArchiveError::Unsupported(
                "7z archives are not extracted by this transport".to_string(),
            )));
        }

        let relative = key.trim_end_matches(format.suffix());
        let dest = store.root().join(relative);
        if dest.is_dir() {
            // Entry already present locally.
            return Ok(0);
        }

        let body = self.get_object(key).await?;
        let bytes = body.len() as u64;

        let temp_archive = std::env::temp_dir().join(format!(
            "rugby-{}{}",
            ulid::Ulid::new().to_string().to_lowercase(),
            format.suffix()
        ));

        let result = (|| {
            fs::write(&temp_archive, &body).map_err(|e| {
                RemoteError::Archive(ArchiveError::Io {
                    operation: "write archive",
                    path: temp_archive.clone(),
                    source: e,
                })
            })?;

            // Extract into a stage directory, then publish atomically.
            let stage = store.root().join(format!(
                ".download-{}",
                ulid::Ulid::new().to_string().to_lowercase()
            ));
            extract_zip(&temp_archive, &stage)?;
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    RemoteError::Archive(ArchiveError::Io {
                        operation: "create group dir",
                        path: parent.to_path_buf(),
                        source: e,
                    })
                })?;
            }
            match fs::rename(&stage, &dest) {
                Ok(()) => Ok(bytes),
                Err(e) => {
                    let _ = fs::remove_dir_all(&stage);
                    if dest.is_dir() {
                        // Lost a race against a concurrent download.
                        Ok(0)
                    } else {
                        Err(RemoteError::Archive(ArchiveError::Io {
                            operation: "publish entry",
                            path: dest.clone(),
                            source: e,
                        }))
                    }
                }
            }
        })();

        let _ = fs::remove_file(&temp_archive);
        result
    }
}

/// Read an archive into memory, memory-mapping files at or above the
/// threshold.
fn read_archive(path: &Path) -> std::io::Result<Vec<u8>> {
    let file = fs::File::open(path)?;
    let len = file.metadata()?.len();
    if len >= MMAP_THRESHOLD {
        // Safety: the temp archive is private to this process and not
        // modified while mapped.
        let map = unsafe { memmap2::Mmap::map(&file)? };
        Ok(map.to_vec())
    } else {
        let mut body = Vec::with_capacity(len as usize);
        let mut file = file;
        file.read_to_end(&mut body)?;
        Ok(body)
    }
}

/// Extract `<Key>` values from a ListObjectsV2 response without a full XML
/// parser; the response shape is fixed.
fn parse_list_keys(xml: &str) -> Vec<String> {
    let mut keys = Vec::new();
    for content in xml.split("<Contents>").skip(1) {
        let Some(end) = content.find("</Contents>") else {
            continue;
        };
        let content = &content[..end];
        if let Some(start) = content.find("<Key>") {
            if let Some(close) = content.find("</Key>") {
                if close > start + 5 {
                    keys.push(content[start + 5..close].to_string());
                }
            }
        }
    }
    keys
}
