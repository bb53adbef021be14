//! The per-file upload engine.
//!
//! An [`UploadManager`] negotiates upload parameters with the API,
//! partitions its source into numbered parts, transfers them either
//! sequentially or through a bounded worker pool (possibly directly to a
//! third-party object store), resumes interrupted uploads from the local
//! cache, and records a terminal status.

use std::collections::{BTreeSet, HashMap};
use std::io::SeekFrom;
use std::sync::Arc;

use bytes::Bytes;
use reqwest::header::{HeaderMap, LOCATION};
use reqwest::{Method, StatusCode};
use smol_str::SmolStr;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};
use typed_builder::TypedBuilder;

use crate::auth::Authentication;
use crate::cache::{cache_namespace, FileCache, UploadCache};
use crate::config::FilelibConfig;
use crate::error::Error;
use crate::fs::{self, ByteSource, FileSource};
use crate::models::{
    h, ApiResponse, CreateUploadPayload, DirectUploadPart, UploadInitData, UploadStatus,
    FILE_UPLOAD_STATUS_HEADER, UPLOAD_CHUNK_SIZE_HEADER, UPLOAD_MAX_CHUNK_SIZE_HEADER,
    UPLOAD_MIN_CHUNK_SIZE_HEADER, UPLOAD_MISSING_PART_NUMBERS_HEADER, UPLOAD_PART_CHUNK_NUM_HEADER,
    UPLOAD_PART_NUMBER_POSITION_HEADER,
};
use crate::parsers;

pub const MB: u64 = 1_000_000;
pub const MAX_CHUNK_SIZE: u64 = 64 * MB;
pub const MIN_CHUNK_SIZE: u64 = 5 * MB;

pub const DEFAULT_WORKERS: usize = 4;

/// Reserved cache key holding the server-side upload URL for resumption.
pub const CACHE_LOCATION_KEY: &str = "LOCATION";

/// Options accepted by [`UploadManager::new`].
#[derive(TypedBuilder)]
pub struct UploadOptions {
    /// Name to upload under. Required when the source carries no name of
    /// its own (any non-path source).
    #[builder(default, setter(strip_option, into))]
    pub file_name: Option<String>,

    /// Resumption-state store for this file. When absent, the engine opens
    /// a file-backed store under a fingerprint-derived namespace.
    #[builder(default, setter(strip_option))]
    pub cache: Option<Box<dyn UploadCache>>,

    /// Transfer chunks through a worker pool instead of sequentially.
    #[builder(default)]
    pub multithreading: bool,

    /// Worker-pool size. `None` means the runtime default of 4; explicit
    /// values are validated to be at least 1.
    #[builder(default, setter(strip_option))]
    pub workers: Option<usize>,

    #[builder(default, setter(strip_option, into))]
    pub content_type: Option<String>,

    /// Treat cache reads as misses for resumption and skip cache writes.
    #[builder(default)]
    pub ignore_cache: bool,

    /// Issue a cancel to the API when a transfer fails.
    #[builder(default)]
    pub abort_on_fail: bool,

    /// Truncate this file's cache namespace once a terminal state is
    /// reached.
    #[builder(default)]
    pub clear_cache: bool,

    /// Upload-create endpoint override, for local or dev API deployments.
    #[builder(default, setter(strip_option, into))]
    pub upload_url: Option<SmolStr>,
}

impl Default for UploadOptions {
    fn default() -> UploadOptions {
        UploadOptions::builder().build()
    }
}

/// Per-file upload state machine.
pub struct UploadManager {
    file_name: String,
    file: Option<Arc<Mutex<Box<dyn ByteSource>>>>,
    file_size: Option<u64>,

    config: FilelibConfig,
    auth: Arc<Authentication>,
    http: reqwest::Client,
    cache: Box<dyn UploadCache>,

    multithreading: bool,
    workers: Option<usize>,
    content_type: Option<String>,
    ignore_cache: bool,
    abort_on_fail: bool,
    clear_cache: bool,

    upload_url: SmolStr,
    entity_url: Option<SmolStr>,
    entity_url_map: Option<HashMap<SmolStr, DirectUploadPart>>,
    is_direct_upload: bool,

    max_chunk_size: u64,
    min_chunk_size: u64,
    chunk_size: u64,

    pending_parts: BTreeSet<u64>,
    status: UploadStatus,
    error: String,
}

impl UploadManager {
    pub async fn new(
        file: FileSource,
        config: FilelibConfig,
        auth: Arc<Authentication>,
        options: UploadOptions,
    ) -> Result<UploadManager, Error> {
        let (file_name, mut stream) = fs::process_file(options.file_name.as_deref(), file).await?;

        let cache: Box<dyn UploadCache> = match options.cache {
            Some(cache) => cache,
            None => {
                let namespace = fingerprint(stream.as_mut(), &file_name).await?;
                Box::new(FileCache::open_default(&namespace.to_string())?)
            }
        };

        let http = auth.http().clone();

        Ok(UploadManager {
            file_name,
            file: Some(Arc::new(Mutex::new(stream))),
            file_size: None,
            config,
            auth,
            http,
            cache,
            multithreading: options.multithreading,
            workers: options.workers,
            content_type: options.content_type,
            ignore_cache: options.ignore_cache,
            abort_on_fail: options.abort_on_fail,
            clear_cache: options.clear_cache,
            upload_url: options.upload_url.unwrap_or_else(|| SmolStr::new_static(crate::FILE_UPLOAD_URL)),
            entity_url: None,
            entity_url_map: None,
            is_direct_upload: false,
            max_chunk_size: MAX_CHUNK_SIZE,
            min_chunk_size: MIN_CHUNK_SIZE,
            chunk_size: MAX_CHUNK_SIZE,
            pending_parts: BTreeSet::new(),
            status: UploadStatus::Pending,
            error: String::new(),
        })
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn get_upload_status(&self) -> UploadStatus {
        self.status
    }

    /// Last recorded error message; empty if none.
    pub fn get_error(&self) -> &str {
        &self.error
    }

    pub fn entity_url(&self) -> Option<&str> {
        self.entity_url.as_deref()
    }

    pub fn is_direct_upload(&self) -> bool {
        self.is_direct_upload
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn max_chunk_size(&self) -> u64 {
        self.max_chunk_size
    }

    pub fn min_chunk_size(&self) -> u64 {
        self.min_chunk_size
    }

    /// Part numbers still to upload, 1-based.
    pub fn get_upload_part_number_set(&self) -> &BTreeSet<u64> {
        &self.pending_parts
    }

    /// Seeks to the end of the source once and caches the length.
    pub async fn get_file_size(&mut self) -> Result<u64, Error> {
        if let Some(size) = self.file_size {
            return Ok(size);
        }

        let file = self.file.clone().ok_or(Error::FileObjectNotReadable)?;
        let mut guard = file.lock().await;
        let size = fs::stream_len(guard.as_mut()).await?;

        self.file_size = Some(size);

        Ok(size)
    }

    /// Number of parts at the current chunk size.
    pub fn calculate_part_count(&self) -> u64 {
        match self.file_size {
            Some(size) if self.chunk_size > 0 => size.div_ceil(self.chunk_size),
            _ => 0,
        }
    }

    // Cache access goes through these wrappers so `ignore_cache` reads
    // come back as misses and writes become no-ops. Deletes still reach
    // the store.

    pub fn has_cache(&self) -> bool {
        !self.ignore_cache && self.cache.get(CACHE_LOCATION_KEY).is_some()
    }

    pub fn get_cache(&self, key: &str) -> Option<String> {
        if self.ignore_cache {
            return None;
        }

        self.cache.get(key)
    }

    pub fn set_cache(&mut self, key: &str, value: &str) -> bool {
        if self.ignore_cache {
            return false;
        }

        self.cache.set(key, value);
        true
    }

    pub fn delete_cache(&mut self, key: &str) {
        self.cache.delete(key);
    }

    pub fn truncate_cache(&mut self) {
        self.cache.truncate();
    }

    /// Creates the upload record on the API, or resumes from a cached one.
    pub async fn init_upload(&mut self) -> Result<(), Error> {
        self.get_file_size().await?;

        if self.get_cache(CACHE_LOCATION_KEY).is_some() {
            return self.fetch_upload_status().await;
        }

        self.create_upload().await
    }

    async fn create_upload(&mut self) -> Result<(), Error> {
        let file_size = self.get_file_size().await?;

        let mut headers = self.auth.to_headers().await?;
        headers.extend(self.config.to_headers());

        let payload = CreateUploadPayload {
            file_name: &self.file_name,
            file_size,
            mimetype: self.content_type.as_deref(),
        };

        debug!(file = %self.file_name, file_size, "creating upload record");

        let resp = self
            .http
            .post(self.upload_url.as_str())
            .headers(headers)
            .json(&payload)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(parsers::api_error(resp).await);
        }

        let headers = resp.headers().clone();
        let data = parse_upload_body(resp).await;

        self.apply_upload_params(&headers, data.as_ref())
    }

    /// Fetches the server's view of a previously-started upload.
    ///
    /// A 404 means the server no longer knows this upload: the cached URL
    /// is dropped and a fresh record is created exactly once.
    pub async fn fetch_upload_status(&mut self) -> Result<(), Error> {
        self.get_file_size().await?;

        let Some(location) = self.get_cache(CACHE_LOCATION_KEY) else {
            return self.create_upload().await;
        };

        let headers = self.auth.to_headers().await?;
        let resp = self.http.get(&location).headers(headers).send().await?;

        if resp.status() == StatusCode::NOT_FOUND {
            debug!(%location, "server lost this upload, recreating");
            self.delete_cache(CACHE_LOCATION_KEY);

            return self.create_upload().await;
        }

        if !resp.status().is_success() {
            return Err(parsers::api_error(resp).await);
        }

        self.entity_url = Some(SmolStr::new(&location));

        let headers = resp.headers().clone();
        let data = parse_upload_body(resp).await;

        self.apply_upload_params(&headers, data.as_ref())
    }

    /// Interprets an upload-create or upload-status response.
    fn apply_upload_params(&mut self, headers: &HeaderMap, data: Option<&UploadInitData>) -> Result<(), Error> {
        self.max_chunk_size = parse_size_header(headers, &UPLOAD_MAX_CHUNK_SIZE_HEADER).unwrap_or(self.max_chunk_size);
        self.min_chunk_size = parse_size_header(headers, &UPLOAD_MIN_CHUNK_SIZE_HEADER).unwrap_or(self.min_chunk_size);
        self.chunk_size = parse_size_header(headers, &UPLOAD_CHUNK_SIZE_HEADER).unwrap_or(self.max_chunk_size);

        if let Some(status) = header_str(headers, &FILE_UPLOAD_STATUS_HEADER).and_then(UploadStatus::parse) {
            self.status = status;
        }

        match self.status {
            UploadStatus::Started => {
                if let Some(list) = header_str(headers, &UPLOAD_MISSING_PART_NUMBERS_HEADER) {
                    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                        let part: u64 = entry.parse().map_err(|_| {
                            Error::Validation(format!("invalid missing part number on status response: {entry}"))
                        })?;

                        self.pending_parts.insert(part);
                    }
                }

                // The position marks the last uploaded part; everything
                // after it has not arrived yet.
                if let Some(position) = header_str(headers, &UPLOAD_PART_NUMBER_POSITION_HEADER) {
                    let position: u64 = position.parse().map_err(|_| {
                        Error::Validation(format!("invalid part number position on status response: {position}"))
                    })?;

                    let part_count = self.calculate_part_count();
                    self.pending_parts.extend(position + 1..=part_count);
                }
            }
            UploadStatus::Pending => {
                if let Some(location) = header_str(headers, &LOCATION) {
                    self.entity_url = Some(SmolStr::new(location));
                }

                self.pending_parts = (1..=self.calculate_part_count()).collect();
            }
            _ => {}
        }

        if let Some(url) = self.entity_url.clone() {
            self.set_cache(CACHE_LOCATION_KEY, &url);
        }

        if let Some(data) = data {
            if data.is_direct_upload {
                self.is_direct_upload = true;
                self.entity_url_map = Some(data.upload_urls.clone());
            }
        }

        Ok(())
    }

    /// Reads the chunk belonging to a 1-based part number. The final part
    /// may be short.
    pub async fn get_chunk(&mut self, part_number: u64) -> Result<Bytes, Error> {
        let size = self.get_file_size().await?;

        let start = (part_number - 1) * self.chunk_size;
        let len = self.chunk_size.min(size.saturating_sub(start));

        let file = self.file.clone().ok_or(Error::FileObjectNotReadable)?;
        let mut guard = file.lock().await;

        fs::read_chunk(guard.as_mut(), start, len as usize).await
    }

    /// Transfers a single part.
    pub async fn upload_chunk(&self, part_number: u64) -> Result<(), Error> {
        let transfer = self.chunk_transfer()?;

        transfer.upload_chunk(part_number).await
    }

    fn chunk_transfer(&self) -> Result<ChunkTransfer, Error> {
        let file = self.file.clone().ok_or(Error::FileObjectNotReadable)?;
        let entity_url = self
            .entity_url
            .clone()
            .ok_or_else(|| Error::Validation("upload is not initialized: no entity url".to_owned()))?;

        Ok(ChunkTransfer {
            http: self.http.clone(),
            auth: self.auth.clone(),
            file,
            file_size: self.file_size.unwrap_or_default(),
            chunk_size: self.chunk_size,
            entity_url,
            direct: self.is_direct_upload.then(|| self.entity_url_map.clone().unwrap_or_default()),
        })
    }

    fn worker_count(&self) -> Result<usize, Error> {
        match self.workers {
            None => Ok(DEFAULT_WORKERS),
            Some(0) => Err(Error::Validation("workers must be at least 1".to_owned())),
            Some(workers) => Ok(workers),
        }
    }

    /// Uploads pending parts one at a time, in ascending order so the
    /// highest part arrives last and finalizes the server record.
    pub async fn single_thread_upload(&mut self) -> Result<(), Error> {
        self.status = UploadStatus::Started;

        let transfer = self.chunk_transfer()?;
        let parts: Vec<u64> = self.pending_parts.iter().copied().collect();

        for part in parts {
            transfer.upload_chunk(part).await?;
            self.pending_parts.remove(&part);
        }

        self.status = UploadStatus::Completed;

        Ok(())
    }

    /// Uploads pending parts through a `workers`-bounded pool.
    ///
    /// The highest pending part is withheld from the pool and sent after
    /// every worker finishes, since its arrival is the server's completion
    /// trigger. Worker failures are recorded without stopping siblings,
    /// and the final part is sent regardless.
    pub async fn multithread_upload(&mut self) -> Result<(), Error> {
        let workers = self.worker_count()?;

        self.status = UploadStatus::Started;

        let transfer = Arc::new(self.chunk_transfer()?);

        let Some(last) = self.pending_parts.last().copied() else {
            return Err(Error::NoChunksToUpload);
        };

        let semaphore = Arc::new(Semaphore::new(workers));
        let mut pool: JoinSet<(u64, Result<(), Error>)> = JoinSet::new();

        for part in self.pending_parts.iter().copied().filter(|&p| p != last) {
            let transfer = transfer.clone();
            let semaphore = semaphore.clone();

            pool.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (part, Err(Error::Validation("worker pool closed".to_owned()))),
                };

                (part, transfer.upload_chunk(part).await)
            });
        }

        let mut first_failure: Option<Error> = None;

        while let Some(joined) = pool.join_next().await {
            match joined {
                Ok((part, Ok(()))) => {
                    self.pending_parts.remove(&part);
                }
                Ok((part, Err(e))) => {
                    warn!(part, error = %e, "chunk upload failed");
                    self.error = e.to_string();
                    first_failure.get_or_insert(e);
                }
                Err(e) => {
                    self.error = e.to_string();
                    first_failure.get_or_insert(Error::Validation(format!("upload worker panicked: {e}")));
                }
            }
        }

        match transfer.upload_chunk(last).await {
            Ok(()) => {
                self.pending_parts.remove(&last);
            }
            Err(e) => {
                self.error = e.to_string();
                return Err(e);
            }
        }

        if let Some(e) = first_failure {
            return Err(e);
        }

        self.status = UploadStatus::Completed;

        Ok(())
    }

    /// Runs the whole upload: init or resume, transfer, terminal status.
    ///
    /// Transfer failures are captured into [`get_error`](Self::get_error)
    /// with `status = failed`; initialization failures propagate.
    pub async fn upload(&mut self) -> Result<(), Error> {
        let outcome = self.run_upload().await;

        if self.clear_cache {
            self.truncate_cache();
        }

        outcome
    }

    async fn run_upload(&mut self) -> Result<(), Error> {
        self.init_upload().await?;

        if self.pending_parts.is_empty() {
            if self.status != UploadStatus::Completed {
                return Err(Error::NoChunksToUpload);
            }

            debug!(file = %self.file_name, "upload already completed, nothing to transfer");
            return Ok(());
        }

        let result = if self.multithreading {
            self.multithread_upload().await
        } else {
            self.single_thread_upload().await
        };

        if let Err(e) = result {
            self.status = UploadStatus::Failed;
            self.error = e.to_string();

            if self.abort_on_fail {
                if let Err(cancel_err) = self.cancel().await {
                    debug!(error = %cancel_err, "cancel after failed transfer also failed");
                }

                // The original failure stays authoritative over the
                // cancel transition.
                self.status = UploadStatus::Failed;
            }
        }

        Ok(())
    }

    /// Cancels the upload on the API. Success is a terminal transition.
    pub async fn cancel(&mut self) -> Result<(), Error> {
        let Some(entity_url) = self.entity_url.clone() else {
            return Err(Error::Validation("upload is not initialized: no entity url".to_owned()));
        };

        let headers = self.auth.to_headers().await?;
        let resp = self.http.delete(entity_url.as_str()).headers(headers).send().await?;

        if !resp.status().is_success() {
            return Err(parsers::api_error(resp).await);
        }

        self.status = UploadStatus::Cancelled;

        Ok(())
    }

    /// Releases the source handle so the manager can be kept around (or
    /// shipped across workers) without pinning the file open.
    pub fn cleanup(&mut self) {
        self.file = None;
    }
}

/// Immutable per-transfer state shared by chunk workers.
struct ChunkTransfer {
    http: reqwest::Client,
    auth: Arc<Authentication>,
    file: Arc<Mutex<Box<dyn ByteSource>>>,
    file_size: u64,
    chunk_size: u64,
    entity_url: SmolStr,
    direct: Option<HashMap<SmolStr, DirectUploadPart>>,
}

impl ChunkTransfer {
    async fn read_part(&self, part_number: u64) -> Result<Bytes, Error> {
        let start = (part_number - 1) * self.chunk_size;
        let len = self.chunk_size.min(self.file_size.saturating_sub(start));

        // seek+read must not interleave with another worker's
        let mut guard = self.file.lock().await;

        fs::read_chunk(guard.as_mut(), start, len as usize).await
    }

    async fn chunk_headers(&self, part_number: u64) -> Result<HeaderMap, Error> {
        let mut headers = self.auth.to_headers().await?;

        h!(headers.UPLOAD_PART_CHUNK_NUM_HEADER => &part_number.to_string());
        h!(headers.UPLOAD_CHUNK_SIZE_HEADER => &self.chunk_size.to_string());

        Ok(headers)
    }

    async fn upload_chunk(&self, part_number: u64) -> Result<(), Error> {
        let chunk = self.read_part(part_number).await?;

        match &self.direct {
            Some(map) => self.direct_chunk(map, part_number, chunk).await,
            None => self.relayed_chunk(part_number, chunk).await,
        }
    }

    async fn relayed_chunk(&self, part_number: u64, chunk: Bytes) -> Result<(), Error> {
        let headers = self.chunk_headers(part_number).await?;

        let resp = self
            .http
            .patch(self.entity_url.as_str())
            .headers(headers)
            .body(chunk)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(parsers::chunk_error(part_number, None, resp).await);
        }

        Ok(())
    }

    async fn direct_chunk(
        &self,
        map: &HashMap<SmolStr, DirectUploadPart>,
        part_number: u64,
        chunk: Bytes,
    ) -> Result<(), Error> {
        let Some(dest) = map.get(part_number.to_string().as_str()) else {
            return Err(Error::Validation(format!("no direct upload url for part {part_number}")));
        };

        let method = Method::from_bytes(dest.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| Error::Validation(format!("unusable direct upload method: {}", dest.method)))?;

        // Third-party stores reject foreign headers; the byte path gets
        // neither auth nor the Filelib part headers.
        let resp = self.http.request(method, dest.url.as_str()).body(chunk).send().await?;

        if !resp.status().is_success() {
            return Err(parsers::chunk_error(part_number, Some(&dest.platform), resp).await);
        }

        if let Some(log_url) = &dest.log_url {
            let headers = self.chunk_headers(part_number).await?;
            let resp = self.http.post(log_url.as_str()).headers(headers).send().await?;

            if !resp.status().is_success() {
                return Err(parsers::chunk_error(part_number, None, resp).await);
            }
        }

        Ok(())
    }
}

async fn fingerprint(stream: &mut (dyn ByteSource), file_name: &str) -> Result<u32, Error> {
    stream.seek(SeekFrom::Start(0)).await.map_err(|_| Error::FileNotSeekable)?;

    let mut head = [0u8; 1000];
    let mut filled = 0;

    while filled < head.len() {
        let n = stream
            .read(&mut head[filled..])
            .await
            .map_err(|_| Error::FileObjectNotReadable)?;

        if n == 0 {
            break;
        }

        filled += n;
    }

    stream.seek(SeekFrom::Start(0)).await.map_err(|_| Error::FileNotSeekable)?;

    Ok(cache_namespace(&head[..filled], file_name))
}

async fn parse_upload_body(resp: reqwest::Response) -> Option<UploadInitData> {
    let text = resp.text().await.ok()?;

    serde_json::from_str::<ApiResponse<UploadInitData>>(&text).ok()?.data
}

fn header_str<'h>(headers: &'h HeaderMap, name: &reqwest::header::HeaderName) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Size headers parse strictly but fall back to the currently-held value
/// when absent or malformed.
fn parse_size_header(headers: &HeaderMap, name: &reqwest::header::HeaderName) -> Option<u64> {
    header_str(headers, name).and_then(|v| v.parse().ok())
}
