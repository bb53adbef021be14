//! Client library for the Filelib API: resumable, chunked, multipart file
//! uploads with optional direct-to-object-storage offload.
//!
//! [`Client`] resolves credentials once, stages files, and drives one
//! [`UploadManager`] per file. Engines negotiate chunking with the API,
//! resume interrupted uploads from a local cache, and transfer parts
//! sequentially or through a bounded worker pool.

#[macro_use]
extern crate serde;

use std::collections::HashMap;
use std::sync::Arc;

use smol_str::SmolStr;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

pub mod auth;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod error;
pub mod fs;
pub mod models;
mod parsers;
pub mod upload;

pub use auth::Authentication;
pub use cache::{FileCache, MemoryCache, UploadCache};
pub use config::FilelibConfig;
pub use credentials::{CredentialSource, Credentials};
pub use error::Error;
pub use fs::FileSource;
pub use models::UploadStatus;
pub use upload::{UploadManager, UploadOptions};

pub const AUTHENTICATION_URL: &str = "https://api.filelib.com/auth/";
pub const FILE_UPLOAD_URL: &str = "https://api.filelib.com/upload/";

/// Tells the API endpoint what SDK is communicating.
pub const REQUEST_CLIENT_SOURCE: &str = "rust_filelib";

pub const DEFAULT_CREDENTIALS_PATH: &str = "~/.filelib/credentials";

struct StagedUpload {
    index: String,
    file: FileSource,
    config: FilelibConfig,
    options: UploadOptions,
}

/// A builder for creating a [`Client`].
pub struct ClientBuilder {
    credentials: Option<Credentials>,
    source: CredentialSource,
    credentials_path: String,
    auth_url: SmolStr,
    upload_url: SmolStr,
    workers: usize,
    parallel: bool,
}

impl Default for ClientBuilder {
    fn default() -> ClientBuilder {
        ClientBuilder::new()
    }
}

impl ClientBuilder {
    pub fn new() -> ClientBuilder {
        ClientBuilder {
            credentials: None,
            source: CredentialSource::File,
            credentials_path: DEFAULT_CREDENTIALS_PATH.to_owned(),
            auth_url: SmolStr::new_static(AUTHENTICATION_URL),
            upload_url: SmolStr::new_static(FILE_UPLOAD_URL),
            workers: upload::DEFAULT_WORKERS,
            parallel: false,
        }
    }

    /// Provides the credential pair directly, bypassing resolution.
    pub fn credentials(mut self, api_key: impl Into<SmolStr>, api_secret: impl Into<SmolStr>) -> Self {
        self.credentials = Some(Credentials::new(api_key, api_secret));
        self
    }

    pub fn credentials_source(mut self, source: CredentialSource) -> Self {
        self.source = source;
        self
    }

    pub fn credentials_path(mut self, path: impl Into<String>) -> Self {
        self.credentials_path = path.into();
        self
    }

    /// Points the client at a different API deployment.
    pub fn auth_url(mut self, url: impl Into<SmolStr>) -> Self {
        self.auth_url = url.into();
        self
    }

    /// Points upload creation at a different API deployment.
    pub fn upload_url(mut self, url: impl Into<SmolStr>) -> Self {
        self.upload_url = url.into();
        self
    }

    /// Runs staged files concurrently on a pool bounded by `workers`.
    pub fn parallel(mut self, workers: usize) -> Self {
        self.parallel = true;
        self.workers = workers;
        self
    }

    /// Resolves credentials and builds the client. No network traffic
    /// happens until [`Client::upload`].
    pub fn build(self) -> Result<Client, Error> {
        let credentials = match self.credentials {
            Some(credentials) => credentials,
            None => Credentials::resolve(self.source, Some(&self.credentials_path))?,
        };

        let auth = Authentication::new(credentials).with_auth_url(self.auth_url);

        Ok(Client {
            auth: Arc::new(auth),
            upload_url: self.upload_url,
            workers: self.workers,
            parallel: self.parallel,
            added: Vec::new(),
            processed: HashMap::new(),
        })
    }
}

/// Organizes Filelib API operations: one shared [`Authentication`] and a
/// registry of per-file upload engines.
pub struct Client {
    auth: Arc<Authentication>,
    upload_url: SmolStr,
    workers: usize,
    parallel: bool,
    added: Vec<StagedUpload>,
    processed: HashMap<String, UploadManager>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn authentication(&self) -> &Authentication {
        &self.auth
    }

    /// Stages a file for upload and returns its local index.
    ///
    /// The engine itself is constructed when [`upload`](Self::upload)
    /// runs, so a staged entry holds the constructor arguments only.
    pub fn add_file(
        &mut self,
        file: FileSource,
        config: FilelibConfig,
        mut options: UploadOptions,
    ) -> Result<String, Error> {
        let name = staged_name(options.file_name.as_deref(), &file)?;

        if options.upload_url.is_none() {
            options.upload_url = Some(self.upload_url.clone());
        }

        let index = self.gen_index(&name);
        self.added.push(StagedUpload {
            index: index.clone(),
            file,
            config,
            options,
        });

        Ok(index)
    }

    // Length-qualified so the same name staged twice maps to distinct
    // result slots.
    fn gen_index(&self, file_name: &str) -> String {
        let qualified = format!("{}{}", self.added.len(), file_name);

        format!("{}_{}", self.added.len(), crc32fast::hash(qualified.as_bytes()))
    }

    /// Indexes of files staged and not yet uploaded, in staging order.
    pub fn get_files(&self) -> Vec<&str> {
        self.added.iter().map(|staged| staged.index.as_str()).collect()
    }

    /// Finished engines keyed by their local index.
    pub fn get_processed_files(&self) -> &HashMap<String, UploadManager> {
        &self.processed
    }

    pub fn get_processed(&self, index: &str) -> Option<&UploadManager> {
        self.processed.get(index)
    }

    /// Uploads every staged file.
    ///
    /// The access token is acquired up front so every engine starts with a
    /// valid one. Sequential mode stops at the first fatal error; parallel
    /// mode finishes every file and then reports the first fatal error.
    /// Either way, finished engines land in
    /// [`get_processed_files`](Self::get_processed_files).
    pub async fn upload(&mut self) -> Result<(), Error> {
        self.auth.acquire_access_token().await?;

        let staged = std::mem::take(&mut self.added);

        debug!(files = staged.len(), parallel = self.parallel, "dispatching uploads");

        if !self.parallel {
            for staged_file in staged {
                let (index, manager, failure) = run_staged(self.auth.clone(), staged_file).await;

                if let Some(manager) = manager {
                    self.processed.insert(index, manager);
                }

                if let Some(e) = failure {
                    return Err(e);
                }
            }

            return Ok(());
        }

        let semaphore = Arc::new(Semaphore::new(self.workers.max(1)));
        let mut pool = JoinSet::new();

        for staged_file in staged {
            let auth = self.auth.clone();
            let semaphore = semaphore.clone();

            pool.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => None,
                };

                run_staged(auth, staged_file).await
            });
        }

        let mut first_failure: Option<Error> = None;

        while let Some(joined) = pool.join_next().await {
            match joined {
                Ok((index, manager, failure)) => {
                    if let Some(manager) = manager {
                        self.processed.insert(index, manager);
                    }

                    if let Some(e) = failure {
                        first_failure.get_or_insert(e);
                    }
                }
                Err(e) => {
                    first_failure.get_or_insert(Error::Validation(format!("upload task panicked: {e}")));
                }
            }
        }

        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn run_staged(
    auth: Arc<Authentication>,
    staged: StagedUpload,
) -> (String, Option<UploadManager>, Option<Error>) {
    let StagedUpload {
        index,
        file,
        config,
        options,
    } = staged;

    let mut manager = match UploadManager::new(file, config, auth, options).await {
        Ok(manager) => manager,
        Err(e) => return (index, None, Some(e)),
    };

    let failure = manager.upload().await.err();

    // drop the source handle so the finished engine is inert
    manager.cleanup();

    (index, Some(manager), failure)
}

fn staged_name(file_name: Option<&str>, file: &FileSource) -> Result<String, Error> {
    if let Some(name) = file_name {
        return fs::basename(name).ok_or(Error::FileNameRequired);
    }

    match file {
        FileSource::Path(path) => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or(Error::FileNameRequired),
        FileSource::Stream(_) => Err(Error::FileNameRequired),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> Client {
        Client::builder().credentials("iam_key", "iam_secret").build().unwrap()
    }

    #[test]
    fn add_file_stages_and_indexes() {
        let mut client = test_client();
        let config = FilelibConfig::new("test_storage").unwrap();

        let index = client
            .add_file(
                FileSource::bytes(b"I am a file".to_vec()),
                config.clone(),
                UploadOptions::builder().file_name("test_file").build(),
            )
            .unwrap();

        assert_eq!(client.get_files(), vec![index.as_str()]);
        assert!(index.starts_with("0_"));

        // same name again gets a distinct slot
        let second = client
            .add_file(
                FileSource::bytes(b"I am a file too".to_vec()),
                config,
                UploadOptions::builder().file_name("test_file").build(),
            )
            .unwrap();

        assert_ne!(index, second);
        assert!(second.starts_with("1_"));
        assert_eq!(client.get_files().len(), 2);
    }

    #[test]
    fn add_file_requires_a_derivable_name() {
        let mut client = test_client();
        let config = FilelibConfig::new("test_storage").unwrap();

        let result = client.add_file(
            FileSource::bytes(b"anonymous".to_vec()),
            config,
            UploadOptions::default(),
        );

        assert!(matches!(result, Err(Error::FileNameRequired)));
    }

    #[test]
    fn staged_name_prefers_the_explicit_name() {
        let name = staged_name(Some("/deep/dir/report.pdf"), &FileSource::bytes(vec![])).unwrap();
        assert_eq!(name, "report.pdf");

        let from_path = staged_name(None, &FileSource::path("/tmp/data.bin")).unwrap();
        assert_eq!(from_path, "data.bin");
    }

    #[test]
    fn index_is_deterministic_for_same_position_and_name() {
        let client = test_client();

        assert_eq!(client.gen_index("a.txt"), client.gen_index("a.txt"));
        assert_ne!(client.gen_index("a.txt"), client.gen_index("b.txt"));
    }
}
