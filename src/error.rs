use std::path::PathBuf;

/// Error payload surfaced by the Filelib API on a non-2xx response.
///
/// `code` carries the HTTP status, `error_code` the API's symbolic code
/// (from the `Filelib-Error-Code` header or the JSON envelope).
#[derive(Debug, Clone)]
pub struct ApiErrorMessage {
    pub message: String,
    pub code: u16,
    pub error_code: String,
}

impl ApiErrorMessage {
    pub const DEFAULT_ERROR_CODE: &'static str = "FILELIB_API_ERROR";
}

impl std::fmt::Display for ApiErrorMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.code, self.error_code, self.message)
    }
}

impl std::error::Error for ApiErrorMessage {}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Reqwest Error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Serde JSON Error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JWT Error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("Credential source is invalid: {0}. Must be one of: file, env")]
    UnsupportedCredentialsSource(String),

    #[error("Credential file at provided path is missing the `filelib` section")]
    MissingCredentialSection,

    #[error("Credential file `filelib` section is missing key: {0}")]
    CredentialSectionKeyMissing(&'static str),

    #[error("Credentials file cannot be found at: {}", .0.display())]
    CredentialsFileDoesNotExist(PathBuf),

    #[error("Environment variable {0} does not exist or is missing a value")]
    CredEnvKeyValueMissing(&'static str),

    #[error("Failed to acquire access token from Filelib API: {0}")]
    AcquiringAccessTokenFailed(String),

    #[error("Validation failed for config options: {0}")]
    ConfigValidation(&'static str),

    #[error("Config prefix can only contain ASCII letters, digits, `_`, `-` and `/`")]
    ConfigPrefixInvalid,

    #[error("File not found at given path: {}", .0.display())]
    FileDoesNotExist(PathBuf),

    #[error("No permission to read file at: {}", .0.display())]
    AccessToFileDenied(PathBuf),

    #[error("Provided file object is not readable")]
    FileObjectNotReadable,

    #[error("Provided file object is not seekable")]
    FileNotSeekable,

    #[error("`file` object does not have a name. Provide a `file_name` value.")]
    FileNameRequired,

    #[error("Filelib API Error: {0}")]
    Api(#[from] ApiErrorMessage),

    #[error("Upload of chunk {part} failed: {inner}")]
    ChunkUploadFailed { part: u64, inner: ApiErrorMessage },

    #[error("No chunks left to upload")]
    NoChunksToUpload,

    #[error("Validation failed: {0}")]
    Validation(String),
}
