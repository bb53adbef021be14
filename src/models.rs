//! Wire models and protocol headers for the Filelib API.
//!
//! These types are largely read-only.

use std::collections::HashMap;

use reqwest::header::HeaderName;
use smol_str::SmolStr;

// Request headers carrying upload routing configuration.
pub const CONFIG_STORAGE_HEADER: HeaderName = HeaderName::from_static("filelib-config-storage");
pub const CONFIG_PREFIX_HEADER: HeaderName = HeaderName::from_static("filelib-config-prefix");
pub const CONFIG_ACCESS_HEADER: HeaderName = HeaderName::from_static("filelib-config-access");

// Upload negotiation headers (server -> client on create/status responses).
pub const UPLOAD_MAX_CHUNK_SIZE_HEADER: HeaderName = HeaderName::from_static("filelib-upload-max-chunk-size");
pub const UPLOAD_MIN_CHUNK_SIZE_HEADER: HeaderName = HeaderName::from_static("filelib-upload-min-chunk-size");
pub const UPLOAD_CHUNK_SIZE_HEADER: HeaderName = HeaderName::from_static("filelib-upload-chunk-size");
pub const UPLOAD_MISSING_PART_NUMBERS_HEADER: HeaderName =
    HeaderName::from_static("filelib-upload-missing-part-numbers");
pub const UPLOAD_PART_NUMBER_POSITION_HEADER: HeaderName =
    HeaderName::from_static("filelib-upload-part-number-position");
pub const FILE_UPLOAD_STATUS_HEADER: HeaderName = HeaderName::from_static("filelib-file-upload-status");

// Chunk transfer headers (client -> server on PATCH / log callbacks).
pub const UPLOAD_PART_CHUNK_NUM_HEADER: HeaderName = HeaderName::from_static("filelib-upload-part-chunk-number");

// Error surface on relayed responses.
pub const ERROR_MESSAGE_HEADER: HeaderName = HeaderName::from_static("filelib-error-message");
pub const ERROR_CODE_HEADER: HeaderName = HeaderName::from_static("filelib-error-code");

macro_rules! h {
    ($headers:ident.$key:expr => $value:expr) => {
        $headers.insert(
            $key,
            reqwest::header::HeaderValue::from_str($value).expect("Unable to use header value"),
        );
    };
}

pub(crate) use h;

/// Upload lifecycle status as spoken on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// Initialized but no parts are sent.
    Pending,
    /// Some parts are sent.
    Started,
    /// All parts are uploaded and the transfer completed entirely.
    Completed,
    /// User or server cancelled the upload.
    Cancelled,
    /// Error occurred during upload progress.
    Failed,
}

impl UploadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Started => "started",
            UploadStatus::Completed => "completed",
            UploadStatus::Cancelled => "cancelled",
            UploadStatus::Failed => "failed",
        }
    }

    /// Parses the wire vocabulary. Unknown values yield `None` so callers
    /// can keep their currently-held status.
    pub fn parse(value: &str) -> Option<UploadStatus> {
        Some(match value {
            "pending" => UploadStatus::Pending,
            "started" => UploadStatus::Started,
            "completed" => UploadStatus::Completed,
            "cancelled" => UploadStatus::Cancelled,
            "failed" => UploadStatus::Failed,
            _ => return None,
        })
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The JSON envelope every Filelib API response is wrapped in.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    #[serde(default)]
    pub status: bool,

    #[serde(default)]
    pub error: Option<SmolStr>,

    #[serde(default)]
    pub error_code: Option<SmolStr>,

    #[serde(default = "Option::default")]
    pub data: Option<T>,
}

/// `data` object of a successful authentication response.
#[derive(Debug, Deserialize)]
pub struct AccessTokenData {
    pub access_token: SmolStr,

    /// ISO-8601 expiration timestamp.
    pub expiration: SmolStr,
}

/// `data` object of an upload-create or upload-status response.
///
/// Only populated when the server routes chunk bytes directly to a
/// third-party object store.
#[derive(Debug, Default, Deserialize)]
pub struct UploadInitData {
    #[serde(default)]
    pub is_direct_upload: bool,

    /// Per-part direct-upload routing, keyed by part number as a string.
    #[serde(default)]
    pub upload_urls: HashMap<SmolStr, DirectUploadPart>,
}

/// Routing entry for one directly-uploaded part.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectUploadPart {
    /// HTTP method to use against `url`; the server may spell it lowercase.
    pub method: SmolStr,

    /// Third-party object store URL receiving the raw chunk bytes.
    pub url: SmolStr,

    /// Per-part callback on the API recording success of the transfer.
    #[serde(default)]
    pub log_url: Option<SmolStr>,

    /// Storage platform identifier, selects the error parser (`AWS S3`).
    #[serde(default)]
    pub platform: SmolStr,
}

/// Body of the upload-create POST.
#[derive(Debug, Serialize)]
pub struct CreateUploadPayload<'a> {
    pub file_name: &'a str,
    pub file_size: u64,
    pub mimetype: Option<&'a str>,
}
