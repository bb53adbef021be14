//! Error interpretation for API and object-store responses.
//!
//! Relayed responses carry their error surface in `Filelib-Error-Message`
//! and `Filelib-Error-Code` headers, with a JSON envelope fallback.
//! Direct uploads to AWS S3 or compatible stores answer with an XML body:
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <Error>
//!     <Code>NoSuchUpload</Code>
//!     <Message>The specified upload does not exist.</Message>
//! </Error>
//! ```

use reqwest::header::HeaderMap;

use crate::error::{ApiErrorMessage, Error};
use crate::models::{ApiResponse, ERROR_CODE_HEADER, ERROR_MESSAGE_HEADER};

/// Platform identifier the API uses for S3-compatible direct uploads.
pub const AWS_S3_PLATFORM: &str = "AWS S3";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct S3ErrorBody {
    code: Option<String>,
    message: Option<String>,
}

fn header_str<'h>(headers: &'h HeaderMap, name: &reqwest::header::HeaderName) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Extracts `(message, code, error_code)` from a relayed API response,
/// preferring headers and falling back to the JSON envelope body.
pub(crate) fn relayed_error(code: u16, headers: &HeaderMap, body: &str) -> ApiErrorMessage {
    let envelope: Option<ApiResponse<serde_json::Value>> = serde_json::from_str(body).ok();

    let message = header_str(headers, &ERROR_MESSAGE_HEADER)
        .map(str::to_owned)
        .or_else(|| envelope.as_ref().and_then(|e| e.error.as_deref().map(str::to_owned)))
        .unwrap_or_default();

    let error_code = header_str(headers, &ERROR_CODE_HEADER)
        .map(str::to_owned)
        .or_else(|| envelope.as_ref().and_then(|e| e.error_code.as_deref().map(str::to_owned)))
        .unwrap_or_else(|| ApiErrorMessage::DEFAULT_ERROR_CODE.to_owned());

    ApiErrorMessage { message, code, error_code }
}

/// Parses a failed direct-upload response according to its storage platform.
pub(crate) fn direct_error(platform: &str, code: u16, headers: &HeaderMap, body: &str) -> ApiErrorMessage {
    if platform != AWS_S3_PLATFORM {
        return relayed_error(code, headers, body);
    }

    let parsed: S3ErrorBody = quick_xml::de::from_str(body).unwrap_or_default();

    ApiErrorMessage {
        message: parsed.message.unwrap_or_default(),
        code,
        error_code: parsed.code.unwrap_or_else(|| ApiErrorMessage::DEFAULT_ERROR_CODE.to_owned()),
    }
}

/// Consumes a non-2xx API response into [`Error::Api`].
pub(crate) async fn api_error(resp: reqwest::Response) -> Error {
    let code = resp.status().as_u16();
    let headers = resp.headers().clone();
    let body = resp.text().await.unwrap_or_default();

    Error::Api(relayed_error(code, &headers, &body))
}

/// Consumes a non-2xx chunk response into [`Error::ChunkUploadFailed`],
/// routed through the platform-specific parser for direct uploads.
pub(crate) async fn chunk_error(part: u64, platform: Option<&str>, resp: reqwest::Response) -> Error {
    let code = resp.status().as_u16();
    let headers = resp.headers().clone();
    let platform = platform.unwrap_or_default().to_owned();
    let body = resp.text().await.unwrap_or_default();

    let inner = match platform.is_empty() {
        true => relayed_error(code, &headers, &body),
        false => direct_error(&platform, code, &headers, &body),
    };

    Error::ChunkUploadFailed { part, inner }
}
