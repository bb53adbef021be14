//! Shared fixtures for driving the client against a mock API.
#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;
use filelib::{Authentication, Credentials, FilelibConfig};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub fn auth_response(token: &str) -> serde_json::Value {
    let expiration = (Utc::now() + chrono::Duration::hours(1)).to_rfc3339();

    serde_json::json!({
        "status": true,
        "error": null,
        "error_code": null,
        "data": { "access_token": token, "expiration": expiration }
    })
}

/// Mounts a permissive token endpoint at `/auth/`.
pub async fn mount_auth(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/auth/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(auth_response("iam_access_token")))
        .mount(server)
        .await;
}

pub fn test_auth(server: &MockServer) -> Arc<Authentication> {
    Arc::new(
        Authentication::new(Credentials::new("iam_key", "iam_secret"))
            .with_auth_url(format!("{}/auth/", server.uri())),
    )
}

pub fn test_config() -> FilelibConfig {
    FilelibConfig::new("test_storage").unwrap()
}

pub fn upload_url(server: &MockServer) -> String {
    format!("{}/upload/", server.uri())
}

/// Part numbers of every relayed chunk the server saw, in arrival order.
pub async fn patched_part_numbers(server: &MockServer) -> Vec<u64> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|req| req.method.as_str() == "PATCH")
        .map(|req| {
            req.headers
                .get("filelib-upload-part-chunk-number")
                .expect("PATCH without part number header")
                .to_str()
                .unwrap()
                .parse()
                .unwrap()
        })
        .collect()
}
