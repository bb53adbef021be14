//! End-to-end upload engine scenarios against a mock API.

mod common;

use std::collections::BTreeSet;

use filelib::cache::UploadCache;
use filelib::upload::CACHE_LOCATION_KEY;
use filelib::{FileSource, MemoryCache, UploadManager, UploadOptions, UploadStatus};
use wiremock::matchers::{body_string, header, header_exists, method, path};
use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

use common::{mount_auth, patched_part_numbers, test_auth, test_config, upload_url};

fn pending_response(location: &str, chunk_size: u64) -> ResponseTemplate {
    ResponseTemplate::new(201)
        .insert_header("Location", location)
        .insert_header("Filelib-Upload-Max-Chunk-Size", "10000")
        .insert_header("Filelib-Upload-Min-Chunk-Size", "1000")
        .insert_header("Filelib-Upload-Chunk-Size", chunk_size.to_string().as_str())
        .insert_header("Filelib-File-Upload-Status", "pending")
}

async fn manager_opts(server: &MockServer, data: &[u8], options: UploadOptions) -> UploadManager {
    UploadManager::new(
        FileSource::bytes(data.to_vec()),
        test_config(),
        test_auth(server),
        options,
    )
    .await
    .unwrap()
}

async fn manager(server: &MockServer, data: &[u8], cache: MemoryCache) -> UploadManager {
    let options = UploadOptions::builder()
        .file_name("test_file.txt")
        .cache(Box::new(cache))
        .upload_url(upload_url(server))
        .build();

    manager_opts(server, data, options).await
}

/// Scenario 1: fresh small-file upload, single thread.
#[tokio::test]
async fn fresh_small_file_upload() {
    let server = MockServer::start().await;
    mount_auth(&server).await;

    let location = format!("{}/u/abc", server.uri());

    Mock::given(method("POST"))
        .and(path("/upload/"))
        .and(header_exists("authorization"))
        .and(header("filelib-config-storage", "test_storage"))
        .respond_with(pending_response(&location, 5000))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/u/abc"))
        .and(header("filelib-upload-part-chunk-number", "1"))
        .and(header("filelib-upload-chunk-size", "5000"))
        .and(body_string("iamtestfile"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let cache = MemoryCache::new();
    let mut up = manager(&server, b"iamtestfile", cache.clone()).await;

    up.upload().await.unwrap();

    assert_eq!(up.get_upload_status(), UploadStatus::Completed);
    assert!(up.get_upload_part_number_set().is_empty());
    assert_eq!(up.calculate_part_count(), 1);
    assert_eq!(up.entity_url(), Some(location.as_str()));
    assert_eq!(cache.get(CACHE_LOCATION_KEY).as_deref(), Some(location.as_str()));
}

/// Scenario 2: resumed multi-part upload from a cached location.
#[tokio::test]
async fn resumed_upload_transfers_only_missing_parts() {
    let server = MockServer::start().await;
    mount_auth(&server).await;

    let location = format!("{}/u/r", server.uri());

    Mock::given(method("GET"))
        .and(path("/u/r"))
        .and(header_exists("authorization"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Filelib-File-Upload-Status", "started")
                .insert_header("Filelib-Upload-Missing-Part-Numbers", "1,2,5")
                .insert_header("Filelib-Upload-Part-Number-Position", "10")
                .insert_header("Filelib-Upload-Chunk-Size", "1"),
        )
        .expect(2)
        .mount(&server)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/u/r"))
        .respond_with(ResponseTemplate::new(201))
        .expect(3)
        .mount(&server)
        .await;

    let mut cache = MemoryCache::new();
    cache.set(CACHE_LOCATION_KEY, &location);

    let mut up = manager(&server, &[b'i'; 10], cache.clone()).await;

    // the status fetch reopens exactly the parts the server is missing;
    // position 10 is the last uploaded part of 10, so it adds nothing
    up.init_upload().await.unwrap();
    let expected: BTreeSet<u64> = [1, 2, 5].into();
    assert_eq!(up.get_upload_part_number_set(), &expected);
    assert_eq!(up.get_upload_status(), UploadStatus::Started);
    assert_eq!(up.chunk_size(), 1);

    up.upload().await.unwrap();

    assert_eq!(up.get_upload_status(), UploadStatus::Completed);
    // ascending order keeps the highest part last
    assert_eq!(patched_part_numbers(&server).await, vec![1, 2, 5]);
}

/// Scenario 3: a 404 on the status fetch invalidates the cache and
/// creates a fresh upload record exactly once.
#[tokio::test]
async fn stale_cache_is_invalidated_on_404() {
    let server = MockServer::start().await;
    mount_auth(&server).await;

    let stale = format!("{}/u/gone", server.uri());
    let fresh = format!("{}/u/fresh", server.uri());

    Mock::given(method("GET"))
        .and(path("/u/gone"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/upload/"))
        .respond_with(pending_response(&fresh, 5000))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/u/fresh"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let mut cache = MemoryCache::new();
    cache.set(CACHE_LOCATION_KEY, &stale);

    let mut up = manager(&server, b"iamtestfile", cache.clone()).await;

    up.upload().await.unwrap();

    assert_eq!(up.get_upload_status(), UploadStatus::Completed);
    assert_eq!(cache.get(CACHE_LOCATION_KEY).as_deref(), Some(fresh.as_str()));
}

struct NoFilelibHeaders;

impl Match for NoFilelibHeaders {
    fn matches(&self, request: &Request) -> bool {
        !request.headers.contains_key("authorization")
            && !request.headers.contains_key("filelib-upload-part-chunk-number")
    }
}

/// Scenario 4: direct upload routes chunk bytes to third-party storage
/// with no auth headers, then logs the part back to the API.
#[tokio::test]
async fn direct_upload_with_log_callback() {
    let server = MockServer::start().await;
    mount_auth(&server).await;

    let location = format!("{}/u/d", server.uri());

    Mock::given(method("POST"))
        .and(path("/upload/"))
        .respond_with(pending_response(&location, 5000).set_body_json(serde_json::json!({
            "status": true,
            "error": null,
            "error_code": null,
            "data": {
                "is_direct_upload": true,
                "upload_urls": {
                    "1": {
                        "method": "put",
                        "url": format!("{}/s3/x", server.uri()),
                        "log_url": format!("{}/log/1", server.uri()),
                        "platform": "AWS S3"
                    }
                }
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("PUT"))
        .and(path("/s3/x"))
        .and(NoFilelibHeaders)
        .and(body_string("iamtestfile"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/log/1"))
        .and(header_exists("authorization"))
        .and(header("filelib-upload-part-chunk-number", "1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let mut up = manager(&server, b"iamtestfile", MemoryCache::new()).await;

    up.upload().await.unwrap();

    assert!(up.is_direct_upload());
    assert_eq!(up.get_upload_status(), UploadStatus::Completed);
}

/// A failed direct part surfaces the parsed S3 error.
#[tokio::test]
async fn direct_upload_failure_parses_the_s3_error_body() {
    let server = MockServer::start().await;
    mount_auth(&server).await;

    let location = format!("{}/u/d2", server.uri());

    Mock::given(method("POST"))
        .and(path("/upload/"))
        .respond_with(pending_response(&location, 5000).set_body_json(serde_json::json!({
            "status": true,
            "data": {
                "is_direct_upload": true,
                "upload_urls": {
                    "1": { "method": "put", "url": format!("{}/s3/x2", server.uri()), "platform": "AWS S3" }
                }
            }
        })))
        .mount(&server)
        .await;

    Mock::given(method("PUT"))
        .and(path("/s3/x2"))
        .respond_with(ResponseTemplate::new(404).set_body_string(
            r#"<?xml version="1.0" encoding="UTF-8"?>
               <Error>
                   <Code>NoSuchUpload</Code>
                   <Message>The specified upload does not exist.</Message>
               </Error>"#,
        ))
        .mount(&server)
        .await;

    let mut up = manager(&server, b"iamtestfile", MemoryCache::new()).await;

    up.upload().await.unwrap();

    assert_eq!(up.get_upload_status(), UploadStatus::Failed);
    assert!(up.get_error().contains("NoSuchUpload"));
    assert!(up.get_error().contains("The specified upload does not exist."));
}

/// Scenario 5: multithreaded upload holds the highest part back until
/// every pooled part has landed.
#[tokio::test]
async fn multithread_upload_sends_the_highest_part_last() {
    let server = MockServer::start().await;
    mount_auth(&server).await;

    let location = format!("{}/u/m", server.uri());

    Mock::given(method("POST"))
        .and(path("/upload/"))
        .respond_with(pending_response(&location, 1))
        .mount(&server)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/u/m"))
        .respond_with(ResponseTemplate::new(200))
        .expect(8)
        .mount(&server)
        .await;

    let options = UploadOptions::builder()
        .file_name("test_file.txt")
        .cache(Box::new(MemoryCache::new()))
        .upload_url(upload_url(&server))
        .multithreading(true)
        .workers(4)
        .build();

    let mut up = manager_opts(&server, b"8bytes!!", options).await;

    up.upload().await.unwrap();

    assert_eq!(up.get_upload_status(), UploadStatus::Completed);

    let parts = patched_part_numbers(&server).await;
    assert_eq!(parts.len(), 8);
    assert_eq!(*parts.last().unwrap(), 8, "completion trigger must arrive last");
    assert_eq!(parts.iter().copied().collect::<BTreeSet<u64>>(), (1..=8).collect());
}

/// Scenario 6: a failing chunk with `abort_on_fail` records the error,
/// issues exactly one DELETE, and stays failed.
#[tokio::test]
async fn abort_on_fail_cancels_once_and_stays_failed() {
    let server = MockServer::start().await;
    mount_auth(&server).await;

    let location = format!("{}/u/f", server.uri());

    Mock::given(method("POST"))
        .and(path("/upload/"))
        .respond_with(pending_response(&location, 5000))
        .mount(&server)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/u/f"))
        .respond_with(
            ResponseTemplate::new(400)
                .insert_header("Filelib-Error-Message", "test_upload_chunk_error")
                .insert_header("Filelib-Error-Code", "TEST_UPLOAD_CHUNK_CODE"),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("DELETE"))
        .and(path("/u/f"))
        .and(header_exists("authorization"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let options = UploadOptions::builder()
        .file_name("test_file.txt")
        .cache(Box::new(MemoryCache::new()))
        .upload_url(upload_url(&server))
        .abort_on_fail(true)
        .build();

    let mut up = manager_opts(&server, b"iamtestfile", options).await;

    up.upload().await.unwrap();

    assert_eq!(up.get_upload_status(), UploadStatus::Failed);
    assert!(up.get_error().contains("test_upload_chunk_error"));
    assert!(up.get_error().contains("TEST_UPLOAD_CHUNK_CODE"));
}

/// Re-running a completed upload performs one status fetch and moves no
/// bytes.
#[tokio::test]
async fn reupload_after_completion_transfers_nothing() {
    let server = MockServer::start().await;
    mount_auth(&server).await;

    let location = format!("{}/u/done", server.uri());

    Mock::given(method("POST"))
        .and(path("/upload/"))
        .respond_with(pending_response(&location, 5000))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/u/done"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/u/done"))
        .respond_with(ResponseTemplate::new(200).insert_header("Filelib-File-Upload-Status", "completed"))
        .expect(1)
        .mount(&server)
        .await;

    let cache = MemoryCache::new();
    let mut up = manager(&server, b"iamtestfile", cache.clone()).await;

    up.upload().await.unwrap();
    assert_eq!(up.get_upload_status(), UploadStatus::Completed);

    // second run resolves through the cache and the status fetch only
    up.upload().await.unwrap();
    assert_eq!(up.get_upload_status(), UploadStatus::Completed);
}

/// A non-404 error on the status fetch is fatal and carries the header
/// error surface.
#[tokio::test]
async fn status_fetch_error_surfaces_api_fields() {
    let server = MockServer::start().await;
    mount_auth(&server).await;

    let location = format!("{}/u/oops", server.uri());

    Mock::given(method("GET"))
        .and(path("/u/oops"))
        .respond_with(
            ResponseTemplate::new(400)
                .insert_header("Filelib-Error-Message", "test_error")
                .insert_header("Filelib-Error-Code", "TEST_ERROR_CODE"),
        )
        .mount(&server)
        .await;

    let mut cache = MemoryCache::new();
    cache.set(CACHE_LOCATION_KEY, &location);

    let mut up = manager(&server, b"iamtestfile", cache).await;

    let err = up.upload().await.unwrap_err();

    match err {
        filelib::Error::Api(api) => {
            assert_eq!(api.message, "test_error");
            assert_eq!(api.code, 400);
            assert_eq!(api.error_code, "TEST_ERROR_CODE");
        }
        other => panic!("expected an API error, got: {other}"),
    }
}

/// Cancel issues one DELETE and transitions to `cancelled`.
#[tokio::test]
async fn cancel_transitions_terminally() {
    let server = MockServer::start().await;
    mount_auth(&server).await;

    let location = format!("{}/u/c", server.uri());

    Mock::given(method("POST"))
        .and(path("/upload/"))
        .respond_with(pending_response(&location, 5000))
        .mount(&server)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/u/c"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("DELETE"))
        .and(path("/u/c"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let mut up = manager(&server, b"iamtestfile", MemoryCache::new()).await;

    up.init_upload().await.unwrap();

    // a part can go out by hand before the caller changes its mind
    up.upload_chunk(1).await.unwrap();

    up.cancel().await.unwrap();

    assert_eq!(up.get_upload_status(), UploadStatus::Cancelled);
}

/// A failed cancel surfaces the API error and leaves the status alone.
#[tokio::test]
async fn failed_cancel_raises() {
    let server = MockServer::start().await;
    mount_auth(&server).await;

    let location = format!("{}/u/c2", server.uri());

    Mock::given(method("POST"))
        .and(path("/upload/"))
        .respond_with(pending_response(&location, 5000))
        .mount(&server)
        .await;

    Mock::given(method("DELETE"))
        .and(path("/u/c2"))
        .respond_with(
            ResponseTemplate::new(400)
                .insert_header("Filelib-Error-Message", "test_cancel_upload_error")
                .insert_header("Filelib-Error-Code", "TEST_CANCEL_UPLOAD_ERROR_CODE"),
        )
        .mount(&server)
        .await;

    let mut up = manager(&server, b"iamtestfile", MemoryCache::new()).await;

    up.init_upload().await.unwrap();

    assert!(matches!(up.cancel().await, Err(filelib::Error::Api(_))));
    assert_ne!(up.get_upload_status(), UploadStatus::Cancelled);
}

/// `clear_cache` truncates the namespace after the upload settles.
#[tokio::test]
async fn clear_cache_truncates_after_success() {
    let server = MockServer::start().await;
    mount_auth(&server).await;

    let location = format!("{}/u/cc", server.uri());

    Mock::given(method("POST"))
        .and(path("/upload/"))
        .respond_with(pending_response(&location, 5000))
        .mount(&server)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/u/cc"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let cache = MemoryCache::new();

    let options = UploadOptions::builder()
        .file_name("test_file.txt")
        .cache(Box::new(cache.clone()))
        .upload_url(upload_url(&server))
        .clear_cache(true)
        .build();

    let mut up = manager_opts(&server, b"iamtestfile", options).await;

    up.upload().await.unwrap();

    assert_eq!(up.get_upload_status(), UploadStatus::Completed);
    assert_eq!(cache.get(CACHE_LOCATION_KEY), None);
}
