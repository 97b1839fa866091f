// Copyright 2026 KubeInfer Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Model distribution HTTP service.
//!
//! Served by the elected coordinator only, and only once the model
//! directory is complete, so a 200 listing implies a full artifact set.
//! Files stream straight from disk; multi-gigabyte artifacts are the
//! common case.

use axum::Router;
use axum::body::Body;
use axum::extract::{Path as UrlPath, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use std::path::{Component, Path, PathBuf};
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Well-known port followers pull from.
pub const SERVER_PORT: u16 = crate::types::v1alpha1::llmservice::DISTRIBUTION_PORT as u16;

pub fn router(model_path: PathBuf) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/models", get(list_models))
        .route("/models/{*path}", get(download_model))
        .layer(TraceLayer::new_for_http())
        .with_state(model_path)
}

async fn health() -> impl IntoResponse {
    "OK\n"
}

/// Lists the immediate entries of the model directory, one name per line.
/// Subdirectories appear as plain names; the service does not recurse.
async fn list_models(State(model_path): State<PathBuf>) -> Response {
    let mut entries = match tokio::fs::read_dir(&model_path).await {
        Ok(entries) => entries,
        Err(e) => {
            error!(error = %e, "failed to read model directory");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to list models").into_response();
        }
    };

    let mut listing = String::new();
    let mut count = 0usize;
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                listing.push_str(&entry.file_name().to_string_lossy());
                listing.push('\n');
                count += 1;
            }
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "failed to read model directory");
                return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to list models")
                    .into_response();
            }
        }
    }

    info!(count, "listed model files");
    ([(header::CONTENT_TYPE, "text/plain")], listing).into_response()
}

async fn download_model(
    State(model_path): State<PathBuf>,
    UrlPath(relative): UrlPath<String>,
) -> Response {
    let Some(full_path) = safe_join(&model_path, &relative) else {
        warn!(path = %relative, "blocked path traversal attempt");
        return (StatusCode::BAD_REQUEST, "Invalid path").into_response();
    };

    let file = match tokio::fs::File::open(&full_path).await {
        Ok(file) => file,
        Err(_) => return (StatusCode::NOT_FOUND, "File not found").into_response(),
    };

    let metadata = match file.metadata().await {
        Ok(metadata) => metadata,
        Err(e) => {
            error!(error = %e, path = %relative, "failed to stat model file");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to stat file").into_response();
        }
    };
    if metadata.is_dir() {
        return (StatusCode::NOT_FOUND, "File not found").into_response();
    }

    let filename = full_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    info!(path = %relative, size = metadata.len(), "serving model file");

    (
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_owned()),
            (header::CONTENT_LENGTH, metadata.len().to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={filename}"),
            ),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response()
}

/// Joins a request path under the model root, rejecting anything that
/// could escape it. Only plain path segments survive.
fn safe_join(root: &Path, relative: &str) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        return None;
    }
    Some(root.join(clean))
}

#[cfg(test)]
mod tests {
    use super::{SERVER_PORT, router, safe_join};
    use axum::Router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use http_body_util::BodyExt;
    use std::path::{Path, PathBuf};
    use tower::ServiceExt;

    fn model_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("config.json"), b"{}").expect("write config");
        std::fs::write(dir.path().join("model.safetensors"), vec![7u8; 128]).expect("write model");
        std::fs::create_dir(dir.path().join("snapshots")).expect("mkdir");
        dir
    }

    async fn send(app: Router, method: &str, uri: &str) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes()
            .to_vec();
        (status, headers, body)
    }

    #[test]
    fn test_server_port_matches_pod_template() {
        assert_eq!(i32::from(SERVER_PORT), 8080);
    }

    #[tokio::test]
    async fn test_health_answers_ok() {
        let dir = model_dir();
        let (status, _, body) = send(router(dir.path().to_path_buf()), "GET", "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"OK\n");
    }

    #[tokio::test]
    async fn test_listing_is_flat_and_plain_text() {
        let dir = model_dir();
        let (status, headers, body) = send(router(dir.path().to_path_buf()), "GET", "/models").await;

        assert_eq!(status, StatusCode::OK);
        assert!(
            headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.starts_with("text/plain"))
        );

        let listing = String::from_utf8(body).expect("utf8 listing");
        let mut names: Vec<&str> = listing.lines().collect();
        names.sort_unstable();
        assert_eq!(names, vec!["config.json", "model.safetensors", "snapshots"]);
    }

    #[tokio::test]
    async fn test_empty_directory_lists_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (status, _, body) = send(router(dir.path().to_path_buf()), "GET", "/models").await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_file_streams_with_length_and_disposition() {
        let dir = model_dir();
        let (status, headers, body) =
            send(router(dir.path().to_path_buf()), "GET", "/models/model.safetensors").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
            Some("application/octet-stream")
        );
        assert_eq!(
            headers
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok()),
            Some("128")
        );
        assert_eq!(
            headers
                .get(header::CONTENT_DISPOSITION)
                .and_then(|v| v.to_str().ok()),
            Some("attachment; filename=model.safetensors")
        );
        assert_eq!(body, vec![7u8; 128]);
    }

    #[tokio::test]
    async fn test_unknown_file_is_not_found() {
        let dir = model_dir();
        let (status, _, _) = send(router(dir.path().to_path_buf()), "GET", "/models/missing.bin").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_subdirectory_fetch_is_not_found() {
        let dir = model_dir();
        let (status, _, _) = send(router(dir.path().to_path_buf()), "GET", "/models/snapshots").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_path_traversal_is_rejected() {
        let dir = model_dir();
        let (status, _, body) =
            send(router(dir.path().to_path_buf()), "GET", "/models/../etc/passwd").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, b"Invalid path");
    }

    #[tokio::test]
    async fn test_non_get_methods_are_rejected() {
        let dir = model_dir();
        for uri in ["/health", "/models", "/models/config.json"] {
            let (status, _, _) = send(router(dir.path().to_path_buf()), "POST", uri).await;
            assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED, "POST {uri}");
        }
    }

    #[test]
    fn test_safe_join_allows_nested_names_only() {
        let root = Path::new("/models");

        assert_eq!(
            safe_join(root, "config.json"),
            Some(PathBuf::from("/models/config.json"))
        );
        assert_eq!(
            safe_join(root, "snapshots/weights.bin"),
            Some(PathBuf::from("/models/snapshots/weights.bin"))
        );
        assert_eq!(safe_join(root, "../etc/passwd"), None);
        assert_eq!(safe_join(root, "/etc/passwd"), None);
        assert_eq!(safe_join(root, "a/../../b"), None);
        assert_eq!(safe_join(root, ""), None);
        assert_eq!(safe_join(root, "."), None);
    }
}
