//! Download pipeline: ID resolution, filename/content-type selection, and
//! streaming from a scoped scratch copy.
//!
//! Responses never stream the live store entry directly. The bytes are first
//! copied into a per-request temporary directory whose handle is owned by
//! the response body, so the scratch is deleted when the transfer ends on
//! any path (completion, client abort, or error) and a concurrent sweep of
//! the original entry cannot corrupt an in-flight download.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::{Body, Bytes};
use axum::extract::{Host, Path as AxumPath, State};
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use tempfile::TempDir;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use drophost_jad::{descriptor_name, is_archive_name, JadError, DESCRIPTOR_EXT};
use drophost_store::{FileId, StoredFile};

use crate::server::{serve_static_assets, ApiError, SharedState};

pub(crate) const NOT_FOUND_MSG: &str =
    "File not found. The specified file ID is invalid or the file has expired.";
pub(crate) const NOT_A_JAR_MSG: &str = "Not a JAR file";
pub(crate) const TOOL_UNAVAILABLE_MSG: &str =
    "Failed to run 'jadmaker'. This instance probably does not have the 'jadmaker' command \
     installed, which is required for downloading JAD files.";

/// Nokia S40 themes are mislabeled by extension-based detection, which makes
/// the receiving device refuse the file, so the type is forced.
const NOKIA_THEME_EXT: &str = ".nth";
const NOKIA_THEME_MIME: &str = "application/vnd.nok-s40theme";

/// `GET /{id}`, `/{id}.jad`, `/{id}.{ext}` — anything else falls through to
/// the static asset tree.
pub(crate) async fn handle_download(
    State(state): State<SharedState>,
    Host(host): Host,
    AxumPath(name): AxumPath<String>,
    req: Request<Body>,
) -> Response {
    let Some((id, suffix)) = parse_download_target(&name) else {
        return serve_static_assets(State(state), req).await;
    };
    state.record_request();

    match serve_download(&state, &host, id, suffix).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn serve_download(
    state: &SharedState,
    host: &str,
    id: FileId,
    suffix: Option<&str>,
) -> Result<Response, ApiError> {
    let stored = state
        .store
        .resolve(&id)
        .ok_or_else(|| ApiError::not_found(NOT_FOUND_MSG))?;

    let scratch = TempDir::new_in(&state.scratch_root)
        .map_err(|err| ApiError::internal(format!("failed to create scratch directory: {err}")))?;

    match suffix {
        Some(DESCRIPTOR_EXT) => {
            serve_descriptor(state, host, &stored, scratch).await
        }
        Some(ext) => {
            // Caller-chosen filename; the bytes are unchanged.
            let download_name = format!("{id}{ext}");
            serve_copy(&stored, scratch, &download_name).await
        }
        None => {
            let download_name = safe_download_name(&stored.original_name, &id);
            serve_copy(&stored, scratch, &download_name).await
        }
    }
}

async fn serve_copy(
    stored: &StoredFile,
    scratch: TempDir,
    download_name: &str,
) -> Result<Response, ApiError> {
    // The served filename also names the scratch copy; keep it a bare file
    // name so a crafted request cannot step outside the scratch directory.
    let fs_name = safe_download_name(download_name, &stored.id);
    let scratch_path = scratch.path().join(&fs_name);
    if let Err(err) = tokio::fs::copy(&stored.path, &scratch_path).await {
        // The entry can vanish between resolve and copy when the sweep wins
        // the race; that is an ordinary not-found, not a server fault.
        if err.kind() == io::ErrorKind::NotFound {
            debug!(id = %stored.id, "content swept mid-request");
            return Err(ApiError::not_found(NOT_FOUND_MSG));
        }
        return Err(ApiError::internal(format!(
            "failed to copy content to scratch: {err}"
        )));
    }

    stream_scratch_file(scratch, scratch_path, download_name).await
}

async fn serve_descriptor(
    state: &SharedState,
    host: &str,
    stored: &StoredFile,
    scratch: TempDir,
) -> Result<Response, ApiError> {
    if !is_archive_name(&stored.original_name) {
        return Err(ApiError::bad_request(NOT_A_JAR_MSG));
    }

    let base_url = format!("http://{host}");
    let descriptor = match state
        .jad
        .derive(stored, &base_url, scratch.path())
        .await
    {
        Ok(path) => path,
        Err(err) if err.is_tool_failure() => {
            warn!(id = %stored.id, "descriptor derivation failed: {err}");
            return Err(ApiError::dependency_unavailable(TOOL_UNAVAILABLE_MSG));
        }
        Err(JadError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
            debug!(id = %stored.id, "archive swept mid-request");
            return Err(ApiError::not_found(NOT_FOUND_MSG));
        }
        Err(err) => {
            return Err(ApiError::internal(format!(
                "descriptor derivation failed: {err}"
            )));
        }
    };

    let download_name = safe_download_name(&descriptor_name(&stored.original_name), &stored.id);
    stream_scratch_file(scratch, descriptor, &download_name).await
}

/// Build the streaming response. The scratch directory handle moves into the
/// body stream, so dropping the body on any exit path removes the scratch.
async fn stream_scratch_file(
    scratch: TempDir,
    path: PathBuf,
    download_name: &str,
) -> Result<Response, ApiError> {
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|err| ApiError::internal(format!("failed to open scratch copy: {err}")))?;
    let size = file
        .metadata()
        .await
        .map_err(|err| ApiError::internal(format!("failed to stat scratch copy: {err}")))?
        .len();

    let content_type = content_type_for(download_name);
    let disposition = format!(
        "attachment; filename=\"{}\"",
        sanitize_header_value(download_name)
    );

    let stream = ScratchStream {
        inner: ReaderStream::new(file),
        _scratch: scratch,
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            HeaderValue::from_str(&content_type)
                .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
        )
        .header(header::CONTENT_LENGTH, size)
        .header(
            header::CONTENT_DISPOSITION,
            HeaderValue::from_str(&disposition).unwrap_or_else(|_| {
                HeaderValue::from_static("attachment")
            }),
        )
        .body(Body::from_stream(stream))
        .map_err(|err| ApiError::internal(format!("failed to build response: {err}")))
}

/// Body stream that keeps the scratch directory alive until the transfer is
/// over, then deletes it via `TempDir`'s drop.
struct ScratchStream {
    inner: ReaderStream<tokio::fs::File>,
    _scratch: TempDir,
}

impl Stream for ScratchStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Split a path segment into a download target: a 6-symbol ID plus an
/// optional dot-prefixed extension. Anything else is not a download.
pub(crate) fn parse_download_target(name: &str) -> Option<(FileId, Option<&str>)> {
    if name.len() < 6 || !name.is_char_boundary(6) {
        return None;
    }
    let id: FileId = name[..6].parse().ok()?;
    let rest = &name[6..];
    if rest.is_empty() {
        Some((id, None))
    } else if rest.starts_with('.') && rest.len() > 1 {
        Some((id, Some(rest)))
    } else {
        None
    }
}

fn content_type_for(download_name: &str) -> String {
    if download_name.to_lowercase().ends_with(NOKIA_THEME_EXT) {
        return NOKIA_THEME_MIME.to_string();
    }
    mime_guess::from_path(download_name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Reduce the stored original name to a bare file name for serving; fall
/// back to the ID when the name has no usable final component.
fn safe_download_name(name: &str, id: &FileId) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty() && n != "." && n != "..")
        .unwrap_or_else(|| id.to_string())
}

fn sanitize_header_value(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_control())
        .map(|c| if c == '"' || c == '\\' { '_' } else { c })
        .collect()
}
