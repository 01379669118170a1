//! Upload pipeline: multipart intake, budget gating, store commit, and the
//! link listing returned to the client.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Host, Multipart, State};
use axum::response::Html;
use tracing::{debug, info};

use drophost_jad::is_archive_name;
use drophost_limit::Decision;
use drophost_store::StoredFile;

use crate::server::{ApiError, SharedState};

/// Most file parts accepted in one request.
const MAX_FILES_PER_REQUEST: usize = 10;

pub(crate) const TOO_MANY_FILES_MSG: &str =
    "The amount of uploaded files exceeds the limit of 10 files at a time.";
pub(crate) const SIZE_LIMIT_MSG: &str =
    "The uploaded file(s) exceed the file size limit of 10 MB.";

/// Extension whose clients infer content type from the URL path, so the
/// primary link carries it explicitly.
const PATH_TYPED_EXT: &str = ".nth";

struct UploadedPart {
    name: String,
    data: axum::body::Bytes,
}

/// `POST /fh` — accept 1..=10 multipart file parts and answer with a link
/// listing. Any rejection discards the received bytes without touching the
/// store or the limiter.
pub(crate) async fn handle_upload(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Host(host): Host,
    mut multipart: Multipart,
) -> Result<Html<String>, ApiError> {
    state.record_request();

    let mut parts: Vec<UploadedPart> = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("malformed multipart body: {err}")))?
    {
        let Some(name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let data = field
            .bytes()
            .await
            .map_err(|err| ApiError::bad_request(format!("malformed multipart body: {err}")))?;

        if parts.len() == MAX_FILES_PER_REQUEST {
            return Err(ApiError::bad_request(TOO_MANY_FILES_MSG));
        }
        parts.push(UploadedPart { name, data });
    }

    let request_bytes: u64 = parts.iter().map(|part| part.data.len() as u64).sum();

    let bytes_used = match state.limiter.check(addr.ip(), request_bytes) {
        Decision::TooLarge => {
            debug!(client = %addr.ip(), request_bytes, "rejecting oversized upload");
            return Err(ApiError::bad_request(SIZE_LIMIT_MSG));
        }
        Decision::BudgetExceeded {
            remaining_bytes,
            wait_minutes,
        } => {
            debug!(client = %addr.ip(), request_bytes, "rejecting over-budget upload");
            return Err(ApiError::bad_request(format!(
                "You have reached the upload limit (50 MB per hour). Please upload a smaller \
                 file (up to {} bytes) or wait {} minutes.",
                thousands(remaining_bytes),
                wait_minutes
            )));
        }
        Decision::Allow { bytes_used } => bytes_used,
    };

    let mut stored: Vec<StoredFile> = Vec::with_capacity(parts.len());
    for part in &parts {
        let record = state
            .store
            .put(&part.name, &part.data)
            .map_err(|err| ApiError::internal(format!("failed to store upload: {err}")))?;
        stored.push(record);
    }

    state.limiter.record(addr.ip(), bytes_used + request_bytes);
    info!(
        client = %addr.ip(),
        files = stored.len(),
        bytes = request_bytes,
        "accepted upload"
    );

    Ok(Html(render_listing(&host, &stored)))
}

/// The minimal listing page: one line per file with its download link, plus
/// a descriptor link for JAR uploads.
fn render_listing(host: &str, stored: &[StoredFile]) -> String {
    let entries = stored
        .iter()
        .map(|file| {
            let mut url = format!("/{}", file.id);
            if file.original_name.to_lowercase().ends_with(PATH_TYPED_EXT) {
                url.push_str(PATH_TYPED_EXT);
            }

            let mut line = format!(
                "{}: <a href=\"{url}\">http://{host}{url}</a>",
                escape_html(&file.original_name)
            );
            if is_archive_name(&file.original_name) {
                line.push_str(&format!(
                    ", jad: <a href=\"{url}.jad\">http://{host}{url}.jad</a>"
                ));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("<br/>");

    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n    <meta charset=\"UTF-8\">\n    \
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\">\n    \
         <title>Drophost</title>\n</head>\n<body>\n    <code>\n    {entries}\n    </code>\n\
         </body>\n</html>"
    )
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Thousands-separated decimal, as the byte hints have always been shown.
fn thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
