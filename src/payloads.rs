use axum::body::Body;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::session::SessionInfo;

pub const STARTED: &str = "Downloader has started..";
pub const BUSY: &str = "Downloader is busy.. Free download is limited to single download.";
pub const RECOVERABLE: &str = "Recoverable Download error.";
pub const NOT_INITIATED: &str = "Download not initiated.";
pub const ANOTHER_INITIATED: &str = "Another download initiated.";
pub const INVALID_PARTS: &str = "Parts must be at least 1.";

const MEDIA_TYPE_STREAM: &str = "application/octet-stream";

/// Numbers are sent as strings, as existing clients expect.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InitiatedPayload {
    pub url: String,
    pub filename: String,
    pub file_path: String,
    pub size: String,
    pub parts: String,
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorPayload {
    pub url: String,
    pub message: String,
}

pub fn initiated_response(info: &SessionInfo) -> Response {
    let payload = InitiatedPayload {
        url: info.url.clone(),
        filename: info.filename.clone(),
        file_path: info.output_path.display().to_string(),
        size: info.total_size.to_string(),
        parts: info.parts.to_string(),
        message: STARTED.to_string(),
    };
    (StatusCode::OK, Json(payload)).into_response()
}

pub fn error_response(status: StatusCode, url: &str, message: &str) -> Response {
    let payload = ErrorPayload {
        url: url.to_string(),
        message: message.to_string(),
    };
    (status, Json(payload)).into_response()
}

pub fn streaming_response(body: Body, filename: &str, size: u64) -> Response {
    let disposition = format!("attachment; filename=\"{}\"", urlencoding::encode(filename));
    let disposition = HeaderValue::try_from(disposition)
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

    (
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(MEDIA_TYPE_STREAM)),
            (header::CONTENT_LENGTH, HeaderValue::from(size)),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response()
}
