use async_stream::stream;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use indicatif::HumanBytes;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::cleanup::Cleaner;
use crate::errors::{AdmissionError, StreamError};
use crate::payloads::{
    ANOTHER_INITIATED, BUSY, INVALID_PARTS, NOT_INITIATED, RECOVERABLE, error_response,
    initiated_response, streaming_response,
};
use crate::reader::{ReaderSettings, TailingReader};
use crate::session::{ActiveSession, Lookup, SessionManager};

pub struct AppState {
    pub session: Arc<SessionManager>,
    pub cleaner: Arc<Cleaner>,
    pub default_parts: usize,
    pub reader: ReaderSettings,
}

#[derive(Deserialize, Debug)]
pub struct InitiateParams {
    url: String,
    parts: Option<usize>,
}

#[derive(Deserialize, Debug)]
pub struct DownloadParams {
    url: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/initiate", get(initiate))
        .route("/download", get(download))
        .with_state(state)
}

async fn initiate(
    State(app): State<Arc<AppState>>,
    Query(params): Query<InitiateParams>,
) -> Response {
    let url = params.url;
    let parts = params.parts.unwrap_or(app.default_parts);
    if parts == 0 {
        return error_response(StatusCode::BAD_REQUEST, &url, INVALID_PARTS);
    }

    match app.session.initiate(&url, parts).await {
        Ok(info) => initiated_response(&info),
        Err(AdmissionError::Busy { active }) => {
            info!(url = %url, active = %active, "Rejected download, another one is running");
            error_response(StatusCode::TOO_MANY_REQUESTS, &url, BUSY)
        }
        Err(AdmissionError::RecoverableFetch { reason }) => {
            warn!(url = %url, "{}", reason);
            error_response(StatusCode::TOO_MANY_REQUESTS, &url, RECOVERABLE)
        }
        Err(AdmissionError::Unexpected { reason }) => {
            error!(url = %url, "{}", reason);
            error_response(StatusCode::TOO_MANY_REQUESTS, &url, RECOVERABLE)
        }
    }
}

async fn download(
    State(app): State<Arc<AppState>>,
    Query(params): Query<DownloadParams>,
) -> Response {
    let url = params.url;
    let active = match app.session.lookup(&url) {
        Lookup::NotInitiated => {
            return error_response(StatusCode::BAD_REQUEST, &url, NOT_INITIATED);
        }
        Lookup::Mismatch { active } => {
            info!(url = %url, active = %active, "Refused stream for a url that is not active");
            return error_response(StatusCode::TOO_MANY_REQUESTS, &url, ANOTHER_INITIATED);
        }
        Lookup::Active(active) => active,
    };

    let info = &active.info;
    let reader = match TailingReader::open(
        &info.output_path,
        &info.descriptor_path,
        info.total_size,
        info.parts,
        active.fetch.status(),
        app.reader,
    )
    .await
    {
        Ok(reader) => reader,
        Err(e) => {
            error!(url = %url, "Failed to open download stream: {}", e);
            app.session.release(&active);
            return error_response(StatusCode::TOO_MANY_REQUESTS, &url, RECOVERABLE);
        }
    };

    info!(
        url = %url,
        file = %info.filename,
        size = %HumanBytes(info.total_size),
        "Streaming download"
    );
    let filename = info.filename.clone();
    let size = info.total_size;
    let body = Body::from_stream(client_stream(app.clone(), active, reader));
    streaming_response(body, &filename, size)
}

/// Logs when the body is dropped before the stream finished, which is how a
/// client disconnect shows up.
struct DisconnectWatch {
    url: String,
    armed: bool,
}

impl DisconnectWatch {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for DisconnectWatch {
    fn drop(&mut self) {
        if self.armed {
            info!(url = %self.url, "Client has closed download connection prematurely...");
        }
    }
}

/// The response body. A client disconnect drops it between chunks: no more
/// reads, no cleanup, the session stays active. Handing out the last byte
/// schedules the cleanup; a read failure releases the session and aborts the
/// response.
///
/// With a known Content-Length hyper stops polling once the last byte is
/// written, so completion is detected by count rather than by the end of the
/// stream.
fn client_stream(
    app: Arc<AppState>,
    active: Arc<ActiveSession>,
    reader: TailingReader,
) -> impl Stream<Item = Result<Bytes, StreamError>> + Send + 'static {
    stream! {
        let total_size = active.info.total_size;
        let mut watch = DisconnectWatch { url: active.info.url.clone(), armed: true };
        let mut sent: u64 = 0;
        let mut completed = false;
        let chunks = reader.into_stream();
        pin_mut!(chunks);

        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => {
                    sent += chunk.len() as u64;
                    if !completed && sent >= total_size {
                        completed = true;
                        watch.disarm();
                        complete(&app, &active);
                    }
                    yield Ok(chunk);
                }
                Err(e) => {
                    watch.disarm();
                    // Headers are already out, so the client only sees a truncated body.
                    error!(url = %active.info.url, "Download stream failed: {}", e);
                    app.session.release(&active);
                    yield Err(e);
                    return;
                }
            }
        }

        // Only an empty file gets here without having completed.
        if !completed {
            watch.disarm();
            complete(&app, &active);
        }
    }
}

fn complete(app: &Arc<AppState>, active: &Arc<ActiveSession>) {
    info!(url = %active.info.url, "Download stream completed");
    app.cleaner.schedule(app.session.clone(), active.clone());
}
