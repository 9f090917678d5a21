//! HTTP ingress: accepts records and exposes health and stats.

use std::io;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::{BufferStats, IngestBuffer};
use crate::delay::{DelayRotate, PendingBatchView};
use crate::error::{BufferError, WriteError};
use crate::manager::{LoggerManager, OpenFileView};
use crate::record::{is_valid_stream_key, Record};

const MAX_HTTP_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub buffer: IngestBuffer,
    pub manager: Arc<LoggerManager>,
    pub delay: Option<Arc<DelayRotate>>,
    /// Hold the response until the record is in its file.
    pub wait_for_write: bool,
}

#[derive(Deserialize)]
struct IngestQuery {
    stream: String,
    line: Option<String>,
}

#[derive(Serialize)]
struct Stats {
    buffer: BufferStats,
    open_files: Vec<OpenFileView>,
    delay_pending: Vec<PendingBatchView>,
}

pub fn router(state: AppState, ingest_path: &str) -> Router {
    Router::new()
        .route(ingest_path, get(ingest_line).post(ingest_body))
        .route("/healthz", get(healthz))
        .route("/stats", get(stats))
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_HTTP_BODY_BYTES))
}

/// Serve `app` until `cancel` fires; in-flight requests are allowed to finish.
pub async fn serve(listener: TcpListener, app: Router, cancel: CancellationToken) -> io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "http listener started");
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    info!(%addr, "http listener stopped");
    Ok(())
}

async fn ingest_line(State(state): State<AppState>, Query(query): Query<IngestQuery>) -> Response {
    let payload = Bytes::from(query.line.unwrap_or_default());
    ingest(&state, query.stream, payload).await
}

async fn ingest_body(
    State(state): State<AppState>,
    Query(query): Query<IngestQuery>,
    body: Bytes,
) -> Response {
    ingest(&state, query.stream, body).await
}

async fn ingest(state: &AppState, stream: String, payload: Bytes) -> Response {
    if !is_valid_stream_key(&stream) {
        return (StatusCode::BAD_REQUEST, "invalid stream key").into_response();
    }
    if payload.is_empty() {
        return (StatusCode::BAD_REQUEST, "empty payload").into_response();
    }
    let record = Record::new(stream, terminate_line(payload));

    if !state.wait_for_write {
        return match state.buffer.enqueue(record).await {
            Ok(()) => (StatusCode::ACCEPTED, "queued").into_response(),
            Err(e) => buffer_error(e),
        };
    }

    let (record, ack) = record.with_ack();
    if let Err(e) = state.buffer.enqueue(record).await {
        return buffer_error(e);
    }
    match ack.await {
        Ok(Ok(())) => (StatusCode::OK, "ok").into_response(),
        Ok(Err(WriteError::InvalidStream(stream))) => {
            (StatusCode::BAD_REQUEST, format!("invalid stream key {stream:?}")).into_response()
        }
        Ok(Err(e)) => {
            warn!("ingest write failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, WriteError::Dropped.to_string()).into_response(),
    }
}

fn buffer_error(e: BufferError) -> Response {
    debug!("ingest refused: {e}");
    (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
}

/// Records are newline-delimited on disk.
fn terminate_line(payload: Bytes) -> Bytes {
    if payload.ends_with(b"\n") {
        return payload;
    }
    let mut buf = BytesMut::with_capacity(payload.len() + 1);
    buf.extend_from_slice(&payload);
    buf.put_u8(b'\n');
    buf.freeze()
}

async fn healthz() -> &'static str {
    "ok"
}

async fn stats(State(state): State<AppState>) -> Json<Stats> {
    Json(Stats {
        buffer: state.buffer.stats(),
        open_files: state.manager.snapshot().await,
        delay_pending: state.delay.as_ref().map(|d| d.pending()).unwrap_or_default(),
    })
}
