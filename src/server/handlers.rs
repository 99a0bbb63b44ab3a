//! Route handlers.

use super::error::{ApiError, ApiResult};
use super::{AppState, JOB_FINISHED_HEADER, JOB_ID_HEADER};
use crate::controller::HealthSnapshot;
use crate::error::ValidationError;
use crate::job::JobId;
use crate::pipeline::input::Upload;
use crate::progress::WireEvent;
use crate::stream::{self, WireStream};
use axum::extract::{Multipart, Path, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use tracing::{debug, warn};

/// Multipart field carrying the document.
const FILE_FIELD: &str = "file";

/// POST /convert
///
/// Run a conversion to completion and return the artifact bytes.
pub async fn convert(State(state): State<AppState>, multipart: Multipart) -> ApiResult<Response> {
    let upload = read_upload(multipart, state.controller.config().max_upload_bytes).await?;
    let handle = state.controller.submit(upload)?;
    let id = handle.id();
    let artifact = handle
        .result()
        .await
        .map_err(|e| ApiError::for_job(e, id))?;

    let headers = [
        (CONTENT_TYPE, artifact.media_type.clone()),
        (
            CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", artifact.filename),
        ),
        (HeaderName::from_static(JOB_ID_HEADER), id.to_string()),
    ];
    Ok((headers, artifact.bytes.clone()).into_response())
}

/// POST /convert/stream
///
/// Same input as `/convert`; progress is delivered as Server-Sent Events.
/// A rejected upload gets a plain JSON error before any stream is opened.
pub async fn convert_stream(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<Response> {
    let upload = read_upload(multipart, state.controller.config().max_upload_bytes).await?;
    let (id, wire) = stream::convert_stream(&state.controller, upload)?;
    Ok(sse_response(id, wire))
}

/// GET /jobs/{id}/events
///
/// Replay a job's events from the start, then follow it live. The
/// `x-job-finished` header tells whether the job had already ended.
pub async fn job_events(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> ApiResult<Response> {
    let id: JobId = raw_id
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("'{raw_id}' is not a valid job id")))?;
    let events = state
        .controller
        .subscribe(id)
        .ok_or_else(|| ApiError::NotFound(format!("job {id} is unknown or expired")))?;
    let finished = state.controller.bus().retained(id);
    debug!(job_id = %id, finished, "Attaching to job events");

    let mut response = sse_response(id, stream::to_wire(events));
    response.headers_mut().insert(
        HeaderName::from_static(JOB_FINISHED_HEADER),
        HeaderValue::from_static(if finished { "true" } else { "false" }),
    );
    Ok(response)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    #[serde(flatten)]
    usage: HealthSnapshot,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<impl Serialize>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy",
            version: env!("CARGO_PKG_VERSION"),
            usage: state.controller.health(),
        }),
    )
}

fn sse_response(id: JobId, wire: WireStream) -> Response {
    let sse = Sse::new(sse_events(wire)).keep_alive(KeepAlive::default());
    ([(HeaderName::from_static(JOB_ID_HEADER), id.to_string())], sse).into_response()
}

fn sse_events(wire: WireStream) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    wire.map(|event| Ok(to_sse(&event)))
}

fn to_sse(event: &WireEvent) -> Event {
    Event::default()
        .event("message")
        .json_data(event)
        .unwrap_or_else(|e| {
            warn!(error = %e, "Could not serialise progress event");
            Event::default()
                .event("message")
                .data(r#"{"status":"error","message":"event serialisation failed"}"#)
        })
}

/// Pull the `file` field out of the form.
///
/// The field is read chunk by chunk. Once the running total passes
/// `max_bytes`, chunks are still counted but no longer kept, so the
/// validator sees the true size without the server buffering it.
async fn read_upload(mut multipart: Multipart, max_bytes: u64) -> ApiResult<Upload> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        if field.name() != Some(FILE_FIELD) {
            debug!(field = ?field.name(), "Skipping multipart field");
            continue;
        }

        let filename = field.file_name().unwrap_or("upload").to_string();
        let content_type = field.content_type().map(str::to_string);
        let mut size: u64 = 0;
        let mut bytes = Vec::new();

        loop {
            match field.chunk().await {
                Ok(Some(chunk)) => {
                    size += chunk.len() as u64;
                    if size <= max_bytes {
                        bytes.extend_from_slice(&chunk);
                    }
                }
                Ok(None) => break,
                Err(e) if e.status() == StatusCode::PAYLOAD_TOO_LARGE => {
                    return Err(ValidationError::TooLarge {
                        size: size.max(max_bytes + 1),
                        limit: max_bytes,
                    }
                    .into());
                }
                Err(e) => return Err(ApiError::BadRequest(e.body_text())),
            }
        }

        return Ok(Upload {
            filename,
            content_type,
            size,
            bytes,
        });
    }
    Err(ValidationError::MissingFile.into())
}
