//! Streaming conversion API: progress lines as they happen.
//!
//! ## Why stream?
//!
//! Recognition takes tens of seconds to minutes per page. A stream-based API
//! lets callers show where the engine is instead of a spinner, and lets the
//! HTTP layer forward each event as a Server-Sent Event the moment it is
//! published.
//!
//! Unlike [`crate::controller::JobController::convert`], which returns only
//! the final artifact, [`convert_stream`] yields every event of the job in
//! order. The last item is always `complete` (with the base64 artifact in
//! `data`) or `error`.

use crate::controller::JobController;
use crate::error::GatewayError;
use crate::events::EventStream;
use crate::job::JobId;
use crate::pipeline::input::Upload;
use crate::progress::WireEvent;
use futures::stream::StreamExt;
use std::pin::Pin;
use tokio_stream::Stream;
use tracing::info;

/// A boxed stream of wire events.
pub type WireStream = Pin<Box<dyn Stream<Item = WireEvent> + Send>>;

/// Start a conversion and stream its progress.
///
/// # Returns
/// - `Ok((job_id, WireStream))`: the job was admitted; the stream ends
///   after its terminal event
/// - `Err(GatewayError)`: the upload was rejected before the job started
pub fn convert_stream(
    controller: &JobController,
    upload: Upload,
) -> Result<(JobId, WireStream), GatewayError> {
    let handle = controller.submit(upload)?;
    let id = handle.id();
    info!(job_id = %id, "Streaming conversion started");
    Ok((id, to_wire(handle.into_events())))
}

/// Project internal events onto the wire format.
pub fn to_wire(events: EventStream) -> WireStream {
    Box::pin(events.map(|event| WireEvent::from(&event)))
}
