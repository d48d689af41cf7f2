use crate::events::spawn_emitter;
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use super::{AppError, AppState};

/// Per-parent event stream. One emitter task per connection polls the
/// authoritative job state; heartbeat comments ride on the keep-alive.
pub async fn chunked_stream(
    State(state): State<AppState>,
    Path(parent_job_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    // Reject unknown jobs before upgrading the connection.
    state.manager.get_parent(&parent_job_id).await?;

    tracing::info!(
        target: "api::sse",
        parent_id = %parent_job_id,
        "SSE client connected"
    );

    let (tx, rx) = mpsc::channel(64);
    spawn_emitter(
        Arc::clone(&state.manager),
        parent_job_id,
        state.emitter_config.clone(),
        tx,
    );

    let stream = ReceiverStream::new(rx)
        .map(|event| Ok(Event::default().data(event.envelope().to_string())));

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(state.emitter_config.tick)
            .text(""),
    ))
}
