//! Event streaming handlers

use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use steward_types::{ExecutionEvent, RunId};

/// Replay position
#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    /// Only events with a greater sequence number
    pub after: Option<u64>,
}

/// Stream a run's events via SSE.
///
/// Replays stored events after the `Last-Event-ID` header (or `?after=`),
/// then follows live events. The stream ends after the run's terminal event.
pub async fn stream_events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let run_id = RunId::new(run_id);
    state.engine.get_run(&run_id).await?;
    let after = match last_event_id(&headers)? {
        Some(seq) => Some(seq),
        None => query.after,
    };

    tracing::debug!(run_id = %run_id, ?after, "Event subscriber attached");
    let events = state.engine.subscribe(&run_id, after).await?;
    let stream = events.map(|event| Ok(to_sse(&event)));

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(state.keep_alive)
            .text("ping"),
    ))
}

/// Stored events of a run
pub async fn event_history(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Vec<ExecutionEvent>>> {
    let run_id = RunId::new(run_id);
    state.engine.get_run(&run_id).await?;
    Ok(Json(
        state
            .engine
            .history(&run_id, query.after.unwrap_or(0))
            .await?,
    ))
}

fn to_sse(event: &ExecutionEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_default();
    Event::default()
        .id(event.seq.to_string())
        .event(event.event_type.as_str())
        .data(data)
}

fn last_event_id(headers: &HeaderMap) -> ApiResult<Option<u64>> {
    let Some(value) = headers.get("last-event-id") else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .map(Some)
        .ok_or_else(|| ApiError::BadRequest("Last-Event-ID must be a sequence number".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn last_event_id_parses_sequence() {
        let mut headers = HeaderMap::new();
        assert_eq!(last_event_id(&headers).unwrap(), None);
        headers.insert("last-event-id", HeaderValue::from_static(" 7 "));
        assert_eq!(last_event_id(&headers).unwrap(), Some(7));
        headers.insert("last-event-id", HeaderValue::from_static("seven"));
        assert!(last_event_id(&headers).is_err());
    }
}
