//! Live progress over server-sent events.
//!
//! `GET /api/v1/jobs/:id/stream?token=JWT`
//!
//! EventSource cannot set headers, so the token may be passed as a query parameter. The
//! `Authorization` header is used when it is absent.
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
};
use docpipe::progress::ProgressStream;
use futures::{Stream, StreamExt};
use serde::Deserialize;

use super::{job_not_found, parse_job_id};
use crate::{auth::bearer_token, error::ApiError, state::AppState};

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    token: Option<String>,
}

pub async fn stream_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let token = query
        .token
        .as_deref()
        .or_else(|| bearer_token(&headers))
        .ok_or_else(|| ApiError::Unauthorized("Missing token".to_owned()))?;
    let user = state.jwt.verify(token)?;
    let job_id = parse_job_id(&id)?;
    let scope = user.scope();
    state
        .store
        .find(job_id, &scope)
        .await?
        .ok_or_else(job_not_found)?;

    tracing::debug!(%job_id, user = %user.id, "Progress stream opened");
    let events = ProgressStream::new(state.store.clone(), job_id, scope)
        .with_interval(state.stream_interval)
        .into_stream()
        .map(|event| Event::default().event(event.name()).json_data(event.data()));

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
