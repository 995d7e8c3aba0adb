//! /api/bridge/push, /api/bridge/pull — the two halves of a relay.

use std::io;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::response::Response;
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;

use tether_core::Packet;

use super::devices::{relay_result, stream_response};
use super::{ApiError, ApiState};

#[derive(Debug, Deserialize)]
pub struct BridgeQuery {
    pub bridge: String,
}

/// Push side: the request body is streamed to the pull side. Answers once
/// the relay has finished.
pub async fn handle_bridge_push(
    State(state): State<ApiState>,
    Query(q): Query<BridgeQuery>,
    body: Body,
) -> Result<Json<Packet>, ApiError> {
    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other))
        .boxed();
    relay_result(state.bridges.bind_push(&q.bridge, stream).await?)
}

/// Pull side: the response body is whatever the push side sends.
pub async fn handle_bridge_pull(
    State(state): State<ApiState>,
    Query(q): Query<BridgeQuery>,
) -> Result<Response, ApiError> {
    let handle = state.bridges.bind_pull(&q.bridge)?;
    stream_response(handle.ready().await?)
}
