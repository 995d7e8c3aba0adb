//! /api/device/* — operator commands relayed to one device.

use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use axum::Json;
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::oneshot;
use tokio_stream::wrappers::ReceiverStream;

use tether_core::{act, new_token, Packet, PowerAct};
use tether_services::{BridgeHooks, BridgePhase, EventWaiter, PullHead, RelayOutcome, Session};

use super::{parse_body, ApiError, ApiState, CallError, TargetRequest};

// ── /device/list ──────────────────────────────────────────────────────────────

pub async fn handle_device_list(State(state): State<ApiState>) -> Result<Json<Packet>, ApiError> {
    let mut packet = Packet::ok();
    let data = packet.data.get_or_insert_with(Default::default);
    for (session, device) in state.devices.snapshot() {
        let value = serde_json::to_value(&device).map_err(|e| ApiError::internal(e.to_string()))?;
        data.insert(session, value);
    }
    Ok(Json(packet))
}

// ── /device/{act} ─────────────────────────────────────────────────────────────

pub async fn handle_power(
    State(state): State<ApiState>,
    Path(act): Path<String>,
    body: Bytes,
) -> Result<Json<Packet>, ApiError> {
    let power = PowerAct::parse(&act).ok_or_else(|| ApiError::invalid(format!("unknown act {act}")))?;
    let req: TargetRequest = parse_body(&body)?;

    match state.call(req.key(), Packet::act(power.as_str())).await {
        Ok(_) => Ok(Json(Packet::ok())),
        // An unreachable device is the end state these actions aim for.
        Err(CallError::Timeout(_)) => {
            tracing::info!(device = %req.key(), act = power.as_str(), "no reply to power action, assuming done");
            Ok(Json(Packet::ok()))
        }
        Err(e) => Err(e.into()),
    }
}

// ── /device/exec ──────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ExecRequest {
    pub uuid: String,
    pub device: String,
    pub cmd: String,
    pub args: Vec<String>,
}

pub async fn handle_exec(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<Json<Packet>, ApiError> {
    let req: ExecRequest = parse_body(&body)?;
    if req.cmd.is_empty() {
        return Err(ApiError::invalid("cmd is required"));
    }
    let key = if req.uuid.is_empty() { &req.device } else { &req.uuid };
    let packet = Packet::act(act::COMMAND_EXEC)
        .with_data("cmd", req.cmd.clone())
        .with_data("args", req.args.clone());

    let mut reply = state.call(key, packet).await?;
    reply.event.clear();
    Ok(Json(reply))
}

// ── /device/screenshot/get ────────────────────────────────────────────────────

/// Mint a bridge, ask the device to push a screenshot into it, and stream
/// the image back as this request's response body.
pub async fn handle_screenshot(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let req: TargetRequest = parse_body(&body)?;
    let session = state.target(req.key())?;

    let hooks = BridgeHooks {
        on_push: Some(Box::new(|head: &mut PullHead| {
            head.set("Content-Type", "image/png");
        })),
        ..BridgeHooks::default()
    };
    let bridge = state
        .bridges
        .create(json!({ "session": session.id(), "kind": "screenshot" }), hooks);
    let pull = state.bridges.bind_pull(&bridge)?;

    let (waiter, mut reply) = request(&state, &session, act::SCREENSHOT, &bridge, None);
    let ready = pull.ready();
    tokio::pin!(ready);

    let replied = tokio::select! {
        head = &mut ready => return stream_response(head?),
        fired = waiter.wait(state.event_timeout) => fired,
    };
    if let Some(err) = remote_error(replied, &mut reply) {
        state.bridges.remove(&bridge);
        return Err(err);
    }
    // The device acknowledged without pushing yet: give it one more window.
    match tokio::time::timeout(state.event_timeout, ready).await {
        Ok(head) => stream_response(head?),
        Err(_) => {
            state.bridges.remove(&bridge);
            tracing::warn!(session = %session.id(), "screenshot timed out");
            Err(ApiError::timeout())
        }
    }
}

// ── /device/file/upload ───────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct UploadQuery {
    pub uuid: String,
    pub device: String,
    pub file: String,
}

/// Stream this request's body to the device, which pulls it through a bridge
/// and writes it to `file`.
pub async fn handle_file_upload(
    State(state): State<ApiState>,
    Query(query): Query<UploadQuery>,
    body: Body,
) -> Result<Json<Packet>, ApiError> {
    if query.file.is_empty() {
        return Err(ApiError::invalid("file is required"));
    }
    let key = if query.uuid.is_empty() { &query.device } else { &query.uuid };
    let session = state.target(key)?;

    let bridge = state.bridges.create(
        json!({ "session": session.id(), "kind": "upload", "file": query.file }),
        BridgeHooks::default(),
    );
    let (waiter, mut reply) = request(
        &state,
        &session,
        act::FILE_UPLOAD,
        &bridge,
        Some(query.file.as_str()),
    );

    let push_body = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other))
        .boxed();
    let relay = state.bridges.bind_push(&bridge, push_body);
    tokio::pin!(relay);

    let replied = tokio::select! {
        outcome = &mut relay => return relay_result(outcome?),
        fired = waiter.wait(state.event_timeout) => fired,
    };
    if let Some(err) = remote_error(replied, &mut reply) {
        state.bridges.remove(&bridge);
        return Err(err);
    }
    if !replied && state.bridges.phase(&bridge) == Some(BridgePhase::ClaimedByPush) {
        state.bridges.remove(&bridge);
        tracing::warn!(session = %session.id(), file = %query.file, "upload never pulled");
        return Err(ApiError::timeout());
    }
    relay_result(relay.await?)
}

pub(super) fn relay_result(outcome: RelayOutcome) -> Result<Json<Packet>, ApiError> {
    match outcome.result {
        Ok(()) => Ok(Json(Packet::ok().with_data("bytes", outcome.bytes))),
        Err(e) => Err(e.into()),
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Register for the device's reply and send `act` carrying the bridge token.
fn request(
    state: &ApiState,
    session: &Arc<Session>,
    act: &str,
    bridge: &str,
    file: Option<&str>,
) -> (EventWaiter, oneshot::Receiver<Packet>) {
    let token = new_token();
    let (tx, rx) = oneshot::channel();
    let waiter = state.events.register_once(
        Box::new(move |reply, _| {
            let _ = tx.send(reply);
        }),
        session.id(),
        &token,
    );
    let mut packet = Packet::act(act).with_event(token).with_data("bridge", bridge);
    if let Some(file) = file {
        packet = packet.with_data("file", file);
    }
    session.send_packet(&packet);
    (waiter, rx)
}

/// A reply with a non-zero code aborts the transfer.
fn remote_error(replied: bool, reply: &mut oneshot::Receiver<Packet>) -> Option<ApiError> {
    if !replied {
        return None;
    }
    match reply.try_recv() {
        Ok(p) if p.code != 0 => Some(ApiError::internal(p.msg)),
        _ => None,
    }
}

pub(super) fn stream_response(
    (head, body): (PullHead, tokio::sync::mpsc::Receiver<io::Result<Bytes>>),
) -> Result<Response, ApiError> {
    let mut resp = Response::new(Body::from_stream(ReceiverStream::new(body)));
    *resp.status_mut() = StatusCode::OK;
    for (name, value) in head.headers {
        let name = HeaderName::try_from(name).map_err(|e| ApiError::internal(e.to_string()))?;
        let value = HeaderValue::try_from(value).map_err(|e| ApiError::internal(e.to_string()))?;
        resp.headers_mut().insert(name, value);
    }
    Ok(resp)
}
