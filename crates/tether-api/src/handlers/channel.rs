//! /ws — the agent channel.
//!
//! GET upgrades to the persistent WebSocket after the `UUID`/`Key`
//! handshake. POST is the fallback transport for frames too large for the
//! channel: same encoding, matched to its session by the `Secret` header.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::Response;
use axum::Json;
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use tether_core::codec::{new_secret, parse_secret, verify_handshake};
use tether_core::wire::RawFrame;
use tether_core::{HandshakeError, Packet};
use tether_services::{decode_packet, Outbound, Session, Verdict};

use super::{ApiError, ApiState};

/// Per-frame deadline for writes to an agent.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

fn header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, HandshakeError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or(HandshakeError::Missing(name))
}

// ── GET /ws ───────────────────────────────────────────────────────────────────

pub async fn handle_channel(
    State(state): State<ApiState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let verified = header(&headers, "UUID").and_then(|uuid| {
        let key = header(&headers, "Key")?;
        verify_handshake(&state.salt, uuid, key)
    });
    let agent = match verified {
        Ok(uuid) => hex::encode(uuid),
        Err(e) => {
            tracing::warn!(remote = %remote, error = %e, "handshake rejected");
            return Err(ApiError::unauthorized(e.to_string()));
        }
    };

    let secret = new_secret();
    let secret_hex = HeaderValue::from_str(&hex::encode(secret))
        .map_err(|e| ApiError::internal(e.to_string()))?;
    let (session, outbound) = Session::new(remote.ip().to_string(), secret);
    tracing::info!(session = %session.id(), agent = %agent, remote = %remote, "handshake accepted");

    let mut resp = ws.on_upgrade(move |socket| run_channel(state, socket, session, outbound));
    resp.headers_mut().insert("Secret", secret_hex);
    Ok(resp)
}

async fn run_channel(
    state: ApiState,
    socket: WebSocket,
    session: Arc<Session>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(write_loop(sink, outbound));
    let mut writer_done = false;

    if !state.hub.register(session.clone()).await {
        tracing::info!(session = %session.id(), "hub closed, connection refused");
        let _ = tokio::time::timeout(WRITE_TIMEOUT, writer).await;
        return;
    }

    let mut failures = 0u32;
    loop {
        let next = tokio::select! {
            next = stream.next() => next,
            _ = &mut writer, if !writer_done => {
                writer_done = true;
                break;
            }
        };
        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                tracing::debug!(session = %session.id(), error = %e, "read error");
                break;
            }
            None => break,
        };
        match msg {
            Message::Binary(frame) => {
                if state.dispatcher.handle_frame(&session, &frame, &mut failures) == Verdict::Close {
                    break;
                }
            }
            Message::Text(_) => {
                tracing::warn!(session = %session.id(), "text frame on binary channel");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => session.touch(),
            Message::Close(_) => break,
        }
    }

    if state.hub.unregister(&session).await {
        tracing::info!(session = %session.id(), "agent disconnected");
    }
    // Unregister queued the close frame; let the writer flush it.
    if !writer_done {
        let _ = tokio::time::timeout(WRITE_TIMEOUT, writer).await;
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(out) = outbound.recv().await {
        let (msg, last) = match out {
            Outbound::Binary(frame) => (Message::Binary(frame), false),
            Outbound::Close { code, reason } => (
                Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })),
                true,
            ),
        };
        match tokio::time::timeout(WRITE_TIMEOUT, sink.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "write failed");
                return;
            }
            Err(_) => {
                tracing::warn!("write timed out");
                return;
            }
        }
        if last {
            return;
        }
    }
    let _ = sink.close().await;
}

// ── POST /ws ──────────────────────────────────────────────────────────────────

pub async fn handle_fallback(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Packet>, ApiError> {
    let secret = header(&headers, "Secret")
        .and_then(parse_secret)
        .map_err(|e| ApiError::unauthorized(e.to_string()))?;
    let session = state
        .hub
        .find(|s| s.secret() == &secret)
        .ok_or_else(|| ApiError::unauthorized("unknown session"))?;

    let verdict = match RawFrame::parse(&body) {
        Some(raw) => state.dispatcher.handle_raw(&session, raw),
        None => {
            let packet = decode_packet(&session, &body).map_err(|e| {
                tracing::warn!(session = %session.id(), error = %e, "undecodable fallback frame");
                ApiError::invalid(e.to_string())
            })?;
            state.dispatcher.handle_packet(&session, packet)
        }
    };
    match verdict {
        Verdict::Continue => Ok(Json(Packet::ok())),
        Verdict::Close => Err(ApiError::unauthorized("session closed")),
    }
}
