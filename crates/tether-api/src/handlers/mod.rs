//! HTTP handlers — agent channel, bridge endpoints and the operator API.

pub mod bridge;
pub mod channel;
pub mod devices;

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::oneshot;

use tether_core::config::TetherConfig;
use tether_core::{new_token, Packet, StandardCodec};
use tether_services::{
    BridgeError, BridgeTable, DeviceRegistry, EventTable, Hub, InboundDispatcher, Session,
};

#[derive(Clone)]
pub struct ApiState {
    pub hub: Hub,
    pub devices: DeviceRegistry,
    pub events: EventTable,
    pub bridges: BridgeTable,
    pub dispatcher: Arc<InboundDispatcher>,
    /// Codec keyed by the padded site salt; verifies handshakes.
    pub salt: Arc<StandardCodec>,
    /// How long an operator request waits for the device's reply.
    pub event_timeout: Duration,
    /// Largest body accepted on the fallback transport.
    pub fallback_body_limit: usize,
}

impl ApiState {
    /// Build fresh tables for `config` and wire the hub's disconnect hook
    /// to the device registry. Must be called inside a runtime.
    pub fn new(salt: StandardCodec, config: &TetherConfig) -> Self {
        let hub = Hub::new();
        let devices = DeviceRegistry::new();
        let events = EventTable::new();
        let dispatcher = Arc::new(
            InboundDispatcher::new(
                devices.clone(),
                events.clone(),
                config.server.decode_failure_budget,
            )
            .with_report_ping(config.timeouts.event()),
        );

        let on_leave = dispatcher.clone();
        hub.on_disconnect(Box::new(move |session: &Arc<Session>| {
            on_leave.disconnect(session)
        }));

        Self {
            hub,
            devices,
            events,
            bridges: BridgeTable::new(),
            dispatcher,
            salt: Arc::new(salt),
            event_timeout: config.timeouts.event(),
            fallback_body_limit: config.server.fallback_body_limit,
        }
    }

    /// Resolve a session id or device id to its live session.
    pub fn target(&self, key: &str) -> Result<Arc<Session>, CallError> {
        if key.is_empty() {
            return Err(CallError::Offline);
        }
        self.devices
            .resolve(key)
            .and_then(|id| self.hub.get(&id))
            .ok_or(CallError::Offline)
    }

    /// Send `packet` to the device behind `key` and wait for its reply.
    pub async fn call(&self, key: &str, packet: Packet) -> Result<Packet, CallError> {
        let session = self.target(key)?;
        self.call_session(&session, packet).await
    }

    pub async fn call_session(
        &self,
        session: &Arc<Session>,
        packet: Packet,
    ) -> Result<Packet, CallError> {
        let token = new_token();
        let (tx, mut rx) = oneshot::channel();
        let waiter = self.events.register_once(
            Box::new(move |reply, _| {
                let _ = tx.send(reply);
            }),
            session.id(),
            &token,
        );
        if !session.send_packet(&packet.with_event(token)) {
            return Err(CallError::Offline);
        }
        if !waiter.wait(self.event_timeout).await {
            return Err(CallError::Timeout(self.event_timeout));
        }
        let reply = rx.try_recv().map_err(|_| CallError::Offline)?;
        if reply.code != 0 {
            return Err(CallError::Remote {
                code: reply.code,
                msg: reply.msg,
            });
        }
        Ok(reply)
    }
}

// ── Request helpers ───────────────────────────────────────────────────────────

/// Selects a device by session uuid or device id.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TargetRequest {
    pub uuid: String,
    pub device: String,
}

impl TargetRequest {
    pub fn key(&self) -> &str {
        if self.uuid.is_empty() {
            &self.device
        } else {
            &self.uuid
        }
    }
}

/// Parse a JSON body. An empty body yields the default.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::invalid(e.to_string()))
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Failure of an operator-to-device round trip.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("device not found")]
    Offline,

    #[error("device did not reply within {0:?}")]
    Timeout(Duration),

    #[error("{msg}")]
    Remote { code: i32, msg: String },
}

/// Status code plus `Packet` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: Packet,
}

impl ApiError {
    pub fn new(status: StatusCode, code: i32, msg: impl Into<String>) -> Self {
        Self {
            status,
            body: Packet::error(code, msg),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, -1, msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, -1, msg)
    }

    pub fn device_not_found() -> Self {
        Self::new(StatusCode::BAD_GATEWAY, 1, "device not found")
    }

    pub fn timeout() -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, 1, "device did not reply in time")
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, 1, msg)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<CallError> for ApiError {
    fn from(e: CallError) -> Self {
        match e {
            CallError::Offline => Self::device_not_found(),
            CallError::Timeout(_) => Self::timeout(),
            CallError::Remote { msg, .. } => Self::internal(msg),
        }
    }
}

impl From<BridgeError> for ApiError {
    fn from(e: BridgeError) -> Self {
        let status = match e {
            BridgeError::NotFound => StatusCode::NOT_FOUND,
            BridgeError::Conflict => StatusCode::CONFLICT,
            BridgeError::Gone => StatusCode::GONE,
            _ => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, 1, e.to_string())
    }
}

// Re-export handler functions for use in router setup.
pub use bridge::{handle_bridge_pull, handle_bridge_push};
pub use channel::{handle_channel, handle_fallback};
pub use devices::{
    handle_device_list, handle_exec, handle_file_upload, handle_power, handle_screenshot,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_prefers_uuid() {
        let t = TargetRequest {
            uuid: "s1".into(),
            device: "d1".into(),
        };
        assert_eq!(t.key(), "s1");
        let t = TargetRequest {
            device: "d1".into(),
            ..TargetRequest::default()
        };
        assert_eq!(t.key(), "d1");
    }

    #[test]
    fn empty_body_parses_to_default() {
        let t: TargetRequest = parse_body(&Bytes::new()).unwrap();
        assert_eq!(t.key(), "");
        assert!(parse_body::<TargetRequest>(&Bytes::from_static(b"{nope")).is_err());
    }

    #[test]
    fn bridge_errors_map_to_statuses() {
        assert_eq!(ApiError::from(BridgeError::NotFound).status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::from(BridgeError::Conflict).status(), StatusCode::CONFLICT);
        assert_eq!(ApiError::from(BridgeError::Gone).status(), StatusCode::GONE);
        assert_eq!(ApiError::from(BridgeError::PullClosed).status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn call_errors_map_to_statuses() {
        assert_eq!(ApiError::from(CallError::Offline).status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            ApiError::from(CallError::Timeout(Duration::from_secs(5))).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        let e = ApiError::from(CallError::Remote {
            code: 3,
            msg: "denied".into(),
        });
        assert_eq!(e.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(e.body.msg, "denied");
    }
}
