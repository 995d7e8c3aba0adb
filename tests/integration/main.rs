//! Tether integration test harness.
//!
//! Every test starts its own control plane on an ephemeral loopback port
//! and drives it with real agents (`tether-agent`) and plain HTTP
//! operator requests. Nothing is shared between tests.

mod bridge;
mod commands;
mod devices;
mod fallback;
mod handshake;

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use tether_agent::AgentLink;
use tether_api::ApiState;
use tether_core::codec::salt_codec;
use tether_core::config::TetherConfig;
use tether_core::Device;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const SALT: &str = "integration-salt";

pub struct TestServer {
    pub base: String,
    pub state: ApiState,
    http: reqwest::Client,
    _shutdown: oneshot::Sender<()>,
}

impl TestServer {
    pub async fn start() -> Result<Self> {
        Self::with_event_timeout(Duration::from_secs(2)).await
    }

    /// Start a server whose operator requests give up after `timeout`.
    pub async fn with_event_timeout(timeout: Duration) -> Result<Self> {
        let mut config = TetherConfig::default();
        config.server.salt = SALT.to_string();
        config.timeouts.event_ms = timeout.as_millis() as u64;

        let state = ApiState::new(salt_codec(SALT)?, &config);
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let base = format!("http://{}", listener.local_addr()?);

        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(tether_api::serve(state.clone(), listener, async move {
            let _ = rx.await;
        }));

        Ok(Self {
            base,
            state,
            http: reqwest::Client::new(),
            _shutdown: tx,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// POST a JSON body and return the status and the JSON response.
    pub async fn post(&self, path: &str, body: Value) -> Result<(StatusCode, Value)> {
        let resp = self
            .http
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {path}"))?;
        let status = resp.status();
        let value = resp.json().await.unwrap_or(Value::Null);
        Ok((status, value))
    }

    /// Connect an agent and report `device_id`.
    pub async fn agent(&self, device_id: &str) -> Result<AgentLink> {
        let mut agent = AgentLink::connect(&self.base, SALT).await?;
        agent.report(&device(device_id)).await?;
        Ok(agent)
    }
}

pub fn device(id: &str) -> Device {
    Device {
        id: id.to_string(),
        os: "linux".into(),
        arch: "amd64".into(),
        hostname: format!("host-{id}"),
        username: "operator".into(),
        ..Device::default()
    }
}

/// Poll `check` for up to two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_server_starts_empty() -> Result<()> {
    let server = TestServer::start().await?;
    let (status, body) = server.post("/api/device/list", Value::Null).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], 0);
    assert!(body["data"].as_object().map_or(true, |d| d.is_empty()));
    assert!(server.state.hub.is_empty());
    Ok(())
}
