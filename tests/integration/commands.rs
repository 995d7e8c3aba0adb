use std::time::Duration;

use anyhow::Result;
use reqwest::StatusCode;
use serde_json::json;

use tether_core::{act, Packet};

use crate::*;

#[tokio::test]
async fn test_exec_round_trip() -> Result<()> {
    let server = TestServer::start().await?;
    let mut agent = server.agent("abc123").await?;

    let device_side = tokio::spawn(async move {
        let req = agent.recv().await?;
        assert_eq!(req.act, act::COMMAND_EXEC);
        assert_eq!(req.data_str("cmd"), Some("uname"));
        assert!(!req.event.is_empty());
        agent
            .reply(&req, Packet::ok().with_data("output", "Linux"))
            .await?;
        anyhow::Ok(agent)
    });

    let (status, body) = server
        .post("/api/device/exec", json!({ "device": "abc123", "cmd": "uname", "args": ["-s"] }))
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], 0);
    assert_eq!(body["data"]["output"], "Linux");
    device_side.await??;
    assert!(server.state.events.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_exec_by_session_uuid() -> Result<()> {
    let server = TestServer::start().await?;
    let mut agent = server.agent("abc123").await?;
    let session = server.state.devices.resolve("abc123").unwrap();

    tokio::spawn(async move {
        if let Ok(req) = agent.recv().await {
            let _ = agent.reply(&req, Packet::ok()).await;
        }
    });

    let (status, _) = server
        .post("/api/device/exec", json!({ "uuid": session, "cmd": "true" }))
        .await?;
    assert_eq!(status, StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn test_exec_timeout_is_504() -> Result<()> {
    let server = TestServer::with_event_timeout(Duration::from_millis(200)).await?;
    let _agent = server.agent("abc123").await?;

    let (status, body) = server
        .post("/api/device/exec", json!({ "device": "abc123", "cmd": "sleep" }))
        .await?;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_ne!(body["code"], 0);
    assert!(server.state.events.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_power_action_timeout_counts_as_success() -> Result<()> {
    let server = TestServer::with_event_timeout(Duration::from_millis(200)).await?;
    let mut agent = server.agent("abc123").await?;

    let (status, body) = server
        .post("/api/device/shutdown", json!({ "device": "abc123" }))
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], 0);

    // The request did reach the device.
    assert_eq!(agent.recv().await?.act, "SHUTDOWN");
    Ok(())
}

#[tokio::test]
async fn test_power_action_remote_error_is_500() -> Result<()> {
    let server = TestServer::start().await?;
    let mut agent = server.agent("abc123").await?;

    tokio::spawn(async move {
        if let Ok(req) = agent.recv().await {
            let _ = agent.reply(&req, Packet::error(2, "access denied")).await;
        }
    });

    let (status, body) = server
        .post("/api/device/lock", json!({ "device": "abc123" }))
        .await?;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["msg"], "access denied");
    Ok(())
}

#[tokio::test]
async fn test_unknown_device_is_502() -> Result<()> {
    let server = TestServer::start().await?;
    let (status, body) = server
        .post("/api/device/exec", json!({ "device": "nope", "cmd": "ls" }))
        .await?;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["code"], 1);

    let (status, _) = server.post("/api/device/restart", json!({})).await?;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    Ok(())
}

#[tokio::test]
async fn test_bad_input_is_400() -> Result<()> {
    let server = TestServer::start().await?;
    let _agent = server.agent("abc123").await?;

    let (status, body) = server
        .post("/api/device/reboot-now", json!({ "device": "abc123" }))
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], -1);

    let (status, _) = server
        .post("/api/device/exec", json!({ "device": "abc123" }))
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn test_late_reply_is_ignored() -> Result<()> {
    let server = TestServer::with_event_timeout(Duration::from_millis(100)).await?;
    let mut agent = server.agent("abc123").await?;

    let (status, _) = server
        .post("/api/device/exec", json!({ "device": "abc123", "cmd": "slow" }))
        .await?;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);

    // Reply after the operator gave up: no-op, the channel stays open.
    let req = agent.recv().await?;
    agent.reply(&req, Packet::ok()).await?;
    agent.report(&device("abc123")).await?;
    Ok(())
}
