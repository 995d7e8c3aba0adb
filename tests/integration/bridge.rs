use anyhow::Result;
use reqwest::StatusCode;
use serde_json::json;

use tether_core::{act, Packet};
use tether_services::{BridgeHooks, BridgePhase};

use crate::*;

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[tokio::test]
async fn test_push_then_pull_relays_bytes() -> Result<()> {
    let server = TestServer::start().await?;
    let token = server.state.bridges.create(json!({}), BridgeHooks::default());
    let data = payload(300 * 1024);

    let push = {
        let req = server
            .http()
            .put(server.url(&format!("/api/bridge/push?bridge={token}")))
            .body(data.clone());
        tokio::spawn(async move { req.send().await })
    };
    let bridges = server.state.bridges.clone();
    let t = token.clone();
    assert!(eventually(|| bridges.phase(&t) == Some(BridgePhase::ClaimedByPush)).await);

    let pulled = server
        .http()
        .get(server.url(&format!("/api/bridge/pull?bridge={token}")))
        .send()
        .await?;
    assert_eq!(pulled.status(), StatusCode::OK);
    assert_eq!(pulled.bytes().await?.as_ref(), data.as_slice());

    assert_eq!(push.await??.status(), StatusCode::OK);
    assert!(!server.state.bridges.contains(&token));
    Ok(())
}

#[tokio::test]
async fn test_pull_then_push_relays_bytes() -> Result<()> {
    let server = TestServer::start().await?;
    let token = server.state.bridges.create(json!({}), BridgeHooks::default());
    let data = payload(70 * 1024 + 17);

    let pull = {
        let req = server
            .http()
            .post(server.url(&format!("/api/bridge/pull?bridge={token}")));
        tokio::spawn(async move {
            let resp = req.send().await?;
            anyhow::Ok(resp.bytes().await?)
        })
    };
    let bridges = server.state.bridges.clone();
    let t = token.clone();
    assert!(eventually(|| bridges.phase(&t) == Some(BridgePhase::ClaimedByPull)).await);

    let pushed = server
        .http()
        .post(server.url(&format!("/api/bridge/push?bridge={token}")))
        .body(data.clone())
        .send()
        .await?;
    assert_eq!(pushed.status(), StatusCode::OK);
    let body: Packet = pushed.json().await?;
    assert_eq!(body.data.unwrap()["bytes"], data.len());

    assert_eq!(pull.await??.as_ref(), data.as_slice());
    Ok(())
}

#[tokio::test]
async fn test_second_claim_conflicts() -> Result<()> {
    let server = TestServer::start().await?;
    let token = server.state.bridges.create(json!({}), BridgeHooks::default());

    let first = {
        let req = server
            .http()
            .get(server.url(&format!("/api/bridge/pull?bridge={token}")));
        tokio::spawn(async move { req.send().await })
    };
    let bridges = server.state.bridges.clone();
    let t = token.clone();
    assert!(eventually(|| bridges.phase(&t) == Some(BridgePhase::ClaimedByPull)).await);

    let second = server
        .http()
        .get(server.url(&format!("/api/bridge/pull?bridge={token}")))
        .send()
        .await?;
    assert_eq!(second.status(), StatusCode::CONFLICT);

    // Dropping the bridge releases the waiting pull with 410.
    server.state.bridges.remove(&token);
    assert_eq!(first.await??.status(), StatusCode::GONE);
    Ok(())
}

#[tokio::test]
async fn test_unknown_bridge_is_404() -> Result<()> {
    let server = TestServer::start().await?;
    let resp = server
        .http()
        .get(server.url("/api/bridge/pull?bridge=deadbeef"))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let resp = server
        .http()
        .put(server.url("/api/bridge/push?bridge=deadbeef"))
        .body("x")
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn test_screenshot_streams_png() -> Result<()> {
    let server = TestServer::start().await?;
    let mut agent = server.agent("abc123").await?;
    let image = payload(96 * 1024);

    let expected = image.clone();
    let device_side = tokio::spawn(async move {
        let req = agent.recv().await?;
        assert_eq!(req.act, act::SCREENSHOT);
        let bridge = req.data_str("bridge").unwrap_or_default().to_string();
        agent.bridge_push(&bridge, expected).await?;
        anyhow::Ok(())
    });

    let resp = server
        .http()
        .post(server.url("/api/device/screenshot/get"))
        .json(&json!({ "device": "abc123" }))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "image/png");
    assert_eq!(resp.bytes().await?.as_ref(), image.as_slice());
    device_side.await??;
    assert!(server.state.bridges.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_screenshot_error_reply_is_500() -> Result<()> {
    let server = TestServer::start().await?;
    let mut agent = server.agent("abc123").await?;

    tokio::spawn(async move {
        if let Ok(req) = agent.recv().await {
            let _ = agent.reply(&req, Packet::error(1, "no display")).await;
        }
    });

    let (status, body) = server
        .post("/api/device/screenshot/get", json!({ "device": "abc123" }))
        .await?;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["msg"], "no display");
    assert!(server.state.bridges.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_screenshot_without_push_is_504() -> Result<()> {
    let server = TestServer::with_event_timeout(std::time::Duration::from_millis(150)).await?;
    let _agent = server.agent("abc123").await?;

    let (status, _) = server
        .post("/api/device/screenshot/get", json!({ "device": "abc123" }))
        .await?;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert!(server.state.bridges.is_empty());
    assert!(server.state.events.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_file_upload_reaches_device() -> Result<()> {
    let server = TestServer::start().await?;
    let mut agent = server.agent("abc123").await?;
    let contents = payload(40 * 1024);

    let device_side = tokio::spawn(async move {
        let req = agent.recv().await?;
        assert_eq!(req.act, act::FILE_UPLOAD);
        assert_eq!(req.data_str("file"), Some("/tmp/notes.txt"));
        let bridge = req.data_str("bridge").unwrap_or_default().to_string();
        let bytes = agent.bridge_pull(&bridge).await?;
        agent.reply(&req, Packet::ok()).await?;
        anyhow::Ok(bytes)
    });

    let resp = server
        .http()
        .post(server.url("/api/device/file/upload?device=abc123&file=/tmp/notes.txt"))
        .body(contents.clone())
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Packet = resp.json().await?;
    assert_eq!(body.data.unwrap()["bytes"], contents.len());
    assert_eq!(device_side.await??.as_ref(), contents.as_slice());
    Ok(())
}
