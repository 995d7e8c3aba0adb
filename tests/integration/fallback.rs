use anyhow::Result;
use reqwest::StatusCode;
use serde_json::json;

use tether_core::codec::{random_bytes, FrameCodec};
use tether_core::{Packet, Transport};

use crate::*;

#[tokio::test]
async fn test_large_reply_travels_over_fallback() -> Result<()> {
    let server = TestServer::start().await?;
    let mut agent = server.agent("abc123").await?;
    let output = "x".repeat(4096);

    let expected = output.clone();
    let device_side = tokio::spawn(async move {
        let req = agent.recv().await?;
        let transport = agent
            .reply(&req, Packet::ok().with_data("output", expected))
            .await?;
        anyhow::Ok(transport)
    });

    let (status, body) = server
        .post("/api/device/exec", json!({ "device": "abc123", "cmd": "cat" }))
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["output"], output.as_str());
    assert_eq!(device_side.await??, Transport::Fallback);
    Ok(())
}

#[tokio::test]
async fn test_small_reply_stays_on_channel() -> Result<()> {
    let server = TestServer::start().await?;
    let mut agent = server.agent("abc123").await?;

    let device_side = tokio::spawn(async move {
        let req = agent.recv().await?;
        anyhow::Ok(agent.reply(&req, Packet::ok()).await?)
    });

    let (status, _) = server
        .post("/api/device/exec", json!({ "device": "abc123", "cmd": "true" }))
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(device_side.await??, Transport::Channel);
    Ok(())
}

#[tokio::test]
async fn test_unknown_secret_is_401() -> Result<()> {
    let server = TestServer::start().await?;
    let _agent = server.agent("abc123").await?;

    let resp = server
        .http()
        .post(server.url("/ws"))
        .header("secret", hex::encode(random_bytes::<32>()))
        .body(vec![0u8; 128])
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = server
        .http()
        .post(server.url("/ws"))
        .body(vec![0u8; 128])
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn test_oversize_body_is_413() -> Result<()> {
    let server = TestServer::start().await?;
    let agent = server.agent("abc123").await?;

    let resp = server
        .http()
        .post(server.url("/ws"))
        .header("secret", agent.secret_hex())
        .body(vec![0u8; 600 * 1024])
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    Ok(())
}

#[tokio::test]
async fn test_undecodable_body_is_400() -> Result<()> {
    let server = TestServer::start().await?;
    let agent = server.agent("abc123").await?;

    let resp = server
        .http()
        .post(server.url("/ws"))
        .header("secret", agent.secret_hex())
        .body(vec![0x42u8; 2048])
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // A well-formed frame under the same secret is accepted.
    let frame = agent.codec().encode(&Packet::ok().to_json()?);
    let resp = server
        .http()
        .post(server.url("/ws"))
        .header("secret", agent.secret_hex())
        .body(frame)
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Packet = resp.json().await?;
    assert_eq!(body.code, 0);
    Ok(())
}
