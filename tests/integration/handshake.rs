use anyhow::Result;
use tokio_tungstenite::tungstenite;

use tether_agent::{AgentLink, Incoming};
use tether_core::codec::FrameCodec;
use tether_core::Packet;

use crate::*;

#[tokio::test]
async fn test_handshake_mints_secret_and_registers() -> Result<()> {
    let server = TestServer::start().await?;
    let agent = AgentLink::connect(&server.base, SALT).await?;

    assert_eq!(agent.secret_hex().len(), 64);
    let hub = server.state.hub.clone();
    assert!(eventually(|| hub.len() == 1).await);

    let session = hub.list().pop().unwrap();
    assert_eq!(hex::encode(session.secret()), agent.secret_hex());
    assert_eq!(session.addr(), "127.0.0.1");
    Ok(())
}

#[tokio::test]
async fn test_wrong_salt_is_rejected_with_401() -> Result<()> {
    let server = TestServer::start().await?;
    let err = match AgentLink::connect(&server.base, "some-other-salt").await {
        Ok(_) => panic!("handshake with the wrong salt must fail"),
        Err(e) => e,
    };
    match err.downcast_ref::<tungstenite::Error>() {
        Some(tungstenite::Error::Http(resp)) => assert_eq!(resp.status().as_u16(), 401),
        other => panic!("expected HTTP 401, got {other:?}"),
    }
    assert!(server.state.hub.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_reply_before_report_closes_going_away() -> Result<()> {
    let server = TestServer::start().await?;
    let mut agent = AgentLink::connect(&server.base, SALT).await?;

    agent.send(&Packet::ok().with_event("t1")).await?;
    assert_eq!(
        agent.next().await?,
        Incoming::Closed(Some((1001, "invalid device id".to_string())))
    );
    let hub = server.state.hub.clone();
    assert!(eventually(|| hub.is_empty()).await);
    Ok(())
}

#[tokio::test]
async fn test_undecodable_frames_exhaust_budget() -> Result<()> {
    let server = TestServer::start().await?;
    let mut agent = server.agent("abc123").await?;

    for _ in 0..4 {
        agent.send_binary(vec![0x5a; 200]).await?;
    }
    match agent.next().await? {
        Incoming::Packet(p) => assert_eq!(p.code, -1),
        other => panic!("expected error packet, got {other:?}"),
    }
    assert_eq!(
        agent.next().await?,
        Incoming::Closed(Some((1000, "invalid request".to_string())))
    );
    Ok(())
}

#[tokio::test]
async fn test_tampered_frame_counts_as_failure() -> Result<()> {
    let server = TestServer::start().await?;
    let mut agent = server.agent("abc123").await?;

    let mut frame = agent.codec().encode(&Packet::ok().to_json()?);
    let last = frame.len() - 1;
    frame[last] ^= 0x01;
    agent.send_binary(frame).await?;

    // Still within budget: the channel stays usable.
    agent.report(&device("abc123")).await?;
    Ok(())
}
