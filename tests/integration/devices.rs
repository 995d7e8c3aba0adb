use anyhow::Result;
use reqwest::StatusCode;
use serde_json::{json, Value};

use tether_agent::Incoming;
use tether_core::{act, Packet};

use crate::*;

fn sessions_for(list: &Value, device_id: &str) -> Vec<String> {
    list["data"]
        .as_object()
        .map(|data| {
            data.iter()
                .filter(|(_, d)| d["id"] == device_id)
                .map(|(s, _)| s.clone())
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn test_report_appears_in_list() -> Result<()> {
    let server = TestServer::start().await?;
    let _agent = server.agent("abc123").await?;

    let (status, list) = server.post("/api/device/list", json!({})).await?;
    assert_eq!(status, StatusCode::OK);
    let sessions = sessions_for(&list, "abc123");
    assert_eq!(sessions.len(), 1);

    let record = &list["data"][&sessions[0]];
    assert_eq!(record["wan"], "127.0.0.1");
    assert_eq!(record["hostname"], "host-abc123");
    Ok(())
}

#[tokio::test]
async fn test_reconnect_evicts_previous_session() -> Result<()> {
    let server = TestServer::start().await?;
    let mut first = server.agent("abc123").await?;
    let (_, before) = server.post("/api/device/list", json!({})).await?;
    let old = sessions_for(&before, "abc123");

    let _second = server.agent("abc123").await?;

    match first.next().await? {
        Incoming::Packet(p) => assert_eq!(p.act, act::OFFLINE),
        other => panic!("expected OFFLINE, got {other:?}"),
    }
    assert!(matches!(first.next().await?, Incoming::Closed(Some((1000, _)))));

    let (_, after) = server.post("/api/device/list", json!({})).await?;
    let new = sessions_for(&after, "abc123");
    assert_eq!(new.len(), 1);
    assert_ne!(new, old);

    let hub = server.state.hub.clone();
    assert!(eventually(|| hub.len() == 1).await);
    Ok(())
}

#[tokio::test]
async fn test_disconnect_drops_device() -> Result<()> {
    let server = TestServer::start().await?;
    let agent = server.agent("abc123").await?;
    assert_eq!(server.state.devices.len(), 1);

    agent.close().await?;
    let devices = server.state.devices.clone();
    assert!(eventually(|| devices.is_empty()).await);
    assert!(server.state.hub.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_device_update_refreshes_record() -> Result<()> {
    let server = TestServer::start().await?;
    let mut agent = server.agent("abc123").await?;

    let mut update = device("abc123");
    update.uptime = 4242;
    update.ram.used = 512;
    let mut packet = Packet::act(act::DEVICE_UPDATE);
    packet.data = serde_json::to_value(&update)?.as_object().cloned();
    agent.send(&packet).await?;
    assert_eq!(agent.recv().await?.code, 0);

    let (_, list) = server.post("/api/device/list", json!({})).await?;
    let session = &sessions_for(&list, "abc123")[0];
    assert_eq!(list["data"][session]["uptime"], 4242);
    assert_eq!(list["data"][session]["ram"]["used"], 512);
    Ok(())
}

#[tokio::test]
async fn test_two_devices_are_independent() -> Result<()> {
    let server = TestServer::start().await?;
    let _a = server.agent("dev-a").await?;
    let _b = server.agent("dev-b").await?;

    let (_, list) = server.post("/api/device/list", json!({})).await?;
    assert_eq!(sessions_for(&list, "dev-a").len(), 1);
    assert_eq!(sessions_for(&list, "dev-b").len(), 1);
    assert_eq!(server.state.hub.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_first_ping_follows_report() -> Result<()> {
    let server = TestServer::start().await?;
    let mut agent = AgentLink::connect(&server.base, SALT).await?;
    agent
        .report(&Device {
            latency: 999,
            ..device("abc123")
        })
        .await?;

    // Reading answers the pending ping.
    let _ = tokio::time::timeout(Duration::from_millis(500), agent.next()).await;

    let devices = server.state.devices.clone();
    assert!(eventually(|| devices.snapshot().iter().any(|(_, d)| d.latency < 999)).await);
    Ok(())
}
