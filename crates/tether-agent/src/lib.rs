//! tether-agent — the device side of the control channel.
//!
//! `AgentLink` performs the handshake, reports the device, sends replies
//! over the channel or the HTTP fallback depending on their encoded size,
//! and moves bulk payloads through bridges.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use tether_core::codec::{
    handshake_headers, parse_secret, random_bytes, salt_codec, select_transport, UUID_LEN,
};
use tether_core::{act, Device, FrameCodec, Packet, StandardCodec, Transport};

type Channel = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What arrived on the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Packet(Packet),
    /// The server closed the channel, with its close code and reason.
    Closed(Option<(u16, String)>),
}

pub struct AgentLink {
    http: reqwest::Client,
    base: String,
    uuid: [u8; UUID_LEN],
    secret_hex: String,
    codec: StandardCodec,
    sink: SplitSink<Channel, Message>,
    stream: SplitStream<Channel>,
}

impl AgentLink {
    /// Connect with a fresh random identity.
    pub async fn connect(base: &str, salt: &str) -> Result<Self> {
        Self::connect_as(base, salt, random_bytes()).await
    }

    /// Connect to `base` (`http://host:port`), proving `uuid` under `salt`.
    pub async fn connect_as(base: &str, salt: &str, uuid: [u8; UUID_LEN]) -> Result<Self> {
        let base = base.trim_end_matches('/').to_string();
        let ws_url = match base.strip_prefix("http") {
            Some(rest) => format!("ws{rest}/ws"),
            None => bail!("base url must start with http: {base}"),
        };
        let salt = salt_codec(salt)?;
        let (uuid_hex, key_hex) = handshake_headers(&salt, &uuid);

        let mut request = ws_url
            .into_client_request()
            .context("failed to build channel request")?;
        request.headers_mut().insert("uuid", uuid_hex.parse()?);
        request.headers_mut().insert("key", key_hex.parse()?);

        let (ws, response) = connect_async(request)
            .await
            .context("channel handshake failed")?;
        let secret_hex = response
            .headers()
            .get("secret")
            .and_then(|v| v.to_str().ok())
            .context("server did not return a Secret header")?
            .to_string();
        let secret = parse_secret(&secret_hex)?;
        tracing::debug!(uuid = %hex::encode(uuid), "channel established");

        let (sink, stream) = ws.split();
        Ok(Self {
            http: reqwest::Client::new(),
            base,
            uuid,
            secret_hex,
            codec: StandardCodec::from_secret(&secret),
            sink,
            stream,
        })
    }

    pub fn uuid(&self) -> &[u8; UUID_LEN] {
        &self.uuid
    }

    pub fn secret_hex(&self) -> &str {
        &self.secret_hex
    }

    pub fn codec(&self) -> &StandardCodec {
        &self.codec
    }

    /// Encode and send a packet. Returns the transport that carried it.
    pub async fn send(&mut self, packet: &Packet) -> Result<Transport> {
        let frame = self.codec.encode(&packet.to_json()?);
        self.send_frame(frame).await
    }

    /// Send an already-encoded frame, choosing the transport by its size.
    pub async fn send_frame(&mut self, frame: Vec<u8>) -> Result<Transport> {
        let transport = select_transport(frame.len());
        match transport {
            Transport::Channel => self.send_binary(frame).await?,
            Transport::Fallback => {
                let resp = self
                    .http
                    .post(format!("{}/ws", self.base))
                    .header("secret", &self.secret_hex)
                    .body(frame)
                    .send()
                    .await
                    .context("fallback request failed")?;
                if !resp.status().is_success() {
                    bail!("fallback rejected with {}", resp.status());
                }
            }
        }
        Ok(transport)
    }

    /// Send bytes on the channel as-is, whatever their size.
    pub async fn send_binary(&mut self, frame: Vec<u8>) -> Result<()> {
        self.sink
            .send(Message::Binary(frame.into()))
            .await
            .context("channel write failed")
    }

    /// Answer `request` with `reply`, carrying over its event token.
    pub async fn reply(&mut self, request: &Packet, reply: Packet) -> Result<Transport> {
        self.send(&reply.with_event(request.event.clone())).await
    }

    /// Send `DEVICE_UP` and wait for the server's acknowledgement.
    pub async fn report(&mut self, device: &Device) -> Result<()> {
        let data = serde_json::to_value(device)?;
        let mut packet = Packet::act(act::DEVICE_UP);
        packet.data = data.as_object().cloned();
        self.send(&packet).await?;
        let ack = self.recv().await?;
        if ack.code != 0 {
            bail!("device report rejected: {}", ack.msg);
        }
        Ok(())
    }

    /// Next packet or close from the server. Health-check pings are
    /// answered here and never returned.
    pub async fn next(&mut self) -> Result<Incoming> {
        while let Some(msg) = self.stream.next().await {
            match msg.context("channel read failed")? {
                Message::Binary(frame) => {
                    let json = self.codec.decode(&frame)?;
                    let packet = Packet::from_json(&json)?;
                    if packet.act == act::PING && !packet.event.is_empty() {
                        if let Err(e) = self.reply(&packet, Packet::ok()).await {
                            tracing::debug!(error = %e, "ping reply failed");
                        }
                        continue;
                    }
                    return Ok(Incoming::Packet(packet));
                }
                Message::Close(frame) => {
                    return Ok(Incoming::Closed(
                        frame.map(|f| (u16::from(f.code), f.reason.to_string())),
                    ));
                }
                _ => continue,
            }
        }
        Ok(Incoming::Closed(None))
    }

    /// Next packet. A close is an error.
    pub async fn recv(&mut self) -> Result<Packet> {
        match self.next().await? {
            Incoming::Packet(p) => Ok(p),
            Incoming::Closed(frame) => bail!("channel closed: {frame:?}"),
        }
    }

    pub async fn close(mut self) -> Result<()> {
        self.sink.close().await.context("channel close failed")
    }

    // ── Bridges ──────────────────────────────────────────────────────────────

    /// Push `body` into a bridge. Resolves when the relay has finished.
    pub async fn bridge_push(&self, token: &str, body: impl Into<reqwest::Body>) -> Result<Packet> {
        let resp = self
            .http
            .put(format!("{}/api/bridge/push?bridge={token}", self.base))
            .body(body)
            .send()
            .await
            .context("bridge push failed")?;
        let status = resp.status();
        let packet: Packet = resp.json().await?;
        if !status.is_success() {
            bail!("bridge push rejected with {status}: {}", packet.msg);
        }
        Ok(packet)
    }

    /// Pull a bridge's payload in full.
    pub async fn bridge_pull(&self, token: &str) -> Result<Bytes> {
        let resp = self
            .http
            .get(format!("{}/api/bridge/pull?bridge={token}", self.base))
            .send()
            .await
            .context("bridge pull failed")?;
        if !resp.status().is_success() {
            bail!("bridge pull rejected with {}", resp.status());
        }
        Ok(resp.bytes().await?)
    }
}
