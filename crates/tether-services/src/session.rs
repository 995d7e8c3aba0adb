//! Session hub — tracks live agent connections.
//!
//! Membership changes and fan-out go through one hub loop fed by an mpsc
//! queue, so register/unregister/broadcast never race each other. The
//! session table itself is a DashMap that anyone may read.
//!
//! Writing to a session only enqueues on that session's outbound queue.
//! One writer task per connection drains it, so a slow peer never stalls
//! the hub and frames from concurrent senders never interleave.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use tether_core::codec::{FrameCodec, StandardCodec, SECRET_LEN};
use tether_core::Packet;

pub type SessionId = String;

/// Close codes sent to agents.
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Seconds since the unix epoch.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ── Session ───────────────────────────────────────────────────────────────────

/// Work for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Binary(Bytes),
    Close { code: u16, reason: String },
}

/// A live agent connection.
pub struct Session {
    id: SessionId,
    secret: [u8; SECRET_LEN],
    codec: StandardCodec,
    /// Remote address as seen by the listener.
    addr: String,
    last_activity: AtomicI64,
    /// Per-session state for protocol extensions.
    store: DashMap<String, Value>,
    closed: AtomicBool,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Session {
    /// Create a session and the receiving end of its outbound queue.
    pub fn new(
        addr: impl Into<String>,
        secret: [u8; SECRET_LEN],
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            secret,
            codec: StandardCodec::from_secret(&secret),
            addr: addr.into(),
            last_activity: AtomicI64::new(unix_now()),
            store: DashMap::new(),
            closed: AtomicBool::new(false),
            tx,
        });
        (session, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn secret(&self) -> &[u8; SECRET_LEN] {
        &self.secret
    }

    pub fn codec(&self) -> &StandardCodec {
        &self.codec
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn touch(&self) {
        self.last_activity.store(unix_now(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> i64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.store.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.store.get(key).map(|v| v.value().clone())
    }

    pub fn unset(&self, key: &str) -> Option<Value> {
        self.store.remove(key).map(|(_, v)| v)
    }

    /// Encode `packet` under this session's secret and queue it.
    /// Returns false if the session is closed.
    pub fn send_packet(&self, packet: &Packet) -> bool {
        match packet.to_json() {
            Ok(json) => self.send_raw(Bytes::from(self.codec.encode(&json))),
            Err(e) => {
                tracing::warn!(session = %self.id, error = %e, "packet serialization failed");
                false
            }
        }
    }

    /// Queue an already-framed binary message.
    pub fn send_raw(&self, frame: Bytes) -> bool {
        if self.is_closed() {
            return false;
        }
        self.tx.send(Outbound::Binary(frame)).is_ok()
    }

    pub fn close(&self) {
        self.close_with(CLOSE_NORMAL, "");
    }

    /// Mark closed and ask the writer to send a close frame. Only the
    /// first call has any effect.
    pub fn close_with(&self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.tx.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ── Hub ───────────────────────────────────────────────────────────────────────

pub type SessionFilter = Box<dyn Fn(&Session) -> bool + Send>;

/// Runs once per session when it leaves the hub, by unregister or shutdown.
pub type DisconnectHook = Box<dyn Fn(&Arc<Session>) + Send>;

enum HubOp {
    Register(Arc<Session>, oneshot::Sender<bool>),
    Unregister(SessionId, oneshot::Sender<bool>),
    Broadcast(Packet, Option<SessionFilter>),
    Multicast(Vec<SessionId>, Packet),
    OnDisconnect(DisconnectHook),
    Shutdown(Packet, oneshot::Sender<()>),
}

/// Handle to the hub. Cheap to clone.
#[derive(Clone)]
pub struct Hub {
    sessions: Arc<DashMap<SessionId, Arc<Session>>>,
    open: Arc<AtomicBool>,
    ops: mpsc::UnboundedSender<HubOp>,
}

impl Hub {
    /// Create a hub and spawn its loop. Must be called inside a runtime.
    pub fn new() -> Self {
        let sessions = Arc::new(DashMap::new());
        let open = Arc::new(AtomicBool::new(true));
        let (ops, rx) = mpsc::unbounded_channel();
        tokio::spawn(
            HubLoop {
                sessions: sessions.clone(),
                open: open.clone(),
                hooks: Vec::new(),
                rx,
            }
            .run(),
        );
        Self {
            sessions,
            open,
            ops,
        }
    }

    /// Add a session. Refused (and the session closed) after shutdown.
    pub async fn register(&self, session: Arc<Session>) -> bool {
        let (ack, done) = oneshot::channel();
        if self.ops.send(HubOp::Register(session.clone(), ack)).is_err() {
            session.close();
            return false;
        }
        done.await.unwrap_or(false)
    }

    /// Remove a session. Returns true only for the call that removed it.
    pub async fn unregister(&self, session: &Session) -> bool {
        let (ack, done) = oneshot::channel();
        if self
            .ops
            .send(HubOp::Unregister(session.id().to_string(), ack))
            .is_err()
        {
            return false;
        }
        done.await.unwrap_or(false)
    }

    /// Unicast. Unknown ids return false; that is not an error.
    pub fn send(&self, id: &str, packet: &Packet) -> bool {
        match self.sessions.get(id) {
            Some(s) => s.send_packet(packet),
            None => false,
        }
    }

    /// Send to every session, or only those `filter` accepts.
    pub fn broadcast(&self, packet: Packet, filter: Option<SessionFilter>) {
        let _ = self.ops.send(HubOp::Broadcast(packet, filter));
    }

    pub fn multicast(&self, ids: Vec<SessionId>, packet: Packet) {
        let _ = self.ops.send(HubOp::Multicast(ids, packet));
    }

    pub fn on_disconnect(&self, hook: DisconnectHook) {
        let _ = self.ops.send(HubOp::OnDisconnect(hook));
    }

    /// Close the hub: refuse new sessions, push `final_packet` to every
    /// session, close them all and drain the table.
    pub async fn shutdown(&self, final_packet: Packet) {
        let (ack, done) = oneshot::channel();
        if self.ops.send(HubOp::Shutdown(final_packet, ack)).is_ok() {
            let _ = done.await;
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    pub fn list(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|s| s.key().clone()).collect()
    }

    /// First session matching `pred`.
    pub fn find(&self, pred: impl Fn(&Session) -> bool) -> Option<Arc<Session>> {
        self.sessions
            .iter()
            .find(|s| pred(s.value()))
            .map(|s| s.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

struct HubLoop {
    sessions: Arc<DashMap<SessionId, Arc<Session>>>,
    open: Arc<AtomicBool>,
    hooks: Vec<DisconnectHook>,
    rx: mpsc::UnboundedReceiver<HubOp>,
}

impl HubLoop {
    async fn run(mut self) {
        while let Some(op) = self.rx.recv().await {
            match op {
                HubOp::Register(session, ack) => {
                    let accepted = self.open.load(Ordering::Acquire) && !session.is_closed();
                    if accepted {
                        tracing::debug!(session = %session.id(), addr = %session.addr(), "session registered");
                        self.sessions.insert(session.id().to_string(), session);
                    } else {
                        session.close_with(CLOSE_GOING_AWAY, "hub closed");
                    }
                    let _ = ack.send(accepted);
                }
                HubOp::Unregister(id, ack) => {
                    let removed = self.sessions.remove(&id);
                    let _ = ack.send(removed.is_some());
                    if let Some((_, session)) = removed {
                        session.close();
                        self.fire_hooks(&session);
                        tracing::debug!(session = %id, "session unregistered");
                    }
                }
                HubOp::Broadcast(packet, filter) => {
                    for s in self.sessions.iter() {
                        if filter.as_ref().map_or(true, |f| f(s.value())) {
                            s.send_packet(&packet);
                        }
                    }
                }
                HubOp::Multicast(ids, packet) => {
                    for id in ids {
                        if let Some(s) = self.sessions.get(&id) {
                            s.send_packet(&packet);
                        }
                    }
                }
                HubOp::OnDisconnect(hook) => self.hooks.push(hook),
                HubOp::Shutdown(final_packet, ack) => {
                    self.open.store(false, Ordering::Release);
                    let ids: Vec<SessionId> = self.sessions.iter().map(|s| s.key().clone()).collect();
                    let count = ids.len();
                    for id in ids {
                        if let Some((_, session)) = self.sessions.remove(&id) {
                            session.send_packet(&final_packet);
                            session.close_with(CLOSE_GOING_AWAY, "server shutdown");
                            self.fire_hooks(&session);
                        }
                    }
                    tracing::info!(sessions = count, "hub drained");
                    let _ = ack.send(());
                }
            }
        }
    }

    fn fire_hooks(&self, session: &Arc<Session>) {
        for hook in &self.hooks {
            hook(session);
        }
    }
}
