//! Bridge relay — pairs two independent HTTP exchanges under one token.
//!
//! The push side supplies a request body; the pull side wants it as its
//! response body. Whichever binds second completes the pair, and the push
//! side's task then copies chunks straight into the pull side's bounded
//! channel. Nothing is buffered beyond a few in-flight chunks.
//!
//! Each bridge is an explicit state machine:
//!
//!   Created ─bind─▶ Claimed(push|pull) ─bind other─▶ Paired ─▶ Streaming ─▶ Finished
//!
//! A second bind of a claimed role, or any bind after pairing, conflicts.
//! Bridges that never pair are swept after an idle threshold, which drops
//! the lone side and releases whoever was waiting on it. A push request
//! that goes away after binding takes its bridge with it.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

use tether_core::new_token;

/// Largest chunk handed to the pull side.
pub const RELAY_CHUNK: usize = 32 * 1024;
/// Per-chunk deadline for reading the push body.
pub const READ_DEADLINE: Duration = Duration::from_secs(5);
/// Per-chunk deadline for the pull side to accept a chunk.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(10);
/// Chunks in flight between the two sides.
const RELAY_QUEUE: usize = 4;

pub type PushBody = BoxStream<'static, io::Result<Bytes>>;

// ── Hooks ─────────────────────────────────────────────────────────────────────

/// Response headers for the pull side, set by the push hook.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullHead {
    pub headers: Vec<(String, String)>,
}

impl PullHead {
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
    }
}

/// How a relay ended.
#[derive(Debug)]
pub struct RelayOutcome {
    pub bytes: u64,
    pub result: Result<(), BridgeError>,
}

impl RelayOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

pub type PushHook = Box<dyn FnOnce(&mut PullHead) + Send + Sync>;
pub type PullHook = Box<dyn FnOnce() + Send + Sync>;
pub type FinishHook = Box<dyn FnOnce(&RelayOutcome) + Send + Sync>;

#[derive(Default)]
pub struct BridgeHooks {
    /// Runs when streaming starts; may set pull-side response headers.
    pub on_push: Option<PushHook>,
    /// Runs when the pull side binds.
    pub on_pull: Option<PullHook>,
    /// Runs once after streaming ends, before the bridge is removed.
    pub on_finish: Option<FinishHook>,
}

// ── State ─────────────────────────────────────────────────────────────────────

/// The pull side's half of the relay channel.
pub struct PullEnd {
    sink: mpsc::Sender<io::Result<Bytes>>,
    ready: oneshot::Sender<PullHead>,
}

enum Claim {
    /// Push bound first and waits here for the pull side.
    Push(oneshot::Sender<PullEnd>),
    /// Pull bound first; the push side will stream into it.
    Pull(PullEnd),
}

enum BridgeState {
    Created,
    Claimed(Claim),
    Paired,
    Streaming,
    Finished,
}

/// Observable state of a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgePhase {
    Created,
    ClaimedByPush,
    ClaimedByPull,
    Paired,
    Streaming,
    Finished,
}

impl BridgeState {
    fn phase(&self) -> BridgePhase {
        match self {
            Self::Created => BridgePhase::Created,
            Self::Claimed(Claim::Push(_)) => BridgePhase::ClaimedByPush,
            Self::Claimed(Claim::Pull(_)) => BridgePhase::ClaimedByPull,
            Self::Paired => BridgePhase::Paired,
            Self::Streaming => BridgePhase::Streaming,
            Self::Finished => BridgePhase::Finished,
        }
    }

    fn unpaired(&self) -> bool {
        matches!(self, Self::Created | Self::Claimed(_))
    }
}

struct BridgeRecord {
    created: Instant,
    state: BridgeState,
    ext: Value,
    hooks: BridgeHooks,
}

// ── Pull handle ───────────────────────────────────────────────────────────────

/// What the pull side gets back from `bind_pull`.
pub struct PullHandle {
    head: oneshot::Receiver<PullHead>,
    body: mpsc::Receiver<io::Result<Bytes>>,
}

impl PullHandle {
    /// Wait until streaming starts. Fails with `Gone` if the bridge is
    /// swept or removed first.
    pub async fn ready(self) -> Result<(PullHead, mpsc::Receiver<io::Result<Bytes>>), BridgeError> {
        let head = self.head.await.map_err(|_| BridgeError::Gone)?;
        Ok((head, self.body))
    }
}

// ── Table ─────────────────────────────────────────────────────────────────────

/// The bridge table, shared by the bridge endpoints and the handlers that
/// mint transfers.
#[derive(Clone, Default)]
pub struct BridgeTable {
    bridges: Arc<DashMap<String, BridgeRecord>>,
}

impl BridgeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a bridge and return its token.
    pub fn create(&self, ext: Value, hooks: BridgeHooks) -> String {
        let token = new_token();
        self.bridges.insert(
            token.clone(),
            BridgeRecord {
                created: Instant::now(),
                state: BridgeState::Created,
                ext,
                hooks,
            },
        );
        tracing::debug!(bridge = %token, "bridge created");
        token
    }

    /// Bind the pull side.
    pub fn bind_pull(&self, token: &str) -> Result<PullHandle, BridgeError> {
        let (sink, body) = mpsc::channel(RELAY_QUEUE);
        let (ready, head) = oneshot::channel();
        let end = PullEnd { sink, ready };

        let on_pull = {
            let mut rec = self.bridges.get_mut(token).ok_or(BridgeError::NotFound)?;
            match std::mem::replace(&mut rec.state, BridgeState::Paired) {
                BridgeState::Created => {
                    rec.state = BridgeState::Claimed(Claim::Pull(end));
                }
                BridgeState::Claimed(Claim::Push(waiter)) => {
                    if waiter.send(end).is_err() {
                        // The push request went away while waiting.
                        drop(rec);
                        self.bridges.remove(token);
                        return Err(BridgeError::Gone);
                    }
                }
                other => {
                    rec.state = other;
                    return Err(BridgeError::Conflict);
                }
            }
            rec.hooks.on_pull.take()
        };

        if let Some(hook) = on_pull {
            hook();
        }
        tracing::debug!(bridge = %token, "pull side bound");
        Ok(PullHandle { head, body })
    }

    /// Bind the push side and relay `body` once the pull side is present.
    ///
    /// Resolves when the relay is finished. The bridge is removed by then,
    /// and also if this future is dropped part way.
    pub async fn bind_push(&self, token: &str, body: PushBody) -> Result<RelayOutcome, BridgeError> {
        let waiting = {
            let mut rec = self.bridges.get_mut(token).ok_or(BridgeError::NotFound)?;
            match std::mem::replace(&mut rec.state, BridgeState::Paired) {
                BridgeState::Created => {
                    let (tx, rx) = oneshot::channel();
                    rec.state = BridgeState::Claimed(Claim::Push(tx));
                    Err(rx)
                }
                BridgeState::Claimed(Claim::Pull(end)) => Ok(end),
                other => {
                    rec.state = other;
                    return Err(BridgeError::Conflict);
                }
            }
        };

        let mut guard = RelayGuard {
            table: self,
            token,
            bytes: 0,
            sink: None,
            armed: true,
        };
        let pull = match waiting {
            Ok(end) => end,
            Err(rx) => {
                tracing::debug!(bridge = %token, "push side bound, waiting for pull");
                match rx.await {
                    Ok(end) => end,
                    Err(_) => {
                        guard.armed = false;
                        return Err(BridgeError::Gone);
                    }
                }
            }
        };
        Ok(self.relay(guard, body, pull).await)
    }

    async fn relay(&self, mut guard: RelayGuard<'_>, mut body: PushBody, pull: PullEnd) -> RelayOutcome {
        let on_push = self.bridges.get_mut(guard.token).and_then(|mut rec| {
            rec.state = BridgeState::Streaming;
            rec.hooks.on_push.take()
        });

        let mut head = PullHead::default();
        if let Some(hook) = on_push {
            hook(&mut head);
        }
        let PullEnd { sink, ready } = pull;
        let result = if ready.send(head).is_err() {
            Err(BridgeError::PullClosed)
        } else {
            guard.sink = Some(sink);
            guard.copy(&mut body).await
        };
        guard.finish(result)
    }

    /// Mark a relay finished, run `on_finish` and drop the bridge.
    fn complete(&self, token: &str, outcome: RelayOutcome) -> RelayOutcome {
        let on_finish = self.bridges.get_mut(token).and_then(|mut rec| {
            rec.state = BridgeState::Finished;
            rec.hooks.on_finish.take()
        });
        if let Some(hook) = on_finish {
            hook(&outcome);
        }
        self.bridges.remove(token);
        outcome
    }

    /// Drop a bridge regardless of state. Waiting sides are released.
    pub fn remove(&self, token: &str) -> bool {
        self.bridges.remove(token).is_some()
    }

    /// Remove bridges older than `idle` that never paired.
    pub fn sweep(&self, idle: Duration) -> usize {
        let before = self.bridges.len();
        self.bridges
            .retain(|_, rec| !(rec.state.unpaired() && rec.created.elapsed() > idle));
        let swept = before.saturating_sub(self.bridges.len());
        if swept > 0 {
            tracing::debug!(swept, "unpaired bridges swept");
        }
        swept
    }

    pub fn phase(&self, token: &str) -> Option<BridgePhase> {
        self.bridges.get(token).map(|r| r.state.phase())
    }

    pub fn ext(&self, token: &str) -> Option<Value> {
        self.bridges.get(token).map(|r| r.ext.clone())
    }

    pub fn contains(&self, token: &str) -> bool {
        self.bridges.contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.bridges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }
}

// ── Relay guard ───────────────────────────────────────────────────────────────

/// Owns the push side of a bound bridge. Dropped while still armed (the
/// push request went away), it ends the pull body with an error and
/// completes the bridge as aborted.
struct RelayGuard<'a> {
    table: &'a BridgeTable,
    token: &'a str,
    bytes: u64,
    sink: Option<mpsc::Sender<io::Result<Bytes>>>,
    armed: bool,
}

impl RelayGuard<'_> {
    async fn copy(&mut self, body: &mut PushBody) -> Result<(), BridgeError> {
        let Some(sink) = self.sink.as_ref() else {
            return Err(BridgeError::PullClosed);
        };
        loop {
            let chunk = match tokio::time::timeout(READ_DEADLINE, body.next()).await {
                Err(_) => return Err(BridgeError::ReadTimeout(READ_DEADLINE)),
                Ok(None) => return Ok(()),
                Ok(Some(Err(e))) => return Err(BridgeError::Io(e)),
                Ok(Some(Ok(chunk))) => chunk,
            };
            let mut offset = 0;
            while offset < chunk.len() {
                let end = (offset + RELAY_CHUNK).min(chunk.len());
                let piece = chunk.slice(offset..end);
                match tokio::time::timeout(WRITE_DEADLINE, sink.send(Ok(piece))).await {
                    Err(_) => return Err(BridgeError::WriteTimeout(WRITE_DEADLINE)),
                    Ok(Err(_)) => return Err(BridgeError::PullClosed),
                    Ok(Ok(())) => {}
                }
                self.bytes += (end - offset) as u64;
                offset = end;
            }
        }
    }

    fn fail_pull(&mut self, e: &BridgeError) {
        if let Some(sink) = self.sink.take() {
            let _ = sink.try_send(Err(io::Error::other(e.to_string())));
        }
    }

    fn finish(mut self, result: Result<(), BridgeError>) -> RelayOutcome {
        self.armed = false;
        match &result {
            Err(e) => {
                self.fail_pull(e);
                tracing::warn!(bridge = %self.token, bytes = self.bytes, error = %e, "relay aborted");
            }
            Ok(()) => tracing::debug!(bridge = %self.token, bytes = self.bytes, "relay finished"),
        }
        self.sink = None;
        self.table.complete(
            self.token,
            RelayOutcome {
                bytes: self.bytes,
                result,
            },
        )
    }
}

impl Drop for RelayGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::warn!(bridge = %self.token, bytes = self.bytes, "push side dropped, relay abandoned");
        self.fail_pull(&BridgeError::Aborted);
        self.table.complete(
            self.token,
            RelayOutcome {
                bytes: self.bytes,
                result: Err(BridgeError::Aborted),
            },
        );
    }
}

/// Sweep unpaired bridges every `interval` until shutdown.
pub async fn sweep_loop(
    table: BridgeTable,
    interval: Duration,
    idle: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut tick = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                table.sweep(idle);
            }
            _ = shutdown.recv() => {
                tracing::info!("bridge sweeper shutting down");
                return;
            }
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge not found")]
    NotFound,

    #[error("bridge role already claimed")]
    Conflict,

    #[error("bridge discarded before it was paired")]
    Gone,

    #[error("push body stalled for more than {0:?}")]
    ReadTimeout(Duration),

    #[error("pull side stalled for more than {0:?}")]
    WriteTimeout(Duration),

    #[error("pull side went away")]
    PullClosed,

    #[error("push side went away")]
    Aborted,

    #[error("push body: {0}")]
    Io(#[from] io::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
