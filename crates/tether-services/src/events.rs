//! Event correlation — turns the push protocol into request/reply.
//!
//! A caller registers a callback under a fresh token, sends a packet
//! carrying that token, and the agent echoes the token in its reply.
//! `dispatch` finds the registration, checks the reply arrived on the
//! session that registered it, removes it and fires the callback.
//!
//! Whoever removes a registration owns the outcome: dispatch signals
//! `true`, `remove` signals `false` (or the outcome the canceller passes
//! to `remove_with`), and a waiter that times out only
//! reports a timeout if it removed the registration itself.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;

use tether_core::Packet;

use crate::session::{Session, SessionId};

/// Invoked with the reply packet and the session it arrived on.
pub type EventCallback = Box<dyn FnOnce(Packet, &Arc<Session>) + Send + Sync>;

struct Registration {
    session: SessionId,
    callback: EventCallback,
    /// Present for one-shot registrations.
    done: Option<oneshot::Sender<bool>>,
}

/// The event table, shared by every read loop and operator handler.
#[derive(Clone, Default)]
pub struct EventTable {
    events: Arc<DashMap<String, Registration>>,
}

impl EventTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a one-shot callback and return the handle to wait on.
    ///
    /// Register before sending the request, then `wait`, so a fast reply
    /// can never arrive ahead of its registration.
    pub fn register_once(
        &self,
        callback: EventCallback,
        session: &str,
        token: &str,
    ) -> EventWaiter {
        let (done, rx) = oneshot::channel();
        self.events.insert(
            token.to_string(),
            Registration {
                session: session.to_string(),
                callback,
                done: Some(done),
            },
        );
        EventWaiter {
            table: self.clone(),
            token: token.to_string(),
            rx: Some(rx),
        }
    }

    /// Register, block until the callback fires or `timeout` elapses, then
    /// drop the registration. Returns whether the callback fired.
    pub async fn add_once(
        &self,
        callback: EventCallback,
        session: &str,
        token: &str,
        timeout: Duration,
    ) -> bool {
        self.register_once(callback, session, token)
            .wait(timeout)
            .await
    }

    /// Register a callback with no deadline. It stays until a matching
    /// reply consumes it or it is removed.
    pub fn add(&self, callback: EventCallback, session: &str, token: &str) {
        self.events.insert(
            token.to_string(),
            Registration {
                session: session.to_string(),
                callback,
                done: None,
            },
        );
    }

    /// Route a reply to its registration.
    ///
    /// No token, an unknown token, or a token registered by another
    /// session: nothing happens and any registration stays in place.
    /// Returns whether a callback fired.
    pub fn dispatch(&self, packet: Packet, session: &Arc<Session>) -> bool {
        if packet.event.is_empty() {
            return false;
        }
        let Some((token, reg)) = self
            .events
            .remove_if(&packet.event, |_, r| r.session == session.id())
        else {
            if self.events.contains_key(&packet.event) {
                tracing::debug!(
                    event = %packet.event,
                    session = %session.id(),
                    "reply token belongs to another session, ignored"
                );
            }
            return false;
        };
        (reg.callback)(packet, session);
        if let Some(done) = reg.done {
            let _ = done.send(true);
        }
        tracing::trace!(event = %token, "event dispatched");
        true
    }

    /// Cancel a registration. A blocked waiter is released with `false`.
    pub fn remove(&self, token: &str) -> bool {
        self.remove_with(token, false)
    }

    /// Cancel a registration without running its callback, releasing a
    /// blocked waiter with `fired`.
    pub fn remove_with(&self, token: &str, fired: bool) -> bool {
        match self.events.remove(token) {
            Some((_, reg)) => {
                if let Some(done) = reg.done {
                    let _ = done.send(fired);
                }
                true
            }
            None => false,
        }
    }

    pub fn has(&self, token: &str) -> bool {
        self.events.contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Pending one-shot registration. Dropping it unregisters.
pub struct EventWaiter {
    table: EventTable,
    token: String,
    rx: Option<oneshot::Receiver<bool>>,
}

impl EventWaiter {
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Wait for the callback or the deadline. The registration is gone
    /// when this returns, whatever the outcome.
    pub async fn wait(mut self, timeout: Duration) -> bool {
        let Some(mut rx) = self.rx.take() else {
            return false;
        };
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(signal) => signal.unwrap_or(false),
            Err(_) => {
                if self.table.events.remove(&self.token).is_some() {
                    false
                } else {
                    // Dispatch or remove got there first; its signal is due.
                    rx.await.unwrap_or(false)
                }
            }
        }
    }
}

impl Drop for EventWaiter {
    fn drop(&mut self) {
        self.table.events.remove(&self.token);
    }
}
