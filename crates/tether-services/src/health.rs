//! Health monitor — pings live devices and closes idle sessions.
//!
//! Every ping carries a fresh event token. The agent echoes it, the reply
//! goes through normal dispatch (refreshing last activity), and the
//! callback records half the round trip as the device's latency.
//! Sessions that stay silent past the idle threshold are closed; their
//! read loops then unregister them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;

use tether_core::{act, new_token, Packet};

use crate::device::DeviceRegistry;
use crate::events::EventTable;
use crate::session::{unix_now, Hub, Session, CLOSE_GOING_AWAY};

#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub ping_every: Duration,
    pub idle_check_every: Duration,
    pub idle_after: Duration,
    /// How long a ping waits for its echo.
    pub ping_timeout: Duration,
}

pub struct HealthMonitor {
    hub: Hub,
    devices: DeviceRegistry,
    events: EventTable,
    settings: HealthSettings,
    shutdown: broadcast::Receiver<()>,
}

impl HealthMonitor {
    pub fn new(
        hub: Hub,
        devices: DeviceRegistry,
        events: EventTable,
        settings: HealthSettings,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            hub,
            devices,
            events,
            settings,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut ping = tokio::time::interval(self.settings.ping_every);
        let mut idle = tokio::time::interval(self.settings.idle_check_every);
        loop {
            tokio::select! {
                _ = ping.tick() => self.ping_all(),
                _ = idle.tick() => {
                    self.close_idle(unix_now());
                }
                _ = self.shutdown.recv() => {
                    tracing::info!("health monitor shutting down");
                    return;
                }
            }
        }
    }

    /// Send a ping to every session with a registered device.
    pub fn ping_all(&self) {
        for session in self.hub.list() {
            if self.devices.contains(session.id()) {
                ping_session(&self.events, &self.devices, &session, self.settings.ping_timeout);
            }
        }
    }

    /// Close sessions silent for longer than the idle threshold.
    /// Returns how many were closed.
    pub fn close_idle(&self, now: i64) -> usize {
        let limit = self.settings.idle_after.as_secs() as i64;
        let mut closed = 0;
        for session in self.hub.list() {
            let silent = now - session.last_activity();
            if silent > limit {
                tracing::info!(session = %session.id(), silent_secs = silent, "closing idle session");
                session.close_with(CLOSE_GOING_AWAY, "idle timeout");
                closed += 1;
            }
        }
        closed
    }
}

/// Ping one session. When the echo arrives within `timeout`, half the
/// round trip is recorded as its device's latency. Returns false if the
/// session is already closed.
pub fn ping_session(
    events: &EventTable,
    devices: &DeviceRegistry,
    session: &Arc<Session>,
    timeout: Duration,
) -> bool {
    let token = new_token();
    let sent_at = Instant::now();
    let devices = devices.clone();
    let waiter = events.register_once(
        Box::new(move |_, s| {
            let rtt = sent_at.elapsed().as_millis() as u64;
            devices.set_latency(s.id(), rtt / 2);
        }),
        session.id(),
        &token,
    );
    if !session.send_packet(&Packet::act(act::PING).with_event(token)) {
        return false;
    }
    tokio::spawn(async move {
        waiter.wait(timeout).await;
    });
    true
}
