//! Routes inbound agent frames.
//!
//! Raw frames go straight to the event table. Everything else is decoded
//! with the session's codec: device reports update the registry, any other
//! packet is a reply and is matched to its event. A session that has not
//! reported a device may not dispatch replies or raw frames.

use std::sync::Arc;
use std::time::Duration;

use tether_core::packet::DeviceReport;
use tether_core::wire::RawFrame;
use tether_core::{act, CodecError, FrameCodec, Packet};

use crate::device::DeviceRegistry;
use crate::events::EventTable;
use crate::health::ping_session;
use crate::session::{Session, CLOSE_GOING_AWAY, CLOSE_NORMAL};

/// What the connection should do after a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    /// Stop reading. The session has already been asked to close.
    Close,
}

pub struct InboundDispatcher {
    devices: DeviceRegistry,
    events: EventTable,
    /// Undecryptable frames tolerated per connection.
    failure_budget: u32,
    /// Ping timeout for the first ping after DEVICE_UP, if enabled.
    report_ping: Option<Duration>,
}

impl InboundDispatcher {
    pub fn new(devices: DeviceRegistry, events: EventTable, failure_budget: u32) -> Self {
        Self {
            devices,
            events,
            failure_budget,
            report_ping: None,
        }
    }

    /// Ping each device as soon as it reports, so its latency is known
    /// before the first health-check round. Needs a runtime.
    pub fn with_report_ping(mut self, timeout: Duration) -> Self {
        self.report_ping = Some(timeout);
        self
    }

    /// Handle one binary frame from the persistent channel.
    ///
    /// `failures` is the connection's running count of bad frames.
    pub fn handle_frame(&self, session: &Arc<Session>, frame: &[u8], failures: &mut u32) -> Verdict {
        if let Some(raw) = RawFrame::parse(frame) {
            return self.handle_raw(session, raw);
        }
        match decode_packet(session, frame) {
            Ok(packet) => self.handle_packet(session, packet),
            Err(e) => {
                *failures += 1;
                tracing::warn!(
                    session = %session.id(),
                    failures = *failures,
                    error = %e,
                    "undecodable frame"
                );
                if *failures > self.failure_budget {
                    session.send_packet(&Packet::error(-1, ""));
                    session.close_with(CLOSE_NORMAL, "invalid request");
                    Verdict::Close
                } else {
                    Verdict::Continue
                }
            }
        }
    }

    /// Route a raw frame's payload to the event registered under its token.
    pub fn handle_raw(&self, session: &Arc<Session>, raw: RawFrame) -> Verdict {
        if !self.reported(session, "raw") {
            return Verdict::Close;
        }
        let packet = Packet {
            event: raw.event,
            raw: Some(raw.payload),
            ..Packet::default()
        }
        .with_data("op", raw.op);
        self.events.dispatch(packet, session);
        session.touch();
        Verdict::Continue
    }

    /// Handle a decoded packet from either transport.
    pub fn handle_packet(&self, session: &Arc<Session>, packet: Packet) -> Verdict {
        if packet.act == act::DEVICE_UP || packet.act == act::DEVICE_UPDATE {
            session.touch();
            return self.handle_report(session, packet);
        }
        if !self.reported(session, &packet.act) {
            return Verdict::Close;
        }
        self.events.dispatch(packet, session);
        session.touch();
        Verdict::Continue
    }

    /// Whether `session` has a device record. If not, it is closed.
    fn reported(&self, session: &Session, kind: &str) -> bool {
        if self.devices.contains(session.id()) {
            return true;
        }
        tracing::warn!(session = %session.id(), kind = %kind, "frame before device report");
        session.close_with(CLOSE_GOING_AWAY, "invalid device id");
        false
    }

    fn handle_report(&self, session: &Arc<Session>, packet: Packet) -> Verdict {
        let report = match packet_to_report(packet) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(session = %session.id(), error = %e, "malformed device report");
                session.close();
                return Verdict::Close;
            }
        };
        let up = report.act == act::DEVICE_UP;
        if up {
            self.devices.upsert(session, report.data);
        } else if !self.devices.update(session.id(), &report.data) {
            tracing::debug!(session = %session.id(), "update for unknown device ignored");
        }
        session.send_packet(&Packet::ok());
        if let (true, Some(timeout)) = (up, self.report_ping) {
            ping_session(&self.events, &self.devices, session, timeout);
        }
        Verdict::Continue
    }

    /// Called once per session when it leaves the hub.
    pub fn disconnect(&self, session: &Session) {
        self.devices.remove(session.id());
    }
}

/// Decode a StandardCodec frame into a packet.
pub fn decode_packet(session: &Session, frame: &[u8]) -> Result<Packet, CodecError> {
    let json = session.codec().decode(frame)?;
    Ok(Packet::from_json(&json)?)
}

fn packet_to_report(packet: Packet) -> Result<DeviceReport, serde_json::Error> {
    let value = serde_json::to_value(&packet)?;
    serde_json::from_value(value)
}
