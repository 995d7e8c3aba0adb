//! tether-services — the shared state behind the control plane: session
//! hub, device registry, event table, bridge table, and the workers that
//! keep them healthy.

pub mod bridge;
pub mod device;
pub mod dispatch;
pub mod events;
pub mod health;
pub mod session;

pub use bridge::{
    sweep_loop, BridgeError, BridgeHooks, BridgePhase, BridgeTable, PullHead, PullHandle,
    PushBody, RelayOutcome,
};
pub use device::DeviceRegistry;
pub use dispatch::{decode_packet, InboundDispatcher, Verdict};
pub use events::{EventCallback, EventTable, EventWaiter};
pub use health::{ping_session, HealthMonitor, HealthSettings};
pub use session::{Hub, Outbound, Session, SessionId, CLOSE_GOING_AWAY, CLOSE_NORMAL};
