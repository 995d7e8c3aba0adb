//! Device registry — which live session serves which device.
//!
//! Records are indexed by the session currently serving them. A second
//! index maps device id → session and is what enforces one live session
//! per device: the upsert for a device id runs under that id's entry lock,
//! so eviction of the previous session and insertion of the new mapping
//! happen as one step.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use tether_core::{act, Device, Packet};

use crate::session::{Session, SessionId, CLOSE_NORMAL};

/// The device registry, shared between the channel handlers, the health
/// monitor and the operator API.
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    records: Arc<DashMap<SessionId, Device>>,
    by_device: Arc<DashMap<String, Arc<Session>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `device` as served by `session`.
    ///
    /// Any other live session serving the same device id is sent
    /// `OFFLINE`, closed and dropped before the new mapping is stored.
    /// Returns the evicted session, if there was one.
    pub fn upsert(&self, session: &Arc<Session>, mut device: Device) -> Option<Arc<Session>> {
        device.wan = session.addr().to_string();
        let device_id = device.id.clone();

        let (evicted, previous) = match self.by_device.entry(device_id.clone()) {
            Entry::Occupied(mut e) => {
                let old = e.get().clone();
                let evicted = if old.id() != session.id() {
                    old.send_packet(&Packet::act(act::OFFLINE));
                    old.close_with(CLOSE_NORMAL, "device reconnected");
                    self.records.remove(old.id());
                    Some(old)
                } else {
                    None
                };
                e.insert(session.clone());
                let previous = self.records.insert(session.id().to_string(), device);
                (evicted, previous)
            }
            Entry::Vacant(e) => {
                e.insert(session.clone());
                let previous = self.records.insert(session.id().to_string(), device);
                (None, previous)
            }
        };

        // Same session re-reporting under a new id: release the old id.
        if let Some(prev) = previous {
            if prev.id != device_id {
                self.by_device
                    .remove_if(&prev.id, |_, s| s.id() == session.id());
            }
        }

        if let Some(old) = &evicted {
            tracing::info!(
                device = %device_id,
                old_session = %old.id(),
                new_session = %session.id(),
                "device reconnected, previous session evicted"
            );
        } else {
            tracing::info!(device = %device_id, session = %session.id(), addr = %session.addr(), "device online");
        }
        evicted
    }

    /// Refresh the volatile fields of an existing record.
    pub fn update(&self, session_id: &str, partial: &Device) -> bool {
        match self.records.get_mut(session_id) {
            Some(mut d) => {
                d.refresh_from(partial);
                true
            }
            None => false,
        }
    }

    pub fn set_latency(&self, session_id: &str, latency_ms: u64) -> bool {
        match self.records.get_mut(session_id) {
            Some(mut d) => {
                d.latency = latency_ms;
                true
            }
            None => false,
        }
    }

    /// Resolve a session id or a device id to the serving session id.
    pub fn resolve(&self, key: &str) -> Option<SessionId> {
        if self.records.contains_key(key) {
            return Some(key.to_string());
        }
        self.resolve_device(key)
    }

    pub fn resolve_device(&self, device_id: &str) -> Option<SessionId> {
        self.by_device
            .get(device_id)
            .map(|s| s.value().id().to_string())
    }

    /// Drop the record served by `session_id`. The device index is only
    /// cleared if it still points at this session.
    pub fn remove(&self, session_id: &str) -> Option<Device> {
        let (_, device) = self.records.remove(session_id)?;
        self.by_device
            .remove_if(&device.id, |_, s| s.id() == session_id);
        tracing::info!(device = %device.id, session = %session_id, "device offline");
        Some(device)
    }

    pub fn get(&self, session_id: &str) -> Option<Device> {
        self.records.get(session_id).map(|d| d.value().clone())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.records.contains_key(session_id)
    }

    /// All records, keyed by serving session id.
    pub fn snapshot(&self) -> Vec<(SessionId, Device)> {
        self.records
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
