//! Control-channel envelope and device model.
//!
//! Every message on the main channel is a `Packet`, serialized as JSON and
//! then framed by the StandardCodec. `event` carries the correlation token
//! that ties a reply to the request that caused it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::codec::random_bytes;

/// Action names shared by server and agent.
pub mod act {
    pub const DEVICE_UP: &str = "DEVICE_UP";
    pub const DEVICE_UPDATE: &str = "DEVICE_UPDATE";
    pub const PING: &str = "PING";
    pub const OFFLINE: &str = "OFFLINE";
    pub const COMMAND_EXEC: &str = "COMMAND_EXEC";
    pub const SCREENSHOT: &str = "SCREENSHOT";
    pub const FILE_UPLOAD: &str = "FILE_UPLOAD_TEXT";
}

/// Control envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    #[serde(default)]
    pub code: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub act: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event: String,
    /// Payload of a raw frame. Never serialized.
    #[serde(skip)]
    pub raw: Option<Bytes>,
}

impl Packet {
    /// `{code: 0}`
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(code: i32, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            ..Self::default()
        }
    }

    pub fn act(act: impl Into<String>) -> Self {
        Self {
            act: act.into(),
            ..Self::default()
        }
    }

    pub fn with_event(mut self, token: impl Into<String>) -> Self {
        self.event = token.into();
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    /// String field from `data`, if present.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.as_ref()?.get(key)?.as_str()
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Fresh correlation token: 16 random bytes, hex.
pub fn new_token() -> String {
    hex::encode(random_bytes::<16>())
}

// ── Power actions ─────────────────────────────────────────────────────────────

/// Fire-and-forget actions an operator can send to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAct {
    Lock,
    Logoff,
    Hibernate,
    Suspend,
    Restart,
    Shutdown,
    Offline,
}

impl PowerAct {
    pub fn parse(act: &str) -> Option<Self> {
        match act.to_ascii_uppercase().as_str() {
            "LOCK" => Some(Self::Lock),
            "LOGOFF" => Some(Self::Logoff),
            "HIBERNATE" => Some(Self::Hibernate),
            "SUSPEND" => Some(Self::Suspend),
            "RESTART" => Some(Self::Restart),
            "SHUTDOWN" => Some(Self::Shutdown),
            "OFFLINE" => Some(Self::Offline),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lock => "LOCK",
            Self::Logoff => "LOGOFF",
            Self::Hibernate => "HIBERNATE",
            Self::Suspend => "SUSPEND",
            Self::Restart => "RESTART",
            Self::Shutdown => "SHUTDOWN",
            Self::Offline => "OFFLINE",
        }
    }
}

// ── Device ────────────────────────────────────────────────────────────────────

/// Identity and resource snapshot reported by an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Device {
    /// Stable id derived from the hardware fingerprint.
    pub id: String,
    pub os: String,
    pub arch: String,
    pub lan: String,
    /// Overwritten with the session's remote address.
    pub wan: String,
    pub mac: String,
    pub net: NetStats,
    pub cpu: CpuStats,
    pub ram: Usage,
    pub disk: Usage,
    pub uptime: u64,
    /// Half the last ping round trip, in milliseconds.
    pub latency: u64,
    pub hostname: String,
    pub username: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetStats {
    pub sent: u64,
    pub recv: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuStats {
    pub model: String,
    pub usage: f64,
    pub cores: CpuCores,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuCores {
    pub logical: u32,
    pub physical: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub total: u64,
    pub used: u64,
    pub usage: f64,
}

impl Device {
    /// Take the volatile fields of a `DEVICE_UPDATE` report.
    pub fn refresh_from(&mut self, update: &Device) {
        self.cpu = update.cpu.clone();
        self.ram = update.ram.clone();
        self.net = update.net.clone();
        self.disk = update.disk.clone();
        self.uptime = update.uptime;
    }
}

/// Device report envelope: a packet whose `data` is a [`Device`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceReport {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub act: String,
    #[serde(default)]
    pub data: Device,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event: String,
}
