//! bmnotify core types: port snapshots, classified events and the sink seam.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod filter;

pub use filter::{Classified, TransitionFilter, BAREMETAL_VNIC_TYPE};

/// Interface tag carried by every event this crate emits.
pub const NETWORK_INTERFACE: &str = "network";

/// Port status as reported by the networking service.
///
/// Only the three statuses the filter reasons about get their own variant;
/// anything else (`BUILD`, `N/A`, ...) is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PortStatus {
    Active,
    Down,
    Error,
    Other(String),
}

impl PortStatus {
    pub fn as_str(&self) -> &str {
        match self {
            PortStatus::Active => "ACTIVE",
            PortStatus::Down => "DOWN",
            PortStatus::Error => "ERROR",
            PortStatus::Other(s) => s.as_str(),
        }
    }
}

impl From<String> for PortStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "ACTIVE" => PortStatus::Active,
            "DOWN" => PortStatus::Down,
            "ERROR" => PortStatus::Error,
            _ => PortStatus::Other(s),
        }
    }
}

impl From<&str> for PortStatus {
    fn from(s: &str) -> Self { PortStatus::from(s.to_string()) }
}

impl From<PortStatus> for String {
    fn from(s: PortStatus) -> Self {
        match s {
            PortStatus::Other(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for PortStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.pad(self.as_str()) }
}

/// Snapshot of a port as delivered by the event source (one side of a transition).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRecord {
    pub id: String,
    pub device_id: String,
    pub mac_address: String,
    pub status: PortStatus,
    /// Scope field: which kind of endpoint the port is bound for.
    #[serde(rename = "binding:vnic_type")]
    pub vnic_type: String,
}

impl PortRecord {
    /// Parse a raw JSON port body. Missing or ill-typed fields are a structural error.
    pub fn from_value(raw: &serde_json::Value) -> Result<Self, CoreError> {
        PortRecord::deserialize(raw).map_err(CoreError::MalformedRecord)
    }
}

/// Status reported downstream. A strict subset of port statuses plus the removal marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Active,
    Down,
    Error,
    Deleted,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Active => "ACTIVE",
            EventStatus::Down => "DOWN",
            EventStatus::Error => "ERROR",
            EventStatus::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.pad(self.as_str()) }
}

/// Kind of a classified transition. "No event" is `None` at the call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Bind,
    Unbind,
    Delete,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Bind => "bind",
            EventKind::Unbind => "unbind",
            EventKind::Delete => "delete",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.pad(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPayload {
    port_id: String,
    mac_address: String,
    status: EventStatus,
}

impl EventPayload {
    pub fn port_id(&self) -> &str { &self.port_id }
    pub fn mac_address(&self) -> &str { &self.mac_address }
    pub fn status(&self) -> EventStatus { self.status }
}

/// One event as submitted to the sink. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    interface: String,
    identifier: String,
    payload: EventPayload,
}

impl EventRecord {
    /// Build a network event for `port`, identified by its owning device.
    pub fn network(port: &PortRecord, status: EventStatus) -> Self {
        Self {
            interface: NETWORK_INTERFACE.to_string(),
            identifier: port.device_id.clone(),
            payload: EventPayload {
                port_id: port.id.clone(),
                mac_address: port.mac_address.clone(),
                status,
            },
        }
    }

    pub fn interface(&self) -> &str { &self.interface }
    pub fn identifier(&self) -> &str { &self.identifier }
    pub fn payload(&self) -> &EventPayload { &self.payload }
}

/// Errors raised while turning raw input into core types.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("malformed port record: {0}")]
    MalformedRecord(#[source] serde_json::Error),
    #[error("missing {0} port record")]
    MissingRecord(&'static str),
}

/// Failure of a single `Sink::submit` call. The batch is dropped either way.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("auth rejected with status {0}")]
    Auth(u16),
    #[error("rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("encode: {0}")]
    Encode(String),
    #[error("flush panicked: {0}")]
    Panicked(String),
}

/// Remote service receiving event batches.
#[async_trait::async_trait]
pub trait Sink: Send + Sync {
    /// Deliver one batch. Never called with an empty batch.
    async fn submit(&self, events: Vec<EventRecord>) -> Result<(), SinkError>;

    /// Short label used in logs.
    fn name(&self) -> &str { "sink" }
}

pub mod prelude {
    pub use super::{
        Classified, CoreError, EventKind, EventPayload, EventRecord, EventStatus, PortRecord, PortStatus, Sink,
        SinkError, TransitionFilter,
    };
}
