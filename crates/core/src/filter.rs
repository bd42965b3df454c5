//! Transition filter: decides which port changes are worth reporting.
//!
//! Only in-scope ports (vnic type match) are considered, and only a narrow set
//! of status transitions produce events. Everything else is noise.

use metrics::counter;
use tracing::debug;

use crate::{EventKind, EventRecord, EventStatus, PortRecord, PortStatus};

/// Vnic type of ports attached to bare-metal nodes.
pub const BAREMETAL_VNIC_TYPE: &str = "baremetal";

/// A transition that survived the filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub kind: EventKind,
    pub record: EventRecord,
}

/// Kind and reported status for an update, or `None` when the pair is noise.
fn update_transition(before: &PortStatus, after: &PortStatus) -> Option<(EventKind, EventStatus)> {
    match (before, after) {
        (PortStatus::Active, PortStatus::Down) => Some((EventKind::Unbind, EventStatus::Down)),
        (PortStatus::Active, PortStatus::Error) => Some((EventKind::Unbind, EventStatus::Error)),
        (PortStatus::Down, PortStatus::Active) => Some((EventKind::Bind, EventStatus::Active)),
        (PortStatus::Down, PortStatus::Error) => Some((EventKind::Bind, EventStatus::Error)),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionFilter {
    vnic_type: String,
}

impl Default for TransitionFilter {
    fn default() -> Self { Self::new(BAREMETAL_VNIC_TYPE) }
}

impl TransitionFilter {
    pub fn new(vnic_type: impl Into<String>) -> Self {
        Self { vnic_type: vnic_type.into() }
    }

    pub fn vnic_type(&self) -> &str { &self.vnic_type }

    /// Scope gate, always checked against the post-change record.
    pub fn in_scope(&self, after: &PortRecord) -> bool {
        after.vnic_type == self.vnic_type
    }

    pub fn classify_update(&self, before: &PortRecord, after: &PortRecord) -> Option<Classified> {
        if !self.in_scope(after) {
            debug!(port = %after.id, vnic_type = %after.vnic_type, "update ignored: port out of scope");
            counter!("bmnotify_events_ignored_total", 1, "reason" => "scope");
            return None;
        }
        match update_transition(&before.status, &after.status) {
            Some((kind, status)) => {
                counter!("bmnotify_events_classified_total", 1, "kind" => kind.as_str());
                Some(Classified { kind, record: EventRecord::network(after, status) })
            }
            None => {
                debug!(port = %after.id, from = %before.status, to = %after.status, "update ignored: transition not reported");
                counter!("bmnotify_events_ignored_total", 1, "reason" => "transition");
                None
            }
        }
    }

    /// Deletions of in-scope ports are always reported, whatever the last status was.
    pub fn classify_delete(&self, _before: &PortRecord, after: &PortRecord) -> Option<Classified> {
        if !self.in_scope(after) {
            debug!(port = %after.id, vnic_type = %after.vnic_type, "delete ignored: port out of scope");
            counter!("bmnotify_events_ignored_total", 1, "reason" => "scope");
            return None;
        }
        counter!("bmnotify_events_classified_total", 1, "kind" => EventKind::Delete.as_str());
        Some(Classified { kind: EventKind::Delete, record: EventRecord::network(after, EventStatus::Deleted) })
    }
}
