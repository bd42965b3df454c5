//! bmnotify public API: the notifier the host event source calls into.
//!
//! The host registers [`Notifier`] for the keys in [`SUBSCRIPTIONS`] and hands
//! it raw before/after port bodies. Classified transitions are queued and
//! flushed to the injected sink on a timer.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bmnotify_core::{Classified, CoreError, EventKind, PortRecord, Sink, TransitionFilter, BAREMETAL_VNIC_TYPE};
use bmnotify_store::{BatchQueue, FlushHandle, FlushScheduler};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use bmnotify_store::{FlushOutcome, SchedulerState};

/// Pause between attempts in [`Notifier::flush_pending`].
const FLUSH_RETRY_PAUSE: Duration = Duration::from_millis(10);

/// Default flush period.
pub const DEFAULT_SEND_EVENTS_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Port,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AfterCreate,
    AfterUpdate,
    AfterDelete,
    #[serde(other)]
    Other,
}

/// Keys the host must register the notifier for.
pub const SUBSCRIPTIONS: [(ResourceKind, EventType); 2] =
    [(ResourceKind::Port, EventType::AfterUpdate), (ResourceKind::Port, EventType::AfterDelete)];

/// Errors returned to the event source. Only malformed input is reported.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error(transparent)]
    Malformed(#[from] CoreError),
}

pub type NotifyResult<T> = Result<T, NotifyError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifierConfig {
    pub send_events_interval: Duration,
    /// Vnic type of the ports we report on.
    pub vnic_type: String,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self { send_events_interval: DEFAULT_SEND_EVENTS_INTERVAL, vnic_type: BAREMETAL_VNIC_TYPE.to_string() }
    }
}

/// Handler signature the event source invokes.
pub trait PortEventHandler: Send + Sync {
    fn handle(
        &self,
        resource: ResourceKind,
        event: EventType,
        trigger: &str,
        before: Option<&serde_json::Value>,
        after: Option<&serde_json::Value>,
    ) -> NotifyResult<Option<EventKind>>;
}

fn parse(raw: Option<&serde_json::Value>, which: &'static str) -> NotifyResult<PortRecord> {
    let raw = raw.ok_or(CoreError::MissingRecord(which))?;
    Ok(PortRecord::from_value(raw)?)
}

/// Parse and classify one raw callback without side effects.
///
/// Keys outside [`SUBSCRIPTIONS`] yield `Ok(None)`. Deletions only read the
/// post-change record, so a missing "before" body is tolerated there.
pub fn classify_raw(
    filter: &TransitionFilter,
    resource: ResourceKind,
    event: EventType,
    before: Option<&serde_json::Value>,
    after: Option<&serde_json::Value>,
) -> NotifyResult<Option<Classified>> {
    match (resource, event) {
        (ResourceKind::Port, EventType::AfterUpdate) => {
            let before = parse(before, "before")?;
            let after = parse(after, "after")?;
            Ok(filter.classify_update(&before, &after))
        }
        (ResourceKind::Port, EventType::AfterDelete) => {
            let after = parse(after, "after")?;
            let before = match before {
                Some(_) => parse(before, "before")?,
                None => after.clone(),
            };
            Ok(filter.classify_delete(&before, &after))
        }
        _ => Ok(None),
    }
}

/// One callback as carried over a JSON transport (one object per line).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortEvent {
    pub resource: ResourceKind,
    pub event: EventType,
    #[serde(default)]
    pub trigger: String,
    #[serde(default)]
    pub original_port: Option<serde_json::Value>,
    #[serde(default)]
    pub port: Option<serde_json::Value>,
}

impl PortEvent {
    pub fn dispatch(&self, handler: &dyn PortEventHandler) -> NotifyResult<Option<EventKind>> {
        handler.handle(self.resource, self.event, &self.trigger, self.original_port.as_ref(), self.port.as_ref())
    }
}

/// Filter + queue + flush timer, wired together.
pub struct Notifier {
    filter: TransitionFilter,
    queue: Arc<BatchQueue>,
    scheduler: FlushScheduler,
    handle: Mutex<Option<FlushHandle>>,
}

impl Notifier {
    /// Build the notifier and start its flush timer. Must run inside a tokio runtime.
    pub fn start(cfg: NotifierConfig, sink: Arc<dyn Sink>) -> Self {
        let queue = Arc::new(BatchQueue::new());
        let scheduler = FlushScheduler::new(Arc::clone(&queue), sink, cfg.send_events_interval);
        let handle = scheduler.spawn();
        info!(vnic_type = %cfg.vnic_type, interval_ms = scheduler.interval().as_millis() as u64, "notifier started");
        Self { filter: TransitionFilter::new(cfg.vnic_type), queue, scheduler, handle: Mutex::new(Some(handle)) }
    }

    pub fn subscriptions() -> &'static [(ResourceKind, EventType)] { &SUBSCRIPTIONS }

    pub fn on_update(&self, before: &PortRecord, after: &PortRecord) -> Option<EventKind> {
        self.accept(self.filter.classify_update(before, after))
    }

    pub fn on_delete(&self, before: &PortRecord, after: &PortRecord) -> Option<EventKind> {
        self.accept(self.filter.classify_delete(before, after))
    }

    fn accept(&self, classified: Option<Classified>) -> Option<EventKind> {
        let Classified { kind, record } = classified?;
        debug!(kind = %kind, port = record.payload().port_id(), device = record.identifier(), "queueing event");
        self.queue.enqueue(record);
        Some(kind)
    }

    pub fn pending(&self) -> usize { self.queue.len() }

    pub fn state(&self) -> SchedulerState { self.scheduler.state() }

    /// Stop the timer, then make one last attempt to deliver what is queued.
    /// Does not wait for a flush the timer already started.
    pub async fn shutdown(&self) -> FlushOutcome {
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
        let outcome = self.scheduler.flush_once().await;
        match &outcome {
            FlushOutcome::Busy => warn!(pending = self.queue.len(), "flush in progress at shutdown; leaving queue"),
            other => info!(outcome = ?other, "notifier stopped"),
        }
        outcome
    }

    /// Deliver whatever is queued, waiting up to `wait` for an in-flight
    /// timer flush to release the sink. Returns `Busy` if it never did.
    pub async fn flush_pending(&self, wait: Duration) -> FlushOutcome {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match self.scheduler.flush_once().await {
                FlushOutcome::Busy if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(FLUSH_RETRY_PAUSE).await;
                }
                outcome => return outcome,
            }
        }
    }
}

impl PortEventHandler for Notifier {
    fn handle(
        &self,
        resource: ResourceKind,
        event: EventType,
        trigger: &str,
        before: Option<&serde_json::Value>,
        after: Option<&serde_json::Value>,
    ) -> NotifyResult<Option<EventKind>> {
        match classify_raw(&self.filter, resource, event, before, after) {
            Ok(classified) => Ok(self.accept(classified)),
            Err(e) => {
                counter!("bmnotify_malformed_total", 1);
                warn!(?resource, ?event, trigger, error = %e, "rejecting malformed callback");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(status: &str, vnic: &str) -> serde_json::Value {
        serde_json::json!({
            "id": "p1",
            "device_id": "n1",
            "mac_address": "52:54:00:00:00:01",
            "status": status,
            "binding:vnic_type": vnic,
        })
    }

    #[test]
    fn classify_raw_ignores_other_keys() {
        let f = TransitionFilter::default();
        let b = raw("ACTIVE", "baremetal");
        let a = raw("DOWN", "baremetal");
        let got = classify_raw(&f, ResourceKind::Port, EventType::AfterCreate, Some(&b), Some(&a)).unwrap();
        assert!(got.is_none());
        let got = classify_raw(&f, ResourceKind::Other, EventType::AfterUpdate, Some(&b), Some(&a)).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn update_without_before_is_malformed() {
        let f = TransitionFilter::default();
        let a = raw("DOWN", "baremetal");
        let err = classify_raw(&f, ResourceKind::Port, EventType::AfterUpdate, None, Some(&a)).unwrap_err();
        assert!(matches!(err, NotifyError::Malformed(CoreError::MissingRecord("before"))));
    }

    #[test]
    fn delete_tolerates_missing_before() {
        let f = TransitionFilter::default();
        let a = raw("ACTIVE", "baremetal");
        let got = classify_raw(&f, ResourceKind::Port, EventType::AfterDelete, None, Some(&a)).unwrap().unwrap();
        assert_eq!(got.kind, EventKind::Delete);
    }

    #[test]
    fn envelope_parses_unknown_tags_as_other() {
        let ev: PortEvent = serde_json::from_str(r#"{"resource":"network","event":"before_update"}"#).unwrap();
        assert_eq!(ev.resource, ResourceKind::Other);
        assert_eq!(ev.event, EventType::Other);
        assert!(ev.port.is_none());
    }

    #[test]
    fn subscriptions_cover_update_and_delete() {
        let subs = Notifier::subscriptions();
        assert!(subs.contains(&(ResourceKind::Port, EventType::AfterUpdate)));
        assert!(subs.contains(&(ResourceKind::Port, EventType::AfterDelete)));
        assert_eq!(subs.len(), 2);
    }
}
