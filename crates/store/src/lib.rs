//! bmnotify store: batch queue and the timer that flushes it into a sink.

#![forbid(unsafe_code)]

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bmnotify_core::{EventRecord, Sink, SinkError};
use futures::FutureExt;
use metrics::{counter, gauge, histogram};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Smallest period the scheduler will tick at.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Append-only accumulator shared by all handler callers.
///
/// `drain_all` swaps the contents out under the same lock `enqueue` takes, so
/// every record ends up in exactly one drain.
#[derive(Debug, Default)]
pub struct BatchQueue {
    items: Mutex<Vec<EventRecord>>,
}

impl BatchQueue {
    pub fn new() -> Self { Self::default() }

    pub fn enqueue(&self, ev: EventRecord) {
        let depth = {
            let mut items = self.lock();
            items.push(ev);
            items.len()
        };
        counter!("bmnotify_queue_enqueued_total", 1);
        gauge!("bmnotify_queue_depth", depth as f64);
    }

    /// Take everything queued so far, leaving the queue empty.
    pub fn drain_all(&self) -> Vec<EventRecord> {
        let out = std::mem::take(&mut *self.lock());
        gauge!("bmnotify_queue_depth", 0.0);
        out
    }

    pub fn len(&self) -> usize { self.lock().len() }
    pub fn is_empty(&self) -> bool { self.lock().is_empty() }

    // A panic while holding the lock cannot leave a half-pushed Vec behind, so
    // the data is still valid after poisoning.
    fn lock(&self) -> MutexGuard<'_, Vec<EventRecord>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Flushing,
}

/// Result of one drain + submit attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing queued; the sink was not called.
    Empty,
    /// Another flush was running; nothing was drained.
    Busy,
    Delivered(usize),
    /// The sink failed; the batch is gone.
    Failed { size: usize, error: SinkError },
}

struct Shared {
    queue: Arc<BatchQueue>,
    sink: Arc<dyn Sink>,
    flushing: AtomicBool,
}

/// Clears the flushing flag when the flush that set it ends, however it ends.
struct FlushGuard(Arc<Shared>);

impl Drop for FlushGuard {
    fn drop(&mut self) { self.0.flushing.store(false, Ordering::Release); }
}

fn try_begin(shared: &Arc<Shared>) -> Option<FlushGuard> {
    shared
        .flushing
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .ok()
        .map(|_| FlushGuard(Arc::clone(shared)))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Submit one non-empty batch. Panics inside the sink are reported as a failure.
async fn deliver(sink: &dyn Sink, batch: Vec<EventRecord>) -> FlushOutcome {
    let size = batch.len();
    let batch_id = Uuid::new_v4();
    let span = info_span!("flush", %batch_id, size, sink = sink.name());
    async move {
        let started = Instant::now();
        histogram!("bmnotify_batch_size", size as f64);
        let res = match AssertUnwindSafe(sink.submit(batch)).catch_unwind().await {
            Ok(res) => res,
            Err(panic) => Err(SinkError::Panicked(panic_message(panic.as_ref()))),
        };
        histogram!("bmnotify_flush_ms", started.elapsed().as_secs_f64() * 1000.0);
        match res {
            Ok(()) => {
                counter!("bmnotify_flush_total", 1);
                info!("batch delivered");
                FlushOutcome::Delivered(size)
            }
            Err(error) => {
                counter!("bmnotify_flush_failures_total", 1);
                warn!(error = %error, "sink failed; dropping batch");
                FlushOutcome::Failed { size, error }
            }
        }
    }
    .instrument(span)
    .await
}

/// Periodically drains a [`BatchQueue`] into a [`Sink`], one flush at a time.
#[derive(Clone)]
pub struct FlushScheduler {
    shared: Arc<Shared>,
    interval: Duration,
}

impl FlushScheduler {
    /// A zero interval is raised to [`MIN_INTERVAL`].
    pub fn new(queue: Arc<BatchQueue>, sink: Arc<dyn Sink>, interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared { queue, sink, flushing: AtomicBool::new(false) }),
            interval: interval.max(MIN_INTERVAL),
        }
    }

    pub fn interval(&self) -> Duration { self.interval }

    pub fn state(&self) -> SchedulerState {
        if self.shared.flushing.load(Ordering::Acquire) { SchedulerState::Flushing } else { SchedulerState::Idle }
    }

    /// Drain and submit on the caller's task. Returns `Busy` instead of
    /// overlapping a flush that is already running.
    pub async fn flush_once(&self) -> FlushOutcome {
        let Some(_guard) = try_begin(&self.shared) else {
            return FlushOutcome::Busy;
        };
        let batch = self.shared.queue.drain_all();
        if batch.is_empty() {
            return FlushOutcome::Empty;
        }
        deliver(self.shared.sink.as_ref(), batch).await
    }

    fn on_tick(&self) {
        let Some(guard) = try_begin(&self.shared) else {
            counter!("bmnotify_flush_skipped_total", 1);
            debug!("previous flush still running; skipping tick");
            return;
        };
        let batch = self.shared.queue.drain_all();
        if batch.is_empty() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        // The flush runs detached so the tick loop never waits on the sink.
        tokio::spawn(async move {
            let _guard = guard;
            deliver(shared.sink.as_ref(), batch).await;
        });
    }

    /// Start the tick loop on the current runtime.
    pub fn spawn(&self) -> FlushHandle {
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let me = self.clone();
        let join = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + me.interval;
            let mut ticker = tokio::time::interval_at(start, me.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_ms = me.interval.as_millis() as u64, sink = me.shared.sink.name(), "flush scheduler started");
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => break,
                    _ = ticker.tick() => me.on_tick(),
                }
            }
            info!(pending = me.shared.queue.len(), "flush scheduler stopped");
        });
        FlushHandle { cancel: Some(cancel_tx), join: Some(join), scheduler: self.clone() }
    }
}

/// Owner of a running tick loop. Dropping it stops the loop.
pub struct FlushHandle {
    cancel: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
    scheduler: FlushScheduler,
}

impl FlushHandle {
    pub fn state(&self) -> SchedulerState { self.scheduler.state() }

    /// Stop ticking. Returns once the loop has exited; an in-flight flush is
    /// left to finish on its own.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                warn!(error = %e, "flush scheduler task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bmnotify_core::{EventStatus, PortRecord, PortStatus};

    fn ev(n: usize) -> EventRecord {
        let port = PortRecord {
            id: format!("port-{}", n),
            device_id: "node".into(),
            mac_address: "52:54:00:00:00:01".into(),
            status: PortStatus::Down,
            vnic_type: "baremetal".into(),
        };
        EventRecord::network(&port, EventStatus::Down)
    }

    #[test]
    fn drain_twice_returns_empty_second_time() {
        let q = BatchQueue::new();
        q.enqueue(ev(1));
        q.enqueue(ev(2));
        let first = q.drain_all();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].payload().port_id(), "port-1");
        assert_eq!(first[1].payload().port_id(), "port-2");
        assert!(q.drain_all().is_empty());
        assert!(q.is_empty());
    }

    #[test]
    fn zero_interval_is_clamped() {
        let sink = Arc::new(bmnotify_sink::RecordingSink::new());
        let s = FlushScheduler::new(Arc::new(BatchQueue::new()), sink, Duration::ZERO);
        assert_eq!(s.interval(), MIN_INTERVAL);
        assert_eq!(s.state(), SchedulerState::Idle);
    }

    #[test]
    fn panic_message_extracts_text() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic payload");
    }
}
