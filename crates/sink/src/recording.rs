use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bmnotify_core::{EventRecord, Sink, SinkError};
use tokio::sync::Notify;

/// In-memory sink that records every submitted batch.
///
/// Can be slowed down or made to fail to exercise the scheduler. Tracks the
/// highest number of overlapping `submit` calls it has seen.
#[derive(Debug, Default)]
pub struct RecordingSink {
    batches: Mutex<Vec<Vec<EventRecord>>>,
    delay: Option<Duration>,
    fail: AtomicBool,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    notify: Notify,
}

impl RecordingSink {
    pub fn new() -> Self { Self::default() }

    /// Every submit sleeps for `delay` before completing.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make subsequent submits fail (the batch is still recorded).
    pub fn set_failing(&self, on: bool) { self.fail.store(on, Ordering::SeqCst); }

    pub fn batches(&self) -> Vec<Vec<EventRecord>> { self.lock().clone() }
    pub fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
    pub fn max_concurrent(&self) -> usize { self.max_in_flight.load(Ordering::SeqCst) }

    /// Wait until at least `n` submits have completed, or `timeout` passes.
    pub async fn wait_for_calls(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if self.calls() >= n {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.calls() >= n;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Vec<EventRecord>>> {
        self.batches.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl Sink for RecordingSink {
    async fn submit(&self, events: Vec<EventRecord>) -> Result<(), SinkError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        self.lock().push(events);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
        if self.fail.load(Ordering::SeqCst) {
            return Err(SinkError::Rejected { status: 503, body: "recording sink set to fail".into() });
        }
        Ok(())
    }

    fn name(&self) -> &str { "recording" }
}
