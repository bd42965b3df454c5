#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use bmnotify_core::{EventRecord, EventStatus, PortRecord, PortStatus, Sink, SinkError};
use bmnotify_sink::RecordingSink;
use bmnotify_store::{BatchQueue, FlushOutcome, FlushScheduler, SchedulerState};

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

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_ticks_never_call_the_sink() {
    let q = Arc::new(BatchQueue::new());
    let sink = Arc::new(RecordingSink::new());
    let handle = FlushScheduler::new(q, sink.clone(), Duration::from_millis(5)).spawn();
    tokio::time::sleep(Duration::from_millis(60)).await;
    handle.shutdown().await;
    assert_eq!(sink.calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn events_between_ticks_form_one_batch_in_order() {
    let q = Arc::new(BatchQueue::new());
    let sink = Arc::new(RecordingSink::new());
    let handle = FlushScheduler::new(Arc::clone(&q), sink.clone(), Duration::from_millis(50)).spawn();
    for i in 0..3 { q.enqueue(ev(i)); }
    assert!(sink.wait_for_calls(1, Duration::from_secs(2)).await);
    handle.shutdown().await;

    let batches = sink.batches();
    assert_eq!(batches.len(), 1);
    let ids: Vec<_> = batches[0].iter().map(|e| e.payload().port_id().to_string()).collect();
    assert_eq!(ids, vec!["port-0", "port-1", "port-2"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_sink_skips_ticks_without_losing_events() {
    let q = Arc::new(BatchQueue::new());
    let sink = Arc::new(RecordingSink::new().with_delay(Duration::from_millis(80)));
    let sched = FlushScheduler::new(Arc::clone(&q), sink.clone(), Duration::from_millis(10));
    let handle = sched.spawn();

    let started = Instant::now();
    let mut n = 0;
    while started.elapsed() < Duration::from_millis(400) {
        q.enqueue(ev(n));
        n += 1;
        tokio::time::sleep(Duration::from_millis(3)).await;
    }

    let deadline = Instant::now() + Duration::from_secs(3);
    while !(q.is_empty() && sched.state() == SchedulerState::Idle) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let elapsed_ms = started.elapsed().as_millis() as usize;
    handle.shutdown().await;

    assert!(q.is_empty());
    assert_eq!(sched.state(), SchedulerState::Idle);
    assert_eq!(sink.max_concurrent(), 1);

    let mut ids: Vec<String> =
        sink.batches().iter().flatten().map(|e| e.payload().port_id().to_string()).collect();
    assert_eq!(ids.len(), n, "every queued event delivered");
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), n, "no event delivered twice");

    // Ticks during an 80ms submit are skipped rather than queued up.
    assert!(sink.calls() <= elapsed_ms / 80 + 1, "calls={} elapsed_ms={}", sink.calls(), elapsed_ms);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_the_handle_stops_the_loop() {
    let q = Arc::new(BatchQueue::new());
    let sink = Arc::new(RecordingSink::new());
    let handle = FlushScheduler::new(Arc::clone(&q), sink.clone(), Duration::from_millis(10)).spawn();
    drop(handle);

    // give the loop a moment to observe the closed channel
    tokio::time::sleep(Duration::from_millis(20)).await;
    q.enqueue(ev(1));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(sink.calls(), 0);
    assert_eq!(q.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_batch_is_dropped_and_next_one_flows() {
    let q = Arc::new(BatchQueue::new());
    let sink = Arc::new(RecordingSink::new());
    let sched = FlushScheduler::new(Arc::clone(&q), sink.clone(), Duration::from_secs(3600));

    sink.set_failing(true);
    q.enqueue(ev(1));
    match sched.flush_once().await {
        FlushOutcome::Failed { size, .. } => assert_eq!(size, 1),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(q.is_empty(), "failed batch is not requeued");

    sink.set_failing(false);
    q.enqueue(ev(2));
    assert_eq!(sched.flush_once().await, FlushOutcome::Delivered(1));
    assert_eq!(sched.flush_once().await, FlushOutcome::Empty);
    assert_eq!(sink.calls(), 2);
}

struct PanickyOnce {
    inner: RecordingSink,
    tripped: std::sync::atomic::AtomicBool,
}

#[async_trait::async_trait]
impl Sink for PanickyOnce {
    async fn submit(&self, events: Vec<EventRecord>) -> Result<(), SinkError> {
        if !self.tripped.swap(true, std::sync::atomic::Ordering::SeqCst) {
            panic!("sink exploded");
        }
        self.inner.submit(events).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_flush_does_not_stop_the_loop() {
    let q = Arc::new(BatchQueue::new());
    let sink = Arc::new(PanickyOnce { inner: RecordingSink::new(), tripped: Default::default() });
    let handle = FlushScheduler::new(Arc::clone(&q), sink.clone(), Duration::from_millis(20)).spawn();

    q.enqueue(ev(1));
    tokio::time::sleep(Duration::from_millis(100)).await;
    q.enqueue(ev(2));
    assert!(sink.inner.wait_for_calls(1, Duration::from_secs(2)).await);
    handle.shutdown().await;

    let batches = sink.inner.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0][0].payload().port_id(), "port-2");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_does_not_wait_for_a_hanging_sink() {
    let q = Arc::new(BatchQueue::new());
    let sink = Arc::new(RecordingSink::new().with_delay(Duration::from_secs(30)));
    let sched = FlushScheduler::new(Arc::clone(&q), sink.clone(), Duration::from_millis(10));
    let handle = sched.spawn();

    q.enqueue(ev(1));
    let deadline = Instant::now() + Duration::from_secs(2);
    while sched.state() != SchedulerState::Flushing && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(sched.state(), SchedulerState::Flushing);
    assert_eq!(sched.flush_once().await, FlushOutcome::Busy);

    let stopped = tokio::time::timeout(Duration::from_millis(500), handle.shutdown()).await;
    assert!(stopped.is_ok(), "shutdown must not block on the sink");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_interrupts_a_long_interval() {
    let q = Arc::new(BatchQueue::new());
    let sink = Arc::new(RecordingSink::new());
    let handle = FlushScheduler::new(q, sink, Duration::from_secs(3600)).spawn();
    let stopped = tokio::time::timeout(Duration::from_millis(500), handle.shutdown()).await;
    assert!(stopped.is_ok());
}
