use cojson_storage::{
    EraseFn, EraseRun, EraserConfig, EraserScheduler, EraserState, LocalStorage, MemoryClient,
    StorageApi,
};
use futures::FutureExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ── Helpers ──────────────────────────────────────────────────────

/// Counts runs and the most runs ever in flight at once. Each run takes
/// 100ms and reports more work while `more_runs` is positive.
struct Probe {
    runs: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    more_runs: AtomicUsize,
}

impl Probe {
    fn new(more_runs: usize) -> Arc<Self> {
        Arc::new(Self {
            runs: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            more_runs: AtomicUsize::new(more_runs),
        })
    }

    fn run_fn(self: &Arc<Self>) -> EraseFn {
        let probe = Arc::clone(self);
        Arc::new(move |_cancel| {
            let probe = Arc::clone(&probe);
            async move {
                probe.runs.fetch_add(1, Ordering::SeqCst);
                let now = probe.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                probe.max_in_flight.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                probe.in_flight.fetch_sub(1, Ordering::SeqCst);
                let has_more = probe
                    .more_runs
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                Ok(EraseRun { erased: 1, has_more })
            }
            .boxed()
        })
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

// ── Scheduling ──────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn enqueues_while_scheduled_coalesce_into_one_run() {
    let probe = Probe::new(0);
    let eraser = EraserScheduler::new(EraserConfig::default(), probe.run_fn());

    eraser.on_enqueue();
    eraser.on_enqueue();
    eraser.on_enqueue();
    assert_eq!(eraser.state(), EraserState::ThrottleScheduled);

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(probe.runs(), 0);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(probe.runs(), 1);
    assert_eq!(eraser.state(), EraserState::Idle);
}

#[tokio::test(start_paused = true)]
async fn has_more_schedules_follow_ups_without_overlap() {
    let probe = Probe::new(2);
    let eraser = EraserScheduler::new(EraserConfig::default(), probe.run_fn());

    eraser.start();
    assert_eq!(eraser.state(), EraserState::StartupScheduled);

    tokio::time::sleep(Duration::from_millis(1050)).await;
    assert_eq!(eraser.state(), EraserState::Running);
    // ignored while running
    eraser.on_enqueue();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(probe.runs(), 3);
    assert_eq!(probe.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(eraser.state(), EraserState::Idle);
}

#[tokio::test(start_paused = true)]
async fn failed_run_returns_to_idle() {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let run: EraseFn = Arc::new(move |_cancel| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err(cojson_storage::StorageError::WorkerClosed) }.boxed()
    });
    let eraser = EraserScheduler::new(EraserConfig::default(), run);

    eraser.start();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(eraser.state(), EraserState::Idle);

    eraser.on_enqueue();
    assert_eq!(eraser.state(), EraserState::ThrottleScheduled);
}

#[tokio::test(start_paused = true)]
async fn dispose_cancels_pending_and_ignores_later_calls() {
    let probe = Probe::new(0);
    let eraser = EraserScheduler::new(EraserConfig::default(), probe.run_fn());

    eraser.start();
    eraser.dispose();
    assert_eq!(eraser.state(), EraserState::Disposed);

    eraser.on_enqueue();
    eraser.start();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(probe.runs(), 0);
    assert_eq!(eraser.state(), EraserState::Disposed);
}

#[tokio::test(start_paused = true)]
async fn dispose_during_run_cancels_its_token() {
    let cancelled = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&cancelled);
    let run: EraseFn = Arc::new(move |cancel| {
        let seen = Arc::clone(&seen);
        async move {
            cancel.cancelled().await;
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(EraseRun { erased: 0, has_more: true })
        }
        .boxed()
    });
    let eraser = EraserScheduler::new(EraserConfig::default(), run);

    eraser.start();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(eraser.state(), EraserState::Running);

    eraser.dispose();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    assert_eq!(eraser.state(), EraserState::Disposed);
}

// ── With storage ────────────────────────────────────────────────

#[tokio::test]
async fn for_storage_runs_against_the_erase_queue() {
    let storage: Arc<dyn StorageApi> = Arc::new(LocalStorage::new(MemoryClient::new()));
    let config = EraserConfig {
        startup_delay: Duration::from_millis(10),
        ..EraserConfig::default()
    };
    let eraser = EraserScheduler::for_storage(Arc::clone(&storage), config);

    eraser.start();
    for _ in 0..100 {
        if eraser.state() == EraserState::Idle {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(eraser.state(), EraserState::Idle);
    eraser.dispose();
}
