//! Background scheduling of deleted-value erasure.
//!
//! ```text
//!              start()                      timer
//!   Idle ───────────────► StartupScheduled ───────┐
//!    │  on_enqueue()                              ▼
//!    └────────────────► ThrottleScheduled ──► Running ──(has_more)──► FollowupScheduled
//!    ▲                                          │                         │
//!    └──────────────(done or error)─────────────┘◄──────────timer─────────┘
//!
//!   dispose() from any state ──► Disposed
//! ```

use crate::api::{EraseRun, StorageApi};
use crate::error::StorageResult;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Timing of the eraser.
#[derive(Debug, Clone)]
pub struct EraserConfig {
    /// Delay between an enqueue and the run it triggers.
    pub throttle: Duration,
    pub startup_delay: Duration,
    /// Delay before continuing a run that ran out of budget.
    pub follow_up_delay: Duration,
    /// Time budget handed to each run.
    pub run_budget: Duration,
}

impl Default for EraserConfig {
    fn default() -> Self {
        Self {
            throttle: Duration::from_secs(30),
            startup_delay: Duration::from_secs(1),
            follow_up_delay: Duration::from_secs(1),
            run_budget: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraserState {
    Idle,
    StartupScheduled,
    ThrottleScheduled,
    FollowupScheduled,
    Running,
    Disposed,
}

/// One erase run.
pub type EraseFn =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, StorageResult<EraseRun>> + Send + Sync>;

struct Inner {
    state: EraserState,
    timer: Option<CancellationToken>,
    running: Option<CancellationToken>,
}

struct Shared {
    config: EraserConfig,
    run: EraseFn,
    inner: Mutex<Inner>,
}

/// Runs erasure in the background without ever overlapping two runs.
///
/// Must be used from within a tokio runtime.
#[derive(Clone)]
pub struct EraserScheduler {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for EraserScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EraserScheduler")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl EraserScheduler {
    pub fn new(config: EraserConfig, run: EraseFn) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                run,
                inner: Mutex::new(Inner {
                    state: EraserState::Idle,
                    timer: None,
                    running: None,
                }),
            }),
        }
    }

    /// A scheduler that erases from `storage` with the configured budget.
    pub fn for_storage(storage: Arc<dyn StorageApi>, config: EraserConfig) -> Self {
        let budget = config.run_budget;
        let run: EraseFn = Arc::new(move |cancel| {
            let storage = Arc::clone(&storage);
            async move { storage.erase_deleted(budget, cancel).await }.boxed()
        });
        Self::new(config, run)
    }

    pub fn state(&self) -> EraserState {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// Schedules the first run after startup.
    pub fn start(&self) {
        self.schedule_if_idle(EraserState::StartupScheduled, self.shared.config.startup_delay);
    }

    /// Called when a value is queued for erasure.
    pub fn on_enqueue(&self) {
        self.schedule_if_idle(EraserState::ThrottleScheduled, self.shared.config.throttle);
    }

    /// Cancels the pending timer and any in-flight run. Terminal.
    pub fn dispose(&self) {
        let mut inner = self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = inner.timer.take() {
            timer.cancel();
        }
        if let Some(running) = inner.running.take() {
            running.cancel();
        }
        inner.state = EraserState::Disposed;
        debug!("eraser disposed");
    }

    fn schedule_if_idle(&self, next: EraserState, delay: Duration) {
        let mut inner = self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.state != EraserState::Idle {
            return;
        }
        Self::schedule(&self.shared, &mut inner, next, delay);
    }

    fn schedule(shared: &Arc<Shared>, inner: &mut Inner, next: EraserState, delay: Duration) {
        let timer = CancellationToken::new();
        inner.state = next;
        inner.timer = Some(timer.clone());
        debug!(state = ?next, ?delay, "eraser run scheduled");

        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            tokio::select! {
                () = timer.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            let cancel = {
                let mut inner = shared.inner.lock().unwrap_or_else(PoisonError::into_inner);
                if inner.state == EraserState::Disposed {
                    return;
                }
                let cancel = CancellationToken::new();
                inner.state = EraserState::Running;
                inner.timer = None;
                inner.running = Some(cancel.clone());
                cancel
            };

            let result = (shared.run)(cancel).await;

            let mut inner = shared.inner.lock().unwrap_or_else(PoisonError::into_inner);
            if inner.state == EraserState::Disposed {
                return;
            }
            inner.running = None;
            match result {
                Ok(run) if run.has_more => {
                    let delay = shared.config.follow_up_delay;
                    Self::schedule(&shared, &mut inner, EraserState::FollowupScheduled, delay);
                }
                Ok(run) => {
                    debug!(erased = run.erased, "eraser idle");
                    inner.state = EraserState::Idle;
                }
                Err(e) => {
                    error!(error = %e, "erase run failed");
                    inner.state = EraserState::Idle;
                }
            }
        });
    }
}
