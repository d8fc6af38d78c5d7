//! Wake-on-next-report-time scheduling.
//!
//! `ReportScheduler` is either idle or armed for the earliest known due
//! time. It only ever moves earlier until it fires; after firing the timer
//! task asks storage for the authoritative next time and re-arms from that.

use crate::clock::Clock;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct SchedulerState {
    armed: Option<DateTime<Utc>>,
    offline: bool,
}

#[derive(Default)]
pub struct ReportScheduler {
    state: Mutex<SchedulerState>,
    changed: Notify,
}

impl ReportScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms for `candidate` when it is earlier than the armed time. A `None`
    /// candidate, a later candidate, or being offline leaves things as they are.
    pub fn maybe_set(&self, candidate: Option<DateTime<Utc>>) -> bool {
        let Some(candidate) = candidate else {
            return false;
        };
        {
            let mut state = self.state.lock();
            if state.offline || state.armed.is_some_and(|armed| armed <= candidate) {
                return false;
            }
            state.armed = Some(candidate);
        }
        log::debug!("[SCHEDULER] Armed for {}", candidate);
        self.changed.notify_one();
        true
    }

    pub fn armed_time(&self) -> Option<DateTime<Utc>> {
        self.state.lock().armed
    }

    pub fn is_offline(&self) -> bool {
        self.state.lock().offline
    }

    /// Records connectivity and returns the previous offline flag. Going
    /// offline disarms the timer.
    pub fn set_offline(&self, offline: bool) -> bool {
        let was_offline = {
            let mut state = self.state.lock();
            let was_offline = state.offline;
            state.offline = offline;
            if offline {
                state.armed = None;
            }
            was_offline
        };
        if offline {
            self.changed.notify_one();
        }
        was_offline
    }

    /// Goes idle if the armed time has been reached.
    fn fire_if_due(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock();
        match state.armed {
            Some(armed) if armed <= now => {
                state.armed = None;
                true
            }
            _ => false,
        }
    }
}

/// Timer loop. `on_fire` runs once per elapsed armed time and yields the
/// next report time to arm for; returning `None` from `on_fire` itself
/// means the engine is gone and the loop exits.
pub async fn run_timer<F, Fut>(
    scheduler: Arc<ReportScheduler>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    mut on_fire: F,
) where
    F: FnMut(DateTime<Utc>) -> Option<Fut> + Send,
    Fut: Future<Output = Option<DateTime<Utc>>> + Send,
{
    log::debug!("[SCHEDULER] Timer task started");
    loop {
        let armed = scheduler.armed_time();
        let sleep = async {
            match armed {
                Some(deadline) => clock.sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = scheduler.changed.notified() => continue,
            _ = sleep => {
                let now = clock.now();
                if !scheduler.fire_if_due(now) {
                    continue;
                }
                log::debug!("[SCHEDULER] Reporting time reached at {}", now);
                let Some(fired) = on_fire(now) else {
                    break;
                };
                let next = fired.await;
                scheduler.maybe_set(next);
            }
        }
    }
    log::debug!("[SCHEDULER] Timer task stopped");
}
