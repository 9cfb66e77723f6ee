//! Periodic eviction of expired state.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::counter::WindowCounterStore;
use super::penalty::PenaltyEngine;

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_windows: usize,
    pub expired_penalties: usize,
    pub decayed_scores: usize,
    pub removed_scores: usize,
}

impl SweepReport {
    pub fn evicted(&self) -> usize {
        self.expired_windows + self.expired_penalties + self.removed_scores
    }
}

struct Running {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Evicts expired windows and penalties and decays suspicion scores on a
/// fixed interval.
///
/// Each record is removed under its own shard lock, so a sweep never
/// stalls request evaluation for longer than a single removal.
pub struct Sweeper {
    store: Arc<WindowCounterStore>,
    penalties: Arc<PenaltyEngine>,
    interval: Duration,
    decay_step: u32,
    running: Mutex<Option<Running>>,
}

impl Sweeper {
    pub fn new(
        store: Arc<WindowCounterStore>,
        penalties: Arc<PenaltyEngine>,
        interval: Duration,
        decay_step: u32,
    ) -> Self {
        Self {
            store,
            penalties,
            interval,
            decay_step,
            running: Mutex::new(None),
        }
    }

    /// Run one sweep now.
    pub fn sweep(&self) -> SweepReport {
        let expired_windows = self.store.sweep_expired();
        let expired_penalties = self.penalties.sweep_expired();
        let decay = self.penalties.decay(self.decay_step);

        let report = SweepReport {
            expired_windows,
            expired_penalties,
            decayed_scores: decay.decayed,
            removed_scores: decay.removed,
        };

        if report.evicted() > 0 {
            info!(
                windows = report.expired_windows,
                penalties = report.expired_penalties,
                scores = report.removed_scores,
                "Swept expired admission state"
            );
        } else {
            debug!(decayed = report.decayed_scores, "Sweep found nothing to evict");
        }

        report
    }

    /// Start the background task. Returns `false` if it is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut running = self.running.lock();
        if running.is_some() {
            return false;
        }

        let (stop, mut stopped) = watch::channel(false);
        let sweeper = Arc::clone(self);
        let period = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        sweeper.sweep();
                    }
                    _ = stopped.changed() => {
                        debug!("Sweeper received stop signal");
                        break;
                    }
                }
            }
        });

        info!(interval_ms = period.as_millis() as u64, "Sweeper started");
        *running = Some(Running { stop, handle });
        true
    }

    /// Stop the background task and wait for it to exit.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(Running { stop, handle }) = running else {
            return;
        };

        let _ = stop.send(true);
        if let Err(e) = handle.await {
            if !e.is_cancelled() {
                tracing::error!(error = %e, "Sweeper task failed");
            }
        }
        info!("Sweeper stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}
