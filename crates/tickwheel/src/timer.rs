//! Multi-level timer: wheel hierarchy, level routing, and the tick driver.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::TimerConfig;
use crate::entry::{AtomicStatus, Entry, EntryHandle, Job, Mode, Status};
use crate::error::{Result, TimerError};
use crate::wheel::Wheel;

/// Point-in-time snapshot of one wheel level.
#[derive(Debug, Clone, Serialize)]
pub struct WheelStats {
    pub level: usize,
    pub tick_interval_ms: u64,
    pub total_span_ms: u64,
    pub ticks: u64,
    /// Entries resident across the level's slots, including the internal
    /// level-driver entry (one per level above the base).
    pub pending: usize,
}

/// Point-in-time snapshot of a timer.
#[derive(Debug, Clone, Serialize)]
pub struct TimerStats {
    pub status: Status,
    pub levels: Vec<WheelStats>,
}

/// Shared state behind every [`Timer`] clone.
pub(crate) struct TimerCore {
    wheels: Vec<Arc<Wheel>>,
    /// Ready = running, Stopped = paused, Closed = terminal. The Running
    /// variant is unused at timer scope.
    status: AtomicStatus,
    /// All internal times are milliseconds elapsed since this instant.
    /// `tokio::time::Instant` so paused test clocks are honoured.
    epoch: Instant,
    base_tick_ms: u64,
    next_entry_id: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl TimerCore {
    pub(crate) fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Binary search for the level whose tick interval best matches the
    /// requested interval (`tick <= interval < span`). Intervals shorter than
    /// the finest tick round down to level 0; intervals beyond the coarsest
    /// span stay at the top level and park there until demotion.
    fn level_for(&self, interval_ms: u64) -> usize {
        let idx = self
            .wheels
            .partition_point(|wheel| wheel.tick_interval_ms() <= interval_ms);
        idx.saturating_sub(1)
    }

    fn add_entry(&self, interval: Duration, job: Job, mode: Mode, times: i64) -> Result<EntryHandle> {
        if self.status.load() == Status::Closed {
            return Err(TimerError::Closed);
        }
        let interval_ms = interval.as_millis() as u64;
        let id = self.next_entry_id.fetch_add(1, Ordering::SeqCst);
        let entry = Arc::new(Entry::new(id, job, mode, times, interval_ms));
        let now_ms = self.now_ms();
        let level = self.level_for(interval_ms);
        self.wheels[level].install(&entry, interval_ms, now_ms, now_ms);
        debug!(entry_id = id, %mode, interval_ms, level, "entry registered");
        Ok(EntryHandle::new(entry))
    }

    /// Hands an entry whose due time is still `remaining_ms` away to the
    /// level that can represent that leftover most precisely.
    pub(crate) fn rehome(&self, entry: &Arc<Entry>, remaining_ms: u64, now_ms: u64) {
        if self.status.load() == Status::Closed {
            return;
        }
        let level = self.level_for(remaining_ms);
        self.wheels[level].install(entry, remaining_ms, now_ms, now_ms);
    }

    /// Re-installs a recurring entry for its next period, routed by the raw
    /// interval and anchored at the previous due time so dispatch latency
    /// does not accumulate as period drift. After a long pause (stopped
    /// entry resumed late) the anchor snaps to now instead, so the missed
    /// windows are not replayed as a burst.
    pub(crate) fn reinstall_after_fire(&self, entry: &Arc<Entry>, now_ms: u64) {
        if self.status.load() == Status::Closed {
            return;
        }
        let raw_ms = entry.raw_interval_ms();
        let previous_due = entry.due_ms();
        let anchor_ms = if previous_due.saturating_add(raw_ms) > now_ms {
            previous_due
        } else {
            now_ms
        };
        let level = self.level_for(raw_ms);
        self.wheels[level].install(entry, raw_ms, anchor_ms, now_ms);
    }
}

/// Hierarchical timing-wheel scheduler.
///
/// Cloning is cheap; all clones share one wheel hierarchy and one tick
/// driver. Construction spawns the driver task, so a `Timer` must be created
/// inside a Tokio runtime.
#[derive(Clone)]
pub struct Timer {
    core: Arc<TimerCore>,
}

impl Timer {
    /// Builds a timer from `config` and starts its level-0 tick driver.
    ///
    /// Level `i` has a tick interval equal to level `i - 1`'s total span;
    /// only level 0 owns a real time source. Every other level advances via
    /// an internal entry on the level below that fires once per rotation.
    pub fn new(config: TimerConfig) -> Result<Self> {
        config.validate()?;
        let base_tick_ms = config.tick_interval.as_millis() as u64;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let core = Arc::new_cyclic(|weak: &Weak<TimerCore>| {
            let mut wheels = Vec::with_capacity(config.level_count);
            let mut tick_ms = base_tick_ms;
            for level in 0..config.level_count {
                wheels.push(Arc::new(Wheel::new(
                    level,
                    config.slot_count,
                    tick_ms,
                    base_tick_ms,
                    Weak::clone(weak),
                )));
                tick_ms *= config.slot_count as u64;
            }
            TimerCore {
                wheels,
                status: AtomicStatus::new(Status::Ready),
                epoch: Instant::now(),
                base_tick_ms,
                next_entry_id: AtomicU64::new(1),
                shutdown: shutdown_tx,
            }
        });

        for level in 1..config.level_count {
            let weak = Arc::downgrade(&core);
            let job: Job = Arc::new(move || {
                let weak = Weak::clone(&weak);
                async move {
                    if let Some(core) = weak.upgrade() {
                        let now_ms = core.now_ms();
                        core.wheels[level].proceed(now_ms);
                    }
                }
                .boxed()
            });
            let id = core.next_entry_id.fetch_add(1, Ordering::SeqCst);
            let span_ms = core.wheels[level - 1].total_span_ms();
            let driver = Arc::new(Entry::new_pinned(id, job, span_ms));
            core.wheels[level - 1].install_pinned(&driver);
        }

        let weak = Arc::downgrade(&core);
        tokio::spawn(run_ticker(weak, config.tick_interval, shutdown_rx));

        info!(
            slot_count = config.slot_count,
            tick_ms = base_tick_ms,
            levels = config.level_count,
            "timer started"
        );
        Ok(Self { core })
    }

    /// Registers a job that repeats every `interval` indefinitely.
    pub fn add<F, Fut>(&self, interval: Duration, job: F) -> Result<EntryHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.core.add_entry(interval, boxed_job(job), Mode::Normal, 0)
    }

    /// Registers a repeating job that never overlaps a still-running
    /// invocation of itself. A window that arrives while the previous run is
    /// still executing is skipped, not queued.
    ///
    /// A singleton job that never completes leaves its entry in
    /// [`Status::Running`] forever; ensuring the body terminates (or times
    /// out) is the caller's responsibility.
    pub fn add_singleton<F, Fut>(&self, interval: Duration, job: F) -> Result<EntryHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.core
            .add_entry(interval, boxed_job(job), Mode::Singleton, 0)
    }

    /// Registers a job that fires exactly once after `interval`.
    pub fn add_once<F, Fut>(&self, interval: Duration, job: F) -> Result<EntryHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.core.add_entry(interval, boxed_job(job), Mode::Once, 0)
    }

    /// Registers a job that fires exactly `times` times, then closes.
    pub fn add_times<F, Fut>(&self, interval: Duration, times: i64, job: F) -> Result<EntryHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.core
            .add_entry(interval, boxed_job(job), Mode::Times, times)
    }

    /// Defers a recurring registration: after `delay`, the job becomes
    /// visible as if registered with [`add`](Self::add).
    pub fn delay_add<F, Fut>(&self, delay: Duration, interval: Duration, job: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.delay_register(delay, interval, boxed_job(job), Mode::Normal, 0)
    }

    /// Delayed variant of [`add_singleton`](Self::add_singleton).
    pub fn delay_add_singleton<F, Fut>(
        &self,
        delay: Duration,
        interval: Duration,
        job: F,
    ) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.delay_register(delay, interval, boxed_job(job), Mode::Singleton, 0)
    }

    /// Delayed variant of [`add_once`](Self::add_once).
    pub fn delay_add_once<F, Fut>(&self, delay: Duration, interval: Duration, job: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.delay_register(delay, interval, boxed_job(job), Mode::Once, 0)
    }

    /// Delayed variant of [`add_times`](Self::add_times).
    pub fn delay_add_times<F, Fut>(
        &self,
        delay: Duration,
        interval: Duration,
        times: i64,
        job: F,
    ) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.delay_register(delay, interval, boxed_job(job), Mode::Times, times)
    }

    fn delay_register(
        &self,
        delay: Duration,
        interval: Duration,
        job: Job,
        mode: Mode,
        times: i64,
    ) -> Result<()> {
        // Weak reference: an entry captured in its own timer's wheel must
        // not keep the timer alive.
        let weak = Arc::downgrade(&self.core);
        let register: Job = Arc::new(move || {
            let weak = Weak::clone(&weak);
            let job = Arc::clone(&job);
            async move {
                let Some(core) = weak.upgrade() else { return };
                if let Err(error) = core.add_entry(interval, job, mode, times) {
                    debug!(%error, "delayed registration dropped");
                }
            }
            .boxed()
        });
        self.core.add_entry(delay, register, Mode::Once, 0).map(|_| ())
    }

    /// Resumes a stopped timer. Ticks missed while stopped are not replayed.
    pub fn start(&self) {
        if self.core.status.compare_swap(Status::Stopped, Status::Ready) {
            info!("timer resumed");
        }
    }

    /// Pauses the timer: the level-0 pointer stops advancing, so no entry on
    /// any level fires until [`start`](Self::start).
    pub fn stop(&self) {
        if self.core.status.store_unless_closed(Status::Stopped) {
            info!("timer stopped");
        }
    }

    /// Closes the timer. Terminal: the tick driver exits and registration
    /// attempts fail with [`TimerError::Closed`].
    pub fn close(&self) {
        if self.core.status.store_unless_closed(Status::Closed) {
            let _ = self.core.shutdown.send(true);
            info!("timer closed");
        }
    }

    /// Current lifecycle state (`Ready` means running).
    #[must_use]
    pub fn status(&self) -> Status {
        self.core.status.load()
    }

    /// Snapshot of every level's counters for observability.
    #[must_use]
    pub fn stats(&self) -> TimerStats {
        TimerStats {
            status: self.core.status.load(),
            levels: self
                .core
                .wheels
                .iter()
                .map(|wheel| WheelStats {
                    level: wheel.level(),
                    tick_interval_ms: wheel.tick_interval_ms(),
                    total_span_ms: wheel.total_span_ms(),
                    ticks: wheel.ticks(),
                    pending: wheel.pending(),
                })
                .collect(),
        }
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("status", &self.core.status.load())
            .field("levels", &self.core.wheels.len())
            .field("base_tick_ms", &self.core.base_tick_ms)
            .finish()
    }
}

fn boxed_job<F, Fut>(job: F) -> Job
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move || job().boxed())
}

/// Level-0 tick loop: the only real time source in the hierarchy.
///
/// Holds a `Weak` so dropping the last `Timer` clone also retires the task.
async fn run_ticker(
    core: Weak<TimerCore>,
    tick: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(tick);
    // Late ticks are skipped rather than replayed in a burst.
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick of a tokio interval completes immediately.
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let Some(core) = core.upgrade() else { break };
                match core.status.load() {
                    Status::Closed => break,
                    Status::Stopped => {}
                    Status::Ready | Status::Running => {
                        let now_ms = core.now_ms();
                        core.wheels[0].proceed(now_ms);
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("timer tick driver exited");
}
