//! Scheduled entries and their lifecycle state machine.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::Serialize;

/// Sentinel run count meaning "repeat forever".
///
/// The counter is decremented on every fire regardless of mode; when it decays
/// below [`SENTINEL_FLOOR`] it is refreshed back to this value, so an
/// unlimited entry can never run out by accident.
pub(crate) const UNLIMITED_RUNS: i64 = i64::MAX / 2;
const SENTINEL_FLOOR: i64 = UNLIMITED_RUNS / 2;

/// Zero-argument job body. Each invocation is dispatched as its own task.
pub(crate) type Job = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Run mode of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Repeats indefinitely.
    Normal,
    /// Repeats indefinitely but never overlaps a still-running invocation.
    Singleton,
    /// Fires exactly once, then closes.
    Once,
    /// Fires a fixed number of times, then closes.
    Times,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Singleton => write!(f, "singleton"),
            Self::Once => write!(f, "once"),
            Self::Times => write!(f, "times"),
        }
    }
}

/// Lifecycle state of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Scheduled and eligible to fire.
    Ready,
    /// A singleton invocation is currently executing.
    Running,
    /// Paused by the user; stays resident and can be resumed.
    Stopped,
    /// Terminal. The entry is dropped at its next evaluation.
    Closed,
}

impl Status {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Ready => 0,
            Self::Running => 1,
            Self::Stopped => 2,
            Self::Closed => 3,
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Ready,
            1 => Self::Running,
            2 => Self::Stopped,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Compare-and-swap cell holding a [`Status`].
///
/// All lifecycle transitions go through this cell so the tick path never
/// takes a lock around user job code.
pub(crate) struct AtomicStatus(AtomicU8);

impl AtomicStatus {
    pub(crate) fn new(status: Status) -> Self {
        Self(AtomicU8::new(status.as_u8()))
    }

    pub(crate) fn load(&self) -> Status {
        Status::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn store(&self, status: Status) {
        self.0.store(status.as_u8(), Ordering::SeqCst);
    }

    /// Attempts `from -> to`; returns whether the swap happened.
    pub(crate) fn compare_swap(&self, from: Status, to: Status) -> bool {
        self.0
            .compare_exchange(
                from.as_u8(),
                to.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Moves to `to` from any non-closed state. Closed is terminal. Returns
    /// whether the state actually changed.
    pub(crate) fn store_unless_closed(&self, to: Status) -> bool {
        let mut current = self.load();
        while current != Status::Closed && current != to {
            if self.compare_swap(current, to) {
                return true;
            }
            current = self.load();
        }
        false
    }
}

/// Outcome of the per-fire run-count accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunQuota {
    /// Quota already spent before this fire; the entry must not run.
    Exhausted,
    /// This fire consumes the last run.
    Final,
    /// Runs remain after this fire.
    More,
}

/// One scheduled job registration.
///
/// An entry is owned by exactly one wheel slot at any instant; every field
/// that changes after insertion is an atomic cell because the user-facing
/// [`EntryHandle`] and the drain pass touch the entry concurrently. Slot
/// topology itself is only ever rewritten inside a drain pass.
pub(crate) struct Entry {
    id: u64,
    job: Job,
    mode: Mode,
    /// Internal level-driver entries advance on pure tick cadence and are
    /// re-queued in place instead of re-routed through the timer.
    pinned: bool,
    status: AtomicStatus,
    remaining_runs: AtomicI64,
    /// Interval as originally requested, in milliseconds. Never changes;
    /// used to re-home the entry to its natural level after each fire.
    raw_interval_ms: u64,
    /// Target of the current scheduling leg in milliseconds. Equals
    /// `raw_interval_ms` on a home leg, or the leftover time after a
    /// cross-level demotion.
    interval_ms: AtomicU64,
    /// Current leg expressed in owning-wheel ticks.
    interval_ticks: AtomicU64,
    /// Owning-wheel tick counter value when the current leg started.
    create_ticks: AtomicU64,
    /// Millisecond anchor of the current leg. `create_ms + interval_ms` is
    /// the due time of the leg.
    create_ms: AtomicU64,
}

impl Entry {
    pub(crate) fn new(id: u64, job: Job, mode: Mode, times: i64, raw_interval_ms: u64) -> Self {
        let runs = match mode {
            Mode::Once => 1,
            Mode::Times => times.max(0),
            Mode::Normal | Mode::Singleton => UNLIMITED_RUNS,
        };
        Self {
            id,
            job,
            mode,
            pinned: false,
            status: AtomicStatus::new(Status::Ready),
            remaining_runs: AtomicI64::new(runs),
            raw_interval_ms,
            interval_ms: AtomicU64::new(raw_interval_ms),
            interval_ticks: AtomicU64::new(1),
            create_ticks: AtomicU64::new(0),
            create_ms: AtomicU64::new(0),
        }
    }

    pub(crate) fn new_pinned(id: u64, job: Job, raw_interval_ms: u64) -> Self {
        let mut entry = Self::new(id, job, Mode::Normal, 0, raw_interval_ms);
        entry.pinned = true;
        entry
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn job(&self) -> Job {
        Arc::clone(&self.job)
    }

    pub(crate) fn mode(&self) -> Mode {
        self.mode
    }

    pub(crate) fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub(crate) fn status(&self) -> &AtomicStatus {
        &self.status
    }

    pub(crate) fn raw_interval_ms(&self) -> u64 {
        self.raw_interval_ms
    }

    pub(crate) fn interval_ms(&self) -> u64 {
        self.interval_ms.load(Ordering::SeqCst)
    }

    pub(crate) fn interval_ticks(&self) -> u64 {
        self.interval_ticks.load(Ordering::SeqCst)
    }

    pub(crate) fn create_ticks(&self) -> u64 {
        self.create_ticks.load(Ordering::SeqCst)
    }

    pub(crate) fn create_ms(&self) -> u64 {
        self.create_ms.load(Ordering::SeqCst)
    }

    /// Due time of the current leg in timer milliseconds.
    pub(crate) fn due_ms(&self) -> u64 {
        self.create_ms().saturating_add(self.interval_ms())
    }

    /// Rewrites the scheduling fields for a new leg. Called only from inside
    /// a drain pass or from the registering thread before first insertion.
    pub(crate) fn set_leg(
        &self,
        interval_ms: u64,
        interval_ticks: u64,
        create_ticks: u64,
        create_ms: u64,
    ) {
        self.interval_ms.store(interval_ms, Ordering::SeqCst);
        self.interval_ticks.store(interval_ticks, Ordering::SeqCst);
        self.create_ticks.store(create_ticks, Ordering::SeqCst);
        self.create_ms.store(create_ms, Ordering::SeqCst);
    }

    /// Spends one run from the quota.
    pub(crate) fn consume_run(&self) -> RunQuota {
        let previous = self.remaining_runs.fetch_sub(1, Ordering::SeqCst);
        if previous > SENTINEL_FLOOR {
            // Unlimited entry: refresh the sentinel so it never decays.
            self.remaining_runs.store(UNLIMITED_RUNS, Ordering::SeqCst);
            RunQuota::More
        } else if previous <= 0 {
            self.remaining_runs.store(0, Ordering::SeqCst);
            RunQuota::Exhausted
        } else if previous == 1 {
            RunQuota::Final
        } else {
            RunQuota::More
        }
    }

    pub(crate) fn set_times(&self, times: i64) {
        self.remaining_runs.store(times.max(0), Ordering::SeqCst);
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("status", &self.status.load())
            .field("raw_interval_ms", &self.raw_interval_ms)
            .finish_non_exhaustive()
    }
}

/// User-facing handle for controlling a registered entry.
///
/// Handles are cheap to clone and remain valid after the entry closes;
/// control calls on a closed entry are no-ops.
#[derive(Clone)]
pub struct EntryHandle {
    entry: Arc<Entry>,
}

impl EntryHandle {
    pub(crate) fn new(entry: Arc<Entry>) -> Self {
        Self { entry }
    }

    /// Identifier of the entry, unique within its timer.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.entry.id()
    }

    /// Run mode the entry was registered with.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.entry.mode()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> Status {
        self.entry.status().load()
    }

    /// Resumes a stopped entry. Firing continues at the original period; the
    /// window missed while stopped is not replayed.
    pub fn start(&self) {
        self.entry.status().compare_swap(Status::Stopped, Status::Ready);
    }

    /// Pauses the entry. It stays resident in its wheel and can be resumed
    /// with [`start`](Self::start).
    pub fn stop(&self) {
        self.entry.status().store_unless_closed(Status::Stopped);
    }

    /// Closes the entry. Terminal and idempotent; the entry is dropped from
    /// its slot at the next evaluation.
    pub fn close(&self) {
        self.entry.status().store_unless_closed(Status::Closed);
    }

    /// Re-arms the remaining run count. The entry closes after `times`
    /// further fires.
    pub fn set_times(&self, times: i64) {
        self.entry.set_times(times);
    }
}

impl fmt::Debug for EntryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryHandle")
            .field("id", &self.entry.id())
            .field("mode", &self.entry.mode())
            .field("status", &self.entry.status().load())
            .finish()
    }
}

/// Panic payload used by [`exit`](crate::exit) for in-job self-cancellation.
pub(crate) struct ExitSignal;
