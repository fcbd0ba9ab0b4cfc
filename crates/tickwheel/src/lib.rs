//! `tickwheel` — hierarchical timing-wheel scheduler for recurring
//! background jobs.
//!
//! # Overview
//!
//! A [`Timer`] owns a stack of wheels with geometrically increasing tick
//! intervals: level `i`'s total span equals level `i + 1`'s single tick.
//! Registrations are routed to the level matching their interval, so both
//! insertion and removal are O(1) regardless of how many jobs are resident,
//! and only one real time source exists for the whole hierarchy. Firing is
//! approximate — bounded by the base tick resolution — which suits periodic
//! background work (cache eviction, health checks, pool reaping), not hard
//! real-time deadlines.
//!
//! Long-interval entries are parked on coarse levels and handed down to
//! finer levels as their due time approaches, so a job registered hours out
//! still fires within one base tick of its target.
//!
//! # Run modes
//!
//! | Mode        | Behaviour                                            |
//! |-------------|------------------------------------------------------|
//! | `Normal`    | Repeats indefinitely                                 |
//! | `Singleton` | Repeats, but never overlaps a running invocation     |
//! | `Once`      | Fires exactly once, then closes                      |
//! | `Times`     | Fires exactly N times, then closes                   |
//!
//! # Default timer
//!
//! A process-wide timer built from [`TimerConfig::default`] backs the free
//! functions ([`add`], [`add_once`], ...). It is created on first use —
//! which must happen inside a Tokio runtime — and is never torn down.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! # async fn demo() -> tickwheel::Result<()> {
//! let handle = tickwheel::add(Duration::from_secs(30), || async {
//!     tracing::info!("reaping idle connections");
//! })?;
//! // ... later
//! handle.close();
//! # Ok(())
//! # }
//! ```
//!
//! A job cancels itself by calling [`exit`] from inside its body; a job that
//! panics is closed and never invoked again. Neither case disturbs the tick
//! driver or sibling jobs.

pub mod config;
pub mod entry;
pub mod error;
pub mod timer;

mod wheel;

use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

pub use config::TimerConfig;
pub use entry::{EntryHandle, Mode, Status};
pub use error::{Result, TimerError};
pub use timer::{Timer, TimerStats, WheelStats};

static DEFAULT_TIMER: OnceLock<Timer> = OnceLock::new();

/// The process-wide default timer backing the free registration functions.
///
/// Created on first call; lives for the remainder of the process. Must first
/// be touched from inside a Tokio runtime, since construction spawns the
/// tick driver task.
pub fn default_timer() -> &'static Timer {
    DEFAULT_TIMER.get_or_init(|| {
        Timer::new(TimerConfig::default()).expect("default timer configuration is valid")
    })
}

/// Registers a job on the default timer that repeats every `interval`.
pub fn add<F, Fut>(interval: Duration, job: F) -> Result<EntryHandle>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    default_timer().add(interval, job)
}

/// Registers a non-overlapping repeating job on the default timer.
pub fn add_singleton<F, Fut>(interval: Duration, job: F) -> Result<EntryHandle>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    default_timer().add_singleton(interval, job)
}

/// Registers a job on the default timer that fires once after `interval`.
pub fn add_once<F, Fut>(interval: Duration, job: F) -> Result<EntryHandle>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    default_timer().add_once(interval, job)
}

/// Registers a job on the default timer that fires exactly `times` times.
pub fn add_times<F, Fut>(interval: Duration, times: i64, job: F) -> Result<EntryHandle>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    default_timer().add_times(interval, times, job)
}

/// Defers a recurring registration on the default timer until `delay` has
/// elapsed.
pub fn delay_add<F, Fut>(delay: Duration, interval: Duration, job: F) -> Result<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    default_timer().delay_add(delay, interval, job)
}

/// Delayed variant of [`add_singleton`].
pub fn delay_add_singleton<F, Fut>(delay: Duration, interval: Duration, job: F) -> Result<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    default_timer().delay_add_singleton(delay, interval, job)
}

/// Delayed variant of [`add_once`].
pub fn delay_add_once<F, Fut>(delay: Duration, interval: Duration, job: F) -> Result<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    default_timer().delay_add_once(delay, interval, job)
}

/// Delayed variant of [`add_times`].
pub fn delay_add_times<F, Fut>(
    delay: Duration,
    interval: Duration,
    times: i64,
    job: F,
) -> Result<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    default_timer().delay_add_times(delay, interval, times, job)
}

/// Requests immediate closing of the currently-executing entry.
///
/// Call only from inside a job body. Unwinds with a distinguished payload
/// that the dispatch boundary recognises as a clean cancellation: the entry
/// transitions to [`Status::Closed`] and no error is logged.
pub fn exit() -> ! {
    std::panic::panic_any(entry::ExitSignal);
}
