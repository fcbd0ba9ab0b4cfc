//! Single wheel level: slot ring, tick advancement, and drain evaluation.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_queue::SegQueue;
use futures_util::FutureExt;
use tracing::{debug, error, trace};

use crate::entry::{Entry, ExitSignal, Mode, RunQuota, Status};
use crate::timer::TimerCore;

/// Outcome of evaluating one entry popped from a due slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    /// Closed or exhausted; the entry is not re-queued and becomes
    /// unreachable.
    Drop,
    /// Not runnable this pass (stopped, or a singleton still running);
    /// re-queued at its normal cadence so it can be evaluated again.
    Keep,
    /// Due time is still more than one base tick away; hand the entry back
    /// to the timer so it lands on the level matching the leftover time.
    Demote { remaining_ms: u64 },
    /// Dispatch the job. `last` marks the final permitted run.
    Fire { last: bool },
}

/// One level of the hierarchy.
///
/// The slot ring is fixed at construction. Registering threads push entries
/// into slots concurrently, but entries are only ever *removed* inside the
/// single drain pass per tick, which keeps slot hand-off atomic for readers.
pub(crate) struct Wheel {
    level: usize,
    slots: Vec<SegQueue<Arc<Entry>>>,
    ticks: AtomicU64,
    tick_interval_ms: u64,
    total_span_ms: u64,
    /// Tick interval of level 0; the fire-or-demote boundary.
    base_tick_ms: u64,
    timer: Weak<TimerCore>,
}

impl Wheel {
    pub(crate) fn new(
        level: usize,
        slot_count: usize,
        tick_interval_ms: u64,
        base_tick_ms: u64,
        timer: Weak<TimerCore>,
    ) -> Self {
        let slots = (0..slot_count).map(|_| SegQueue::new()).collect();
        Self {
            level,
            slots,
            ticks: AtomicU64::new(0),
            tick_interval_ms,
            total_span_ms: tick_interval_ms * slot_count as u64,
            base_tick_ms,
            timer,
        }
    }

    pub(crate) fn level(&self) -> usize {
        self.level
    }

    pub(crate) fn tick_interval_ms(&self) -> u64 {
        self.tick_interval_ms
    }

    pub(crate) fn total_span_ms(&self) -> u64 {
        self.total_span_ms
    }

    pub(crate) fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    fn slot_count(&self) -> u64 {
        self.slots.len() as u64
    }

    /// Number of entries currently resident across all slots.
    pub(crate) fn pending(&self) -> usize {
        self.slots.iter().map(SegQueue::len).sum()
    }

    /// Places `entry` for a leg ending at `anchor_ms + leg_ms`.
    ///
    /// The slot distance is derived from the leftover real time, clamped to
    /// `[1, slot_count - 1]`: at least one full tick must elapse before the
    /// entry is evaluated, and legs longer than the wheel span simply park
    /// for a near-full rotation and are re-homed on arrival.
    pub(crate) fn install(&self, entry: &Arc<Entry>, leg_ms: u64, anchor_ms: u64, now_ms: u64) {
        let due_in = anchor_ms.saturating_add(leg_ms).saturating_sub(now_ms);
        let ticks_ahead = (due_in / self.tick_interval_ms).clamp(1, self.slot_count() - 1);
        let now_ticks = self.ticks();
        entry.set_leg(leg_ms, ticks_ahead, now_ticks, anchor_ms);
        let index = ((now_ticks + ticks_ahead) % self.slot_count()) as usize;
        self.slots[index].push(Arc::clone(entry));
        trace!(
            entry_id = entry.id(),
            level = self.level,
            slot = index,
            ticks_ahead,
            "entry installed"
        );
    }

    /// Places a level-driver entry that fires once per full rotation.
    pub(crate) fn install_pinned(&self, entry: &Arc<Entry>) {
        let now_ticks = self.ticks();
        entry.set_leg(self.total_span_ms, self.slot_count(), now_ticks, 0);
        let index = (now_ticks % self.slot_count()) as usize;
        self.slots[index].push(Arc::clone(entry));
    }

    /// Re-queues a still-live entry at its current cadence without touching
    /// the leg anchor.
    fn requeue(&self, entry: &Arc<Entry>, now_ticks: u64) {
        let index = ((now_ticks + entry.interval_ticks()) % self.slot_count()) as usize;
        self.slots[index].push(Arc::clone(entry));
    }

    /// Advances the slot pointer by one tick and, when the due slot holds
    /// entries, spawns a task to drain it so slot evaluation never blocks
    /// the tick source.
    pub(crate) fn proceed(self: &Arc<Self>, now_ms: u64) {
        let ticks = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        let index = (ticks % self.slot_count()) as usize;
        if self.slots[index].is_empty() {
            return;
        }
        let wheel = Arc::clone(self);
        tokio::spawn(async move {
            wheel.drain(index, ticks, now_ms);
        });
    }

    /// Drains the due slot, bounded by a snapshot of its length so entries
    /// re-queued during this pass are not evaluated twice in one tick.
    pub(crate) fn drain(&self, index: usize, now_ticks: u64, now_ms: u64) {
        let slot = &self.slots[index];
        let snapshot = slot.len();
        for _ in 0..snapshot {
            let Some(entry) = slot.pop() else { break };
            match self.evaluate(&entry, now_ticks, now_ms) {
                Verdict::Drop => {}
                Verdict::Keep => self.requeue(&entry, now_ticks),
                Verdict::Demote { remaining_ms } => {
                    debug!(
                        entry_id = entry.id(),
                        level = self.level,
                        remaining_ms,
                        "re-homing entry for finer-grained firing"
                    );
                    if let Some(timer) = self.timer.upgrade() {
                        timer.rehome(&entry, remaining_ms, now_ms);
                    }
                }
                Verdict::Fire { last } => {
                    // Re-queue before dispatch so the next leg is linearized
                    // with this tick, not with job completion.
                    if !last {
                        if entry.is_pinned() {
                            self.requeue(&entry, now_ticks);
                        } else if let Some(timer) = self.timer.upgrade() {
                            timer.reinstall_after_fire(&entry, now_ms);
                        }
                    }
                    dispatch(entry);
                }
            }
        }
    }

    /// Transition guard of the entry state machine, evaluated once per tick
    /// for every entry in the due slot.
    fn evaluate(&self, entry: &Arc<Entry>, now_ticks: u64, now_ms: u64) -> Verdict {
        match entry.status().load() {
            Status::Stopped => return Verdict::Keep,
            Status::Closed => return Verdict::Drop,
            Status::Ready | Status::Running => {}
        }

        if entry.is_pinned() {
            // Level drivers advance sibling wheels on exact tick cadence and
            // are exempt from quota and re-homing.
            let elapsed = now_ticks.saturating_sub(entry.create_ticks());
            let interval = entry.interval_ticks().max(1);
            if elapsed == 0 || elapsed % interval != 0 {
                return Verdict::Keep;
            }
            return Verdict::Fire { last: false };
        }

        // An entry can be pushed into the slot of an in-flight drain pass,
        // either by a registration racing the pointer advance or by a drain
        // task that runs late. It must not be evaluated until the pointer has
        // moved past its install tick.
        if now_ticks <= entry.create_ticks() {
            return Verdict::Keep;
        }

        // Fire only when the leftover real time fits inside one base tick;
        // a strictly greater remainder re-homes the entry instead, which is
        // what lets a coarse-level registration fire with base-tick accuracy.
        let remaining_ms = entry.due_ms().saturating_sub(now_ms);
        if remaining_ms > self.base_tick_ms {
            return Verdict::Demote { remaining_ms };
        }

        if entry.mode() == Mode::Singleton
            && !entry.status().compare_swap(Status::Ready, Status::Running)
        {
            // Previous invocation still running: skip this window but keep
            // the entry scheduled.
            return Verdict::Keep;
        }

        match entry.consume_run() {
            RunQuota::Exhausted => {
                entry.status().store(Status::Closed);
                Verdict::Drop
            }
            RunQuota::Final => {
                entry.status().store(Status::Closed);
                Verdict::Fire { last: true }
            }
            RunQuota::More => Verdict::Fire { last: false },
        }
    }
}

/// Dispatches one job invocation as its own task.
///
/// This is the sole recovery boundary: a panic escaping the job body is
/// caught here and closes the entry; the distinguished [`ExitSignal`] payload
/// is a clean self-cancellation, not an error. The tick driver and sibling
/// entries are never affected either way.
fn dispatch(entry: Arc<Entry>) {
    tokio::spawn(async move {
        let job = entry.job();
        match AssertUnwindSafe(job()).catch_unwind().await {
            Ok(()) => {
                entry.status().compare_swap(Status::Running, Status::Ready);
            }
            Err(payload) => {
                if payload.downcast_ref::<ExitSignal>().is_some() {
                    debug!(entry_id = entry.id(), "entry exited from inside its job");
                } else {
                    error!(
                        entry_id = entry.id(),
                        "job panicked: {}; entry closed",
                        panic_message(payload.as_ref())
                    );
                }
                entry.status().store(Status::Closed);
            }
        }
    });
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
