//! End-to-end scheduling behaviour, driven under paused Tokio time so wheel
//! ticks are deterministic and the suite runs in milliseconds of real time.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tickwheel::{Status, Timer, TimerConfig};

fn test_timer() -> Timer {
    let config = TimerConfig::new()
        .slot_count(10)
        .tick_interval(Duration::from_millis(50))
        .level_count(3);
    Timer::new(config).expect("valid test configuration")
}

fn counter() -> Arc<AtomicU64> {
    Arc::new(AtomicU64::new(0))
}

fn counting_job(counter: &Arc<AtomicU64>) -> impl Fn() -> std::future::Ready<()> + Send + Sync {
    let counter = Arc::clone(counter);
    move || {
        counter.fetch_add(1, Ordering::SeqCst);
        std::future::ready(())
    }
}

#[tokio::test(start_paused = true)]
async fn firing_period_tracks_interval() {
    let timer = test_timer();
    let fired = counter();
    let _handle = timer
        .add(Duration::from_millis(200), counting_job(&fired))
        .expect("register");

    tokio::time::sleep(Duration::from_millis(2_050)).await;

    // floor(2050 / 200) = 10, with a one-tick tolerance either way.
    let count = fired.load(Ordering::SeqCst);
    assert!((9..=11).contains(&count), "fired {count} times");
}

#[tokio::test(start_paused = true)]
async fn add_once_fires_exactly_once() {
    let timer = test_timer();
    let fired = counter();
    let handle = timer
        .add_once(Duration::from_millis(100), counting_job(&fired))
        .expect("register");

    tokio::time::sleep(Duration::from_millis(1_000)).await;

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(handle.status(), Status::Closed);
}

#[tokio::test(start_paused = true)]
async fn add_times_fires_exact_count() {
    let timer = test_timer();
    let fired = counter();
    let handle = timer
        .add_times(Duration::from_millis(100), 3, counting_job(&fired))
        .expect("register");

    tokio::time::sleep(Duration::from_millis(2_000)).await;

    assert_eq!(fired.load(Ordering::SeqCst), 3);
    assert_eq!(handle.status(), Status::Closed);
}

#[tokio::test(start_paused = true)]
async fn singleton_never_overlaps_itself() {
    let timer = test_timer();
    let active = Arc::new(AtomicI64::new(0));
    let peak = Arc::new(AtomicI64::new(0));
    let completed = counter();

    let job = {
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        let completed = Arc::clone(&completed);
        move || {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            let completed = Arc::clone(&completed);
            async move {
                let current = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(current, Ordering::SeqCst);
                // Deliberately longer than the 100ms interval.
                tokio::time::sleep(Duration::from_millis(350)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                completed.fetch_add(1, Ordering::SeqCst);
            }
        }
    };
    let _handle = timer
        .add_singleton(Duration::from_millis(100), job)
        .expect("register");

    tokio::time::sleep(Duration::from_millis(2_050)).await;

    assert_eq!(peak.load(Ordering::SeqCst), 1, "overlapping execution observed");
    let done = completed.load(Ordering::SeqCst);
    // Strictly fewer completions than elapsed / interval, but steady progress.
    assert!(done < 20, "completed {done} times");
    assert!((3..=6).contains(&done), "completed {done} times");
}

#[tokio::test(start_paused = true)]
async fn entry_stop_start_resumes_without_burst() {
    let timer = test_timer();
    let fired = counter();
    let handle = timer
        .add(Duration::from_millis(100), counting_job(&fired))
        .expect("register");

    tokio::time::sleep(Duration::from_millis(550)).await;
    handle.stop();
    // Let an already-dispatched fire settle before sampling.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let at_stop = fired.load(Ordering::SeqCst);
    assert!(at_stop >= 4, "expected a few fires before stop, got {at_stop}");

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(fired.load(Ordering::SeqCst), at_stop, "fired while stopped");

    handle.start();
    // Shortly after resume there must be at most a couple of fires, not a
    // replay of the ten windows missed while stopped.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let after_resume = fired.load(Ordering::SeqCst) - at_stop;
    assert!(after_resume >= 1, "did not resume");
    assert!(after_resume <= 3, "burst of {after_resume} fires after resume");
}

#[tokio::test(start_paused = true)]
async fn timer_stop_pauses_every_level() {
    let timer = test_timer();
    let fired = counter();
    let _handle = timer
        .add(Duration::from_millis(100), counting_job(&fired))
        .expect("register");

    tokio::time::sleep(Duration::from_millis(550)).await;
    timer.stop();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let at_stop = fired.load(Ordering::SeqCst);

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(fired.load(Ordering::SeqCst), at_stop);

    timer.start();
    tokio::time::sleep(Duration::from_millis(550)).await;
    assert!(fired.load(Ordering::SeqCst) > at_stop, "did not resume");
}

#[tokio::test(start_paused = true)]
async fn coarse_level_entry_fires_with_base_tick_accuracy() {
    let timer = test_timer();
    let fired = counter();
    // 2.6s lands on level 1 (500ms ticks); a coarse-only wheel would be up
    // to half a second early. Demotion must deliver base-tick accuracy.
    let _handle = timer
        .add_once(Duration::from_millis(2_600), counting_job(&fired))
        .expect("register");

    tokio::time::sleep(Duration::from_millis(2_525)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0, "fired a coarse tick early");

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1, "missed the fine-grained window");
}

#[tokio::test(start_paused = true)]
async fn exit_closes_entry_from_inside_the_job() {
    let timer = test_timer();
    let fired = counter();
    let job = {
        let fired = Arc::clone(&fired);
        move || {
            let fired = Arc::clone(&fired);
            async move {
                if fired.fetch_add(1, Ordering::SeqCst) + 1 >= 2 {
                    tickwheel::exit();
                }
            }
        }
    };
    let handle = timer.add(Duration::from_millis(100), job).expect("register");

    tokio::time::sleep(Duration::from_millis(1_000)).await;

    assert_eq!(fired.load(Ordering::SeqCst), 2);
    assert_eq!(handle.status(), Status::Closed);
}

#[tokio::test(start_paused = true)]
async fn panicking_job_is_contained() {
    let timer = test_timer();
    let faulty_runs = counter();
    let sibling_runs = counter();

    let faulty = {
        let faulty_runs = Arc::clone(&faulty_runs);
        move || {
            let faulty_runs = Arc::clone(&faulty_runs);
            async move {
                faulty_runs.fetch_add(1, Ordering::SeqCst);
                panic!("boom");
            }
        }
    };
    let handle = timer.add(Duration::from_millis(100), faulty).expect("register");
    let _sibling = timer
        .add(Duration::from_millis(100), counting_job(&sibling_runs))
        .expect("register");

    tokio::time::sleep(Duration::from_millis(1_050)).await;

    // The faulty job ran once, was closed, and never disturbed the driver.
    assert_eq!(faulty_runs.load(Ordering::SeqCst), 1);
    assert_eq!(handle.status(), Status::Closed);
    let sibling = sibling_runs.load(Ordering::SeqCst);
    assert!(sibling >= 8, "sibling starved: fired {sibling} times");
}

#[tokio::test(start_paused = true)]
async fn closed_entry_is_dropped_from_its_slot() {
    let timer = test_timer();
    let fired = counter();
    let handle = timer
        .add(Duration::from_millis(100), counting_job(&fired))
        .expect("register");

    tokio::time::sleep(Duration::from_millis(250)).await;
    handle.close();
    handle.close(); // idempotent
    let at_close = fired.load(Ordering::SeqCst);

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(fired.load(Ordering::SeqCst), at_close);
    // Only the internal level driver remains resident on level 0.
    assert_eq!(timer.stats().levels[0].pending, 1);
}

#[tokio::test(start_paused = true)]
async fn delay_add_defers_the_real_registration() {
    let timer = test_timer();
    let fired = counter();
    timer
        .delay_add(
            Duration::from_millis(300),
            Duration::from_millis(100),
            counting_job(&fired),
        )
        .expect("register");

    // Nothing is visible until the delay elapses plus one interval.
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(700)).await;
    let count = fired.load(Ordering::SeqCst);
    assert!((5..=8).contains(&count), "fired {count} times");
}

#[tokio::test(start_paused = true)]
async fn set_times_rearms_a_live_entry() {
    let timer = test_timer();
    let fired = counter();
    let handle = timer
        .add_times(Duration::from_millis(100), 2, counting_job(&fired))
        .expect("register");

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // Re-arm before the original quota runs out: three more fires, then
    // closed, instead of the one remaining.
    handle.set_times(3);
    tokio::time::sleep(Duration::from_millis(1_000)).await;

    assert_eq!(fired.load(Ordering::SeqCst), 4);
    assert_eq!(handle.status(), Status::Closed);
}

#[tokio::test(start_paused = true)]
async fn delay_add_times_defers_a_counted_registration() {
    let timer = test_timer();
    let fired = counter();
    timer
        .delay_add_times(
            Duration::from_millis(200),
            Duration::from_millis(100),
            2,
            counting_job(&fired),
        )
        .expect("register");

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    // The counted entry came alive at the delay boundary and spent its quota.
    assert_eq!(fired.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn ticks_advance_monotonically() {
    let timer = test_timer();
    let mut last = timer.stats().levels[0].ticks;
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let ticks = timer.stats().levels[0].ticks;
        assert!(ticks > last, "pointer did not advance");
        last = ticks;
    }
    // 1000ms of 50ms ticks, with slack for the final tick boundary.
    assert!((19..=21).contains(&last), "ticks = {last}");
}

#[tokio::test(start_paused = true)]
async fn default_timer_free_functions() {
    let fired = counter();
    let handle =
        tickwheel::add_once(Duration::from_millis(100), counting_job(&fired)).expect("register");

    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(handle.status(), Status::Closed);
    assert_eq!(tickwheel::default_timer().status(), Status::Ready);
}
