//! Wall-clock accounting
//!
//! Coarse uptime derived from the system tick: whole seconds plus the tick
//! fraction of the current second. Fed by the tick handler while the
//! scheduler is not paused.

use core::sync::atomic::{AtomicU32, Ordering};

static SECONDS: AtomicU32 = AtomicU32::new(0);
static FRAC_TICKS: AtomicU32 = AtomicU32::new(0);

pub(crate) fn reset() {
    SECONDS.store(0, Ordering::Relaxed);
    FRAC_TICKS.store(0, Ordering::Relaxed);
}

/// Advance the clock by one tick. Called with the tick masked out, so plain
/// load/store pairs are fine.
pub(crate) fn on_tick() {
    let frac = FRAC_TICKS.load(Ordering::Relaxed) + 1;
    if frac >= crate::port::tick_rate() {
        FRAC_TICKS.store(0, Ordering::Relaxed);
        SECONDS.fetch_add(1, Ordering::Relaxed);
    } else {
        FRAC_TICKS.store(frac, Ordering::Relaxed);
    }
}

/// Uptime as whole seconds plus the tick fraction of the current second.
pub fn uptime() -> (u32, u32) {
    (
        SECONDS.load(Ordering::Relaxed),
        FRAC_TICKS.load(Ordering::Relaxed),
    )
}

/// Uptime in milliseconds.
pub fn uptime_ms() -> u64 {
    let (secs, frac) = uptime();
    secs as u64 * 1000 + frac as u64 * 1000 / crate::port::tick_rate() as u64
}
