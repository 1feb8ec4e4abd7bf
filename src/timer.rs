//! Tick-driven timeout bookkeeping.
//!
//! The original hardware delivers a periodic timer interrupt; everything the
//! driver waits for is bounded by one of two down-counters that the
//! interrupt decrements. [`TickTimer`] models those counters with atomic
//! storage so one object can be shared between the interrupt handler (which
//! calls [`TickTimer::tick`]) and the driver (which arms the counters and
//! polls them as deadlines). Single writer per direction; no lock needed.

use core::sync::atomic::{AtomicU32, Ordering};

/// Timeout budgets, and the tick period used to convert them to tick counts.
///
/// The comments in various MMC/SPI drivers disagree about whether the tick
/// runs at 10 ms or 100 Hz-ish; rather than bake either assumption in, the
/// period is explicit here and the budgets are in milliseconds. Make
/// `tick_period_ms` match whatever actually calls [`TickTimer::tick`].
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    /// Period of the external tick, in milliseconds.
    pub tick_period_ms: u32,
    /// Budget for one busy/ready poll or data-token wait.
    pub ready_timeout_ms: u32,
    /// Budget for the whole card initialization probe.
    pub init_timeout_ms: u32,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            tick_period_ms: 10,
            ready_timeout_ms: 500,
            init_timeout_ms: 1000,
        }
    }
}

impl Timing {
    pub(crate) fn ready_ticks(&self) -> u32 {
        to_ticks(self.ready_timeout_ms, self.tick_period_ms)
    }

    pub(crate) fn init_ticks(&self) -> u32 {
        to_ticks(self.init_timeout_ms, self.tick_period_ms)
    }
}

fn to_ticks(budget_ms: u32, period_ms: u32) -> u32 {
    budget_ms.div_ceil(period_ms.max(1)).max(1)
}

/// The two timeout down-counters, advanced by an external periodic tick.
///
/// `short` bounds a single busy-wait (card-ready polls and data-token
/// waits); `long` bounds the whole initialization probe sequence. Both
/// saturate at zero and never underflow.
///
/// Allocate one of these where both the driver and your timer interrupt can
/// reach it:
///
/// ```rust
/// use sdmmc_disk::TickTimer;
///
/// static DISK_TICKS: TickTimer = TickTimer::new();
///
/// // called from the periodic timer interrupt, nominally every 10 ms
/// fn timer_isr() {
///     DISK_TICKS.tick();
/// }
/// ```
#[derive(Debug)]
pub struct TickTimer {
    short: AtomicU32,
    long: AtomicU32,
}

impl TickTimer {
    /// Create a new pair of counters, both already expired.
    pub const fn new() -> TickTimer {
        TickTimer {
            short: AtomicU32::new(0),
            long: AtomicU32::new(0),
        }
    }

    /// Advance time by one tick, decrementing both counters.
    ///
    /// Call this from a periodic timer interrupt with the period named in
    /// [`Timing::tick_period_ms`]. A plain load/store is enough because the
    /// tick source is the only thing that decrements.
    pub fn tick(&self) {
        let short = self.short.load(Ordering::Relaxed);
        if short > 0 {
            self.short.store(short - 1, Ordering::Relaxed);
        }
        let long = self.long.load(Ordering::Relaxed);
        if long > 0 {
            self.long.store(long - 1, Ordering::Relaxed);
        }
    }

    pub(crate) fn arm_short(&self, ticks: u32) {
        self.short.store(ticks, Ordering::Relaxed);
    }

    pub(crate) fn short_expired(&self) -> bool {
        self.short.load(Ordering::Relaxed) == 0
    }

    pub(crate) fn arm_long(&self, ticks: u32) {
        self.long.store(ticks, Ordering::Relaxed);
    }

    pub(crate) fn long_expired(&self) -> bool {
        self.long.load(Ordering::Relaxed) == 0
    }
}

impl Default for TickTimer {
    fn default() -> Self {
        TickTimer::new()
    }
}
