//! Wall-clock date and time.
//!
//! Defaults to a fixed epoch; a board with a real-time clock overrides it
//! during bring-up. Reads annotate the stored value with the tick count
//! since boot so userland can order timestamps between clock sets.

use spin::Mutex;

use crate::{drivers, error::KernelResult, timer};

/// Calendar date and time, plus ticks-since-boot at the moment of the
/// read. Layout is shared with userland via `GetDateTime`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub ticks_since_boot: u64,
}

/// The fixed default epoch used when no RTC is present.
const DEFAULT_EPOCH: DateTime = DateTime {
    year: 2023,
    month: 7,
    day: 25,
    hour: 9,
    minute: 45,
    second: 23,
    ticks_since_boot: 0,
};

static WALL_CLOCK: Mutex<DateTime> = Mutex::new(DEFAULT_EPOCH);

/// Seed the wall clock, preferring the board RTC when one is registered.
pub fn init() {
    if let Some(rtc) = drivers::real_time_clock() {
        if let Ok(dt) = rtc.get_time() {
            *WALL_CLOCK.lock() = dt;
        }
    }
}

/// Read the wall clock, stamped with the current tick count.
pub fn read() -> DateTime {
    let mut dt = *WALL_CLOCK.lock();
    dt.ticks_since_boot = timer::ticks();
    dt
}

/// Set the wall clock, forwarding to the RTC when one is registered.
pub fn set(dt: &DateTime) -> KernelResult<()> {
    *WALL_CLOCK.lock() = *dt;
    if let Some(rtc) = drivers::real_time_clock() {
        rtc.set_time(dt)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_epoch_and_set() {
        // Single test: the wall clock is a global.
        let initial = read();
        assert_eq!(initial.year, 2023);
        assert_eq!(initial.month, 7);

        let newer = DateTime {
            year: 2026,
            month: 8,
            day: 1,
            hour: 12,
            minute: 0,
            second: 0,
            ticks_since_boot: 0,
        };
        set(&newer).unwrap();
        let now = read();
        assert_eq!(now.year, 2026);
        assert_eq!(now.day, 1);

        set(&DEFAULT_EPOCH).unwrap();
    }
}
