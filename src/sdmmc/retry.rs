//! Bounded-retry helpers shared by the command framer, the init state
//! machine and every busy-wait in the block-transfer paths.

use crate::transport::Clock;
use embedded_hal::blocking::delay::DelayMs;

/// Call `f` up to `attempts` times, sleeping `delay_ms` between attempts
/// (but not after the last one), stopping as soon as `f` returns `Some`.
///
/// Used for the count-bounded retries shared by CMD0 (10 attempts, 10ms
/// apart) and the CMD17/18/24/25 issue retry (same bound).
pub(crate) fn retry_count<T, F, DELAY>(
    attempts: u32,
    delay_ms: u32,
    delay: &mut DELAY,
    mut f: F,
) -> Option<T>
where
    F: FnMut() -> Option<T>,
    DELAY: DelayMs<u32>,
{
    for attempt in 0..attempts {
        if let Some(v) = f() {
            return Some(v);
        }
        if attempt + 1 < attempts {
            delay.delay_ms(delay_ms);
        }
    }
    None
}

/// Call `f` repeatedly until it returns `Some`, or until `timeout_ms` have
/// elapsed according to `clock`, sleeping `delay_ms` between attempts.
///
/// Used for the time-bounded polls shared by ACMD41/CMD1 capacity
/// negotiation (100ms apart, 1000ms bound), the data-start token wait
/// (200ms bound), and busy-release waits (500ms / 30 000ms bound).
pub(crate) fn poll_until_ms<T, F, CLK, DELAY>(
    clock: &mut CLK,
    delay: &mut DELAY,
    timeout_ms: u32,
    delay_ms: u32,
    mut f: F,
) -> Option<T>
where
    F: FnMut() -> Option<T>,
    CLK: Clock,
    DELAY: DelayMs<u32>,
{
    let deadline = clock.now_ms().wrapping_add(timeout_ms);
    loop {
        if let Some(v) = f() {
            return Some(v);
        }
        if clock.now_ms() >= deadline {
            return None;
        }
        if delay_ms > 0 {
            delay.delay_ms(delay_ms);
        }
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
