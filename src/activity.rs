//! Activity LED.
//!
//! The LED toggles on every received frame, and on its own at a slow rate
//! so that a live programmer is visible even without host traffic.

use embassy_futures::select::select;
use embedded_hal::digital::StatefulOutputPin;
use embedded_hal_async::delay::DelayNs;

use crate::session::Session;

/// Idle toggle period while the device is configured by a host.
pub const ACTIVE_PERIOD_MS: u32 = 250;

/// Idle toggle period otherwise.
pub const IDLE_PERIOD_MS: u32 = 500;

/// Toggle period for the given bus state.
pub fn period_ms(bus_active: bool) -> u32 {
    if bus_active {
        ACTIVE_PERIOD_MS
    } else {
        IDLE_PERIOD_MS
    }
}

/// Blink `led` forever. `bus_active` is sampled before each wait.
pub async fn run<L, D, A>(session: &Session, led: &mut L, delay: &mut D, bus_active: A) -> !
where
    L: StatefulOutputPin,
    D: DelayNs,
    A: Fn() -> bool,
{
    loop {
        let period = period_ms(bus_active());
        select(session.activity.wait(), delay.delay_ms(period)).await;
        led.toggle().ok();
    }
}
