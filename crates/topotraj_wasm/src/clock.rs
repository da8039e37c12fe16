use topotraj_core::traits::Clock;

/// Wall clock backed by `Date.now()`; `std::time::Instant` is unavailable
/// in the browser.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsClock;

impl Clock for JsClock {
    fn now_secs(&self) -> f64 {
        js_sys::Date::now() / 1000.0
    }
}
