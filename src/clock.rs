//! Wall-clock source for window boundaries.
//!
//! The aggregation engine computes `now - window` itself and binds it as a
//! query parameter, so tests can pin "now" with [`MockClock`].

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub use mock::MockClock;
