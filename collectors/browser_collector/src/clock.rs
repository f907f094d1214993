use chrono::{DateTime, Utc};

/// Source of wall-clock time for attribution. Swappable so tests can drive
/// time explicitly.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
