use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

/// Cache of the database's notion of "now".
///
/// The database is the authoritative clock, but asking it is a round trip.
/// The cached value is advanced by the local monotonic clock, so adjustments
/// of the local wall clock have no effect, and it goes stale after `refresh`.
#[derive(Debug, Clone)]
pub struct DbClock {
    refresh: Duration,
    cached: Option<(DateTime<Utc>, Instant)>,
}

impl DbClock {
    pub const DEFAULT_REFRESH: Duration = Duration::from_secs(600);

    pub fn new(refresh: Duration) -> Self {
        Self {
            refresh,
            cached: None,
        }
    }

    /// Current database time extrapolated to `at`, or `None` when the cache
    /// is empty or older than the refresh period.
    pub fn read(&self, at: Instant) -> Option<DateTime<Utc>> {
        let (db_time, taken) = self.cached?;
        let elapsed = at.saturating_duration_since(taken);
        if elapsed > self.refresh {
            return None;
        }
        let elapsed = chrono::Duration::from_std(elapsed).ok()?;
        Some(db_time + elapsed)
    }

    pub fn update(&mut self, db_time: DateTime<Utc>, taken: Instant) {
        self.cached = Some((db_time, taken));
    }
}

impl Default for DbClock {
    fn default() -> Self {
        Self::new(Self::DEFAULT_REFRESH)
    }
}
