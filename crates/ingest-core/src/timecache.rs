//! Cached clock and partition strings
//!
//! The hot path stamps thousands of events per second and builds a
//! partition key for every upload. Reading the system clock and
//! formatting dates each time is wasted work at 1-second precision, so
//! a background task refreshes three values once per second and readers
//! load them atomically:
//!
//! - `unix()`: UTC epoch seconds
//! - `partition()`: `dt` (`YYYY-MM-DD`) and `hr` (`HH`) strings in a
//!   fixed zone offset (UTC+9, matching the downstream table layout)

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{FixedOffset, Utc};

/// Fixed partition zone offset in hours (UTC+9)
const PARTITION_OFFSET_HOURS: i32 = 9;

/// Date/hour partition strings, swapped wholesale once per second
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatePartition {
    /// `YYYY-MM-DD`
    pub dt: String,
    /// `HH`, zero-padded
    pub hr: String,
}

/// Process-wide cached clock. Readers are lock-free.
pub struct TimeCache {
    unix: AtomicI64,
    partition: ArcSwap<DatePartition>,
    zone: FixedOffset,
}

impl TimeCache {
    /// Create a cache seeded from the current wall clock. Call
    /// [`TimeCache::spawn_refresher`] once a runtime is available to
    /// keep it fresh.
    pub fn new() -> Arc<Self> {
        let zone = FixedOffset::east_opt(PARTITION_OFFSET_HOURS * 3600)
            .expect("partition offset within +/-24h");

        let cache = Arc::new(Self {
            unix: AtomicI64::new(0),
            partition: ArcSwap::from_pointee(DatePartition {
                dt: String::new(),
                hr: String::new(),
            }),
            zone,
        });
        cache.refresh();
        cache
    }

    /// Create a cache pinned to fixed values. The refresher is never
    /// started; intended for deterministic tests.
    pub fn frozen(unix: i64, dt: impl Into<String>, hr: impl Into<String>) -> Arc<Self> {
        let cache = Self::new();
        cache.unix.store(unix, Ordering::Relaxed);
        cache.partition.store(Arc::new(DatePartition {
            dt: dt.into(),
            hr: hr.into(),
        }));
        cache
    }

    /// Start the once-per-second refresher task.
    pub fn spawn_refresher(self: &Arc<Self>) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                cache.refresh();
            }
        });
    }

    /// Re-read the wall clock and store all three values.
    pub fn refresh(&self) {
        let now = Utc::now();
        self.unix.store(now.timestamp(), Ordering::Relaxed);

        let local = now.with_timezone(&self.zone);
        self.partition.store(Arc::new(DatePartition {
            dt: local.format("%Y-%m-%d").to_string(),
            hr: local.format("%H").to_string(),
        }));
    }

    /// Current UTC epoch seconds (cached, 1-second precision).
    pub fn unix(&self) -> i64 {
        self.unix.load(Ordering::Relaxed)
    }

    /// Current date/hour partition strings.
    pub fn partition(&self) -> Arc<DatePartition> {
        self.partition.load_full()
    }
}
