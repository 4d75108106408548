//! Filename and object-key construction
//!
//! Every uploaded object and every failure-queue file shares one
//! filename grammar:
//!
//! ```text
//! <unix>_<instance>_<counter>.jsonl.gz
//! ```
//!
//! The leading epoch-seconds field makes lexicographic order equal
//! temporal order within a process, which the failure queue relies on
//! for oldest-first selection and TTL parsing. Object keys add the
//! date/hour partition layer used by downstream table scans:
//!
//! ```text
//! <prefix>/dt=<YYYY-MM-DD>/hr=<HH>/<filename>
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::timecache::TimeCache;

/// Counter wrap point; six digits keep filenames short, and the
/// timestamp+instance fields make collisions across wraps unrealistic.
const COUNTER_MODULUS: u64 = 1_000_000;

/// Builds filenames and partitioned object keys.
pub struct KeyFactory {
    clock: Arc<TimeCache>,
    instance_id: String,
    counter: AtomicU64,
}

impl KeyFactory {
    pub fn new(clock: Arc<TimeCache>, instance_id: impl Into<String>) -> Self {
        Self {
            clock,
            instance_id: instance_id.into(),
            counter: AtomicU64::new(0),
        }
    }

    /// Next value of the process-wide sequence, wrapped to six digits.
    fn next_counter(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1) % COUNTER_MODULUS
    }

    /// Compose `<unix>_<instance>_<counter>.jsonl.gz`.
    pub fn new_filename(&self) -> String {
        format!(
            "{}_{}_{:06}.jsonl.gz",
            self.clock.unix(),
            self.instance_id,
            self.next_counter()
        )
    }

    /// Compose `<prefix>/dt=<date>/hr=<hour>/<filename>`.
    pub fn object_key(&self, prefix: &str, filename: &str) -> String {
        let p = self.clock.partition();
        format!("{}/dt={}/hr={}/{}", prefix, p.dt, p.hr, filename)
    }
}
