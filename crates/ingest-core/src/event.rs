//! Event model
//!
//! Defines the single collected event record and the batch job that
//! flows from the batch builder to the upload task. One encoded line in
//! an uploaded object corresponds to exactly one `Event`.

use serde::{Deserialize, Serialize};

/// A single collected event.
///
/// Populated by the HTTP handler from a pooled record, pushed by
/// ownership onto the event channel, and recycled back into the pool
/// after its batch has been encoded. `body` carries the raw query
/// string (GET) or request body (POST); cookie and user-agent are split
/// out downstream during ETL.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Capture time, UTC epoch seconds (cached clock, 1s precision)
    pub ts: i64,
    /// Client IP extracted from proxy headers; may be empty
    pub ip: String,
    /// User-Agent header
    pub user_agent: String,
    /// Raw Cookie header
    pub cookie: String,
    /// Raw request query string or body text
    pub body: String,
}

impl Event {
    /// Reset all fields for reuse. String allocations are kept so a
    /// recycled record does not reallocate on the next request.
    pub fn clear(&mut self) {
        self.ts = 0;
        self.ip.clear();
        self.user_agent.clear();
        self.cookie.clear();
        self.body.clear();
    }
}

/// One batch of events bound for a single object-store PUT.
///
/// Owned by the upload task from receipt until the events are recycled.
/// The sequence length is always in `[1, BatchSize]`.
#[derive(Debug, Default)]
pub struct UploadJob {
    pub events: Vec<Box<Event>>,
}

impl UploadJob {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
