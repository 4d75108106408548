//! # Ingest Core
//!
//! Core types and utilities for the event ingest server:
//!
//! - Configuration loaded from environment and optional file
//! - Error types and `Result` alias
//! - Operational counters served as a plain-text snapshot
//! - The `Event` record and batch job types
//! - Once-per-second cached clock and partition strings
//! - Object pools for event records and encode buffers
//! - Deterministic filename / object-key construction

pub mod config;
pub mod error;
pub mod event;
pub mod keys;
pub mod metrics;
pub mod pool;
pub mod timecache;

pub use config::*;
pub use error::*;
pub use event::*;
pub use keys::*;
pub use metrics::*;
pub use pool::*;
pub use timecache::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{IngestError, Result};
    pub use crate::event::{Event, UploadJob};
    pub use crate::keys::KeyFactory;
    pub use crate::metrics::Metrics;
    pub use crate::pool::{BufferPool, EventPool, PooledBuf};
    pub use crate::timecache::TimeCache;
}
