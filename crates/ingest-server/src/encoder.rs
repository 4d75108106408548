//! Batch encoding
//!
//! Turns a batch of events into a gzip-compressed JSON Lines buffer.
//! This is the most CPU- and memory-sensitive stage of the pipeline, so
//! the output buffer comes from the shared pool and is handed to the
//! caller without a copy; the caller (upload path or failure queue)
//! releases it by dropping the guard.

use std::io::Write;
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use ingest_core::prelude::*;
use tracing::trace;

/// Batch encoder. Compression runs at the fastest level; the server
/// trades ratio for throughput on a fractional CPU.
pub struct Encoder {
    events: Arc<EventPool>,
    buffers: Arc<BufferPool>,
}

impl Encoder {
    pub fn new(events: Arc<EventPool>, buffers: Arc<BufferPool>) -> Self {
        Self { events, buffers }
    }

    /// Encode a batch as gzip-compressed JSON Lines: one JSON object
    /// per event, in input order, each line newline-terminated.
    ///
    /// The returned buffer is owned by the caller until dropped. On
    /// failure both the partial buffer and the compressor are released
    /// and the error is reported; events are untouched either way and
    /// must still be recycled exactly once by the caller.
    pub fn encode(&self, events: &[Box<Event>]) -> Result<PooledBuf> {
        let mut buf = self.buffers.acquire();
        let mut gz = GzEncoder::new(&mut buf, Compression::fast());

        for event in events {
            serde_json::to_writer(&mut gz, event.as_ref())
                .map_err(|e| IngestError::encode_with_source("event serialization failed", e))?;
            gz.write_all(b"\n")
                .map_err(|e| IngestError::encode_with_source("compressed write failed", e))?;
        }

        // Close flushes the gzip footer; the stream is incomplete
        // without it.
        gz.finish()
            .map_err(|e| IngestError::encode_with_source("gzip finish failed", e))?;

        trace!(events = events.len(), bytes = buf.len(), "batch encoded");
        Ok(buf)
    }

    /// Clear every event in a finished batch and return it to the
    /// pool. Called exactly once per batch regardless of the upload
    /// outcome.
    pub fn recycle(&self, events: Vec<Box<Event>>) {
        for event in events {
            self.events.release(event);
        }
    }
}
