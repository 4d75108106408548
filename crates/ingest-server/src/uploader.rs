//! Object-store uploads
//!
//! The uploader owns all retry policy: the SDK's built-in retries are
//! disabled so latency stays predictable, and every upload runs a small
//! app-level loop: bounded attempts, exponential backoff, a per-attempt
//! timeout, and a cancellation check before each attempt and during the
//! backoff wait.
//!
//! [`ObjectUploader`] is the seam for swapping the object store out in
//! tests; the pipeline and failure queue only ever see the trait.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use ingest_core::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// First backoff delay between attempts
const INITIAL_BACKOFF: Duration = Duration::from_millis(200);

/// Backoff ceiling
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Upload capability consumed by the pipeline and the failure queue.
#[async_trait]
pub trait ObjectUploader: Send + Sync {
    /// Upload an in-memory buffer to `key`.
    async fn upload_bytes(
        &self,
        token: &CancellationToken,
        key: &str,
        body: &[u8],
    ) -> Result<()>;

    /// Upload a file of known size to `key`. The file is re-opened for
    /// every attempt, which rewinds the stream.
    async fn upload_file(
        &self,
        token: &CancellationToken,
        key: &str,
        path: &Path,
        size: u64,
    ) -> Result<()>;
}

/// S3-backed uploader.
pub struct S3Uploader {
    client: Client,
    bucket: String,
    attempt_timeout: Duration,
    app_retries: u32,
    metrics: Arc<Metrics>,
}

impl S3Uploader {
    /// Build the SDK client with its own retry machinery turned off.
    pub async fn new(cfg: &Config, metrics: Arc<Metrics>) -> Self {
        let aws_cfg = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(cfg.aws_region.clone()))
            .retry_config(aws_config::retry::RetryConfig::disabled())
            .load()
            .await;

        Self {
            client: Client::new(&aws_cfg),
            bucket: cfg.raw_bucket.clone(),
            attempt_timeout: cfg.s3_timeout,
            app_retries: cfg.s3_app_retries,
            metrics,
        }
    }

    /// One PUT attempt, bounded by the per-attempt timeout.
    async fn put_object(&self, key: &str, body: ByteStream, size: i64) -> Result<()> {
        let send = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_length(size)
            .send();

        match tokio::time::timeout(self.attempt_timeout, send).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(IngestError::upload_with_source(
                format!("put_object failed for {key}"),
                e,
            )),
            Err(_) => Err(IngestError::timeout(
                "s3 put_object",
                self.attempt_timeout.as_millis() as u64,
            )),
        }
    }

    /// Wait out one backoff step, aborting early on cancellation.
    async fn backoff_wait(
        &self,
        token: &CancellationToken,
        backoff: &mut Duration,
    ) -> Result<()> {
        tokio::select! {
            _ = token.cancelled() => Err(IngestError::Cancelled),
            _ = tokio::time::sleep(*backoff) => {
                *backoff = (*backoff * 2).min(MAX_BACKOFF);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ObjectUploader for S3Uploader {
    async fn upload_bytes(
        &self,
        token: &CancellationToken,
        key: &str,
        body: &[u8],
    ) -> Result<()> {
        // One owned copy up front; each attempt clones it zero-copy.
        let body = Bytes::copy_from_slice(body);
        let size = body.len() as i64;

        let mut backoff = INITIAL_BACKOFF;
        let mut last_err = IngestError::upload(format!("no attempts made for {key}"));

        for attempt in 1..=self.app_retries {
            if token.is_cancelled() {
                return Err(IngestError::Cancelled);
            }

            match self.put_object(key, ByteStream::from(body.clone()), size).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.metrics.s3_put_errors_total.fetch_add(1, Ordering::Relaxed);
                    debug!(key, attempt, error = %e, "put attempt failed");
                    last_err = e;
                }
            }

            if attempt < self.app_retries {
                self.backoff_wait(token, &mut backoff).await?;
            }
        }

        Err(last_err)
    }

    async fn upload_file(
        &self,
        token: &CancellationToken,
        key: &str,
        path: &Path,
        size: u64,
    ) -> Result<()> {
        let mut backoff = INITIAL_BACKOFF;
        let mut last_err = IngestError::upload(format!("no attempts made for {key}"));

        for attempt in 1..=self.app_retries {
            if token.is_cancelled() {
                return Err(IngestError::Cancelled);
            }

            // Re-opening per attempt rewinds the stream to the start.
            let body = match ByteStream::from_path(path).await {
                Ok(stream) => stream,
                Err(e) => {
                    return Err(IngestError::upload_with_source(
                        format!("cannot open {} for upload", path.display()),
                        e,
                    ))
                }
            };

            match self.put_object(key, body, size as i64).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.metrics.s3_put_errors_total.fetch_add(1, Ordering::Relaxed);
                    debug!(key, attempt, error = %e, "put attempt failed");
                    last_err = e;
                }
            }

            if attempt < self.app_retries {
                self.backoff_wait(token, &mut backoff).await?;
            }
        }

        Err(last_err)
    }
}
