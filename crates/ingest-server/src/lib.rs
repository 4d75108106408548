//! # Ingest Server
//!
//! Bounded-buffer ingestion pipeline: HTTP handlers push accepted
//! events onto a channel, a batch-builder task groups them by size or
//! time, and an upload task encodes each batch and PUTs it to the
//! object store. Batches that cannot be delivered are parked in a
//! durable on-disk failure queue and replayed during idle gaps.
//!
//! ```text
//! HTTP ──► event channel ──► batch builder ──► upload channel ──► upload task ──► S3
//!                                                                    │   ▲
//!                                                                    ▼   │ replay
//!                                                               failure queue
//! ```
//!
//! Backpressure flows right to left: a slow upload blocks the batch
//! builder's send, which stops it draining the event channel, which
//! makes handlers reject with 503. Shutdown drains in the same order
//! the data flows and only cancels in-flight uploads after both tasks
//! have exited.

pub mod dlq;
pub mod encoder;
pub mod logging;
pub mod server;
pub mod uploader;

mod ip;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use ingest_core::prelude::*;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::dlq::DlqManager;
use crate::encoder::Encoder;
use crate::uploader::ObjectUploader;

/// Replay cadence of the upload task when no jobs arrive
const REPLAY_TICK: Duration = Duration::from_millis(50);

/// Replays attempted after each job and on each idle tick
const REPLAYS_PER_ROUND: usize = 3;

/// Pipeline orchestrator. Owns both channels and both long-lived
/// tasks; handlers get a cloned event sender via [`Manager::sender`].
pub struct Manager {
    event_tx: mpsc::Sender<Box<Event>>,
    drain: CancellationToken,
    upload_token: CancellationToken,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl Manager {
    /// Wire the channels and start the batch-builder and upload tasks.
    pub fn start(
        cfg: &Config,
        encoder: Encoder,
        uploader: Arc<dyn ObjectUploader>,
        dlq: Arc<DlqManager>,
        keys: Arc<KeyFactory>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(cfg.channel_size);
        // tokio channels have no zero-capacity rendezvous mode, so an
        // unbuffered upload queue maps to capacity 1.
        let (upload_tx, upload_rx) = mpsc::channel(cfg.upload_queue.max(1));

        let drain = CancellationToken::new();
        let upload_token = CancellationToken::new();

        let builder = BatchBuilder {
            batch_size: cfg.batch_size,
            flush_interval: cfg.flush_interval,
            drain: drain.clone(),
        };
        let collect_handle = tokio::spawn(builder.run(event_rx, upload_tx));

        let worker = UploadWorker {
            encoder,
            uploader,
            dlq,
            keys,
            metrics,
            raw_prefix: cfg.raw_prefix.clone(),
            dlq_prefix: cfg.dlq_prefix.clone(),
            token: upload_token.clone(),
        };
        let upload_handle = tokio::spawn(worker.run(upload_rx));

        Self {
            event_tx,
            drain,
            upload_token,
            tasks: Mutex::new(Some((collect_handle, upload_handle))),
        }
    }

    /// Event sender for the HTTP layer. Pushes must be non-blocking
    /// (`try_send`); a full channel is the backpressure signal.
    pub fn sender(&self) -> mpsc::Sender<Box<Event>> {
        self.event_tx.clone()
    }

    /// Graceful, ordered shutdown. Idempotent; concurrent callers all
    /// return after the drain completes.
    ///
    /// 1. Signal the batch builder to stop accepting and drain the
    ///    event channel.
    /// 2. Wait for both tasks: the builder flushes its residual batch
    ///    and closes the upload channel; the upload task finishes every
    ///    buffered job and exits.
    /// 3. Only then cancel the upload token, releasing any retry loop
    ///    still waiting on backoff.
    ///
    /// Cancelling earlier would lose accepted events; the order is the
    /// contract.
    pub async fn shutdown(&self) {
        self.drain.cancel();

        let mut tasks = self.tasks.lock().await;
        if let Some((collect, upload)) = tasks.take() {
            if let Err(e) = collect.await {
                error!(error = %e, "batch builder task panicked");
            }
            if let Err(e) = upload.await {
                error!(error = %e, "upload task panicked");
            }
            self.upload_token.cancel();
            info!("pipeline drained");
        }
    }
}

/// Groups events into batches by size or age.
struct BatchBuilder {
    batch_size: usize,
    flush_interval: Duration,
    drain: CancellationToken,
}

impl BatchBuilder {
    async fn run(
        self,
        mut event_rx: mpsc::Receiver<Box<Event>>,
        upload_tx: mpsc::Sender<UploadJob>,
    ) {
        let mut batch: Vec<Box<Event>> = Vec::with_capacity(self.batch_size);

        let timer = tokio::time::sleep(self.flush_interval);
        tokio::pin!(timer);

        let mut draining = false;

        loop {
            tokio::select! {
                _ = self.drain.cancelled(), if !draining => {
                    // Closing the receiver fails further pushes
                    // immediately while the buffered events continue to
                    // drain below.
                    event_rx.close();
                    draining = true;
                }

                maybe_event = event_rx.recv() => {
                    match maybe_event {
                        Some(event) => {
                            batch.push(event);
                            if batch.len() >= self.batch_size {
                                self.flush(&mut batch, &upload_tx).await;
                                timer.as_mut().reset(tokio::time::Instant::now() + self.flush_interval);
                            }
                        }
                        None => {
                            // Event channel closed and fully drained.
                            self.flush(&mut batch, &upload_tx).await;
                            break;
                        }
                    }
                }

                _ = timer.as_mut() => {
                    self.flush(&mut batch, &upload_tx).await;
                    timer.as_mut().reset(tokio::time::Instant::now() + self.flush_interval);
                }
            }
        }

        // Dropping the sender closes the upload channel; the upload
        // task exits after the buffered jobs.
        info!("batch builder exiting");
    }

    /// Send the current batch as one job. The send is intentionally
    /// blocking; it is the pipeline's backpressure point. The batch
    /// storage is replaced, never reused, so the in-flight job is the
    /// sole owner of its events.
    async fn flush(&self, batch: &mut Vec<Box<Event>>, upload_tx: &mpsc::Sender<UploadJob>) {
        if batch.is_empty() {
            return;
        }

        let events = std::mem::replace(batch, Vec::with_capacity(self.batch_size));
        let job = UploadJob { events };

        if upload_tx.send(job).await.is_err() {
            // Upload task gone; nothing downstream can accept work.
            error!("upload channel closed, discarding batch");
        }
    }
}

/// Encodes and uploads batches; drains the failure queue between jobs
/// and on idle ticks.
struct UploadWorker {
    encoder: Encoder,
    uploader: Arc<dyn ObjectUploader>,
    dlq: Arc<DlqManager>,
    keys: Arc<KeyFactory>,
    metrics: Arc<Metrics>,
    raw_prefix: String,
    dlq_prefix: String,
    token: CancellationToken,
}

impl UploadWorker {
    async fn run(self, mut upload_rx: mpsc::Receiver<UploadJob>) {
        let mut tick = tokio::time::interval(REPLAY_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                maybe_job = upload_rx.recv() => {
                    match maybe_job {
                        Some(job) => {
                            self.process_upload(job).await;
                            self.drain_failure_queue().await;
                        }
                        None => {
                            info!("upload task exiting");
                            break;
                        }
                    }
                }

                _ = tick.tick() => {
                    self.drain_failure_queue().await;
                }
            }
        }
    }

    /// A bounded burst of replays so a busy stream of fresh batches
    /// cannot starve the failure queue, and idle time drains it.
    async fn drain_failure_queue(&self) {
        for _ in 0..REPLAYS_PER_ROUND {
            if !self.dlq.replay_one(&self.token).await {
                break;
            }
        }
    }

    /// Process one batch end to end. Events are recycled exactly once
    /// on every path out of this function.
    async fn process_upload(&self, job: UploadJob) {
        if job.is_empty() {
            return;
        }

        let num_events = job.len();

        let data = match self.encoder.encode(&job.events) {
            Ok(data) => data,
            Err(e) => {
                // Encoding failures are rare and unrecoverable for the
                // batch as encoded; preserve the raw bodies in the
                // dead-letter prefix, best effort.
                error!(error = %e, events = num_events, "encode failed");
                self.metrics.s3_put_errors_total.fetch_add(1, Ordering::Relaxed);

                let mut raw = String::new();
                for event in &job.events {
                    raw.push_str(&event.body);
                    raw.push('\n');
                }

                let filename = self.keys.new_filename();
                let key = self.keys.object_key(&self.dlq_prefix, &filename);
                if let Err(e) = self
                    .uploader
                    .upload_bytes(&self.token, &key, raw.as_bytes())
                    .await
                {
                    warn!(key, error = %e, "dead-letter upload failed");
                }
                self.metrics
                    .dlq_events_enqueued_total
                    .fetch_add(num_events as u64, Ordering::Relaxed);

                self.encoder.recycle(job.events);
                return;
            }
        };

        let filename = self.keys.new_filename();
        let key = self.keys.object_key(&self.raw_prefix, &filename);

        match self.uploader.upload_bytes(&self.token, &key, &data).await {
            Ok(()) => {
                self.metrics
                    .s3_events_stored_total
                    .fetch_add(num_events as u64, Ordering::Relaxed);
            }
            Err(e) => {
                if !e.is_cancelled() {
                    warn!(key, error = %e, "upload failed, parking batch");
                }
                if let Err(e) = self.dlq.save(&data, num_events).await {
                    error!(error = %e, "failure queue save failed");
                }
            }
        }

        // The encoded buffer returns to its pool when `data` drops;
        // the events go back to theirs here.
        self.encoder.recycle(job.events);
    }
}
