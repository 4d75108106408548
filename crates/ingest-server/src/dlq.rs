//! Local failure queue
//!
//! Durable on-disk parking lot for encoded batches the uploader could
//! not deliver. A parked batch is a pair of files sharing the base name
//! `<unix>_<instance>_<counter>.jsonl.gz`:
//!
//! - the data file with the gzip+JSONL payload
//! - a sidecar `<base>.meta.json` holding `{"num_events": N}`
//!
//! The filename's epoch-seconds prefix is authoritative for both
//! replay ordering and TTL. A data file without a sidecar is valid
//! (`num_events` defaults to 1); a sidecar without its data file is an
//! orphan and is removed at startup.
//!
//! Selection never pays O(N) in the directory size: the picker reads at
//! most [`SCAN_LIMIT`] directory entries and takes the lexicographic
//! minimum of that subset. Filenames sort in time order, so the result
//! is the oldest of the scanned window; repeated draining cycles every
//! parked file through the window eventually.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ingest_core::prelude::*;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::uploader::ObjectUploader;

/// Upper bound on directory entries examined per pick
const SCAN_LIMIT: usize = 1000;

/// Sidecar suffix appended to the data-file name
const META_SUFFIX: &str = ".meta.json";

/// Replay-time metadata persisted next to each data file.
#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    num_events: i64,
}

/// Manages the failure-queue directory: save, capacity and TTL
/// eviction, and validated replay. The directory has exactly one
/// writer (this process) for its whole lifetime.
pub struct DlqManager {
    dir: PathBuf,
    max_age: Duration,
    max_size_bytes: i64,
    raw_prefix: String,
    dlq_prefix: String,
    keys: Arc<KeyFactory>,
    clock: Arc<TimeCache>,
    uploader: Arc<dyn ObjectUploader>,
    metrics: Arc<Metrics>,
    size_bytes: AtomicI64,
}

impl DlqManager {
    /// Create the directory if needed and take stock of what survived
    /// the last process: orphan sidecars are deleted, and the byte and
    /// file-count gauges are restored from the remaining data files.
    /// This is the only full directory enumeration the queue ever does.
    pub fn new(
        cfg: &Config,
        keys: Arc<KeyFactory>,
        clock: Arc<TimeCache>,
        uploader: Arc<dyn ObjectUploader>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let dir = PathBuf::from(&cfg.dlq_dir);
        std::fs::create_dir_all(&dir).map_err(|e| {
            IngestError::queue_with_source(format!("cannot create {}", dir.display()), e)
        })?;

        let mut total: i64 = 0;
        let mut count: i64 = 0;

        let entries = std::fs::read_dir(&dir).map_err(|e| {
            IngestError::queue_with_source(format!("cannot read {}", dir.display()), e)
        })?;

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();

            if path.is_dir() || name.starts_with('.') {
                continue;
            }

            if let Some(data_name) = name.strip_suffix(META_SUFFIX) {
                // Orphan sidecar: the matching data file is gone.
                if !dir.join(data_name).exists() {
                    let _ = std::fs::remove_file(&path);
                    debug!(file = %name, "removed orphan sidecar");
                }
                continue;
            }

            if let Ok(md) = entry.metadata() {
                total += md.len() as i64;
                count += 1;
            }
        }

        if count > 0 {
            info!(files = count, bytes = total, "restored failure queue state");
        }
        metrics.dlq_size_bytes.fetch_add(total, Ordering::Relaxed);
        metrics.dlq_files_current.fetch_add(count, Ordering::Relaxed);

        Ok(Self {
            dir,
            max_age: cfg.dlq_max_age,
            max_size_bytes: cfg.dlq_max_size_bytes,
            raw_prefix: cfg.raw_prefix.clone(),
            dlq_prefix: cfg.dlq_prefix.clone(),
            keys,
            clock,
            uploader,
            metrics,
            size_bytes: AtomicI64::new(total),
        })
    }

    /// Park an encoded batch on disk.
    ///
    /// The caller has already been told the upload failed; from here the
    /// batch either waits for replay or, when capacity cannot be made,
    /// is counted as dropped. Dropping is the terminal outcome, so this
    /// returns `Ok` either way.
    pub async fn save(&self, data: &[u8], num_events: usize) -> Result<()> {
        if data.is_empty() || num_events == 0 {
            return Ok(());
        }

        let size = data.len() as i64;
        if !self.ensure_capacity(size).await {
            warn!(bytes = size, events = num_events, "failure queue full, dropping batch");
            self.metrics
                .dlq_events_dropped_total
                .fetch_add(num_events as u64, Ordering::Relaxed);
            return Ok(());
        }

        let filename = self.keys.new_filename();
        let data_path = self.dir.join(&filename);
        let meta_path = meta_path_for(&data_path);

        // Dot-prefixed temp name so a partial write never enters the
        // picker; rename makes the data file appear complete or not at
        // all.
        let tmp_path = self.dir.join(format!(".{filename}.tmp"));
        tokio::fs::write(&tmp_path, data).await.map_err(|e| {
            IngestError::queue_with_source(format!("write {} failed", tmp_path.display()), e)
        })?;
        tokio::fs::rename(&tmp_path, &data_path).await.map_err(|e| {
            IngestError::queue_with_source(format!("rename to {} failed", data_path.display()), e)
        })?;

        let sidecar = Sidecar {
            num_events: num_events as i64,
        };
        match serde_json::to_vec(&sidecar) {
            Ok(meta) => {
                if let Err(e) = tokio::fs::write(&meta_path, meta).await {
                    warn!(file = %filename, error = %e, "sidecar write failed");
                }
            }
            Err(e) => warn!(file = %filename, error = %e, "sidecar encode failed"),
        }

        self.size_bytes.fetch_add(size, Ordering::Relaxed);
        self.metrics.dlq_size_bytes.fetch_add(size, Ordering::Relaxed);
        self.metrics.dlq_files_current.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .dlq_events_enqueued_total
            .fetch_add(num_events as u64, Ordering::Relaxed);

        debug!(file = %filename, bytes = size, events = num_events, "batch parked");
        Ok(())
    }

    /// Evict oldest files until `incoming` bytes fit under the budget.
    /// Returns false when the directory is empty and there is still not
    /// enough room. Terminates because every iteration deletes a file.
    async fn ensure_capacity(&self, incoming: i64) -> bool {
        if self.max_size_bytes <= 0 {
            return true;
        }

        loop {
            if self.size_bytes.load(Ordering::Relaxed) + incoming <= self.max_size_bytes {
                return true;
            }

            let Some(oldest) = self.pick_oldest().await else {
                return false;
            };

            let data_path = self.dir.join(&oldest);
            let meta_path = meta_path_for(&data_path);

            if let Ok(md) = tokio::fs::metadata(&data_path).await {
                let size = md.len() as i64;
                self.size_bytes.fetch_sub(size, Ordering::Relaxed);
                self.metrics.dlq_size_bytes.fetch_sub(size, Ordering::Relaxed);
            }

            let _ = tokio::fs::remove_file(&data_path).await;
            let _ = tokio::fs::remove_file(&meta_path).await;

            self.metrics.dlq_files_current.fetch_sub(1, Ordering::Relaxed);
            self.metrics
                .dlq_files_expired_total
                .fetch_add(1, Ordering::Relaxed);

            warn!(file = %oldest, "evicted for capacity");
        }
    }

    /// Pick the oldest data file from a bounded directory read.
    ///
    /// Reads at most [`SCAN_LIMIT`] entries, skips sidecars and
    /// dotfiles, and returns the lexicographic minimum: the oldest of
    /// the scanned window, since filenames sort in time order.
    async fn pick_oldest(&self) -> Option<String> {
        let mut rd = tokio::fs::read_dir(&self.dir).await.ok()?;

        let mut oldest: Option<String> = None;
        let mut seen = 0;

        while let Ok(Some(entry)) = rd.next_entry().await {
            seen += 1;
            let name = entry.file_name().to_string_lossy().into_owned();

            if !name.ends_with(META_SUFFIX) && !name.starts_with('.') && !name.is_empty() {
                match &oldest {
                    Some(current) if name.as_str() >= current.as_str() => {}
                    _ => oldest = Some(name),
                }
            }

            if seen >= SCAN_LIMIT {
                break;
            }
        }

        oldest
    }

    /// Replay one parked batch: TTL check, gzip/JSON validation, then
    /// re-upload to the raw prefix (valid) or the dead-letter prefix
    /// (corrupt). Returns whether any progress was made so idle-time
    /// callers can stop early.
    pub async fn replay_one(&self, token: &CancellationToken) -> bool {
        if token.is_cancelled() {
            return false;
        }

        let Some(name) = self.pick_oldest().await else {
            return false;
        };

        let data_path = self.dir.join(&name);
        let meta_path = meta_path_for(&data_path);

        let size = match tokio::fs::metadata(&data_path).await {
            Ok(md) => md.len() as i64,
            Err(_) => {
                // Data file vanished between pick and stat; clear any
                // residue and move on.
                let _ = tokio::fs::remove_file(&meta_path).await;
                self.metrics.dlq_files_current.fetch_sub(1, Ordering::Relaxed);
                return true;
            }
        };

        if !self.max_age.is_zero() {
            if let Some(created) = unix_from_filename(&name) {
                let age = self.clock.unix().saturating_sub(created);
                if age > self.max_age.as_secs() as i64 {
                    let _ = tokio::fs::remove_file(&data_path).await;
                    let _ = tokio::fs::remove_file(&meta_path).await;

                    self.size_bytes.fetch_sub(size, Ordering::Relaxed);
                    self.metrics.dlq_size_bytes.fetch_sub(size, Ordering::Relaxed);
                    self.metrics.dlq_files_current.fetch_sub(1, Ordering::Relaxed);
                    self.metrics
                        .dlq_files_expired_total
                        .fetch_add(1, Ordering::Relaxed);

                    info!(file = %name, age_secs = age, "expired parked batch");
                    return true;
                }
            }
            // Unparseable filename prefix: skip the TTL check and
            // continue with the replay.
        }

        if token.is_cancelled() {
            return false;
        }

        let valid = {
            let path = data_path.clone();
            tokio::task::spawn_blocking(move || validate_file(&path))
                .await
                .unwrap_or(false)
        };

        let key = if valid {
            self.keys.object_key(&self.raw_prefix, &name)
        } else {
            self.keys.object_key(&self.dlq_prefix, &name)
        };

        if let Err(e) = self
            .uploader
            .upload_file(token, &key, &data_path, size as u64)
            .await
        {
            if !e.is_cancelled() {
                warn!(key, error = %e, "replay upload failed, keeping file");
            }
            return false;
        }

        let num_events = read_num_events(&meta_path).await;

        let _ = tokio::fs::remove_file(&data_path).await;
        let _ = tokio::fs::remove_file(&meta_path).await;

        self.size_bytes.fetch_sub(size, Ordering::Relaxed);
        self.metrics.dlq_size_bytes.fetch_sub(size, Ordering::Relaxed);
        self.metrics.dlq_files_current.fetch_sub(1, Ordering::Relaxed);
        self.metrics
            .dlq_events_reuploaded_total
            .fetch_add(num_events as u64, Ordering::Relaxed);

        info!(key, events = num_events, valid, "replayed parked batch");
        true
    }

    /// Current on-disk byte total, tracked without touching the
    /// filesystem.
    pub fn size_bytes(&self) -> i64 {
        self.size_bytes.load(Ordering::Relaxed)
    }
}

/// Sidecar path for a data file: append `.meta.json` to the full name.
fn meta_path_for(data_path: &Path) -> PathBuf {
    let mut os = data_path.as_os_str().to_owned();
    os.push(META_SUFFIX);
    PathBuf::from(os)
}

/// Parse the epoch-seconds prefix of `<unix>_<instance>_<counter>...`.
fn unix_from_filename(name: &str) -> Option<i64> {
    let (prefix, _) = name.split_once('_')?;
    let sec: i64 = prefix.parse().ok()?;
    (sec > 0).then_some(sec)
}

/// Check that the file is a readable gzip stream whose first non-empty
/// line parses as a JSON object.
fn validate_file(path: &Path) -> bool {
    use std::io::BufRead;

    let Ok(file) = std::fs::File::open(path) else {
        return false;
    };

    let decoder = flate2::read::GzDecoder::new(file);
    let reader = std::io::BufReader::new(decoder);

    for line in reader.lines() {
        let Ok(line) = line else {
            return false;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        return serde_json::from_str::<serde_json::Value>(line)
            .map(|v| v.is_object())
            .unwrap_or(false);
    }

    false
}

/// Read `num_events` from a sidecar; anything missing, unparseable, or
/// non-positive counts as one event.
async fn read_num_events(meta_path: &Path) -> i64 {
    match tokio::fs::read(meta_path).await {
        Ok(raw) => match serde_json::from_slice::<Sidecar>(&raw) {
            Ok(sidecar) if sidecar.num_events > 0 => sidecar.num_events,
            _ => 1,
        },
        Err(_) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records uploads; fails a scripted number of leading calls.
    struct RecordingUploader {
        puts: Mutex<Vec<(String, Vec<u8>)>>,
        fail_first: AtomicI64,
    }

    impl RecordingUploader {
        fn new() -> Arc<Self> {
            Self::failing(0)
        }

        fn failing(n: i64) -> Arc<Self> {
            Arc::new(Self {
                puts: Mutex::new(Vec::new()),
                fail_first: AtomicI64::new(n),
            })
        }

        fn keys(&self) -> Vec<String> {
            self.puts.lock().unwrap().iter().map(|(k, _)| k.clone()).collect()
        }
    }

    #[async_trait]
    impl ObjectUploader for RecordingUploader {
        async fn upload_bytes(
            &self,
            _token: &CancellationToken,
            key: &str,
            body: &[u8],
        ) -> Result<()> {
            if self.fail_first.fetch_sub(1, Ordering::SeqCst) > 0 {
                return Err(IngestError::upload("scripted failure"));
            }
            self.puts.lock().unwrap().push((key.to_string(), body.to_vec()));
            Ok(())
        }

        async fn upload_file(
            &self,
            token: &CancellationToken,
            key: &str,
            path: &Path,
            _size: u64,
        ) -> Result<()> {
            let body = tokio::fs::read(path).await
                .map_err(|e| IngestError::queue_with_source("read failed", e))?;
            self.upload_bytes(token, key, &body).await
        }
    }

    fn test_config(dir: &TempDir) -> Config {
        Config {
            aws_region: "ap-northeast-2".to_string(),
            raw_bucket: "events".to_string(),
            raw_prefix: "raw".to_string(),
            dlq_prefix: "raw_dlq".to_string(),
            dlq_dir: dir.path().to_string_lossy().into_owned(),
            dlq_max_age: Duration::from_secs(3600),
            dlq_max_size_bytes: 0,
            ..Config::default()
        }
    }

    fn manager_with(
        cfg: &Config,
        uploader: Arc<dyn ObjectUploader>,
        clock: Arc<TimeCache>,
    ) -> DlqManager {
        let metrics = Arc::new(Metrics::new());
        let keys = Arc::new(KeyFactory::new(Arc::clone(&clock), "test"));
        DlqManager::new(cfg, keys, clock, uploader, metrics).unwrap()
    }

    fn gzip_jsonl(lines: &[&str]) -> Vec<u8> {
        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        for line in lines {
            gz.write_all(line.as_bytes()).unwrap();
            gz.write_all(b"\n").unwrap();
        }
        gz.finish().unwrap()
    }

    fn clock() -> Arc<TimeCache> {
        TimeCache::frozen(1700000000, "2023-11-15", "08")
    }

    #[tokio::test]
    async fn save_writes_data_and_sidecar() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(&dir);
        let dlq = manager_with(&cfg, RecordingUploader::new(), clock());

        let payload = gzip_jsonl(&[r#"{"ts":1}"#]);
        dlq.save(&payload, 3).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.iter().any(|n| n.ends_with(".jsonl.gz")));
        assert!(names.iter().any(|n| n.ends_with(".meta.json")));

        assert_eq!(dlq.size_bytes(), payload.len() as i64);
        assert_eq!(
            dlq.metrics.dlq_events_enqueued_total.load(Ordering::Relaxed),
            3
        );
        assert_eq!(dlq.metrics.dlq_files_current.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn save_ignores_empty_input() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(&dir);
        let dlq = manager_with(&cfg, RecordingUploader::new(), clock());

        dlq.save(&[], 5).await.unwrap();
        dlq.save(b"data", 0).await.unwrap();

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn startup_scan_removes_orphan_sidecars_and_restores_gauges() {
        let dir = TempDir::new().unwrap();

        std::fs::write(dir.path().join("1700000000_a_000001.jsonl.gz"), b"12345").unwrap();
        std::fs::write(
            dir.path().join("1700000000_a_000001.jsonl.gz.meta.json"),
            br#"{"num_events":2}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("1690000000_a_000009.jsonl.gz.meta.json"),
            br#"{"num_events":9}"#,
        )
        .unwrap();

        let cfg = test_config(&dir);
        let dlq = manager_with(&cfg, RecordingUploader::new(), clock());

        assert!(!dir.path().join("1690000000_a_000009.jsonl.gz.meta.json").exists());
        assert_eq!(dlq.size_bytes(), 5);
        assert_eq!(dlq.metrics.dlq_files_current.load(Ordering::Relaxed), 1);
        assert_eq!(dlq.metrics.dlq_size_bytes.load(Ordering::Relaxed), 5);
    }

    #[tokio::test]
    async fn pick_oldest_skips_sidecars_and_dotfiles() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("1700000002_a_000002.jsonl.gz"), b"b").unwrap();
        std::fs::write(dir.path().join("1700000001_a_000001.jsonl.gz"), b"a").unwrap();
        std::fs::write(
            dir.path().join("1700000000_a_000000.jsonl.gz.meta.json"),
            b"{}",
        )
        .unwrap();
        std::fs::write(dir.path().join(".hidden"), b"x").unwrap();

        let cfg = test_config(&dir);
        let dlq = manager_with(&cfg, RecordingUploader::new(), clock());

        assert_eq!(
            dlq.pick_oldest().await.as_deref(),
            Some("1700000001_a_000001.jsonl.gz")
        );
    }

    #[tokio::test]
    async fn capacity_evicts_oldest_until_fit() {
        let dir = TempDir::new().unwrap();
        for i in 0..10 {
            std::fs::write(
                dir.path().join(format!("17000000{i:02}_a_0000{i:02}.jsonl.gz")),
                vec![b'x'; 200],
            )
            .unwrap();
        }

        let mut cfg = test_config(&dir);
        cfg.dlq_max_size_bytes = 1000;
        let dlq = manager_with(&cfg, RecordingUploader::new(), clock());
        assert_eq!(dlq.size_bytes(), 2000);

        let payload = vec![b'y'; 500];
        dlq.save(&payload, 7).await.unwrap();

        // 1500 bytes of old files must go to fit 500 under the 1000 cap.
        assert!(dlq.size_bytes() <= 1000);
        assert!(!dir.path().join("1700000000_a_000000.jsonl.gz").exists());
        assert_eq!(
            dlq.metrics.dlq_events_dropped_total.load(Ordering::Relaxed),
            0
        );
        assert!(dlq.metrics.dlq_files_expired_total.load(Ordering::Relaxed) >= 8);
    }

    #[tokio::test]
    async fn capacity_exhaustion_drops_the_batch() {
        let dir = TempDir::new().unwrap();
        let mut cfg = test_config(&dir);
        cfg.dlq_max_size_bytes = 100;
        let dlq = manager_with(&cfg, RecordingUploader::new(), clock());

        dlq.save(&vec![b'z'; 500], 4).await.unwrap();

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert_eq!(
            dlq.metrics.dlq_events_dropped_total.load(Ordering::Relaxed),
            4
        );
    }

    #[tokio::test]
    async fn replay_valid_file_goes_to_raw_prefix() {
        let dir = TempDir::new().unwrap();
        let payload = gzip_jsonl(&[r#"{"ts":1,"body":"a"}"#]);
        std::fs::write(dir.path().join("1700000000_a_000001.jsonl.gz"), &payload).unwrap();
        std::fs::write(
            dir.path().join("1700000000_a_000001.jsonl.gz.meta.json"),
            br#"{"num_events":4}"#,
        )
        .unwrap();

        let cfg = test_config(&dir);
        let uploader = RecordingUploader::new();
        let dlq = manager_with(&cfg, uploader.clone(), clock());

        let token = CancellationToken::new();
        assert!(dlq.replay_one(&token).await);

        let keys = uploader.keys();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].starts_with("raw/dt=2023-11-15/hr=08/"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert_eq!(
            dlq.metrics.dlq_events_reuploaded_total.load(Ordering::Relaxed),
            4
        );
        assert_eq!(dlq.metrics.dlq_files_current.load(Ordering::Relaxed), 0);
        assert_eq!(dlq.size_bytes(), 0);
    }

    #[tokio::test]
    async fn replay_corrupt_file_goes_to_dead_letter_prefix() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("1700000000_test_000001.jsonl.gz"),
            b"this is not gzip",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("1700000000_test_000001.jsonl.gz.meta.json"),
            br#"{"num_events":5}"#,
        )
        .unwrap();

        let cfg = test_config(&dir);
        let uploader = RecordingUploader::new();
        let dlq = manager_with(&cfg, uploader.clone(), clock());

        assert!(dlq.replay_one(&CancellationToken::new()).await);

        let keys = uploader.keys();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].starts_with("raw_dlq/dt=2023-11-15/hr=08/"));
        assert_eq!(uploader.puts.lock().unwrap()[0].1, b"this is not gzip");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert_eq!(
            dlq.metrics.dlq_events_reuploaded_total.load(Ordering::Relaxed),
            5
        );
    }

    #[tokio::test]
    async fn replay_expires_old_files_without_upload() {
        let dir = TempDir::new().unwrap();
        // Filename timestamp two hours older than the frozen clock.
        std::fs::write(
            dir.path().join("1699992800_a_000001.jsonl.gz"),
            gzip_jsonl(&[r#"{"ts":1}"#]),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("1699992800_a_000001.jsonl.gz.meta.json"),
            br#"{"num_events":2}"#,
        )
        .unwrap();

        let cfg = test_config(&dir);
        let uploader = RecordingUploader::new();
        let dlq = manager_with(&cfg, uploader.clone(), clock());

        assert!(dlq.replay_one(&CancellationToken::new()).await);

        assert!(uploader.keys().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert_eq!(
            dlq.metrics.dlq_files_expired_total.load(Ordering::Relaxed),
            1
        );
        assert_eq!(
            dlq.metrics.dlq_events_reuploaded_total.load(Ordering::Relaxed),
            0
        );
    }

    #[tokio::test]
    async fn replay_missing_sidecar_counts_one_event() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("1700000000_a_000001.jsonl.gz"),
            gzip_jsonl(&[r#"{"ts":1}"#]),
        )
        .unwrap();

        let cfg = test_config(&dir);
        let uploader = RecordingUploader::new();
        let dlq = manager_with(&cfg, uploader.clone(), clock());

        assert!(dlq.replay_one(&CancellationToken::new()).await);
        assert_eq!(
            dlq.metrics.dlq_events_reuploaded_total.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn replay_leaves_file_in_place_on_upload_failure() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("1700000000_a_000001.jsonl.gz"),
            gzip_jsonl(&[r#"{"ts":1}"#]),
        )
        .unwrap();

        let cfg = test_config(&dir);
        let uploader = RecordingUploader::failing(100);
        let dlq = manager_with(&cfg, uploader.clone(), clock());

        assert!(!dlq.replay_one(&CancellationToken::new()).await);
        assert!(dir.path().join("1700000000_a_000001.jsonl.gz").exists());
        assert_eq!(dlq.metrics.dlq_files_current.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn replay_respects_cancellation() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("1700000000_a_000001.jsonl.gz"),
            gzip_jsonl(&[r#"{"ts":1}"#]),
        )
        .unwrap();

        let cfg = test_config(&dir);
        let uploader = RecordingUploader::new();
        let dlq = manager_with(&cfg, uploader.clone(), clock());

        let token = CancellationToken::new();
        token.cancel();

        assert!(!dlq.replay_one(&token).await);
        assert!(uploader.keys().is_empty());
        assert!(dir.path().join("1700000000_a_000001.jsonl.gz").exists());
    }

    #[test]
    fn filename_timestamp_parsing() {
        assert_eq!(unix_from_filename("1700000000_a_000001.jsonl.gz"), Some(1700000000));
        assert_eq!(unix_from_filename("notanumber_a_000001.jsonl.gz"), None);
        assert_eq!(unix_from_filename("0_a_000001.jsonl.gz"), None);
        assert_eq!(unix_from_filename("plainfile"), None);
    }

    #[test]
    fn validation_accepts_first_nonempty_json_line() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("good.jsonl.gz");
        std::fs::write(&good, gzip_jsonl(&["", r#"{"ts":1}"#])).unwrap();
        assert!(validate_file(&good));

        let bad_json = dir.path().join("bad_json.jsonl.gz");
        std::fs::write(&bad_json, gzip_jsonl(&["not json"])).unwrap();
        assert!(!validate_file(&bad_json));

        let not_gzip = dir.path().join("not_gzip.jsonl.gz");
        std::fs::write(&not_gzip, b"raw bytes").unwrap();
        assert!(!validate_file(&not_gzip));

        let array_line = dir.path().join("array.jsonl.gz");
        std::fs::write(&array_line, gzip_jsonl(&["[1,2,3]"])).unwrap();
        assert!(!validate_file(&array_line));
    }
}
