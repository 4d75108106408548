//! Configuration for the ingest server
//!
//! Uses the `config` crate for layered configuration: built-in defaults,
//! then an optional file, then environment variables. The environment
//! surface matches the deployment contract (`AWS_REGION`, `RAW_BUCKET`,
//! `BATCH_SIZE`, ...); durations accept humantime strings like `5s` or
//! `24h`. All values are resolved once at startup and immutable
//! afterwards.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};

/// Full option surface for one server process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // ------------------------------------------------------------------
    // Object store
    // ------------------------------------------------------------------
    /// AWS region for the S3 client (required)
    #[serde(default)]
    pub aws_region: String,

    /// Destination bucket (required)
    #[serde(default)]
    pub raw_bucket: String,

    /// Key prefix for successfully encoded batches
    #[serde(default = "default_raw_prefix")]
    pub raw_prefix: String,

    /// Key prefix for unrecoverable or corrupt batches
    #[serde(default = "default_dlq_prefix")]
    pub dlq_prefix: String,

    // ------------------------------------------------------------------
    // Identity / network
    // ------------------------------------------------------------------
    /// Unique id of this process, embedded in every filename. Defaults
    /// to the container hostname, falling back to a random id.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    /// HTTP bind address
    #[serde(default = "default_http_addr")]
    pub http_addr: String,

    // ------------------------------------------------------------------
    // Request handling / batching
    // ------------------------------------------------------------------
    /// Maximum accepted request body (or query string) in bytes
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,

    /// Event channel capacity; the backpressure boundary for handlers
    #[serde(default = "default_channel_size")]
    pub channel_size: usize,

    /// Upload channel capacity
    #[serde(default = "default_upload_queue")]
    pub upload_queue: usize,

    /// Events per batch before a size-triggered flush
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum time a partial batch may wait before a flush
    #[serde(with = "humantime_serde", default = "default_flush_interval")]
    pub flush_interval: Duration,

    // ------------------------------------------------------------------
    // Upload policy
    // ------------------------------------------------------------------
    /// Timeout for a single PUT attempt
    #[serde(with = "humantime_serde", default = "default_s3_timeout")]
    pub s3_timeout: Duration,

    /// Application-level attempts per upload (SDK retries are disabled)
    #[serde(default = "default_s3_app_retries")]
    pub s3_app_retries: u32,

    // ------------------------------------------------------------------
    // Local failure queue
    // ------------------------------------------------------------------
    /// Directory for parked batches
    #[serde(default = "default_dlq_dir")]
    pub dlq_dir: String,

    /// Parked batches older than this (filename timestamp) are deleted
    #[serde(with = "humantime_serde", default = "default_dlq_max_age")]
    pub dlq_max_age: Duration,

    /// Byte budget for the failure-queue directory; 0 disables the cap
    #[serde(default = "default_dlq_max_size_bytes")]
    pub dlq_max_size_bytes: i64,

    // ------------------------------------------------------------------
    // Logging
    // ------------------------------------------------------------------
    /// Minimum level: trace/debug/info/warn/error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Human-readable console output instead of JSON
    #[serde(default)]
    pub log_pretty: bool,
}

fn default_raw_prefix() -> String {
    "raw".to_string()
}

fn default_dlq_prefix() -> String {
    "raw_dlq".to_string()
}

fn default_instance_id() -> String {
    if let Ok(host) = std::env::var("HOSTNAME") {
        if !host.is_empty() {
            return host;
        }
    }
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}

fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_body_size() -> usize {
    64 * 1024
}

fn default_channel_size() -> usize {
    10_000
}

fn default_upload_queue() -> usize {
    8
}

fn default_batch_size() -> usize {
    1000
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_s3_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_s3_app_retries() -> u32 {
    2
}

fn default_dlq_dir() -> String {
    "/data/dlq".to_string()
}

fn default_dlq_max_age() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_dlq_max_size_bytes() -> i64 {
    512 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            aws_region: String::new(),
            raw_bucket: String::new(),
            raw_prefix: default_raw_prefix(),
            dlq_prefix: default_dlq_prefix(),
            instance_id: default_instance_id(),
            http_addr: default_http_addr(),
            max_body_size: default_max_body_size(),
            channel_size: default_channel_size(),
            upload_queue: default_upload_queue(),
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval(),
            s3_timeout: default_s3_timeout(),
            s3_app_retries: default_s3_app_retries(),
            dlq_dir: default_dlq_dir(),
            dlq_max_age: default_dlq_max_age(),
            dlq_max_size_bytes: default_dlq_max_size_bytes(),
            log_level: default_log_level(),
            log_pretty: false,
        }
    }
}

impl Config {
    /// Load configuration from defaults, an optional file, and the
    /// environment (highest precedence).
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        builder = builder
            .add_source(config::Config::try_from(&Self::default()).map_err(config_err)?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        builder = builder.add_source(config::Environment::default().try_parsing(true));

        let cfg: Self = builder
            .build()
            .map_err(config_err)?
            .try_deserialize()
            .map_err(config_err)?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Fail fast on options that would only surface as runtime faults.
    pub fn validate(&self) -> Result<()> {
        if self.aws_region.is_empty() {
            return Err(IngestError::config("AWS_REGION is required"));
        }
        if self.raw_bucket.is_empty() {
            return Err(IngestError::config("RAW_BUCKET is required"));
        }
        if self.batch_size == 0 {
            return Err(IngestError::config("BATCH_SIZE must be at least 1"));
        }
        if self.channel_size == 0 {
            return Err(IngestError::config("CHANNEL_SIZE must be at least 1"));
        }
        if self.s3_app_retries == 0 {
            return Err(IngestError::config("S3_APP_RETRIES must be at least 1"));
        }
        if self.flush_interval.is_zero() {
            return Err(IngestError::config("FLUSH_INTERVAL must be positive"));
        }
        if self.dlq_dir.is_empty() {
            return Err(IngestError::config("DLQ_DIR is required"));
        }
        Ok(())
    }
}

fn config_err(err: config::ConfigError) -> IngestError {
    IngestError::config(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.raw_prefix, "raw");
        assert_eq!(cfg.batch_size, 1000);
        assert_eq!(cfg.s3_timeout, Duration::from_secs(3));
        assert_eq!(cfg.s3_app_retries, 2);
        assert!(!cfg.instance_id.is_empty());
    }

    #[test]
    fn validate_requires_bucket_and_region() {
        let cfg = Config::default();
        assert!(matches!(
            cfg.validate(),
            Err(IngestError::Configuration { .. })
        ));

        let cfg = Config {
            aws_region: "ap-northeast-2".to_string(),
            raw_bucket: "events".to_string(),
            ..Config::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_batch() {
        let cfg = Config {
            aws_region: "ap-northeast-2".to_string(),
            raw_bucket: "events".to_string(),
            batch_size: 0,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }
}
