//! Worker configuration.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use super::types::DEFAULT_QUEUE;

/// Worker runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Stamped on claimed rows; must be unique per running worker
    pub worker_id: String,
    /// Queue this worker polls
    pub job_queue: String,
    /// Maximum jobs executing at once
    pub max_concurrent: usize,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which a processing job is considered abandoned
    pub stale_after: Duration,
    pub reaper_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            job_queue: DEFAULT_QUEUE.to_string(),
            max_concurrent: 4,
            poll_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(15),
            stale_after: Duration::from_secs(300),
            reaper_interval: Duration::from_secs(60),
        }
    }
}

impl WorkerConfig {
    /// Read `TIDECRM_*` variables; unset or malformed values keep their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            worker_id: lookup("TIDECRM_WORKER_ID")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.worker_id),
            job_queue: lookup("TIDECRM_JOB_QUEUE")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.job_queue),
            max_concurrent: parse_or(&lookup, "TIDECRM_MAX_CONCURRENT", defaults.max_concurrent)
                .max(1),
            poll_interval: Duration::from_millis(parse_nonzero_or(
                &lookup,
                "TIDECRM_POLL_INTERVAL_MS",
                millis(defaults.poll_interval),
            )),
            heartbeat_interval: Duration::from_secs(parse_nonzero_or(
                &lookup,
                "TIDECRM_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval.as_secs(),
            )),
            stale_after: Duration::from_secs(parse_nonzero_or(
                &lookup,
                "TIDECRM_STALE_AFTER_SECS",
                defaults.stale_after.as_secs(),
            )),
            reaper_interval: Duration::from_secs(parse_nonzero_or(
                &lookup,
                "TIDECRM_REAPER_INTERVAL_SECS",
                defaults.reaper_interval.as_secs(),
            )),
        }
        .validated()
    }

    /// Replace settings the runtime cannot work with.
    ///
    /// Zero intervals fall back to their defaults. `stale_after` must exceed
    /// `heartbeat_interval`; otherwise it becomes
    /// the default, or four heartbeats when the default is too short.
    pub fn validated(mut self) -> Self {
        let defaults = Self::default();
        self.max_concurrent = self.max_concurrent.max(1);
        for (key, value, default) in [
            ("poll_interval", &mut self.poll_interval, defaults.poll_interval),
            ("heartbeat_interval", &mut self.heartbeat_interval, defaults.heartbeat_interval),
            ("stale_after", &mut self.stale_after, defaults.stale_after),
            ("reaper_interval", &mut self.reaper_interval, defaults.reaper_interval),
        ] {
            if value.is_zero() {
                warn!(key, default = ?default, "zero interval is not allowed; using default");
                *value = default;
            }
        }

        if self.stale_after <= self.heartbeat_interval {
            let replacement = if defaults.stale_after > self.heartbeat_interval {
                defaults.stale_after
            } else {
                self.heartbeat_interval.saturating_mul(4)
            };
            warn!(
                stale_after = ?self.stale_after,
                heartbeat_interval = ?self.heartbeat_interval,
                replacement = ?replacement,
                "stale_after must exceed heartbeat_interval"
            );
            self.stale_after = replacement;
        }
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_queue(mut self, job_queue: impl Into<String>) -> Self {
        self.job_queue = job_queue.into();
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    /// Zero is ignored.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.poll_interval = interval;
        }
        self
    }

    /// Zero is ignored.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.heartbeat_interval = interval;
        }
        self
    }

    /// Zero is ignored.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        if !stale_after.is_zero() {
            self.stale_after = stale_after;
        }
        self
    }

    /// Zero is ignored.
    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.reaper_interval = interval;
        }
        self
    }
}

fn default_worker_id() -> String {
    format!("worker-{}", uuid::Uuid::now_v7().simple())
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Copy + std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            warn!(key, value = %raw, default = %default, "invalid worker setting; using default");
            default
        }
    }
}

fn parse_nonzero_or<F>(lookup: &F, key: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    match parse_or(lookup, key, default) {
        0 => {
            warn!(key, default, "zero is not allowed for this worker setting; using default");
            default
        }
        value => value,
    }
}
