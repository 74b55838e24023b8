use clap::Parser;
use std::time::Duration;

use crate::drain::DrainSettings;

const DEFAULT_DRAIN_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_MAX_CONCURRENT_EVICTIONS: usize = 5;
const DEFAULT_REQUEUE_SECONDS: u64 = 5;
const DEFAULT_CONFLICT_RETRIES: u32 = 5;
const DEFAULT_EVICTION_RETRY_BASE_MS: u64 = 200;
const DEFAULT_EVICTION_RETRY_MAX_MS: u64 = 5000;
const DEFAULT_DELETION_POLL_MS: u64 = 1000;

/// Controller settings, read from flags with environment fallbacks.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Cordons, taints and drains nodes named by NodeMaintenance requests")]
pub struct Config {
    /// Upper bound for a single drain pass
    #[arg(long, env = "DRAIN_TIMEOUT_SECONDS", default_value_t = DEFAULT_DRAIN_TIMEOUT_SECONDS)]
    pub drain_timeout_seconds: u64,

    /// Pods evicted in parallel during a drain pass
    #[arg(long, env = "MAX_CONCURRENT_EVICTIONS", default_value_t = DEFAULT_MAX_CONCURRENT_EVICTIONS)]
    pub max_concurrent_evictions: usize,

    /// Delay before a request with pending pods is reconciled again
    #[arg(long, env = "REQUEUE_SECONDS", default_value_t = DEFAULT_REQUEUE_SECONDS)]
    pub requeue_seconds: u64,

    /// Re-fetch and re-apply attempts when a write hits a conflict
    #[arg(long, env = "CONFLICT_RETRIES", default_value_t = DEFAULT_CONFLICT_RETRIES)]
    pub conflict_retries: u32,

    #[arg(long, env = "EVICTION_RETRY_BASE_MS", default_value_t = DEFAULT_EVICTION_RETRY_BASE_MS)]
    pub eviction_retry_base_ms: u64,

    #[arg(long, env = "EVICTION_RETRY_MAX_MS", default_value_t = DEFAULT_EVICTION_RETRY_MAX_MS)]
    pub eviction_retry_max_ms: u64,

    /// Interval for checking whether an evicted pod is gone
    #[arg(long, env = "DELETION_POLL_MS", default_value_t = DEFAULT_DELETION_POLL_MS)]
    pub deletion_poll_ms: u64,

    /// Watch pods to requeue requests as soon as pods leave a node
    #[arg(long, env = "WATCH_PODS", default_value_t = true, action = clap::ArgAction::Set)]
    pub watch_pods: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            drain_timeout_seconds: DEFAULT_DRAIN_TIMEOUT_SECONDS,
            max_concurrent_evictions: DEFAULT_MAX_CONCURRENT_EVICTIONS,
            requeue_seconds: DEFAULT_REQUEUE_SECONDS,
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
            eviction_retry_base_ms: DEFAULT_EVICTION_RETRY_BASE_MS,
            eviction_retry_max_ms: DEFAULT_EVICTION_RETRY_MAX_MS,
            deletion_poll_ms: DEFAULT_DELETION_POLL_MS,
            watch_pods: true,
        }
    }
}

impl Config {
    pub fn requeue_interval(&self) -> Duration {
        Duration::from_secs(self.requeue_seconds)
    }

    pub fn drain_settings(&self) -> DrainSettings {
        DrainSettings {
            timeout: Duration::from_secs(self.drain_timeout_seconds),
            concurrency: self.max_concurrent_evictions.max(1),
            retry_base: Duration::from_millis(self.eviction_retry_base_ms),
            retry_max: Duration::from_millis(self.eviction_retry_max_ms),
            deletion_poll: Duration::from_millis(self.deletion_poll_ms),
        }
    }
}
