//! Configs of the ingest worker.
use std::time::Duration;

use quarry_workflow::worker::WorkerConfig;

use crate::catalog_dsn::leak_duration;

fn default_concurrency() -> &'static str {
    let s = WorkerConfig::DEFAULT_CONCURRENCY.to_string();
    Box::leak(Box::new(s))
}

fn default_poll_interval() -> &'static str {
    leak_duration(WorkerConfig::DEFAULT_POLL_INTERVAL)
}

fn default_step_timeout() -> &'static str {
    leak_duration(WorkerConfig::DEFAULT_STEP_TIMEOUT)
}

fn default_heartbeat_timeout() -> &'static str {
    leak_duration(WorkerConfig::DEFAULT_HEARTBEAT_TIMEOUT)
}

fn default_record_timeout() -> &'static str {
    leak_duration(WorkerConfig::DEFAULT_RECORD_TIMEOUT)
}

fn default_stale_after() -> &'static str {
    leak_duration(WorkerConfig::DEFAULT_STALE_AFTER)
}

/// CLI config for the ingest worker.
#[derive(Debug, Clone, clap::Parser)]
pub struct WorkerCliConfig {
    /// Identity the worker claims runs under. Defaults to a random id.
    #[clap(long = "worker-id", env = "QUARRY_WORKER_ID", action)]
    pub worker_id: Option<String>,

    /// Maximum number of runs executed at the same time.
    #[clap(
        long = "worker-concurrency",
        env = "QUARRY_WORKER_CONCURRENCY",
        default_value = default_concurrency(),
        value_parser = clap::value_parser!(u64).range(1..),
    )]
    pub concurrency: u64,

    /// Delay between polls for new runs when none is claimable.
    #[clap(
        long = "worker-poll-interval",
        env = "QUARRY_WORKER_POLL_INTERVAL",
        default_value = default_poll_interval(),
        value_parser = humantime::parse_duration,
    )]
    pub poll_interval: Duration,

    /// Deadline of one transform attempt.
    #[clap(
        long = "transform-timeout",
        env = "QUARRY_TRANSFORM_TIMEOUT",
        default_value = default_step_timeout(),
        value_parser = humantime::parse_duration,
    )]
    pub step_timeout: Duration,

    /// Longest tolerated gap between two heartbeats of a running transformation.
    #[clap(
        long = "transform-heartbeat-timeout",
        env = "QUARRY_TRANSFORM_HEARTBEAT_TIMEOUT",
        default_value = default_heartbeat_timeout(),
        value_parser = humantime::parse_duration,
    )]
    pub heartbeat_timeout: Duration,

    /// Deadline of recording a partition in the catalog.
    #[clap(
        long = "record-timeout",
        env = "QUARRY_RECORD_TIMEOUT",
        default_value = default_record_timeout(),
        value_parser = humantime::parse_duration,
    )]
    pub record_timeout: Duration,

    /// Age of the last heartbeat after which a claimed run is taken over by another worker.
    #[clap(
        long = "worker-stale-after",
        env = "QUARRY_WORKER_STALE_AFTER",
        default_value = default_stale_after(),
        value_parser = humantime::parse_duration,
    )]
    pub stale_after: Duration,
}

impl WorkerCliConfig {
    /// Worker config heartbeating at the given interval, which is the one the transformation
    /// is supervised with.
    pub fn worker_config(&self, heartbeat_interval: Duration) -> WorkerConfig {
        let worker_id = self
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()));

        WorkerConfig {
            worker_id,
            concurrency: usize::try_from(self.concurrency).unwrap_or(usize::MAX),
            poll_interval: self.poll_interval,
            step_timeout: self.step_timeout,
            heartbeat_timeout: self.heartbeat_timeout,
            heartbeat_interval,
            record_timeout: self.record_timeout,
            stale_after: self.stale_after,
        }
    }
}
