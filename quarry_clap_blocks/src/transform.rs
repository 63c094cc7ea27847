//! Configs of the transformation binary.
use std::{path::PathBuf, time::Duration};

use quarry_transform::TransformConfig;

use crate::catalog_dsn::leak_duration;

fn default_heartbeat_interval() -> &'static str {
    leak_duration(TransformConfig::DEFAULT_HEARTBEAT_INTERVAL)
}

/// CLI config for running the transformation binary.
#[derive(Debug, Clone, clap::Parser)]
pub struct TransformCliConfig {
    /// Path of the binary converting a raw object into a partition.
    #[clap(
        long = "transform-binary",
        env = "QUARRY_TRANSFORM_BINARY",
        default_value = "quarry-transform",
        action
    )]
    pub binary: PathBuf,

    /// Object store endpoint handed to the binary, e.g. `http://localhost:9000` for a local
    /// S3 compatible store.
    #[clap(long = "s3-endpoint", env = "QUARRY_S3_ENDPOINT", action)]
    pub s3_endpoint: Option<String>,

    /// Interval between heartbeats while the binary runs.
    #[clap(
        long = "transform-heartbeat-interval",
        env = "QUARRY_TRANSFORM_HEARTBEAT_INTERVAL",
        default_value = default_heartbeat_interval(),
        value_parser = humantime::parse_duration,
    )]
    pub heartbeat_interval: Duration,
}

impl From<&TransformCliConfig> for TransformConfig {
    fn from(config: &TransformCliConfig) -> Self {
        Self {
            binary_path: config.binary.clone(),
            store_endpoint: config.s3_endpoint.clone(),
            heartbeat_interval: config.heartbeat_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn converts_to_supervisor_config() {
        let config = TransformCliConfig::try_parse_from(["worker"]).unwrap();
        let transform = TransformConfig::from(&config);
        assert_eq!(transform.binary_path, PathBuf::from("quarry-transform"));
        assert_eq!(transform.store_endpoint, None);
        assert_eq!(transform.heartbeat_interval, Duration::from_secs(5));

        let config = TransformCliConfig::try_parse_from([
            "worker",
            "--transform-binary",
            "/usr/local/bin/transform",
            "--s3-endpoint",
            "http://localhost:9000",
            "--transform-heartbeat-interval",
            "2s",
        ])
        .unwrap();
        let transform = TransformConfig::from(&config);
        assert_eq!(transform.binary_path, PathBuf::from("/usr/local/bin/transform"));
        assert_eq!(
            transform.store_endpoint.as_deref(),
            Some("http://localhost:9000")
        );
        assert_eq!(transform.heartbeat_interval, Duration::from_secs(2));
    }
}
