//! Configs of the event dispatcher.

/// CLI config for the event dispatcher.
#[derive(Debug, Clone, clap::Parser)]
pub struct DispatcherConfig {
    /// Bucket the transformation writes partitions to.
    #[clap(
        long = "destination-bucket",
        env = "QUARRY_DESTINATION_BUCKET",
        action
    )]
    pub destination_bucket: String,
}
