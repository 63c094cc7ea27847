//! Runs the external transformation binary as a supervised child process.
//!
//! The [`TransformSupervisor`] launches the binary with discrete arguments, emits a heartbeat on a
//! fixed interval while it runs and kills it when the caller's [`CancellationToken`] fires. On a
//! successful exit the binary's standard output is parsed into a [`Partition`].
//!
//! Exactly one of the following is returned for every run: a process error, a kill error, or the
//! parsed partition.

use std::{
    fmt::Debug,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use quarry_types::{Partition, TransformRequest};
use tokio::{
    io::AsyncReadExt,
    process::Command,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod output;

pub use output::OutputError;
use output::PartitionDescriptor;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to start transformation binary {path:?}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("transformation binary failed with {status}")]
    Exit { status: ExitStatus },

    #[error("failed to kill transformation binary: {0}")]
    Kill(#[source] std::io::Error),

    #[error("failed to wait for transformation binary: {0}")]
    Wait(#[source] std::io::Error),

    #[error("failed to read output of transformation binary: {0}")]
    ReadOutput(#[source] std::io::Error),

    #[error("transformation binary exited successfully but its output is invalid: {0}")]
    InvalidOutput(#[from] OutputError),

    #[error("transformation canceled")]
    Canceled,
}

impl Error {
    /// Errors caused by the child process itself rather than by cancellation.
    pub fn is_process_failure(&self) -> bool {
        !matches!(self, Self::Canceled | Self::InvalidOutput(_))
    }
}

/// Sink for liveness signals emitted while the transformation runs.
pub trait Heartbeat: Send + Sync + Debug {
    fn heartbeat(&self);
}

/// Heartbeat sink that drops every signal.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHeartbeat;

impl Heartbeat for NoopHeartbeat {
    fn heartbeat(&self) {}
}

/// Configuration of the [`TransformSupervisor`].
#[derive(Debug, Clone)]
pub struct TransformConfig {
    /// Path of the transformation binary.
    pub binary_path: PathBuf,

    /// Object store endpoint override handed to the binary as `--s3-endpoint`.
    pub store_endpoint: Option<String>,

    /// Interval between heartbeats while the binary runs.
    pub heartbeat_interval: Duration,
}

impl TransformConfig {
    /// Default value for [`heartbeat_interval`](Self::heartbeat_interval).
    pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

    pub fn new(binary_path: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
            store_endpoint: None,
            heartbeat_interval: Self::DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

/// Runs the transformation binary, see the [crate documentation](crate).
#[derive(Debug, Clone)]
pub struct TransformSupervisor {
    config: TransformConfig,
}

impl TransformSupervisor {
    pub fn new(config: TransformConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TransformConfig {
        &self.config
    }

    /// Arguments passed to the binary, one element per argument.
    pub fn args(&self, request: &TransformRequest) -> Vec<String> {
        let mut args = vec![
            "--source".to_owned(),
            request.source.clone(),
            "--location".to_owned(),
            request.location.clone(),
            "--destination".to_owned(),
            request.destination.clone(),
            "--tenant-id".to_owned(),
            request.tenant_id.clone(),
            "--table".to_owned(),
            request.table.clone(),
        ];
        if let Some(endpoint) = &self.config.store_endpoint {
            args.push("--s3-endpoint".to_owned());
            args.push(endpoint.clone());
        }
        args
    }

    /// Run the binary for `request` to completion.
    ///
    /// The child is killed and reaped before this returns [`Error::Canceled`] once `cancel`
    /// fires. Dropping the returned future kills the child as well.
    pub async fn run(
        &self,
        request: &TransformRequest,
        heartbeat: &dyn Heartbeat,
        cancel: &CancellationToken,
    ) -> Result<Partition, Error> {
        let args = self.args(request);
        info!(
            binary=?self.config.binary_path,
            ?args,
            "starting transformation binary"
        );

        let mut child = Command::new(&self.config.binary_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Spawn {
                path: self.config.binary_path.clone(),
                source,
            })?;

        // Polled alongside the child so a chatty child never blocks on a full pipe. Processes the
        // binary leaves behind may hold the pipe open after it exits.
        let mut pipe = child.stdout.take();
        let read_output = async move {
            let mut buf = Vec::new();
            if let Some(pipe) = pipe.as_mut() {
                pipe.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        };
        tokio::pin!(read_output);

        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut exited: Option<ExitStatus> = None;
        let mut output: Option<Vec<u8>> = None;
        let stdout = loop {
            if exited.is_some() {
                if let Some(output) = output.take() {
                    break output;
                }
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    if exited.is_none() {
                        warn!(pid=?child.id(), "transformation canceled, killing child");
                        child.kill().await.map_err(Error::Kill)?;
                    } else {
                        warn!("transformation canceled while its output is still open");
                    }
                    return Err(Error::Canceled);
                }
                status = child.wait(), if exited.is_none() => {
                    let status = status.map_err(Error::Wait)?;
                    if !status.success() {
                        warn!(%status, "transformation binary failed");
                        return Err(Error::Exit { status });
                    }
                    debug!("transformation binary exited, collecting output");
                    exited = Some(status);
                }
                res = &mut read_output, if output.is_none() => {
                    output = Some(res.map_err(Error::ReadOutput)?);
                }
                _ = ticker.tick() => {
                    debug!(pid=?child.id(), "transformation running");
                    heartbeat.heartbeat();
                }
            }
        };

        let partition = PartitionDescriptor::parse(&stdout)?.into_partition(request);
        info!(
            partition=%partition.name,
            size_bytes=partition.size_bytes,
            time_range=%partition.time_range,
            columns=partition.columns.len(),
            "transformation finished"
        );
        Ok(partition)
    }
}
