//! Manage process shutdown
//!
//! Long running components of a quarry process, e.g. the ingest worker or the catalog gRPC server,
//! [`register`][ShutdownManager::register] with a [`ShutdownManager`] and get a [`ShutdownToken`].
//! Once shutdown is invoked, either by a signal or by a component that hit an unrecoverable error,
//! every token wakes up. The components stop taking new work, hand back whatever they hold and
//! signal [`complete`][ShutdownToken::complete]. [`ShutdownManager::join`] returns after all of
//! them did, so the process can release shared resources such as database pools last.
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{info, warn};

/// Wait for a `SIGTERM` or `SIGINT` to stop the process on UNIX systems
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = term.recv() => info!("Received SIGTERM"),
        _ = int.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

/// Wait for a `ctrl+c` to stop the process on other systems
#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received SIGINT");
    Ok(())
}

/// Manage process shutdown
#[derive(Debug, Default)]
pub struct ShutdownManager {
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component that needs to clean up before the process may exit.
    ///
    /// The caller must [`complete`][ShutdownToken::complete] the returned token, or drop all
    /// copies of it, for [`join`][Self::join] to return.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(&self, component: &'static str) -> ShutdownToken {
        let (tx, rx) = oneshot::channel();
        self.tasks.spawn(async move {
            match rx.await {
                Ok(()) => info!(component, "component shut down"),
                Err(_) => warn!(component, "component dropped its shutdown token"),
            }
        });
        ShutdownToken::new(self.shutdown.clone(), tx)
    }

    /// Invoke shutdown, waking up every registered component.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait for all registered components to complete.
    pub async fn join(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Like [`join`][Self::join], but gives up after `grace`. Returns whether all components
    /// completed in time.
    pub async fn join_with_timeout(&self, grace: Duration) -> bool {
        match tokio::time::timeout(grace, self.join()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    remaining = self.tasks.len(),
                    ?grace,
                    "components did not shut down in time"
                );
                false
            }
        }
    }
}

/// A token that a component obtains via [`register`][ShutdownManager::register]
///
/// Copies can be handed to sub-components that may need to trigger a shutdown themselves.
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    token: CancellationToken,
    complete_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl ShutdownToken {
    fn new(token: CancellationToken, complete_tx: oneshot::Sender<()>) -> Self {
        Self {
            token,
            complete_tx: Arc::new(Mutex::new(Some(complete_tx))),
        }
    }

    /// Trigger process shutdown due to some unrecoverable state
    pub fn trigger_shutdown(&self) {
        self.token.cancel();
    }

    /// Future that completes when the [`ShutdownManager`] that issued this token is shut down
    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// A cancellation token that fires on shutdown, for components driven by one.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Signal back to the [`ShutdownManager`] that the component owning this token finished
    /// cleaning up.
    pub fn complete(&self) {
        if let Some(s) = self.complete_tx.lock().take() {
            let _ = s.send(());
        }
    }
}
