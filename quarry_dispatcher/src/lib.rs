//! Starts ingest workflow runs for newly created objects.
//!
//! The queue loop hands every message to [`EventDispatcher::handle_message`]. An `Err` means the
//! message was not handled and should be redelivered; starting a run twice for the same object is
//! harmless because the workflow store deduplicates starts.
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::{fmt, sync::Arc};

use quarry_types::{IngestRequest, WorkflowId};
use quarry_workflow::interface::{Error as StoreError, StartOutcome, WorkflowStore};
use serde::Deserialize;
use tracing::{debug, info, warn};

pub mod notification;

use notification::{Notification, ObjectKey};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("message {message_id} is not an object notification: {source}")]
    InvalidPayload {
        message_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("object key {key:?} does not match tenant_id=<tenant>/table=<table>/<path>: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("failed to start workflow {workflow_id}: {source}")]
    Dispatch {
        workflow_id: WorkflowId,
        #[source]
        source: StoreError,
    },
}

/// A message received from the notification queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct QueueMessage {
    /// Delivery id assigned by the queue, stable across redeliveries.
    #[serde(default, alias = "MessageId")]
    pub message_id: Option<String>,
    #[serde(default, alias = "Body")]
    pub body: Option<String>,
}

impl QueueMessage {
    pub fn new(message_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            message_id: Some(message_id.into()),
            body: Some(body.into()),
        }
    }
}

/// What became of the records of a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Records that started a new run.
    pub started: usize,
    /// Records whose workflow already had a running or completed run.
    pub deduplicated: usize,
    /// Records that are not object creations, and messages without id or body.
    pub skipped: usize,
}

impl DispatchSummary {
    pub fn merge(&mut self, other: Self) {
        self.started += other.started;
        self.deduplicated += other.deduplicated;
        self.skipped += other.skipped;
    }
}

impl fmt::Display for DispatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "started={} deduplicated={} skipped={}",
            self.started, self.deduplicated, self.skipped
        )
    }
}

#[derive(Debug)]
pub struct EventDispatcher {
    store: Arc<dyn WorkflowStore>,
    /// Bucket transformed data is written to.
    destination: String,
}

impl EventDispatcher {
    pub fn new(store: Arc<dyn WorkflowStore>, destination: impl Into<String>) -> Self {
        Self {
            store,
            destination: destination.into(),
        }
    }

    /// Start a run for every object-created record of the message.
    ///
    /// Messages without id or body are skipped. Records of other event types are skipped while the
    /// remaining records are still processed. The first record with a malformed key, or whose run
    /// cannot be started, fails the whole message.
    pub async fn handle_message(&self, message: &QueueMessage) -> Result<DispatchSummary, Error> {
        let mut summary = DispatchSummary::default();

        let Some(message_id) = message.message_id.as_deref() else {
            warn!("skipping message without message id");
            summary.skipped += 1;
            return Ok(summary);
        };
        let Some(body) = message.body.as_deref() else {
            warn!(message_id, "skipping message without body");
            summary.skipped += 1;
            return Ok(summary);
        };

        let notification: Notification =
            serde_json::from_str(body).map_err(|source| Error::InvalidPayload {
                message_id: message_id.to_owned(),
                source,
            })?;

        for record in &notification.records {
            if !record.is_object_created() {
                debug!(message_id, event_name = %record.event_name, "skipping record");
                summary.skipped += 1;
                continue;
            }

            let key = record
                .s3
                .object
                .decoded_key()
                .map_err(|reason| Error::InvalidKey {
                    key: record.s3.object.key.clone(),
                    reason,
                })?;
            let parsed = ObjectKey::parse(&key).ok_or_else(|| Error::InvalidKey {
                key: key.clone(),
                reason: "no match".into(),
            })?;

            let request = IngestRequest {
                tenant_id: parsed.tenant_id,
                table: parsed.table,
                source: record.s3.bucket.name.clone(),
                destination: self.destination.clone(),
                location: key,
                object_path: parsed.object_path,
            };
            let workflow_id = request.workflow_id();

            match self.store.start(request, message_id).await {
                Ok(StartOutcome::Started(run)) => {
                    info!(
                        message_id,
                        %workflow_id,
                        run_id = %run.run_id,
                        "dispatched ingest workflow"
                    );
                    summary.started += 1;
                }
                Ok(StartOutcome::Existing(run)) => {
                    info!(
                        message_id,
                        %workflow_id,
                        run_id = %run.run_id,
                        status = %run.status,
                        "ingest workflow already dispatched"
                    );
                    summary.deduplicated += 1;
                }
                Err(source) => {
                    return Err(Error::Dispatch {
                        workflow_id,
                        source,
                    })
                }
            }
        }

        Ok(summary)
    }
}
