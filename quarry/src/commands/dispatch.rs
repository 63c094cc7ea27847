//! Command starting ingest runs for queued object storage notifications.

use std::sync::Arc;

use anyhow::Context;
use quarry_clap_blocks::{dispatcher::DispatcherConfig, workflow_store::WorkflowStoreConfig};
use quarry_dispatcher::{DispatchSummary, EventDispatcher, QueueMessage};
use tokio::{
    fs::File,
    io::{AsyncBufRead, AsyncBufReadExt, BufReader},
};
use tracing::{error, info};

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    #[clap(flatten)]
    workflow_store: WorkflowStoreConfig,

    #[clap(flatten)]
    dispatcher: DispatcherConfig,

    /// File of queue messages, one JSON object `{"message_id": ..., "body": ...}` per line.
    ///
    /// `-` reads standard input.
    #[clap(
        long = "input",
        short = 'i',
        env = "QUARRY_DISPATCH_INPUT",
        default_value = "-",
        action
    )]
    input: String,
}

pub(crate) async fn command(config: Config) -> anyhow::Result<()> {
    let store = config
        .workflow_store
        .get_store("quarry-dispatch")
        .await
        .context("cannot connect to workflow store")?;
    let dispatcher = EventDispatcher::new(
        Arc::clone(&store),
        config.dispatcher.destination_bucket,
    );

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = if config.input == "-" {
        Box::new(BufReader::new(tokio::io::stdin()))
    } else {
        let file = File::open(&config.input)
            .await
            .with_context(|| format!("cannot open {}", config.input))?;
        Box::new(BufReader::new(file))
    };

    let dispatched = dispatch_lines(&dispatcher, reader).await;
    store.shutdown().await;
    let (summary, failed) = dispatched?;

    info!(%summary, failed, "dispatch finished");
    println!("{summary}");

    if failed > 0 {
        anyhow::bail!("{failed} message(s) could not be dispatched");
    }
    Ok(())
}

/// Dispatch every non-blank line of `reader` as a [`QueueMessage`].
///
/// A failing message does not stop the remaining ones; returns the merged summary and the number
/// of failed messages.
async fn dispatch_lines<R>(
    dispatcher: &EventDispatcher,
    reader: R,
) -> anyhow::Result<(DispatchSummary, usize)>
where
    R: AsyncBufRead + Unpin + Send,
{
    let mut lines = reader.lines();
    let mut summary = DispatchSummary::default();
    let mut failed = 0;
    let mut line_number = 0_usize;

    while let Some(line) = lines.next_line().await.context("cannot read messages")? {
        line_number += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let message: QueueMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                error!(line_number, %e, "malformed queue message");
                failed += 1;
                continue;
            }
        };

        match dispatcher.handle_message(&message).await {
            Ok(outcome) => summary.merge(outcome),
            Err(e) => {
                error!(line_number, message_id = ?message.message_id, %e, "cannot dispatch message");
                failed += 1;
            }
        }
    }

    Ok((summary, failed))
}

#[cfg(test)]
mod tests {
    use quarry_types::WorkflowId;
    use quarry_workflow::{
        interface::{RunStatus, WorkflowStore},
        mem::MemWorkflowStore,
    };

    use super::*;

    fn message_line(message_id: &str, key: &str, event_name: &str) -> String {
        let body = serde_json::json!({
            "Records": [{
                "eventName": event_name,
                "awsRegion": "us-east-1",
                "s3": {"bucket": {"name": "raw"}, "object": {"key": key}},
            }]
        });
        serde_json::json!({"message_id": message_id, "body": body.to_string()}).to_string()
    }

    #[test_log::test(tokio::test)]
    async fn dispatches_each_line() {
        let store: Arc<dyn WorkflowStore> = Arc::new(MemWorkflowStore::new());
        let dispatcher = EventDispatcher::new(Arc::clone(&store), "lake");

        let input = [
            message_line(
                "m1",
                "tenant_id=acme/table=web_requests/part-001.json",
                "ObjectCreated:Put",
            ),
            String::new(),
            // redelivery
            message_line(
                "m1",
                "tenant_id=acme/table=web_requests/part-001.json",
                "ObjectCreated:Put",
            ),
            message_line(
                "m2",
                "tenant_id=acme/table=web_requests/part-001.json",
                "ObjectRemoved:Delete",
            ),
            "not json".to_owned(),
            message_line("m3", "unpartitioned/part-002.json", "ObjectCreated:Put"),
            message_line(
                "m4",
                "tenant_id=acme/table=web_requests/part-003.json",
                "ObjectCreated:Copy",
            ),
        ]
        .join("\n");

        let (summary, failed) = dispatch_lines(&dispatcher, input.as_bytes()).await.unwrap();
        assert_eq!(
            summary,
            DispatchSummary {
                started: 2,
                deduplicated: 1,
                skipped: 1,
            }
        );
        assert_eq!(failed, 2);

        let run = store
            .describe(&WorkflowId::for_ingest("acme", "web_requests", "part-001.json"))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.idempotency_token, "m1");
        assert_eq!(run.request.destination, "lake");
    }
}
