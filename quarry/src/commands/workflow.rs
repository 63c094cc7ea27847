//! Commands inspecting and canceling ingest runs.

use anyhow::Context;
use quarry_clap_blocks::workflow_store::WorkflowStoreConfig;
use quarry_types::WorkflowId;
use quarry_workflow::interface::WorkflowRun;
use tracing::info;

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    #[clap(flatten)]
    workflow_store: WorkflowStoreConfig,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Parser)]
enum Command {
    /// Print the latest run of a workflow as JSON
    Describe(Target),

    /// Cancel the running run of a workflow and print it as JSON
    Cancel(Target),
}

#[derive(Debug, clap::Parser)]
struct Target {
    /// Workflow id, e.g. `ingest/acme/web_requests/part-001.json`.
    #[clap(action)]
    workflow_id: String,
}

pub(crate) async fn command(config: Config) -> anyhow::Result<()> {
    let store = config
        .workflow_store
        .get_store("quarry-workflow")
        .await
        .context("cannot connect to workflow store")?;

    let result = match &config.command {
        Command::Describe(target) => store
            .describe(&WorkflowId::from_raw(&target.workflow_id))
            .await
            .with_context(|| format!("cannot describe {}", target.workflow_id)),
        Command::Cancel(target) => {
            let workflow_id = WorkflowId::from_raw(&target.workflow_id);
            let run = store
                .request_cancel(&workflow_id)
                .await
                .with_context(|| format!("cannot cancel {workflow_id}"));
            if let Ok(run) = &run {
                info!(%workflow_id, run_id=%run.run_id, status=%run.status, "cancellation requested");
            }
            run
        }
    };
    store.shutdown().await;

    println!("{}", render(&result?)?);
    Ok(())
}

fn render(run: &WorkflowRun) -> anyhow::Result<String> {
    serde_json::to_string_pretty(run).context("cannot render run")
}

#[cfg(test)]
mod tests {
    use quarry_types::IngestRequest;

    use super::*;

    #[test]
    fn renders_run_as_json() {
        let run = WorkflowRun::new(
            IngestRequest {
                tenant_id: "acme".into(),
                table: "web_requests".into(),
                source: "raw".into(),
                destination: "lake".into(),
                location: "tenant_id=acme/table=web_requests/part-001.json".into(),
                object_path: "part-001.json".into(),
            },
            "m1",
        );

        let rendered: serde_json::Value = serde_json::from_str(&render(&run).unwrap()).unwrap();
        assert_eq!(
            rendered["workflow_id"],
            "ingest/acme/web_requests/part-001.json"
        );
        assert_eq!(rendered["status"], "running");
        assert_eq!(rendered["state"], "started");
        assert_eq!(rendered["idempotency_token"], "m1");
    }
}
