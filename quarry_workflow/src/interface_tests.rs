//! Behaviour every [`WorkflowStore`] implementation must exhibit.

use std::{future::Future, sync::Arc, time::Duration};

use assert_matches::assert_matches;
use quarry_types::{Column, ColumnType, IngestRequest, Partition, TimeRange, WorkflowId};

use crate::interface::{Error, IngestState, RunStatus, StartOutcome, WorkflowStore};

const LONG: Duration = Duration::from_secs(3600);

/// Runs the whole suite, calling `clean_state` for a fresh store before each test.
pub async fn test_workflow_store<R, F>(clean_state: R)
where
    R: Fn() -> F + Send + Sync,
    F: Future<Output = Arc<dyn WorkflowStore>> + Send,
{
    test_setup(clean_state().await).await;
    test_start_deduplicates(clean_state().await).await;
    test_reuse_after_failure(clean_state().await).await;
    test_completed_is_not_reused(clean_state().await).await;
    test_claim(clean_state().await).await;
    test_stale_claim(clean_state().await).await;
    test_state_transitions(clean_state().await).await;
    test_release(clean_state().await).await;
    test_cancel(clean_state().await).await;
    test_not_found(clean_state().await).await;
}

/// An ingest request for an object of the `acme` / `web_requests` table.
pub fn arbitrary_request(object_path: &str) -> IngestRequest {
    IngestRequest {
        tenant_id: "acme".into(),
        table: "web_requests".into(),
        source: "raw".into(),
        destination: "lake".into(),
        location: format!("tenant_id=acme/table=web_requests/{object_path}"),
        object_path: object_path.into(),
    }
}

fn arbitrary_partition() -> Partition {
    Partition {
        tenant_id: "acme".into(),
        table_name: "web_requests".into(),
        name: "p1".into(),
        size_bytes: 1024,
        time_range: TimeRange::new(1000, 2000),
        columns: vec![Column::new("id", ColumnType::Int64)],
    }
}

async fn test_setup(store: Arc<dyn WorkflowStore>) {
    store.setup().await.expect("first store setup");
    store.setup().await.expect("second store setup");
}

async fn test_start_deduplicates(store: Arc<dyn WorkflowStore>) {
    store.setup().await.unwrap();

    let request = arbitrary_request("part-001.json");
    let first = store.start(request.clone(), "msg-1").await.unwrap();
    let first = assert_matches!(first, StartOutcome::Started(run) => run);
    assert_eq!(
        first.workflow_id,
        WorkflowId::from_raw("ingest/acme/web_requests/part-001.json")
    );
    assert_eq!(first.status, RunStatus::Running);
    assert_eq!(first.state, IngestState::Started);
    assert_eq!(first.idempotency_token, "msg-1");
    assert_eq!(first.request, request);

    // the same notification delivered again
    let again = store.start(request.clone(), "msg-1").await.unwrap();
    assert_matches!(again, StartOutcome::Existing(run) if run.run_id == first.run_id);

    // a different notification for the same object
    let other = store.start(request, "msg-2").await.unwrap();
    assert_matches!(other, StartOutcome::Existing(run) if run.run_id == first.run_id);

    // other objects are independent
    let second = store
        .start(arbitrary_request("part-002.json"), "msg-3")
        .await
        .unwrap();
    assert!(second.is_started());
    assert_ne!(second.run().run_id, first.run_id);

    let described = store.describe(&first.workflow_id).await.unwrap();
    assert_eq!(described.run_id, first.run_id);
}

async fn test_reuse_after_failure(store: Arc<dyn WorkflowStore>) {
    store.setup().await.unwrap();

    for status in [RunStatus::Failed, RunStatus::TimedOut, RunStatus::Canceled] {
        let request = arbitrary_request(&format!("{status}.json"));
        let first = store.start(request.clone(), "msg-1").await.unwrap();
        let claimed = store.claim("w1", LONG).await.unwrap().unwrap();
        assert_eq!(claimed.run_id, first.run().run_id);
        store
            .close(claimed.run_id, "w1", status, Some("boom".into()))
            .await
            .unwrap();

        let closed = store.describe(&claimed.workflow_id).await.unwrap();
        assert_eq!(closed.status, status);
        assert_eq!(closed.failure.as_deref(), Some("boom"));
        assert_eq!(closed.owner, None);

        let second = store.start(request, "msg-1").await.unwrap();
        let second = assert_matches!(second, StartOutcome::Started(run) => run);
        assert_ne!(second.run_id, first.run().run_id);
        assert_eq!(
            store.describe(&second.workflow_id).await.unwrap().run_id,
            second.run_id
        );

        // leave nothing claimable behind for the next iteration
        let claimed = store.claim("w1", LONG).await.unwrap().unwrap();
        store.complete(claimed.run_id, "w1").await.unwrap();
    }
}

async fn test_completed_is_not_reused(store: Arc<dyn WorkflowStore>) {
    store.setup().await.unwrap();

    let request = arbitrary_request("part-001.json");
    store.start(request.clone(), "msg-1").await.unwrap();
    let claimed = store.claim("w1", LONG).await.unwrap().unwrap();
    store.complete(claimed.run_id, "w1").await.unwrap();

    let again = store.start(request, "msg-2").await.unwrap();
    let existing = assert_matches!(again, StartOutcome::Existing(run) => run);
    assert_eq!(existing.run_id, claimed.run_id);
    assert_eq!(existing.status, RunStatus::Completed);
    assert_eq!(existing.state, IngestState::Completed);
}

async fn test_claim(store: Arc<dyn WorkflowStore>) {
    store.setup().await.unwrap();

    assert_matches!(store.claim("w1", LONG).await, Ok(None));

    let started = store
        .start(arbitrary_request("part-001.json"), "msg-1")
        .await
        .unwrap();
    let claimed = store.claim("w1", LONG).await.unwrap().unwrap();
    assert_eq!(claimed.run_id, started.run().run_id);
    assert_eq!(claimed.owner.as_deref(), Some("w1"));
    assert!(claimed.heartbeat_at.is_some());

    // a fresh claim is not handed out twice
    assert_matches!(store.claim("w2", LONG).await, Ok(None));

    assert!(!store.heartbeat(claimed.run_id, "w1").await.unwrap());
    assert_matches!(
        store.heartbeat(claimed.run_id, "w2").await,
        Err(Error::LostOwnership { .. })
    );
}

async fn test_stale_claim(store: Arc<dyn WorkflowStore>) {
    store.setup().await.unwrap();

    store
        .start(arbitrary_request("part-001.json"), "msg-1")
        .await
        .unwrap();
    let first = store.claim("w1", LONG).await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = store
        .claim("w2", Duration::from_millis(10))
        .await
        .unwrap()
        .expect("stale claim is handed to another worker");
    assert_eq!(second.run_id, first.run_id);
    assert_eq!(second.owner.as_deref(), Some("w2"));

    // the previous owner is fenced off
    assert_matches!(
        store.heartbeat(first.run_id, "w1").await,
        Err(Error::LostOwnership { .. })
    );
    assert_matches!(
        store
            .enter_state(first.run_id, "w1", IngestState::Transforming)
            .await,
        Err(Error::LostOwnership { .. })
    );
    assert_matches!(
        store.complete(first.run_id, "w1").await,
        Err(Error::LostOwnership { .. })
    );
    store
        .enter_state(first.run_id, "w2", IngestState::Transforming)
        .await
        .unwrap();
}

async fn test_state_transitions(store: Arc<dyn WorkflowStore>) {
    store.setup().await.unwrap();

    store
        .start(arbitrary_request("part-001.json"), "msg-1")
        .await
        .unwrap();
    let run = store.claim("w1", LONG).await.unwrap().unwrap();

    store
        .enter_state(run.run_id, "w1", IngestState::Transforming)
        .await
        .unwrap();
    let described = store.describe(&run.workflow_id).await.unwrap();
    assert_eq!(described.state, IngestState::Transforming);
    assert_eq!(described.partition, None);

    let partition = arbitrary_partition();
    store
        .commit_transform(run.run_id, "w1", &partition)
        .await
        .unwrap();
    let described = store.describe(&run.workflow_id).await.unwrap();
    assert_eq!(described.state, IngestState::Recording);
    assert_eq!(described.partition, Some(partition));
    assert_eq!(described.status, RunStatus::Running);

    assert_matches!(
        store.close(run.run_id, "w1", RunStatus::Running, None).await,
        Err(Error::NotTerminal(RunStatus::Running))
    );

    store.complete(run.run_id, "w1").await.unwrap();
    let described = store.describe(&run.workflow_id).await.unwrap();
    assert_eq!(described.status, RunStatus::Completed);
    assert_eq!(described.state, IngestState::Completed);
    assert_eq!(described.owner, None);

    // closed runs are not claimable and reject further updates
    assert_matches!(store.claim("w1", Duration::ZERO).await, Ok(None));
    assert_matches!(
        store.complete(run.run_id, "w1").await,
        Err(Error::LostOwnership { .. })
    );
}

async fn test_release(store: Arc<dyn WorkflowStore>) {
    store.setup().await.unwrap();

    store
        .start(arbitrary_request("part-001.json"), "msg-1")
        .await
        .unwrap();
    let run = store.claim("w1", LONG).await.unwrap().unwrap();
    store
        .commit_transform(run.run_id, "w1", &arbitrary_partition())
        .await
        .unwrap();
    store.release(run.run_id, "w1").await.unwrap();

    let described = store.describe(&run.workflow_id).await.unwrap();
    assert_eq!(described.owner, None);
    assert_eq!(described.status, RunStatus::Running);

    // resumed from the committed state
    let resumed = store.claim("w2", LONG).await.unwrap().unwrap();
    assert_eq!(resumed.run_id, run.run_id);
    assert_eq!(resumed.state, IngestState::Recording);
    assert_eq!(resumed.partition, Some(arbitrary_partition()));
}

async fn test_cancel(store: Arc<dyn WorkflowStore>) {
    store.setup().await.unwrap();

    // nobody holds a claim: canceled right away
    let unclaimed = store
        .start(arbitrary_request("part-001.json"), "msg-1")
        .await
        .unwrap();
    let canceled = store
        .request_cancel(&unclaimed.run().workflow_id)
        .await
        .unwrap();
    assert_eq!(canceled.status, RunStatus::Canceled);
    assert_eq!(canceled.state, IngestState::Canceled);
    assert_matches!(store.claim("w1", LONG).await, Ok(None));

    // claimed: flagged for the worker
    store
        .start(arbitrary_request("part-002.json"), "msg-2")
        .await
        .unwrap();
    let claimed = store.claim("w1", LONG).await.unwrap().unwrap();
    let flagged = store.request_cancel(&claimed.workflow_id).await.unwrap();
    assert_eq!(flagged.status, RunStatus::Running);
    assert!(flagged.cancel_requested);
    assert!(store.heartbeat(claimed.run_id, "w1").await.unwrap());
    store
        .close(claimed.run_id, "w1", RunStatus::Canceled, None)
        .await
        .unwrap();

    // finished: nothing to do
    store
        .start(arbitrary_request("part-003.json"), "msg-3")
        .await
        .unwrap();
    let done = store.claim("w1", LONG).await.unwrap().unwrap();
    store.complete(done.run_id, "w1").await.unwrap();
    let unchanged = store.request_cancel(&done.workflow_id).await.unwrap();
    assert_eq!(unchanged.status, RunStatus::Completed);
    assert!(!unchanged.cancel_requested);
}

async fn test_not_found(store: Arc<dyn WorkflowStore>) {
    store.setup().await.unwrap();

    let missing = WorkflowId::from_raw("ingest/acme/web_requests/missing.json");
    assert_matches!(
        store.describe(&missing).await,
        Err(Error::WorkflowNotFound(id)) if id == missing
    );
    assert_matches!(
        store.request_cancel(&missing).await,
        Err(Error::WorkflowNotFound(_))
    );
}
