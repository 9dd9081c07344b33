//! Batch engine integration tests.
//!
//! Seed jobs split items into execution jobs, execution jobs apply the batch
//! handler per chunk and the monitor job deletes the finished batch.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use flowcore::batch::{
    BATCH_EXECUTION_JOB, BATCH_MONITOR_JOB, BATCH_SEED_JOB, PROCESS_INSTANCE_CANCELLATION_BATCH,
    SET_JOB_RETRIES_BATCH,
};
use flowcore::*;
use flowcore_testkit::{drain_events, insert_jobs, load_job, test_config, RecordingBatchHandler, TestEngine};
use serde_json::{json, Value};

/// One worker, so batch jobs run one after another.
fn batch_config(chunk_size: u32, jobs_per_seed: u32) -> EngineConfig {
    let config = test_config("batch-node");
    config
        .clone()
        .with_job_executor(config.job_executor.clone().with_worker_pool_size(1))
        .with_batch(
            BatchConfig::default()
                .with_chunk_size(chunk_size)
                .with_jobs_per_seed(jobs_per_seed)
                .with_monitor_poll_interval(1_000),
        )
}

fn items(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("item-{i:02}")).collect()
}

fn recording_engine(config: EngineConfig, handler: &RecordingBatchHandler) -> TestEngine {
    let handler = handler.clone();
    TestEngine::with(config, move |builder| builder.with_batch_handler(Arc::new(handler)))
}

async fn stored_batch(harness: &TestEngine, batch_id: BatchId) -> Option<Batch> {
    harness
        .store
        .find_batches()
        .await
        .unwrap()
        .into_iter()
        .find(|batch| batch.id == batch_id)
}

async fn execution_jobs(harness: &TestEngine, batch_id: BatchId) -> Vec<Job> {
    harness
        .jobs(JobQuery::by_batch(batch_id).with_type(BATCH_EXECUTION_JOB))
        .await
        .unwrap()
}

/// Run jobs, then let the monitor poll once more.
async fn run_batch_to_completion(harness: &TestEngine) {
    harness.run_jobs().await;
    harness.advance(Duration::seconds(2));
    harness.run_jobs().await;
}

#[tokio::test]
async fn test_create_batch_stores_seed_and_monitor() {
    let handler = RecordingBatchHandler::new("audit");
    let harness = recording_engine(batch_config(10, 100), &handler);
    let mut events = harness.subscribe();

    let batch_id = harness.create_batch("audit", items(25), json!({})).await.unwrap();

    let batch = stored_batch(&harness, batch_id).await.unwrap();
    assert_eq!(batch.total_jobs, 3);
    assert_eq!(batch.jobs_created, 0);
    assert_eq!(batch.remaining_items.len(), 25);

    let jobs = harness.jobs(JobQuery::by_batch(batch_id)).await.unwrap();
    let mut types: Vec<_> = jobs.iter().map(|job| job.job_type.as_str()).collect();
    types.sort_unstable();
    assert_eq!(types, vec![BATCH_MONITOR_JOB, BATCH_SEED_JOB]);
    assert_eq!(batch.seed_job_id, jobs.iter().find(|j| j.job_type == BATCH_SEED_JOB).map(|j| j.id));

    assert_eq!(
        drain_events(&mut events),
        vec![EngineEvent::BatchCreated {
            batch_id,
            batch_type: "audit".into(),
            total_jobs: 3,
        }]
    );
}

#[tokio::test]
async fn test_seed_splits_items_into_chunks() {
    let handler = RecordingBatchHandler::new("audit");
    let harness = recording_engine(batch_config(10, 100), &handler);
    let batch_id = harness.create_batch("audit", items(25), json!({})).await.unwrap();
    let seed = stored_batch(&harness, batch_id).await.unwrap().seed_job_id.unwrap();

    let outcome = harness.execute_job(seed).await.unwrap();

    assert_eq!(outcome, JobOutcome::Completed);
    let mut sizes: Vec<_> = execution_jobs(&harness, batch_id)
        .await
        .iter()
        .map(|job| job.configuration["items"].as_array().map_or(0, Vec::len))
        .collect();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![5, 10, 10]);

    let batch = stored_batch(&harness, batch_id).await.unwrap();
    assert_eq!(batch.jobs_created, 3);
    assert!(batch.seed_job_id.is_none());
    assert!(load_job(harness.store.as_ref(), seed).await.unwrap().is_none());
}

#[tokio::test]
async fn test_seed_reschedules_while_items_remain() {
    let handler = RecordingBatchHandler::new("audit");
    let harness = recording_engine(batch_config(10, 1), &handler);
    let batch_id = harness.create_batch("audit", items(25), json!({})).await.unwrap();
    let seed = stored_batch(&harness, batch_id).await.unwrap().seed_job_id.unwrap();

    let mut created = Vec::new();
    for _ in 0..2 {
        let outcome = harness.execute_job(seed).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Rescheduled { .. }));
        created.push(execution_jobs(&harness, batch_id).await.len());
    }
    assert_eq!(harness.execute_job(seed).await.unwrap(), JobOutcome::Completed);
    created.push(execution_jobs(&harness, batch_id).await.len());

    assert_eq!(created, vec![1, 2, 3]);
    assert!(stored_batch(&harness, batch_id).await.unwrap().seed_job_id.is_none());
}

#[tokio::test]
async fn test_batch_runs_every_item_once_and_completes() {
    let handler = RecordingBatchHandler::new("audit");
    let harness = recording_engine(batch_config(10, 1), &handler);
    let mut events = harness.subscribe();
    let batch_id = harness.create_batch("audit", items(25), json!({})).await.unwrap();

    run_batch_to_completion(&harness).await;

    let mut processed = handler.items();
    processed.sort();
    assert_eq!(processed, items(25));
    assert_eq!(handler.chunks().len(), 3);

    assert!(stored_batch(&harness, batch_id).await.is_none());
    assert!(harness.jobs(JobQuery::by_batch(batch_id)).await.unwrap().is_empty());
    let completed = drain_events(&mut events)
        .into_iter()
        .filter(|e| matches!(e, EngineEvent::BatchCompleted { .. }))
        .count();
    assert_eq!(completed, 1);

    let metrics = harness.metrics();
    assert_eq!(metrics.batch_jobs_created, 3);
    assert_eq!(metrics.batch_jobs_completed, 3);
    assert_eq!(metrics.batches_completed, 1);

    let err = harness.batch_statistics(batch_id).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { entity: "batch", .. }));
}

#[tokio::test]
async fn test_monitor_waits_for_pending_jobs() {
    let handler = RecordingBatchHandler::new("audit");
    let harness = recording_engine(batch_config(10, 100), &handler);
    let batch_id = harness.create_batch("audit", items(5), json!({})).await.unwrap();
    let monitor = stored_batch(&harness, batch_id).await.unwrap().monitor_job_id.unwrap();

    let outcome = harness.execute_job(monitor).await.unwrap();

    assert_eq!(
        outcome,
        JobOutcome::Rescheduled {
            due_date: harness.now() + Duration::seconds(1)
        }
    );
    assert!(stored_batch(&harness, batch_id).await.is_some());
}

#[tokio::test]
async fn test_statistics_track_progress() {
    let handler = RecordingBatchHandler::new("audit");
    let harness = recording_engine(batch_config(10, 100), &handler);
    let batch_id = harness.create_batch("audit", items(25), json!({})).await.unwrap();

    let initial = harness.batch_statistics(batch_id).await.unwrap();
    assert_eq!(initial.total_jobs, 3);
    assert_eq!(initial.jobs_created, 0);
    assert_eq!(initial.remaining_jobs, 0);
    assert!(initial.seed_pending);
    assert!(!initial.suspended);

    let seed = stored_batch(&harness, batch_id).await.unwrap().seed_job_id.unwrap();
    harness.execute_job(seed).await.unwrap();
    let first = execution_jobs(&harness, batch_id).await[0].id;
    harness.execute_job(first).await.unwrap();

    let progress = harness.batch_statistics(batch_id).await.unwrap();
    assert_eq!(progress.jobs_created, 3);
    assert_eq!(progress.remaining_jobs, 2);
    assert_eq!(progress.completed_jobs, 1);
    assert_eq!(progress.failed_jobs, 0);
    assert!(!progress.seed_pending);
}

#[tokio::test]
async fn test_failed_chunk_keeps_batch_open() {
    #[derive(Debug)]
    struct Rejecting;

    #[async_trait]
    impl BatchJobHandler for Rejecting {
        fn batch_type(&self) -> &str {
            "rejecting"
        }

        async fn execute(&self, items: &[String], _payload: &Value, _ctx: &mut CommandContext) -> Result<()> {
            Err(EngineError::handler(anyhow::anyhow!("cannot handle {} items", items.len())))
        }
    }

    let harness = TestEngine::with(batch_config(10, 100), |builder| {
        builder.with_batch_handler(Arc::new(Rejecting))
    });
    let batch_id = harness.create_batch("rejecting", items(3), json!({})).await.unwrap();

    run_batch_to_completion(&harness).await;

    let stats = harness.batch_statistics(batch_id).await.unwrap();
    assert_eq!(stats.remaining_jobs, 1);
    assert_eq!(stats.failed_jobs, 1);
    assert_eq!(stats.completed_jobs, 0);
    assert!(stored_batch(&harness, batch_id).await.is_some());

    let failed = &execution_jobs(&harness, batch_id).await[0];
    let incidents = harness.incidents(IncidentQuery::by_job(failed.id)).await.unwrap();
    assert_eq!(incidents.len(), 1);
}

#[tokio::test]
async fn test_chunks_of_one_batch_run_side_by_side() {
    #[derive(Debug, Default)]
    struct Interleaving {
        chunks: AtomicUsize,
    }

    #[async_trait]
    impl BatchJobHandler for Interleaving {
        fn batch_type(&self) -> &str {
            "interleaving"
        }

        async fn execute(&self, _items: &[String], _payload: &Value, _ctx: &mut CommandContext) -> Result<()> {
            // Every chunk has read the batch before the first one commits.
            tokio::task::yield_now().await;
            self.chunks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let config = batch_config(2, 100);
    let config = config
        .clone()
        .with_retry(config.retry.clone().with_conflict_retries(0));
    let handler = Arc::new(Interleaving::default());
    let harness = TestEngine::with(config, {
        let handler = handler.clone();
        move |builder| builder.with_batch_handler(handler)
    });
    let batch_id = harness.create_batch("interleaving", items(6), json!({})).await.unwrap();
    let seed = stored_batch(&harness, batch_id).await.unwrap().seed_job_id.unwrap();
    harness.execute_job(seed).await.unwrap();
    let ids: Vec<JobId> = execution_jobs(&harness, batch_id)
        .await
        .iter()
        .map(|job| job.id)
        .collect();
    assert_eq!(ids.len(), 3);

    let (first, second, third) = tokio::join!(
        harness.execute_job(ids[0]),
        harness.execute_job(ids[1]),
        harness.execute_job(ids[2]),
    );
    for result in [first, second, third] {
        assert_eq!(result.unwrap(), JobOutcome::Completed);
    }
    assert_eq!(handler.chunks.load(Ordering::SeqCst), 3);

    let stats = harness.batch_statistics(batch_id).await.unwrap();
    assert_eq!(stats.remaining_jobs, 0);
    assert_eq!(stats.completed_jobs, 3);
    assert_eq!(stats.failed_jobs, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_monitors_complete_batch_once() {
    let handler = RecordingBatchHandler::new("audit");
    let harness = Arc::new(recording_engine(batch_config(10, 100), &handler));
    let batch_id = harness.create_batch("audit", items(15), json!({})).await.unwrap();
    let batch = stored_batch(&harness, batch_id).await.unwrap();
    let monitor = batch.monitor_job_id.unwrap();
    harness.execute_job(batch.seed_job_id.unwrap()).await.unwrap();
    for job in execution_jobs(&harness, batch_id).await {
        harness.execute_job(job.id).await.unwrap();
    }
    let mut events = harness.subscribe();

    let monitors: Vec<_> = (0..2)
        .map(|_| {
            let harness = harness.clone();
            tokio::spawn(async move { harness.execute(ExecuteJobCommand::unowned(monitor)).await })
        })
        .collect();

    let mut completed = 0;
    for run in futures::future::join_all(monitors).await {
        match run.unwrap() {
            Ok(outcome) => {
                assert_eq!(outcome, JobOutcome::Completed);
                completed += 1;
            }
            Err(err) => assert!(
                err.is_conflict() || matches!(err, EngineError::NotFound { entity: "job", .. }),
                "unexpected error {err}"
            ),
        }
    }
    assert_eq!(completed, 1);

    let batch_events = drain_events(&mut events)
        .into_iter()
        .filter(|e| matches!(e, EngineEvent::BatchCompleted { .. }))
        .count();
    assert_eq!(batch_events, 1);
    assert!(stored_batch(&harness, batch_id).await.is_none());
    assert!(harness.jobs(JobQuery::by_batch(batch_id)).await.unwrap().is_empty());
    assert_eq!(harness.metrics().batches_completed, 1);
}

#[tokio::test]
async fn test_suspended_batch_is_not_acquired() {
    let handler = RecordingBatchHandler::new("audit");
    let harness = recording_engine(batch_config(10, 100), &handler);
    let batch_id = harness.create_batch("audit", items(12), json!({})).await.unwrap();

    harness.suspend_batch(batch_id).await.unwrap();
    assert_eq!(harness.run_jobs().await, 0);
    assert!(harness.batch_statistics(batch_id).await.unwrap().suspended);

    harness.activate_batch(batch_id).await.unwrap();
    run_batch_to_completion(&harness).await;

    assert_eq!(handler.items().len(), 12);
    assert!(stored_batch(&harness, batch_id).await.is_none());
}

#[tokio::test]
async fn test_delete_batch_removes_jobs_and_incidents() {
    let harness = TestEngine::with(batch_config(1, 100), |builder| builder);
    let batch_id = harness
        .create_batch(PROCESS_INSTANCE_CANCELLATION_BATCH, vec!["not-a-uuid".into()], Value::Null)
        .await
        .unwrap();
    harness.run_jobs().await;
    let failed = execution_jobs(&harness, batch_id).await;
    assert_eq!(failed.len(), 1);
    assert!(failed[0].is_failed());

    harness.delete_batch(batch_id).await.unwrap();

    assert!(stored_batch(&harness, batch_id).await.is_none());
    assert!(harness.jobs(JobQuery::by_batch(batch_id)).await.unwrap().is_empty());
    assert!(harness
        .incidents(IncidentQuery::by_job(failed[0].id))
        .await
        .unwrap()
        .is_empty());

    let err = harness.delete_batch(batch_id).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

#[tokio::test]
async fn test_set_job_retries_batch_revives_failed_jobs() {
    let harness = TestEngine::with(batch_config(2, 100), |builder| builder);
    let later = harness.now() + Duration::hours(1);
    let failed: Vec<Job> = (0..3).map(|_| Job::new("report", json!({}), later, 0)).collect();
    let ids = insert_jobs(harness.store.as_ref(), failed).await.unwrap();

    let item_ids = ids.iter().map(ToString::to_string).collect();
    harness
        .create_batch(SET_JOB_RETRIES_BATCH, item_ids, json!({ "retries": 2 }))
        .await
        .unwrap();
    run_batch_to_completion(&harness).await;

    for id in ids {
        let job = load_job(harness.store.as_ref(), id).await.unwrap().unwrap();
        assert_eq!(job.retries, 2);
    }
}

#[tokio::test]
async fn test_cancellation_batch_cancels_instances() {
    let harness = TestEngine::with(batch_config(2, 100), |builder| builder);
    let mut pids = Vec::new();
    for _ in 0..3 {
        pids.push(harness.start_process_instance("approval").await.unwrap());
    }
    let mut events = harness.subscribe();

    let mut item_ids: Vec<String> = pids.iter().map(ToString::to_string).collect();
    // Already gone by the time the chunk runs.
    item_ids.push(ProcessInstanceId::new().to_string());
    harness
        .create_batch(
            PROCESS_INSTANCE_CANCELLATION_BATCH,
            item_ids,
            json!({ "reason": "migration" }),
        )
        .await
        .unwrap();
    run_batch_to_completion(&harness).await;

    for pid in &pids {
        assert!(harness
            .executions(ExecutionQuery::by_process_instance(*pid))
            .await
            .unwrap()
            .is_empty());
    }
    let cancelled: Vec<_> = drain_events(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            EngineEvent::ProcessCancelled { process_instance_id, reason } => Some((process_instance_id, reason)),
            _ => None,
        })
        .collect();
    assert_eq!(cancelled.len(), 3);
    assert!(cancelled
        .iter()
        .all(|(pid, reason)| pids.contains(pid) && reason.as_deref() == Some("migration")));
}

#[tokio::test]
async fn test_create_batch_rejects_invalid_input() {
    let handler = RecordingBatchHandler::new("audit");
    let harness = recording_engine(batch_config(10, 100), &handler);

    let empty = harness.create_batch("audit", Vec::new(), json!({})).await.unwrap_err();
    assert!(matches!(empty, EngineError::Validation(_)));

    let blank = harness
        .create_batch("audit", vec!["a".into(), " ".into()], json!({}))
        .await
        .unwrap_err();
    assert!(matches!(blank, EngineError::Validation(_)));

    let unknown = harness.create_batch("unknown", items(1), json!({})).await.unwrap_err();
    assert!(matches!(unknown, EngineError::Validation(_)));

    assert!(harness.store.find_batches().await.unwrap().is_empty());
    assert!(harness.jobs(JobQuery::default()).await.unwrap().is_empty());
}
