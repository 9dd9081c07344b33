//! Job executor integration tests.
//!
//! Tests claiming, exclusivity, bounded dispatch, retries with incidents,
//! lock expiry and the background acquisition loop.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Duration;
use flowcore::store::AcquisitionQuery;
use flowcore::*;
use flowcore_testkit::{
    insert_jobs, load_job, test_config, wait_for_event, ConcurrencyProbe, FailingHandler,
    FlakyStore, RecordingHandler, TestEngine,
};
use serde_json::{json, Value};

fn job(harness: &TestEngine, job_type: &str, retries: u32) -> Job {
    Job::new(job_type, json!({}), harness.now(), retries)
}

async fn insert(harness: &TestEngine, jobs: Vec<Job>) -> Vec<JobId> {
    insert_jobs(harness.store.as_ref(), jobs).await.unwrap()
}

async fn reload(harness: &TestEngine, job_id: JobId) -> Option<Job> {
    load_job(harness.store.as_ref(), job_id).await.unwrap()
}

async fn wait_until(timeout: StdDuration, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exactly_one_concurrent_claim_wins() {
    let harness = Arc::new(TestEngine::new());
    let ids = insert(&harness, vec![job(&harness, "noop", 3)]).await;
    let job_id = ids[0];
    let until = harness.now() + Duration::minutes(5);

    let claims: Vec<_> = (0..8)
        .map(|node| {
            let harness = harness.clone();
            tokio::spawn(async move {
                harness
                    .execute(ClaimJobCommand {
                        job_id,
                        lock_owner: format!("node-{node}"),
                        lock_expiration: until,
                    })
                    .await
            })
        })
        .collect();

    let mut winners = Vec::new();
    for claim in futures::future::join_all(claims).await {
        match claim.unwrap() {
            Ok(job) => winners.push(job.lock_owner.unwrap()),
            Err(err) => assert!(err.is_conflict(), "unexpected error {err}"),
        }
    }

    assert_eq!(winners.len(), 1);
    let stored = reload(&harness, job_id).await.unwrap();
    assert_eq!(stored.lock_owner.as_ref(), Some(&winners[0]));
    assert_eq!(stored.revision, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exclusive_jobs_of_one_instance_never_overlap() {
    let probe = ConcurrencyProbe::new("probe", StdDuration::from_millis(20));
    let harness = TestEngine::with(test_config("exclusive-node"), {
        let probe = probe.clone();
        move |builder| builder.with_job_handler(Arc::new(probe))
    });

    let mut jobs = Vec::new();
    for _ in 0..2 {
        let pid = ProcessInstanceId::new();
        for _ in 0..5 {
            jobs.push(
                Job::new("probe", json!({ "instance": pid.to_string() }), harness.now(), 3)
                    .with_exclusive(true)
                    .for_execution(pid, pid.root_execution()),
            );
        }
    }
    insert(&harness, jobs).await;

    harness.start().await.unwrap();
    wait_until(StdDuration::from_secs(10), || probe.completed() == 10).await;
    harness.shutdown().await.unwrap();

    assert_eq!(probe.max_per_instance(), 1);
    assert!(probe.max_running() <= harness.config().job_executor.worker_pool_size);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_pool_bounds_running_jobs() {
    let probe = ConcurrencyProbe::new("probe", StdDuration::from_millis(20));
    let config = test_config("bounded-node");
    let config = config.clone().with_job_executor(
        config.job_executor.clone().with_worker_pool_size(2),
    );
    let harness = TestEngine::with(config, {
        let probe = probe.clone();
        move |builder| builder.with_job_handler(Arc::new(probe))
    });
    insert(&harness, (0..8).map(|_| job(&harness, "probe", 3)).collect()).await;

    harness.start().await.unwrap();
    wait_until(StdDuration::from_secs(10), || probe.completed() == 8).await;
    harness.shutdown().await.unwrap();

    assert!(probe.max_running() <= 2, "ran {} at once", probe.max_running());
}

#[tokio::test]
async fn test_saturated_pool_leaves_remaining_jobs_unlocked() {
    let probe = ConcurrencyProbe::new("probe", StdDuration::from_millis(50));
    let config = test_config("saturated-node");
    let config = config.clone().with_job_executor(
        config
            .job_executor
            .clone()
            .with_worker_pool_size(1)
            .with_max_jobs_per_acquisition(3),
    );
    let harness = TestEngine::with(config, {
        let probe = probe.clone();
        move |builder| builder.with_job_handler(Arc::new(probe))
    });
    let ids = insert(&harness, (0..3).map(|_| job(&harness, "probe", 3)).collect()).await;

    let report = harness.job_executor().run_acquisition_cycle().await.unwrap();
    assert_eq!(report.found, 3);
    assert_eq!(report.acquired, 1);
    assert!(report.saturated);

    let mut unlocked = 0;
    for id in &ids {
        if let Some(job) = reload(&harness, *id).await {
            if job.lock_owner.is_none() {
                unlocked += 1;
            }
        }
    }
    assert_eq!(unlocked, 2);

    harness.job_executor().wait_idle().await;
    assert_eq!(harness.run_jobs().await, 2);
    assert_eq!(probe.completed(), 3);
}

#[tokio::test]
async fn test_always_failing_job_ends_with_single_incident() {
    let handler = FailingHandler::always("flaky", "payment gateway down");
    let harness = TestEngine::with(test_config("failing-node"), {
        let handler = handler.clone();
        move |builder| builder.with_job_handler(Arc::new(handler))
    });
    let job_id = insert(&harness, vec![job(&harness, "flaky", 3)]).await[0];

    let mut retries = Vec::new();
    for _ in 0..3 {
        let report = harness.job_executor().run_acquisition_cycle().await.unwrap();
        assert_eq!(report.acquired, 1);
        harness.job_executor().wait_idle().await;
        retries.push(reload(&harness, job_id).await.unwrap().retries);
    }
    assert_eq!(retries, vec![2, 1, 0]);

    let failed = reload(&harness, job_id).await.unwrap();
    assert_eq!(failed.attempts, 3);
    assert!(failed.lock_owner.is_none());
    assert!(failed
        .exception_message
        .as_deref()
        .is_some_and(|m| m.contains("payment gateway down")));
    assert!(failed.exception_stacktrace.is_some());

    let incidents = harness.incidents(IncidentQuery::by_job(job_id)).await.unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].incident_type, FAILED_JOB_INCIDENT);

    let report = harness.job_executor().run_acquisition_cycle().await.unwrap();
    assert_eq!(report.found, 0);
    assert_eq!(handler.attempts(), 3);

    let metrics = harness.metrics();
    assert_eq!(metrics.jobs_failed, 3);
    assert_eq!(metrics.incidents_created, 1);
}

#[tokio::test]
async fn test_transient_failure_recovers_without_incident() {
    let handler = FailingHandler::times("flaky", 2, "timeout");
    let harness = TestEngine::with(test_config("recovering-node"), {
        let handler = handler.clone();
        move |builder| builder.with_job_handler(Arc::new(handler))
    });
    let job_id = insert(&harness, vec![job(&harness, "flaky", 3)]).await[0];

    harness.run_jobs().await;

    assert_eq!(handler.attempts(), 3);
    assert!(reload(&harness, job_id).await.is_none());
    assert!(harness
        .incidents(IncidentQuery::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_retry_backoff_moves_due_date() {
    let handler = FailingHandler::times("flaky", 1, "busy");
    let config = test_config("backoff-node");
    let config = config
        .clone()
        .with_retry(config.retry.clone().with_backoff(BackoffPolicy::Fixed { delay_ms: 30_000 }));
    let harness = TestEngine::with(config, {
        let handler = handler.clone();
        move |builder| builder.with_job_handler(Arc::new(handler))
    });
    let job_id = insert(&harness, vec![job(&harness, "flaky", 3)]).await[0];
    let start = harness.now();

    assert_eq!(harness.run_jobs().await, 1);
    let retried = reload(&harness, job_id).await.unwrap();
    assert_eq!(retried.due_date, start + Duration::seconds(30));
    assert_eq!(retried.retries, 2);

    harness.advance(Duration::seconds(31));
    assert_eq!(harness.run_jobs().await, 1);
    assert!(reload(&harness, job_id).await.is_none());
}

#[tokio::test]
async fn test_set_retries_resolves_failed_job_incident() {
    let handler = FailingHandler::times("flaky", 1, "boom");
    let harness = TestEngine::with(test_config("resolve-node"), {
        let handler = handler.clone();
        move |builder| builder.with_job_handler(Arc::new(handler))
    });
    let job_id = insert(&harness, vec![job(&harness, "flaky", 1)]).await[0];
    harness.run_jobs().await;
    let incidents = harness.incidents(IncidentQuery::by_job(job_id)).await.unwrap();
    assert_eq!(incidents.len(), 1);

    let mut events = harness.subscribe();
    harness.set_job_retries(job_id, 2).await.unwrap();

    assert!(harness
        .incidents(IncidentQuery::by_job(job_id))
        .await
        .unwrap()
        .is_empty());
    let resolved = wait_for_event(&mut events, StdDuration::from_secs(1), |e| {
        matches!(e, EngineEvent::IncidentResolved { .. })
    })
    .await;
    assert_eq!(
        resolved,
        Some(EngineEvent::IncidentResolved {
            incident_id: incidents[0].id
        })
    );

    assert_eq!(harness.run_jobs().await, 1);
    assert!(reload(&harness, job_id).await.is_none());
}

#[tokio::test]
async fn test_failed_job_incident_cannot_be_resolved_directly() {
    let handler = FailingHandler::always("flaky", "boom");
    let harness = TestEngine::with(test_config("direct-node"), {
        let handler = handler.clone();
        move |builder| builder.with_job_handler(Arc::new(handler))
    });
    let job_id = insert(&harness, vec![job(&harness, "flaky", 1)]).await[0];
    harness.run_jobs().await;
    let incident = harness.incidents(IncidentQuery::by_job(job_id)).await.unwrap()[0].clone();

    let err = harness.resolve_incident(incident.id).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn test_missing_handler_counts_as_failure() {
    let harness = TestEngine::new();
    let job_id = insert(&harness, vec![job(&harness, "unregistered", 1)]).await[0];

    harness.run_jobs().await;

    let failed = reload(&harness, job_id).await.unwrap();
    assert!(failed.is_failed());
    assert!(failed
        .exception_message
        .as_deref()
        .is_some_and(|m| m.contains("no handler registered")));
    assert_eq!(
        harness.incidents(IncidentQuery::by_job(job_id)).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_zero_retries_opens_failed_job_incident() {
    let harness = TestEngine::new();
    let job_id = insert(&harness, vec![job(&harness, "noop", 3)]).await[0];

    harness.set_job_retries(job_id, 0).await.unwrap();
    let incidents = harness.incidents(IncidentQuery::by_job(job_id)).await.unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].incident_type, FAILED_JOB_INCIDENT);
    assert_eq!(
        harness.job_executor().run_acquisition_cycle().await.unwrap().found,
        0
    );

    // Already out of retries, no second incident.
    harness.set_job_retries(job_id, 0).await.unwrap();
    assert_eq!(
        harness.incidents(IncidentQuery::by_job(job_id)).await.unwrap().len(),
        1
    );

    harness.set_job_retries(job_id, 1).await.unwrap();
    assert!(harness
        .incidents(IncidentQuery::by_job(job_id))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_manual_execution_failure_uses_retry() {
    let handler = FailingHandler::always("flaky", "ledger locked");
    let harness = TestEngine::with(test_config("manual-node"), {
        let handler = handler.clone();
        move |builder| builder.with_job_handler(Arc::new(handler))
    });
    let job_id = insert(&harness, vec![job(&harness, "flaky", 2)]).await[0];

    let err = harness.execute_job(job_id).await.unwrap_err();
    assert!(matches!(err, EngineError::JobHandler { .. }));
    let failed = reload(&harness, job_id).await.unwrap();
    assert_eq!(failed.retries, 1);
    assert_eq!(failed.attempts, 1);
    assert!(failed
        .exception_message
        .as_deref()
        .is_some_and(|m| m.contains("ledger locked")));

    harness.execute_job(job_id).await.unwrap_err();
    assert!(reload(&harness, job_id).await.unwrap().is_failed());
    assert_eq!(
        harness.incidents(IncidentQuery::by_job(job_id)).await.unwrap().len(),
        1
    );

    // Running a job that is already out of retries keeps the one incident.
    harness.execute_job(job_id).await.unwrap_err();
    assert_eq!(reload(&harness, job_id).await.unwrap().attempts, 3);
    assert_eq!(
        harness.incidents(IncidentQuery::by_job(job_id)).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_panicking_handler_fails_job_and_frees_instance() {
    #[derive(Debug)]
    struct Exploding;

    #[async_trait]
    impl JobHandler for Exploding {
        fn job_type(&self) -> &str {
            "explode"
        }

        async fn execute(&self, _configuration: &Value, _ctx: &mut CommandContext) -> Result<JobOutcome> {
            panic!("handler blew up")
        }
    }

    let follow_up = RecordingHandler::new("follow-up");
    let harness = TestEngine::with(test_config("panic-node"), {
        let follow_up = follow_up.clone();
        move |builder| {
            builder
                .with_job_handler(Arc::new(Exploding))
                .with_job_handler(Arc::new(follow_up))
        }
    });
    let pid = ProcessInstanceId::new();
    let exclusive = |job_type: &str| {
        Job::new(job_type, json!({}), harness.now(), 1)
            .with_exclusive(true)
            .for_execution(pid, pid.root_execution())
    };
    let job_id = insert(&harness, vec![exclusive("explode")]).await[0];

    let report = harness.job_executor().run_acquisition_cycle().await.unwrap();
    assert_eq!(report.acquired, 1);
    harness.job_executor().wait_idle().await;

    let failed = reload(&harness, job_id).await.unwrap();
    assert_eq!(failed.retries, 0);
    assert!(failed.lock_owner.is_none());
    assert!(failed
        .exception_message
        .as_deref()
        .is_some_and(|m| m.contains("panicked") && m.contains("handler blew up")));
    assert_eq!(
        harness.incidents(IncidentQuery::by_job(job_id)).await.unwrap().len(),
        1
    );

    insert(&harness, vec![exclusive("follow-up")]).await;
    let report = harness.job_executor().run_acquisition_cycle().await.unwrap();
    assert_eq!((report.acquired, report.deferred), (1, 0));
    harness.job_executor().wait_idle().await;
    follow_up.assert_call_count_eq(1);
}

#[tokio::test]
async fn test_expired_lock_is_acquirable_with_state_intact() {
    let handler = RecordingHandler::new("noop");
    let harness = TestEngine::with(test_config("recovery-node"), {
        let handler = handler.clone();
        move |builder| builder.with_job_handler(Arc::new(handler))
    });
    let original = job(&harness, "noop", 3);
    let job_id = insert(&harness, vec![original.clone()]).await[0];
    harness
        .execute(ClaimJobCommand {
            job_id,
            lock_owner: "crashed-node".into(),
            lock_expiration: harness.now() + Duration::minutes(1),
        })
        .await
        .unwrap();

    assert_eq!(harness.run_jobs().await, 0);

    harness.advance(Duration::minutes(2));
    let due = harness
        .services()
        .store
        .find_due_unlocked_jobs(&AcquisitionQuery {
            now: harness.now(),
            limit: 10,
            exclusive_aware: true,
        })
        .await
        .unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].due_date, original.due_date);
    assert_eq!(due[0].retries, 3);

    assert_eq!(harness.run_jobs().await, 1);
    handler.assert_call_count_eq(1);
}

#[tokio::test]
async fn test_lock_sweep_clears_expired_locks() {
    let config = test_config("sweep-node");
    let config = config
        .clone()
        .with_job_executor(config.job_executor.clone().with_lock_sweep_interval(10));
    let harness = TestEngine::with(config, |builder| builder);

    let mut stale = job(&harness, "noop", 3);
    stale.suspended = true;
    stale.lock("crashed-node", harness.now() - Duration::seconds(1));
    let job_id = insert(&harness, vec![stale]).await[0];

    harness.start().await.unwrap();
    wait_until(StdDuration::from_secs(5), || harness.metrics().locks_expired == 1).await;
    harness.shutdown().await.unwrap();

    let swept = reload(&harness, job_id).await.unwrap();
    assert!(swept.lock_owner.is_none());
    assert!(swept.lock_expiration.is_none());
    assert_eq!(swept.retries, 3);
}

#[tokio::test]
async fn test_lost_claim_is_counted_not_failed() {
    let store = FlakyStore::new();
    let harness = TestEngine::on_store(
        test_config("contended-node"),
        Arc::new(store.clone()),
        ManualClock::new(flowcore_testkit::epoch()),
        |builder| builder,
    );
    let job_id = insert(&harness, vec![job(&harness, "noop", 3)]).await[0];

    store.conflict_next_flushes(1);
    let report = harness.job_executor().run_acquisition_cycle().await.unwrap();

    assert_eq!(report.conflicts, 1);
    assert_eq!(report.acquired, 0);
    assert_eq!(harness.metrics().claim_conflicts, 1);
    let untouched = reload(&harness, job_id).await.unwrap();
    assert!(untouched.lock_owner.is_none());
    assert_eq!(untouched.retries, 3);
}

#[tokio::test]
async fn test_execution_conflict_releases_lock_without_using_retry() {
    let handler = RecordingHandler::new("noop");
    let store = FlakyStore::new();
    let config = test_config("conflict-node");
    let config = config
        .clone()
        .with_retry(config.retry.clone().with_conflict_retries(0));
    let harness = TestEngine::on_store(
        config,
        Arc::new(store.clone()),
        ManualClock::new(flowcore_testkit::epoch()),
        {
            let handler = handler.clone();
            move |builder| builder.with_job_handler(Arc::new(handler))
        },
    );
    let job_id = insert(&harness, vec![job(&harness, "noop", 3)]).await[0];

    // Claim goes through, the execution commit conflicts.
    store.conflict_after(1, 1);
    harness.job_executor().run_acquisition_cycle().await.unwrap();
    harness.job_executor().wait_idle().await;

    handler.assert_call_count_eq(1);
    let released = reload(&harness, job_id).await.unwrap();
    assert!(released.lock_owner.is_none());
    assert_eq!(released.retries, 3);
    assert_eq!(released.attempts, 0);
    assert!(harness
        .incidents(IncidentQuery::by_job(job_id))
        .await
        .unwrap()
        .is_empty());

    assert_eq!(harness.run_jobs().await, 1);
    assert!(reload(&harness, job_id).await.is_none());
}

#[tokio::test]
async fn test_suspended_job_waits_for_activation() {
    let handler = RecordingHandler::new("noop");
    let harness = TestEngine::with(test_config("suspend-node"), {
        let handler = handler.clone();
        move |builder| builder.with_job_handler(Arc::new(handler))
    });
    let job_id = insert(&harness, vec![job(&harness, "noop", 3)]).await[0];

    harness.suspend_job(job_id).await.unwrap();
    assert_eq!(harness.run_jobs().await, 0);

    harness.activate_job(job_id).await.unwrap();
    assert_eq!(harness.run_jobs().await, 1);
    handler.assert_call_count_eq(1);
}

#[tokio::test]
async fn test_rescheduled_job_keeps_running_until_completed() {
    let handler = RecordingHandler::new("poll");
    let harness = TestEngine::with(test_config("poll-node"), {
        let handler = handler.clone();
        move |builder| builder.with_job_handler(Arc::new(handler))
    });
    let job_id = insert(&harness, vec![job(&harness, "poll", 3)]).await[0];
    let next = harness.now() + Duration::seconds(10);
    handler.set_outcome(JobOutcome::Rescheduled { due_date: next });

    assert_eq!(harness.run_jobs().await, 1);
    let waiting = reload(&harness, job_id).await.unwrap();
    assert_eq!(waiting.due_date, next);
    assert!(waiting.lock_owner.is_none());
    assert_eq!(waiting.retries, 3);

    handler.set_outcome(JobOutcome::Completed);
    harness.advance(Duration::seconds(11));
    assert_eq!(harness.run_jobs().await, 1);
    assert!(reload(&harness, job_id).await.is_none());
    handler.assert_call_count_eq(2);
}

#[tokio::test]
async fn test_due_date_change_makes_job_runnable() {
    let handler = RecordingHandler::new("noop");
    let harness = TestEngine::with(test_config("due-node"), {
        let handler = handler.clone();
        move |builder| builder.with_job_handler(Arc::new(handler))
    });
    let later = Job::new("noop", json!({}), harness.now() + Duration::hours(1), 3);
    let job_id = insert(&harness, vec![later]).await[0];
    assert_eq!(harness.run_jobs().await, 0);

    harness.set_job_due_date(job_id, harness.now()).await.unwrap();
    assert_eq!(harness.run_jobs().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_started_executor_runs_async_continuations() {
    let harness = TestEngine::new();
    harness.start().await.unwrap();
    assert!(harness.job_executor().is_running());
    let mut events = harness.subscribe();

    let pid = harness.start_process_instance("async-service").await.unwrap();

    let completed = wait_for_event(&mut events, StdDuration::from_secs(5), |e| {
        matches!(e, EngineEvent::ProcessCompleted { process_instance_id } if *process_instance_id == pid)
    })
    .await;
    assert!(completed.is_some());

    harness.shutdown().await.unwrap();
    assert!(!harness.job_executor().is_running());
    assert!(harness.start().await.is_err());
}
