//! Interceptor chain, authorization and incident tests.

use std::sync::Arc;

use async_trait::async_trait;
use flowcore::command::CommandOutput;
use flowcore::interceptor::{default_chain, Invocation, Next};
use flowcore::*;
use flowcore_testkit::{drain_events, test_config, FlakyStore, TestEngine};
use parking_lot::Mutex;

fn flaky_engine(config: EngineConfig, store: &FlakyStore) -> TestEngine {
    TestEngine::on_store(
        config,
        Arc::new(store.clone()),
        ManualClock::new(flowcore_testkit::epoch()),
        |builder| builder,
    )
}

#[tokio::test]
async fn test_conflict_is_retried_until_commit() {
    let store = FlakyStore::new();
    let harness = flaky_engine(test_config("retry-node"), &store);
    let mut events = harness.subscribe();

    store.conflict_next_flushes(2);
    let pid = harness.start_process_instance("approval").await.unwrap();

    assert_eq!(store.flush_count(), 3);
    assert_eq!(harness.metrics().commands_executed, 1);
    assert_eq!(harness.waiting_at(pid, "approve").await.len(), 1);
    // Events of the rolled back attempts are never published.
    let started = drain_events(&mut events)
        .into_iter()
        .filter(|e| matches!(e, EngineEvent::ProcessStarted { .. }))
        .count();
    assert_eq!(started, 1);
}

#[tokio::test]
async fn test_exhausted_conflict_retries_surface_conflict() {
    let store = FlakyStore::new();
    let config = test_config("exhausted-node");
    let config = config
        .clone()
        .with_retry(config.retry.clone().with_conflict_retries(1));
    let harness = flaky_engine(config, &store);

    store.conflict_next_flushes(5);
    let err = harness.start_process_instance("approval").await.unwrap_err();

    assert!(err.is_conflict(), "{err}");
    assert_eq!(store.flush_count(), 2);
    assert!(store.inner().is_empty());
    assert_eq!(harness.metrics().command_conflicts, 1);
}

#[tokio::test]
async fn test_store_outage_is_not_retried() {
    let store = FlakyStore::new();
    let harness = flaky_engine(test_config("outage-node"), &store);
    let mut events = harness.subscribe();

    store.fail_next_flushes(1);
    let err = harness.start_process_instance("approval").await.unwrap_err();

    assert!(matches!(err, EngineError::Store(_)), "{err}");
    assert_eq!(store.flush_count(), 1);
    assert!(drain_events(&mut events).is_empty());
    assert_eq!(harness.metrics().commands_failed, 1);

    harness.start_process_instance("approval").await.unwrap();
}

#[tokio::test]
async fn test_read_only_command_skips_flush() {
    let store = FlakyStore::new();
    let harness = flaky_engine(test_config("reader-node"), &store);
    store.fail_next_flushes(1);

    let jobs = harness.jobs(JobQuery::default()).await.unwrap();

    assert!(jobs.is_empty());
    assert_eq!(store.flush_count(), 0);
}

#[tokio::test]
async fn test_authorization_checks_authenticated_callers() {
    let authorizations = Arc::new(StaticAuthorizations::new());
    authorizations.grant("clerks", Permission::new("process_instance", "create"));
    let harness = TestEngine::with(test_config("auth-node"), {
        let authorizations = authorizations.clone();
        move |builder| builder.with_authorization(authorizations)
    });

    let err = harness
        .execute_as(StartProcessInstanceCommand::new("approval"), Authentication::user("bob"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Unauthorized {
            action: "create",
            resource: "process_instance",
            ..
        }
    ));
    assert!(harness
        .executions(ExecutionQuery::default())
        .await
        .unwrap()
        .is_empty());

    let clerk = Authentication::user("ann").with_group("clerks");
    harness
        .execute_as(StartProcessInstanceCommand::new("approval"), clerk.clone())
        .await
        .unwrap();

    // Reading needs its own grant.
    let err = harness
        .execute_as(FindExecutionsCommand::default(), clerk)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized { .. }));

    // Engine-internal calls carry no authentication.
    harness.start_process_instance("approval").await.unwrap();
}

#[derive(Debug, Default)]
struct TraceInterceptor {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl CommandInterceptor for TraceInterceptor {
    fn name(&self) -> &'static str {
        "trace"
    }

    async fn invoke(&self, invocation: &mut Invocation<'_>, next: Next<'_>) -> Result<CommandOutput> {
        let command = invocation.command().name();
        let result = next.run(invocation).await;
        let status = if result.is_ok() { "ok" } else { "err" };
        self.seen.lock().push(format!("{command}:{status}"));
        result
    }
}

#[tokio::test]
async fn test_custom_interceptor_wraps_every_command() {
    let trace = Arc::new(TraceInterceptor::default());
    let config = test_config("trace-node");
    let mut chain = default_chain(&config.retry);
    chain.insert(0, trace.clone());
    let harness = TestEngine::with(config, move |builder| builder.with_interceptors(chain));

    let pid = harness.start_process_instance("approval").await.unwrap();
    let waiting = harness.waiting_at(pid, "approve").await;
    harness.signal(ExecutionId::new()).await.unwrap_err();
    harness.signal(waiting[0].id).await.unwrap();

    assert_eq!(
        trace.seen.lock().clone(),
        vec![
            "start_process_instance:ok",
            "find_executions:ok",
            "signal_execution:err",
            "signal_execution:ok",
        ]
    );
}

#[test]
fn test_chain_without_invoker_is_rejected() {
    let config = test_config("broken-node");
    let mut chain = default_chain(&config.retry);
    chain.pop();

    let result = ProcessEngine::builder(config)
        .with_store(Arc::new(InMemoryStore::new()))
        .with_interceptors(chain)
        .build();

    assert!(result.is_err());
}

fn build_with(chain: Vec<Arc<dyn CommandInterceptor>>) -> String {
    ProcessEngine::builder(test_config("layout-node"))
        .with_store(Arc::new(InMemoryStore::new()))
        .with_interceptors(chain)
        .build()
        .err()
        .map(|e| e.to_string())
        .unwrap_or_default()
}

#[test]
fn test_chain_layout_is_enforced() {
    let config = test_config("layout-node");
    let position = |chain: &[Arc<dyn CommandInterceptor>], name: &str| {
        chain.iter().position(|i| i.name() == name).unwrap()
    };

    assert_eq!(build_with(default_chain(&config.retry)), "");

    let mut without_context = default_chain(&config.retry);
    without_context.retain(|i| i.name() != "context");
    assert!(build_with(without_context).contains("no context interceptor"));

    let mut without_transaction = default_chain(&config.retry);
    without_transaction.retain(|i| i.name() != "transaction");
    assert!(build_with(without_transaction).contains("no transaction interceptor"));

    let mut context_outside = default_chain(&config.retry);
    let (tx, ctx) = (
        position(&context_outside, "transaction"),
        position(&context_outside, "context"),
    );
    context_outside.swap(tx, ctx);
    assert!(build_with(context_outside).contains("inside the transaction"));

    let mut retry_inside = default_chain(&config.retry);
    let (retry, tx) = (
        position(&retry_inside, "conflict-retry"),
        position(&retry_inside, "transaction"),
    );
    retry_inside.swap(retry, tx);
    assert!(build_with(retry_inside).contains("outside the transaction"));
}

#[test]
fn test_builder_requires_store() {
    let result = ProcessEngine::builder(test_config("storeless-node")).build();
    let err = result.err().map(|e| e.to_string()).unwrap_or_default();
    assert!(err.contains("store"), "{err}");
}

#[tokio::test]
async fn test_custom_incident_lifecycle() {
    let harness = TestEngine::new();
    let pid = harness.start_process_instance("approval").await.unwrap();
    let execution = harness.waiting_at(pid, "approve").await[0].id;
    let mut events = harness.subscribe();

    let first = harness
        .create_incident("approvalEscalated", execution, "nobody approved")
        .await
        .unwrap();
    let again = harness
        .create_incident("approvalEscalated", execution, "still nobody")
        .await
        .unwrap();
    assert_eq!(first, again);

    let open = harness
        .incidents(IncidentQuery::by_process_instance(pid))
        .await
        .unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].execution_id, Some(execution));
    assert_eq!(open[0].message, "nobody approved");

    harness.resolve_incident(first).await.unwrap();
    assert!(harness
        .incidents(IncidentQuery::by_process_instance(pid))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        drain_events(&mut events),
        vec![
            EngineEvent::IncidentCreated {
                incident_id: first,
                incident_type: "approvalEscalated".into(),
                job_id: None,
            },
            EngineEvent::IncidentResolved { incident_id: first },
        ]
    );

    let err = harness.resolve_incident(first).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { entity: "incident", .. }));

    let metrics = harness.metrics();
    assert_eq!(metrics.incidents_created, 1);
    assert_eq!(metrics.incidents_resolved, 1);
}

#[tokio::test]
async fn test_distinct_configurations_open_separate_incidents() {
    let harness = TestEngine::new();
    let pid = harness.start_process_instance("approval").await.unwrap();
    let execution = harness.waiting_at(pid, "approve").await[0].id;

    for source in ["crm", "erp"] {
        harness
            .execute(CreateIncidentCommand::new("syncFailed", execution, "sync failed").with_configuration(source))
            .await
            .unwrap();
    }

    let open = harness
        .incidents(IncidentQuery::by_execution(execution).with_type("syncFailed"))
        .await
        .unwrap();
    assert_eq!(open.len(), 2);
}

#[tokio::test]
async fn test_create_incident_rejects_invalid_requests() {
    let harness = TestEngine::new();
    let pid = harness.start_process_instance("approval").await.unwrap();
    let execution = harness.waiting_at(pid, "approve").await[0].id;

    let reserved = harness
        .create_incident(FAILED_JOB_INCIDENT, execution, "manual")
        .await
        .unwrap_err();
    assert!(matches!(reserved, EngineError::Validation(_)));

    let blank = harness.create_incident(" ", execution, "manual").await.unwrap_err();
    assert!(matches!(blank, EngineError::Validation(_)));

    let missing = harness
        .create_incident("custom", ExecutionId::new(), "manual")
        .await
        .unwrap_err();
    assert!(matches!(missing, EngineError::NotFound { entity: "execution", .. }));
}
