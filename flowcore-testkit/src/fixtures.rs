use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use flowcore::*;
use tokio::sync::broadcast;

/// Start instant of every [`TestEngine`] clock.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Configuration with short intervals and no retry backoff.
pub fn test_config(lock_owner: &str) -> EngineConfig {
    EngineConfig::default()
        .with_job_executor(
            JobExecutorConfig::new(lock_owner)
                .with_acquisition_interval(20)
                .with_max_jobs_per_acquisition(10)
                .with_worker_pool_size(4)
                .with_acquisition_backoff(5, 50),
        )
        .with_retry(RetryConfig::default().with_backoff(BackoffPolicy::Immediate))
}

/// start -> approve (user task) -> end
pub fn approval_process() -> ProcessDefinition {
    definition(
        ProcessDefinition::builder("approval")
            .start("start")
            .user_task("approve")
            .end("end")
            .flow("start", "approve")
            .flow("approve", "end"),
    )
}

/// start -> work (async service task) -> end
pub fn async_service_process() -> ProcessDefinition {
    definition(
        ProcessDefinition::builder("async-service")
            .start("start")
            .service_task("work")
            .async_before()
            .end("end")
            .flow("start", "work")
            .flow("work", "end"),
    )
}

/// start -> wait (timer) -> end
pub fn timer_process(delay_ms: u64) -> ProcessDefinition {
    definition(
        ProcessDefinition::builder("timer")
            .start("start")
            .timer("wait", delay_ms)
            .end("end")
            .flow("start", "wait")
            .flow("wait", "end"),
    )
}

/// Fork into two user tasks `a` and `b`, join, end.
pub fn parallel_process() -> ProcessDefinition {
    definition(
        ProcessDefinition::builder("parallel")
            .start("start")
            .parallel_gateway("fork")
            .user_task("a")
            .user_task("b")
            .parallel_gateway("join")
            .end("end")
            .flow("start", "fork")
            .flow("fork", "a")
            .flow("fork", "b")
            .flow("a", "join")
            .flow("b", "join")
            .flow("join", "end"),
    )
}

/// Sub-process holding a `review` user task, then end.
pub fn sub_process() -> ProcessDefinition {
    definition(
        ProcessDefinition::builder("nested")
            .start("start")
            .sub_process("sub", "sub_start")
            .start("sub_start")
            .user_task("review")
            .end("sub_end")
            .end_sub_process()
            .end("end")
            .flow("start", "sub")
            .flow("sub_start", "review")
            .flow("review", "sub_end")
            .flow("sub", "end"),
    )
}

/// start -> task -> end, no wait states.
pub fn straight_through_process() -> ProcessDefinition {
    definition(
        ProcessDefinition::builder("straight")
            .start("start")
            .task("task")
            .end("end")
            .flow("start", "task")
            .flow("task", "end"),
    )
}

fn definition(builder: ProcessDefinitionBuilder) -> ProcessDefinition {
    match builder.build() {
        Ok(definition) => definition,
        Err(err) => panic!("fixture definition is invalid: {err}"),
    }
}

/// Engine over an in-memory store with a manual clock and every fixture
/// process deployed.
pub struct TestEngine {
    pub engine: ProcessEngine,
    pub clock: ManualClock,
    pub store: Arc<dyn EngineStore>,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with(test_config("test-node"), |builder| builder)
    }

    /// Engine with extra builder configuration, e.g. handlers.
    pub fn with(
        config: EngineConfig,
        configure: impl FnOnce(ProcessEngineBuilder) -> ProcessEngineBuilder,
    ) -> Self {
        Self::on_store(config, Arc::new(InMemoryStore::new()), ManualClock::new(epoch()), configure)
    }

    /// Engine sharing `store` and `clock`, e.g. a second node.
    pub fn on_store(
        config: EngineConfig,
        store: Arc<dyn EngineStore>,
        clock: ManualClock,
        configure: impl FnOnce(ProcessEngineBuilder) -> ProcessEngineBuilder,
    ) -> Self {
        let builder = ProcessEngine::builder(config)
            .with_store(store.clone())
            .with_clock(Arc::new(clock.clone()))
            .with_definition(approval_process())
            .with_definition(async_service_process())
            .with_definition(timer_process(60_000))
            .with_definition(parallel_process())
            .with_definition(sub_process())
            .with_definition(straight_through_process());
        let engine = match configure(builder).build() {
            Ok(engine) => engine,
            Err(err) => panic!("test engine failed to build: {err:#}"),
        };
        Self {
            engine,
            clock,
            store,
        }
    }

    /// Acquire and run jobs until none are due.
    pub async fn run_jobs(&self) -> usize {
        match self.engine.job_executor().run_until_idle(100).await {
            Ok(acquired) => acquired,
            Err(err) => panic!("job execution failed: {err}"),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.clock.advance(by);
    }

    /// Executions of an instance currently waiting at `activity_id`.
    pub async fn waiting_at(&self, process_instance_id: ProcessInstanceId, activity_id: &str) -> Vec<Execution> {
        let query = ExecutionQuery::by_process_instance(process_instance_id).at_activity(activity_id);
        match self.engine.executions(query).await {
            Ok(executions) => executions,
            Err(err) => panic!("execution query failed: {err}"),
        }
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for TestEngine {
    type Target = ProcessEngine;

    fn deref(&self) -> &ProcessEngine {
        &self.engine
    }
}

/// Receive events until one matches `predicate` or `timeout` passes.
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<EngineEvent>,
    timeout: Duration,
    predicate: impl Fn(&EngineEvent) -> bool,
) -> Option<EngineEvent> {
    tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Drain every event already published.
pub fn drain_events(events: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}
