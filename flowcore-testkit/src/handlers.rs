use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flowcore::*;
use parking_lot::Mutex;
use serde_json::Value;

/// Records every configuration it is executed with.
#[derive(Clone)]
pub struct RecordingHandler {
    job_type: String,
    calls: Arc<Mutex<Vec<Value>>>,
    outcome: Arc<Mutex<JobOutcome>>,
}

impl RecordingHandler {
    pub fn new(job_type: &str) -> Self {
        Self {
            job_type: job_type.to_string(),
            calls: Arc::new(Mutex::new(Vec::new())),
            outcome: Arc::new(Mutex::new(JobOutcome::Completed)),
        }
    }

    pub fn calls(&self) -> Vec<Value> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn assert_call_count_eq(&self, expected: usize) {
        let actual = self.call_count();
        assert_eq!(
            actual, expected,
            "Expected {} executions of {}, got {}",
            expected, self.job_type, actual
        );
    }

    pub fn set_outcome(&self, outcome: JobOutcome) {
        *self.outcome.lock() = outcome;
    }
}

impl std::fmt::Debug for RecordingHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingHandler")
            .field("job_type", &self.job_type)
            .field("calls", &self.call_count())
            .finish()
    }
}

#[async_trait]
impl JobHandler for RecordingHandler {
    fn job_type(&self) -> &str {
        &self.job_type
    }

    async fn execute(&self, configuration: &Value, _ctx: &mut CommandContext) -> Result<JobOutcome> {
        self.calls.lock().push(configuration.clone());
        Ok(self.outcome.lock().clone())
    }
}

/// Fails a number of times, then succeeds.
#[derive(Clone, Debug)]
pub struct FailingHandler {
    job_type: String,
    message: String,
    failures: Option<usize>,
    attempts: Arc<AtomicUsize>,
}

impl FailingHandler {
    /// Fails on every attempt.
    pub fn always(job_type: &str, message: &str) -> Self {
        Self {
            job_type: job_type.to_string(),
            message: message.to_string(),
            failures: None,
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fails the first `failures` attempts.
    pub fn times(job_type: &str, failures: usize, message: &str) -> Self {
        Self {
            failures: Some(failures),
            ..Self::always(job_type, message)
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for FailingHandler {
    fn job_type(&self) -> &str {
        &self.job_type
    }

    async fn execute(&self, _configuration: &Value, _ctx: &mut CommandContext) -> Result<JobOutcome> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        match self.failures {
            Some(failures) if attempt > failures => Ok(JobOutcome::Completed),
            _ => Err(EngineError::handler(anyhow::anyhow!(
                "{} (attempt {attempt})",
                self.message
            ))),
        }
    }
}

/// Sleeps while tracking how many executions overlap, overall and per
/// process instance.
#[derive(Clone, Debug)]
pub struct ConcurrencyProbe {
    job_type: String,
    delay: Duration,
    state: Arc<Mutex<ProbeState>>,
}

#[derive(Debug, Default)]
struct ProbeState {
    running: usize,
    max_running: usize,
    per_instance: HashMap<String, usize>,
    max_per_instance: usize,
    completed: usize,
}

impl ConcurrencyProbe {
    pub fn new(job_type: &str, delay: Duration) -> Self {
        Self {
            job_type: job_type.to_string(),
            delay,
            state: Arc::new(Mutex::new(ProbeState::default())),
        }
    }

    pub fn max_running(&self) -> usize {
        self.state.lock().max_running
    }

    /// Highest overlap seen for a single process instance.
    pub fn max_per_instance(&self) -> usize {
        self.state.lock().max_per_instance
    }

    pub fn completed(&self) -> usize {
        self.state.lock().completed
    }
}

#[async_trait]
impl JobHandler for ConcurrencyProbe {
    fn job_type(&self) -> &str {
        &self.job_type
    }

    async fn execute(&self, configuration: &Value, _ctx: &mut CommandContext) -> Result<JobOutcome> {
        let instance = configuration
            .get("instance")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        {
            let mut state = self.state.lock();
            state.running += 1;
            state.max_running = state.max_running.max(state.running);
            let count = state.per_instance.entry(instance.clone()).or_default();
            *count += 1;
            let count = *count;
            state.max_per_instance = state.max_per_instance.max(count);
        }

        tokio::time::sleep(self.delay).await;

        let mut state = self.state.lock();
        state.running -= 1;
        state.completed += 1;
        if let Some(count) = state.per_instance.get_mut(&instance) {
            *count -= 1;
        }
        Ok(JobOutcome::Completed)
    }
}

/// Records the items of every chunk it is given.
#[derive(Clone, Debug)]
pub struct RecordingBatchHandler {
    batch_type: String,
    chunks: Arc<Mutex<Vec<Vec<String>>>>,
}

impl RecordingBatchHandler {
    pub fn new(batch_type: &str) -> Self {
        Self {
            batch_type: batch_type.to_string(),
            chunks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn chunks(&self) -> Vec<Vec<String>> {
        self.chunks.lock().clone()
    }

    pub fn items(&self) -> Vec<String> {
        self.chunks.lock().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl BatchJobHandler for RecordingBatchHandler {
    fn batch_type(&self) -> &str {
        &self.batch_type
    }

    async fn execute(&self, items: &[String], _payload: &Value, _ctx: &mut CommandContext) -> Result<()> {
        self.chunks.lock().push(items.to_vec());
        Ok(())
    }
}

/// Records listener notifications as `kind:activity`, or
/// `take:flow` for taken sequence flows.
#[derive(Clone, Debug, Default)]
pub struct RecordingListener {
    events: Arc<Mutex<Vec<String>>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl ExecutionListener for RecordingListener {
    fn notify(&self, event: &ListenerEvent<'_>) -> Result<()> {
        let entry = match (event.kind, event.flow_id) {
            (ListenerEventKind::Take, Some(flow)) => format!("take:{flow}"),
            (kind, _) => format!("{kind}:{}", event.activity_id),
        };
        self.events.lock().push(entry);
        Ok(())
    }
}
