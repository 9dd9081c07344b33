use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::ids::{BatchId, ExecutionId, IncidentId, JobId, ProcessInstanceId};

/// Engine state change, published only after its transaction committed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum EngineEvent {
    ProcessStarted {
        process_instance_id: ProcessInstanceId,
        process_definition_key: String,
    },
    ProcessCompleted {
        process_instance_id: ProcessInstanceId,
    },
    ProcessCancelled {
        process_instance_id: ProcessInstanceId,
        reason: Option<String>,
    },
    /// An execution arrived at a wait state.
    ExecutionWaiting {
        process_instance_id: ProcessInstanceId,
        execution_id: ExecutionId,
        activity_id: String,
    },
    JobCreated {
        job_id: JobId,
        job_type: String,
        due_date: DateTime<Utc>,
    },
    JobCompleted {
        job_id: JobId,
        job_type: String,
    },
    JobRescheduled {
        job_id: JobId,
        due_date: DateTime<Utc>,
    },
    JobFailed {
        job_id: JobId,
        retries_left: u32,
        message: String,
    },
    IncidentCreated {
        incident_id: IncidentId,
        incident_type: String,
        job_id: Option<JobId>,
    },
    IncidentResolved {
        incident_id: IncidentId,
    },
    BatchCreated {
        batch_id: BatchId,
        batch_type: String,
        total_jobs: u32,
    },
    BatchCompleted {
        batch_id: BatchId,
    },
}

/// In-process fan-out bus for [`EngineEvent`]s.
///
/// Publishing never blocks; a lagging subscriber gets
/// `RecvError::Lagged` and events are dropped when nobody listens.
#[derive(Clone)]
pub struct InProcEventBus {
    sender: broadcast::Sender<EngineEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = EngineEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl Default for InProcEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let bus = InProcEventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        let batch_id = BatchId::new();
        bus.publish(EngineEvent::BatchCompleted { batch_id });

        for rx in [&mut rx1, &mut rx2] {
            let event = timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event, EngineEvent::BatchCompleted { batch_id });
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let bus = InProcEventBus::default();
        bus.publish(EngineEvent::IncidentResolved {
            incident_id: IncidentId::new(),
        });
        let mut rx = bus.subscribe();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_sees_lagged() {
        let bus = InProcEventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.publish(EngineEvent::ProcessCompleted {
                process_instance_id: ProcessInstanceId::new(),
            });
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = EngineEvent::BatchCompleted {
            batch_id: BatchId::new(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "batch_completed");
    }
}
