use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ExecutionId, IncidentId, JobId, ProcessInstanceId};

/// Incident type created when a job runs out of retries.
pub const FAILED_JOB_INCIDENT: &str = "failedJob";

/// Persisted record of an unresolved failure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentId,
    pub incident_type: String,
    pub message: String,
    pub job_id: Option<JobId>,
    pub execution_id: Option<ExecutionId>,
    pub process_instance_id: Option<ProcessInstanceId>,
    /// Identifies the cause for custom incidents.
    pub configuration: Option<String>,
    pub created_at: DateTime<Utc>,
    pub revision: u32,
}

impl Incident {
    pub fn new(
        incident_type: impl Into<String>,
        message: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: IncidentId::new(),
            incident_type: incident_type.into(),
            message: message.into(),
            job_id: None,
            execution_id: None,
            process_instance_id: None,
            configuration: None,
            created_at,
            revision: 0,
        }
    }

    pub fn for_job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn for_execution(
        mut self,
        process_instance_id: Option<ProcessInstanceId>,
        execution_id: Option<ExecutionId>,
    ) -> Self {
        self.process_instance_id = process_instance_id;
        self.execution_id = execution_id;
        self
    }

    pub fn with_configuration(mut self, configuration: impl Into<String>) -> Self {
        self.configuration = Some(configuration.into());
        self
    }

    /// Same type, execution and cause: at most one may be open.
    pub fn same_cause(&self, other: &Incident) -> bool {
        self.incident_type == other.incident_type
            && self.execution_id == other.execution_id
            && self.job_id == other.job_id
            && self.configuration == other.configuration
    }
}

#[derive(Clone, Debug, Default)]
pub struct IncidentQuery {
    pub incident_type: Option<String>,
    pub job_id: Option<JobId>,
    pub execution_id: Option<ExecutionId>,
    pub process_instance_id: Option<ProcessInstanceId>,
}

impl IncidentQuery {
    pub fn by_job(job_id: JobId) -> Self {
        Self {
            job_id: Some(job_id),
            ..Default::default()
        }
    }

    pub fn by_process_instance(id: ProcessInstanceId) -> Self {
        Self {
            process_instance_id: Some(id),
            ..Default::default()
        }
    }

    pub fn by_execution(id: ExecutionId) -> Self {
        Self {
            execution_id: Some(id),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, incident_type: impl Into<String>) -> Self {
        self.incident_type = Some(incident_type.into());
        self
    }

    pub fn matches(&self, incident: &Incident) -> bool {
        self.incident_type
            .as_deref()
            .is_none_or(|t| incident.incident_type == t)
            && self.job_id.is_none_or(|id| incident.job_id == Some(id))
            && self
                .execution_id
                .is_none_or(|id| incident.execution_id == Some(id))
            && self
                .process_instance_id
                .is_none_or(|id| incident.process_instance_id == Some(id))
    }
}
