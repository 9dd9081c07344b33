use async_trait::async_trait;

use crate::auth::Permission;
use crate::command::Command;
use crate::context::CommandContext;
use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::ids::{ExecutionId, IncidentId};
use crate::incident::{Incident, IncidentQuery, FAILED_JOB_INCIDENT};

const CREATE_INCIDENT: Permission = Permission::new("incident", "create");
const RESOLVE_INCIDENT: Permission = Permission::new("incident", "delete");
const READ_INCIDENT: Permission = Permission::new("incident", "read");

/// Insert `incident` unless one with the same cause is already open.
///
/// Returns the id of the open incident either way.
pub(crate) async fn open_incident(ctx: &mut CommandContext, incident: Incident) -> Result<IncidentId> {
    let query = IncidentQuery {
        incident_type: Some(incident.incident_type.clone()),
        job_id: incident.job_id,
        execution_id: incident.execution_id,
        process_instance_id: None,
    };
    if let Some(existing) = ctx
        .incidents(&query)
        .await?
        .into_iter()
        .find(|open| open.same_cause(&incident))
    {
        return Ok(existing.id);
    }

    let id = incident.id;
    ctx.publish(EngineEvent::IncidentCreated {
        incident_id: id,
        incident_type: incident.incident_type.clone(),
        job_id: incident.job_id,
    });
    let metrics = ctx.services().metrics.clone();
    let incident_type = incident.incident_type.clone();
    ctx.transaction()
        .on_commit(move || metrics.record_incident_created(&incident_type));
    tracing::warn!(
        incident_id = %id,
        incident_type = %incident.incident_type,
        message = %incident.message,
        "incident created"
    );
    ctx.insert(incident)?;
    Ok(id)
}

/// Delete an open incident.
pub(crate) fn close_incident(ctx: &mut CommandContext, incident: &Incident) -> Result<()> {
    ctx.delete::<Incident>(incident.id)?;
    ctx.publish(EngineEvent::IncidentResolved {
        incident_id: incident.id,
    });
    let metrics = ctx.services().metrics.clone();
    let incident_type = incident.incident_type.clone();
    ctx.transaction()
        .on_commit(move || metrics.record_incident_resolved(&incident_type));
    Ok(())
}

/// Report a custom failure against an execution.
#[derive(Clone, Debug)]
pub struct CreateIncidentCommand {
    pub incident_type: String,
    pub message: String,
    pub execution_id: ExecutionId,
    /// Distinguishes causes of the same type on one execution.
    pub configuration: Option<String>,
}

impl CreateIncidentCommand {
    pub fn new(
        incident_type: impl Into<String>,
        execution_id: ExecutionId,
        message: impl Into<String>,
    ) -> Self {
        Self {
            incident_type: incident_type.into(),
            message: message.into(),
            execution_id,
            configuration: None,
        }
    }

    pub fn with_configuration(mut self, configuration: impl Into<String>) -> Self {
        self.configuration = Some(configuration.into());
        self
    }
}

#[async_trait]
impl Command for CreateIncidentCommand {
    type Output = IncidentId;

    fn name(&self) -> &'static str {
        "create_incident"
    }

    fn permission(&self) -> Option<Permission> {
        Some(CREATE_INCIDENT)
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<IncidentId> {
        if self.incident_type.trim().is_empty() {
            return Err(EngineError::validation("incident type must not be empty"));
        }
        if self.incident_type == FAILED_JOB_INCIDENT {
            return Err(EngineError::validation(
                "failedJob incidents are created by the job executor",
            ));
        }
        let execution = ctx
            .execution(self.execution_id)
            .await?
            .ok_or_else(|| EngineError::not_found("execution", self.execution_id))?;

        let mut incident = Incident::new(&self.incident_type, &self.message, ctx.now())
            .for_execution(Some(execution.process_instance_id), Some(execution.id));
        if let Some(configuration) = &self.configuration {
            incident = incident.with_configuration(configuration);
        }
        open_incident(ctx, incident).await
    }
}

/// Resolve a custom incident.
///
/// `failedJob` incidents resolve by giving their job retries again.
#[derive(Clone, Copy, Debug)]
pub struct ResolveIncidentCommand {
    pub incident_id: IncidentId,
}

#[async_trait]
impl Command for ResolveIncidentCommand {
    type Output = ();

    fn name(&self) -> &'static str {
        "resolve_incident"
    }

    fn permission(&self) -> Option<Permission> {
        Some(RESOLVE_INCIDENT)
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<()> {
        let incident = ctx
            .incident(self.incident_id)
            .await?
            .ok_or_else(|| EngineError::not_found("incident", self.incident_id))?;
        if incident.incident_type == FAILED_JOB_INCIDENT {
            return Err(EngineError::validation(format!(
                "incident {} is resolved by setting retries on its job",
                self.incident_id
            )));
        }
        close_incident(ctx, &incident)
    }
}

/// Open incidents matching a query.
#[derive(Clone, Debug, Default)]
pub struct FindIncidentsCommand {
    pub query: IncidentQuery,
}

#[async_trait]
impl Command for FindIncidentsCommand {
    type Output = Vec<Incident>;

    fn name(&self) -> &'static str {
        "find_incidents"
    }

    fn permission(&self) -> Option<Permission> {
        Some(READ_INCIDENT)
    }

    async fn execute(&self, ctx: &mut CommandContext) -> Result<Vec<Incident>> {
        ctx.incidents(&self.query).await
    }
}
