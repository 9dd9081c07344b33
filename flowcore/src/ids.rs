use std::fmt::Display;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub Uuid);

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl $name {
            /// Create a new time-ordered identifier (UUID v7).
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

entity_id!(
    /// Identifier of one execution in an execution tree.
    ExecutionId
);
entity_id!(
    /// Identifier of a process instance; equal to its root execution id.
    ProcessInstanceId
);
entity_id!(
    /// Identifier of a persisted job.
    JobId
);
entity_id!(
    /// Identifier of a batch.
    BatchId
);
entity_id!(
    /// Identifier of an incident.
    IncidentId
);

impl ProcessInstanceId {
    pub fn root_execution(&self) -> ExecutionId {
        ExecutionId(self.0)
    }
}

impl From<ExecutionId> for ProcessInstanceId {
    fn from(root: ExecutionId) -> Self {
        Self(root.0)
    }
}
