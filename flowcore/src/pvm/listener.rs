use std::fmt;

use crate::error::Result;
use crate::ids::{ExecutionId, ProcessInstanceId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ListenerEventKind {
    Start,
    End,
    Take,
}

impl fmt::Display for ListenerEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Take => "take",
        })
    }
}

/// Notification fired by the atomic operations.
#[derive(Clone, Copy, Debug)]
pub struct ListenerEvent<'a> {
    pub kind: ListenerEventKind,
    pub process_instance_id: ProcessInstanceId,
    pub execution_id: ExecutionId,
    pub activity_id: &'a str,
    /// Sequence flow being taken; set for [`ListenerEventKind::Take`] only.
    pub flow_id: Option<&'a str>,
}

/// Observes executions entering, leaving and moving between activities.
///
/// Listeners run synchronously inside the command's transaction. Returning an
/// error aborts the transaction.
pub trait ExecutionListener: Send + Sync {
    fn notify(&self, event: &ListenerEvent<'_>) -> Result<()>;
}
