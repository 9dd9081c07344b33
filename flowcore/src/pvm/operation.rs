use serde::{Deserialize, Serialize};

/// Indivisible step of the execution state machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AtomicOperation {
    ProcessStart,
    TransitionCreateScope,
    TransitionNotifyListenerStart,
    ActivityExecute,
    TransitionNotifyListenerEnd,
    TransitionDestroyScope,
    TransitionNotifyListenerTake,
    ActivityEnd,
    ProcessEnd,
}

impl AtomicOperation {
    pub const ALL: [AtomicOperation; 9] = [
        Self::ProcessStart,
        Self::TransitionCreateScope,
        Self::TransitionNotifyListenerStart,
        Self::ActivityExecute,
        Self::TransitionNotifyListenerEnd,
        Self::TransitionDestroyScope,
        Self::TransitionNotifyListenerTake,
        Self::ActivityEnd,
        Self::ProcessEnd,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::ProcessStart => "process-start",
            Self::TransitionCreateScope => "transition-create-scope",
            Self::TransitionNotifyListenerStart => "transition-notify-listener-start",
            Self::ActivityExecute => "activity-execute",
            Self::TransitionNotifyListenerEnd => "transition-notify-listener-end",
            Self::TransitionDestroyScope => "transition-destroy-scope",
            Self::TransitionNotifyListenerTake => "transition-notify-listener-take",
            Self::ActivityEnd => "activity-end",
            Self::ProcessEnd => "process-end",
        }
    }
}

/// What a single operation observed after its state change.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Outcome {
    /// Continue with the next step on the same execution.
    Proceed,
    /// The activity is a scope; a child execution was created for it.
    EnterScope,
    /// An async continuation job was created.
    Async,
    /// Activity behavior finished, leave the activity.
    Leave,
    /// Waiting for a signal or a timer job.
    Wait,
    /// Arrived at a join that still waits for other branches.
    Joined,
    /// Last branch arrived at a join; the parent continues.
    JoinComplete,
    /// The activity has no outgoing flows.
    NoOutgoing,
    /// Several outgoing flows were taken concurrently.
    Fork,
    /// The root execution reached the end.
    InstanceCompleted,
    /// A non-root scope execution reached its end.
    ScopeCompleted,
    /// The last concurrent branch under a parent ended.
    ConcurrentCompleted,
    /// This path ended while others continue, or the instance is gone.
    Ended,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Transition {
    Next(AtomicOperation),
    /// Stable resting state; nothing more to do for this execution.
    Suspend,
}

/// The transition table. `None` marks an outcome the operation never reports.
pub fn next_operation(operation: AtomicOperation, outcome: Outcome) -> Option<Transition> {
    use AtomicOperation as Op;
    use Outcome as O;
    use Transition::{Next, Suspend};

    let transition = match (operation, outcome) {
        (Op::ProcessStart, O::Proceed) => Next(Op::TransitionNotifyListenerStart),

        (Op::TransitionNotifyListenerStart, O::Proceed) => Next(Op::ActivityExecute),
        (Op::TransitionNotifyListenerStart, O::EnterScope) => Next(Op::TransitionCreateScope),
        (Op::TransitionNotifyListenerStart, O::Async) => Suspend,

        (Op::TransitionCreateScope, O::Proceed) => Next(Op::TransitionNotifyListenerStart),

        (Op::ActivityExecute, O::Leave) => Next(Op::TransitionNotifyListenerEnd),
        (Op::ActivityExecute, O::Wait) => Suspend,
        (Op::ActivityExecute, O::Joined) => Suspend,
        (Op::ActivityExecute, O::JoinComplete) => Next(Op::TransitionNotifyListenerEnd),

        (Op::TransitionNotifyListenerEnd, O::Proceed) => Next(Op::TransitionNotifyListenerTake),
        (Op::TransitionNotifyListenerEnd, O::NoOutgoing) => Next(Op::ActivityEnd),

        (Op::TransitionNotifyListenerTake, O::Proceed) => Next(Op::TransitionNotifyListenerStart),
        (Op::TransitionNotifyListenerTake, O::Fork) => Next(Op::TransitionNotifyListenerStart),

        (Op::ActivityEnd, O::InstanceCompleted) => Next(Op::ProcessEnd),
        (Op::ActivityEnd, O::ScopeCompleted) => Next(Op::TransitionDestroyScope),
        (Op::ActivityEnd, O::ConcurrentCompleted) => Next(Op::ActivityEnd),
        (Op::ActivityEnd, O::Ended) => Suspend,

        (Op::TransitionDestroyScope, O::Proceed) => Next(Op::TransitionNotifyListenerEnd),

        (Op::ProcessEnd, O::Ended) => Suspend,

        _ => return None,
    };
    Some(transition)
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTCOMES: [Outcome; 13] = [
        Outcome::Proceed,
        Outcome::EnterScope,
        Outcome::Async,
        Outcome::Leave,
        Outcome::Wait,
        Outcome::Joined,
        Outcome::JoinComplete,
        Outcome::NoOutgoing,
        Outcome::Fork,
        Outcome::InstanceCompleted,
        Outcome::ScopeCompleted,
        Outcome::ConcurrentCompleted,
        Outcome::Ended,
    ];

    #[test]
    fn test_every_operation_has_a_legal_outcome() {
        for op in AtomicOperation::ALL {
            let legal = OUTCOMES
                .iter()
                .filter(|outcome| next_operation(op, **outcome).is_some())
                .count();
            assert!(legal > 0, "{} has no legal outcome", op.name());
        }
    }

    #[test]
    fn test_table_size() {
        let legal: usize = AtomicOperation::ALL
            .iter()
            .map(|op| {
                OUTCOMES
                    .iter()
                    .filter(|outcome| next_operation(*op, **outcome).is_some())
                    .count()
            })
            .sum();
        assert_eq!(legal, 19);
    }

    #[test]
    fn test_straight_through_path() {
        let mut op = AtomicOperation::ProcessStart;
        let path = [
            Outcome::Proceed,
            Outcome::Proceed,
            Outcome::Leave,
            Outcome::NoOutgoing,
            Outcome::InstanceCompleted,
        ];
        for outcome in path {
            match next_operation(op, outcome) {
                Some(Transition::Next(next)) => op = next,
                other => panic!("unexpected {other:?} after {op:?}"),
            }
        }
        assert_eq!(op, AtomicOperation::ProcessEnd);
        assert_eq!(
            next_operation(op, Outcome::Ended),
            Some(Transition::Suspend)
        );
    }

    #[test]
    fn test_illegal_pairs() {
        assert_eq!(next_operation(AtomicOperation::ProcessEnd, Outcome::Proceed), None);
        assert_eq!(next_operation(AtomicOperation::ActivityEnd, Outcome::Fork), None);
        assert_eq!(next_operation(AtomicOperation::ProcessStart, Outcome::Wait), None);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&AtomicOperation::TransitionCreateScope).unwrap();
        assert_eq!(json, "\"transition_create_scope\"");
    }
}
