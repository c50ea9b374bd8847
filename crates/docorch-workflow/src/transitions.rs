use docorch_types::{SessionKind, WorkflowState};

use crate::model::WorkflowEvent;

/// Why a transition was rejected. `NoSuchTransition` means the (state, event)
/// pair has no row in the table at all; `GuardFailed` means the row exists
/// but its precondition did not hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionRejection {
    NoSuchTransition,
    GuardFailed(&'static str),
}

/// The single source of truth for legal transitions. Every row of the
/// documentation workflow's state table is represented here; nothing
/// elsewhere in the engine re-derives or duplicates it.
pub fn apply(
    state: WorkflowState,
    event: &WorkflowEvent,
) -> Result<WorkflowState, TransitionRejection> {
    use WorkflowEvent::*;
    use WorkflowState::*;

    // Global rows: valid from any non-terminal state, checked before the
    // state-specific rows so `fail`/`cancel` always short-circuit.
    if !state.is_terminal() {
        match event {
            Fail { .. } => return Ok(Failed),
            Cancel { .. } => return Ok(Cancelled),
            _ => {}
        }
    }

    match (state, event) {
        (Created, Start { kind }) => {
            if *kind == SessionKind::Full {
                Ok(AwaitingGroupings)
            } else {
                Ok(Processing)
            }
        }
        (AwaitingGroupings, GroupingsReceived { group_count }) => {
            if *group_count == 0 {
                Err(TransitionRejection::GuardFailed("groups must be non-empty"))
            } else {
                Ok(Processing)
            }
        }
        (Processing, Process) => Ok(Analyzing),
        (Analyzing, AnalysisReceived { processed, total }) => {
            if processed < total {
                Ok(Processing)
            } else {
                Ok(EvolvingMemory)
            }
        }
        (EvolvingMemory, MemoryEvolved) => Ok(GeneratingDocs),
        (GeneratingDocs, DocsGenerated) => Ok(ConsensusReview),
        (ConsensusReview, ConsensusOk { score, threshold }) => {
            if score >= threshold {
                Ok(Completed)
            } else {
                Err(TransitionRejection::GuardFailed("score below threshold"))
            }
        }
        (ConsensusReview, ConsensusFail { score, threshold }) => {
            if score < threshold {
                Ok(GeneratingDocs)
            } else {
                Err(TransitionRejection::GuardFailed("score meets threshold"))
            }
        }
        (Failed, Retry { attempts, max_attempts }) => {
            if attempts < max_attempts {
                Ok(Processing)
            } else {
                Err(TransitionRejection::GuardFailed("attempts exhausted"))
            }
        }
        (Processing, Pause) => Ok(Paused),
        (Paused, Resume) => Ok(Processing),
        _ => Err(TransitionRejection::NoSuchTransition),
    }
}

/// Derived allow-list for a state: every event name that has at least one
/// transition row, used only for introspection/diagnostics, never as a
/// second source of truth.
pub fn allowed_events(state: WorkflowState) -> Vec<&'static str> {
    let probes: Vec<WorkflowEvent> = vec![
        WorkflowEvent::Start { kind: SessionKind::Full },
        WorkflowEvent::Start { kind: SessionKind::Module },
        WorkflowEvent::GroupingsReceived { group_count: 1 },
        WorkflowEvent::Process,
        WorkflowEvent::AnalysisReceived { processed: 0, total: 1 },
        WorkflowEvent::Pause,
        WorkflowEvent::Resume,
        WorkflowEvent::Complete,
        WorkflowEvent::Retry { attempts: 0, max_attempts: 1 },
        WorkflowEvent::MemoryEvolved,
        WorkflowEvent::DocsGenerated,
        WorkflowEvent::ConsensusOk { score: 1.0, threshold: 0.0 },
        WorkflowEvent::ConsensusFail { score: 0.0, threshold: 1.0 },
    ];
    let mut names: Vec<&'static str> = probes
        .iter()
        .filter(|event| apply(state, event).is_ok())
        .map(|event| event.name())
        .collect();
    if !state.is_terminal() {
        names.push("fail");
        names.push("cancel");
    }
    names.sort_unstable();
    names.dedup();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_session_start_awaits_groupings() {
        let next = apply(WorkflowState::Created, &WorkflowEvent::Start { kind: SessionKind::Full }).unwrap();
        assert_eq!(next, WorkflowState::AwaitingGroupings);
    }

    #[test]
    fn module_session_start_skips_groupings() {
        let next = apply(WorkflowState::Created, &WorkflowEvent::Start { kind: SessionKind::Module }).unwrap();
        assert_eq!(next, WorkflowState::Processing);
    }

    #[test]
    fn empty_groupings_are_rejected() {
        let err = apply(
            WorkflowState::AwaitingGroupings,
            &WorkflowEvent::GroupingsReceived { group_count: 0 },
        )
        .unwrap_err();
        assert!(matches!(err, TransitionRejection::GuardFailed(_)));
    }

    #[test]
    fn analysis_received_routes_on_completion() {
        let mid = apply(
            WorkflowState::Analyzing,
            &WorkflowEvent::AnalysisReceived { processed: 1, total: 3 },
        )
        .unwrap();
        assert_eq!(mid, WorkflowState::Processing);

        let done = apply(
            WorkflowState::Analyzing,
            &WorkflowEvent::AnalysisReceived { processed: 3, total: 3 },
        )
        .unwrap();
        assert_eq!(done, WorkflowState::EvolvingMemory);
    }

    #[test]
    fn retry_is_deterministic_and_guarded_by_attempts() {
        let ok = apply(
            WorkflowState::Failed,
            &WorkflowEvent::Retry { attempts: 1, max_attempts: 3 },
        )
        .unwrap();
        assert_eq!(ok, WorkflowState::Processing);

        let exhausted = apply(
            WorkflowState::Failed,
            &WorkflowEvent::Retry { attempts: 3, max_attempts: 3 },
        );
        assert!(exhausted.is_err());
    }

    #[test]
    fn fail_and_cancel_are_available_from_any_non_terminal_state() {
        for state in [
            WorkflowState::Created,
            WorkflowState::AwaitingGroupings,
            WorkflowState::Processing,
            WorkflowState::Analyzing,
            WorkflowState::EvolvingMemory,
            WorkflowState::GeneratingDocs,
            WorkflowState::ConsensusReview,
            WorkflowState::Paused,
        ] {
            assert_eq!(
                apply(state, &WorkflowEvent::Fail { reason: "x".into() }).unwrap(),
                WorkflowState::Failed
            );
            assert_eq!(
                apply(state, &WorkflowEvent::Cancel { reason: "x".into() }).unwrap(),
                WorkflowState::Cancelled
            );
        }
    }

    #[test]
    fn terminal_states_never_appear_as_from_for_fail_or_cancel() {
        for state in [
            WorkflowState::Completed,
            WorkflowState::Failed,
            WorkflowState::Cancelled,
            WorkflowState::Expired,
        ] {
            assert!(apply(state, &WorkflowEvent::Cancel { reason: "x".into() }).is_err());
        }
    }

    #[test]
    fn allowed_events_reflects_the_table_for_processing() {
        let events = allowed_events(WorkflowState::Processing);
        assert!(events.contains(&"process"));
        assert!(events.contains(&"pause"));
        assert!(events.contains(&"fail"));
        assert!(!events.contains(&"docs_generated"));
    }
}
