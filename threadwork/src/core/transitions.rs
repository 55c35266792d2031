//! Thread status transition rules.
//!
//! The thread store is the single source of truth for status, so every write
//! goes through [`validate_transition`] first.

use crate::core::types::ThreadStatus;

/// Check that moving a thread from `from` to `to` is allowed.
///
/// Returns a stable error message on violation.
pub fn validate_transition(from: ThreadStatus, to: ThreadStatus) -> Result<(), String> {
    use ThreadStatus as S;

    if from == to {
        return Ok(());
    }
    let allowed = match from {
        S::Created => matches!(to, S::Running | S::Failed),
        S::Running => matches!(
            to,
            S::AwaitingTool | S::Completed | S::Cancelled | S::Failed
        ),
        S::AwaitingTool => matches!(to, S::Running | S::Cancelled | S::Failed),
        S::Completed => matches!(to, S::Running | S::Merged | S::Failed),
        S::Cancelled => matches!(to, S::Running | S::Merged | S::Failed),
        S::Failed | S::Merged => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(format!("invalid status transition {from} -> {to}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_turn_path_is_allowed() {
        let path = [
            ThreadStatus::Created,
            ThreadStatus::Running,
            ThreadStatus::AwaitingTool,
            ThreadStatus::Running,
            ThreadStatus::Completed,
            ThreadStatus::Merged,
        ];
        for pair in path.windows(2) {
            validate_transition(pair[0], pair[1]).expect("allowed");
        }
    }

    #[test]
    fn terminal_states_are_final() {
        for to in [ThreadStatus::Running, ThreadStatus::Completed] {
            assert!(validate_transition(ThreadStatus::Failed, to).is_err());
            assert!(validate_transition(ThreadStatus::Merged, to).is_err());
        }
    }

    #[test]
    fn merge_requires_finished_turn() {
        let err = validate_transition(ThreadStatus::AwaitingTool, ThreadStatus::Merged)
            .expect_err("rejected");
        assert_eq!(err, "invalid status transition awaiting_tool -> merged");
    }

    #[test]
    fn resumed_thread_can_continue() {
        validate_transition(ThreadStatus::Completed, ThreadStatus::Running).expect("next turn");
        validate_transition(ThreadStatus::Cancelled, ThreadStatus::Running).expect("retry turn");
    }
}
