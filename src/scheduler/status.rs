//! Execution status state machine and derived timing.

use chrono::{DateTime, Utc};

use super::{ExecutionStatus, TaskError, TaskResult};

/// Legal edges are `running -> {completed, failed, timeout}`. Everything else,
/// including any edge out of a terminal state, is rejected.
pub fn is_valid_status_transition(from: ExecutionStatus, to: ExecutionStatus) -> bool {
    matches!(
        (from, to),
        (ExecutionStatus::Running, ExecutionStatus::Completed)
            | (ExecutionStatus::Running, ExecutionStatus::Failed)
            | (ExecutionStatus::Running, ExecutionStatus::Timeout)
    )
}

/// Like [`is_valid_status_transition`] but as a `Result` for `?` chains.
pub fn ensure_transition(from: ExecutionStatus, to: ExecutionStatus) -> TaskResult<()> {
    if is_valid_status_transition(from, to) {
        Ok(())
    } else {
        Err(TaskError::InvalidTransition { from, to })
    }
}

/// Wall-clock duration of an execution in whole milliseconds.
///
/// A completion earlier than the start is rejected rather than stored as a
/// negative duration.
pub fn calculate_execution_time_ms(
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
) -> TaskResult<i64> {
    if completed_at < started_at {
        return Err(TaskError::NegativeDuration {
            started_at,
            completed_at,
        });
    }
    Ok((completed_at - started_at).num_milliseconds())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_transition_table_is_exhaustive() {
        for from in ExecutionStatus::ALL {
            for to in ExecutionStatus::ALL {
                let expected = from == ExecutionStatus::Running && to != ExecutionStatus::Running;
                assert_eq!(
                    is_valid_status_transition(from, to),
                    expected,
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        assert!(!is_valid_status_transition(
            ExecutionStatus::Completed,
            ExecutionStatus::Failed
        ));
        assert!(!is_valid_status_transition(
            ExecutionStatus::Timeout,
            ExecutionStatus::Running
        ));
        assert!(matches!(
            ensure_transition(ExecutionStatus::Failed, ExecutionStatus::Completed),
            Err(TaskError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_execution_time_is_millisecond_difference() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 2, 0, 0).unwrap();
        let t1 = t0 + Duration::milliseconds(1_234);
        assert_eq!(calculate_execution_time_ms(t0, t1).unwrap(), 1_234);
        assert_eq!(calculate_execution_time_ms(t0, t0).unwrap(), 0);
    }

    #[test]
    fn test_execution_time_rejects_reversed_timestamps() {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 2, 0, 0).unwrap();
        let t1 = t0 - Duration::seconds(1);
        assert!(matches!(
            calculate_execution_time_ms(t0, t1),
            Err(TaskError::NegativeDuration { .. })
        ));
    }
}
