//! Attempt scheduling from persisted backoff progress.

use vigil_core::RecoveryPolicy;
use vigil_state::RecoveryProgress;

/// What the pipeline should do about recovery right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAttempt {
    /// Start attempt set `attempt_number` (1-based).
    Run { attempt_number: u32 },
    /// Nothing to do before this epoch-ms deadline.
    WaitUntil(u64),
    /// Budget spent and the grace period after the last set is over.
    Exhausted,
}

/// Decide the next recovery step for an incident.
///
/// After the final set the service still gets one backoff period to prove
/// itself healthy before the budget counts as exhausted.
pub fn next_attempt(policy: &RecoveryPolicy, progress: &RecoveryProgress, now: u64) -> NextAttempt {
    if now < progress.next_eligible_at {
        return NextAttempt::WaitUntil(progress.next_eligible_at);
    }
    if progress.attempts_made >= policy.max_attempts {
        NextAttempt::Exhausted
    } else {
        NextAttempt::Run {
            attempt_number: progress.attempts_made + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(attempts_made: u32, next_eligible_at: u64) -> RecoveryProgress {
        RecoveryProgress {
            incident_id: "api-00001".to_string(),
            attempts_made,
            next_eligible_at,
        }
    }

    fn policy(max_attempts: u32) -> RecoveryPolicy {
        let mut policy = RecoveryPolicy::disabled();
        policy.max_attempts = max_attempts;
        policy
    }

    #[test]
    fn first_set_runs_immediately() {
        assert_eq!(
            next_attempt(&policy(2), &progress(0, 1000), 1000),
            NextAttempt::Run { attempt_number: 1 }
        );
    }

    #[test]
    fn waits_for_backoff_deadline() {
        assert_eq!(
            next_attempt(&policy(3), &progress(1, 5000), 4999),
            NextAttempt::WaitUntil(5000)
        );
        assert_eq!(
            next_attempt(&policy(3), &progress(1, 5000), 5000),
            NextAttempt::Run { attempt_number: 2 }
        );
    }

    #[test]
    fn spent_budget_exhausts_after_deadline() {
        assert_eq!(
            next_attempt(&policy(2), &progress(2, 9000), 8000),
            NextAttempt::WaitUntil(9000)
        );
        assert_eq!(next_attempt(&policy(2), &progress(2, 9000), 9000), NextAttempt::Exhausted);
    }

    #[test]
    fn lowered_budget_exhausts() {
        // Reload cut the budget below what was already spent.
        assert_eq!(next_attempt(&policy(1), &progress(3, 0), 10), NextAttempt::Exhausted);
    }
}
