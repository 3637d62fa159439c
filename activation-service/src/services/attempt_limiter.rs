/// What to do with a code once its failed-attempt counter is compared with `max_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptDecision {
    Allow { remaining: i32 },
    /// One attempt left.
    WarnNearLimit { remaining: i32 },
    Lock,
}

impl AttemptDecision {
    pub fn remaining(&self) -> i32 {
        match self {
            AttemptDecision::Allow { remaining } | AttemptDecision::WarnNearLimit { remaining } => {
                *remaining
            }
            AttemptDecision::Lock => 0,
        }
    }

    pub fn is_lock(&self) -> bool {
        matches!(self, AttemptDecision::Lock)
    }
}

/// Pure decision over the failed-attempt counter. Holds no state.
pub struct AttemptLimiter;

impl AttemptLimiter {
    pub fn evaluate(failed_attempts: i32, max_attempts: i32) -> AttemptDecision {
        let remaining = max_attempts - failed_attempts;
        if remaining <= 0 {
            AttemptDecision::Lock
        } else if remaining == 1 {
            AttemptDecision::WarnNearLimit { remaining }
        } else {
            AttemptDecision::Allow { remaining }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_five_attempt_progression() {
        assert_eq!(AttemptLimiter::evaluate(0, 5), AttemptDecision::Allow { remaining: 5 });
        assert_eq!(AttemptLimiter::evaluate(3, 5), AttemptDecision::Allow { remaining: 2 });
        assert_eq!(
            AttemptLimiter::evaluate(4, 5),
            AttemptDecision::WarnNearLimit { remaining: 1 }
        );
        assert_eq!(AttemptLimiter::evaluate(5, 5), AttemptDecision::Lock);
    }

    #[test]
    fn test_over_limit_still_locks() {
        assert!(AttemptLimiter::evaluate(9, 5).is_lock());
        assert_eq!(AttemptLimiter::evaluate(9, 5).remaining(), 0);
    }

    #[test]
    fn test_single_attempt_code() {
        assert_eq!(
            AttemptLimiter::evaluate(0, 1),
            AttemptDecision::WarnNearLimit { remaining: 1 }
        );
        assert!(AttemptLimiter::evaluate(1, 1).is_lock());
    }
}
