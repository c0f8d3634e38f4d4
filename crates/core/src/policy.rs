//! Consensus policy for step decisions.

use serde::{Deserialize, Serialize};

/// Raw policy as supplied by callers; evaluated only after [`normalize`].
///
/// Field names stay snake_case on the wire, matching the policy blobs the
/// protocol has always carried.
///
/// [`normalize`]: ConsensusPolicy::normalize
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusPolicy {
    #[serde(default)]
    pub min_approvals: i64,
    #[serde(default)]
    pub quorum: i64,
    #[serde(default)]
    pub reject_threshold: i64,
}

impl Default for ConsensusPolicy {
    fn default() -> Self {
        Self {
            min_approvals: 1,
            quorum: 0,
            reject_threshold: 0,
        }
    }
}

/// Outcome of evaluating a policy against the current tally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyVerdict {
    Pending,
    Passed,
    Rejected,
}

impl ConsensusPolicy {
    /// Clamps the raw fields into their evaluable ranges.
    pub fn normalize(self) -> Self {
        Self {
            min_approvals: self.min_approvals.max(1),
            quorum: self.quorum.max(0),
            reject_threshold: self.reject_threshold.max(0),
        }
    }

    /// Evaluates a normalized policy. Rejection wins over approval.
    pub fn evaluate(&self, approves: i64, rejects: i64, total: i64) -> PolicyVerdict {
        if self.reject_threshold > 0 && rejects >= self.reject_threshold {
            return PolicyVerdict::Rejected;
        }
        if approves >= self.min_approvals && (self.quorum == 0 || total >= self.quorum) {
            return PolicyVerdict::Passed;
        }
        PolicyVerdict::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_clamps_fields() {
        let p = ConsensusPolicy {
            min_approvals: 0,
            quorum: -3,
            reject_threshold: -1,
        }
        .normalize();
        assert_eq!(p.min_approvals, 1);
        assert_eq!(p.quorum, 0);
        assert_eq!(p.reject_threshold, 0);
    }

    #[test]
    fn single_reject_trips_threshold() {
        // Scenario: {min_approvals: 2, reject_threshold: 1}.
        let p = ConsensusPolicy {
            min_approvals: 2,
            quorum: 0,
            reject_threshold: 1,
        }
        .normalize();
        assert_eq!(p.evaluate(0, 1, 1), PolicyVerdict::Rejected);
        assert_eq!(p.evaluate(1, 0, 1), PolicyVerdict::Pending);
        assert_eq!(p.evaluate(2, 0, 2), PolicyVerdict::Passed);
    }

    #[test]
    fn quorum_holds_back_approvals() {
        // Scenario: {min_approvals: 1, quorum: 3}.
        let p = ConsensusPolicy {
            min_approvals: 1,
            quorum: 3,
            reject_threshold: 0,
        }
        .normalize();
        assert_eq!(p.evaluate(2, 0, 2), PolicyVerdict::Pending);
        assert_eq!(p.evaluate(2, 1, 3), PolicyVerdict::Passed);
    }

    #[test]
    fn zero_reject_threshold_never_rejects() {
        let p = ConsensusPolicy::default().normalize();
        assert_eq!(p.evaluate(0, 5, 5), PolicyVerdict::Pending);
        assert_eq!(p.evaluate(1, 5, 6), PolicyVerdict::Passed);
    }
}
