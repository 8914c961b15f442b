use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Extracted,
    Summarizing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        Self::Queued,
        Self::Processing,
        Self::Extracted,
        Self::Summarizing,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Extracted => "extracted",
            Self::Summarizing => "summarizing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Processing => 1,
            Self::Extracted => 2,
            Self::Summarizing => 3,
            Self::Completed | Self::Failed | Self::Cancelled => 4,
        }
    }

    /// Status only moves forward along the pipeline.
    ///
    /// Re-asserting the current status is always allowed so redelivered
    /// updates stay harmless. Terminal states admit nothing else.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if *self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        next.is_terminal() || next.rank() > self.rank()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown job status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_owned()))
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn forward_moves_are_allowed() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Extracted));
        assert!(Extracted.can_transition_to(Summarizing));
        assert!(Summarizing.can_transition_to(Completed));
        assert!(Queued.can_transition_to(Summarizing));
    }

    #[test]
    fn any_non_terminal_state_may_fail_or_cancel() {
        for status in JobStatus::ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert!(status.can_transition_to(JobStatus::Failed));
            assert!(status.can_transition_to(JobStatus::Cancelled));
            assert!(status.can_transition_to(JobStatus::Completed));
        }
    }

    #[test]
    fn backwards_moves_are_rejected() {
        use JobStatus::*;
        assert!(!Extracted.can_transition_to(Processing));
        assert!(!Summarizing.can_transition_to(Extracted));
        assert!(!Processing.can_transition_to(Queued));
    }

    #[test]
    fn terminal_states_only_reassert_themselves() {
        for from in JobStatus::ALL.into_iter().filter(JobStatus::is_terminal) {
            for to in JobStatus::ALL {
                assert_eq!(from.can_transition_to(to), from == to, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn parses_wire_names() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse(), Ok(status));
        }
        assert_eq!(
            "done".parse::<JobStatus>(),
            Err(UnknownStatus("done".to_owned()))
        );
    }
}
