//! Aggregate result of an apply or destroy run.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ResourceError;
use crate::model::Direction;

/// Final status of one resource in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Ready,
    CreateFailed,
    Destroyed,
    DestroyFailed,
    /// Never attempted; see [`SkipReason`].
    Skipped,
    /// Cancelled while in flight. The persisted record lets the next run
    /// resume it.
    Interrupted,
}

impl OutcomeStatus {
    pub fn is_success(self) -> bool {
        matches!(self, OutcomeStatus::Ready | OutcomeStatus::Destroyed)
    }

    pub fn is_failure(self) -> bool {
        matches!(self, OutcomeStatus::CreateFailed | OutcomeStatus::DestroyFailed)
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutcomeStatus::Ready => "ready",
            OutcomeStatus::CreateFailed => "create_failed",
            OutcomeStatus::Destroyed => "destroyed",
            OutcomeStatus::DestroyFailed => "destroy_failed",
            OutcomeStatus::Skipped => "skipped",
            OutcomeStatus::Interrupted => "interrupted",
        })
    }
}

/// Why a resource was never attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// A prerequisite failed (directly or further upstream).
    DependencyFailed { dependency: String },
    Cancelled,
    /// Dispatch stopped after a state store write failed or an orphan could
    /// not be destroyed.
    Halted,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::DependencyFailed { dependency } => {
                write!(f, "dependency {dependency} failed")
            }
            SkipReason::Cancelled => f.write_str("run cancelled"),
            SkipReason::Halted => f.write_str("run halted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceOutcome {
    pub id: String,
    pub kind: String,
    pub status: OutcomeStatus,
    /// Provider create/destroy attempts made this run.
    pub attempts: u32,
    /// Whether a create or destroy call was issued this run.
    pub changed: bool,
    /// Planned batch; `None` for orphans.
    pub batch: Option<usize>,
    pub sequence: Option<u64>,
    /// Tracked in state but no longer declared.
    #[serde(default)]
    pub orphan: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResourceError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
}

impl ResourceOutcome {
    pub(crate) fn new(
        id: impl Into<String>,
        kind: impl Into<String>,
        status: OutcomeStatus,
    ) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            status,
            attempts: 0,
            changed: false,
            batch: None,
            sequence: None,
            orphan: false,
            error: None,
            skip_reason: None,
        }
    }
}

/// Every resource's final status for one run, including the ones never
/// attempted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub direction: Direction,
    pub outcomes: Vec<ResourceOutcome>,
    pub duration_ms: u64,
}

impl RunResult {
    /// True iff every resource ended Ready (apply) or Destroyed (destroy).
    pub fn success(&self) -> bool {
        let expected = match self.direction {
            Direction::Create => OutcomeStatus::Ready,
            Direction::Destroy => OutcomeStatus::Destroyed,
        };
        self.outcomes.iter().all(|o| o.status == expected)
    }

    /// Process exit code: 0 on success, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.success() {
            0
        } else {
            1
        }
    }

    pub fn outcome(&self, id: &str) -> Option<&ResourceOutcome> {
        self.outcomes.iter().find(|o| o.id == id)
    }

    pub fn count(&self, status: OutcomeStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ResourceOutcome> {
        self.outcomes.iter().filter(|o| o.status.is_failure())
    }
}
