//! Core types for stagehand

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a member whose items are extracted and downloaded
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(pub i64);

impl MemberId {
    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for MemberId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for MemberId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}

/// A member parsed from the member-data dump
///
/// Immutable once built; owns its pages in forward order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Member {
    /// Member identifier
    pub id: MemberId,
    /// Total number of items the member has
    pub total_items: u32,
    /// Pages derived from `total_items`, page 1 first
    pub pages: Vec<Page>,
}

impl Member {
    /// Number of pages derived for this member
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

/// One unit of work: a single page of a member
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Page {
    /// Owning member
    pub member: MemberId,
    /// Forward page number, starting at 1
    pub number: u32,
    /// Reverse file index (`page_count - number + 1`)
    pub file_index: u32,
}

impl Page {
    /// Logical identifier a worker uses in its handshake for this page
    pub fn identifier(&self) -> String {
        format!("{}_page{}", self.member, self.number)
    }
}

impl fmt::Display for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.p{} (page {})", self.member, self.file_index, self.number)
    }
}

/// Identifier of a brokered sub-work execution
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i32);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which optional phases are skipped for a run
///
/// Built once before the run starts and never changed afterwards.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseToggles {
    /// Skip copying and unarchiving existing archives
    pub skip_unarchive: bool,
    /// Skip the per-page extraction phase
    pub skip_extract: bool,
    /// Skip the download phase
    pub skip_download: bool,
    /// Skip the post-processing phase
    pub skip_postprocess: bool,
    /// Skip re-enumeration, archiving, copying and cleanup
    pub skip_rearchive: bool,
}

impl PhaseToggles {
    /// Toggles for a post-processing-only run (no extraction, no download)
    pub fn only_postprocess() -> Self {
        Self {
            skip_extract: true,
            skip_download: true,
            ..Self::default()
        }
    }
}

/// Result of one work item in a phase
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ItemOutcome {
    /// The external process ran and exited with code 0
    Succeeded,
    /// The item failed; siblings are unaffected
    Failed {
        /// Exit code, if the process ran at all
        exit_code: Option<i32>,
        /// Human-readable reason
        reason: String,
    },
}

impl ItemOutcome {
    /// Build an outcome from a process exit code
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            ItemOutcome::Succeeded
        } else {
            ItemOutcome::Failed {
                exit_code: Some(code),
                reason: format!("exited with code {code}"),
            }
        }
    }

    /// Returns true for [`ItemOutcome::Succeeded`]
    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Succeeded)
    }
}

/// Aggregated result of one phase
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PhaseReport {
    /// Phase name
    pub name: String,
    /// Number of items the phase fanned out
    pub total: usize,
    /// Items that succeeded
    pub succeeded: usize,
    /// Items that failed
    pub failed: usize,
}

impl PhaseReport {
    /// Summarise a list of item outcomes
    pub fn from_outcomes(name: impl Into<String>, outcomes: &[ItemOutcome]) -> Self {
        let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
        Self {
            name: name.into(),
            total: outcomes.len(),
            succeeded,
            failed: outcomes.len() - succeeded,
        }
    }

    /// True when nothing failed
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Summary of a complete pipeline run
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Number of members parsed from the dump
    pub members: usize,
    /// Total number of pages
    pub pages: usize,
    /// Total number of items across all members
    pub items: u64,
    /// Reports in execution order
    pub phases: Vec<PhaseReport>,
    /// Whether every archiving-related step succeeded (None if archiving did not run)
    pub archive_chain_ok: Option<bool>,
    /// Processed-item notifications received over the control plane
    pub processed_notifications: u64,
}

impl RunSummary {
    /// Look up a phase report by name
    pub fn phase(&self, name: &str) -> Option<&PhaseReport> {
        self.phases.iter().find(|p| p.name == name)
    }
}
