use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Which subset of the project a run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scope {
    Full,
    DbOnly,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Full => "full",
            Scope::DbOnly => "db-only",
        }
    }

    /// Token embedded in archive names.
    pub fn tag(self) -> &'static str {
        match self {
            Scope::Full => "full",
            Scope::DbOnly => "db",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Scope> {
        match tag {
            "full" => Some(Scope::Full),
            "db" => Some(Scope::DbOnly),
            _ => None,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Scope {
    type Err = crate::error::BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Scope::Full),
            "db-only" | "db" => Ok(Scope::DbOnly),
            _ => Err(crate::error::BackupError::InvalidConfig(format!(
                "unknown scope: {s}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// RunMode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    Full,
    DbOnly,
    DryRun,
}

impl RunMode {
    pub fn new(scope: Scope, dry_run: bool) -> Self {
        match (scope, dry_run) {
            (_, true) => RunMode::DryRun,
            (Scope::Full, false) => RunMode::Full,
            (Scope::DbOnly, false) => RunMode::DbOnly,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Full => "full",
            RunMode::DbOnly => "db-only",
            RunMode::DryRun => "dry-run",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RunPhase
// ---------------------------------------------------------------------------

/// Per-run state machine. Phases only move forward, or to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Staging,
    Validated,
    Uploaded,
    Pruned,
    Done,
    Failed,
}

impl RunPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            RunPhase::Idle => "idle",
            RunPhase::Staging => "staging",
            RunPhase::Validated => "validated",
            RunPhase::Uploaded => "uploaded",
            RunPhase::Pruned => "pruned",
            RunPhase::Done => "done",
            RunPhase::Failed => "failed",
        }
    }

    pub fn next(self) -> Option<RunPhase> {
        match self {
            RunPhase::Idle => Some(RunPhase::Staging),
            RunPhase::Staging => Some(RunPhase::Validated),
            RunPhase::Validated => Some(RunPhase::Uploaded),
            RunPhase::Uploaded => Some(RunPhase::Pruned),
            RunPhase::Pruned => Some(RunPhase::Done),
            RunPhase::Done | RunPhase::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Done | RunPhase::Failed)
    }

    pub fn can_transition_to(self, to: RunPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == RunPhase::Failed || self.next() == Some(to)
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// Completed, but with non-fatal warnings (e.g. a prune deletion failed).
    Partial,
    Failure,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Partial => "partial",
            Outcome::Failure => "failure",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_chain_is_linear() {
        let mut phase = RunPhase::Idle;
        let mut seen = vec![phase];
        while let Some(next) = phase.next() {
            assert!(phase.can_transition_to(next));
            phase = next;
            seen.push(phase);
        }
        assert_eq!(
            seen,
            vec![
                RunPhase::Idle,
                RunPhase::Staging,
                RunPhase::Validated,
                RunPhase::Uploaded,
                RunPhase::Pruned,
                RunPhase::Done,
            ]
        );
    }

    #[test]
    fn phases_cannot_skip_or_go_back() {
        assert!(!RunPhase::Idle.can_transition_to(RunPhase::Uploaded));
        assert!(!RunPhase::Uploaded.can_transition_to(RunPhase::Staging));
        assert!(!RunPhase::Done.can_transition_to(RunPhase::Failed));
        assert!(RunPhase::Staging.can_transition_to(RunPhase::Failed));
    }

    #[test]
    fn scope_parses_cli_and_tag_forms() {
        assert_eq!("full".parse::<Scope>().unwrap(), Scope::Full);
        assert_eq!("db-only".parse::<Scope>().unwrap(), Scope::DbOnly);
        assert_eq!("db".parse::<Scope>().unwrap(), Scope::DbOnly);
        assert!("everything".parse::<Scope>().is_err());
        assert_eq!(Scope::from_tag("db"), Some(Scope::DbOnly));
    }

    #[test]
    fn run_mode_prefers_dry_run() {
        assert_eq!(RunMode::new(Scope::DbOnly, true), RunMode::DryRun);
        assert_eq!(RunMode::new(Scope::DbOnly, false), RunMode::DbOnly);
        assert_eq!(RunMode::new(Scope::Full, false).as_str(), "full");
    }
}
