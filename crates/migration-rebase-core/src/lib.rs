//! Linearize two diverged histories of schema-migration scripts.
//!
//! Scripts form a forest through their recorded parent revisions. A rebase
//! relocates the scripts of one branch on top of another branch's head by
//! rewriting only their parent links, then drives a [`MigrationEngine`] to
//! move the store through the new, single-headed history.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

mod graph;
mod plan;
mod rebase;
mod repository;
mod script;
mod validate;

pub use graph::{chain_of, common_ancestor};
pub use plan::{plan_rebase, RebasePlan, Relink};
pub use rebase::{
    Direction, EngineError, MigrationEngine, RebaseContext, RebasePhase, RebaseReport, Rebaser,
};
pub use repository::{ScriptDirectory, ScriptHandle, SCRIPT_EXTENSION};
pub use script::ScriptDocument;
pub use validate::{
    validate_chain_linkage, validate_rewrite, validate_script_structure, validate_single_head,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RebaseError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("revision {revision} not found in script directory")]
    RevisionNotFound { revision: RevisionId },
    #[error("cyclic history: revision {revision} was visited twice while following parents")]
    CyclicHistory { revision: RevisionId },
    #[error("no common ancestor between {left} and {right}")]
    NoCommonAncestor { left: RevisionId, right: RevisionId },
    #[error("common ancestor {ancestor} is not part of the chain of {head}")]
    AncestorNotInChain { ancestor: RevisionId, head: RevisionId },
    #[error("nothing to rebase: {0}")]
    NothingToRebase(String),
    #[error("malformed script {}: {reason}", .path.display())]
    MalformedScript { path: PathBuf, reason: String },
    #[error("integrity violation in {revision}: {reason}")]
    IntegrityViolation { revision: RevisionId, reason: String },
    #[error(
        "chain broken: {revision} records parent {}, expected {expected}",
        display_parent(.actual.as_ref())
    )]
    ChainBroken { revision: RevisionId, actual: Option<RevisionId>, expected: RevisionId },
    #[error(
        "migration engine failed during {phase} at {revision}: {source}; last known heads: [{}]",
        join_revisions(.last_known_heads)
    )]
    Engine {
        phase: RebasePhase,
        revision: RevisionId,
        last_known_heads: Vec<RevisionId>,
        source: EngineError,
    },
    #[error(
        "rewriting failed with the store downgraded to {ancestor}; relinked so far: [{}]: {source}",
        join_revisions(.relinked)
    )]
    Rewrite { ancestor: RevisionId, relinked: Vec<RevisionId>, source: Box<RebaseError> },
    #[error("i/o error on {}: {message}", .path.display())]
    Io { path: PathBuf, message: String },
}

impl RebaseError {
    /// Whether the store may have been left between revisions.
    ///
    /// Errors raised before the downgrade, or while rewriting files, leave the
    /// store untouched beyond the downgrade and can be retried once inputs are
    /// fixed. Engine failures during downgrade or apply need operator action.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Engine { phase: RebasePhase::Downgrading | RebasePhase::Applying, .. }
        )
    }

    pub(crate) fn io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        Self::Io { path: path.into(), message: err.to_string() }
    }

    pub(crate) fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::MalformedScript { path: path.into(), reason: reason.into() }
    }
}

fn display_parent(parent: Option<&RevisionId>) -> String {
    parent.map_or_else(|| "<none>".to_string(), ToString::to_string)
}

fn join_revisions(revisions: &[RevisionId]) -> String {
    revisions.iter().map(RevisionId::as_str).collect::<Vec<_>>().join(", ")
}

/// Opaque, immutable identifier of one migration script.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct RevisionId(String);

impl RevisionId {
    /// Accepts non-empty tokens made of ASCII alphanumerics, `_`, `-` and `.`.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        if value.is_empty()
            || !value.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return None;
        }
        Some(Self(value.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RevisionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RevisionId {
    type Err = RebaseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
            .ok_or_else(|| RebaseError::Validation(format!("invalid revision id `{value}`")))
    }
}

impl TryFrom<String> for RevisionId {
    type Error = RebaseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RevisionId> for String {
    fn from(value: RevisionId) -> Self {
        value.0
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::rev;

    #[test]
    fn revision_ids_reject_whitespace_and_empty_tokens() {
        assert!(RevisionId::parse("").is_none());
        assert!(RevisionId::parse("ab cd").is_none());
        assert!(RevisionId::parse("'quoted'").is_none());
        assert_eq!(
            RevisionId::parse("1b7e0a44_x.v2-a").map(String::from).as_deref(),
            Some("1b7e0a44_x.v2-a")
        );
    }

    #[test]
    fn only_store_side_engine_errors_are_fatal() {
        let engine = |phase| RebaseError::Engine {
            phase,
            revision: rev("p4"),
            last_known_heads: vec![rev("a2"), rev("b2")],
            source: EngineError::new("disk I/O error"),
        };
        assert!(engine(RebasePhase::Downgrading).is_fatal());
        assert!(engine(RebasePhase::Applying).is_fatal());
        assert!(!engine(RebasePhase::Validating).is_fatal());
        assert!(!RebaseError::ChainBroken {
            revision: rev("b2"),
            actual: None,
            expected: rev("b1")
        }
        .is_fatal());
    }

    #[test]
    fn engine_error_message_names_phase_and_last_known_heads() {
        let err = RebaseError::Engine {
            phase: RebasePhase::Applying,
            revision: rev("b1"),
            last_known_heads: vec![rev("a2")],
            source: EngineError::new("no such table: t_b1"),
        };
        assert_eq!(
            err.to_string(),
            "migration engine failed during applying at b1: no such table: t_b1; last known heads: [a2]"
        );
    }

    #[test]
    fn rewrite_failures_name_the_store_position() {
        let err = RebaseError::Rewrite {
            ancestor: rev("p4"),
            relinked: vec![rev("b1")],
            source: Box::new(RebaseError::ChainBroken {
                revision: rev("b2"),
                actual: Some(rev("a1")),
                expected: rev("b1"),
            }),
        };
        assert!(!err.is_fatal());
        assert_eq!(
            err.to_string(),
            "rewriting failed with the store downgraded to p4; relinked so far: [b1]: \
             chain broken: b2 records parent a1, expected b1"
        );
    }

    #[test]
    fn chain_broken_message_renders_missing_parent() {
        let err =
            RebaseError::ChainBroken { revision: rev("b1"), actual: None, expected: rev("a2") };
        assert_eq!(err.to_string(), "chain broken: b1 records parent <none>, expected a2");
    }
}
