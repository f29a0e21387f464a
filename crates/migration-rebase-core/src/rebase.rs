use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::{plan_rebase, validate_rewrite, RebaseError, RebasePlan, RevisionId, ScriptDirectory};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Upgrade,
    Downgrade,
}

impl Direction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upgrade => "upgrade",
            Self::Downgrade => "downgrade",
        }
    }
}

/// Failure reported by a [`MigrationEngine`].
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("{message}")]
pub struct EngineError {
    message: String,
}

impl EngineError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// The store-side collaborator that physically applies and unapplies scripts.
pub trait MigrationEngine {
    /// Revisions currently recorded as heads of the store.
    ///
    /// # Errors
    /// Returns [`EngineError`] when the store cannot be read.
    fn current_heads(&mut self) -> Result<BTreeSet<RevisionId>, EngineError>;

    /// Move the store to `revision`, applying or unapplying scripts as needed.
    ///
    /// # Errors
    /// Returns [`EngineError`] when any script fails to run.
    fn move_to(&mut self, revision: &RevisionId, direction: Direction) -> Result<(), EngineError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RebasePhase {
    Validating,
    Downgrading,
    Rewriting,
    Applying,
    Done,
    Failed,
}

impl RebasePhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::Downgrading => "downgrading",
            Self::Rewriting => "rewriting",
            Self::Applying => "applying",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl Display for RebasePhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Explicit configuration handed to the orchestrator.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RebaseContext {
    pub scripts: ScriptDirectory,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RebaseReport {
    pub plan: RebasePlan,
    pub new_head: RevisionId,
    pub rewritten: Vec<RevisionId>,
    pub phases: Vec<RebasePhase>,
}

/// Four-phase rebase state machine.
///
/// `Validating -> Downgrading -> Rewriting -> Applying -> Done`, with `Failed`
/// reachable from every phase. The store is only touched in `Downgrading` and
/// `Applying`; the script files only in `Rewriting`.
pub struct Rebaser<'a, E: MigrationEngine> {
    context: RebaseContext,
    engine: &'a mut E,
    phase: RebasePhase,
    phases: Vec<RebasePhase>,
}

impl<'a, E: MigrationEngine> Rebaser<'a, E> {
    pub fn new(context: RebaseContext, engine: &'a mut E) -> Self {
        Self { context, engine, phase: RebasePhase::Validating, phases: Vec::new() }
    }

    #[must_use]
    pub fn phase(&self) -> RebasePhase {
        self.phase
    }

    /// Phases entered so far, in order.
    #[must_use]
    pub fn phases(&self) -> &[RebasePhase] {
        &self.phases
    }

    /// Run only the validating phase and return the plan. Nothing is mutated.
    ///
    /// # Errors
    /// Returns the validation or planning error that would abort a rebase.
    pub fn plan(
        &mut self,
        target_head: &RevisionId,
        base_head: &RevisionId,
    ) -> Result<RebasePlan, RebaseError> {
        self.enter(RebasePhase::Validating);
        self.validate(target_head, base_head).inspect_err(|err| self.fail(err))
    }

    /// Relocate `base_head`'s branch below `target_head` and bring the store
    /// to the new single head.
    ///
    /// # Errors
    /// Returns the error of the phase that failed. Engine failures during
    /// downgrade or apply are fatal, see [`RebaseError::is_fatal`].
    pub fn rebase(
        &mut self,
        target_head: &RevisionId,
        base_head: &RevisionId,
    ) -> Result<RebaseReport, RebaseError> {
        tracing::info!("Starting rebase: base_head={base_head}, target_head={target_head}");
        let result = self.run(target_head, base_head);
        match &result {
            Ok(report) => tracing::info!("Rebase completed; new head is {}", report.new_head),
            Err(err) => self.fail(err),
        }
        result
    }

    fn run(
        &mut self,
        target_head: &RevisionId,
        base_head: &RevisionId,
    ) -> Result<RebaseReport, RebaseError> {
        self.enter(RebasePhase::Validating);
        let plan = self.validate(target_head, base_head)?;
        tracing::info!("Common ancestor: {}", plan.ancestor);
        tracing::info!("Migrations to rebase: [{}]", join(&plan.rebase_set));

        self.enter(RebasePhase::Downgrading);
        self.move_store(&plan.ancestor, Direction::Downgrade)?;

        self.enter(RebasePhase::Rewriting);
        let rewritten = self.rewrite(&plan)?;

        self.enter(RebasePhase::Applying);
        self.move_store(&plan.target_head, Direction::Upgrade)?;
        for revision in &plan.rebase_set {
            self.move_store(revision, Direction::Upgrade)?;
        }

        self.enter(RebasePhase::Done);
        Ok(RebaseReport {
            new_head: plan.new_head().clone(),
            plan,
            rewritten,
            phases: self.phases.clone(),
        })
    }

    fn validate(
        &mut self,
        target_head: &RevisionId,
        base_head: &RevisionId,
    ) -> Result<RebasePlan, RebaseError> {
        if target_head == base_head {
            return Err(RebaseError::Validation(
                "top head and base head cannot be the same".to_string(),
            ));
        }

        let scripts = &self.context.scripts;
        for head in [target_head, base_head] {
            if scripts.locate(head)?.is_none() {
                return Err(RebaseError::RevisionNotFound { revision: head.clone() });
            }
        }

        let current_heads = self.engine.current_heads().map_err(|err| {
            RebaseError::Validation(format!("failed to read current heads: {err}"))
        })?;
        for (label, head) in [("top", target_head), ("base", base_head)] {
            if !current_heads.contains(head) {
                return Err(RebaseError::Validation(format!(
                    "{label} head '{head}' is not a current head. Current heads: [{}]",
                    current_heads.iter().map(RevisionId::as_str).collect::<Vec<_>>().join(", ")
                )));
            }
        }

        let script_heads = scripts.heads()?;
        for head in [target_head, base_head] {
            if !script_heads.contains(head) {
                let children = scripts.children(head)?;
                return Err(RebaseError::Validation(format!(
                    "{head} is not a head of the script history; it has children [{}]",
                    join(&children)
                )));
            }
        }

        plan_rebase(scripts, target_head, base_head)
    }

    /// Errors are wrapped in [`RebaseError::Rewrite`] since the store already
    /// sits at the common ancestor.
    fn rewrite(&self, plan: &RebasePlan) -> Result<Vec<RevisionId>, RebaseError> {
        tracing::info!("Updating migration file linkage for rebase");
        let mut rewritten = Vec::new();
        self.relink_and_validate(plan, &mut rewritten).map_err(|source| {
            RebaseError::Rewrite {
                ancestor: plan.ancestor.clone(),
                relinked: rewritten.clone(),
                source: Box::new(source),
            }
        })?;
        Ok(rewritten)
    }

    fn relink_and_validate(
        &self,
        plan: &RebasePlan,
        rewritten: &mut Vec<RevisionId>,
    ) -> Result<(), RebaseError> {
        let scripts = &self.context.scripts;
        for link in &plan.links {
            let (handle, _) = scripts.load(&link.revision)?;
            if scripts.relink(&handle, Some(&link.new_parent))? {
                rewritten.push(link.revision.clone());
            }
        }

        tracing::info!("Validating migration file integrity after rebase");
        validate_rewrite(scripts, plan)?;
        tracing::info!("Migration file integrity validation passed");
        Ok(())
    }

    fn move_store(
        &mut self,
        revision: &RevisionId,
        direction: Direction,
    ) -> Result<(), RebaseError> {
        tracing::info!("Moving store to {revision} ({})", direction.as_str());
        let Err(source) = self.engine.move_to(revision, direction) else {
            return Ok(());
        };

        let last_known_heads = match self.engine.current_heads() {
            Ok(heads) => heads.into_iter().collect(),
            Err(err) => {
                tracing::warn!("Could not read store heads after engine failure: {err}");
                Vec::new()
            }
        };
        Err(RebaseError::Engine {
            phase: self.phase,
            revision: revision.clone(),
            last_known_heads,
            source,
        })
    }

    fn enter(&mut self, phase: RebasePhase) {
        tracing::debug!("Entering phase {phase}");
        self.phase = phase;
        self.phases.push(phase);
    }

    fn fail(&mut self, err: &RebaseError) {
        let failed_in = self.phase;
        self.enter(RebasePhase::Failed);
        if err.is_fatal() {
            tracing::warn!("Rebase failed during {failed_in}; store needs manual recovery: {err}");
        } else {
            tracing::warn!("Rebase aborted during {failed_in}: {err}");
        }
    }
}

fn join(revisions: &[RevisionId]) -> String {
    revisions.iter().map(RevisionId::as_str).collect::<Vec<_>>().join(", ")
}
