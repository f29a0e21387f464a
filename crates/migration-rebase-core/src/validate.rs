//! Post-rewrite checks. Everything here re-reads the script files; the plan
//! only says what to expect.

use crate::{chain_of, RebaseError, RebasePlan, RevisionId, ScriptDirectory};

/// Check that `revision` still parses into a complete script.
///
/// # Errors
/// Returns [`RebaseError::IntegrityViolation`] when the script is missing,
/// unparseable, records another revision, or lacks a parent field or either
/// operation body.
pub fn validate_script_structure(
    scripts: &ScriptDirectory,
    revision: &RevisionId,
) -> Result<(), RebaseError> {
    let violation = |reason: String| RebaseError::IntegrityViolation {
        revision: revision.clone(),
        reason,
    };

    let handle =
        scripts.locate(revision)?.ok_or_else(|| violation("script file not found".to_string()))?;
    let document = match scripts.parse(&handle) {
        Ok(document) => document,
        Err(RebaseError::MalformedScript { reason, .. }) => return Err(violation(reason)),
        Err(err) => return Err(err),
    };

    if document.revision() != revision {
        return Err(violation(format!("script records revision {}", document.revision())));
    }
    if !document.has_parent_field() {
        return Err(violation("missing `-- down_revision:` header".to_string()));
    }
    if document.upgrade_body().is_none() {
        return Err(violation("missing `-- migrate:up` section".to_string()));
    }
    if document.downgrade_body().is_none() {
        return Err(violation("missing `-- migrate:down` section".to_string()));
    }
    Ok(())
}

/// Check that the relocated scripts form one contiguous run on top of the
/// target lineage.
///
/// The expected parent of the first relocated script is re-derived from the
/// target head's current chain rather than taken from the plan.
///
/// # Errors
/// Returns [`RebaseError::ChainBroken`] naming the first revision whose
/// recorded parent differs from the expected one.
pub fn validate_chain_linkage(
    scripts: &ScriptDirectory,
    plan: &RebasePlan,
) -> Result<(), RebaseError> {
    let target_chain = chain_of(scripts, &plan.target_head)?;
    let Some(tip) = target_chain.last().cloned() else {
        return Err(RebaseError::RevisionNotFound { revision: plan.target_head.clone() });
    };
    if tip != plan.target_tip {
        return Err(RebaseError::IntegrityViolation {
            revision: plan.target_head.clone(),
            reason: format!("target lineage now ends at {tip}, planned {}", plan.target_tip),
        });
    }

    let mut expected = tip;
    for revision in &plan.rebase_set {
        let (_, document) = scripts.load(revision)?;
        let actual = document.parent().cloned();
        if actual.as_ref() != Some(&expected) {
            return Err(RebaseError::ChainBroken { revision: revision.clone(), actual, expected });
        }
        expected = revision.clone();
    }
    Ok(())
}

/// Check that the rewritten history is one straight line ending at the new
/// head, with no other script branching off it and no script left behind as a
/// new head.
///
/// # Errors
/// Returns [`RebaseError::IntegrityViolation`] when the new head's chain does
/// not equal the target chain followed by the rebase set, when any revision
/// on the relocated lineage has an unexpected child, or when the forest heads
/// differ from the planned ones.
pub fn validate_single_head(
    scripts: &ScriptDirectory,
    plan: &RebasePlan,
) -> Result<(), RebaseError> {
    let new_head = plan.new_head();
    let expected_chain =
        plan.target_chain.iter().chain(&plan.rebase_set).cloned().collect::<Vec<_>>();
    let actual_chain = chain_of(scripts, new_head)?;
    if actual_chain != expected_chain {
        return Err(RebaseError::IntegrityViolation {
            revision: new_head.clone(),
            reason: format!(
                "rewritten chain [{}] does not match planned history [{}]",
                join(&actual_chain),
                join(&expected_chain)
            ),
        });
    }

    let lineage = std::iter::once(&plan.target_tip).chain(&plan.rebase_set).collect::<Vec<_>>();
    for (position, revision) in lineage.iter().enumerate() {
        let expected_children = lineage.get(position + 1).map(|next| vec![(*next).clone()]);
        let children = scripts.children(revision)?;
        if children != expected_children.unwrap_or_default() {
            return Err(RebaseError::IntegrityViolation {
                revision: (*revision).clone(),
                reason: format!(
                    "history is not single-headed: children are [{}]",
                    join(&children)
                ),
            });
        }
    }

    let expected_heads = plan.expected_heads();
    let heads = scripts.heads()?;
    if let Some(stray) = heads.iter().find(|head| !expected_heads.contains(head)) {
        return Err(RebaseError::IntegrityViolation {
            revision: stray.clone(),
            reason: format!(
                "rewrite left a new head; heads are [{}], expected [{}]",
                join(&heads),
                join(&expected_heads)
            ),
        });
    }
    if heads != expected_heads {
        return Err(RebaseError::IntegrityViolation {
            revision: new_head.clone(),
            reason: format!(
                "history heads are [{}], expected [{}]",
                join(&heads),
                join(&expected_heads)
            ),
        });
    }
    Ok(())
}

/// Run every check against the rewritten files.
///
/// # Errors
/// Returns the first failing check's error.
pub fn validate_rewrite(scripts: &ScriptDirectory, plan: &RebasePlan) -> Result<(), RebaseError> {
    for revision in &plan.rebase_set {
        validate_script_structure(scripts, revision)?;
    }
    validate_chain_linkage(scripts, plan)?;
    validate_single_head(scripts, plan)
}

fn join(revisions: &[RevisionId]) -> String {
    revisions.iter().map(RevisionId::as_str).collect::<Vec<_>>().join(", ")
}
