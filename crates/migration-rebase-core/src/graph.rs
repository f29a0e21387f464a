use std::collections::HashSet;

use crate::{RebaseError, RevisionId, ScriptDirectory};

/// Build the oldest-first chain from a root to `revision`.
///
/// Only the first recorded parent is followed, so a merge point contributes a
/// single lineage.
///
/// # Errors
/// Returns [`RebaseError::RevisionNotFound`] when `revision` or any ancestor
/// has no script, and [`RebaseError::CyclicHistory`] when a revision is
/// reached twice.
pub fn chain_of(
    scripts: &ScriptDirectory,
    revision: &RevisionId,
) -> Result<Vec<RevisionId>, RebaseError> {
    let mut chain = Vec::new();
    let mut visited = HashSet::new();
    let mut cursor = Some(revision.clone());

    while let Some(current) = cursor {
        if !visited.insert(current.clone()) {
            return Err(RebaseError::CyclicHistory { revision: current });
        }
        let (_, document) = scripts.load(&current)?;
        cursor = document.parent().cloned();
        chain.push(current);
    }

    chain.reverse();
    Ok(chain)
}

/// Deepest revision shared by the chains of `left` and `right`.
///
/// Scans the chain of `right` from its root and keeps the last revision also
/// present in the chain of `left`. Returns `None` for unrelated histories.
///
/// # Errors
/// Returns any error of [`chain_of`] for either revision.
pub fn common_ancestor(
    scripts: &ScriptDirectory,
    left: &RevisionId,
    right: &RevisionId,
) -> Result<Option<RevisionId>, RebaseError> {
    let left_chain = chain_of(scripts, left)?.into_iter().collect::<HashSet<_>>();

    let mut ancestor = None;
    for revision in chain_of(scripts, right)? {
        if left_chain.contains(&revision) {
            ancestor = Some(revision);
        }
    }
    Ok(ancestor)
}
