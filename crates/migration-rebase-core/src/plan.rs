use serde::{Deserialize, Serialize};

use crate::{chain_of, common_ancestor, RebaseError, RevisionId, ScriptDirectory};

/// One planned parent rewrite.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Relink {
    pub revision: RevisionId,
    pub new_parent: RevisionId,
}

/// Everything a rebase will do to the script files, computed before any of
/// them is touched.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RebasePlan {
    pub target_head: RevisionId,
    pub base_head: RevisionId,
    pub ancestor: RevisionId,
    pub target_tip: RevisionId,
    pub target_chain: Vec<RevisionId>,
    pub rebase_set: Vec<RevisionId>,
    pub links: Vec<Relink>,
    /// Leaves of the script forest before any file is rewritten.
    pub forest_heads: Vec<RevisionId>,
}

impl RebasePlan {
    /// The single head left once the plan is applied.
    #[must_use]
    pub fn new_head(&self) -> &RevisionId {
        self.rebase_set.last().unwrap_or(&self.target_head)
    }

    /// Forest heads once the plan is applied: the target head stops being a
    /// leaf, every other head stays.
    #[must_use]
    pub fn expected_heads(&self) -> Vec<RevisionId> {
        self.forest_heads.iter().filter(|head| **head != self.target_head).cloned().collect()
    }

    /// Planned parent of `revision`, if it is relocated.
    #[must_use]
    pub fn planned_parent(&self, revision: &RevisionId) -> Option<&RevisionId> {
        self.links.iter().find(|link| &link.revision == revision).map(|link| &link.new_parent)
    }
}

/// Plan the relocation of `base_head`'s branch on top of `target_head`.
///
/// # Errors
/// Returns [`RebaseError::NoCommonAncestor`] for unrelated histories,
/// [`RebaseError::AncestorNotInChain`] if the ancestor is missing from the
/// base chain, [`RebaseError::NothingToRebase`] when either head already
/// descends from the other, and any error of [`chain_of`].
pub fn plan_rebase(
    scripts: &ScriptDirectory,
    target_head: &RevisionId,
    base_head: &RevisionId,
) -> Result<RebasePlan, RebaseError> {
    let ancestor = common_ancestor(scripts, target_head, base_head)?.ok_or_else(|| {
        RebaseError::NoCommonAncestor { left: target_head.clone(), right: base_head.clone() }
    })?;

    let base_chain = chain_of(scripts, base_head)?;
    let Some(index) = base_chain.iter().position(|revision| revision == &ancestor) else {
        return Err(RebaseError::AncestorNotInChain { ancestor, head: base_head.clone() });
    };
    let rebase_set = base_chain[index + 1..].to_vec();
    if rebase_set.is_empty() {
        return Err(RebaseError::NothingToRebase(format!(
            "{base_head} is already an ancestor of {target_head}"
        )));
    }

    let target_chain = chain_of(scripts, target_head)?;
    if target_chain.last() == Some(&ancestor) {
        return Err(RebaseError::NothingToRebase(format!(
            "{target_head} is already an ancestor of {base_head}; history is linear"
        )));
    }
    let Some(target_tip) =
        target_chain.iter().rev().find(|revision| **revision != ancestor).cloned()
    else {
        return Err(RebaseError::NothingToRebase(format!(
            "no revisions of {target_head} follow the common ancestor {ancestor}"
        )));
    };

    let links = link_rebase_set(&target_tip, &rebase_set);
    let forest_heads = scripts.heads()?;
    Ok(RebasePlan {
        target_head: target_head.clone(),
        base_head: base_head.clone(),
        ancestor,
        target_tip,
        target_chain,
        rebase_set,
        links,
        forest_heads,
    })
}

/// First element hangs off `tip`; every later one off its predecessor.
pub(crate) fn link_rebase_set(tip: &RevisionId, rebase_set: &[RevisionId]) -> Vec<Relink> {
    rebase_set
        .iter()
        .enumerate()
        .map(|(index, revision)| Relink {
            revision: revision.clone(),
            new_parent: if index == 0 { tip.clone() } else { rebase_set[index - 1].clone() },
        })
        .collect()
}
