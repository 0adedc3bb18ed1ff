//! Per-document revision tree and winner selection.
//!
//! # Responsibility
//! - Hold every known revision of one document.
//! - Pick the winning leaf deterministically.
//!
//! # Invariants
//! - Inserting a revision already in the tree is a no-op.
//! - A node is a leaf iff no other node names it as parent.
//! - The winner is the leaf with the greatest `(depth, id)`; ids are unique
//!   so there are never ties.
//! - Losing leaves stay in the tree and are reported as conflicts.
//! - The result depends only on the set of inserted revisions, not the order:
//!   children may arrive before their parents.

use crate::model::revision::{Revision, RevisionId};
use std::collections::{BTreeMap, BTreeSet};

/// Revision forest of a single document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevisionTree {
    nodes: BTreeMap<RevisionId, Revision>,
}

impl RevisionTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a tree from any iterator of revisions.
    pub fn from_revisions(revisions: impl IntoIterator<Item = Revision>) -> Self {
        let mut tree = Self::new();
        for revision in revisions {
            tree.insert(revision);
        }
        tree
    }

    /// Inserts a revision. Returns `false` when it was already known.
    pub fn insert(&mut self, revision: Revision) -> bool {
        if self.nodes.contains_key(&revision.id) {
            return false;
        }
        self.nodes.insert(revision.id.clone(), revision);
        true
    }

    pub fn contains(&self, id: &RevisionId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn get(&self, id: &RevisionId) -> Option<&Revision> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Revision> {
        self.nodes.values()
    }

    /// Returns leaves sorted from winner to weakest.
    pub fn leaves(&self) -> Vec<&Revision> {
        let parents: BTreeSet<&RevisionId> = self
            .nodes
            .values()
            .filter_map(|revision| revision.parent.as_ref())
            .collect();

        let mut leaves: Vec<&Revision> = self
            .nodes
            .values()
            .filter(|revision| !parents.contains(&revision.id))
            .collect();
        leaves.sort_by(|a, b| b.winner_cmp(a));
        leaves
    }

    /// Deterministic winning revision, `None` only for an empty tree.
    pub fn winner(&self) -> Option<&Revision> {
        self.leaves().into_iter().next()
    }

    /// Losing leaves that are not tombstones.
    pub fn conflicts(&self) -> Vec<&Revision> {
        self.leaves()
            .into_iter()
            .skip(1)
            .filter(|revision| !revision.deleted)
            .collect()
    }

    /// Walks from `id` towards the root through known nodes.
    ///
    /// The first element is `id` itself when known. Stops at the first
    /// missing ancestor.
    pub fn ancestry(&self, id: &RevisionId) -> Vec<RevisionId> {
        let mut path = Vec::new();
        let mut cursor = self.nodes.get(id);
        while let Some(revision) = cursor {
            path.push(revision.id.clone());
            cursor = revision
                .parent
                .as_ref()
                .and_then(|parent| self.nodes.get(parent));
        }
        path
    }
}

#[cfg(test)]
mod tests {
    use super::RevisionTree;
    use crate::model::revision::Revision;
    use crate::model::site::SiteId;

    fn site(value: &str) -> SiteId {
        SiteId::new(value).expect("valid site id")
    }

    #[test]
    fn single_chain_winner_is_tail() {
        let root = Revision::next(None, &site("s1"), false, "a");
        let child = Revision::next(Some(&root.id), &site("s1"), false, "ab");
        let tree = RevisionTree::from_revisions([root.clone(), child.clone()]);

        assert_eq!(tree.winner().map(|rev| &rev.id), Some(&child.id));
        assert!(tree.conflicts().is_empty());
        assert_eq!(tree.ancestry(&child.id), vec![child.id.clone(), root.id]);
    }

    #[test]
    fn deeper_branch_beats_greater_id() {
        let root = Revision::next(None, &site("s1"), false, "a");
        let short = Revision::next(Some(&root.id), &site("s2"), false, "b");
        let long_1 = Revision::next(Some(&root.id), &site("s1"), false, "c");
        let long_2 = Revision::next(Some(&long_1.id), &site("s1"), false, "cd");
        let tree = RevisionTree::from_revisions([root, short.clone(), long_1, long_2.clone()]);

        assert_eq!(tree.winner().map(|rev| &rev.id), Some(&long_2.id));
        let conflicts: Vec<_> = tree.conflicts().into_iter().map(|rev| rev.id.clone()).collect();
        assert_eq!(conflicts, vec![short.id]);
    }

    #[test]
    fn equal_depth_prefers_greater_id() {
        let root = Revision::next(None, &site("s1"), false, "a");
        let left = Revision::next(Some(&root.id), &site("s1"), false, "left");
        let right = Revision::next(Some(&root.id), &site("s2"), false, "right");
        let expected = if left.id > right.id { &left.id } else { &right.id };

        let tree = RevisionTree::from_revisions([root, left.clone(), right.clone()]);
        assert_eq!(tree.winner().map(|rev| &rev.id), Some(expected));
    }

    #[test]
    fn duplicate_insert_is_noop() {
        let root = Revision::next(None, &site("s1"), false, "a");
        let mut tree = RevisionTree::new();
        assert!(tree.insert(root.clone()));
        assert!(!tree.insert(root));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn child_before_parent_still_resolves() {
        let root = Revision::next(None, &site("s1"), false, "a");
        let child = Revision::next(Some(&root.id), &site("s1"), false, "ab");

        let mut tree = RevisionTree::new();
        tree.insert(child.clone());
        tree.insert(root);
        assert_eq!(tree.leaves().len(), 1);
        assert_eq!(tree.winner().map(|rev| &rev.id), Some(&child.id));
    }

    #[test]
    fn deleted_losing_leaf_is_not_a_conflict() {
        let root = Revision::next(None, &site("s1"), false, "a");
        let tombstone = Revision::next(Some(&root.id), &site("s1"), true, "");
        let edit = Revision::next(Some(&root.id), &site("s2"), false, "b");
        let tree = RevisionTree::from_revisions([root, tombstone.clone(), edit.clone()]);

        let winner = tree.winner().expect("tree has a winner");
        let loser = if winner.id == edit.id { &tombstone } else { &edit };
        let conflicts = tree.conflicts();
        assert_eq!(conflicts.is_empty(), loser.deleted);
    }
}
