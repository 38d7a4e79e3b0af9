//! Revision trees.
//!
//! Every write appends a child revision to a parent. Concurrent writes on
//! different replicas produce sibling branches; after replication a document
//! has several leaves. The winner is the greatest live leaf, the remaining
//! live leaves are its conflicts.

use docbind_core::{Document, DocumentId, Fields, Revision};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

/// One revision of a document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RevisionNode {
    pub parent: Option<Revision>,
    pub fields: Fields,
    pub deleted: bool,
}

/// Compute the token of a child revision.
///
/// Identical edits on the same parent produce the same token on every replica.
pub fn derive_revision(parent: Option<&Revision>, fields: &Fields, deleted: bool) -> Revision {
    let generation = parent.map(|p| p.generation() + 1).unwrap_or(1);

    let mut hasher = Sha256::new();
    if let Some(parent) = parent {
        hasher.update(parent.as_str().as_bytes());
    }
    hasher.update([deleted as u8]);
    hasher.update(serde_json::to_vec(fields).unwrap_or_default());
    let digest = hasher.finalize();

    let hex: String = digest[..16].iter().map(|b| format!("{:02x}", b)).collect();
    Revision::new(generation, hex)
}

/// All known revisions of a single document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RevisionTree {
    nodes: HashMap<Revision, RevisionNode>,
}

impl RevisionTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, rev: &Revision) -> bool {
        self.nodes.contains_key(rev)
    }

    pub fn get(&self, rev: &Revision) -> Option<&RevisionNode> {
        self.nodes.get(rev)
    }

    /// Revisions without children, greatest first.
    pub fn leaves(&self) -> Vec<Revision> {
        let parents: HashSet<&Revision> =
            self.nodes.values().filter_map(|n| n.parent.as_ref()).collect();
        let mut leaves: Vec<Revision> = self
            .nodes
            .keys()
            .filter(|rev| !parents.contains(rev))
            .cloned()
            .collect();
        leaves.sort_by(|a, b| b.cmp(a));
        leaves
    }

    /// The greatest live leaf, or the greatest leaf when every branch is deleted.
    pub fn winner(&self) -> Option<Revision> {
        let leaves = self.leaves();
        leaves
            .iter()
            .find(|rev| self.nodes.get(*rev).map(|n| !n.deleted).unwrap_or(false))
            .or_else(|| leaves.first())
            .cloned()
    }

    /// Live leaves other than the winner, greatest first.
    pub fn conflicts(&self) -> Vec<Revision> {
        let winner = self.winner();
        self.leaves()
            .into_iter()
            .filter(|rev| Some(rev) != winner.as_ref())
            .filter(|rev| self.nodes.get(rev).map(|n| !n.deleted).unwrap_or(false))
            .collect()
    }

    /// True when the tree is empty or its winner is a deletion.
    pub fn is_deleted(&self) -> bool {
        match self.winner() {
            Some(rev) => self.nodes.get(&rev).map(|n| n.deleted).unwrap_or(true),
            None => true,
        }
    }

    /// Append a child of `parent` and return its revision.
    pub fn extend(&mut self, parent: Option<&Revision>, fields: Fields, deleted: bool) -> Revision {
        let rev = derive_revision(parent, &fields, deleted);
        self.nodes.insert(
            rev.clone(),
            RevisionNode {
                parent: parent.cloned(),
                fields,
                deleted,
            },
        );
        rev
    }

    /// Insert a revision produced elsewhere. Returns false if it was already known.
    pub fn insert(&mut self, rev: Revision, node: RevisionNode) -> bool {
        if self.nodes.contains_key(&rev) {
            return false;
        }
        self.nodes.insert(rev, node);
        true
    }

    /// Every revision, parents before children.
    pub fn revisions(&self) -> Vec<(Revision, RevisionNode)> {
        let mut all: Vec<(Revision, RevisionNode)> =
            self.nodes.iter().map(|(r, n)| (r.clone(), n.clone())).collect();
        all.sort_by(|(a, _), (b, _)| a.generation().cmp(&b.generation()).then_with(|| a.cmp(b)));
        all
    }

    /// A specific revision as a document.
    pub fn document_at(&self, id: &DocumentId, rev: &Revision) -> Option<Document> {
        self.nodes.get(rev).map(|node| Document {
            id: id.clone(),
            rev: Some(rev.clone()),
            deleted: node.deleted,
            conflicts: Vec::new(),
            fields: node.fields.clone(),
        })
    }

    /// The winning revision as a document.
    pub fn current(&self, id: &DocumentId, include_conflicts: bool) -> Option<Document> {
        let winner = self.winner()?;
        let mut doc = self.document_at(id, &winner)?;
        if include_conflicts {
            doc.conflicts = self.conflicts();
        }
        Some(doc)
    }
}
