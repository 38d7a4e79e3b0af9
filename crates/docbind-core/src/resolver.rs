//! Conflict resolution strategies.

use crate::document::Document;
use crate::merge::merge;

/// Computes the reconciled document for a conflict pair.
///
/// `yours` is the local candidate, `theirs` the divergent stored version.
/// Only the returned fields are used; reserved metadata is stripped by the caller.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, yours: &Document, theirs: &Document) -> Document;
}

/// Deep merge with `theirs` as base, so `yours` wins scalar collisions.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeepMergeResolver;

impl ConflictResolver for DeepMergeResolver {
    fn resolve(&self, yours: &Document, theirs: &Document) -> Document {
        let mut resolved = yours.clone();
        resolved.fields = merge(&theirs.data(), &yours.data());
        resolved
    }
}

/// Keep the local candidate as is.
#[derive(Clone, Copy, Debug, Default)]
pub struct PreferYours;

impl ConflictResolver for PreferYours {
    fn resolve(&self, yours: &Document, _theirs: &Document) -> Document {
        yours.clone()
    }
}

/// Keep the stored version as is.
#[derive(Clone, Copy, Debug, Default)]
pub struct PreferTheirs;

impl ConflictResolver for PreferTheirs {
    fn resolve(&self, _yours: &Document, theirs: &Document) -> Document {
        theirs.clone()
    }
}

impl<F> ConflictResolver for F
where
    F: Fn(&Document, &Document) -> Document + Send + Sync,
{
    fn resolve(&self, yours: &Document, theirs: &Document) -> Document {
        self(yours, theirs)
    }
}
