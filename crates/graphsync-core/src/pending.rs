//! The pending-apply set.
//!
//! Node IDs currently being written by a remote update. An ID is held only
//! for the lifetime of a [`PendingGuard`], which releases it on drop, so the
//! set is cleared on every exit path of the guarded mutation.

use crate::key::NodeId;
use std::collections::HashSet;
use std::ops::Deref;

/// Node IDs whose local mutation originates from a remote change.
#[derive(Debug, Default)]
pub struct PendingApply {
    ids: HashSet<NodeId>,
}

impl PendingApply {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `id` as being applied until the returned guard is dropped.
    pub fn enter(&mut self, id: NodeId) -> PendingGuard<'_> {
        self.ids.insert(id);
        PendingGuard { set: self, id }
    }

    /// Whether `id` is currently being applied.
    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.ids.contains(&id)
    }

    /// Whether no apply is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Holds one node ID in a [`PendingApply`] set.
#[derive(Debug)]
pub struct PendingGuard<'a> {
    set: &'a mut PendingApply,
    id: NodeId,
}

impl Deref for PendingGuard<'_> {
    type Target = PendingApply;

    fn deref(&self) -> &PendingApply {
        self.set
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.set.ids.remove(&self.id);
    }
}
