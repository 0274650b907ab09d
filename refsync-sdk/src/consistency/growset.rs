//! Grow-only set, used for deletion tombstones.
//!
//! There is no removal operation; merge is set union. The merge result also
//! reports what each side is missing so the caller can drive both stores to
//! the union.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GrowSet<T: Ord>(BTreeSet<T>);

/// `local_only` is what the local side has yet to learn (apply locally);
/// `remote_only` is what the remote side has yet to learn (push).
#[derive(Debug, Clone)]
pub struct GrowSetMerge<T: Ord> {
    pub resolved: GrowSet<T>,
    pub local_only: BTreeSet<T>,
    pub remote_only: BTreeSet<T>,
}

impl<T: Ord + Clone> GrowSet<T> {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn insert(&mut self, value: T) -> bool {
        self.0.insert(value)
    }

    pub fn contains(&self, value: &T) -> bool {
        self.0.contains(value)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.0.iter()
    }

    pub fn merge(local: &Self, remote: &Self) -> GrowSetMerge<T> {
        let resolved = GrowSet(local.0.union(&remote.0).cloned().collect());
        let local_only = remote.0.difference(&local.0).cloned().collect();
        let remote_only = local.0.difference(&remote.0).cloned().collect();
        GrowSetMerge { resolved, local_only, remote_only }
    }
}

impl<T: Ord + Clone> FromIterator<T> for GrowSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<T: Ord + Clone> Extend<T> for GrowSet<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        self.0.extend(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> GrowSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn merge_is_union_with_directions() {
        let local = set(&["a", "b"]);
        let remote = set(&["b", "c"]);
        let m = GrowSet::merge(&local, &remote);
        assert_eq!(m.resolved, set(&["a", "b", "c"]));
        assert_eq!(m.local_only, set(&["c"]).0);
        assert_eq!(m.remote_only, set(&["a"]).0);
    }

    #[test]
    fn idempotent() {
        let s = set(&["a", "b"]);
        let m = GrowSet::merge(&s, &s);
        assert_eq!(m.resolved, s);
        assert!(m.local_only.is_empty());
        assert!(m.remote_only.is_empty());
    }

    #[test]
    fn commutative_on_resolved() {
        let a = set(&["a", "x"]);
        let b = set(&["b"]);
        assert_eq!(GrowSet::merge(&a, &b).resolved, GrowSet::merge(&b, &a).resolved);
    }
}
