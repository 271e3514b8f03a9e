//! Canonical sorted component-set identity for archetypes.

use std::cmp::Ordering;
use std::fmt::{self, Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::component::{ComponentInfo, ComponentTypeID};

/// An immutable, sorted, deduplicated list of component schemas.
///
/// The canonical order makes equality structural rather than positional, so
/// a `ComponentSet` is the sole key identifying an archetype.
#[derive(Clone, Default)]
pub struct ComponentSet(Vec<Arc<ComponentInfo>>);

impl ComponentSet {
    /// Build a canonical set from descriptors in any order.
    pub fn new(mut components: Vec<Arc<ComponentInfo>>) -> ComponentSet {
        components.sort_by_key(|c| c.id());
        components.dedup_by_key(|c| c.id());
        ComponentSet(components)
    }

    /// Return the number of schemas in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Return the sorted slice of descriptors.
    pub fn as_slice(&self) -> &[Arc<ComponentInfo>] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ComponentInfo>> {
        self.0.iter()
    }

    /// Returns true if this set contains the given schema.
    pub fn contains(&self, id: ComponentTypeID) -> bool {
        self.0.binary_search_by_key(&id, |c| c.id()).is_ok()
    }

    /// Subset test: true if every schema in `other` is also in `self`.
    ///
    /// Linear merge over the two sorted sequences.
    pub fn contains_all(&self, other: &ComponentSet) -> bool {
        let mut have = self.0.iter();
        'wants: for want in &other.0 {
            for candidate in have.by_ref() {
                match candidate.id().cmp(&want.id()) {
                    Ordering::Less => continue,
                    Ordering::Equal => continue 'wants,
                    Ordering::Greater => return false,
                }
            }
            return false;
        }
        true
    }

    /// True if the two sets share at least one schema.
    pub fn intersects(&self, other: &ComponentSet) -> bool {
        let (mut i, mut j) = (0, 0);
        while i < self.0.len() && j < other.0.len() {
            match self.0[i].id().cmp(&other.0[j].id()) {
                Ordering::Less => i += 1,
                Ordering::Greater => j += 1,
                Ordering::Equal => return true,
            }
        }
        false
    }

    /// Ordinal position of a schema, or `None` when absent.
    ///
    /// Absence is a normal outcome here (e.g. projecting a query's schemas
    /// onto a superset archetype), hence no panic.
    pub fn index_of(&self, id: ComponentTypeID) -> Option<usize> {
        self.0.binary_search_by_key(&id, |c| c.id()).ok()
    }

    /// Batch ordinal lookup, one entry per requested descriptor.
    pub fn ordinals(&self, components: &[Arc<ComponentInfo>]) -> Vec<Option<usize>> {
        components.iter().map(|c| self.index_of(c.id())).collect()
    }

    /// Derive the neighbouring set that additionally holds `component`.
    pub fn with(&self, component: Arc<ComponentInfo>) -> ComponentSet {
        let mut components = self.0.clone();
        components.push(component);
        ComponentSet::new(components)
    }

    /// Derive the neighbouring set without the given schema.
    pub fn without(&self, id: ComponentTypeID) -> ComponentSet {
        ComponentSet(self.0.iter().filter(|c| c.id() != id).cloned().collect())
    }
}

impl PartialEq for ComponentSet {
    fn eq(&self, other: &ComponentSet) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|(a, b)| a.id() == b.id())
    }
}

impl Eq for ComponentSet {}

impl Hash for ComponentSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for component in &self.0 {
            component.id().hash(state);
        }
    }
}

impl Debug for ComponentSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.0.iter().map(|c| c.name()))
            .finish()
    }
}

impl From<Vec<Arc<ComponentInfo>>> for ComponentSet {
    fn from(components: Vec<Arc<ComponentInfo>>) -> Self {
        ComponentSet::new(components)
    }
}
