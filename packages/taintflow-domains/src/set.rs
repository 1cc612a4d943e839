//! Simple Feature Set: over/under-approximated facts
//!
//! Holds cheap, order-irrelevant facts (provenance breadcrumbs, taint
//! kinds, model modes) as a pair of sets:
//! - `over`: facts that MAY hold on some path (join-closed, grows by union)
//! - `under`: facts that MUST hold on every path (meet-closed, shrinks by
//!   intersection on join)
//!
//! The under component enables precise subtraction and lets clients prune
//! facts known to be absent on every path. Invariant: `under ⊆ over`.

use crate::core::{AbstractDomain, DomainSketch, WideningContext};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

/// Bound for anything storable in a feature set.
pub trait SetElement: Clone + Ord + Debug {}

impl<T: Clone + Ord + Debug> SetElement for T {}

/// Over/under-approximated set of facts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleFeatureSet<T: SetElement> {
    over: BTreeSet<T>,
    under: BTreeSet<T>,
}

impl<T: SetElement> Default for SimpleFeatureSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: SetElement> SimpleFeatureSet<T> {
    pub fn new() -> Self {
        Self {
            over: BTreeSet::new(),
            under: BTreeSet::new(),
        }
    }

    /// Singleton set; the fact is certain on the only path seen so far.
    pub fn singleton(element: T) -> Self {
        let mut set = Self::new();
        set.add(element);
        set
    }

    /// Add a fact that holds on every path seen so far.
    pub fn add(&mut self, element: T) {
        self.under.insert(element.clone());
        self.over.insert(element);
    }

    /// Add a fact that holds only on some paths.
    pub fn add_may(&mut self, element: T) {
        self.over.insert(element);
    }

    /// Fact may hold.
    pub fn contains(&self, element: &T) -> bool {
        self.over.contains(element)
    }

    /// Fact holds on every path.
    pub fn is_certain(&self, element: &T) -> bool {
        self.under.contains(element)
    }

    pub fn len(&self) -> usize {
        self.over.len()
    }

    pub fn is_empty(&self) -> bool {
        self.over.is_empty()
    }

    /// All facts that may hold, in element order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.over.iter()
    }

    /// Rewrite every element; certainty is preserved per element.
    pub fn transform_elements(&mut self, mut f: impl FnMut(T) -> T) {
        let over = std::mem::take(&mut self.over);
        let under = std::mem::take(&mut self.under);
        for element in over {
            let certain = under.contains(&element);
            let mapped = f(element);
            if certain {
                self.under.insert(mapped.clone());
            }
            self.over.insert(mapped);
        }
    }

    /// Fold over every fact that may hold.
    pub fn fold_elements<B>(&self, init: B, f: impl FnMut(B, &T) -> B) -> B {
        self.over.iter().fold(init, f)
    }

    /// Group elements by a derived key, preserving per-element certainty.
    pub fn partition_elements<K: Ord>(
        &self,
        mut key_of: impl FnMut(&T) -> K,
    ) -> BTreeMap<K, SimpleFeatureSet<T>> {
        let mut groups: BTreeMap<K, SimpleFeatureSet<T>> = BTreeMap::new();
        for element in &self.over {
            let bucket = groups.entry(key_of(element)).or_default();
            if self.under.contains(element) {
                bucket.add(element.clone());
            } else {
                bucket.add_may(element.clone());
            }
        }
        groups
    }
}

impl<T: SetElement> FromIterator<T> for SimpleFeatureSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut set = Self::new();
        for element in iter {
            set.add(element);
        }
        set
    }
}

impl<T: SetElement> AbstractDomain for SimpleFeatureSet<T> {
    fn bottom() -> Self {
        Self::new()
    }

    fn is_bottom(&self) -> bool {
        // under ⊆ over, so an empty over set implies an empty under set.
        self.over.is_empty()
    }

    fn join_with(&mut self, other: &Self) {
        // Bottom is the join identity; intersecting under with an empty
        // bottom would wrongly erase certainty.
        if other.is_bottom() {
            return;
        }
        if self.is_bottom() {
            *self = other.clone();
            return;
        }
        self.over.extend(other.over.iter().cloned());
        self.under = self.under.intersection(&other.under).cloned().collect();
    }

    fn widen_with(&mut self, other: &Self, _ctx: &WideningContext<'_>) {
        // Elements come from a finite program-derived universe, so plain
        // join already terminates.
        self.join_with(other);
    }

    fn less_or_equal(&self, other: &Self) -> bool {
        if self.is_bottom() {
            return true;
        }
        if other.is_bottom() {
            return false;
        }
        self.over.is_subset(&other.over) && other.under.is_subset(&self.under)
    }

    fn subtract(&mut self, to_remove: &Self) {
        for element in &to_remove.over {
            self.over.remove(element);
            self.under.remove(element);
        }
    }

    fn introspect(&self) -> DomainSketch {
        let children = self
            .over
            .iter()
            .map(|element| {
                let marker = if self.under.contains(element) { "!" } else { "?" };
                DomainSketch::leaf(format!("{marker}{element:?}"))
            })
            .collect();
        DomainSketch::node(format!("simple-set({})", self.over.len()), children)
    }
}
