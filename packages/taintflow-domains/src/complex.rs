//! Complex Feature Set: bounded structural facts
//!
//! Holds expensive structural elements (return access paths) in a single
//! join-closed set. Unlike simple feature sets, the element space is
//! unbounded — access paths nest arbitrarily — so `widen` enforces two
//! limits to keep the lattice height finite:
//! - any element wider than `max_path_length` is truncated to that prefix
//! - a set wider than `max_set_width` collapses to the single maximally
//!   coarse element
//!
//! Elements carry their own subsumption order; the set is kept as an
//! antichain (no element subsumed by another), so truncation and collapse
//! both move strictly up the lattice and `widen >= join` holds.

use crate::core::{AbstractDomain, ApproximationKind, DomainSketch, WideningContext};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

/// Element of a complex feature set.
///
/// `subsumes` is the element order: `coarsest()` subsumes everything and
/// `truncate` must return an element that subsumes the original.
pub trait ComplexElement: Clone + Ord + Debug {
    /// Internal structural width (for access paths: the path length).
    fn width(&self) -> usize;

    /// Coarsen to at most `max_width`.
    fn truncate(&self, max_width: usize) -> Self;

    /// The single element with no remaining precision.
    fn coarsest() -> Self;

    /// Does `self` cover `other`? Must be reflexive and transitive.
    fn subsumes(&self, other: &Self) -> bool;
}

/// Join-closed antichain of complex elements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplexFeatureSet<T: ComplexElement> {
    elements: BTreeSet<T>,
}

impl<T: ComplexElement> Default for ComplexFeatureSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ComplexElement> ComplexFeatureSet<T> {
    pub fn new() -> Self {
        Self {
            elements: BTreeSet::new(),
        }
    }

    pub fn singleton(element: T) -> Self {
        let mut set = Self::new();
        set.add(element);
        set
    }

    /// Insert, maintaining the antichain: drop the element if something
    /// present already subsumes it, and evict anything it subsumes.
    pub fn add(&mut self, element: T) {
        if self.elements.iter().any(|e| e.subsumes(&element)) {
            return;
        }
        self.elements.retain(|e| !element.subsumes(e));
        self.elements.insert(element);
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.elements.iter()
    }

    /// Is `element` covered by this set?
    pub fn covers(&self, element: &T) -> bool {
        self.elements.iter().any(|e| e.subsumes(element))
    }

    /// Rewrite every element, re-normalizing afterward.
    pub fn transform_elements(&mut self, mut f: impl FnMut(T) -> T) {
        let old = std::mem::take(&mut self.elements);
        for element in old {
            self.add(f(element));
        }
    }

    pub fn fold_elements<B>(&self, init: B, f: impl FnMut(B, &T) -> B) -> B {
        self.elements.iter().fold(init, f)
    }

    /// Group elements by a derived key.
    pub fn partition_elements<K: Ord>(
        &self,
        mut key_of: impl FnMut(&T) -> K,
    ) -> BTreeMap<K, ComplexFeatureSet<T>> {
        let mut groups: BTreeMap<K, ComplexFeatureSet<T>> = BTreeMap::new();
        for element in &self.elements {
            groups
                .entry(key_of(element))
                .or_default()
                .add(element.clone());
        }
        groups
    }
}

impl<T: ComplexElement> FromIterator<T> for ComplexFeatureSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut set = Self::new();
        for element in iter {
            set.add(element);
        }
        set
    }
}

impl<T: ComplexElement> AbstractDomain for ComplexFeatureSet<T> {
    fn bottom() -> Self {
        Self::new()
    }

    fn is_bottom(&self) -> bool {
        self.elements.is_empty()
    }

    fn join_with(&mut self, other: &Self) {
        for element in &other.elements {
            self.add(element.clone());
        }
    }

    fn widen_with(&mut self, other: &Self, ctx: &WideningContext<'_>) {
        self.join_with(other);

        let max_width = ctx.limits.max_path_length;
        if self.elements.iter().any(|e| e.width() > max_width) {
            let old = std::mem::take(&mut self.elements);
            for element in old {
                if element.width() > max_width {
                    ctx.note(ApproximationKind::PathTruncation);
                    self.add(element.truncate(max_width));
                } else {
                    self.add(element);
                }
            }
        }

        if self.elements.len() > ctx.limits.max_set_width {
            ctx.note(ApproximationKind::SetWidthCollapse);
            self.elements.clear();
            self.elements.insert(T::coarsest());
        }
    }

    fn less_or_equal(&self, other: &Self) -> bool {
        self.elements.iter().all(|e| other.covers(e))
    }

    fn subtract(&mut self, to_remove: &Self) {
        self.elements.retain(|e| !to_remove.covers(e));
    }

    fn introspect(&self) -> DomainSketch {
        let children = self
            .elements
            .iter()
            .map(|e| DomainSketch::leaf(format!("{e:?}")))
            .collect();
        DomainSketch::node(format!("complex-set({})", self.elements.len()), children)
    }
}
