/*
 * Tree Domain: access-path-indexed lattice
 *
 * Maps access paths to element-domain values. The value observable at a
 * path splits into two contributions:
 * - the "tip": the element stored exactly at that path's node
 * - the "ancestor" contribution: the join of tips at proper prefixes,
 *   inherited by every descendant (taint on `x` covers `x.y.z`)
 *
 * Reads apply index covering: `AnyIndex` content is visible to any field
 * read, and an `AnyIndex` read sees every child except `DictionaryKeys`
 * (the key set is a separate namespace from the values). Writes address
 * exact labels; weak assignment joins instead of replacing.
 *
 * Trees are kept in normal form: no all-bottom subtrees, and no tip that
 * is already covered by its ancestor contribution. Normalization preserves
 * pathwise reads and makes structural equality agree with the lattice
 * order, which the fixpoint driver's convergence check relies on.
 *
 * Reference:
 * - "Field-Sensitive Program Analysis" (Whaley & Lam, 2004)
 * - "TAJ: Effective Taint Analysis of Web Applications" (Tripp et al., 2009)
 * - "Abstract Interpretation: A Unified Lattice Model" (Cousot & Cousot, 1977)
 */

use crate::core::{AbstractDomain, ApproximationKind, ApproximationTracker, DomainSketch, WideningContext};
use crate::path::{AccessPath, PathLabel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Access-path tree over an element domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeDomain<E> {
    element: E,
    children: BTreeMap<PathLabel, TreeDomain<E>>,
}

impl<E: AbstractDomain> Default for TreeDomain<E> {
    fn default() -> Self {
        Self::bottom()
    }
}

impl<E: AbstractDomain> TreeDomain<E> {
    /// Single-node tree holding `element` at the root.
    pub fn create_leaf(element: E) -> Self {
        Self {
            element,
            children: BTreeMap::new(),
        }
    }

    /// The tip stored exactly at the root.
    pub fn root_element(&self) -> &E {
        &self.element
    }

    /// Graft `tree` as the subtree rooted at `path`.
    pub fn prepend(path: &AccessPath, tree: Self) -> Self {
        if tree.is_bottom() {
            return Self::bottom();
        }
        let mut grafted = tree;
        for label in path.labels().iter().rev() {
            let mut node = Self::bottom();
            node.children.insert(label.clone(), grafted);
            grafted = node;
        }
        grafted
    }

    /// Strong assignment: replace the content at `path` with `subtree`.
    pub fn assign(&mut self, path: &AccessPath, subtree: Self) {
        self.assign_at(path.labels(), subtree, false);
        self.normalize();
    }

    /// Weak assignment: join `subtree` with the content at `path`.
    pub fn assign_weak(&mut self, path: &AccessPath, subtree: Self) {
        self.assign_at(path.labels(), subtree, true);
        self.normalize();
    }

    fn assign_at(&mut self, labels: &[PathLabel], subtree: Self, weak: bool) {
        match labels.split_first() {
            None => {
                if weak {
                    self.merge_structure(&subtree);
                } else {
                    *self = subtree;
                }
            }
            Some((label, rest)) => {
                self.children
                    .entry(label.clone())
                    .or_insert_with(Self::bottom)
                    .assign_at(rest, subtree, weak);
            }
        }
    }

    /// Effective content at `path`: the subtree rooted there, with the
    /// join of all ancestor tips folded into its root element.
    pub fn read(&self, path: &AccessPath) -> Self {
        self.read_internal(path.labels(), E::bottom(), &mut |e| e.clone())
    }

    /// `read`, additionally rewriting each intermediate (non-leaf) element
    /// with `transform` before it joins the ancestor contribution.
    pub fn read_with_transform(
        &self,
        path: &AccessPath,
        mut transform: impl FnMut(&E) -> E,
    ) -> Self {
        self.read_internal(path.labels(), E::bottom(), &mut transform)
    }

    fn read_internal(
        &self,
        labels: &[PathLabel],
        mut ancestors: E,
        transform: &mut impl FnMut(&E) -> E,
    ) -> Self {
        match labels.split_first() {
            None => {
                let mut result = self.clone();
                result.element.join_with(&ancestors);
                result.normalize();
                result
            }
            Some((label, rest)) => {
                if !self.element.is_bottom() {
                    ancestors.join_with(&transform(&self.element));
                }
                self.child_for_read(label).read_internal(rest, ancestors, transform)
            }
        }
    }

    /// The child a read through `label` observes, after index covering.
    fn child_for_read(&self, label: &PathLabel) -> Self {
        match label {
            PathLabel::Field(_) => {
                let mut view = self.children.get(label).cloned().unwrap_or_else(Self::bottom);
                if let Some(any) = self.children.get(&PathLabel::AnyIndex) {
                    view.merge_structure(any);
                }
                view
            }
            PathLabel::AnyIndex => {
                let mut view = Self::bottom();
                for (child_label, child) in &self.children {
                    if *child_label != PathLabel::DictionaryKeys {
                        view.merge_structure(child);
                    }
                }
                view
            }
            PathLabel::DictionaryKeys => self
                .children
                .get(&PathLabel::DictionaryKeys)
                .cloned()
                .unwrap_or_else(Self::bottom),
        }
    }

    /// Depth of the shallowest non-bottom tip; 0 for the bottom tree.
    pub fn min_depth(&self) -> usize {
        if !self.element.is_bottom() || self.children.is_empty() {
            return 0;
        }
        self.children
            .values()
            .map(|child| 1 + child.min_depth())
            .min()
            .unwrap_or(0)
    }

    /// Depth of the deepest non-bottom tip; 0 for the bottom tree.
    pub fn max_depth(&self) -> usize {
        self.children
            .values()
            .map(|child| 1 + child.max_depth())
            .max()
            .unwrap_or(0)
    }

    /// Join every tip into one scalar, discarding path structure.
    ///
    /// An explicit precision-losing policy, so callers pass the audit
    /// tracker when one is in force.
    pub fn collapse(&self, tracker: Option<&ApproximationTracker>) -> E {
        if let Some(tracker) = tracker {
            if !self.children.is_empty() {
                tracker.record(ApproximationKind::TreeCollapse);
            }
        }
        self.collapse_value()
    }

    fn collapse_value(&self) -> E {
        let mut folded = self.element.clone();
        for child in self.children.values() {
            folded.join_with(&child.collapse_value());
        }
        folded
    }

    /// Fold all content below `depth` upward into the node at `depth`.
    pub fn collapse_to(&mut self, depth: usize) {
        if depth == 0 {
            if !self.children.is_empty() {
                self.element = self.collapse_value();
                self.children.clear();
            }
            return;
        }
        for child in self.children.values_mut() {
            child.collapse_to(depth - 1);
        }
    }

    /// Discard (do not fold) all content below `depth`. Idempotent.
    pub fn cut_after(&mut self, depth: usize) {
        if depth == 0 {
            self.children.clear();
        } else {
            for child in self.children.values_mut() {
                child.cut_after(depth - 1);
            }
            self.trim();
        }
    }

    /// Restrict branches to the paths present in `mold`, joining pruned
    /// content upward into the nearest retained ancestor. Mold elements
    /// are ignored; only its branch structure matters.
    pub fn shape(&mut self, mold: &Self) {
        self.shape_branches(mold);
        self.normalize();
    }

    fn shape_branches(&mut self, mold: &Self) {
        let labels: Vec<PathLabel> = self.children.keys().cloned().collect();
        for label in labels {
            match mold.children.get(&label) {
                Some(mold_child) => {
                    if let Some(child) = self.children.get_mut(&label) {
                        child.shape_branches(mold_child);
                    }
                }
                None => {
                    if let Some(pruned) = self.children.remove(&label) {
                        self.element.join_with(&pruned.collapse_value());
                    }
                }
            }
        }
    }

    /// Fold over every non-bottom tip with its full path.
    pub fn fold_tips<B>(&self, init: B, mut f: impl FnMut(B, &AccessPath, &E) -> B) -> B {
        let mut buffer = Vec::new();
        self.fold_tips_walk(init, &mut buffer, &mut f)
    }

    fn fold_tips_walk<B>(
        &self,
        mut acc: B,
        buffer: &mut Vec<PathLabel>,
        f: &mut impl FnMut(B, &AccessPath, &E) -> B,
    ) -> B {
        if !self.element.is_bottom() {
            let path = AccessPath::from_labels(buffer.clone());
            acc = f(acc, &path, &self.element);
        }
        for (label, child) in &self.children {
            buffer.push(label.clone());
            acc = child.fold_tips_walk(acc, buffer, f);
            buffer.pop();
        }
        acc
    }

    /// Rewrite every non-bottom tip in place.
    pub fn transform_tips(&mut self, mut f: impl FnMut(&AccessPath, E) -> E) {
        let mut buffer = Vec::new();
        self.transform_tips_walk(&mut buffer, &mut f);
        self.normalize();
    }

    fn transform_tips_walk(
        &mut self,
        buffer: &mut Vec<PathLabel>,
        f: &mut impl FnMut(&AccessPath, E) -> E,
    ) {
        if !self.element.is_bottom() {
            let path = AccessPath::from_labels(buffer.clone());
            let old = std::mem::replace(&mut self.element, E::bottom());
            self.element = f(&path, old);
        }
        for (label, child) in &mut self.children {
            buffer.push(label.clone());
            child.transform_tips_walk(buffer, f);
            buffer.pop();
        }
    }

    /// Group tips into per-key trees by a derived key.
    pub fn partition_tips<K: Ord>(
        &self,
        mut key_of: impl FnMut(&AccessPath, &E) -> K,
    ) -> BTreeMap<K, Self> {
        self.fold_tips(BTreeMap::new(), |mut groups: BTreeMap<K, Self>, path, element| {
            groups
                .entry(key_of(path, element))
                .or_insert_with(Self::bottom)
                .assign_weak(path, Self::create_leaf(element.clone()));
            groups
        })
    }

    /// All non-bottom tips in path order.
    pub fn tips(&self) -> Vec<(AccessPath, E)> {
        self.fold_tips(Vec::new(), |mut acc, path, element| {
            acc.push((path.clone(), element.clone()));
            acc
        })
    }

    // Structural join without normalization; callers normalize at the root.
    fn merge_structure(&mut self, other: &Self) {
        self.element.join_with(&other.element);
        for (label, child) in &other.children {
            match self.children.get_mut(label) {
                Some(existing) => existing.merge_structure(child),
                None => {
                    self.children.insert(label.clone(), child.clone());
                }
            }
        }
    }

    fn widen_structure(&mut self, other: &Self, ctx: &WideningContext<'_>) {
        self.element.widen_with(&other.element, ctx);
        let bottom = Self::bottom();
        for (label, child) in &other.children {
            match self.children.get_mut(label) {
                Some(existing) => existing.widen_structure(child, ctx),
                None => {
                    let mut grown = Self::bottom();
                    grown.widen_structure(child, ctx);
                    self.children.insert(label.clone(), grown);
                }
            }
        }
        for (label, child) in &mut self.children {
            if !other.children.contains_key(label) {
                child.widen_structure(&bottom, ctx);
            }
        }
    }

    fn subtract_structure(&mut self, to_remove: &Self, ancestors: &E) {
        let mut covering = ancestors.clone();
        covering.join_with(&to_remove.element);
        self.element.subtract(&covering);
        let bottom = Self::bottom();
        for (label, child) in &mut self.children {
            let removed_child = to_remove.children.get(label).unwrap_or(&bottom);
            child.subtract_structure(removed_child, &covering);
        }
    }

    fn leq_structure(&self, other: &Self, other_ancestors: &E) -> bool {
        let mut covering = other_ancestors.clone();
        covering.join_with(&other.element);
        if !self.element.less_or_equal(&covering) {
            return false;
        }
        let bottom = Self::bottom();
        self.children.iter().all(|(label, child)| {
            let other_child = other.children.get(label).unwrap_or(&bottom);
            child.leq_structure(other_child, &covering)
        })
    }

    /// Restore normal form: strip ancestor-covered tips, drop bottom
    /// subtrees.
    fn normalize(&mut self) {
        self.reduce(&E::bottom());
    }

    fn reduce(&mut self, ancestors: &E) {
        if !ancestors.is_bottom() && !self.element.is_bottom() && self.element.less_or_equal(ancestors)
        {
            self.element = E::bottom();
        }
        let mut covering = ancestors.clone();
        covering.join_with(&self.element);
        for child in self.children.values_mut() {
            child.reduce(&covering);
        }
        self.trim();
    }

    fn trim(&mut self) {
        self.children.retain(|_, child| !child.is_bottom());
    }
}

impl<E: AbstractDomain> AbstractDomain for TreeDomain<E> {
    fn bottom() -> Self {
        Self {
            element: E::bottom(),
            children: BTreeMap::new(),
        }
    }

    fn is_bottom(&self) -> bool {
        self.element.is_bottom() && self.children.is_empty()
    }

    fn join_with(&mut self, other: &Self) {
        if other.is_bottom() {
            return;
        }
        if self.is_bottom() {
            *self = other.clone();
            return;
        }
        self.merge_structure(other);
        self.normalize();
    }

    fn widen_with(&mut self, other: &Self, ctx: &WideningContext<'_>) {
        self.widen_structure(other, ctx);
        let limit = ctx.limits.max_tree_depth_after_widening;
        if self.max_depth() > limit {
            ctx.note(ApproximationKind::TreeDepthFold);
            self.collapse_to(limit);
        }
        self.normalize();
    }

    fn less_or_equal(&self, other: &Self) -> bool {
        self.leq_structure(other, &E::bottom())
    }

    fn subtract(&mut self, to_remove: &Self) {
        if self.is_bottom() || to_remove.is_bottom() {
            return;
        }
        self.subtract_structure(to_remove, &E::bottom());
        self.normalize();
    }

    fn introspect(&self) -> DomainSketch {
        fn sketch_node<E: AbstractDomain>(label: String, node: &TreeDomain<E>) -> DomainSketch {
            let mut children = Vec::new();
            if !node.element.is_bottom() {
                children.push(node.element.introspect());
            }
            for (child_label, child) in &node.children {
                children.push(sketch_node(child_label.to_string(), child));
            }
            DomainSketch::node(label, children)
        }
        sketch_node("tree".to_string(), self)
    }
}
