/*
 * Abstract Domain Contract
 *
 * Every lattice value in the analysis implements one interface:
 * - bottom / is_bottom: the unique least element (join identity)
 * - join: least upper bound (commutative, associative, idempotent)
 * - widen: join variant that guarantees termination on infinite-height
 *   domains by folding structure beyond configured limits
 * - less_or_equal: the partial order; agrees with join
 *   (less_or_equal(a, b) <=> join(a, b) == b)
 * - subtract: removes the effect of one value from another
 * - introspect: structural debug dump, never control flow
 *
 * Widening receives a context carrying the fixpoint iteration, the
 * structural limits, and an optional approximation tracker so every
 * deliberate precision loss stays auditable.
 *
 * Reference:
 * - "Abstract Interpretation: A Unified Lattice Model" (Cousot & Cousot, 1977)
 * - "Comparing the Galois Connection and Widening/Narrowing Approaches
 *   to Abstract Interpretation" (Cousot & Cousot, 1992)
 */

use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};

/// Structural limits enforced by `widen`.
///
/// These bound the height of the tree and complex-set lattices, which are
/// otherwise infinite (access paths can nest arbitrarily deep).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainLimits {
    /// Maximum tree depth surviving a widen; deeper branches fold upward.
    pub max_tree_depth_after_widening: usize,

    /// Maximum complex-set cardinality; larger sets collapse to one
    /// maximally coarse element.
    pub max_set_width: usize,

    /// Maximum internal path length of a complex-set element; longer
    /// elements are truncated to this prefix.
    pub max_path_length: usize,
}

impl Default for DomainLimits {
    fn default() -> Self {
        Self {
            max_tree_depth_after_widening: 4,
            max_set_width: 10,
            max_path_length: 4,
        }
    }
}

impl DomainLimits {
    pub fn with_max_tree_depth(mut self, depth: usize) -> Self {
        self.max_tree_depth_after_widening = depth;
        self
    }

    pub fn with_max_set_width(mut self, width: usize) -> Self {
        self.max_set_width = width;
        self
    }

    pub fn with_max_path_length(mut self, length: usize) -> Self {
        self.max_path_length = length;
        self
    }
}

/// Which structural approximation a domain applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApproximationKind {
    /// Tree branch deeper than the limit folded upward during widen.
    TreeDepthFold,
    /// Complex set wider than the limit collapsed to its coarse element.
    SetWidthCollapse,
    /// Complex-set element truncated to the path-length limit.
    PathTruncation,
    /// Whole tree collapsed to a scalar (explicit call-site policy).
    TreeCollapse,
}

/// Counts of precision-losing operations, shareable across workers.
///
/// Approximations are deliberate, not errors; this tracker is the audit
/// channel for them. All counters are atomic so one tracker can be shared
/// by reference across a worker pool without locking.
#[derive(Debug, Default)]
pub struct ApproximationTracker {
    tree_depth_folds: AtomicU64,
    set_width_collapses: AtomicU64,
    path_truncations: AtomicU64,
    tree_collapses: AtomicU64,
}

/// Point-in-time copy of an `ApproximationTracker`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproximationCounts {
    pub tree_depth_folds: u64,
    pub set_width_collapses: u64,
    pub path_truncations: u64,
    pub tree_collapses: u64,
}

impl ApproximationCounts {
    pub fn total(&self) -> u64 {
        self.tree_depth_folds + self.set_width_collapses + self.path_truncations + self.tree_collapses
    }
}

impl ApproximationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one approximation event.
    pub fn record(&self, kind: ApproximationKind) {
        self.counter(kind).fetch_add(1, Ordering::Relaxed);
        tracing::trace!("approximation applied: {:?}", kind);
    }

    pub fn count(&self, kind: ApproximationKind) -> u64 {
        self.counter(kind).load(Ordering::Relaxed)
    }

    /// Copy all counters out for reporting.
    pub fn snapshot(&self) -> ApproximationCounts {
        ApproximationCounts {
            tree_depth_folds: self.tree_depth_folds.load(Ordering::Relaxed),
            set_width_collapses: self.set_width_collapses.load(Ordering::Relaxed),
            path_truncations: self.path_truncations.load(Ordering::Relaxed),
            tree_collapses: self.tree_collapses.load(Ordering::Relaxed),
        }
    }

    fn counter(&self, kind: ApproximationKind) -> &AtomicU64 {
        match kind {
            ApproximationKind::TreeDepthFold => &self.tree_depth_folds,
            ApproximationKind::SetWidthCollapse => &self.set_width_collapses,
            ApproximationKind::PathTruncation => &self.path_truncations,
            ApproximationKind::TreeCollapse => &self.tree_collapses,
        }
    }
}

/// Context threaded through `widen_with`.
#[derive(Debug, Clone, Copy)]
pub struct WideningContext<'a> {
    /// Fixpoint iteration the widen belongs to (for trace output).
    pub iteration: usize,

    /// Structural limits to enforce.
    pub limits: DomainLimits,

    /// Optional audit channel for precision loss.
    pub tracker: Option<&'a ApproximationTracker>,
}

impl<'a> WideningContext<'a> {
    pub fn new(iteration: usize, limits: DomainLimits) -> Self {
        Self {
            iteration,
            limits,
            tracker: None,
        }
    }

    pub fn with_tracker(mut self, tracker: &'a ApproximationTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Record an approximation if a tracker is attached.
    pub fn note(&self, kind: ApproximationKind) {
        if let Some(tracker) = self.tracker {
            tracker.record(kind);
        }
    }
}

/// Structural debug dump of a domain value.
///
/// Produced by `AbstractDomain::introspect`; consumed by trace output and
/// tests, never by analysis logic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainSketch {
    pub label: String,
    pub children: Vec<DomainSketch>,
}

impl DomainSketch {
    pub fn leaf(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            children: Vec::new(),
        }
    }

    pub fn node(label: impl Into<String>, children: Vec<DomainSketch>) -> Self {
        Self {
            label: label.into(),
            children,
        }
    }

    /// Render as indented text, one node per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize) {
        for _ in 0..depth {
            out.push_str("  ");
        }
        out.push_str(&self.label);
        out.push('\n');
        for child in &self.children {
            child.render_into(out, depth + 1);
        }
    }

    /// JSON form for machine-readable dumps.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| self.label.clone())
    }
}

/// The contract every lattice value implements.
///
/// # Laws
///
/// ```text
/// join(a, b) == join(b, a)
/// join(a, join(b, c)) == join(join(a, b), c)
/// join(a, a) == a
/// join(a, bottom) == a
/// less_or_equal(a, b) <=> join(a, b) == b
/// join(prev, next) <= widen(ctx, prev, next)
/// subtract(a, from: a_or_less) == bottom
/// ```
///
/// `widen` applied repeatedly along any non-decreasing chain reaches a
/// fixed point in finitely many steps; the bound comes from
/// `DomainLimits`, which cap the structural height of the tree and
/// complex-set lattices.
pub trait AbstractDomain: Clone + Debug + PartialEq {
    /// The unique least element.
    fn bottom() -> Self;

    fn is_bottom(&self) -> bool;

    /// In-place least upper bound.
    fn join_with(&mut self, other: &Self);

    /// Owned least upper bound.
    fn join(mut self, other: &Self) -> Self {
        self.join_with(other);
        self
    }

    /// In-place widening: an upper bound of `self` and `other` that also
    /// enforces the structural limits in `ctx`.
    fn widen_with(&mut self, other: &Self, ctx: &WideningContext<'_>);

    /// Owned widening.
    fn widen(mut self, other: &Self, ctx: &WideningContext<'_>) -> Self {
        self.widen_with(other, ctx);
        self
    }

    /// Partial order; must agree with `join`.
    fn less_or_equal(&self, other: &Self) -> bool;

    /// Remove the effect of `to_remove` from `self`; becomes bottom when
    /// `to_remove` subsumes `self`.
    fn subtract(&mut self, to_remove: &Self);

    /// Structural dump for debugging and imprecision audits.
    fn introspect(&self) -> DomainSketch;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_are_positive() {
        let limits = DomainLimits::default();
        assert!(limits.max_tree_depth_after_widening > 0);
        assert!(limits.max_set_width > 0);
        assert!(limits.max_path_length > 0);
    }

    #[test]
    fn limit_builders_override_single_fields() {
        let limits = DomainLimits::default()
            .with_max_tree_depth(2)
            .with_max_set_width(3)
            .with_max_path_length(1);
        assert_eq!(limits.max_tree_depth_after_widening, 2);
        assert_eq!(limits.max_set_width, 3);
        assert_eq!(limits.max_path_length, 1);
    }

    #[test]
    fn tracker_counts_per_kind() {
        let tracker = ApproximationTracker::new();
        tracker.record(ApproximationKind::TreeDepthFold);
        tracker.record(ApproximationKind::TreeDepthFold);
        tracker.record(ApproximationKind::SetWidthCollapse);

        assert_eq!(tracker.count(ApproximationKind::TreeDepthFold), 2);
        assert_eq!(tracker.count(ApproximationKind::SetWidthCollapse), 1);
        assert_eq!(tracker.count(ApproximationKind::PathTruncation), 0);
        assert_eq!(tracker.snapshot().total(), 3);
    }

    #[test]
    fn context_note_without_tracker_is_a_no_op() {
        let ctx = WideningContext::new(0, DomainLimits::default());
        // Must not panic.
        ctx.note(ApproximationKind::TreeCollapse);
    }

    #[test]
    fn context_note_reaches_attached_tracker() {
        let tracker = ApproximationTracker::new();
        let ctx = WideningContext::new(3, DomainLimits::default()).with_tracker(&tracker);
        ctx.note(ApproximationKind::PathTruncation);
        assert_eq!(tracker.count(ApproximationKind::PathTruncation), 1);
    }

    #[test]
    fn sketch_renders_with_indentation() {
        let sketch = DomainSketch::node(
            "tree",
            vec![
                DomainSketch::leaf("x -> {A}"),
                DomainSketch::node("y", vec![DomainSketch::leaf("z -> {B}")]),
            ],
        );
        let rendered = sketch.render();
        assert_eq!(rendered, "tree\n  x -> {A}\n  y\n    z -> {B}\n");
    }
}
