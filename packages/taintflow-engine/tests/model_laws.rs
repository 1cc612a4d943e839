//! Property-based tests for the callable summary lattice
//!
//! `Model` composes taint trees, parameter maps, and feature sets into
//! one product; the lattice contract has to survive that composition,
//! not just hold for each piece. Trees have no canonical form, so laws
//! are stated up to order equivalence (mutual less_or_equal), the same
//! convention the sub-domain suites use.

use proptest::prelude::*;
use taintflow_domains::{AbstractDomain, AccessPath, DomainLimits, PathLabel, WideningContext};
use taintflow_engine::{
    tito_passthrough, Breadcrumb, Mode, Model, TaintElement, TaintKind, TaintTree, TitoTree,
};

fn equivalent(left: &Model, right: &Model) -> bool {
    left.less_or_equal(right) && right.less_or_equal(left)
}

fn kind() -> impl Strategy<Value = TaintKind> {
    prop::sample::select(vec!["UserControlled", "Sql", "Log", "Secret"]).prop_map(TaintKind::new)
}

fn breadcrumb() -> impl Strategy<Value = Breadcrumb> {
    prop::sample::select(vec!["via-format", "via-copy", "via-getattr"]).prop_map(Breadcrumb::new)
}

fn label() -> impl Strategy<Value = PathLabel> {
    prop_oneof![
        prop::sample::select(vec!["a", "b", "c"]).prop_map(PathLabel::field),
        Just(PathLabel::AnyIndex),
        Just(PathLabel::DictionaryKeys),
    ]
}

fn access_path() -> impl Strategy<Value = AccessPath> {
    prop::collection::vec(label(), 0..3).prop_map(AccessPath::from_labels)
}

fn element() -> impl Strategy<Value = TaintElement> {
    (kind(), prop::collection::vec(breadcrumb(), 0..3)).prop_map(|(kind, crumbs)| {
        let mut element = TaintElement::of_kind(kind);
        for crumb in crumbs {
            element.add_breadcrumb(crumb);
        }
        element
    })
}

fn taint_tree() -> impl Strategy<Value = TaintTree> {
    prop::collection::vec((access_path(), element()), 0..3).prop_map(|leaves| {
        let mut tree = TaintTree::bottom();
        for (path, element) in leaves {
            tree.join_with(&TaintTree::prepend(&path, TaintTree::create_leaf(element)));
        }
        tree
    })
}

fn mode() -> impl Strategy<Value = Mode> {
    prop::sample::select(vec![Mode::Obscure, Mode::SkipAnalysis])
}

fn model() -> impl Strategy<Value = Model> {
    (
        taint_tree(),
        prop::collection::vec((0usize..3, taint_tree()), 0..3),
        prop::collection::vec(
            (0usize..3, prop::collection::vec(breadcrumb(), 0..2), access_path()),
            0..3,
        ),
        prop::collection::vec(mode(), 0..2),
    )
        .prop_map(|(sources, sinks, titos, modes)| {
            let mut model = Model::new().with_sources(sources);
            for (parameter, sink) in sinks {
                model = model.with_sink(parameter, sink);
            }
            for (parameter, crumbs, path) in titos {
                let tito = TitoTree::prepend(&path, tito_passthrough(&crumbs));
                model = model.with_tito(parameter, tito);
            }
            for mode in modes {
                model = model.with_mode(mode);
            }
            model
        })
}

proptest! {
    #[test]
    fn join_is_commutative(a in model(), b in model()) {
        let left = a.clone().join(&b);
        let right = b.clone().join(&a);
        prop_assert!(equivalent(&left, &right));
    }

    #[test]
    fn join_is_associative(a in model(), b in model(), c in model()) {
        let left = a.clone().join(&b).join(&c);
        let right = a.clone().join(&b.clone().join(&c));
        prop_assert!(equivalent(&left, &right));
    }

    #[test]
    fn join_is_idempotent(a in model()) {
        prop_assert!(equivalent(&a.clone().join(&a), &a));
    }

    #[test]
    fn bottom_is_join_identity(a in model()) {
        prop_assert!(equivalent(&a.clone().join(&Model::bottom()), &a));
        prop_assert!(Model::bottom().less_or_equal(&a));
    }

    #[test]
    fn join_is_an_upper_bound(a in model(), b in model()) {
        let joined = a.clone().join(&b);
        prop_assert!(a.less_or_equal(&joined));
        prop_assert!(b.less_or_equal(&joined));
    }

    #[test]
    fn widen_stays_above_join(a in model(), b in model(), iteration in 1usize..6) {
        let ctx = WideningContext::new(iteration, DomainLimits::default());
        let joined = a.clone().join(&b);
        let widened = a.clone().widen(&b, &ctx);
        prop_assert!(joined.less_or_equal(&widened));
    }

    #[test]
    fn widening_in_a_smaller_operand_is_stable(a in model(), b in model(), iteration in 1usize..6) {
        // Once the join has been published, seeing the same candidate
        // again must not move the summary; this is what lets the
        // fixpoint driver detect cleanliness.
        let ctx = WideningContext::new(iteration, DomainLimits::default());
        let joined = a.clone().join(&b);
        let rewidened = joined.clone().widen(&b, &ctx);
        prop_assert!(equivalent(&rewidened, &joined));
    }

    #[test]
    fn subtracting_a_superset_leaves_bottom(a in model(), b in model()) {
        let mut shrunk = a.clone();
        shrunk.subtract(&a.clone().join(&b));
        prop_assert!(shrunk.is_bottom());
    }
}
