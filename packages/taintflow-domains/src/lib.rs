//! taintflow-domains: abstract domain algebra for taint analysis
//!
//! The lattice framework the fixpoint engine computes over:
//! - [`core`]: the domain contract (bottom/join/widen/less_or_equal/
//!   subtract/introspect), structural limits, and the approximation
//!   tracker that keeps precision loss auditable
//! - [`set`]: over/under-approximated simple feature sets
//! - [`complex`]: width/path-length-bounded complex feature sets
//! - [`path`]: access-path labels (`Field`, `DictionaryKeys`, `AnyIndex`)
//! - [`tree`]: the access-path tree domain with tip + ancestor semantics
//! - [`product`]: typed slots, part routing, and strict-slot support for
//!   heterogeneous product compositions
//!
//! All domains satisfy the same laws (see `AbstractDomain`); the property
//! suite in `tests/lattice_laws.rs` checks them across combinators.

pub mod complex;
pub mod core;
pub mod path;
pub mod product;
pub mod set;
pub mod tree;

pub use crate::complex::{ComplexElement, ComplexFeatureSet};
pub use crate::core::{
    AbstractDomain, ApproximationCounts, ApproximationKind, ApproximationTracker, DomainLimits,
    DomainSketch, WideningContext,
};
pub use crate::path::{AccessPath, PathLabel};
pub use crate::product::{PartKey, ProductDomain, RouteTable, RouteTableBuilder, SlotKey};
pub use crate::set::{SetElement, SimpleFeatureSet};
pub use crate::tree::TreeDomain;
