//! taintflow-engine: parallel interprocedural taint analysis
//!
//! Drives per-callable taint summaries to a global fixpoint:
//! - [`facts`]: callable bodies as flow facts, plus override edges
//! - [`rules`]: user taint declarations compiled into starting models
//! - [`model`]: the callable summary domain (sources, sinks, tito)
//! - [`analysis`]: the per-body transfer function producing candidates
//! - [`callgraph`]: dependency graph, analysis order, dependents
//! - [`scheduler`]: bucketed worker pool with sequential degradation
//! - [`fixpoint`]: the clean/dirty driver with widening and capping
//! - [`diagnostics`]: issues and per-callable results
//! - [`snapshot`]: content-addressed images of a finished analysis
//!
//! The enforced discipline is one writer per model key per generation:
//! workers read a frozen table during a pass, and only the controller
//! publishes changed models between passes.

pub mod analysis;
pub mod callgraph;
pub mod config;
pub mod diagnostics;
pub mod errors;
pub mod facts;
pub mod fixpoint;
pub mod model;
pub mod rules;
pub mod scheduler;
pub mod snapshot;

pub use crate::analysis::{AnalysisContext, AnalysisPass, CallableVerdict, TaintPropagation};
pub use crate::callgraph::DependencyGraph;
pub use crate::config::AnalysisConfig;
pub use crate::diagnostics::{AnalysisResult, Issue, IssueKind};
pub use crate::errors::{EngineError, ModelError, Result};
pub use crate::facts::{Callable, CallableFacts, FactStore, FlowInstruction, Location, Operand};
pub use crate::fixpoint::{FixpointEngine, FixpointStatus};
pub use crate::model::{
    tito_passthrough, Breadcrumb, ElementItem, ElementPart, ElementSlot, ElementValue, Mode,
    Model, ModelItem, ModelPart, ModelSlot, ModelValue, ParamMap, TaintElement, TaintKind,
    TaintTree, TitoTree,
};
pub use crate::rules::{build_initial_models, TaintRule};
pub use crate::scheduler::Scheduler;
pub use crate::snapshot::{AnalysisImage, ImageKey, SnapshotStore};
