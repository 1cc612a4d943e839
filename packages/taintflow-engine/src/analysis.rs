/*
 * Taint propagation pass
 *
 * The transfer function for one callable: walk its instructions with a
 * local environment mapping operands to taint, apply callee models at
 * call sites, and produce (a) the callable's candidate model for this
 * iteration and (b) concrete issues found in its body.
 *
 * Two flavours of taint travel through the environment. Concrete taint
 * is a tree of elements that already originates at a source. Parameter
 * provenance records which input paths of the enclosing callable's own
 * parameters reach a value; it becomes tito and derived sinks in the
 * candidate model, which is how flows spanning several callables are
 * discovered one level per iteration.
 *
 * References:
 * - Tripp et al., "TAJ: Effective Taint Analysis of Web Applications"
 *   (PLDI 2009) — hybrid summaries for library calls
 * - Arzt et al., "FlowDroid" (PLDI 2014) — access-path based
 *   field-sensitive propagation
 */

use dashmap::DashMap;
use rustc_hash::FxHashMap;
use tracing::debug;

use taintflow_domains::{AbstractDomain, AccessPath, ApproximationTracker};

use crate::diagnostics::{AnalysisResult, Issue, IssueKind};
use crate::facts::{Callable, FactStore, FlowInstruction, Location, Operand};
use crate::model::{Model, ParamMap, TaintTree, TitoTree};

/// Everything a pass may read while analyzing one callable. The model
/// table is shared and read-only for the duration of an iteration;
/// updates are published between iterations.
pub struct AnalysisContext<'a> {
    pub facts: &'a FactStore,
    pub models: &'a DashMap<Callable, Model>,
    pub tracker: &'a ApproximationTracker,
}

/// Output of analyzing one callable once.
#[derive(Debug, Clone, PartialEq)]
pub struct CallableVerdict {
    /// Model the body justifies under the current callee models.
    pub candidate: Model,
    /// Concrete flows found in the body.
    pub result: AnalysisResult,
}

/// One analysis pass over callables.
pub trait AnalysisPass: Send + Sync {
    fn name(&self) -> &'static str;

    fn analyze(&self, callable: &Callable, context: &AnalysisContext<'_>) -> CallableVerdict;
}

/// Taint carried by one operand during the body walk.
#[derive(Debug, Clone, Default)]
struct LocalTaint {
    /// Taint that already originates at a source.
    concrete: TaintTree,
    /// Input paths of the enclosing callable's parameters reaching this
    /// value, with breadcrumbs collected on the way.
    from_params: ParamMap<TitoTree>,
}

impl LocalTaint {
    fn for_parameter(parameter: usize) -> Self {
        let mut taint = LocalTaint::default();
        taint
            .from_params
            .set(parameter, crate::model::tito_passthrough(&[]));
        taint
    }

    fn join_with(&mut self, other: &Self) {
        self.concrete.join_with(&other.concrete);
        self.from_params.join_with(&other.from_params);
    }

    /// Taint of `self.field`: concrete taint narrows by a tree read,
    /// parameter provenance gains the field on its input paths.
    fn read_field(&self, field: &str) -> Self {
        let path = AccessPath::root().field(field);
        let mut result = LocalTaint {
            concrete: self.concrete.read(&path),
            from_params: ParamMap::new(),
        };
        for (parameter, provenance) in self.from_params.iter() {
            result
                .from_params
                .set(parameter, extend_input_paths(provenance, &path));
        }
        result
    }

    /// Weak update of `self.field = value`. Output-side paths of the
    /// provenance are not tracked, so that side joins unchanged.
    fn write_field(&mut self, field: &str, value: &Self) {
        let path = AccessPath::root().field(field);
        self.concrete.assign_weak(&path, value.concrete.clone());
        self.from_params.join_with(&value.from_params);
    }
}

/// Append `suffix` to every tip path of a provenance tree.
fn extend_input_paths(provenance: &TitoTree, suffix: &AccessPath) -> TitoTree {
    provenance.fold_tips(TitoTree::bottom(), |mut acc, path, breadcrumbs| {
        acc.assign_weak(
            &path.concat(suffix),
            TitoTree::create_leaf(breadcrumbs.clone()),
        );
        acc
    })
}

/// Model a call site dispatches to: the join over the static target and
/// all its overriders. Targets with neither a body nor a model
/// contribute the pessimistic obscure summary.
fn resolve_call_model(
    context: &AnalysisContext<'_>,
    callee: &Callable,
    argument_count: usize,
) -> Model {
    let mut joined = Model::bottom();
    for target in context.facts.dispatch_targets(callee) {
        if let Some(model) = context.models.get(&target) {
            joined.join_with(model.value());
        } else if !context.facts.contains(&target) {
            joined.join_with(&Model::obscure(argument_count));
        }
    }
    joined
}

/// Mutable state of one body walk: the operand environment plus the
/// candidate model and issues accumulated so far.
struct BodyWalk {
    env: FxHashMap<Operand, LocalTaint>,
    candidate: Model,
    issues: Vec<Issue>,
}

impl BodyWalk {
    fn new(parameter_count: usize) -> Self {
        let mut env = FxHashMap::default();
        for parameter in 0..parameter_count {
            env.insert(
                Operand::Parameter(parameter),
                LocalTaint::for_parameter(parameter),
            );
        }
        BodyWalk {
            env,
            candidate: Model::new(),
            issues: Vec::new(),
        }
    }

    fn apply_call(
        &mut self,
        context: &AnalysisContext<'_>,
        caller: &Callable,
        target: &Option<Operand>,
        callee: &Callable,
        arguments: &[Operand],
        location: Location,
    ) {
        let model = resolve_call_model(context, callee, arguments.len());

        // Sinks: check each argument against the callee's sink trees.
        for (parameter, sink_tree) in model.sinks().iter() {
            let argument = match arguments.get(parameter) {
                Some(argument) => argument,
                None => continue,
            };
            let taint = match self.env.get(argument) {
                Some(taint) => taint,
                None => continue,
            };

            let issues = &mut self.issues;
            sink_tree.fold_tips((), |(), sink_path, sink_element| {
                // Concrete taint at the sink path raises an issue now.
                let reaching = taint.concrete.read(sink_path);
                if !reaching.collapse(Some(context.tracker)).is_bottom() {
                    for kind in sink_element.kinds().iter() {
                        issues.push(Issue::new(
                            caller.clone(),
                            IssueKind::for_sink_kind(kind),
                            location,
                        ));
                    }
                }
            });

            // Parameter-derived taint turns the callee's sink into a
            // sink of the caller, rooted at the flowing input paths.
            for (own_parameter, provenance) in taint.from_params.iter() {
                let derived = provenance.fold_tips(TaintTree::bottom(), |acc, input_path, _| {
                    acc.join(&TaintTree::prepend(input_path, sink_tree.clone()))
                });
                self.candidate.extend_sink(own_parameter, &derived);
            }
        }

        // Return value: callee sources plus taint passing through.
        if let Some(target) = target {
            let mut returned = LocalTaint {
                concrete: model.sources().clone(),
                from_params: ParamMap::new(),
            };

            for (parameter, tito_tree) in model.tito().iter() {
                let argument = match arguments.get(parameter) {
                    Some(argument) => argument,
                    None => continue,
                };
                let taint = match self.env.get(argument) {
                    Some(taint) => taint,
                    None => continue,
                };

                tito_tree.fold_tips((), |(), input_path, breadcrumbs| {
                    // Concrete taint below the consumed input path flows
                    // to the return value, tagged with the propagation
                    // breadcrumbs.
                    let mut flowed = taint.concrete.read(input_path);
                    if !flowed.is_bottom() {
                        flowed.transform_tips(|_, mut element| {
                            for breadcrumb in breadcrumbs.iter() {
                                element.add_breadcrumb(breadcrumb.clone());
                            }
                            element
                        });
                        returned.concrete.join_with(&flowed);
                    }

                    // Provenance composes: caller input path, then the
                    // slice the callee consumes.
                    for (own_parameter, provenance) in taint.from_params.iter() {
                        let composed = provenance.fold_tips(
                            TitoTree::bottom(),
                            |mut acc, caller_path, own_breadcrumbs| {
                                let mut merged = own_breadcrumbs.clone();
                                merged.join_with(breadcrumbs);
                                acc.assign_weak(
                                    &caller_path.concat(input_path),
                                    TitoTree::create_leaf(merged),
                                );
                                acc
                            },
                        );
                        returned.from_params.extend_at(own_parameter, &composed);
                    }
                });
            }

            self.env.insert(*target, returned);
        }
    }
}

/// The interprocedural taint transfer function.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaintPropagation;

impl TaintPropagation {
    pub fn new() -> Self {
        TaintPropagation
    }
}

impl AnalysisPass for TaintPropagation {
    fn name(&self) -> &'static str {
        "taint-propagation"
    }

    fn analyze(&self, callable: &Callable, context: &AnalysisContext<'_>) -> CallableVerdict {
        let body = match context.facts.get(callable) {
            Some(body) => body,
            // Nothing to infer without a body; the model table already
            // holds whatever rules declared.
            None => {
                return CallableVerdict {
                    candidate: Model::bottom(),
                    result: AnalysisResult::default(),
                }
            }
        };

        let mut walk = BodyWalk::new(body.parameter_count);

        for instruction in &body.instructions {
            match instruction {
                FlowInstruction::Call {
                    target,
                    callee,
                    arguments,
                    location,
                } => {
                    walk.apply_call(context, callable, target, callee, arguments, *location);
                }
                FlowInstruction::ReadField {
                    target,
                    object,
                    field,
                    ..
                } => {
                    let read = walk
                        .env
                        .get(object)
                        .map(|taint| taint.read_field(field))
                        .unwrap_or_default();
                    walk.env.insert(*target, read);
                }
                FlowInstruction::WriteField {
                    object,
                    field,
                    value,
                    ..
                } => {
                    let value_taint = walk.env.get(value).cloned().unwrap_or_default();
                    walk.env
                        .entry(*object)
                        .or_default()
                        .write_field(field, &value_taint);
                }
                FlowInstruction::Return { value, .. } => {
                    if let Some(taint) = walk.env.get(value) {
                        walk.candidate.extend_sources(&taint.concrete);
                        walk.candidate.extend_tito_map(&taint.from_params);
                    }
                }
            }
        }

        debug!(
            callable = %callable,
            issues = walk.issues.len(),
            "analyzed callable body"
        );

        CallableVerdict {
            candidate: walk.candidate,
            result: AnalysisResult::new(walk.issues),
        }
    }
}
