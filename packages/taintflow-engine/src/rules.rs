/*
 * User taint rules
 *
 * Rules declare what the engine cannot infer: which callables produce
 * taint, which parameters must never receive it, and which callables
 * pass taint through or must not be analyzed at all. Rule ingestion is
 * forgiving by design: a malformed rule is reported as a `ModelError`
 * for its callable and skipped, never aborting the run.
 */

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use taintflow_domains::AbstractDomain;
use taintflow_domains::AccessPath;

use crate::errors::ModelError;
use crate::facts::{Callable, FactStore};
use crate::model::{tito_passthrough, Mode, Model, TaintElement, TaintKind, TaintTree};

/// One user-declared fact about a callable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum TaintRule {
    /// The callable returns taint of `kind`, optionally under a path of
    /// the return value.
    Source {
        callable: Callable,
        kind: String,
        #[serde(default)]
        path: Option<AccessPath>,
    },
    /// Taint of `kind` must not reach `parameter`.
    Sink {
        callable: Callable,
        parameter: usize,
        kind: String,
        #[serde(default)]
        path: Option<AccessPath>,
    },
    /// Taint on `parameter` flows through to the return value.
    Passthrough { callable: Callable, parameter: usize },
    /// The callable has no analyzable body; summarize pessimistically.
    Obscure {
        callable: Callable,
        parameter_count: usize,
    },
    /// The callable's body must not be analyzed; its declared rules are
    /// its final model.
    SkipAnalysis { callable: Callable },
}

impl TaintRule {
    pub fn callable(&self) -> &Callable {
        match self {
            TaintRule::Source { callable, .. }
            | TaintRule::Sink { callable, .. }
            | TaintRule::Passthrough { callable, .. }
            | TaintRule::Obscure { callable, .. }
            | TaintRule::SkipAnalysis { callable } => callable,
        }
    }
}

/// Kind names in angle brackets are reserved for the engine.
fn validate_kind(kind: &str) -> std::result::Result<TaintKind, String> {
    if kind.is_empty() {
        return Err("kind name is empty".to_string());
    }
    if kind.starts_with('<') {
        return Err(format!("kind name `{}` is reserved", kind));
    }
    Ok(TaintKind::new(kind))
}

/// Check a parameter index against the registered body, when one exists.
/// Callables without bodies (library models) accept any index.
fn validate_parameter(
    facts: &FactStore,
    callable: &Callable,
    parameter: usize,
) -> std::result::Result<(), String> {
    if let Some(body) = facts.get(callable) {
        if parameter >= body.parameter_count {
            return Err(format!(
                "parameter index {} out of range for `{}` with {} parameters",
                parameter, callable, body.parameter_count
            ));
        }
    }
    Ok(())
}

fn leaf_at(path: &Option<AccessPath>, element: TaintElement) -> TaintTree {
    let leaf = TaintTree::create_leaf(element);
    match path {
        Some(path) if !path.is_empty() => TaintTree::prepend(path, leaf),
        _ => leaf,
    }
}

/// Turn rules into per-callable starting models.
///
/// Returns the model table plus every rule that had to be skipped. Rules
/// for the same callable are joined, so `Source` + `SkipAnalysis`
/// declarations compose into one model.
pub fn build_initial_models(
    rules: &[TaintRule],
    facts: &FactStore,
) -> (FxHashMap<Callable, Model>, Vec<ModelError>) {
    let mut models: FxHashMap<Callable, Model> = FxHashMap::default();
    let mut errors = Vec::new();

    for rule in rules {
        let callable = rule.callable().clone();
        let outcome = apply_rule(rule, facts, models.entry(callable.clone()).or_default());
        if let Err(message) = outcome {
            warn!(callable = %callable, error = %message, "skipping malformed taint rule");
            errors.push(ModelError::new(callable.as_str(), message));
        }
    }

    models.retain(|_, model| !model.is_bottom());
    (models, errors)
}

/// Validate one rule and join its contribution into `model`.
fn apply_rule(
    rule: &TaintRule,
    facts: &FactStore,
    model: &mut Model,
) -> std::result::Result<(), String> {
    let delta = match rule {
        TaintRule::Source { kind, path, .. } => {
            let kind = validate_kind(kind)?;
            Model::new().with_sources(leaf_at(path, TaintElement::of_kind(kind)))
        }
        TaintRule::Sink {
            callable,
            parameter,
            kind,
            path,
        } => {
            let kind = validate_kind(kind)?;
            validate_parameter(facts, callable, *parameter)?;
            Model::new().with_sink(*parameter, leaf_at(path, TaintElement::of_kind(kind)))
        }
        TaintRule::Passthrough {
            callable,
            parameter,
        } => {
            validate_parameter(facts, callable, *parameter)?;
            Model::new().with_tito(*parameter, tito_passthrough(&[]))
        }
        TaintRule::Obscure {
            parameter_count, ..
        } => Model::obscure(*parameter_count),
        TaintRule::SkipAnalysis { .. } => Model::new().with_mode(Mode::SkipAnalysis),
    };
    model.join_with(&delta);
    Ok(())
}

/// Convenience constructors used by front ends and tests.
impl TaintRule {
    pub fn source(callable: impl Into<Callable>, kind: impl Into<String>) -> Self {
        TaintRule::Source {
            callable: callable.into(),
            kind: kind.into(),
            path: None,
        }
    }

    pub fn sink(
        callable: impl Into<Callable>,
        parameter: usize,
        kind: impl Into<String>,
    ) -> Self {
        TaintRule::Sink {
            callable: callable.into(),
            parameter,
            kind: kind.into(),
            path: None,
        }
    }

    pub fn passthrough(callable: impl Into<Callable>, parameter: usize) -> Self {
        TaintRule::Passthrough {
            callable: callable.into(),
            parameter,
        }
    }

    pub fn obscure(callable: impl Into<Callable>, parameter_count: usize) -> Self {
        TaintRule::Obscure {
            callable: callable.into(),
            parameter_count,
        }
    }

    pub fn skip_analysis(callable: impl Into<Callable>) -> Self {
        TaintRule::SkipAnalysis {
            callable: callable.into(),
        }
    }
}
