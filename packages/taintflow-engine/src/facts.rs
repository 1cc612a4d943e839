//! Analyzed-program facts
//!
//! The engine does not parse source code. A front end lowers each
//! callable into a short list of flow-relevant instructions (calls,
//! field reads/writes, returns) and registers them here. The fixpoint
//! driver and the taint transfer function consume this store and
//! nothing else.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Fully qualified callable name, e.g. `app.views.render`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Callable(pub String);

impl Callable {
    pub fn new(name: impl Into<String>) -> Self {
        Callable(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Callable {
    fn from(name: &str) -> Self {
        Callable(name.to_string())
    }
}

impl From<String> for Callable {
    fn from(name: String) -> Self {
        Callable(name)
    }
}

/// Source position of an instruction.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Location {
    pub line: u32,
    pub column: u32,
}

impl Location {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A value slot inside one callable's frame.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Operand {
    /// Formal parameter by position.
    Parameter(usize),
    /// Local temporary by index.
    Local(usize),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Parameter(i) => write!(f, "param{}", i),
            Operand::Local(i) => write!(f, "local{}", i),
        }
    }
}

/// One flow-relevant instruction inside a callable body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowInstruction {
    /// `target = callee(arguments...)`; `target` is absent for calls in
    /// statement position.
    Call {
        target: Option<Operand>,
        callee: Callable,
        arguments: Vec<Operand>,
        location: Location,
    },
    /// `target = object.field`
    ReadField {
        target: Operand,
        object: Operand,
        field: String,
        location: Location,
    },
    /// `object.field = value`
    WriteField {
        object: Operand,
        field: String,
        value: Operand,
        location: Location,
    },
    /// `return value`
    Return { value: Operand, location: Location },
}

impl FlowInstruction {
    pub fn location(&self) -> Location {
        match self {
            FlowInstruction::Call { location, .. }
            | FlowInstruction::ReadField { location, .. }
            | FlowInstruction::WriteField { location, .. }
            | FlowInstruction::Return { location, .. } => *location,
        }
    }
}

/// Everything the engine knows about one callable's body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallableFacts {
    pub callable: Callable,
    pub parameter_count: usize,
    pub instructions: Vec<FlowInstruction>,
}

impl CallableFacts {
    pub fn new(callable: impl Into<Callable>, parameter_count: usize) -> Self {
        Self {
            callable: callable.into(),
            parameter_count,
            instructions: Vec::new(),
        }
    }

    pub fn push(&mut self, instruction: FlowInstruction) -> &mut Self {
        self.instructions.push(instruction);
        self
    }

    /// Callees referenced by this body, in program order with duplicates.
    pub fn callees(&self) -> impl Iterator<Item = &Callable> {
        self.instructions.iter().filter_map(|inst| match inst {
            FlowInstruction::Call { callee, .. } => Some(callee),
            _ => None,
        })
    }
}

/// Registry of callable bodies plus the override relation.
///
/// Ordered maps keep iteration and serialization deterministic; the
/// snapshot layer hashes the serialized store, so the same program must
/// always produce the same bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FactStore {
    bodies: BTreeMap<Callable, CallableFacts>,
    /// base -> callables overriding it (direct edges only).
    overrides: BTreeMap<Callable, BTreeSet<Callable>>,
}

impl FactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, facts: CallableFacts) {
        self.bodies.insert(facts.callable.clone(), facts);
    }

    pub fn get(&self, callable: &Callable) -> Option<&CallableFacts> {
        self.bodies.get(callable)
    }

    pub fn contains(&self, callable: &Callable) -> bool {
        self.bodies.contains_key(callable)
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    /// All registered callables in deterministic order.
    pub fn callables(&self) -> Vec<Callable> {
        self.bodies.keys().cloned().collect()
    }

    /// Record that `overriding` overrides `base`. Call sites targeting
    /// `base` must account for `overriding` as well.
    pub fn record_override(&mut self, base: impl Into<Callable>, overriding: impl Into<Callable>) {
        self.overrides
            .entry(base.into())
            .or_default()
            .insert(overriding.into());
    }

    /// Transitive override closure of `base`, excluding `base` itself.
    pub fn overriders_of(&self, base: &Callable) -> Vec<Callable> {
        let mut seen = BTreeSet::new();
        let mut queue = vec![base.clone()];
        while let Some(current) = queue.pop() {
            if let Some(direct) = self.overrides.get(&current) {
                for overriding in direct {
                    if seen.insert(overriding.clone()) {
                        queue.push(overriding.clone());
                    }
                }
            }
        }
        seen.into_iter().collect()
    }

    /// All call targets a call site on `callee` can dispatch to.
    pub fn dispatch_targets(&self, callee: &Callable) -> Vec<Callable> {
        let mut targets = vec![callee.clone()];
        targets.extend(self.overriders_of(callee));
        targets
    }

    /// Every (caller, possible target) pair, overrides expanded.
    pub fn call_edges(&self) -> Vec<(Callable, Callable)> {
        let mut edges = Vec::new();
        for facts in self.bodies.values() {
            for callee in facts.callees() {
                for target in self.dispatch_targets(callee) {
                    edges.push((facts.callable.clone(), target));
                }
            }
        }
        edges.sort();
        edges.dedup();
        edges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(callee: &str, args: Vec<Operand>, line: u32) -> FlowInstruction {
        FlowInstruction::Call {
            target: None,
            callee: Callable::new(callee),
            arguments: args,
            location: Location::new(line, 0),
        }
    }

    #[test]
    fn test_callees_in_program_order() {
        let mut facts = CallableFacts::new("main", 0);
        facts.push(call("helper", vec![], 1));
        facts.push(call("logger", vec![], 2));
        facts.push(call("helper", vec![], 3));

        let callees: Vec<_> = facts.callees().map(|c| c.as_str().to_string()).collect();
        assert_eq!(callees, vec!["helper", "logger", "helper"]);
    }

    #[test]
    fn test_override_closure_is_transitive() {
        let mut store = FactStore::new();
        store.record_override(Callable::new("Base.run"), Callable::new("Mid.run"));
        store.record_override(Callable::new("Mid.run"), Callable::new("Leaf.run"));

        let overriders = store.overriders_of(&Callable::new("Base.run"));
        assert_eq!(
            overriders,
            vec![Callable::new("Leaf.run"), Callable::new("Mid.run")]
        );
        assert_eq!(
            store.dispatch_targets(&Callable::new("Base.run")).len(),
            3
        );
    }

    #[test]
    fn test_call_edges_expand_overrides() {
        let mut store = FactStore::new();
        let mut main = CallableFacts::new("main", 0);
        main.push(call("Base.run", vec![], 1));
        store.insert(main);
        store.record_override(Callable::new("Base.run"), Callable::new("Leaf.run"));

        let edges = store.call_edges();
        assert!(edges.contains(&(Callable::new("main"), Callable::new("Base.run"))));
        assert!(edges.contains(&(Callable::new("main"), Callable::new("Leaf.run"))));
    }

    #[test]
    fn test_callables_sorted() {
        let mut store = FactStore::new();
        store.insert(CallableFacts::new("zeta", 0));
        store.insert(CallableFacts::new("alpha", 1));
        assert_eq!(
            store.callables(),
            vec![Callable::new("alpha"), Callable::new("zeta")]
        );
    }
}
