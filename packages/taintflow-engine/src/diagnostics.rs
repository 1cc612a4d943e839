/*
 * Diagnostics
 *
 * What the analysis reports to users: one issue per concrete flow into
 * a sink, attached to the callable whose body performs the call. Issues
 * are value types with a total order so result sets stay deterministic
 * regardless of worker scheduling.
 */

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::facts::{Callable, Location};
use crate::model::TaintKind;

/// What went wrong at a flow.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IssueKind {
    /// Concrete taint reached a callable the engine cannot see into.
    ObscureFlow,
    /// Concrete taint reached a declared sink of the named kind.
    FlowToSink(TaintKind),
}

impl IssueKind {
    /// Classify a sink kind hit by concrete taint.
    pub fn for_sink_kind(kind: &TaintKind) -> Self {
        if kind.is_obscure() {
            IssueKind::ObscureFlow
        } else {
            IssueKind::FlowToSink(kind.clone())
        }
    }
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssueKind::ObscureFlow => write!(f, "taint flows into obscure callable"),
            IssueKind::FlowToSink(kind) => write!(f, "taint flows into {} sink", kind),
        }
    }
}

/// One reported flow.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Issue {
    pub callable: Callable,
    pub kind: IssueKind,
    pub location: Location,
}

impl Issue {
    pub fn new(callable: impl Into<Callable>, kind: IssueKind, location: Location) -> Self {
        Self {
            callable: callable.into(),
            kind,
            location,
        }
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.callable, self.location, self.kind)
    }
}

/// Per-callable analysis output for one fixpoint run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    issues: Vec<Issue>,
}

impl AnalysisResult {
    pub fn new(mut issues: Vec<Issue>) -> Self {
        issues.sort();
        issues.dedup();
        Self { issues }
    }

    pub fn issues(&self) -> &[Issue] {
        &self.issues
    }

    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_display_names_sink_kind() {
        let issue = Issue::new(
            Callable::new("app.views.render"),
            IssueKind::FlowToSink(TaintKind::new("Sql")),
            Location::new(14, 8),
        );
        let text = format!("{}", issue);
        assert!(text.contains("app.views.render"));
        assert!(text.contains("14:8"));
        assert!(text.contains("Sql"));
    }

    #[test]
    fn test_obscure_sink_kind_classifies_as_obscure_flow() {
        assert_eq!(
            IssueKind::for_sink_kind(&TaintKind::obscure()),
            IssueKind::ObscureFlow
        );
        assert_eq!(
            IssueKind::for_sink_kind(&TaintKind::new("Log")),
            IssueKind::FlowToSink(TaintKind::new("Log"))
        );
    }

    #[test]
    fn test_result_sorts_and_dedups() {
        let late = Issue::new("m", IssueKind::ObscureFlow, Location::new(9, 0));
        let early = Issue::new("m", IssueKind::ObscureFlow, Location::new(2, 0));
        let result = AnalysisResult::new(vec![late.clone(), early.clone(), late.clone()]);
        assert_eq!(result.issues(), &[early, late]);
    }
}
