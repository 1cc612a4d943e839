//! Access paths: label sequences addressing into structured values
//!
//! Examples:
//! - `Field("name")`            → `user.name`
//! - `AnyIndex`                 → `items[*]` (unknown/dynamic index)
//! - `DictionaryKeys`           → `d[keys()]` (abstracts the key set)
//!
//! Paths order by prefix: the shorter path subsumes every extension of it.
//! `common_prefix`/`is_prefix_of` give the order used when overlapping
//! writes merge in the tree domain.

use crate::complex::ComplexElement;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One step of an access path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PathLabel {
    /// Attribute or key access with a known name: `obj.field`, `d["key"]`.
    Field(String),

    /// The key set of a dictionary, as opposed to its values.
    DictionaryKeys,

    /// Unknown or dynamic index: `arr[i]`, `arr[*]`.
    AnyIndex,
}

impl PathLabel {
    pub fn field(name: impl Into<String>) -> Self {
        Self::Field(name.into())
    }
}

impl fmt::Display for PathLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(name) => write!(f, ".{name}"),
            Self::DictionaryKeys => write!(f, "[keys()]"),
            Self::AnyIndex => write!(f, "[*]"),
        }
    }
}

/// Sequence of labels from a root to a value.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccessPath {
    labels: Vec<PathLabel>,
}

impl AccessPath {
    /// The empty path: the root itself.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn from_labels(labels: Vec<PathLabel>) -> Self {
        Self { labels }
    }

    /// Extend with a named field (builder style).
    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.labels.push(PathLabel::field(name));
        self
    }

    /// Extend with an unknown index (builder style).
    pub fn any_index(mut self) -> Self {
        self.labels.push(PathLabel::AnyIndex);
        self
    }

    /// Extend with the dictionary-keys marker (builder style).
    pub fn dictionary_keys(mut self) -> Self {
        self.labels.push(PathLabel::DictionaryKeys);
        self
    }

    pub fn push(&mut self, label: PathLabel) {
        self.labels.push(label);
    }

    pub fn labels(&self) -> &[PathLabel] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// `self` followed by `suffix`.
    pub fn concat(&self, suffix: &AccessPath) -> Self {
        let mut labels = self.labels.clone();
        labels.extend(suffix.labels.iter().cloned());
        Self { labels }
    }

    /// Prefix order: the root is a prefix of everything.
    pub fn is_prefix_of(&self, other: &AccessPath) -> bool {
        other.labels.len() >= self.labels.len()
            && self.labels.iter().zip(&other.labels).all(|(a, b)| a == b)
    }

    /// Longest shared prefix of two paths.
    pub fn common_prefix(&self, other: &AccessPath) -> Self {
        let shared = self
            .labels
            .iter()
            .zip(&other.labels)
            .take_while(|(a, b)| a == b)
            .count();
        Self {
            labels: self.labels[..shared].to_vec(),
        }
    }

    /// Keep at most the first `max_len` labels.
    pub fn truncated(&self, max_len: usize) -> Self {
        if self.labels.len() <= max_len {
            return self.clone();
        }
        Self {
            labels: self.labels[..max_len].to_vec(),
        }
    }
}

impl fmt::Display for AccessPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.labels.is_empty() {
            return write!(f, "<root>");
        }
        for label in &self.labels {
            write!(f, "{label}")?;
        }
        Ok(())
    }
}

impl ComplexElement for AccessPath {
    fn width(&self) -> usize {
        self.labels.len()
    }

    fn truncate(&self, max_width: usize) -> Self {
        self.truncated(max_width)
    }

    fn coarsest() -> Self {
        Self::root()
    }

    fn subsumes(&self, other: &Self) -> bool {
        self.is_prefix_of(other)
    }
}
