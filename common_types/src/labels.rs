// Copyright 2022 CeresDB Project Authors. Licensed under Apache-2.0.

//! Label sets and matchers.
//!
//! A [Labels] value is the identity of a time series and the join key when
//! merging series across backends. The canonical form is sorted by label
//! name; all comparisons assume it.

use std::fmt;

use serde_derive::{Deserialize, Serialize};

/// A single name/value pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new<N: Into<String>, V: Into<String>>(name: N, value: V) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// An ordered label set.
///
/// Total order is lexicographic pair by pair, then by length, which the
/// derived `Ord` over the inner vector provides directly.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Labels(Vec<Label>);

impl Labels {
    /// Build a label set from `labels`, sorting into canonical form.
    pub fn new(mut labels: Vec<Label>) -> Self {
        labels.sort_unstable();
        Self(labels)
    }

    pub fn builder() -> LabelsBuilder {
        LabelsBuilder::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    /// Value of the label called `name`, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|label| label.name == name)
            .map(|label| label.value.as_str())
    }
}

impl From<Vec<(&str, &str)>> for Labels {
    fn from(pairs: Vec<(&str, &str)>) -> Self {
        Self::new(
            pairs
                .into_iter()
                .map(|(name, value)| Label::new(name, value))
                .collect(),
        )
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (idx, label) in self.0.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}=\"{}\"", label.name, label.value)?;
        }
        write!(f, "}}")
    }
}

/// Builder collecting labels into canonical form.
///
/// Setting the same name twice keeps the last value.
#[derive(Debug, Default)]
#[must_use]
pub struct LabelsBuilder {
    labels: Vec<Label>,
}

impl LabelsBuilder {
    pub fn set<N: Into<String>, V: Into<String>>(mut self, name: N, value: V) -> Self {
        let label = Label::new(name, value);
        match self.labels.iter_mut().find(|v| v.name == label.name) {
            Some(existing) => existing.value = label.value,
            None => self.labels.push(label),
        }
        self
    }

    pub fn build(self) -> Labels {
        Labels::new(self.labels)
    }
}

/// Matching operator of a [Matcher].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchOp {
    Equal,
    NotEqual,
    Regex,
    NotRegex,
}

impl fmt::Display for MatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            MatchOp::Equal => "=",
            MatchOp::NotEqual => "!=",
            MatchOp::Regex => "=~",
            MatchOp::NotRegex => "!~",
        };
        write!(f, "{}", op)
    }
}

/// A label filter handed through to backends untouched; evaluation happens
/// inside the backend query engines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Matcher {
    pub op: MatchOp,
    pub name: String,
    pub value: String,
}

impl Matcher {
    pub fn new<N: Into<String>, V: Into<String>>(op: MatchOp, name: N, value: V) -> Self {
        Self {
            op,
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}\"{}\"", self.name, self.op, self.value)
    }
}
