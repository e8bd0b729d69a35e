//! Subscription filter policies.
//!
//! A policy is a conjunction of per-attribute predicates. Evaluation is a pure
//! function of the event and the policy, independent of any topic.
//!
//! Policies deserialize from the declarative form used in configuration:
//!
//! ```json
//! { "commentType": { "allowlist": ["ProcessDelete"] },
//!   "eventName":   { "prefix": "ObjectCreated" } }
//! ```

use crate::event::ImageEvent;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Condition on a single attribute value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// Value equals the string
    Exact(String),
    /// Value starts with the string
    Prefix(String),
    /// Value is one of the listed strings
    Allowlist(Vec<String>),
}

impl Predicate {
    pub fn evaluate(&self, value: &str) -> bool {
        match self {
            Predicate::Exact(expected) => value == expected,
            Predicate::Prefix(prefix) => value.starts_with(prefix.as_str()),
            Predicate::Allowlist(allowed) => allowed.iter().any(|a| a == value),
        }
    }
}

/// Attribute filter attached to a subscription
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterPolicy {
    predicates: BTreeMap<String, Predicate>,
}

impl FilterPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `attribute` to satisfy `predicate`
    pub fn with(mut self, attribute: impl Into<String>, predicate: Predicate) -> Self {
        self.predicates.insert(attribute.into(), predicate);
        self
    }

    pub fn exact(self, attribute: impl Into<String>, value: impl Into<String>) -> Self {
        self.with(attribute, Predicate::Exact(value.into()))
    }

    pub fn prefix(self, attribute: impl Into<String>, prefix: impl Into<String>) -> Self {
        self.with(attribute, Predicate::Prefix(prefix.into()))
    }

    pub fn allowlist<I, S>(self, attribute: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with(
            attribute,
            Predicate::Allowlist(values.into_iter().map(Into::into).collect()),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Attributes referenced by the policy
    pub fn attributes(&self) -> impl Iterator<Item = &str> {
        self.predicates.keys().map(|k| k.as_str())
    }
}

/// Whether `event` satisfies every predicate of `filter`.
///
/// A referenced attribute that is absent from the event fails the match; an
/// empty policy matches everything.
pub fn matches(event: &ImageEvent, filter: &FilterPolicy) -> bool {
    filter.predicates.iter().all(|(attribute, predicate)| {
        event
            .attribute(attribute)
            .map_or(false, |value| predicate.evaluate(value))
    })
}
