//! Deterministic pattern matching for policy keys
//!
//! A policy table is a small ordered list of `(pattern, policy)` pairs.
//! Exact keys always win; among namespace patterns the longest prefix wins,
//! ties broken by insertion order.

use std::fmt;

use tabmesh_core::{MeshError, MeshResult};

/// Policy key
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventPattern {
    /// Matches one type exactly, e.g. `cursor:move`
    Exact(String),
    /// Matches every type under a namespace, e.g. `debug:*` → `Namespace("debug")`
    Namespace(String),
}

impl EventPattern {
    /// Parse `ns:*` into a namespace pattern, anything else into an exact key
    pub fn parse(pattern: &str) -> MeshResult<Self> {
        if pattern.is_empty() {
            return Err(MeshError::InvalidPattern("empty pattern".into()));
        }
        match pattern.strip_suffix(":*") {
            Some("") => Err(MeshError::InvalidPattern(pattern.to_string())),
            Some(ns) if ns.contains('*') => Err(MeshError::InvalidPattern(pattern.to_string())),
            Some(ns) => Ok(EventPattern::Namespace(ns.to_string())),
            None if pattern.contains('*') => Err(MeshError::InvalidPattern(pattern.to_string())),
            None => Ok(EventPattern::Exact(pattern.to_string())),
        }
    }

    pub fn exact(key: impl Into<String>) -> Self {
        EventPattern::Exact(key.into())
    }

    pub fn namespace(ns: impl Into<String>) -> Self {
        EventPattern::Namespace(ns.into())
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            EventPattern::Exact(exact) => exact == key,
            EventPattern::Namespace(ns) => key
                .strip_prefix(ns.as_str())
                .is_some_and(|rest| rest.starts_with(':')),
        }
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, EventPattern::Exact(_))
    }
}

impl fmt::Display for EventPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventPattern::Exact(key) => f.write_str(key),
            EventPattern::Namespace(ns) => write!(f, "{}:*", ns),
        }
    }
}

/// Ordered list of pattern/policy pairs
#[derive(Clone, Debug)]
pub struct PolicyTable<P> {
    entries: Vec<(EventPattern, P)>,
}

impl<P> Default for PolicyTable<P> {
    fn default() -> Self {
        PolicyTable {
            entries: Vec::new(),
        }
    }
}

impl<P> PolicyTable<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the policy for `pattern`
    pub fn insert(&mut self, pattern: EventPattern, policy: P) {
        if let Some(entry) = self.entries.iter_mut().find(|(p, _)| *p == pattern) {
            entry.1 = policy;
        } else {
            self.entries.push((pattern, policy));
        }
    }

    pub fn with(mut self, pattern: EventPattern, policy: P) -> Self {
        self.insert(pattern, policy);
        self
    }

    pub fn remove(&mut self, pattern: &EventPattern) -> Option<P> {
        let index = self.entries.iter().position(|(p, _)| p == pattern)?;
        Some(self.entries.remove(index).1)
    }

    pub fn exact(&self, key: &str) -> Option<&P> {
        self.entries
            .iter()
            .find(|(p, _)| p.is_exact() && p.matches(key))
            .map(|(_, policy)| policy)
    }

    pub fn wildcard(&self, key: &str) -> Option<&P> {
        let mut best: Option<(usize, &P)> = None;
        for (pattern, policy) in &self.entries {
            if let EventPattern::Namespace(ns) = pattern {
                if pattern.matches(key) && best.map_or(true, |(len, _)| ns.len() > len) {
                    best = Some((ns.len(), policy));
                }
            }
        }
        best.map(|(_, policy)| policy)
    }

    /// Exact key, then the most specific namespace
    pub fn lookup(&self, key: &str) -> Option<&P> {
        self.exact(key).or_else(|| self.wildcard(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &(EventPattern, P)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
