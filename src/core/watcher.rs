//! Pattern watchers for termination rules
//!
//! A watcher tracks which of its configured substrings have shown up in the
//! device log. It is satisfied once every pattern has been seen at least once,
//! in any order and across any number of lines, and reports that transition
//! exactly once.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which termination rule a watcher enforces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleKind {
    /// Abort the session
    Abort,
    /// End the session normally
    End,
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Abort => write!(f, "abortOn"),
            Self::End => write!(f, "endOn"),
        }
    }
}

/// Tracks a set of required substrings across log lines
#[derive(Debug, Clone)]
pub struct PatternWatcher {
    kind: RuleKind,
    patterns: Vec<String>,
    seen: Vec<bool>,
    fired: bool,
}

impl PatternWatcher {
    /// Create a watcher, or `None` when no patterns are configured.
    ///
    /// An empty rule is disabled, never trivially satisfied. Duplicate
    /// patterns are collapsed.
    pub fn new(kind: RuleKind, patterns: &[String]) -> Option<Self> {
        let mut unique: Vec<String> = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            if !unique.contains(pattern) {
                unique.push(pattern.clone());
            }
        }

        if unique.is_empty() {
            return None;
        }

        let seen = vec![false; unique.len()];
        Some(Self {
            kind,
            patterns: unique,
            seen,
            fired: false,
        })
    }

    /// Rule this watcher enforces
    pub fn kind(&self) -> RuleKind {
        self.kind
    }

    /// Configured patterns, in configuration order
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Configured patterns contained in `line`, seen before or not
    pub fn matches<'a>(&'a self, line: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.patterns
            .iter()
            .filter(move |p| line.contains(p.as_str()))
            .map(String::as_str)
    }

    /// Feed one line. Returns `true` only on the line where the last missing
    /// pattern first appears.
    pub fn observe(&mut self, line: &str) -> bool {
        if self.fired {
            return false;
        }

        for (pattern, seen) in self.patterns.iter().zip(self.seen.iter_mut()) {
            if !*seen && line.contains(pattern.as_str()) {
                *seen = true;
            }
        }

        if self.is_satisfied() {
            self.fired = true;
            return true;
        }
        false
    }

    /// Every pattern has been seen
    pub fn is_satisfied(&self) -> bool {
        self.seen.iter().all(|s| *s)
    }

    /// Patterns not seen yet
    pub fn missing(&self) -> Vec<&str> {
        self.patterns
            .iter()
            .zip(&self.seen)
            .filter(|(_, seen)| !**seen)
            .map(|(p, _)| p.as_str())
            .collect()
    }
}
