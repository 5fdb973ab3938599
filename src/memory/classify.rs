//! Fact tiers for the compaction digest

use crate::graph::Fact;
use crate::rules::KeywordRule;
use chrono::{DateTime, Duration, Utc};

/// How far back a validity start still counts as active work
pub const ACTIVE_WINDOW_DAYS: i64 = 7;

/// Facts partitioned into decision, active, and background tiers
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassifiedFacts {
    pub decisions: Vec<Fact>,
    pub active: Vec<Fact>,
    pub background: Vec<Fact>,
}

impl ClassifiedFacts {
    pub fn len(&self) -> usize {
        self.decisions.len() + self.active.len() + self.background.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keyword and recency heuristics
pub struct FactClassifier {
    decision_rule: KeywordRule,
    active_window: Duration,
}

impl FactClassifier {
    pub fn new<S: AsRef<str>>(decision_keywords: &[S]) -> Self {
        Self {
            decision_rule: KeywordRule::new(decision_keywords),
            active_window: Duration::days(ACTIVE_WINDOW_DAYS),
        }
    }

    /// Decision keywords win over recency; everything else is background.
    /// Each fact lands in exactly one tier and keeps its relative order.
    pub fn classify(&self, facts: &[Fact], now: DateTime<Utc>) -> ClassifiedFacts {
        let mut classified = ClassifiedFacts::default();
        for fact in facts {
            if self.decision_rule.is_match(&fact.text) {
                classified.decisions.push(fact.clone());
            } else if self.is_recent(fact, now) {
                classified.active.push(fact.clone());
            } else {
                classified.background.push(fact.clone());
            }
        }
        classified
    }

    fn is_recent(&self, fact: &Fact, now: DateTime<Utc>) -> bool {
        fact.valid_from()
            .is_some_and(|start| start <= now && now - start <= self.active_window)
    }
}
