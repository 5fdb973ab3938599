//! Drift detection between injected context and the current turn

use crate::graph::GraphClient;
use std::collections::HashSet;
use tracing::{debug, warn};

/// `|A ∩ B| / |A ∪ B|`; two empty sets are identical (1.0)
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

/// Outcome of one drift check
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DriftCheck {
    /// Similarity fell below the threshold; re-inject
    Drifted { similarity: f64 },
    /// Injected context still matches the conversation
    Stable { similarity: f64 },
}

impl DriftCheck {
    pub fn is_drifted(&self) -> bool {
        matches!(self, Self::Drifted { .. })
    }
}

pub struct DriftDetector {
    threshold: f64,
    search_limit: usize,
}

impl DriftDetector {
    pub fn new(threshold: f64, search_limit: usize) -> Self {
        Self {
            threshold,
            search_limit,
        }
    }

    pub fn evaluate(
        &self,
        current: &HashSet<String>,
        last_injected: &HashSet<String>,
    ) -> DriftCheck {
        let similarity = jaccard(current, last_injected);
        if similarity < self.threshold {
            DriftCheck::Drifted { similarity }
        } else {
            DriftCheck::Stable { similarity }
        }
    }

    /// Run a small fact search for `query` and compare against the last
    /// injection. `None` when the search fails; the turn is skipped.
    pub async fn check(
        &self,
        graph: &dyn GraphClient,
        query: &str,
        group_ids: &[String],
        last_injected: &HashSet<String>,
    ) -> Option<DriftCheck> {
        let facts = match graph.search_facts(query, group_ids, self.search_limit).await {
            Ok(facts) => facts,
            Err(e) => {
                warn!("Drift check search failed: {}", e);
                return None;
            }
        };
        let current: HashSet<String> = facts.into_iter().map(|f| f.id).collect();
        let check = self.evaluate(&current, last_injected);
        debug!(
            current = current.len(),
            last = last_injected.len(),
            ?check,
            "Drift check"
        );
        Some(check)
    }
}
