//! Compaction digest
//!
//! Before the host summarizes a conversation, the graph is searched with a
//! query built from the compaction context and the results are laid out as a
//! tiered digest so that decisions survive the summary:
//!
//!   header
//!   project section   (decisions / active / background / entities)
//!   user section      (same layout, only with user scope)
//!   footer
//!
//! The summary the host eventually produces is written back as a
//! `session snapshot` episode, which the injection primer picks up in the
//! next session.

use super::budget::{char_len, select_within_budget, split, split_tiers, truncate_chars};
use super::classify::FactClassifier;
use super::injection::{retrieve_scopes, SNAPSHOT_DESCRIPTION};
use super::normalize::{format_entity_line, format_fact_line, NormalizedScope};
use crate::graph::{Fact, GraphClient, SOURCE_TEXT};
use crate::MemoryConfig;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

/// Context strings that feed the query
const QUERY_SOURCES: usize = 3;

/// Query length cap in characters
pub const MAX_QUERY_CHARS: usize = 500;

const HEADER: &str = "<memory-digest>\n\
The facts below come from long-term memory. Preserve decisions and \
constraints verbatim in the summary; active work should stay recognisable.\n";

const FOOTER: &str = "\n</memory-digest>";

const SECTION_SEPARATOR: &str = "\n\n";

/// Build the search query from the first few context strings
pub fn build_query(context: &[String]) -> String {
    let joined = context
        .iter()
        .take(QUERY_SOURCES)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    truncate_chars(&joined, MAX_QUERY_CHARS).trim().to_string()
}

/// Lay out `facts` under `heading` within `budget`; empty when none fit
fn tier_block(heading: &str, facts: &[Fact], budget: usize) -> String {
    let heading_len = char_len(heading) + 1;
    if facts.is_empty() || budget <= heading_len {
        return String::new();
    }
    let lines: Vec<String> = facts.iter().map(format_fact_line).collect();
    let selected = select_within_budget(&lines, &lines, budget - heading_len);
    if selected.is_empty() {
        return String::new();
    }
    format!("{heading}\n{}", selected.join("\n"))
}

pub struct CompactionContextBuilder<'a> {
    graph: &'a dyn GraphClient,
    config: &'a MemoryConfig,
    classifier: &'a FactClassifier,
}

impl<'a> CompactionContextBuilder<'a> {
    pub fn new(
        graph: &'a dyn GraphClient,
        config: &'a MemoryConfig,
        classifier: &'a FactClassifier,
    ) -> Self {
        Self {
            graph,
            config,
            classifier,
        }
    }

    /// Digest for the compaction step, or `None` when the query is empty,
    /// both scopes come back empty, or nothing fits.
    pub async fn build(
        &self,
        context: &[String],
        project_group: &str,
        user_group: Option<&str>,
        budget: usize,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let query = build_query(context);
        if query.is_empty() {
            debug!("Empty compaction query, no digest");
            return None;
        }

        let results = retrieve_scopes(
            self.graph,
            &query,
            project_group,
            user_group,
            now,
            self.config.fact_stale_days,
        )
        .await;
        if results.is_empty() {
            debug!("No memory for compaction digest");
            return None;
        }

        let frame = char_len(HEADER) + char_len(FOOTER);
        if budget <= frame {
            return None;
        }
        let available = budget - frame;
        let (project_budget, user_budget) = match &results.user {
            Some(_) => split(available, self.config.budget.project_share),
            None => (available, 0),
        };

        let project = self.format_section("## Project", &results.project, project_budget, now);
        let user = results
            .user
            .as_ref()
            .map(|u| {
                let budget = user_budget.saturating_sub(char_len(SECTION_SEPARATOR));
                self.format_section("## User", u, budget, now)
            })
            .unwrap_or_default();

        let body: Vec<&str> = [project.as_str(), user.as_str()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect();
        if body.is_empty() {
            return None;
        }

        let digest = format!("{HEADER}{}{FOOTER}", body.join(SECTION_SEPARATOR));
        let digest = truncate_chars(&digest, budget).to_string();
        info!(
            chars = char_len(&digest),
            budget,
            "Built compaction digest"
        );
        Some(digest)
    }

    /// One scope's tiered section, cut to `budget`
    pub fn format_section(
        &self,
        heading: &str,
        scope: &NormalizedScope,
        budget: usize,
        now: DateTime<Utc>,
    ) -> String {
        let heading_len = char_len(heading) + 1;
        if scope.is_empty() || budget <= heading_len {
            return String::new();
        }
        let inner = budget - heading_len;
        let classified = self.classifier.classify(&scope.facts, now);
        let tiers = split_tiers(
            inner,
            self.config.budget.decision_share,
            self.config.budget.active_share,
        );

        let mut blocks = Vec::new();
        let mut used = 0usize;
        for (label, facts, tier_budget) in [
            ("### Decisions and constraints", &classified.decisions, tiers.decisions),
            ("### Active work", &classified.active, tiers.active),
            ("### Background", &classified.background, tiers.background),
        ] {
            let block = tier_block(label, facts, tier_budget.saturating_sub(1));
            if !block.is_empty() {
                used += char_len(&block) + 1;
                blocks.push(block);
            }
        }

        // Entities fill whatever the tiers left unused
        if !scope.entities.is_empty() {
            let leftover = inner.saturating_sub(used);
            let lines: Vec<String> = scope.entities.iter().map(format_entity_line).collect();
            let heading = "### Entities";
            if leftover > char_len(heading) + 2 {
                let selected =
                    select_within_budget(&lines, &lines, leftover - char_len(heading) - 2);
                if !selected.is_empty() {
                    blocks.push(format!("{heading}\n{}", selected.join("\n")));
                }
            }
        }

        if blocks.is_empty() {
            return String::new();
        }
        let section = format!("{heading}\n{}", blocks.join("\n"));
        truncate_chars(&section, budget).to_string()
    }
}

/// Write a compaction summary back as a session snapshot.
///
/// Returns whether the write went through; failures are logged only.
pub async fn persist_summary(
    graph: &dyn GraphClient,
    summary: &str,
    group_id: &str,
    now: DateTime<Utc>,
) -> bool {
    let summary = summary.trim();
    if summary.is_empty() {
        return false;
    }
    let name = format!("Session snapshot {}", now.format("%Y-%m-%d %H:%M:%S"));
    match graph
        .add_episode(&name, summary, group_id, SOURCE_TEXT, SNAPSHOT_DESCRIPTION)
        .await
    {
        Ok(()) => {
            info!(group_id, chars = char_len(summary), "Persisted compaction summary");
            true
        }
        Err(e) => {
            warn!("Persisting compaction summary failed: {}", e);
            false
        }
    }
}
