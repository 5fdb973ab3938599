//! Memory retrieval and injection
//!
//! Searches the project scope (and optionally the user scope) concurrently,
//! normalizes each scope, and assembles a context block that fits a
//! character budget:
//!
//!   [session snapshot primer]   only with user scope, at most 1200 chars
//!   [project memory]            70% of what remains (100% without user scope)
//!   [user memory]               30% of what remains
//!
//! The ids of every fact that made it into the text are returned; the
//! project-scope ids become the drift baseline.

use super::budget::{char_len, select_within_budget, split, truncate_chars};
use super::normalize::{format_entity_line, format_fact_line, normalize_scope, NormalizedScope};
use crate::graph::{EntityNode, Episode, Fact, GraphClient};
use crate::MemoryConfig;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::{debug, info, warn};

pub const PROJECT_FACT_LIMIT: usize = 50;
pub const PROJECT_ENTITY_LIMIT: usize = 30;
pub const USER_FACT_LIMIT: usize = 20;
pub const USER_ENTITY_LIMIT: usize = 10;

/// Upper bound on the session snapshot primer
pub const PRIMER_MAX_CHARS: usize = 1200;

/// How many recent episodes to scan for a snapshot
const SNAPSHOT_LOOKBACK: usize = 10;

/// Source description marking an episode as a session snapshot
pub const SNAPSHOT_DESCRIPTION: &str = "session snapshot";

const SECTION_SEPARATOR: &str = "\n\n";

const PROJECT_PREAMBLE: &str = "## Project memory\n\
Facts recalled from long-term memory for this project. Treat them as background \
knowledge; anything said in the current conversation takes precedence.\n";

const USER_PREAMBLE: &str = "## User memory\n\
Preferences and habits recalled for this user across projects.\n";

const PRIMER_HEADING: &str = "## Last session snapshot\n";

/// Context produced by one retrieval, ready to hand to the host.
///
/// Only the retrieval pipeline constructs this, so holding one proves the
/// retrieval step ran for the turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Injection {
    text: String,
    fact_ids: Vec<String>,
    project_fact_ids: Vec<String>,
}

impl Injection {
    pub(crate) fn new(text: String, fact_ids: Vec<String>) -> Self {
        Self {
            text,
            project_fact_ids: fact_ids.clone(),
            fact_ids,
        }
    }

    pub(crate) fn with_project_fact_ids(mut self, ids: Vec<String>) -> Self {
        self.project_fact_ids = ids;
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn fact_ids(&self) -> &[String] {
        &self.fact_ids
    }

    /// Project-scope fact ids, the baseline for drift checks
    pub fn project_fact_ids(&self) -> &[String] {
        &self.project_fact_ids
    }
}

/// Normalized results for both scopes
#[derive(Debug, Clone, Default)]
pub struct ScopedResults {
    pub project: NormalizedScope,
    pub user: Option<NormalizedScope>,
}

impl ScopedResults {
    pub fn is_empty(&self) -> bool {
        self.project.is_empty() && self.user.as_ref().is_none_or(|u| u.is_empty())
    }
}

/// Search caps for one scope
#[derive(Debug, Clone, Copy)]
struct ScopeLimits {
    facts: usize,
    entities: usize,
}

const PROJECT_LIMITS: ScopeLimits = ScopeLimits {
    facts: PROJECT_FACT_LIMIT,
    entities: PROJECT_ENTITY_LIMIT,
};

const USER_LIMITS: ScopeLimits = ScopeLimits {
    facts: USER_FACT_LIMIT,
    entities: USER_ENTITY_LIMIT,
};

async fn search_scope(
    graph: &dyn GraphClient,
    query: &str,
    group_id: &str,
    limits: ScopeLimits,
) -> (Vec<Fact>, Vec<EntityNode>) {
    let group_ids = [group_id.to_string()];
    let (facts, entities) = futures::join!(
        graph.search_facts(query, &group_ids, limits.facts),
        graph.search_entities(query, &group_ids, limits.entities),
    );
    let facts = facts.unwrap_or_else(|e| {
        warn!("Fact search in {} failed: {}", group_id, e);
        Vec::new()
    });
    let entities = entities.unwrap_or_else(|e| {
        warn!("Entity search in {} failed: {}", group_id, e);
        Vec::new()
    });
    (facts, entities)
}

/// Search both scopes concurrently and normalize each one.
///
/// The user scope is only searched when `user_group` is set.
pub async fn retrieve_scopes(
    graph: &dyn GraphClient,
    query: &str,
    project_group: &str,
    user_group: Option<&str>,
    now: DateTime<Utc>,
    stale_days: i64,
) -> ScopedResults {
    let project = search_scope(graph, query, project_group, PROJECT_LIMITS);
    let user = async {
        match user_group {
            Some(group) => Some(search_scope(graph, query, group, USER_LIMITS).await),
            None => None,
        }
    };
    let ((project_facts, project_entities), user) = futures::join!(project, user);

    ScopedResults {
        project: normalize_scope(project_facts, project_entities, now, stale_days),
        user: user.map(|(facts, entities)| normalize_scope(facts, entities, now, stale_days)),
    }
}

/// Format one scope under `preamble` within `budget` characters.
///
/// Facts are taken in priority order while they fit; entities fill what is
/// left. Returns the block and the ids of the facts it contains; an empty
/// block when nothing fits.
pub fn format_scope_block(
    preamble: &str,
    scope: &NormalizedScope,
    budget: usize,
) -> (String, Vec<String>) {
    const FACTS_HEADING: &str = "### Facts\n";
    const ENTITIES_HEADING: &str = "### Entities\n";

    let overhead = char_len(preamble);
    if scope.is_empty() || budget <= overhead {
        return (String::new(), Vec::new());
    }
    let mut remaining = budget - overhead;
    let mut body = String::new();
    let mut fact_ids = Vec::new();

    if !scope.facts.is_empty() && remaining > char_len(FACTS_HEADING) {
        let lines: Vec<String> = scope.facts.iter().map(format_fact_line).collect();
        let selected =
            select_within_budget(&lines, &scope.facts, remaining - char_len(FACTS_HEADING));
        if !selected.is_empty() {
            body.push_str(FACTS_HEADING);
            remaining -= char_len(FACTS_HEADING);
            for fact in &selected {
                let line = format_fact_line(fact);
                remaining -= char_len(&line) + 1;
                body.push_str(&line);
                body.push('\n');
                fact_ids.push(fact.id.clone());
            }
        }
    }

    if !scope.entities.is_empty() && remaining > char_len(ENTITIES_HEADING) {
        let lines: Vec<String> = scope.entities.iter().map(format_entity_line).collect();
        let selected =
            select_within_budget(&lines, &lines, remaining - char_len(ENTITIES_HEADING));
        if !selected.is_empty() {
            body.push_str(ENTITIES_HEADING);
            for line in selected {
                body.push_str(&line);
                body.push('\n');
            }
        }
    }

    if body.is_empty() {
        return (String::new(), Vec::new());
    }
    (format!("{preamble}{}", body.trim_end()), fact_ids)
}

/// Inputs for one retrieval
#[derive(Debug, Clone)]
pub struct InjectionRequest<'a> {
    pub query: &'a str,
    pub project_group: &'a str,
    /// Set to also search the user scope and load the snapshot primer
    pub user_group: Option<&'a str>,
    pub budget: usize,
    /// Facts already visible in the conversation; never shown again
    pub visible: &'a HashSet<String>,
    pub now: DateTime<Utc>,
}

/// Retrieval pipeline bound to a graph client and config
pub struct InjectionPipeline<'a> {
    graph: &'a dyn GraphClient,
    config: &'a MemoryConfig,
}

impl<'a> InjectionPipeline<'a> {
    pub fn new(graph: &'a dyn GraphClient, config: &'a MemoryConfig) -> Self {
        Self { graph, config }
    }

    /// Build the injection for a turn. `None` when nothing relevant remains
    /// or nothing fits the budget.
    pub async fn retrieve(&self, request: &InjectionRequest<'_>) -> Option<Injection> {
        if request.budget == 0 || request.query.trim().is_empty() {
            return None;
        }

        let results = retrieve_scopes(
            self.graph,
            request.query,
            request.project_group,
            request.user_group,
            request.now,
            self.config.fact_stale_days,
        )
        .await;

        let project = results.project.without_facts(request.visible);
        let user = results.user.map(|u| u.without_facts(request.visible));
        if project.is_empty() && user.as_ref().is_none_or(|u| u.is_empty()) {
            debug!("No new memory for query, skipping injection");
            return None;
        }

        let mut sections = Vec::new();
        let mut remaining = request.budget;

        if request.user_group.is_some() {
            if let Some(primer) = self.load_primer(request.project_group, request.budget).await {
                remaining =
                    remaining.saturating_sub(char_len(&primer) + char_len(SECTION_SEPARATOR));
                sections.push(primer);
            }
        }

        let (project_budget, user_budget) = match &user {
            Some(_) => split(remaining, self.config.budget.project_share),
            None => (remaining, 0),
        };

        let mut scope_blocks = 0;
        let (project_text, mut fact_ids) =
            format_scope_block(PROJECT_PREAMBLE, &project, project_budget);
        let project_fact_ids = fact_ids.clone();
        if !project_text.is_empty() {
            sections.push(project_text);
            scope_blocks += 1;
        }
        if let Some(user) = &user {
            let user_budget = user_budget.saturating_sub(char_len(SECTION_SEPARATOR));
            let (user_text, user_ids) = format_scope_block(USER_PREAMBLE, user, user_budget);
            if !user_text.is_empty() {
                sections.push(user_text);
                fact_ids.extend(user_ids);
                scope_blocks += 1;
            }
        }
        if scope_blocks == 0 {
            debug!(budget = request.budget, "Nothing fits the injection budget");
            return None;
        }

        let joined = sections.join(SECTION_SEPARATOR);
        let text = truncate_chars(&joined, request.budget).trim_end().to_string();
        if text.is_empty() {
            return None;
        }

        let mut seen = HashSet::new();
        fact_ids.retain(|id| seen.insert(id.clone()));

        info!(
            chars = char_len(&text),
            budget = request.budget,
            facts = fact_ids.len(),
            "Prepared memory injection"
        );
        Some(Injection::new(text, fact_ids).with_project_fact_ids(project_fact_ids))
    }

    /// Most recent session snapshot for the project, cut to the primer cap
    async fn load_primer(&self, project_group: &str, budget: usize) -> Option<String> {
        let episodes = match self.graph.get_episodes(project_group, SNAPSHOT_LOOKBACK).await {
            Ok(episodes) => episodes,
            Err(e) => {
                warn!("Loading session snapshot failed: {}", e);
                return None;
            }
        };
        let snapshot = latest_snapshot(&episodes)?;
        let cap = budget.min(PRIMER_MAX_CHARS);
        let body = truncate_chars(
            snapshot.body.trim(),
            cap.saturating_sub(char_len(PRIMER_HEADING)),
        );
        if body.is_empty() {
            return None;
        }
        Some(format!("{PRIMER_HEADING}{body}"))
    }
}

/// Latest episode tagged as a session snapshot. Episodes without a
/// timestamp rank by list position (later is newer).
pub fn latest_snapshot(episodes: &[Episode]) -> Option<&Episode> {
    episodes
        .iter()
        .enumerate()
        .filter(|(_, e)| e.source_description.as_deref() == Some(SNAPSHOT_DESCRIPTION))
        .max_by_key(|(idx, e)| (e.created(), *idx))
        .map(|(_, e)| e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn episode(id: &str, description: Option<&str>, created_at: Option<&str>) -> Episode {
        Episode {
            id: id.to_string(),
            name: id.to_string(),
            body: format!("body of {id}"),
            source: None,
            source_description: description.map(String::from),
            created_at: created_at.map(String::from),
        }
    }

    #[test]
    fn test_latest_snapshot() {
        let episodes = vec![
            episode("old", Some(SNAPSHOT_DESCRIPTION), Some("2026-01-01T00:00:00Z")),
            episode("chat", Some("session idle"), Some("2026-03-01T00:00:00Z")),
            episode("new", Some(SNAPSHOT_DESCRIPTION), Some("2026-02-01T00:00:00Z")),
        ];
        assert_eq!(latest_snapshot(&episodes).unwrap().id, "new");
        assert!(latest_snapshot(&episodes[1..2]).is_none());
    }

    #[test]
    fn test_format_scope_block_respects_budget() {
        let scope = NormalizedScope {
            facts: (0..20)
                .map(|i| {
                    Fact::new(format!("f{i}"), format!("fact number {i:02} with some padding text"))
                })
                .collect(),
            entities: vec![EntityNode::new("n1", "Postgres").with_summary("main database")],
        };

        let (text, ids) = format_scope_block(PROJECT_PREAMBLE, &scope, 400);
        assert!(char_len(&text) <= 400);
        assert!(!ids.is_empty());
        assert!(ids.len() < 20);
        assert!(text.starts_with("## Project memory"));
        for id in &ids {
            let idx: usize = id[1..].parse().unwrap();
            assert!(text.contains(&format!("fact number {idx:02}")));
        }
    }

    #[test]
    fn test_format_scope_block_skips_long_head_fact() {
        let scope = NormalizedScope {
            facts: vec![
                Fact::new("f1", "z".repeat(600)),
                Fact::new("f2", "deploys go through canary first"),
            ],
            entities: Vec::new(),
        };
        let (text, ids) = format_scope_block(PROJECT_PREAMBLE, &scope, 300);
        assert_eq!(ids, vec!["f2".to_string()]);
        assert!(text.contains("- deploys go through canary first"));
        assert!(!text.contains("zzz"));
    }

    #[test]
    fn test_format_scope_block_too_small() {
        let scope = NormalizedScope {
            facts: vec![Fact::new("f1", "something")],
            entities: Vec::new(),
        };
        let (text, ids) = format_scope_block(PROJECT_PREAMBLE, &scope, 20);
        assert!(text.is_empty());
        assert!(ids.is_empty());
    }

    #[test]
    fn test_format_scope_block_entities_only() {
        let now = Utc::now();
        let scope = normalize_scope(
            vec![Fact::new("f1", "expired").with_invalid_at(now - Duration::days(1))],
            vec![EntityNode::new("n1", "Redis")],
            now,
            30,
        );
        let (text, ids) = format_scope_block(USER_PREAMBLE, &scope, 500);
        assert!(ids.is_empty());
        assert!(text.contains("### Entities\n- Redis"));
        assert!(!text.contains("### Facts"));
    }
}
