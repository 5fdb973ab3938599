//! Fact and entity normalization
//!
//! Pure list transformations applied to every search result before it is
//! formatted: dedupe, drop facts outside their validity window, mark old
//! facts stale, and keep only entities no surviving fact already names.

use crate::graph::{EntityNode, Fact};
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// Facts and standalone entities for one scope, ready to format
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedScope {
    pub facts: Vec<Fact>,
    pub entities: Vec<EntityNode>,
}

impl NormalizedScope {
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty() && self.entities.is_empty()
    }

    /// Drop facts whose ids are in `ids`
    pub fn without_facts(mut self, ids: &HashSet<String>) -> Self {
        if !ids.is_empty() {
            self.facts.retain(|f| !ids.contains(&f.id));
        }
        self
    }
}

/// First occurrence per id wins; order is preserved
pub fn dedupe_facts(facts: Vec<Fact>) -> Vec<Fact> {
    let mut seen = HashSet::new();
    facts
        .into_iter()
        .filter(|f| seen.insert(f.id.clone()))
        .collect()
}

/// First occurrence per id wins; order is preserved
pub fn dedupe_entities(entities: Vec<EntityNode>) -> Vec<EntityNode> {
    let mut seen = HashSet::new();
    entities
        .into_iter()
        .filter(|e| seen.insert(e.id.clone()))
        .collect()
}

/// Keep facts valid at `now`, most recent validity start first.
///
/// Facts without a (parsable) start sort after dated ones; ties keep their
/// original order.
pub fn filter_valid(facts: Vec<Fact>, now: DateTime<Utc>) -> Vec<Fact> {
    let mut valid: Vec<Fact> = facts.into_iter().filter(|f| f.is_valid_at(now)).collect();
    valid.sort_by_key(|f| std::cmp::Reverse(f.valid_from()));
    valid
}

/// Prefix the text with a stale marker once the fact is `stale_days` old
pub fn annotate_stale(fact: &Fact, now: DateTime<Utc>, stale_days: i64) -> Fact {
    let Some(start) = fact.valid_from() else {
        return fact.clone();
    };
    let age_days = (now - start).num_days();
    if age_days < stale_days {
        return fact.clone();
    }
    Fact {
        text: format!("{}{}", stale_marker(age_days), fact.text),
        ..fact.clone()
    }
}

pub fn stale_marker(age_days: i64) -> String {
    format!("[stale: {age_days} days old] ")
}

/// Entities not referenced as source or target by any fact
pub fn prune_orphan_entities(facts: &[Fact], entities: Vec<EntityNode>) -> Vec<EntityNode> {
    let referenced: HashSet<&str> = facts
        .iter()
        .flat_map(|f| [f.source.as_ref(), f.target.as_ref()])
        .flatten()
        .map(|n| n.id.as_str())
        .collect();
    entities
        .into_iter()
        .filter(|e| !referenced.contains(e.id.as_str()))
        .collect()
}

/// Full normalization pass for one scope's search results
pub fn normalize_scope(
    facts: Vec<Fact>,
    entities: Vec<EntityNode>,
    now: DateTime<Utc>,
    stale_days: i64,
) -> NormalizedScope {
    let facts: Vec<Fact> = filter_valid(dedupe_facts(facts), now)
        .iter()
        .map(|f| annotate_stale(f, now, stale_days))
        .collect();
    let entities = prune_orphan_entities(&facts, dedupe_entities(entities));
    NormalizedScope { facts, entities }
}

pub fn format_fact_line(fact: &Fact) -> String {
    match fact.valid_from() {
        Some(start) => format!("- {} (since {})", fact.text, start.format("%Y-%m-%d")),
        None => format!("- {}", fact.text),
    }
}

pub fn format_entity_line(entity: &EntityNode) -> String {
    match entity.summary.as_deref() {
        Some(summary) => format!("- {}: {}", entity.name, summary),
        None => format!("- {}", entity.name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_dedupe_keeps_first() {
        let facts = vec![
            Fact::new("f1", "A"),
            Fact::new("f2", "B"),
            Fact::new("f1", "C"),
        ];
        let deduped = dedupe_facts(facts);
        assert_eq!(deduped, vec![Fact::new("f1", "A"), Fact::new("f2", "B")]);
        assert_eq!(dedupe_facts(deduped.clone()), deduped);

        let entities = vec![EntityNode::new("n1", "X"), EntityNode::new("n1", "Y")];
        assert_eq!(dedupe_entities(entities), vec![EntityNode::new("n1", "X")]);
    }

    #[test]
    fn test_filter_valid_sorts_recent_first() {
        let now = Utc::now();
        let facts = vec![
            Fact::new("undated", "no start"),
            Fact::new("old", "old").with_valid_at(now - Duration::days(10)),
            Fact::new("expired", "gone").with_invalid_at(now - Duration::hours(1)),
            Fact::new("new", "new").with_valid_at(now - Duration::days(1)),
            Fact::new("future", "later").with_valid_at(now + Duration::days(1)),
            Fact::new("undated2", "no start either"),
        ];
        let ids: Vec<String> = filter_valid(facts, now).into_iter().map(|f| f.id).collect();
        assert_eq!(ids, vec!["new", "old", "undated", "undated2"]);
    }

    #[test]
    fn test_stale_boundary() {
        let now = Utc::now();
        let fact = Fact::new("f1", "Uses Redis").with_valid_at(now - Duration::days(30));

        let annotated = annotate_stale(&fact, now, 30);
        assert_eq!(annotated.text, "[stale: 30 days old] Uses Redis");
        assert_eq!(fact.text, "Uses Redis");

        assert_eq!(annotate_stale(&fact, now, 31), fact);
    }

    #[test]
    fn test_stale_ignores_invalid_at() {
        let now = Utc::now();
        let fact = Fact::new("f1", "Open ended").with_invalid_at(now + Duration::days(1));
        assert_eq!(annotate_stale(&fact, now, 0), fact);
    }

    #[test]
    fn test_prune_orphans() {
        let facts = vec![
            Fact::new("f1", "n1 relates").with_source("n1", "One"),
            Fact::new("f2", "relates n2").with_target("n2", "Two"),
        ];
        let entities = vec![
            EntityNode::new("n1", "One"),
            EntityNode::new("n2", "Two"),
            EntityNode::new("n3", "Three"),
        ];
        assert_eq!(
            prune_orphan_entities(&facts, entities),
            vec![EntityNode::new("n3", "Three")]
        );
    }

    #[test]
    fn test_normalize_scope_prunes_against_surviving_facts() {
        let now = Utc::now();
        let facts = vec![
            Fact::new("f1", "expired link")
                .with_source("n1", "One")
                .with_invalid_at(now - Duration::days(1)),
        ];
        let entities = vec![EntityNode::new("n1", "One")];
        let scope = normalize_scope(facts, entities, now, 30);
        assert!(scope.facts.is_empty());
        assert_eq!(scope.entities.len(), 1);
    }

    #[test]
    fn test_format_lines() {
        let at = DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            format_fact_line(&Fact::new("f", "Uses Rust").with_valid_at(at)),
            "- Uses Rust (since 2026-03-01)"
        );
        assert_eq!(
            format_entity_line(&EntityNode::new("n", "Postgres").with_summary("primary DB")),
            "- Postgres: primary DB"
        );
        assert_eq!(format_entity_line(&EntityNode::new("n", "Redis")), "- Redis");
    }
}
