//! Graph memory service types and client contract
//!
//! The core only ever sees these normalized types; response shapes from the
//! wire are handled by the client implementation.

mod mcp;

pub use mcp::McpGraphClient;

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Episode source kind for conversation text
pub const SOURCE_MESSAGE: &str = "message";

/// Episode source kind for free-form text such as summaries
pub const SOURCE_TEXT: &str = "text";

/// Reference from a fact to one of its entities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRef {
    pub id: String,
    pub name: String,
}

/// A timestamped assertion from the knowledge graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fact {
    pub id: String,
    pub text: String,
    /// Start of validity (RFC 3339), kept raw so unparsable values read as absent
    #[serde(default)]
    pub valid_at: Option<String>,
    /// End of validity (RFC 3339)
    #[serde(default)]
    pub invalid_at: Option<String>,
    #[serde(default)]
    pub source: Option<NodeRef>,
    #[serde(default)]
    pub target: Option<NodeRef>,
}

impl Fact {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            valid_at: None,
            invalid_at: None,
            source: None,
            target: None,
        }
    }

    pub fn with_valid_at(mut self, at: DateTime<Utc>) -> Self {
        self.valid_at = Some(at.to_rfc3339());
        self
    }

    pub fn with_invalid_at(mut self, at: DateTime<Utc>) -> Self {
        self.invalid_at = Some(at.to_rfc3339());
        self
    }

    pub fn with_source(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.source = Some(NodeRef {
            id: id.into(),
            name: name.into(),
        });
        self
    }

    pub fn with_target(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.target = Some(NodeRef {
            id: id.into(),
            name: name.into(),
        });
        self
    }

    /// Parsed validity start
    pub fn valid_from(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(self.valid_at.as_deref())
    }

    /// Parsed validity end
    pub fn valid_until(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(self.invalid_at.as_deref())
    }

    /// Valid at `now` iff not yet ended and already started
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_until().is_none_or(|end| end >= now)
            && self.valid_from().is_none_or(|start| start <= now)
    }

    /// Whether this fact references the entity with the given id
    pub fn references(&self, entity_id: &str) -> bool {
        self.source.as_ref().is_some_and(|n| n.id == entity_id)
            || self.target.as_ref().is_some_and(|n| n.id == entity_id)
    }
}

/// A named concept tracked by the knowledge graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityNode {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl EntityNode {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            summary: None,
            labels: Vec::new(),
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

/// A persisted memory record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Episode {
    pub id: String,
    pub name: String,
    pub body: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub source_description: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl Episode {
    pub fn created(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(self.created_at.as_deref())
    }
}

/// Parse an RFC 3339 timestamp, treating garbage as absent
pub fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Client for the external knowledge-graph service.
///
/// Every call may fail; callers in the core catch the error and degrade.
#[async_trait]
pub trait GraphClient: Send + Sync {
    async fn search_facts(
        &self,
        query: &str,
        group_ids: &[String],
        max_facts: usize,
    ) -> Result<Vec<Fact>>;

    async fn search_entities(
        &self,
        query: &str,
        group_ids: &[String],
        max_entities: usize,
    ) -> Result<Vec<EntityNode>>;

    async fn get_episodes(&self, group_id: &str, last_n: usize) -> Result<Vec<Episode>>;

    async fn add_episode(
        &self,
        name: &str,
        body: &str,
        group_id: &str,
        source: &str,
        source_description: &str,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_validity_window() {
        let now = Utc::now();
        let open = Fact::new("f1", "open");
        assert!(open.is_valid_at(now));

        let ended = Fact::new("f2", "ended").with_invalid_at(now - Duration::days(1));
        assert!(!ended.is_valid_at(now));

        let future = Fact::new("f3", "future").with_valid_at(now + Duration::days(1));
        assert!(!future.is_valid_at(now));

        let current = Fact::new("f4", "current")
            .with_valid_at(now - Duration::days(3))
            .with_invalid_at(now + Duration::days(3));
        assert!(current.is_valid_at(now));
    }

    #[test]
    fn test_unparsable_timestamp_reads_as_absent() {
        let mut fact = Fact::new("f1", "text");
        fact.invalid_at = Some("not a date".to_string());
        fact.valid_at = Some(String::new());
        assert!(fact.valid_until().is_none());
        assert!(fact.valid_from().is_none());
        assert!(fact.is_valid_at(Utc::now()));
    }

    #[test]
    fn test_references() {
        let fact = Fact::new("f1", "A uses B")
            .with_source("n1", "A")
            .with_target("n2", "B");
        assert!(fact.references("n1"));
        assert!(fact.references("n2"));
        assert!(!fact.references("n3"));
    }
}
