//! Memory engine internals
//!
//! Normalization, budgeting, classification, and drift detection are pure;
//! injection, compaction, and flushing talk to the graph and host clients.

mod budget;
mod buffer;
mod classify;
mod compact;
mod drift;
mod injection;
mod normalize;
mod session_store;

pub use budget::{char_len, select_within_budget, split, split_tiers, truncate_chars, TierBudgets};
pub use buffer::{
    ends_with_user_turn, format_assistant_message, format_user_message, join_messages,
    restore_unflushed, AssistantBuffer, FlushController, FlushOutcome,
};
pub use classify::{ClassifiedFacts, FactClassifier, ACTIVE_WINDOW_DAYS};
pub use compact::{build_query, persist_summary, CompactionContextBuilder, MAX_QUERY_CHARS};
pub use drift::{jaccard, DriftCheck, DriftDetector};
pub use injection::{
    latest_snapshot, retrieve_scopes, Injection, InjectionPipeline, InjectionRequest,
    ScopedResults, PRIMER_MAX_CHARS, SNAPSHOT_DESCRIPTION,
};
pub use normalize::{
    annotate_stale, dedupe_entities, dedupe_facts, filter_valid, format_entity_line,
    format_fact_line, normalize_scope, prune_orphan_entities, NormalizedScope,
};
pub use session_store::{resolve_session, Resolution, SessionState, SessionStore};
