//! Whole-word keyword matching

use regex::Regex;
use tracing::warn;

/// Case-insensitive, whole-word match against a fixed keyword set.
///
/// All keywords compile into one alternation so a fact is scanned once.
#[derive(Debug, Clone)]
pub struct KeywordRule {
    pattern: Option<Regex>,
}

impl KeywordRule {
    pub fn new<S: AsRef<str>>(keywords: &[S]) -> Self {
        let alternatives: Vec<String> = keywords
            .iter()
            .map(|k| k.as_ref().trim())
            .filter(|k| !k.is_empty())
            .map(regex::escape)
            .collect();

        if alternatives.is_empty() {
            return Self { pattern: None };
        }

        let source = format!(r"(?i)\b(?:{})\b", alternatives.join("|"));
        let pattern = match Regex::new(&source) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!("Keyword rule failed to compile, matching nothing: {}", e);
                None
            }
        };
        Self { pattern }
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.pattern.as_ref().is_some_and(|re| re.is_match(text))
    }
}
