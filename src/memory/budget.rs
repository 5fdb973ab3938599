//! Character budget arithmetic
//!
//! Budgets count characters (Unicode scalar values), not bytes, so a prefix
//! cut never lands inside a character.

/// Character length of `text`
pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Split `total` by `ratio`: `a = floor(total * ratio)`, `b` takes the rest
pub fn split(total: usize, ratio: f64) -> (usize, usize) {
    let ratio = ratio.clamp(0.0, 1.0);
    let a = ((total as f64) * ratio).floor() as usize;
    let a = a.min(total);
    (a, total - a)
}

/// Per-tier budgets for a compaction section
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierBudgets {
    pub decisions: usize,
    pub active: usize,
    pub background: usize,
}

/// Split `total` across decision/active/background; background absorbs rounding
pub fn split_tiers(total: usize, decision_share: f64, active_share: f64) -> TierBudgets {
    let decisions = ((total as f64) * decision_share.clamp(0.0, 1.0)).floor() as usize;
    let decisions = decisions.min(total);
    let active = ((total as f64) * active_share.clamp(0.0, 1.0)).floor() as usize;
    let active = active.min(total - decisions);
    TierBudgets {
        decisions,
        active,
        background: total - decisions - active,
    }
}

/// Take items in priority order while their lines fit in `budget`.
///
/// Each line costs its length plus one separator. A line that would
/// overflow is skipped and later lines still get a chance; lines are never
/// cut.
pub fn select_within_budget<T: Clone>(lines: &[String], items: &[T], budget: usize) -> Vec<T> {
    let mut selected = Vec::new();
    let mut used = 0usize;
    for (line, item) in lines.iter().zip(items) {
        let cost = char_len(line) + 1;
        if used + cost > budget {
            continue;
        }
        used += cost;
        selected.push(item.clone());
    }
    selected
}

/// Prefix cut to at most `budget` characters
pub fn truncate_chars(text: &str, budget: usize) -> &str {
    match text.char_indices().nth(budget) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_conserves_total() {
        assert_eq!(split(1000, 0.7), (700, 300));
        assert_eq!(split(10, 0.7), (7, 3));
        assert_eq!(split(0, 0.7), (0, 0));
        assert_eq!(split(3, 1.5), (3, 0));
        for total in [1usize, 7, 99, 1001, 16_000] {
            let (a, b) = split(total, 0.7);
            assert_eq!(a + b, total);
        }
    }

    #[test]
    fn test_split_tiers_background_takes_remainder() {
        let tiers = split_tiers(1000, 0.4, 0.35);
        assert_eq!(
            tiers,
            TierBudgets {
                decisions: 400,
                active: 350,
                background: 250
            }
        );

        let tiers = split_tiers(7, 0.4, 0.35);
        assert_eq!(tiers.decisions, 2);
        assert_eq!(tiers.active, 2);
        assert_eq!(tiers.background, 3);
    }

    #[test]
    fn test_select_counts_separators() {
        let lines = vec!["aaaa".to_string(), "bbbb".to_string(), "cccc".to_string()];
        let items = vec![1, 2, 3];
        assert_eq!(select_within_budget(&lines, &items, 10), vec![1, 2]);
        assert_eq!(select_within_budget(&lines, &items, 9), vec![1]);
        assert_eq!(select_within_budget(&lines, &items, 0), Vec::<i32>::new());
    }

    #[test]
    fn test_oversized_line_is_skipped() {
        let lines = vec!["x".repeat(500), "- short".to_string(), "- other".to_string()];
        let items = vec![0, 1, 2];
        assert_eq!(select_within_budget(&lines, &items, 100), vec![1, 2]);

        let lines = vec!["x".repeat(50), "short".to_string()];
        let items = vec!["big", "small"];
        assert_eq!(select_within_budget(&lines, &items, 20), vec!["small"]);
        assert!(select_within_budget(&lines, &items, 5).is_empty());
    }

    #[test]
    fn test_budget_exhaustion() {
        let lines: Vec<String> = (0..100).map(|i| format!("- {:0>68}", i)).collect();
        let items: Vec<usize> = (0..100).collect();
        let selected = select_within_budget(&lines, &items, 2000);
        let used: usize = selected.iter().map(|&i| char_len(&lines[i]) + 1).sum();
        assert!(used <= 2000);
        assert_eq!(selected.len(), 2000 / 71);
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("abc", 0), "");
    }
}
