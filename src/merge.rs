//! Error-merge engine.
//!
//! Folds candidate lists from any number of producers into one ordered,
//! non-overlapping list. The result is a pure function of the inputs and
//! [`MergeConfig`]:
//!
//! 1. flatten and drop invalid spans (including spans whose `text` does not
//!    slice out of the original exactly),
//! 2. collapse structural duplicates keyed on `(start, end, text)`,
//! 3. sort by `(start, end)`,
//! 4. resolve overlaps in one left-to-right pass.
//!
//! Merging an already merged list returns it unchanged.

use crate::text::Utf16Text;
use crate::types::{ErrorItem, ErrorType};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Tie-break configuration for [`merge`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MergeConfig {
    /// Let an explicit confidence score decide first when both items carry one.
    pub confidence_first: bool,
    /// Category ranking, highest priority first. Unlisted categories rank last.
    pub type_priority: Vec<ErrorType>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            confidence_first: false,
            type_priority: ErrorType::builtin(),
        }
    }
}

impl MergeConfig {
    pub fn with_confidence_first(mut self, enabled: bool) -> Self {
        self.confidence_first = enabled;
        self
    }

    pub fn with_type_priority(mut self, priority: Vec<ErrorType>) -> Self {
        self.type_priority = priority;
        self
    }

    /// Lower is better.
    fn rank(&self, t: &ErrorType) -> usize {
        self.type_priority
            .iter()
            .position(|p| p == t)
            .unwrap_or(self.type_priority.len())
    }

    /// `Greater` when both items carry a confidence and `a` is more confident.
    fn by_confidence(&self, a: &ErrorItem, b: &ErrorItem) -> Ordering {
        if !self.confidence_first {
            return Ordering::Equal;
        }
        match (a.confidence(), b.confidence()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        }
    }

    /// `Greater` when `a` has the higher-priority category.
    fn by_type(&self, a: &ErrorItem, b: &ErrorItem) -> Ordering {
        self.rank(&b.error_type).cmp(&self.rank(&a.error_type))
    }

    /// Whether `candidate` should replace `current` as the representative of
    /// a duplicate group.
    fn prefer_duplicate(&self, current: &ErrorItem, candidate: &ErrorItem) -> bool {
        self.by_confidence(candidate, current)
            .then_with(|| self.by_type(candidate, current))
            .then_with(|| candidate.explanation_len().cmp(&current.explanation_len()))
            == Ordering::Greater
    }

    /// Whether `next` should replace `current` when their spans overlap.
    fn prefer_overlapping(&self, current: &ErrorItem, next: &ErrorItem) -> bool {
        self.by_confidence(next, current)
            // shorter span is the more precise correction
            .then_with(|| current.span_len().cmp(&next.span_len()))
            .then_with(|| next.explanation_len().cmp(&current.explanation_len()))
            .then_with(|| self.by_type(next, current))
            == Ordering::Greater
    }
}

/// Whether `item` is a well-formed span of `text`.
pub fn is_valid_item(text: &Utf16Text, item: &ErrorItem) -> bool {
    item.start < item.end
        && item.end <= text.len()
        && !item.text.is_empty()
        && text.slice_matches(item.start, item.end, &item.text)
}

/// Validate and collapse duplicates, sorted by `(start, end)`.
///
/// Overlapping items are all kept; see [`merge`] for the resolved list.
pub fn dedup<G>(original: &str, groups: G, config: &MergeConfig) -> Vec<ErrorItem>
where
    G: IntoIterator,
    G::Item: IntoIterator<Item = ErrorItem>,
{
    let text = Utf16Text::new(original);

    // 1 + 2: validate, then dedup in first-seen order.
    let mut slots: HashMap<(usize, usize, String), usize> = HashMap::new();
    let mut unique: Vec<ErrorItem> = Vec::new();
    for item in groups.into_iter().flatten() {
        if !is_valid_item(&text, &item) {
            continue;
        }
        let key = (item.start, item.end, item.text.clone());
        match slots.get(&key) {
            Some(&idx) => {
                if config.prefer_duplicate(&unique[idx], &item) {
                    unique[idx] = item;
                }
            }
            None => {
                slots.insert(key, unique.len());
                unique.push(item);
            }
        }
    }

    // 3: stable sort keeps first-seen order for equal spans.
    unique.sort_by_key(|item| (item.start, item.end));
    unique
}

/// Merge candidate groups into a sorted, non-overlapping list.
pub fn merge<G>(original: &str, groups: G, config: &MergeConfig) -> Vec<ErrorItem>
where
    G: IntoIterator,
    G::Item: IntoIterator<Item = ErrorItem>,
{
    let unique = dedup(original, groups, config);

    // 4: single pass with a running best.
    let mut merged = Vec::with_capacity(unique.len());
    let mut items = unique.into_iter();
    let Some(mut current) = items.next() else {
        return merged;
    };
    for next in items {
        if next.start < current.end {
            if config.prefer_overlapping(&current, &next) {
                current = next;
            }
        } else {
            merged.push(std::mem::replace(&mut current, next));
        }
    }
    merged.push(current);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::meta_keys;

    const TEXT: &str = "我今天很高行，我们去公园玩吧";

    fn item(start: usize, end: usize, suggestion: &str, t: ErrorType) -> ErrorItem {
        let slice = Utf16Text::new(TEXT).slice(start, end).unwrap();
        ErrorItem::new(start, end, slice, suggestion, t)
    }

    fn assert_sorted_non_overlapping(items: &[ErrorItem]) {
        for pair in items.windows(2) {
            assert!(pair[0].end <= pair[1].start, "{:?} overlaps {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_empty_input() {
        let groups: Vec<Vec<ErrorItem>> = Vec::new();
        assert!(merge(TEXT, groups, &MergeConfig::default()).is_empty());
        assert!(merge(TEXT, vec![Vec::new()], &MergeConfig::default()).is_empty());
    }

    #[test]
    fn test_invalid_items_dropped() {
        let mut wrong_text = item(4, 6, "高兴", ErrorType::Spelling);
        wrong_text.text = "高兴".into();
        let mut reversed = item(4, 6, "高兴", ErrorType::Spelling);
        reversed.start = 6;
        reversed.end = 4;
        let mut past_end = item(4, 6, "高兴", ErrorType::Spelling);
        past_end.end = 99;
        let mut empty = item(4, 6, "高兴", ErrorType::Spelling);
        empty.text.clear();

        let out = merge(
            TEXT,
            vec![vec![wrong_text, reversed, past_end, empty]],
            &MergeConfig::default(),
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_duplicates_collapse_across_types() {
        let a = item(4, 6, "高兴", ErrorType::Grammar);
        let b = item(4, 6, "高兴", ErrorType::Spelling);
        let out = merge(TEXT, vec![vec![a], vec![b.clone()]], &MergeConfig::default());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, b.id, "spelling outranks grammar");
    }

    #[test]
    fn test_duplicate_tie_breaks() {
        let short = item(4, 6, "高兴", ErrorType::Spelling).with_explanation("错字");
        let long = item(4, 6, "高兴", ErrorType::Spelling).with_explanation("“高行”应为“高兴”");
        let out = merge(TEXT, vec![vec![short.clone(), long.clone()]], &MergeConfig::default());
        assert_eq!(out[0].id, long.id);

        let first = item(4, 6, "高兴", ErrorType::Spelling);
        let second = item(4, 6, "高兴", ErrorType::Spelling);
        let out = merge(TEXT, vec![vec![first.clone(), second]], &MergeConfig::default());
        assert_eq!(out[0].id, first.id, "first seen wins on a full tie");
    }

    #[test]
    fn test_dedup_keeps_overlaps() {
        let wide = item(4, 6, "高兴", ErrorType::Spelling);
        let narrow = item(5, 6, "兴", ErrorType::Spelling);
        let again = item(4, 6, "高兴", ErrorType::Spelling);
        let out = dedup(TEXT, vec![vec![narrow.clone(), wide.clone(), again]], &MergeConfig::default());
        let ids: Vec<&str> = out.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec![wide.id.as_str(), narrow.id.as_str()]);
        assert_eq!(merge(TEXT, vec![out], &MergeConfig::default()).len(), 1);
    }

    #[test]
    fn test_confidence_first_mode() {
        let low = item(4, 6, "高兴", ErrorType::Spelling).with_confidence(0.3);
        let high = item(4, 6, "高兴", ErrorType::Fluency).with_confidence(0.8);

        let off = merge(TEXT, vec![vec![low.clone(), high.clone()]], &MergeConfig::default());
        assert_eq!(off[0].id, low.id);

        let cfg = MergeConfig::default().with_confidence_first(true);
        let on = merge(TEXT, vec![vec![low, high.clone()]], &cfg);
        assert_eq!(on[0].id, high.id);
    }

    #[test]
    fn test_overlap_prefers_shorter_span() {
        let broad = item(3, 6, "很高兴", ErrorType::Spelling);
        let narrow = item(4, 6, "高兴", ErrorType::Spelling);
        let out = merge(TEXT, vec![vec![broad, narrow.clone()]], &MergeConfig::default());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, narrow.id);
    }

    #[test]
    fn test_overlap_keeps_current_on_tie() {
        let a = item(3, 5, "很高", ErrorType::Spelling);
        let b = item(4, 6, "高兴", ErrorType::Spelling);
        let out = merge(TEXT, vec![vec![a.clone(), b]], &MergeConfig::default());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, a.id);
    }

    #[test]
    fn test_overlap_uses_type_priority_after_explanation() {
        let a = item(3, 5, "很高", ErrorType::Fluency);
        let b = item(4, 6, "高兴", ErrorType::Punctuation);
        let out = merge(TEXT, vec![vec![a, b.clone()]], &MergeConfig::default());
        assert_eq!(out[0].id, b.id);

        let custom = MergeConfig::default().with_type_priority(vec![
            ErrorType::Fluency,
            ErrorType::Punctuation,
        ]);
        let a = item(3, 5, "很高", ErrorType::Fluency);
        let b = item(4, 6, "高兴", ErrorType::Punctuation);
        let out = merge(TEXT, vec![vec![a.clone(), b]], &custom);
        assert_eq!(out[0].id, a.id);
    }

    #[test]
    fn test_independent_clusters() {
        let c1a = item(3, 6, "很高兴", ErrorType::Spelling);
        let c1b = item(4, 6, "高兴", ErrorType::Spelling);
        let comma = item(6, 7, "。", ErrorType::Punctuation);
        let c2a = item(10, 12, "公园", ErrorType::Fluency);
        let c2b = item(11, 13, "园玩", ErrorType::Fluency).with_explanation("多余");

        let out = merge(
            TEXT,
            vec![vec![c2b.clone(), c1a], vec![comma.clone(), c1b.clone(), c2a]],
            &MergeConfig::default(),
        );
        assert_sorted_non_overlapping(&out);
        let ids: Vec<_> = out.iter().map(|i| i.id.clone()).collect();
        assert_eq!(ids, vec![c1b.id, comma.id, c2b.id]);
    }

    #[test]
    fn test_output_invariants_and_idempotence() {
        let mut groups = Vec::new();
        let len = Utf16Text::new(TEXT).len();
        // Deterministic spread of spans, including many overlaps.
        for g in 0..4 {
            let mut group = Vec::new();
            for s in 0..len {
                let e = (s + 1 + (s + g) % 3).min(len);
                let t = ErrorType::builtin()[(s + g) % 4].clone();
                group.push(item(s, e, "x", t).with_meta(meta_keys::SOURCE, "test"));
            }
            groups.push(group);
        }

        let cfg = MergeConfig::default();
        let once = merge(TEXT, groups, &cfg);
        assert!(!once.is_empty());
        assert_sorted_non_overlapping(&once);
        let text = Utf16Text::new(TEXT);
        for it in &once {
            assert!(text.slice_matches(it.start, it.end, &it.text));
        }

        let twice = merge(TEXT, vec![once.clone()], &cfg);
        assert_eq!(once, twice);
    }
}
