//! Apply accepted corrections to the original text.

use crate::text::{utf16_len, Utf16Text};
use crate::types::ErrorItem;
use serde::{Deserialize, Serialize};

/// Result of [`apply_error_items`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchOutcome {
    pub patched_text: String,
    /// Ids of items that were applied, in application order.
    pub applied: Vec<String>,
    /// Ids of items that were skipped (invalid, stale, or overlapping).
    pub skipped: Vec<String>,
}

/// Replace each item's span with its suggestion.
///
/// Items are applied in `(start, end)` order against the original offsets,
/// tracking the running length delta. An item is skipped when its span is
/// out of range, its `text` no longer matches the original slice, or it
/// overlaps an item that was already applied. An item with an empty `text`
/// is checked against the span bounds only. Never fails.
pub fn apply_error_items(text: &str, items: &[ErrorItem]) -> PatchOutcome {
    let original = Utf16Text::new(text);
    let mut order: Vec<&ErrorItem> = items.iter().collect();
    order.sort_by_key(|item| (item.start, item.end));

    let mut out: Vec<u16> = Vec::with_capacity(original.len());
    let mut cursor = 0usize;
    let mut applied = Vec::new();
    let mut skipped = Vec::new();

    for item in order {
        let span_ok = || {
            if item.text.is_empty() {
                original.slice(item.start, item.end).is_some()
            } else {
                utf16_len(&item.text) == item.end - item.start
                    && original.slice_matches(item.start, item.end, &item.text)
            }
        };
        let fits = item.start < item.end && item.start >= cursor && span_ok();
        if !fits {
            skipped.push(item.id.clone());
            continue;
        }
        out.extend_from_slice(&original.units()[cursor..item.start]);
        out.extend(item.suggestion.encode_utf16());
        cursor = item.end;
        applied.push(item.id.clone());
    }
    out.extend_from_slice(&original.units()[cursor..]);

    // Spans never split a surrogate pair (slice_matches compares full
    // units against a valid string), so decoding cannot fail here.
    let patched_text = String::from_utf16_lossy(&out);

    PatchOutcome {
        patched_text,
        applied,
        skipped,
    }
}
