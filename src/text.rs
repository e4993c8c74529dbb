//! UTF-16 offset handling.
//!
//! Every span in this crate is a half-open range of UTF-16 code units, the
//! same unit a browser reports for `String.length`. [`Utf16Text`] keeps the
//! encoded form of one input so producers, merge, and patch all slice the
//! same coordinate space.

/// A string together with its UTF-16 encoding.
#[derive(Debug, Clone)]
pub struct Utf16Text {
    units: Vec<u16>,
}

impl Utf16Text {
    pub fn new(text: &str) -> Self {
        Self {
            units: text.encode_utf16().collect(),
        }
    }

    /// Length in UTF-16 code units.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn units(&self) -> &[u16] {
        &self.units
    }

    /// Decode `[start, end)`.
    ///
    /// Returns `None` if the range is out of bounds, empty, or cuts a
    /// surrogate pair in half.
    pub fn slice(&self, start: usize, end: usize) -> Option<String> {
        if start >= end || end > self.units.len() {
            return None;
        }
        String::from_utf16(&self.units[start..end]).ok()
    }

    /// Whether `[start, end)` decodes to exactly `expected`.
    pub fn slice_matches(&self, start: usize, end: usize, expected: &str) -> bool {
        if start >= end || end > self.units.len() {
            return false;
        }
        self.units[start..end].iter().copied().eq(expected.encode_utf16())
    }

    /// All start offsets where `needle` occurs (non-overlapping scan from the left).
    pub fn find_all(&self, needle: &str) -> Vec<usize> {
        let needle: Vec<u16> = needle.encode_utf16().collect();
        if needle.is_empty() || needle.len() > self.units.len() {
            return Vec::new();
        }
        let mut hits = Vec::new();
        let mut i = 0;
        while i + needle.len() <= self.units.len() {
            if self.units[i..i + needle.len()] == needle[..] {
                hits.push(i);
                i += needle.len();
            } else {
                i += 1;
            }
        }
        hits
    }

    /// Offset of `needle` if it occurs exactly once.
    pub fn find_unique(&self, needle: &str) -> Option<usize> {
        match self.find_all(needle).as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }
}

/// UTF-16 length of a string.
pub fn utf16_len(s: &str) -> usize {
    s.encode_utf16().count()
}

/// Convert a byte offset (on a char boundary) into a UTF-16 offset.
pub fn byte_to_utf16(s: &str, byte_idx: usize) -> usize {
    utf16_len(&s[..byte_idx])
}
