//! UTF-16 index helpers
//!
//! The interpreter stores strings as UTF-16, so script-side `length`,
//! `charAt` and `indexOf` count 16-bit code units. Characters outside the
//! Basic Multilingual Plane take two units (a surrogate pair) there but one
//! `char` and four bytes in Rust. Use these helpers before comparing indices
//! across the boundary.

/// Number of UTF-16 code units `s` occupies on the script side.
pub fn utf16_len(s: &str) -> usize {
    s.chars().map(char::len_utf16).sum()
}

/// Byte offset in `s` of the script-side code-unit index `index`.
///
/// Returns `None` when `index` is past the end or points into the middle of
/// a surrogate pair.
pub fn byte_offset_of_utf16(s: &str, index: usize) -> Option<usize> {
    let mut units = 0;
    for (offset, ch) in s.char_indices() {
        if units == index {
            return Some(offset);
        }
        units += ch.len_utf16();
        if units > index {
            return None;
        }
    }
    (units == index).then_some(s.len())
}

/// Script-side code-unit index of the byte offset `offset`.
pub fn utf16_index_of_byte(s: &str, offset: usize) -> Option<usize> {
    if !s.is_char_boundary(offset) {
        return None;
    }
    Some(utf16_len(&s[..offset]))
}
