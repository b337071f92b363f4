//! Byte-level scanning over formula text: single-quoted regions and
//! delimiter-aware identifier location. All offsets are byte offsets into the
//! source string; quote and delimiter characters are ASCII so byte walking is
//! safe on UTF-8 input.

use crate::errors::{CalcError, CalcResult};

/// Characters allowed immediately before an identifier.
const LEFT_DELIMS: &str = ",(+-*/%^|&~!=<>";

/// Characters allowed immediately after an identifier. The `[` entry lets
/// `Name[base]` and `Name[variant]` forms match on the bare `Name`.
const RIGHT_DELIMS: &str = ",)+-*/%^|&~!=<>[";

/// Advance past one `'…'` region; `pos` must point at the opening quote.
/// Returns the offset of the first byte after the closing quote.
pub fn skip_quoted(src: &str, pos: usize) -> CalcResult<usize> {
    debug_assert_eq!(src.as_bytes().get(pos), Some(&b'\''));

    match src[pos + 1..].find('\'') {
        Some(n) => Ok(pos + 1 + n + 1),
        None => Err(CalcError::unsafe_sql("unbalanced quote", src)),
    }
}

/// Next maximal substring outside of single quotes, scanning from `start`.
/// Returns the `(begin, end)` byte span, or `None` when only quoted text or
/// nothing at all remains.
pub fn next_unquoted(src: &str, start: usize) -> CalcResult<Option<(usize, usize)>> {
    let bytes = src.as_bytes();
    let mut pos = start.min(bytes.len());

    while pos < bytes.len() && bytes[pos] == b'\'' {
        pos = skip_quoted(src, pos)?;
    }
    if pos >= bytes.len() {
        return Ok(None);
    }

    let begin = pos;
    while pos < bytes.len() && bytes[pos] != b'\'' {
        pos += 1;
    }
    Ok(Some((begin, pos)))
}

/// Leftmost occurrence of `name` delimited on both sides: the previous
/// character must be absent, whitespace or in [`LEFT_DELIMS`], the next one
/// absent, whitespace or in [`RIGHT_DELIMS`].
pub fn find_name_pos(src: &str, name: &str) -> Option<usize> {
    if name.is_empty() {
        return None;
    }
    let mut from = 0;

    while let Some(n) = src[from..].find(name) {
        let at = from + n;
        let end = at + name.len();

        let left_ok = match src[..at].chars().next_back() {
            None => true,
            Some(c) => c.is_whitespace() || LEFT_DELIMS.contains(c),
        };
        let right_ok = match src[end..].chars().next() {
            None => true,
            Some(c) => c.is_whitespace() || RIGHT_DELIMS.contains(c),
        };
        if left_ok && right_ok {
            return Some(at);
        }

        // not a standalone name here, keep looking after this hit
        match src[at..].chars().next() {
            Some(c) => from = at + c.len_utf8(),
            None => return None,
        }
    }
    None
}

/// True if `name` occurs as a delimited identifier anywhere in the unquoted
/// parts of `src`.
pub fn contains_name(src: &str, name: &str) -> CalcResult<bool> {
    let mut start = 0;
    while let Some((begin, end)) = next_unquoted(src, start)? {
        if find_name_pos(&src[begin..end], name).is_some() {
            return Ok(true);
        }
        start = end;
    }
    Ok(false)
}
