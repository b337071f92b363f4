//! Source cleanup and unsafe-SQL rejection. Formulas are user input that ends
//! up inside a SELECT, so anything that could terminate the statement or
//! smuggle DDL/DML through it is refused outright.

use lazy_regex::regex_is_match;

use crate::errors::{CalcError, CalcResult};
use crate::lexical::next_unquoted;

/// Keywords forbidden anywhere outside of quotes, scanned case-insensitively.
pub const UNSAFE_KEYWORDS: [&str; 39] = [
    "ABORT",
    "ALTER",
    "ATTACH",
    "CALL",
    "COMMIT",
    "CREATE",
    "DATABASE",
    "DELETE",
    "DETACH",
    "DISABLE",
    "DO",
    "DROP",
    "ENABLE",
    "EXEC",
    "EXECUTE",
    "GO",
    "GRANT",
    "IGNORE",
    "INDEX",
    "INSERT",
    "MERGE",
    "PROCEDURE",
    "QUERY",
    "RECURSIVE",
    "REFERENCES",
    "REINDEX",
    "RELEASE",
    "RENAME",
    "REPLACE",
    "RETURNING",
    "REVOKE",
    "ROLLBACK",
    "TABLE",
    "TRANSACTION",
    "TRIGGER",
    "TRUNCATE",
    "UPDATE",
    "VACUUM",
    "VIEW",
];

/// Replace line breaks with spaces and fold the Unicode apostrophe
/// look-alikes into the ASCII quote the rest of the pipeline expects.
pub fn clean_source(src: &str) -> String {
    src.chars()
        .map(|c| match c {
            '\r' | '\n' => ' ',
            '\u{02B9}' | '\u{02BC}' | '\u{02C8}' | '\u{2032}' | '\u{FF07}' => '\'',
            c => c,
        })
        .collect()
}

/// A keyword hit only counts when the next character ends the word: absent,
/// whitespace, control, punctuation, symbol or mark. Anything else (e.g.
/// `DROPS`) is an ordinary identifier prefix.
fn ends_word(c: Option<char>) -> bool {
    match c {
        None => true,
        Some(c) => {
            let mut buf = [0u8; 4];
            c.is_whitespace()
                || c.is_control()
                || regex_is_match!(r"[\p{P}\p{S}\p{M}]", c.encode_utf8(&mut buf))
        }
    }
}

/// Reject `;`, `--`, `\` and the reserved keywords outside of quoted text.
/// Unbalanced quotes fail here as well.
pub fn validate_source(src: &str) -> CalcResult<()> {
    let mut start = 0;

    while let Some((begin, end)) = next_unquoted(src, start)? {
        let part = &src[begin..end];

        if part.contains(';') {
            return Err(CalcError::unsafe_sql("; is not allowed", src));
        }
        if part.contains("--") {
            return Err(CalcError::unsafe_sql("-- comment is not allowed", src));
        }
        if part.contains('\\') {
            return Err(CalcError::unsafe_sql("\\ is not allowed", src));
        }

        let upper = part.to_ascii_uppercase();
        for kw in UNSAFE_KEYWORDS {
            let mut from = 0;
            while let Some(n) = upper[from..].find(kw) {
                let at = from + n;
                let after = begin + at + kw.len();
                if ends_word(src[after..].chars().next()) {
                    return Err(CalcError::unsafe_sql(format!("{kw} is not allowed"), src));
                }
                from = at + 1;
            }
        }
        start = end;
    }
    Ok(())
}

/// Clean the formula text and refuse it if anything unsafe remains.
pub fn sanitize(src: &str) -> CalcResult<String> {
    let cleaned = clean_source(src);
    validate_source(&cleaned)?;
    Ok(cleaned)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn clean_is_idempotent() {
        let src = "acc0 +\r\n \u{2032}x\u{FF07} + acc1";
        let once = clean_source(src);
        assert_eq!(clean_source(&once), once);
        assert!(!once.contains('\r') && !once.contains('\n'));
        assert_eq!(once, "acc0 +   'x' + acc1");
    }

    #[test]
    fn forbidden_punctuation() {
        assert!(validate_source("acc0; acc1").is_err());
        assert!(validate_source("acc0 -- note").is_err());
        assert!(validate_source("acc0 \\ acc1").is_err());
        assert!(validate_source("acc0 - acc1").is_ok());
    }

    #[test]
    fn keyword_rejected_unquoted_only() {
        for kw in UNSAFE_KEYWORDS {
            let bare = format!("acc0 + {kw} + acc1");
            assert!(validate_source(&bare).is_err(), "{kw} must be rejected");

            let quoted = format!("acc0 + '{kw}' + acc1");
            assert!(validate_source(&quoted).is_ok(), "'{kw}' must be accepted");
        }
    }

    #[test]
    fn keyword_case_insensitive() {
        assert!(validate_source("drop x").is_err());
        assert!(validate_source("Drop(x)").is_err());
    }

    #[test]
    fn keyword_prefix_allowed() {
        assert!(validate_source("DROPS + 1").is_ok());
        assert!(validate_source("UPDATED_VALUE").is_ok());
        assert!(validate_source("GONE").is_ok());
    }

    #[test]
    fn keyword_at_end_rejected() {
        assert!(validate_source("1 + DROP").is_err());
    }

    #[test]
    fn sanitize_fixpoint() {
        let src = "OM_DIV_BY(acc1) * 'a b'";
        let once = sanitize(src).unwrap();
        assert_eq!(sanitize(&once).unwrap(), once);
    }
}
