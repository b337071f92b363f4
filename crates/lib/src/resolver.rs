//! Name resolution over formula text: locate expression, accumulator,
//! attribute and parameter references in unquoted text, track their
//! `[base]`/`[variant]` forms and substitute aliased SQL column references.
//! The dialect decides what a reference turns into; this module only finds
//! and splices.

use itertools::Itertools;

use crate::columns::{NameUse, ParamCols, Suffix};
use calcsql_lib_core::errors::{CalcError, CalcResult};
use calcsql_lib_core::lexical::{find_name_pos, next_unquoted};

const BASE_SUFFIX: &str = "[base]";
const VARIANT_SUFFIX: &str = "[variant]";

/// A located reference: name index, byte span including the suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NameMatch {
    at: usize,
    end: usize,
    idx: usize,
    suffix: Suffix,
}

fn find_next_name(src: &str, names: &[impl AsRef<str>]) -> CalcResult<Option<NameMatch>> {
    let mut start = 0;

    while let Some((begin, end)) = next_unquoted(src, start)? {
        let region = &src[begin..end];

        let mut best: Option<NameMatch> = None;
        for (idx, name) in names.iter().enumerate() {
            let name = name.as_ref();
            if name.is_empty() {
                continue;
            }
            let Some(p) = find_name_pos(region, name) else {
                continue;
            };
            let at = begin + p;
            if best.is_none_or(|b| at < b.at) {
                let after = p + name.len();
                let (suffix, suffix_len) = if region[after..].starts_with(BASE_SUFFIX) {
                    (Suffix::Base, BASE_SUFFIX.len())
                } else if region[after..].starts_with(VARIANT_SUFFIX) {
                    (Suffix::Variant, VARIANT_SUFFIX.len())
                } else {
                    (Suffix::None, 0)
                };
                best = Some(NameMatch {
                    at,
                    end: begin + after + suffix_len,
                    idx,
                    suffix,
                });
            }
        }
        if best.is_some() {
            return Ok(best);
        }
        start = end;
    }
    Ok(None)
}

/// Visit every reference without rewriting; the usage-detection pass.
pub fn scan_names(
    src: &str,
    names: &[impl AsRef<str>],
    mut visit: impl FnMut(usize, Suffix),
) -> CalcResult<()> {
    let mut rest = src;
    while let Some(m) = find_next_name(rest, names)? {
        visit(m.idx, m.suffix);
        rest = &rest[m.end..];
    }
    Ok(())
}

/// Replace every reference with the text the closure supplies. Replacement
/// text is spliced in and never rescanned, so generated aliases cannot
/// collide with user names.
pub fn replace_names(
    src: &str,
    names: &[impl AsRef<str>],
    mut repl: impl FnMut(usize, Suffix) -> CalcResult<String>,
) -> CalcResult<String> {
    let mut out = String::with_capacity(src.len());
    let mut rest = src;

    while let Some(m) = find_next_name(rest, names)? {
        out.push_str(&rest[..m.at]);
        out.push_str(&repl(m.idx, m.suffix)?);
        rest = &rest[m.end..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Enforce the suffix discipline over one formula and report whether it is a
/// run comparison: either every source reference is bare, or `[base]` and
/// `[variant]` are both present and no bare form is. Parameters must follow
/// the formula's regime.
pub fn check_compare_forms<'a>(
    used: impl IntoIterator<Item = (&'a str, NameUse)>,
    params: &ParamCols,
    kind: &str,
    src: &str,
) -> CalcResult<bool> {
    let mut any = NameUse::default();
    let mut first_suffixed: Option<&str> = None;

    for (name, u) in used {
        if u.is_simple {
            any.is_simple = true;
        }
        if u.is_base {
            any.is_base = true;
            first_suffixed.get_or_insert(name);
        }
        if u.is_var {
            any.is_var = true;
            first_suffixed.get_or_insert(name);
        }
    }

    if !any.any() {
        return Err(CalcError::NoExpressionNames {
            kind: kind.to_owned(),
            src: src.to_owned(),
        });
    }

    let mixed_name = |name: Option<&str>| CalcError::MixedNameForms {
        name: name.unwrap_or_default().to_owned(),
        src: src.to_owned(),
    };

    if any.is_simple && (any.is_base || any.is_var) {
        return Err(mixed_name(first_suffixed));
    }
    if !any.is_simple && (any.is_base != any.is_var) {
        return Err(mixed_name(first_suffixed));
    }
    let is_compare = any.is_base && any.is_var;

    for p in params
        .values()
        .filter(|p| p.used.any())
        .sorted_by(|a, b| a.name.cmp(&b.name))
    {
        let bad = if is_compare {
            p.used.is_simple
        } else {
            p.used.is_base || p.used.is_var
        };
        if bad {
            return Err(CalcError::MixedNameForms {
                name: p.name.clone(),
                src: src.to_owned(),
            });
        }
    }
    Ok(is_compare)
}

/// After substitution nothing that looks like an unresolved reference may
/// remain in unquoted text.
pub fn check_unresolved(src: &str) -> CalcResult<()> {
    let mut start = 0;
    while let Some((begin, end)) = next_unquoted(src, start)? {
        let region = &src[begin..end];
        for token in [crate::columns::PARAM_PREFIX, BASE_SUFFIX, VARIANT_SUFFIX] {
            if let Some(p) = region.find(token) {
                return Err(CalcError::UnresolvedName {
                    name: ident_around(region, p, token.len()).to_owned(),
                    src: src.to_owned(),
                });
            }
        }
        start = end;
    }
    Ok(())
}

/// Widen `region[p..p + len]` to the whole identifier-like run around it,
/// for error messages.
fn ident_around(region: &str, p: usize, len: usize) -> &str {
    let stop = |c: char| c.is_whitespace() || ",()+-*/%^|&~!=<>".contains(c);

    let begin = region[..p].rfind(stop).map_or(0, |n| n + 1);
    let end = region[p + len..]
        .find(stop)
        .map_or(region.len(), |n| p + len + n);
    &region[begin..end]
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::columns::ParamCol;

    fn names() -> Vec<&'static str> {
        vec!["acc0", "acc1", "param.Scale"]
    }

    #[test]
    fn scan_records_suffixes() {
        let mut seen = Vec::new();
        scan_names(
            "acc0[variant] - acc0[base] + acc1 * param.Scale[base]",
            &names(),
            |idx, suffix| seen.push((idx, suffix)),
        )
        .unwrap();
        assert_eq!(
            seen,
            vec![
                (0, Suffix::Variant),
                (0, Suffix::Base),
                (1, Suffix::None),
                (2, Suffix::Base),
            ]
        );
    }

    #[test]
    fn replace_splices_left_to_right() {
        let out = replace_names("acc0 + 2 * acc1", &names(), |idx, _| {
            Ok(format!("M1.c{idx}"))
        })
        .unwrap();
        assert_eq!(out, "M1.c0 + 2 * M1.c1");
    }

    #[test]
    fn replacement_not_rescanned() {
        // the replacement text contains a listed name, it must survive
        let out = replace_names("acc0", &names(), |_, _| Ok("X.acc0".to_owned())).unwrap();
        assert_eq!(out, "X.acc0");
    }

    #[test]
    fn quoted_references_kept() {
        let out =
            replace_names("'acc0' + acc0", &names(), |_, _| Ok("M1.v".to_owned())).unwrap();
        assert_eq!(out, "'acc0' + M1.v");
    }

    #[test]
    fn unresolved_reference_reported() {
        let err = check_unresolved("A.v + param.Missing").unwrap_err();
        assert_eq!(
            err,
            CalcError::UnresolvedName {
                name: "param.Missing".to_owned(),
                src: "A.v + param.Missing".to_owned(),
            }
        );
        assert!(check_unresolved("A.v + B.v").is_ok());
    }

    #[test]
    fn stray_suffix_reported() {
        assert!(check_unresolved("M1.v + Other[base]").is_err());
    }

    fn param_cols(used: NameUse) -> ParamCols {
        let mut m = ParamCols::default();
        m.insert(
            "param.Scale".to_owned(),
            ParamCol {
                name: "Scale".to_owned(),
                param_hid: 103,
                db_run_table: "Scale_p".to_owned(),
                is_number: true,
                used,
            },
        );
        m
    }

    #[test]
    fn form_discipline() {
        let bare = NameUse {
            is_simple: true,
            ..Default::default()
        };
        let both = NameUse {
            is_base: true,
            is_var: true,
            ..Default::default()
        };
        let base_only = NameUse {
            is_base: true,
            ..Default::default()
        };
        let no_params = ParamCols::default();

        // single-run and comparison are both fine
        assert!(!check_compare_forms([("e", bare)], &no_params, "x", "f").unwrap());
        assert!(check_compare_forms([("e", both)], &no_params, "x", "f").unwrap());

        // one-sided or mixed with bare is not
        assert!(check_compare_forms([("e", base_only)], &no_params, "x", "f").is_err());
        assert!(check_compare_forms([("e", bare), ("g", both)], &no_params, "x", "f").is_err());

        // nothing referenced at all
        assert!(matches!(
            check_compare_forms([], &no_params, "x", "f"),
            Err(CalcError::NoExpressionNames { .. })
        ));

        // parameters must follow the formula's regime
        assert!(check_compare_forms([("e", both)], &param_cols(bare), "x", "f").is_err());
        assert!(check_compare_forms([("e", bare)], &param_cols(base_only), "x", "f").is_err());
        assert!(check_compare_forms([("e", both)], &param_cols(base_only), "x", "f").is_ok());
    }
}
