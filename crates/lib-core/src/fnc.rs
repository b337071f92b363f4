//! Pseudo-function discovery and the non-aggregating rewrites. `OM_IF` and
//! `OM_DIV_BY` expand to plain `CASE` expressions in place; the aggregating
//! `OM_*` family is only located here, translation happens in the leveler.

use log::trace;

use crate::errors::{CalcError, CalcResult};
use crate::lexical::{next_unquoted, skip_quoted};

/// Functions rewritten in place, without aggregation.
pub const SIMPLE_FNC_NAMES: [&str; 2] = ["OM_IF", "OM_DIV_BY"];

/// Aggregation functions, hoisted level by level.
pub const AGGR_FNC_NAMES: [&str; 9] = [
    "OM_AVG", "OM_SUM", "OM_COUNT", "OM_MIN", "OM_MAX", "OM_VAR", "OM_SD", "OM_SE", "OM_CV",
];

/// A located `name ( … )` call: byte offsets of the name, the opening and the
/// closing parenthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FncCall<'a> {
    pub name: &'a str,
    pub name_pos: usize,
    pub open_pos: usize,
    pub close_pos: usize,
}

impl FncCall<'_> {
    /// Argument text between the parentheses, untrimmed.
    pub fn arg<'s>(&self, src: &'s str) -> &'s str {
        &src[self.open_pos + 1..self.close_pos]
    }
}

fn malformed(name: &str, src: &str) -> CalcError {
    CalcError::MalformedCall {
        name: name.to_owned(),
        src: src.to_owned(),
    }
}

/// Locate the leftmost call to any of `names` in the unquoted parts of `src`.
/// The name must be delimited on the left like any identifier; what follows
/// (after optional whitespace) must be a balanced parenthesis group, anything
/// else is a malformed call.
pub fn find_first_fnc<'a>(src: &str, names: &[&'a str]) -> CalcResult<Option<FncCall<'a>>> {
    let mut start = 0;

    while let Some((begin, end)) = next_unquoted(src, start)? {
        let region = &src[begin..end];

        let mut leftmost: Option<(usize, &'a str)> = None;
        for &name in names {
            if let Some(p) = find_fnc_name(region, name)
                && leftmost.is_none_or(|(at, _)| begin + p < at)
            {
                leftmost = Some((begin + p, name));
            }
        }

        if let Some((name_pos, name)) = leftmost {
            let call = parse_call(src, name, name_pos)?;
            return Ok(Some(call));
        }
        start = end;
    }
    Ok(None)
}

/// Like [`crate::lexical::find_name_pos`] but the follower must open the
/// argument list, so only the left delimiter is checked here.
fn find_fnc_name(region: &str, name: &str) -> Option<usize> {
    let mut from = 0;

    while let Some(n) = region[from..].find(name) {
        let at = from + n;
        let left_ok = match region[..at].chars().next_back() {
            None => true,
            Some(c) => c.is_whitespace() || ",(+-*/%^|&~!=<>".contains(c),
        };
        if left_ok {
            return Some(at);
        }
        match region[at..].chars().next() {
            Some(c) => from = at + c.len_utf8(),
            None => return None,
        }
    }
    None
}

/// Scan the argument list of a call whose name starts at `name_pos`.
fn parse_call<'a>(src: &str, name: &'a str, name_pos: usize) -> CalcResult<FncCall<'a>> {
    let bytes = src.as_bytes();
    let mut pos = name_pos + name.len();

    while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
        pos += 1;
    }
    if pos >= bytes.len() || bytes[pos] != b'(' {
        return Err(malformed(name, src));
    }
    let open_pos = pos;

    let mut depth = 0i32;
    while pos < bytes.len() {
        match bytes[pos] {
            b'\'' => pos = skip_quoted(src, pos)?,
            b'(' => {
                depth += 1;
                pos += 1;
            }
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(FncCall {
                        name,
                        name_pos,
                        open_pos,
                        close_pos: pos,
                    });
                }
                pos += 1;
            }
            _ => pos += 1,
        }
    }
    Err(malformed(name, src))
}

/// Translate one simple call with its argument already extracted.
fn translate_simple_fnc(name: &str, arg: &str, src: &str) -> CalcResult<String> {
    match name {
        // argument text is pasted verbatim, THEN/ELSE included
        "OM_IF" => Ok(format!("CASE WHEN {arg} END")),
        "OM_DIV_BY" => Ok(format!(
            "CASE WHEN ABS({arg}) > 1.0e-37 THEN {arg} ELSE NULL END"
        )),
        _ => Err(CalcError::UnknownFunction {
            name: name.to_owned(),
            src: src.to_owned(),
        }),
    }
}

/// Rewrite every `OM_IF` and `OM_DIV_BY` call. Replacement text is never
/// rescanned as a whole, but arguments pasted back in are, so nested calls
/// resolve on later iterations; the loop runs to a fixpoint.
pub fn translate_all_simple_fnc(src: &str) -> CalcResult<String> {
    let mut expr = src.to_owned();

    while let Some(call) = find_first_fnc(&expr, &SIMPLE_FNC_NAMES)? {
        let arg = call.arg(&expr).trim().to_owned();
        if arg.is_empty() {
            return Err(CalcError::EmptyArgument {
                name: call.name.to_owned(),
                src: expr,
            });
        }
        let replacement = translate_simple_fnc(call.name, &arg, &expr)?;
        trace!("{} -> {replacement}", call.name);
        expr = format!(
            "{}{}{}",
            &expr[..call.name_pos],
            replacement,
            &expr[call.close_pos + 1..]
        );
    }
    Ok(expr)
}
