//! Dimension/attribute filters, measure value filters and ORDER BY
//! composition.

use itertools::Itertools;

use crate::layout::{FilterOp, OrderByColumn};
use crate::meta::TypeMeta;
use calcsql_lib_core::errors::{CalcError, CalcResult};

/// Resolve filter enum codes to enum ids through the column type.
pub fn resolve_codes(type_of: &TypeMeta, name: &str, codes: &[String]) -> CalcResult<Vec<i32>> {
    codes
        .iter()
        .map(|code| {
            type_of
                .enum_id_by_code(code)
                .ok_or_else(|| CalcError::EnumCodeUnknown {
                    name: name.to_owned(),
                    code: code.clone(),
                })
        })
        .collect()
}

fn bad_arity(name: &str, op: FilterOp) -> CalcError {
    CalcError::BadFilterArity {
        name: name.to_owned(),
        op: op.as_ref().to_owned(),
    }
}

/// `IN_AUTO` picks the narrowest operator for the id list: a single id
/// compares equal, a list covering its whole enum-domain span becomes
/// BETWEEN, anything else stays IN.
fn lower_auto(type_of: &TypeMeta, name: &str, ids: &[i32]) -> CalcResult<FilterOp> {
    if !type_of.is_enum_based() {
        return Err(CalcError::AutoFilterNoEnum {
            name: name.to_owned(),
        });
    }
    if ids.len() == 1 {
        return Ok(FilterOp::Equal);
    }
    let lo = ids.iter().min().copied().unwrap_or_default();
    let hi = ids.iter().max().copied().unwrap_or_default();

    let contiguous = type_of
        .enums
        .iter()
        .filter(|e| lo <= e.enum_id && e.enum_id <= hi)
        .all(|e| ids.contains(&e.enum_id));
    Ok(if contiguous {
        FilterOp::Between
    } else {
        FilterOp::In
    })
}

/// One dimension (or group attribute) filter as a WHERE conjunct on `alias`.
pub fn make_dim_filter(
    alias: &str,
    col_name: &str,
    type_of: &TypeMeta,
    name: &str,
    op: FilterOp,
    enum_ids: &[i32],
) -> CalcResult<String> {
    if enum_ids.is_empty() {
        return Err(bad_arity(name, op));
    }
    match op {
        FilterOp::Equal => {
            if enum_ids.len() != 1 {
                return Err(bad_arity(name, FilterOp::Equal));
            }
            Ok(format!("{alias}.{col_name} = {}", enum_ids[0]))
        }
        FilterOp::Between => {
            if enum_ids.len() != 2 {
                return Err(bad_arity(name, FilterOp::Between));
            }
            Ok(format!(
                "{alias}.{col_name} BETWEEN {} AND {}",
                enum_ids[0], enum_ids[1]
            ))
        }
        FilterOp::In => Ok(format!(
            "{alias}.{col_name} IN ({})",
            enum_ids.iter().join(", ")
        )),
        FilterOp::InAuto => match lower_auto(type_of, name, enum_ids)? {
            FilterOp::Equal => Ok(format!("{alias}.{col_name} = {}", enum_ids[0])),
            // the observed span, not a pair of bounds
            FilterOp::Between => {
                let (lo, hi) = enum_ids
                    .iter()
                    .minmax()
                    .into_option()
                    .unwrap_or((&0, &0));
                Ok(format!("{alias}.{col_name} BETWEEN {lo} AND {hi}"))
            }
            _ => Ok(format!(
                "{alias}.{col_name} IN ({})",
                enum_ids.iter().join(", ")
            )),
        },
    }
}

/// Value filter on one calculation's measure, applied over the terminal CTE:
/// qualified by calc id so other UNION branches stay unaffected.
pub fn make_value_filter(
    alias: &str,
    calc_id: i32,
    name: &str,
    op: FilterOp,
    values: &[String],
) -> CalcResult<String> {
    let nums: Vec<f64> = values
        .iter()
        .map(|v| {
            v.trim()
                .parse::<f64>()
                .map_err(|_| CalcError::BadFilterValue {
                    name: name.to_owned(),
                    value: v.clone(),
                })
        })
        .collect::<CalcResult<_>>()?;

    let cond = match op {
        FilterOp::Equal => {
            if nums.len() != 1 {
                return Err(bad_arity(name, op));
            }
            format!("{alias}.calc_value = {}", nums[0])
        }
        FilterOp::Between => {
            if nums.len() != 2 {
                return Err(bad_arity(name, op));
            }
            format!("{alias}.calc_value BETWEEN {} AND {}", nums[0], nums[1])
        }
        FilterOp::In => {
            if nums.is_empty() {
                return Err(bad_arity(name, op));
            }
            format!("{alias}.calc_value IN ({})", nums.iter().join(", "))
        }
        FilterOp::InAuto => {
            return Err(CalcError::AutoFilterNoEnum {
                name: name.to_owned(),
            });
        }
    };
    Ok(format!("({alias}.calc_id = {calc_id} AND {cond})"))
}

/// Equality join over a column list, e.g. `R.dim0 = L.dim0 AND …`; `(1 = 1)`
/// keeps the join valid when the list is empty.
pub fn eq_join<'a>(
    cols: impl IntoIterator<Item = &'a str>,
    left_alias: &str,
    right_alias: &str,
) -> String {
    let on = cols
        .into_iter()
        .map(|c| format!("{left_alias}.{c} = {right_alias}.{c}"))
        .join(" AND ");
    if on.is_empty() { "1 = 1".to_owned() } else { on }
}

/// ORDER BY clause: explicit 1-based positions, or positions
/// `1..=prefix + rank` when the caller gave none.
pub fn make_order_by(rank: usize, prefix: usize, order_by: &[OrderByColumn]) -> String {
    let cols = if order_by.is_empty() {
        (1..=prefix + rank).map(|i| i.to_string()).join(", ")
    } else {
        order_by
            .iter()
            .map(|c| {
                if c.desc {
                    format!("{} DESC", c.index)
                } else {
                    c.index.to_string()
                }
            })
            .join(", ")
    };
    if cols.is_empty() {
        String::new()
    } else {
        format!("ORDER BY {cols}")
    }
}
