//! Final SQL assembly: CTE chain, UNION of branches, value filters and
//! ORDER BY. Duplicate branches and CTEs are silently dropped, first
//! occurrence wins.

use indexmap::IndexSet;
use itertools::Itertools;

use crate::filter::{make_order_by, make_value_filter};
use crate::layout::{FilterColumn, OrderByColumn};
use calcsql_lib_core::errors::CalcResult;

/// One UNION branch, already compiled.
#[derive(Debug, Clone)]
pub(crate) struct Branch {
    pub calc_id: i32,
    /// Output name, matched against value filter names.
    pub name: String,
    pub sql: String,
}

/// Alias of the terminal CTE wrapping the UNION when value filters apply.
const WRAP_ALIAS: &str = "A";

pub(crate) fn assemble_sql(
    ctes: &IndexSet<String>,
    branches: &[Branch],
    value_filters: &[FilterColumn],
    out_cols: &[String],
    order_by: &[OrderByColumn],
) -> CalcResult<String> {
    // first occurrence wins, input order kept
    let mut seen: IndexSet<&str> = IndexSet::default();
    let branches: Vec<&Branch> = branches
        .iter()
        .filter(|b| seen.insert(b.sql.as_str()))
        .collect();

    let union = branches.iter().map(|b| &b.sql).join(" UNION ALL ");
    let order = make_order_by(out_cols.len(), 2, order_by);
    let with = format!("WITH {}", ctes.iter().join(", "));

    if value_filters.is_empty() {
        return Ok(format!("{with} {union} {order}"));
    }

    // value filters go over a terminal CTE: the measure is an output alias
    // and aggregation branches compute it under GROUP BY, so no branch WHERE
    // can hold it. Each filtered calc gets its qualified predicate, every
    // other branch passes through untouched.
    let mut preds: Vec<String> = Vec::new();
    for b in &branches {
        let conds = value_filters
            .iter()
            .filter(|f| f.name == b.name)
            .map(|f| make_value_filter(WRAP_ALIAS, b.calc_id, &f.name, f.op, &f.values))
            .collect::<CalcResult<Vec<_>>>()?;
        if conds.is_empty() {
            preds.push(format!("{WRAP_ALIAS}.calc_id = {}", b.calc_id));
        } else {
            preds.push(conds.into_iter().join(" AND "));
        }
    }

    let col_list = std::iter::once("run_id")
        .chain(std::iter::once("calc_id"))
        .chain(out_cols.iter().map(String::as_str))
        .chain(std::iter::once("calc_value"))
        .join(", ");

    Ok(format!(
        "{with}, {WRAP_ALIAS} ({col_list}) AS ({union}) \
         SELECT {col_list} FROM {WRAP_ALIAS} WHERE {} {order}",
        preds.into_iter().join(" OR ")
    ))
}
