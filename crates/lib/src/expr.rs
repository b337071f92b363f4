//! Non-aggregation compiler: formulas over output table expressions. Every
//! referenced expression gets a `cs<k>` CTE; the main SELECT joins them by
//! run and dimensions, with a dimension-only join onto the variant side for
//! run comparisons.

use indexmap::IndexSet;
use itertools::Itertools;
use log::debug;

use crate::columns::{NameUse, ParamCols, Suffix};
use crate::layout::CalculateLayout;
use crate::meta::TableMeta;
use crate::params::{id_list, param_ref, single_run_ids};
use crate::resolver::{check_compare_forms, check_unresolved, replace_names, scan_names};
use calcsql_lib_core::errors::CalcResult;
use calcsql_lib_core::fnc::translate_all_simple_fnc;
use calcsql_lib_core::sanitize::sanitize;

/// One compiled UNION branch with the CTEs it depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatedBranch {
    pub ctes: Vec<String>,
    pub main_sql: String,
    pub is_compare: bool,
}

/// `src<k>` column alias, prefixed with underscores until it collides with
/// no expression name.
fn src_alias(table: &TableMeta, k: i32) -> String {
    let mut alias = format!("src{k}");
    while table.exprs.iter().any(|e| e.name == alias) {
        alias.insert(0, '_');
    }
    alias
}

/// Compile one expression-dialect calculation into a UNION branch.
pub fn translate_expr_calc(
    table: &TableMeta,
    calc: &CalculateLayout,
    from_id: i32,
    extras: &[i32],
    dim_filters: &[String],
    params: &mut ParamCols,
) -> CalcResult<TranslatedBranch> {
    let formula = translate_all_simple_fnc(&sanitize(&calc.calculate)?)?;

    let mut names: Vec<String> = table.exprs.iter().map(|e| e.name.clone()).collect();
    let expr_count = names.len();
    names.extend(params.keys().cloned().sorted());

    // usage pass
    let mut uses = vec![NameUse::default(); expr_count];
    scan_names(&formula, &names, |idx, suffix| {
        if idx < expr_count {
            uses[idx].record(suffix);
        } else if let Some(p) = params.get_mut(&names[idx]) {
            p.used.record(suffix);
        }
    })?;

    let is_compare = check_compare_forms(
        table
            .exprs
            .iter()
            .zip(&uses)
            .map(|(e, u)| (e.name.as_str(), *u)),
        params,
        "output table expressions",
        &formula,
    )?;

    // expression ids of the base and variant side joins
    let used_base: Vec<usize> = (0..expr_count)
        .filter(|&k| uses[k].is_simple || uses[k].is_base)
        .collect();
    let used_var: Vec<usize> = (0..expr_count).filter(|&k| uses[k].is_var).collect();
    let k_min = used_base[0];
    let k_var_min = used_var.first().copied();

    // replacement pass
    let mut param_joins: IndexSet<String> = IndexSet::default();
    let value_expr = replace_names(&formula, &names, |idx, suffix| {
        if idx < expr_count {
            let expr_id = table.exprs[idx].expr_id;
            let src = src_alias(table, expr_id);
            Ok(match suffix {
                Suffix::None | Suffix::Base => {
                    if idx == k_min {
                        format!("B.{src}")
                    } else {
                        format!("B{expr_id}.{src}")
                    }
                }
                Suffix::Variant => {
                    if Some(idx) == k_var_min {
                        format!("V.{src}")
                    } else {
                        format!("V{expr_id}.{src}")
                    }
                }
            })
        } else {
            let p = params
                .get_mut(&names[idx])
                .expect("scanned name is present");
            let (col_ref, join) = param_ref(p, suffix, "B", "V", &formula)?;
            param_joins.insert(join);
            Ok(col_ref)
        }
    })?;
    check_unresolved(&value_expr)?;

    // one CTE per referenced expression id
    let dims_cols = || table.dims.iter().map(|d| d.col_name.as_str());
    let ctes = used_base
        .iter()
        .chain(&used_var)
        .copied()
        .sorted()
        .dedup()
        .map(|k| {
            let expr_id = table.exprs[k].expr_id;
            let dim_list = dims_cols().map(|d| format!(", C.{d}")).join("");
            format!(
                "cs{expr_id} (run_id{}, {}) AS \
                 (SELECT BR.run_id{dim_list}, C.expr_value FROM {} C \
                 INNER JOIN run_table BR ON (BR.base_run_id = C.run_id AND BR.table_hid = {}) \
                 WHERE C.expr_id = {expr_id})",
                dims_cols().map(|d| format!(", {d}")).join(""),
                src_alias(table, expr_id),
                table.db_expr_table,
                table.table_hid,
            )
        })
        .collect_vec();

    // main SELECT: row key is the variant run in a comparison
    let run_key = if is_compare { "V" } else { "B" };
    let mut sql = format!("SELECT {run_key}.run_id, {} AS calc_id", calc.calc_id);
    for d in dims_cols() {
        sql.push_str(&format!(", B.{d}"));
    }
    sql.push_str(&format!(
        ", {value_expr} AS calc_value FROM cs{} B",
        table.exprs[k_min].expr_id
    ));

    for &k in used_base.iter().filter(|&&k| k != k_min) {
        let expr_id = table.exprs[k].expr_id;
        let mut on = vec![format!("B{expr_id}.run_id = B.run_id")];
        on.extend(dims_cols().map(|d| format!("B{expr_id}.{d} = B.{d}")));
        sql.push_str(&format!(
            " INNER JOIN cs{expr_id} B{expr_id} ON ({})",
            on.into_iter().join(" AND ")
        ));
    }

    if let Some(kv) = k_var_min {
        let on = dims_cols().map(|d| format!("V.{d} = B.{d}")).join(" AND ");
        let on = if on.is_empty() { "1 = 1".to_owned() } else { on };
        sql.push_str(&format!(
            " INNER JOIN cs{} V ON ({on})",
            table.exprs[kv].expr_id
        ));

        for &k in used_var.iter().filter(|&&k| Some(k) != k_var_min) {
            let expr_id = table.exprs[k].expr_id;
            let mut on = vec![format!("V{expr_id}.run_id = V.run_id")];
            on.extend(dims_cols().map(|d| format!("V{expr_id}.{d} = B.{d}")));
            sql.push_str(&format!(
                " INNER JOIN cs{expr_id} V{expr_id} ON ({})",
                on.into_iter().join(" AND ")
            ));
        }
    }

    for join in &param_joins {
        sql.push(' ');
        sql.push_str(join);
    }

    let run_filter = if is_compare {
        format!("B.run_id = {from_id} AND V.run_id IN ({})", id_list(extras))
    } else {
        format!("B.run_id IN ({})", id_list(&single_run_ids(from_id, extras)))
    };
    sql.push_str(&format!(" WHERE {run_filter}"));
    for f in dim_filters {
        sql.push_str(&format!(" AND {f}"));
    }

    debug!("calc {}: {sql}", calc.calc_id);
    Ok(TranslatedBranch {
        ctes,
        main_sql: sql,
        is_compare,
    })
}
