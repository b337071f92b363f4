//! Scalar parameter support: reference rendering, the `par_`/`pbase_`/`pvar_`
//! CTEs and the run-id list helpers shared by both compiler dialects.
//! Parameter sub-values are averaged per run, so a reference is always a
//! single number per run.

use itertools::Itertools;

use crate::columns::{ParamCol, ParamCols, Suffix};
use calcsql_lib_core::errors::{CalcError, CalcResult};

/// `runIds` minus the base run, ascending and deduplicated.
pub fn make_extras(from_id: i32, run_ids: &[i32]) -> Vec<i32> {
    let mut extras: Vec<i32> = run_ids
        .iter()
        .copied()
        .filter(|&id| id != from_id)
        .collect();
    extras.sort_unstable();
    extras.dedup();
    extras
}

/// Run list of a single-run read: the base run first, then the extras.
pub fn single_run_ids(from_id: i32, extras: &[i32]) -> Vec<i32> {
    let mut ids = Vec::with_capacity(extras.len() + 1);
    ids.push(from_id);
    ids.extend_from_slice(extras);
    ids
}

pub fn id_list(ids: &[i32]) -> String {
    ids.iter().join(", ")
}

/// Render one parameter reference: the aliased column and the inner join the
/// enclosing SELECT needs. `run_alias`/`var_run_alias` qualify the run id the
/// join matches on (bare and `[variant]` forms respectively).
pub fn param_ref(
    p: &mut ParamCol,
    suffix: Suffix,
    run_alias: &str,
    var_run_alias: &str,
    src: &str,
) -> CalcResult<(String, String)> {
    if !p.is_number {
        return Err(CalcError::NonScalarParameter {
            name: p.name.clone(),
            src: src.to_owned(),
        });
    }
    p.used.record(suffix);

    let hid = p.param_hid;
    Ok(match suffix {
        Suffix::None => (
            format!("BP{hid}.param_value"),
            format!("INNER JOIN par_{hid} BP{hid} ON (BP{hid}.run_id = {run_alias}.run_id)"),
        ),
        // single row, no join key
        Suffix::Base => (
            format!("PB{hid}.param_base"),
            format!("INNER JOIN pbase_{hid} PB{hid} ON (1 = 1)"),
        ),
        Suffix::Variant => (
            format!("PV{hid}.param_var"),
            format!("INNER JOIN pvar_{hid} PV{hid} ON (PV{hid}.run_id = {var_run_alias}.run_id)"),
        ),
    })
}

/// CTEs for every referenced parameter, in ascending parameter hid: `par_`
/// for bare use, `pbase_` for `[base]`, `pvar_` for `[variant]`.
pub fn make_param_ctes(
    params: &ParamCols,
    from_id: i32,
    extras: &[i32],
    src: &str,
) -> CalcResult<Vec<String>> {
    let mut ctes = Vec::new();

    for p in params
        .values()
        .filter(|p| p.used.any())
        .sorted_by_key(|p| p.param_hid)
    {
        let hid = p.param_hid;
        let tbl = &p.db_run_table;
        let join = format!(
            "INNER JOIN run_parameter RP ON (RP.base_run_id = C.run_id AND RP.parameter_hid = {hid})"
        );

        if p.used.is_simple {
            ctes.push(format!(
                "par_{hid} (run_id, param_value) AS \
                 (SELECT RP.run_id, AVG(C.param_value) FROM {tbl} C {join} \
                 WHERE RP.run_id IN ({}) GROUP BY RP.run_id)",
                id_list(&single_run_ids(from_id, extras)),
            ));
        }
        if p.used.is_base {
            ctes.push(format!(
                "pbase_{hid} (param_base) AS \
                 (SELECT AVG(C.param_value) FROM {tbl} C {join} WHERE RP.run_id = {from_id})",
            ));
        }
        if p.used.is_var {
            if extras.is_empty() {
                return Err(CalcError::EmptyVariantList {
                    name: p.name.clone(),
                    src: src.to_owned(),
                });
            }
            ctes.push(format!(
                "pvar_{hid} (run_id, param_var) AS \
                 (SELECT RP.run_id, AVG(C.param_value) FROM {tbl} C {join} \
                 WHERE RP.run_id IN ({}) GROUP BY RP.run_id)",
                id_list(extras),
            ));
        }
    }
    Ok(ctes)
}
