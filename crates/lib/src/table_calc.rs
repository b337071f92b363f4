//! Output table entry point: compiles every calculation of a request into
//! one `WITH … SELECT … UNION ALL …` over expression or accumulator rows.

use indexmap::IndexSet;
use itertools::Itertools;
use log::debug;

use crate::assemble::{Branch, assemble_sql};
use crate::columns::{make_param_cols, table_aggr_cols};
use crate::expr::translate_expr_calc;
use crate::filter::{make_dim_filter, resolve_codes};
use crate::layout::{
    CalculateLayout, CalculateTableLayout, ColumnKind, CompiledCalc, FilterColumn, FilterOp,
    RowColumn, RowShape,
};
use crate::leveler::{AggrSetup, SRC_CTE, emit_level_tail, translate_aggr};
use crate::meta::{ModelMeta, TableMeta};
use crate::params::{id_list, make_extras, make_param_ctes, single_run_ids};
use calcsql_lib_core::errors::{CalcError, CalcResult};
use calcsql_lib_core::fnc::translate_all_simple_fnc;
use calcsql_lib_core::sanitize::sanitize;

/// Accumulator source CTE shared by every aggregation branch of a table.
fn table_src_cte(table: &TableMeta) -> String {
    let dims: String = table
        .dims
        .iter()
        .map(|d| format!(", {}", d.col_name))
        .collect();
    let c_dims: String = table
        .dims
        .iter()
        .map(|d| format!(", C.{}", d.col_name))
        .collect();
    format!(
        "{SRC_CTE} (run_id, acc_id, sub_id{dims}, acc_value) AS \
         (SELECT BR.run_id, C.acc_id, C.sub_id{c_dims}, C.acc_value FROM {} C \
         INNER JOIN run_table BR ON (BR.base_run_id = C.run_id AND BR.table_hid = {}))",
        table.db_acc_table, table.table_hid,
    )
}

/// Filters resolved to enum ids, keyed to dimensions; value filters kept
/// verbatim for the assembly step.
pub(crate) struct SplitFilters {
    /// `(dimension index, operator, enum ids)`
    pub dims: Vec<(usize, FilterOp, Vec<i32>)>,
    pub value: Vec<FilterColumn>,
}

fn split_table_filters(
    table: &TableMeta,
    calcs: &[CalculateLayout],
    filters: &[FilterColumn],
    filter_ids: &[crate::layout::FilterIdColumn],
) -> CalcResult<SplitFilters> {
    let mut split = SplitFilters {
        dims: Vec::new(),
        value: Vec::new(),
    };

    for f in filters {
        if let Some(di) = table.dims.iter().position(|d| d.name == f.name) {
            let ids = resolve_codes(&table.dims[di].type_of, &f.name, &f.values)?;
            split.dims.push((di, f.op, ids));
        } else if calcs.iter().any(|c| c.name == f.name) {
            split.value.push(f.clone());
        } else {
            return Err(CalcError::UnknownAttribute {
                name: f.name.clone(),
                within: table.name.clone(),
            });
        }
    }
    for f in filter_ids {
        if let Some(di) = table.dims.iter().position(|d| d.name == f.name) {
            split.dims.push((di, f.op, f.enum_ids.clone()));
        } else if calcs.iter().any(|c| c.name == f.name) {
            split.value.push(FilterColumn {
                name: f.name.clone(),
                op: f.op,
                values: f.enum_ids.iter().map(|id| id.to_string()).collect(),
            });
        } else {
            return Err(CalcError::UnknownAttribute {
                name: f.name.clone(),
                within: table.name.clone(),
            });
        }
    }
    Ok(split)
}

/// WHERE conjuncts of the resolved dimension filters, on one table alias.
fn dim_filter_sql(table: &TableMeta, split: &SplitFilters, alias: &str) -> CalcResult<Vec<String>> {
    split
        .dims
        .iter()
        .map(|(di, op, ids)| {
            let d = &table.dims[*di];
            make_dim_filter(alias, &d.col_name, &d.type_of, &d.name, *op, ids)
        })
        .collect()
}

fn table_row_shape(table: &TableMeta) -> RowShape {
    let mut columns = vec![
        RowColumn {
            name: "run_id".to_owned(),
            kind: ColumnKind::Int,
            nullable: false,
        },
        RowColumn {
            name: "calc_id".to_owned(),
            kind: ColumnKind::Int,
            nullable: false,
        },
    ];
    columns.extend(table.dims.iter().map(|d| RowColumn {
        name: d.name.clone(),
        kind: ColumnKind::EnumId,
        nullable: false,
    }));
    columns.push(RowColumn {
        name: "calc_value".to_owned(),
        kind: ColumnKind::Double,
        nullable: true,
    });
    RowShape { columns }
}

/// Compile an output table calculation request over `run_ids`; the first of
/// them (`layout.from_id`) is the base run of comparisons.
pub fn calculate_output_table(
    model: &ModelMeta,
    layout: &CalculateTableLayout,
    run_ids: &[i32],
) -> CalcResult<CompiledCalc> {
    let read = &layout.layout;
    if read.name.is_empty() {
        return Err(CalcError::EmptyMetadata("output table name".to_owned()));
    }
    if layout.calculation.is_empty() {
        return Err(CalcError::EmptyMetadata("calculation list".to_owned()));
    }
    if run_ids.is_empty() {
        return Err(CalcError::EmptyMetadata("run id list".to_owned()));
    }

    let table = model.table_by_name(&read.name)?;
    let from_id = read.from_id;
    let extras = make_extras(from_id, run_ids);
    let split = split_table_filters(table, &layout.calculation, &read.filters, &read.filter_ids)?;

    let mut ctes: IndexSet<String> = IndexSet::default();
    let mut branches: Vec<Branch> = Vec::new();

    for calc in &layout.calculation {
        if calc.calculate.trim().is_empty() {
            return Err(CalcError::EmptyMetadata("calculation expression".to_owned()));
        }
        let mut params = make_param_cols(&model.params);

        if calc.is_aggr {
            let formula = translate_all_simple_fnc(&sanitize(&calc.calculate)?)?;
            let mut cols = table_aggr_cols(table);
            let setup = AggrSetup {
                dims: table.dims.iter().map(|d| d.col_name.clone()).collect(),
                by_acc_id: true,
                from_id,
            };
            let compiled = translate_aggr(&formula, &setup, &mut cols, &mut params, "accumulators")?;
            let param_ctes = make_param_ctes(&params, from_id, &extras, &calc.calculate)?;
            if compiled.is_compare && extras.is_empty() {
                return Err(CalcError::EmptyVariantList {
                    name: calc.name.clone(),
                    src: calc.calculate.clone(),
                });
            }

            let run_filter = if compiled.is_compare {
                format!("M1.run_id IN ({})", id_list(&extras))
            } else {
                format!("M1.run_id IN ({})", id_list(&single_run_ids(from_id, &extras)))
            };
            let mut level_where = vec![run_filter];
            level_where.extend(dim_filter_sql(table, &split, "M1")?);

            let mut sql = format!("SELECT M1.run_id, {} AS calc_id", calc.calc_id);
            for d in &setup.dims {
                sql.push_str(&format!(", M1.{d}"));
            }
            sql.push_str(&format!(
                ", {} AS calc_value",
                compiled.levels[0].exprs[0].sql
            ));
            sql.push_str(&emit_level_tail(
                &compiled.levels,
                0,
                &setup,
                &cols,
                &level_where,
            ));
            debug!("calc {}: {sql}", calc.calc_id);

            ctes.insert(table_src_cte(table));
            ctes.extend(param_ctes);
            branches.push(Branch {
                calc_id: calc.calc_id,
                name: calc.name.clone(),
                sql,
            });
        } else {
            let dim_filters = dim_filter_sql(table, &split, "B")?;
            let branch =
                translate_expr_calc(table, calc, from_id, &extras, &dim_filters, &mut params)?;
            let param_ctes = make_param_ctes(&params, from_id, &extras, &calc.calculate)?;
            if branch.is_compare && extras.is_empty() {
                return Err(CalcError::EmptyVariantList {
                    name: calc.name.clone(),
                    src: calc.calculate.clone(),
                });
            }
            ctes.extend(branch.ctes);
            ctes.extend(param_ctes);
            branches.push(Branch {
                calc_id: calc.calc_id,
                name: calc.name.clone(),
                sql: branch.main_sql,
            });
        }
    }

    let out_cols = table.dims.iter().map(|d| d.col_name.clone()).collect_vec();
    let sql = assemble_sql(&ctes, &branches, &split.value, &out_cols, &read.order_by)?;
    Ok(CompiledCalc {
        sql,
        shape: table_row_shape(table),
    })
}
