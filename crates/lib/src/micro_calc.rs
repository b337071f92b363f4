//! Microdata entry point: aggregates entity attributes over one or more
//! runs, grouped by enum-based attributes. Comparisons join base and variant
//! rows of the same entity by `entity_key`.

use indexmap::IndexSet;
use itertools::Itertools;
use log::debug;

use crate::assemble::{Branch, assemble_sql};
use crate::columns::{AggrCol, make_param_cols, micro_aggr_cols};
use crate::filter::{make_dim_filter, resolve_codes};
use crate::layout::{
    CalculateMicroLayout, ColumnKind, CompiledCalc, FilterColumn, FilterOp, RowColumn, RowShape,
};
use crate::leveler::{AggrSetup, SRC_CTE, emit_level_tail, translate_aggr};
use crate::meta::{AttrMeta, EntityGenMeta, EntityMeta, ModelMeta, TypeKind};
use crate::params::{id_list, make_extras, make_param_ctes, single_run_ids};
use calcsql_lib_core::errors::{CalcError, CalcResult};
use calcsql_lib_core::fnc::translate_all_simple_fnc;
use calcsql_lib_core::sanitize::sanitize;

/// Microdata source CTE: every materialized attribute of the generation, and
/// the entity key when a comparison needs the base/variant self-join.
fn micro_src_cte(generation: &EntityGenMeta, cols: &[AggrCol], with_key: bool) -> String {
    let key = if with_key { ", entity_key" } else { "" };
    let c_key = if with_key { ", C.entity_key" } else { "" };
    let attrs: String = cols.iter().map(|c| format!(", {}", c.col_name)).collect();
    let c_attrs: String = cols.iter().map(|c| format!(", C.{}", c.col_name)).collect();
    format!(
        "{SRC_CTE} (run_id{key}{attrs}) AS \
         (SELECT NR.run_id{c_key}{c_attrs} FROM {} C \
         INNER JOIN run_entity NR ON (NR.base_run_id = C.run_id AND NR.entity_gen_hid = {}))",
        generation.db_gen_table, generation.gen_hid,
    )
}

fn attr_by_name<'a>(entity: &'a EntityMeta, name: &str) -> CalcResult<&'a AttrMeta> {
    entity
        .attrs
        .iter()
        .find(|a| a.name == name)
        .ok_or_else(|| CalcError::UnknownAttribute {
            name: name.to_owned(),
            within: entity.name.clone(),
        })
}

fn micro_row_shape(entity: &EntityMeta, group_by: &[String]) -> CalcResult<RowShape> {
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
    for name in group_by {
        let attr = attr_by_name(entity, name)?;
        columns.push(RowColumn {
            name: attr.name.clone(),
            kind: if attr.type_of.kind == TypeKind::Bool {
                ColumnKind::Bool
            } else {
                ColumnKind::EnumId
            },
            nullable: false,
        });
    }
    columns.push(RowColumn {
        name: "calc_value".to_owned(),
        kind: ColumnKind::Double,
        nullable: true,
    });
    Ok(RowShape { columns })
}

/// Compile a microdata calculation request over `run_ids`.
pub fn calculate_microdata(
    model: &ModelMeta,
    layout: &CalculateMicroLayout,
    run_ids: &[i32],
) -> CalcResult<CompiledCalc> {
    let read = &layout.layout;
    if read.name.is_empty() {
        return Err(CalcError::EmptyMetadata("entity name".to_owned()));
    }
    if layout.calculation.is_empty() {
        return Err(CalcError::EmptyMetadata("calculation list".to_owned()));
    }
    if run_ids.is_empty() {
        return Err(CalcError::EmptyMetadata("run id list".to_owned()));
    }
    if layout.group_by.is_empty() {
        return Err(CalcError::EmptyMetadata("group by attribute list".to_owned()));
    }

    let entity = model.entity_by_name(&read.name)?;
    let generation = model.gen_by_digest(&entity.name, &layout.gen_digest)?;
    let base_cols = micro_aggr_cols(entity, generation, &layout.group_by)?;

    // group-by attributes must scan as enum ids
    for name in &layout.group_by {
        let attr = attr_by_name(entity, name)?;
        if !attr.type_of.is_enum_based() {
            return Err(CalcError::BadGroupByType {
                name: name.clone(),
                within: entity.name.clone(),
            });
        }
    }

    let from_id = read.from_id;
    let extras = make_extras(from_id, run_ids);
    let setup = AggrSetup {
        dims: layout
            .group_by
            .iter()
            .map(|g| Ok(attr_by_name(entity, g)?.col_name.clone()))
            .collect::<CalcResult<Vec<_>>>()?,
        by_acc_id: false,
        from_id,
    };

    // attribute filters on the level-1 alias, value filters for assembly
    let mut attr_filters: Vec<String> = Vec::new();
    let mut value_filters: Vec<FilterColumn> = Vec::new();
    let mut add_filter = |name: &str,
                          op: FilterOp,
                          ids: Option<Vec<i32>>,
                          values: &[String]|
     -> CalcResult<()> {
        if layout.calculation.iter().any(|c| c.name == name) {
            value_filters.push(FilterColumn {
                name: name.to_owned(),
                op,
                values: values.to_vec(),
            });
            return Ok(());
        }
        let attr = attr_by_name(entity, name)?;
        let ids = match ids {
            Some(ids) => ids,
            None => resolve_codes(&attr.type_of, name, values)?,
        };
        attr_filters.push(make_dim_filter(
            "M1",
            &attr.col_name,
            &attr.type_of,
            name,
            op,
            &ids,
        )?);
        Ok(())
    };
    for f in &read.filters {
        add_filter(&f.name, f.op, None, &f.values)?;
    }
    for f in &read.filter_ids {
        let values = f.enum_ids.iter().map(|id| id.to_string()).collect_vec();
        add_filter(&f.name, f.op, Some(f.enum_ids.clone()), &values)?;
    }

    let mut ctes: IndexSet<String> = IndexSet::default();
    let mut branches: Vec<Branch> = Vec::new();
    let mut compare: Option<bool> = None;

    for calc in &layout.calculation {
        if calc.calculate.trim().is_empty() {
            return Err(CalcError::EmptyMetadata("calculation expression".to_owned()));
        }
        let formula = translate_all_simple_fnc(&sanitize(&calc.calculate)?)?;
        let mut cols = base_cols.clone();
        let mut params = make_param_cols(&model.params);

        let compiled = translate_aggr(&formula, &setup, &mut cols, &mut params, "entity attributes")?;
        let param_ctes = make_param_ctes(&params, from_id, &extras, &calc.calculate)?;
        if *compare.get_or_insert(compiled.is_compare) != compiled.is_compare {
            return Err(CalcError::MixedCompareForms {
                name: calc.name.clone(),
            });
        }
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
        level_where.extend(attr_filters.iter().cloned());

        let mut sql = format!("SELECT M1.run_id, {} AS calc_id", calc.calc_id);
        for g in &setup.dims {
            sql.push_str(&format!(", M1.{g}"));
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

        ctes.insert(micro_src_cte(generation, &base_cols, compiled.is_compare));
        ctes.extend(param_ctes);
        branches.push(Branch {
            calc_id: calc.calc_id,
            name: calc.name.clone(),
            sql,
        });
    }

    let sql = assemble_sql(&ctes, &branches, &value_filters, &setup.dims, &read.order_by)?;
    Ok(CompiledCalc {
        sql,
        shape: micro_row_shape(entity, &layout.group_by)?,
    })
}
