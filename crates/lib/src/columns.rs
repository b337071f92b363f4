//! Per-call working state derived from metadata: aggregation columns and the
//! parameter usage map. Built fresh for every compilation; the metadata view
//! itself is never mutated.

use ahash::AHashMap;

use crate::meta::{EntityGenMeta, EntityMeta, ParamMeta, TableMeta};
use calcsql_lib_core::errors::{CalcError, CalcResult};

/// Prefix of every parameter reference in a formula.
pub const PARAM_PREFIX: &str = "param.";

/// How a name was referenced: bare, `[base]` or `[variant]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suffix {
    None,
    Base,
    Variant,
}

/// Usage flags accumulated while resolving one formula.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NameUse {
    pub is_simple: bool,
    pub is_base: bool,
    pub is_var: bool,
}

impl NameUse {
    pub fn record(&mut self, suffix: Suffix) {
        match suffix {
            Suffix::None => self.is_simple = true,
            Suffix::Base => self.is_base = true,
            Suffix::Variant => self.is_var = true,
        }
    }

    pub fn any(&self) -> bool {
        self.is_simple || self.is_base || self.is_var
    }
}

/// Accumulator or microdata attribute visible to the aggregation leveler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggrCol {
    pub name: String,
    /// Physical column: `acc_value` for accumulators, the attribute column
    /// for microdata.
    pub col_name: String,
    /// Id used in `acc_id = <k>` self-join filters; meaningless for
    /// microdata attributes.
    pub acc_id: i32,
    /// May anchor a level: native accumulator or non-group attribute.
    pub is_aggr: bool,
    /// Microdata group-by column.
    pub is_group: bool,
    pub used: NameUse,
}

/// Scalar parameter slot in the usage map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamCol {
    pub name: String,
    pub param_hid: i32,
    pub db_run_table: String,
    pub is_number: bool,
    pub used: NameUse,
}

/// Parameter usage map keyed by `"param." + name`, a per-call copy.
pub type ParamCols = AHashMap<String, ParamCol>;

pub fn make_param_cols(params: &[ParamMeta]) -> ParamCols {
    params
        .iter()
        .map(|p| {
            (
                format!("{PARAM_PREFIX}{}", p.name),
                ParamCol {
                    name: p.name.clone(),
                    param_hid: p.param_hid,
                    db_run_table: p.db_run_table.clone(),
                    is_number: p.is_number(),
                    used: NameUse::default(),
                },
            )
        })
        .collect()
}

/// Aggregation columns of an output table: its accumulators in `acc_id`
/// order. Derived accumulators participate but cannot anchor a level.
pub fn table_aggr_cols(table: &TableMeta) -> Vec<AggrCol> {
    table
        .accs
        .iter()
        .map(|acc| AggrCol {
            name: acc.name.clone(),
            col_name: "acc_value".to_owned(),
            acc_id: acc.acc_id,
            is_aggr: !acc.is_derived,
            is_group: false,
            used: NameUse::default(),
        })
        .collect()
}

/// Aggregation columns of an entity generation: the materialized attributes
/// in entity attribute order. Group-by columns cannot anchor a level.
pub fn micro_aggr_cols(
    entity: &EntityMeta,
    generation: &EntityGenMeta,
    group_by: &[String],
) -> CalcResult<Vec<AggrCol>> {
    let mut cols = Vec::with_capacity(generation.attr_names.len());

    for attr in &entity.attrs {
        if !generation.attr_names.contains(&attr.name) {
            continue;
        }
        let is_group = group_by.contains(&attr.name);
        cols.push(AggrCol {
            name: attr.name.clone(),
            col_name: attr.col_name.clone(),
            acc_id: attr.attr_id,
            is_aggr: !is_group,
            is_group,
            used: NameUse::default(),
        });
    }

    for name in group_by {
        if !cols.iter().any(|c| c.name == *name) {
            return Err(CalcError::UnknownAttribute {
                name: name.clone(),
                within: entity.name.clone(),
            });
        }
    }
    Ok(cols)
}
