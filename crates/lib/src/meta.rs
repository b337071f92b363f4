//! Read-only metadata value objects, mirroring the database schema. The
//! compiler never mutates these; per-call working state lives in
//! [`crate::columns`].

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use calcsql_lib_core::errors::{CalcError, CalcResult};

/// One item of an enum type domain.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EnumItem {
    pub enum_id: i32,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TypeKind {
    Bool,
    Int,
    Float,
    String,
    Enum,
}

/// Type of a dimension, attribute or parameter. Dimensions are always enum
/// based; boolean counts as enum based with the fixed `false`/`true` domain.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TypeMeta {
    pub name: String,
    pub kind: TypeKind,
    pub enums: Vec<EnumItem>,
}

impl TypeMeta {
    pub fn bool_type() -> TypeMeta {
        TypeMeta {
            name: "bool".to_owned(),
            kind: TypeKind::Bool,
            enums: vec![
                EnumItem {
                    enum_id: 0,
                    name: "false".to_owned(),
                },
                EnumItem {
                    enum_id: 1,
                    name: "true".to_owned(),
                },
            ],
        }
    }

    pub fn is_enum_based(&self) -> bool {
        matches!(self.kind, TypeKind::Bool | TypeKind::Enum)
    }

    pub fn enum_id_by_code(&self, code: &str) -> Option<i32> {
        self.enums.iter().find(|e| e.name == code).map(|e| e.enum_id)
    }
}

/// Output table dimension: user name plus the physical column (`dim0`…).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DimensionMeta {
    pub name: String,
    pub col_name: String,
    pub type_of: TypeMeta,
}

/// Pre-computed output table expression.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TableExprMeta {
    pub expr_id: i32,
    pub name: String,
}

/// Output table accumulator. Derived accumulators are computed over native
/// ones and never anchor an aggregation level.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TableAccMeta {
    pub acc_id: i32,
    pub name: String,
    pub is_derived: bool,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TableMeta {
    /// Stable hid of the table within the model database.
    pub table_hid: i32,
    pub name: String,
    /// Physical table with expression rows.
    pub db_expr_table: String,
    /// Physical table with accumulator rows.
    pub db_acc_table: String,
    pub dims: Vec<DimensionMeta>,
    pub exprs: Vec<TableExprMeta>,
    pub accs: Vec<TableAccMeta>,
}

impl TableMeta {
    pub fn rank(&self) -> usize {
        self.dims.len()
    }
}

/// Microdata entity attribute.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AttrMeta {
    pub attr_id: i32,
    pub name: String,
    pub col_name: String,
    pub type_of: TypeMeta,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EntityMeta {
    pub name: String,
    pub attrs: Vec<AttrMeta>,
}

/// One generation of an entity: the attribute subset actually written for a
/// set of runs, and the physical table holding it.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EntityGenMeta {
    pub entity_name: String,
    pub gen_hid: i32,
    pub gen_digest: String,
    pub db_gen_table: String,
    /// Names of the materialized attributes, a subset of the entity's.
    pub attr_names: Vec<String>,
}

/// Scalar or array model parameter.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ParamMeta {
    pub param_hid: i32,
    pub name: String,
    /// Physical table with run parameter values.
    pub db_run_table: String,
    pub rank: usize,
    pub kind: TypeKind,
}

impl ParamMeta {
    /// Only rank-0 numeric parameters can appear in formulas.
    pub fn is_number(&self) -> bool {
        self.rank == 0 && matches!(self.kind, TypeKind::Int | TypeKind::Float)
    }
}

/// Model metadata view: everything the compiler may need to resolve a
/// calculation request.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ModelMeta {
    pub name: String,
    pub tables: Vec<TableMeta>,
    pub entities: Vec<EntityMeta>,
    pub entity_gens: Vec<EntityGenMeta>,
    pub params: Vec<ParamMeta>,
}

impl ModelMeta {
    pub fn table_by_name(&self, name: &str) -> CalcResult<&TableMeta> {
        self.tables
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| CalcError::UnknownTable(name.to_owned()))
    }

    pub fn entity_by_name(&self, name: &str) -> CalcResult<&EntityMeta> {
        self.entities
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| CalcError::UnknownEntity(name.to_owned()))
    }

    pub fn gen_by_digest(&self, entity_name: &str, digest: &str) -> CalcResult<&EntityGenMeta> {
        self.entity_gens
            .iter()
            .find(|g| g.entity_name == entity_name && g.gen_digest == digest)
            .ok_or_else(|| CalcError::UnknownEntity(format!("{entity_name} generation {digest}")))
    }
}
