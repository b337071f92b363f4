//! Calculation request value objects: what to compute, over which runs, with
//! which filters and ordering.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, EnumString};

/// Conventional base id for user calculations; row readers use it to tell
/// calculated values apart from stored expression ids.
pub const CALC_ID_OFFSET: i32 = 12000;

/// True for ids assigned to user calculations rather than stored expressions.
pub fn is_calculated_id(calc_id: i32) -> bool {
    calc_id >= CALC_ID_OFFSET
}

/// Result page window; applied by the row reader, not by the emitted SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Page {
    pub offset: i64,
    pub size: i64,
    pub is_last_page: bool,
}

/// Filter comparison, as it appears in request text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FilterOp {
    #[strum(serialize = "=")]
    #[cfg_attr(feature = "serde", serde(rename = "="))]
    Equal,
    #[strum(serialize = "IN")]
    #[cfg_attr(feature = "serde", serde(rename = "IN"))]
    In,
    #[strum(serialize = "BETWEEN")]
    #[cfg_attr(feature = "serde", serde(rename = "BETWEEN"))]
    Between,
    /// Picks `=`, `BETWEEN` or `IN` from the value list and the enum domain.
    #[strum(serialize = "IN_AUTO")]
    #[cfg_attr(feature = "serde", serde(rename = "IN_AUTO"))]
    InAuto,
}

/// Filter with values as enum codes (or number literals for value filters).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FilterColumn {
    pub name: String,
    pub op: FilterOp,
    pub values: Vec<String>,
}

/// Filter with values already resolved to enum ids.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FilterIdColumn {
    pub name: String,
    pub op: FilterOp,
    pub enum_ids: Vec<i32>,
}

/// One ORDER BY column: 1-based output column position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OrderByColumn {
    pub index: usize,
    #[cfg_attr(feature = "serde", serde(default))]
    pub desc: bool,
}

/// Common part of every read request.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ReadLayout {
    /// Output table or entity name.
    pub name: String,
    /// Base run id.
    pub from_id: i32,
    #[cfg_attr(feature = "serde", serde(default))]
    pub page: Page,
    #[cfg_attr(feature = "serde", serde(default))]
    pub filters: Vec<FilterColumn>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub filter_ids: Vec<FilterIdColumn>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub order_by: Vec<OrderByColumn>,
}

/// One user calculation over a table or an entity.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CalculateLayout {
    /// Formula text.
    pub calculate: String,
    pub calc_id: i32,
    /// Output name, also the name value filters refer to.
    pub name: String,
    /// Aggregation dialect (accumulators) vs expression dialect.
    #[cfg_attr(feature = "serde", serde(default))]
    pub is_aggr: bool,
}

/// Output table calculation request.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CalculateTableLayout {
    pub layout: ReadLayout,
    pub calculation: Vec<CalculateLayout>,
}

/// Microdata calculation request; always the aggregation dialect.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CalculateMicroLayout {
    pub layout: ReadLayout,
    pub gen_digest: String,
    pub group_by: Vec<String>,
    pub calculation: Vec<CalculateLayout>,
}

/// Kind of one output row column, for the row-to-cell scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ColumnKind {
    /// `run_id` or `calc_id`.
    Int,
    /// Dimension item or enum attribute, scanned as enum id.
    EnumId,
    /// Boolean group attribute.
    Bool,
    /// Calculated value, NULLable double.
    Double,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RowColumn {
    pub name: String,
    pub kind: ColumnKind,
    pub nullable: bool,
}

/// Shape of every row the compiled SELECT returns.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RowShape {
    pub columns: Vec<RowColumn>,
}

/// Compiled result: the SQL text and the shape of its rows.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CompiledCalc {
    pub sql: String,
    pub shape: RowShape,
}
