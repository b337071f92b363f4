use thiserror::Error;

pub type CalcResult<T> = Result<T, CalcError>;

/// Compilation failure. Every variant carries the offending identifier and,
/// where one exists, the source formula so the message can be fed back to the
/// user unchanged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CalcError {
    #[error("invalid (empty) {0}")]
    EmptyMetadata(String),

    #[error("output table not found: {0}")]
    UnknownTable(String),

    #[error("entity not found: {0}")]
    UnknownEntity(String),

    #[error("attribute not found: {name} in {within}")]
    UnknownAttribute { name: String, within: String },

    #[error("group by attribute must be boolean or enum based: {name} in {within}")]
    BadGroupByType { name: String, within: String },

    #[error("unsafe SQL: {reason} in: {src}")]
    UnsafeSql { reason: String, src: String },

    #[error("incorrect function call: {name} in: {src}")]
    MalformedCall { name: String, src: String },

    #[error("empty argument of function: {name} in: {src}")]
    EmptyArgument { name: String, src: String },

    #[error("unknown function: {name} in: {src}")]
    UnknownFunction { name: String, src: String },

    #[error("invalid mix of name forms: {name} in: {src}")]
    MixedNameForms { name: String, src: String },

    #[error("unresolved name: {name} in: {src}")]
    UnresolvedName { name: String, src: String },

    #[error("parameter must be a scalar number: {name} in: {src}")]
    NonScalarParameter { name: String, src: String },

    #[error("no variant runs to compare: {name} in: {src}")]
    EmptyVariantList { name: String, src: String },

    #[error("invalid number of filter values for {op} filter: {name}")]
    BadFilterArity { name: String, op: String },

    #[error("invalid filter value for {name}: {value}")]
    BadFilterValue { name: String, value: String },

    #[error("automatic filter needs an enum based type: {name}")]
    AutoFilterNoEnum { name: String },

    #[error("unknown enum code in filter {name}: {code}")]
    EnumCodeUnknown { name: String, code: String },

    #[error("formula does not reference any {kind}: {src}")]
    NoExpressionNames { kind: String, src: String },

    #[error("all calculations must be run comparisons or none of them: {name}")]
    MixedCompareForms { name: String },
}

impl CalcError {
    pub(crate) fn unsafe_sql(reason: impl Into<String>, src: &str) -> CalcError {
        CalcError::UnsafeSql {
            reason: reason.into(),
            src: src.to_owned(),
        }
    }
}
