//! Error taxonomy shared across the crate.
//!
//! Mirrors the abstract kinds every module ultimately reduces to:
//! malformed input, broken internal invariants, operations undefined for a
//! value kind, failed attribute lookups, and incompatible value kinds. Each
//! area gets its own enum so call sites can match narrowly; [`Error`]
//! aggregates them for the CLI's top-level `Result`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ValueError {
    #[error("type mismatch: cannot compare/combine {lhs} with {rhs}")]
    TypeMismatch { lhs: String, rhs: String },

    #[error("operation `{op}` is not defined for value kind {kind}")]
    UnsupportedOperation { op: &'static str, kind: String },

    #[error("operation `{op}` is not implemented for value kind {kind}")]
    Unimplemented { op: &'static str, kind: String },

    #[error("double operands have different precision: {lhs} vs {rhs}")]
    PrecisionMismatch { lhs: i32, rhs: i32 },
}

pub type ValueResult<T> = Result<T, ValueError>;

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("attribute `{0}` not found in schema")]
    NotFound(String),

    #[error("attribute `{0}` already exists in schema")]
    DuplicateAttribute(String),

    #[error("malformed schema: {0}")]
    InputMalformed(String),
}

pub type SchemaResult<T> = Result<T, SchemaError>;

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("interval invariant violated: {0}")]
    IntervalInvariant(String),

    #[error("boundary invariant violated: {0}")]
    BoundaryInvariant(String),

    #[error(transparent)]
    Value(#[from] ValueError),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

pub type MetadataResult<T> = Result<T, MetadataError>;

#[derive(Error, Debug)]
pub enum ExpressionError {
    #[error("expression is not a pure conjunction of `{0}`")]
    NotAndOnly(String),

    #[error("malformed expression: {0}")]
    Malformed(String),

    #[error(transparent)]
    Value(#[from] ValueError),
}

pub type ExpressionResult<T> = Result<T, ExpressionError>;

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("invariant violated while deriving scan parameters: {0}")]
    InvariantViolation(String),

    #[error("block row count is unknown")]
    UnknownRowCount,

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

pub type PlanResult<T> = Result<T, PlanError>;

#[derive(Error, Debug)]
pub enum PartitionError {
    #[error("stop condition can never be satisfied for this block")]
    UnreachableStopCondition,

    #[error("empty split-ratio map passed to resize")]
    EmptyRatioMap,

    #[error("failed to build worker pool: {0}")]
    WorkerPool(String),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

pub type PartitionResult<T> = Result<T, PartitionError>;

/// Umbrella error used by the CLI's top-level `Result`.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Value(#[from] ValueError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("input malformed: {0}")]
    InputMalformed(String),
}

pub type Result<T> = std::result::Result<T, Error>;
