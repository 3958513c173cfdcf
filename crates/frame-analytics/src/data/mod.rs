//! Data frame collaborator: row-major storage with category dictionaries.

mod categories;
mod frame;
mod mask;

pub use categories::CategoryDictionary;
pub use frame::{DEFAULT_MISSING_STRING, DataFrame};
pub use mask::RowMask;

/// Errors raised by the row interface of [`DataFrame`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DataFrameError {
    #[error("expected {expected} values per row, got {actual}")]
    RowLength { expected: usize, actual: usize },
    #[error("row {row} out of range ({rows} rows)")]
    RowOutOfRange { row: usize, rows: usize },
    #[error("column {column} out of range ({columns} columns)")]
    ColumnOutOfRange { column: usize, columns: usize },
    #[error("unknown column '{0}'")]
    UnknownColumn(String),
    #[error("column {0} is not categorical")]
    NotCategorical(usize),
}
