use ndarray::{Array2, ArrayView1, ArrayView2, Axis, s};

use super::{CategoryDictionary, DataFrameError};

/// Value the host sends for a missing field.
pub const DEFAULT_MISSING_STRING: &str = "\0";

const BYTES_PER_VALUE: u64 = std::mem::size_of::<f32>() as u64;
const BYTES_PER_DOC_HASH: u64 = std::mem::size_of::<i32>() as u64;

/// Row-major frame of `f32` values.
///
/// Input columns come first, followed by any extra columns a runner
/// reserves for its output. Categorical columns hold category ids; missing
/// values are NaN.
#[derive(Debug, Clone)]
pub struct DataFrame {
    values: Array2<f32>,
    column_names: Vec<String>,
    categorical: Vec<bool>,
    categories: Vec<CategoryDictionary>,
    doc_hashes: Vec<i32>,
    missing_value: String,
    number_input_columns: usize,
    reported_bad_values: Vec<bool>,
}

impl DataFrame {
    /// Create an empty frame whose categorical columns are those named in
    /// `categorical_fields`.
    pub fn new(
        column_names: Vec<String>,
        categorical_fields: &[String],
        missing_value: impl Into<String>,
    ) -> Self {
        let n_columns = column_names.len();
        let categorical = column_names
            .iter()
            .map(|name| categorical_fields.iter().any(|field| field == name))
            .collect();
        Self {
            values: Array2::zeros((0, n_columns)),
            categorical,
            categories: vec![CategoryDictionary::new(); n_columns],
            doc_hashes: Vec::new(),
            missing_value: missing_value.into(),
            number_input_columns: n_columns,
            reported_bad_values: vec![false; n_columns],
            column_names,
        }
    }

    /// Bytes needed to hold `rows` rows of `columns` values in memory.
    pub fn estimate_memory_usage(rows: usize, columns: usize) -> u64 {
        let rows = rows as u64;
        rows * (columns as u64 * BYTES_PER_VALUE + BYTES_PER_DOC_HASH)
    }

    /// Parse one record and append it.
    ///
    /// `values` holds exactly one string per input column. Unparsable
    /// numbers are stored as missing and reported once per column.
    pub fn parse_and_write_row<S: AsRef<str>>(
        &mut self,
        values: &[S],
        doc_hash: i32,
    ) -> Result<(), DataFrameError> {
        if values.len() != self.number_input_columns {
            return Err(DataFrameError::RowLength {
                expected: self.number_input_columns,
                actual: values.len(),
            });
        }

        let mut row = vec![f32::NAN; self.values.ncols()];
        for (column, value) in values.iter().enumerate() {
            let value = value.as_ref();
            if value == self.missing_value || value.is_empty() {
                continue;
            }
            if self.categorical[column] {
                row[column] = self.categories[column].id_or_insert(value) as f32;
            } else {
                match value.trim().parse::<f64>() {
                    Ok(parsed) if parsed.is_finite() => row[column] = parsed as f32,
                    _ => self.report_bad_value(column, value),
                }
            }
        }

        self.values
            .push_row(ArrayView1::from(row.as_slice()))
            .map_err(|_| DataFrameError::RowLength {
                expected: self.values.ncols(),
                actual: row.len(),
            })?;
        self.doc_hashes.push(doc_hash);
        Ok(())
    }

    fn report_bad_value(&mut self, column: usize, value: &str) {
        if !self.reported_bad_values[column] {
            self.reported_bad_values[column] = true;
            tracing::warn!(
                column = %self.column_names[column],
                value,
                "encountered non-numeric value, treating as missing"
            );
        }
    }

    /// Append `names.len()` extra columns initialised to missing.
    pub fn resize_columns(&mut self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        let (rows, cols) = self.values.dim();
        let mut values = Array2::from_elem((rows, cols + names.len()), f32::NAN);
        values.slice_mut(s![.., ..cols]).assign(&self.values);
        self.values = values;
        self.column_names.extend(names.iter().cloned());
        self.categorical.extend(names.iter().map(|_| false));
        self.categories
            .extend(names.iter().map(|_| CategoryDictionary::new()));
        self.reported_bad_values.extend(names.iter().map(|_| false));
    }

    #[inline]
    pub fn number_rows(&self) -> usize {
        self.values.nrows()
    }

    #[inline]
    pub fn number_columns(&self) -> usize {
        self.values.ncols()
    }

    #[inline]
    pub fn number_input_columns(&self) -> usize {
        self.number_input_columns
    }

    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    pub fn input_column_names(&self) -> &[String] {
        &self.column_names[..self.number_input_columns]
    }

    pub fn column_index(&self, name: &str) -> Result<usize, DataFrameError> {
        self.column_names
            .iter()
            .position(|column| column == name)
            .ok_or_else(|| DataFrameError::UnknownColumn(name.to_string()))
    }

    #[inline]
    pub fn is_categorical(&self, column: usize) -> bool {
        self.categorical.get(column).copied().unwrap_or(false)
    }

    pub fn categories(&self, column: usize) -> &CategoryDictionary {
        &self.categories[column]
    }

    /// Category names of every column, empty for numeric columns.
    pub fn category_names(&self) -> Vec<Vec<String>> {
        self.categories.iter().map(|c| c.names().to_vec()).collect()
    }

    /// Renumber the categories of `column` so the first ids are `names`.
    ///
    /// Categories of the frame missing from `names` keep their rows but get
    /// ids after all of `names`.
    pub fn align_categories(&mut self, column: usize, names: &[String]) -> Result<(), DataFrameError> {
        let columns = self.number_input_columns;
        if column >= columns {
            return Err(DataFrameError::ColumnOutOfRange { column, columns });
        }
        if !self.categorical[column] {
            return Err(DataFrameError::NotCategorical(column));
        }
        let current = &self.categories[column];
        let aligned = current.aligned_to(names);
        let remap: Vec<f32> = current
            .names()
            .iter()
            .map(|name| aligned.id(name).map_or(f32::NAN, |id| id as f32))
            .collect();
        for value in self.values.column_mut(column) {
            if !value.is_nan() {
                *value = remap.get(*value as usize).copied().unwrap_or(f32::NAN);
            }
        }
        self.categories[column] = aligned;
        Ok(())
    }

    pub fn missing_value(&self) -> &str {
        &self.missing_value
    }

    #[inline]
    pub fn value(&self, row: usize, column: usize) -> f32 {
        self.values[[row, column]]
    }

    pub fn set_value(&mut self, row: usize, column: usize, value: f32) -> Result<(), DataFrameError> {
        let (rows, columns) = self.values.dim();
        if row >= rows {
            return Err(DataFrameError::RowOutOfRange { row, rows });
        }
        if column >= columns {
            return Err(DataFrameError::ColumnOutOfRange { column, columns });
        }
        self.values[[row, column]] = value;
        Ok(())
    }

    #[inline]
    pub fn row(&self, row: usize) -> ArrayView1<'_, f32> {
        self.values.row(row)
    }

    #[inline]
    pub fn column(&self, column: usize) -> ArrayView1<'_, f32> {
        self.values.column(column)
    }

    pub fn values(&self) -> ArrayView2<'_, f32> {
        self.values.view()
    }

    /// Input columns only.
    pub fn input_values(&self) -> ArrayView2<'_, f32> {
        self.values.slice(s![.., ..self.number_input_columns])
    }

    /// Rows `start..end` as a view, clamped to the frame.
    pub fn rows_slice(&self, start: usize, end: usize) -> ArrayView2<'_, f32> {
        let end = end.min(self.number_rows());
        let start = start.min(end);
        self.values.slice_axis(Axis(0), ndarray::Slice::from(start..end))
    }

    #[inline]
    pub fn doc_hash(&self, row: usize) -> i32 {
        self.doc_hashes.get(row).copied().unwrap_or(0)
    }

    /// Category string for a categorical cell, if present.
    pub fn category_of(&self, row: usize, column: usize) -> Option<&str> {
        let value = self.value(row, column);
        if value.is_nan() {
            return None;
        }
        self.categories[column].name(value as usize)
    }
}
