//! # Data Loading and Validation Module
//!
//! Reads tab-separated files with a header row into the `ndarray` structures
//! consumed by the model. Every column must parse as a finite number.
//!
//! - Training files name their target column explicitly; every other column
//!   is a feature, in file order.
//! - Prediction files are matched against the feature names stored in the
//!   model, so column order in the file does not matter and extra columns
//!   are ignored.

use crate::model::Prediction;
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use ndarray::{Array1, Array2};
use std::collections::HashSet;
use thiserror::Error;

/// A container for validated tabular data.
#[derive(Debug, Clone)]
pub struct Dataset {
    /// Feature column names, in the column order of `x`.
    pub feature_names: Vec<String>,
    /// Feature matrix. Shape: [n_samples, feature_names.len()].
    pub x: Array2<f64>,
    /// Target vector, when a target column was requested and present.
    pub y: Option<Array1<f64>>,
}

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error reading tab-separated input: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error("The column '{0}' appears more than once in the header.")]
    DuplicateColumn(String),
    #[error(
        "Value '{value}' in column '{column}' (data row {row}) could not be parsed as a number."
    )]
    ColumnWrongType {
        column: String,
        row: usize,
        value: String,
    },
    #[error(
        "Non-finite values (NaN or Infinity) were found in the required column '{0}'. This tool requires all data to be finite."
    )]
    NonFiniteValuesFound(String),
    #[error("Input file contains no data rows.")]
    NoDataRows,
    #[error("Input file has no feature columns besides the target '{0}'.")]
    NoFeatureColumns(String),
}

/// Loads a training file. `target` names the response column; all remaining
/// columns become features.
pub fn load_training_data(path: &str, target: &str) -> Result<Dataset, DataError> {
    let table = internal::read_table(path)?;
    let target_index = table.column_index(target)?;
    let feature_indices: Vec<usize> = (0..table.headers.len())
        .filter(|&i| i != target_index)
        .collect();
    if feature_indices.is_empty() {
        return Err(DataError::NoFeatureColumns(target.to_string()));
    }

    let feature_names = feature_indices
        .iter()
        .map(|&i| table.headers[i].clone())
        .collect();
    let x = table.matrix(&feature_indices)?;
    let y = table.column(target_index)?;

    log::info!(
        "Loaded {} training rows with {} features from '{}'.",
        x.nrows(),
        x.ncols(),
        path
    );
    Ok(Dataset {
        feature_names,
        x,
        y: Some(y),
    })
}

/// Loads a prediction (or scoring) file, selecting `feature_names` in order.
/// When `target` is given that column is also required.
pub fn load_prediction_data(
    path: &str,
    feature_names: &[String],
    target: Option<&str>,
) -> Result<Dataset, DataError> {
    let table = internal::read_table(path)?;
    let feature_indices = feature_names
        .iter()
        .map(|name| table.column_index(name))
        .collect::<Result<Vec<_>, _>>()?;
    let x = table.matrix(&feature_indices)?;
    let y = match target {
        Some(name) => Some(table.column(table.column_index(name)?)?),
        None => None,
    };
    Ok(Dataset {
        feature_names: feature_names.to_vec(),
        x,
        y,
    })
}

/// Writes predictions as a TSV with a `mean` column and, when available, a
/// `std` column.
pub fn write_predictions(path: &str, prediction: &Prediction) -> Result<(), DataError> {
    let mut writer = WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    match &prediction.std {
        Some(std) => {
            writer.write_record(["mean", "std"])?;
            for (m, s) in prediction.mean.iter().zip(std.iter()) {
                writer.write_record([m.to_string(), s.to_string()])?;
            }
        }
        None => {
            writer.write_record(["mean"])?;
            for m in prediction.mean.iter() {
                writer.write_record([m.to_string()])?;
            }
        }
    }
    writer.flush()?;
    Ok(())
}

/// Internal module for shared data loading logic.
mod internal {
    use super::*;

    /// A fully read table: header names and raw string records.
    pub(super) struct Table {
        pub headers: Vec<String>,
        pub records: Vec<StringRecord>,
    }

    pub(super) fn read_table(path: &str) -> Result<Table, DataError> {
        let mut reader = ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)?;

        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let mut seen = HashSet::new();
        for name in &headers {
            if !seen.insert(name.as_str()) {
                return Err(DataError::DuplicateColumn(name.clone()));
            }
        }

        let records = reader.records().collect::<Result<Vec<_>, _>>()?;
        if records.is_empty() {
            return Err(DataError::NoDataRows);
        }
        Ok(Table { headers, records })
    }

    impl Table {
        pub(super) fn column_index(&self, name: &str) -> Result<usize, DataError> {
            self.headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| DataError::ColumnNotFound(name.to_string()))
        }

        fn value(&self, row: usize, column: usize) -> Result<f64, DataError> {
            let raw = self.records[row].get(column).unwrap_or("");
            let value: f64 = raw.parse().map_err(|_| DataError::ColumnWrongType {
                column: self.headers[column].clone(),
                row: row + 1,
                value: raw.to_string(),
            })?;
            if !value.is_finite() {
                return Err(DataError::NonFiniteValuesFound(self.headers[column].clone()));
            }
            Ok(value)
        }

        pub(super) fn column(&self, column: usize) -> Result<Array1<f64>, DataError> {
            (0..self.records.len())
                .map(|row| self.value(row, column))
                .collect()
        }

        pub(super) fn matrix(&self, columns: &[usize]) -> Result<Array2<f64>, DataError> {
            let mut x = Array2::zeros((self.records.len(), columns.len()));
            for (j, &column) in columns.iter().enumerate() {
                for row in 0..self.records.len() {
                    x[[row, j]] = self.value(row, column)?;
                }
            }
            Ok(x)
        }
    }
}
