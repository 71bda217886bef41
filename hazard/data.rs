use crate::config::InputSchema;
use itertools::Itertools;
use ndarray::{Array1, Array2, Axis, concatenate};
use serde_json::Value;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use thiserror::Error;

/// The character table after schema resolution. Rows are characters, in input
/// order; the table is immutable once loaded.
#[derive(Debug, Clone)]
pub struct CharacterTable {
    pub names: Vec<String>,
    pub lifespans: Array1<f64>,
    pub dead: Vec<bool>,
    /// Covariate column names in the order of the columns of `covariates`.
    pub covariate_names: Vec<String>,
    pub covariates: Array2<f64>,
}

#[derive(Error, Debug)]
pub enum InputValidationError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("input must be a JSON array of records")]
    NotARecordArray,
    #[error("the character table is empty")]
    EmptyTable,
    #[error("row {row}: field '{field}' is missing")]
    MissingField { row: usize, field: String },
    #[error("row {row}: field '{field}' is not numeric")]
    NonNumeric { row: usize, field: String },
    #[error("row {row}: field '{field}' has non-finite value {value}")]
    NonFinite { row: usize, field: String, value: f64 },
    #[error("row {row}: lifespan {value} is negative")]
    NegativeLifespan { row: usize, value: f64 },
    #[error("interval length must be positive, got {0}")]
    NonPositiveIntervalLength(f64),
    #[error("feature file has {found} rows but the table has {expected} characters")]
    FeatureRowMismatch { expected: usize, found: usize },
    #[error("feature file declares {found} columns, expected {expected}")]
    FeatureDimensionMismatch { expected: usize, found: usize },
}

impl CharacterTable {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn num_covariates(&self) -> usize {
        self.covariate_names.len()
    }

    /// Loads a table from `path`. Files ending in `.json` are read as an array of
    /// records; anything else is read as a delimited table with a header row
    /// (comma for `.csv`, tab otherwise).
    pub fn load(path: &Path, schema: &InputSchema) -> Result<Self, InputValidationError> {
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let table = if is_json {
            let reader = BufReader::new(File::open(path)?);
            let value: Value = serde_json::from_reader(reader)?;
            Self::from_json_records(&value, schema)?
        } else {
            let reader = csv::ReaderBuilder::new()
                .delimiter(delimiter_for(path))
                .has_headers(true)
                .from_path(path)?;
            Self::from_delimited(reader, schema)?
        };
        log::info!(
            "Loaded {} characters ({} dead) with covariates [{}]",
            table.len(),
            table.dead.iter().filter(|&&d| d).count(),
            table.covariate_names.iter().join(", ")
        );
        Ok(table)
    }

    /// Builds a table from a parsed JSON array of records. Every key that is not
    /// one of the schema's role columns or exclusions becomes a covariate, in
    /// first-seen order.
    pub fn from_json_records(
        value: &Value,
        schema: &InputSchema,
    ) -> Result<Self, InputValidationError> {
        let records = value
            .as_array()
            .ok_or(InputValidationError::NotARecordArray)?;
        if records.is_empty() {
            return Err(InputValidationError::EmptyTable);
        }

        let mut covariate_names: Vec<String> = Vec::new();
        for record in records {
            let object = record
                .as_object()
                .ok_or(InputValidationError::NotARecordArray)?;
            for key in object.keys() {
                if is_covariate_column(key, schema) && !covariate_names.contains(key) {
                    covariate_names.push(key.clone());
                }
            }
        }

        let n = records.len();
        let mut names = Vec::with_capacity(n);
        let mut lifespans = Array1::<f64>::zeros(n);
        let mut dead = Vec::with_capacity(n);
        let mut covariates = Array2::<f64>::zeros((n, covariate_names.len()));

        for (row, record) in records.iter().enumerate() {
            let object = record
                .as_object()
                .ok_or(InputValidationError::NotARecordArray)?;
            let field = |name: &str| {
                object
                    .get(name)
                    .filter(|v| !v.is_null())
                    .ok_or_else(|| InputValidationError::MissingField {
                        row,
                        field: name.to_string(),
                    })
            };

            names.push(match field(&schema.name_column)? {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
            let lifespan = json_number(field(&schema.lifespan_column)?, row, &schema.lifespan_column)?;
            lifespans[row] = lifespan + schema.lifespan_offset;
            dead.push(json_number(field(&schema.death_column)?, row, &schema.death_column)? > 0.0);
            for (col, name) in covariate_names.iter().enumerate() {
                covariates[[row, col]] = json_number(field(name)?, row, name)?;
            }
        }

        Ok(Self {
            names,
            lifespans,
            dead,
            covariate_names,
            covariates,
        })
    }

    /// Builds a table from a delimited reader with a header row.
    pub fn from_delimited<R: std::io::Read>(
        mut reader: csv::Reader<R>,
        schema: &InputSchema,
    ) -> Result<Self, InputValidationError> {
        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let position = |name: &str| {
            headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| InputValidationError::MissingField {
                    row: 0,
                    field: name.to_string(),
                })
        };
        let name_idx = position(&schema.name_column)?;
        let lifespan_idx = position(&schema.lifespan_column)?;
        let death_idx = position(&schema.death_column)?;
        let covariate_idx: Vec<usize> = headers
            .iter()
            .enumerate()
            .filter(|(_, h)| is_covariate_column(h, schema))
            .map(|(i, _)| i)
            .collect();
        let covariate_names: Vec<String> =
            covariate_idx.iter().map(|&i| headers[i].clone()).collect();

        let mut names = Vec::new();
        let mut lifespans = Vec::new();
        let mut dead = Vec::new();
        let mut flat_covariates = Vec::new();
        for (row, record) in reader.records().enumerate() {
            let record = record?;
            let cell = |idx: usize| {
                record
                    .get(idx)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| InputValidationError::MissingField {
                        row,
                        field: headers[idx].clone(),
                    })
            };
            names.push(cell(name_idx)?.to_string());
            lifespans.push(
                text_number(cell(lifespan_idx)?, row, &headers[lifespan_idx])?
                    + schema.lifespan_offset,
            );
            dead.push(text_number(cell(death_idx)?, row, &headers[death_idx])? > 0.0);
            for &idx in &covariate_idx {
                flat_covariates.push(text_number(cell(idx)?, row, &headers[idx])?);
            }
        }
        if names.is_empty() {
            return Err(InputValidationError::EmptyTable);
        }

        let n = names.len();
        let covariates = Array2::from_shape_vec((n, covariate_names.len()), flat_covariates)
            .map_err(|_| InputValidationError::FeatureRowMismatch {
                expected: n,
                found: 0,
            })?;
        Ok(Self {
            names,
            lifespans: Array1::from_vec(lifespans),
            dead,
            covariate_names,
            covariates,
        })
    }

    /// Appends the columns of an external numeric feature matrix (header row of
    /// feature names, one row per character in table order) to the covariates.
    pub fn attach_features(
        &mut self,
        path: &Path,
        expected_dimensions: Option<usize>,
    ) -> Result<(), InputValidationError> {
        let reader = csv::ReaderBuilder::new()
            .delimiter(delimiter_for(path))
            .has_headers(true)
            .from_path(path)?;
        let features = FeatureMatrix::read(reader)?;
        log::info!(
            "Attaching {} external features from {}",
            features.names.len(),
            path.display()
        );
        self.append_features(features, expected_dimensions)
    }

    pub fn append_features(
        &mut self,
        features: FeatureMatrix,
        expected_dimensions: Option<usize>,
    ) -> Result<(), InputValidationError> {
        if let Some(expected) = expected_dimensions {
            if features.names.len() != expected {
                return Err(InputValidationError::FeatureDimensionMismatch {
                    expected,
                    found: features.names.len(),
                });
            }
        }
        if features.values.nrows() != self.len() {
            return Err(InputValidationError::FeatureRowMismatch {
                expected: self.len(),
                found: features.values.nrows(),
            });
        }
        self.covariates = concatenate(
            Axis(1),
            &[self.covariates.view(), features.values.view()],
        )
        .map_err(|_| InputValidationError::FeatureRowMismatch {
            expected: self.names.len(),
            found: features.values.nrows(),
        })?;
        self.covariate_names.extend(features.names);
        Ok(())
    }
}

/// A flat numeric feature matrix produced by an external encoder.
#[derive(Debug, Clone)]
pub struct FeatureMatrix {
    pub names: Vec<String>,
    pub values: Array2<f64>,
}

impl FeatureMatrix {
    pub fn read<R: std::io::Read>(mut reader: csv::Reader<R>) -> Result<Self, InputValidationError> {
        let names: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let mut flat = Vec::new();
        let mut rows = 0usize;
        for (row, record) in reader.records().enumerate() {
            let record = record?;
            if record.len() != names.len() {
                return Err(InputValidationError::FeatureDimensionMismatch {
                    expected: names.len(),
                    found: record.len(),
                });
            }
            for (idx, text) in record.iter().enumerate() {
                flat.push(text_number(text.trim(), row, &names[idx])?);
            }
            rows += 1;
        }
        let values = Array2::from_shape_vec((rows, names.len()), flat).map_err(|_| {
            InputValidationError::FeatureDimensionMismatch {
                expected: names.len(),
                found: 0,
            }
        })?;
        Ok(Self { names, values })
    }
}

fn is_covariate_column(name: &str, schema: &InputSchema) -> bool {
    name != schema.name_column
        && name != schema.lifespan_column
        && name != schema.death_column
        && !schema.exclude_columns.iter().any(|c| c == name)
}

fn delimiter_for(path: &Path) -> u8 {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("csv") => b',',
        _ => b'\t',
    }
}

fn json_number(value: &Value, row: usize, field: &str) -> Result<f64, InputValidationError> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
    .ok_or_else(|| InputValidationError::NonNumeric {
        row,
        field: field.to_string(),
    })?;
    finite(number, row, field)
}

fn text_number(text: &str, row: usize, field: &str) -> Result<f64, InputValidationError> {
    let number = match text {
        "true" | "True" | "TRUE" => 1.0,
        "false" | "False" | "FALSE" => 0.0,
        other => other
            .parse::<f64>()
            .map_err(|_| InputValidationError::NonNumeric {
                row,
                field: field.to_string(),
            })?,
    };
    finite(number, row, field)
}

fn finite(value: f64, row: usize, field: &str) -> Result<f64, InputValidationError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(InputValidationError::NonFinite {
            row,
            field: field.to_string(),
            value,
        })
    }
}
