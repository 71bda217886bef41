//! The prediction document written at the end of a run.
//!
//! Every number is checked before the document exists: a non-finite value
//! anywhere aborts assembly with [`FormatError::NonFinite`] naming the field and
//! the character, so nothing downstream ever sees `NaN` or `inf` (which
//! `serde_json` would silently turn into `null`).

use crate::config::{BaselineKind, SummaryConfig};
use crate::data::CharacterTable;
use crate::diagnostics::FitQuality;
use crate::evaluate::{CharacterSurvival, ThresholdCrossing};
use crate::hmc::PosteriorTrace;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("I/O error on prediction document: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error on prediction document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("non-finite value in '{field}' ({scope})")]
    NonFinite { field: &'static str, scope: String },
    #[error("{expected} characters in the table but {found} survival summaries")]
    CharacterCountMismatch { expected: usize, found: usize },
}

// --- Public Data Structures ---

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thresholds {
    pub survival: f64,
    pub confidence_lower: f64,
    pub confidence_upper: f64,
}

impl From<&SummaryConfig> for Thresholds {
    fn from(summary: &SummaryConfig) -> Self {
        Self {
            survival: summary.survival_threshold,
            confidence_lower: summary.confidence_lower,
            confidence_upper: summary.confidence_upper,
        }
    }
}

/// One character's prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterPrediction {
    pub name: String,
    pub alive: bool,
    /// Observed lifespan (age at death, or current age when alive).
    pub age: f64,
    pub predicted_survival_age: ThresholdCrossing,
    /// Where the mean curve crosses the upper confidence threshold.
    pub conf_interval_lower: ThresholdCrossing,
    /// Where the mean curve crosses the lower confidence threshold.
    pub conf_interval_higher: ThresholdCrossing,
    pub posterior_survival_age: f64,
    pub posterior_horizon_limited: f64,
    pub survival_function_mean: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub survival_function_samples: Option<Vec<Vec<f64>>>,
}

/// Run-level facts that are not derived from the trace.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub interval_length: f64,
    pub horizon_intervals: usize,
    pub thresholds: Thresholds,
    pub seed: u64,
    pub clamped_exposure_cells: usize,
    pub fit_quality: FitQuality,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionDocument {
    /// Covariate names, in coefficient order.
    pub attributes: Vec<String>,
    /// `exp` of the posterior-mean coefficient, per attribute.
    pub mean_beta_exp: Vec<f64>,
    /// Posterior-mean baseline hazard.
    pub prior_hazard: Vec<f64>,
    pub baseline: BaselineKind,
    pub interval_length: f64,
    pub horizon_intervals: usize,
    pub thresholds: Thresholds,
    pub seed: u64,
    pub clamped_exposure_cells: usize,
    pub fit_quality: FitQuality,
    pub characters: Vec<CharacterPrediction>,
}

const GLOBAL: &str = "global";

fn check(field: &'static str, scope: &str, value: f64) -> Result<f64, FormatError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(FormatError::NonFinite {
            field,
            scope: scope.to_string(),
        })
    }
}

fn check_all<'a>(
    field: &'static str,
    scope: &str,
    values: impl IntoIterator<Item = &'a f64>,
) -> Result<Vec<f64>, FormatError> {
    values.into_iter().map(|&v| check(field, scope, v)).collect()
}

fn check_crossing(
    field: &'static str,
    scope: &str,
    crossing: ThresholdCrossing,
) -> Result<ThresholdCrossing, FormatError> {
    check(field, scope, crossing.age)?;
    Ok(crossing)
}

impl CharacterPrediction {
    fn assemble(
        name: &str,
        dead: bool,
        age: f64,
        survival: &CharacterSurvival,
    ) -> Result<Self, FormatError> {
        let scope = format!("character '{name}'");
        let samples = survival
            .curves
            .as_ref()
            .map(|curves| {
                curves
                    .rows()
                    .into_iter()
                    .map(|row| check_all("survivalFunctionSamples", &scope, row.iter()))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;
        Ok(Self {
            name: name.to_string(),
            alive: !dead,
            age: check("age", &scope, age)?,
            predicted_survival_age: check_crossing("predictedSurvivalAge", &scope, survival.predicted)?,
            conf_interval_lower: check_crossing("confIntervalLower", &scope, survival.lower_bound)?,
            conf_interval_higher: check_crossing("confIntervalHigher", &scope, survival.upper_bound)?,
            posterior_survival_age: check(
                "posteriorSurvivalAge",
                &scope,
                survival.posterior_survival_age,
            )?,
            posterior_horizon_limited: check(
                "posteriorHorizonLimited",
                &scope,
                survival.posterior_horizon_limited,
            )?,
            survival_function_mean: check_all(
                "survivalFunctionMean",
                &scope,
                survival.mean_curve.iter(),
            )?,
            survival_function_samples: samples,
        })
    }
}

impl PredictionDocument {
    /// Builds the document, rejecting any non-finite number.
    pub fn assemble(
        table: &CharacterTable,
        trace: &PosteriorTrace,
        survival: &[CharacterSurvival],
        context: RunContext,
    ) -> Result<Self, FormatError> {
        if survival.len() != table.len() {
            return Err(FormatError::CharacterCountMismatch {
                expected: table.len(),
                found: survival.len(),
            });
        }

        let mean_beta_exp = trace.mean_coefficients().mapv(f64::exp);
        let prior_hazard = trace.mean_baseline_hazard();
        let quality = &context.fit_quality;
        check("fitQuality.divergenceRate", GLOBAL, quality.divergence_rate)?;
        for value in quality.rhat.iter().chain(&quality.ess) {
            check("fitQuality", GLOBAL, *value)?;
        }

        let characters = table
            .names
            .iter()
            .zip(&table.dead)
            .zip(table.lifespans.iter())
            .zip(survival)
            .map(|(((name, &dead), &age), summary)| {
                CharacterPrediction::assemble(name, dead, age, summary)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            attributes: table.covariate_names.clone(),
            mean_beta_exp: check_all("meanBetaExp", GLOBAL, mean_beta_exp.iter())?,
            prior_hazard: check_all("priorHazard", GLOBAL, prior_hazard.iter())?,
            baseline: trace.baseline,
            interval_length: check("intervalLength", GLOBAL, context.interval_length)?,
            horizon_intervals: context.horizon_intervals,
            thresholds: context.thresholds,
            seed: context.seed,
            clamped_exposure_cells: context.clamped_exposure_cells,
            fit_quality: context.fit_quality,
            characters,
        })
    }

    pub fn write_json(&self, path: &Path) -> Result<(), FormatError> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        log::info!(
            "Wrote predictions for {} characters to {}",
            self.characters.len(),
            path.display()
        );
        Ok(())
    }

    pub fn read_json(path: &Path) -> Result<Self, FormatError> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}
