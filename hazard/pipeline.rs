//! The single entry point that runs every stage in order.
//!
//! Dataset variants differ only in their [`PipelineConfig`]; there is no
//! per-variant code path. Validation and specification errors surface before
//! the sampler starts, and nothing is written by this module.

use crate::config::{ConfigError, PipelineConfig};
use crate::data::{CharacterTable, InputValidationError};
use crate::diagnostics::assess_fit;
use crate::discretize::discretize;
use crate::evaluate::{CharacterSurvival, SurvivalEvaluator};
use crate::format::{FormatError, PredictionDocument, RunContext, Thresholds};
use crate::hmc::{PosteriorTrace, SamplerError, run_nuts_sampling};
use crate::model::{HazardModel, ModelSpecificationError};
use ndarray::Axis;
use ndarray::parallel::prelude::*;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid input: {0}")]
    Input(#[from] InputValidationError),
    #[error("invalid model specification: {0}")]
    Model(#[from] ModelSpecificationError),
    #[error("sampling failed: {0}")]
    Sampler(#[from] SamplerError),
    #[error("could not format predictions: {0}")]
    Format(#[from] FormatError),
}

/// Everything a run produces. The trace is kept so callers can persist it.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub document: PredictionDocument,
    pub trace: PosteriorTrace,
}

/// Returns the configured seed, or draws a fresh one.
pub fn resolve_seed(configured: Option<u64>) -> u64 {
    match configured {
        Some(seed) => {
            log::info!("Using random seed {seed}");
            seed
        }
        None => {
            let seed = rand::random::<u64>();
            log::info!("No seed configured; drew {seed} (pass --seed {seed} to reproduce)");
            seed
        }
    }
}

/// Loads the table named by `input`, optionally widens it with an external
/// feature matrix, and runs the pipeline on it.
pub fn run(
    config: &PipelineConfig,
    input: &Path,
    features: Option<&Path>,
) -> Result<PipelineOutput, PipelineError> {
    config.validate()?;
    let mut table = CharacterTable::load(input, &config.input)?;
    if let Some(path) = features {
        table.attach_features(path, config.input.feature_dimensions)?;
    }
    run_table(config, &table)
}

/// Discretize, build, sample, evaluate and assemble, for an in-memory table.
pub fn run_table(
    config: &PipelineConfig,
    table: &CharacterTable,
) -> Result<PipelineOutput, PipelineError> {
    config.validate()?;

    // === Step 1: Discretize ===
    let discretized = discretize(table.lifespans.view(), &table.dead, &config.discretization)?;
    let grid = discretized.grid;

    // === Step 2: Build the model ===
    let model = HazardModel::new(&discretized, table.covariates.view(), &config.model)?;

    // === Step 3: Sample ===
    let seed = resolve_seed(config.sampler.random_seed);
    let result = run_nuts_sampling(&model, &config.sampler, seed)?;
    let fit_quality = assess_fit(&result, &config.sampler);
    let trace = PosteriorTrace::from_draws(&model, &result)?;

    // === Step 4: Evaluate every character against the shared trace ===
    let evaluator = SurvivalEvaluator::for_model(
        &trace,
        grid.interval_length(),
        grid.n_intervals(),
        &config.model,
    )?;
    let survival: Vec<CharacterSurvival> = table
        .covariates
        .axis_iter(Axis(0))
        .into_par_iter()
        .map(|x| evaluator.summarize(x, &config.summary))
        .collect::<Result<_, _>>()?;
    let horizon_limited = survival.iter().filter(|s| s.predicted.horizon_limited).count();
    if horizon_limited > 0 {
        log::info!(
            "{horizon_limited} characters never reach survival {} within {} intervals",
            config.summary.survival_threshold,
            evaluator.horizon()
        );
    }

    // === Step 5: Assemble ===
    let context = RunContext {
        interval_length: grid.interval_length(),
        horizon_intervals: evaluator.horizon(),
        thresholds: Thresholds::from(&config.summary),
        seed,
        clamped_exposure_cells: discretized.clamped_cells,
        fit_quality,
    };
    let document = PredictionDocument::assemble(table, &trace, &survival, context)?;

    Ok(PipelineOutput { document, trace })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SamplerConfig;
    use ndarray::array;

    fn table() -> CharacterTable {
        CharacterTable {
            names: ["a", "b", "c", "d", "e", "f"].map(String::from).to_vec(),
            lifespans: array![5.0, 3.0, 8.0, 2.5, 6.0, 9.0],
            dead: vec![true, false, true, true, false, true],
            covariate_names: vec!["male".to_string()],
            covariates: array![[1.0], [0.0], [1.0], [0.0], [0.0], [1.0]],
        }
    }

    fn quick_config() -> PipelineConfig {
        PipelineConfig {
            sampler: SamplerConfig {
                sample_count: 60,
                tune_count: 60,
                chain_count: 2,
                random_seed: Some(11),
                ..SamplerConfig::default()
            },
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn configured_seed_is_used_verbatim() {
        assert_eq!(resolve_seed(Some(1234)), 1234);
    }

    #[test]
    fn run_table_produces_complete_document() {
        let output = run_table(&quick_config(), &table()).unwrap();
        let document = &output.document;
        assert_eq!(document.seed, 11);
        assert_eq!(document.characters.len(), 6);
        assert_eq!(document.prior_hazard.len(), 9);
        assert_eq!(document.horizon_intervals, 9);
        assert_eq!(output.trace.len(), 120);
        assert_eq!(document.fit_quality.samples, 120);
        assert_eq!(document.fit_quality.iterations, 240);
        assert_eq!(
            document.fit_quality.divergence_rate,
            document.fit_quality.divergences as f64 / 240.0
        );
        for character in &document.characters {
            assert_eq!(character.survival_function_mean.len(), 10);
            assert_eq!(character.survival_function_mean[0], 1.0);
        }
    }

    #[test]
    fn invalid_config_fails_before_sampling() {
        let mut config = quick_config();
        config.summary.survival_threshold = 1.5;
        assert!(matches!(
            run_table(&config, &table()),
            Err(PipelineError::Config(ConfigError::InvalidValue {
                field: "survival_threshold",
                ..
            }))
        ));
    }

    #[test]
    fn negative_lifespan_fails_before_sampling() {
        let mut table = table();
        table.lifespans[2] = -1.0;
        assert!(matches!(
            run_table(&quick_config(), &table),
            Err(PipelineError::Input(InputValidationError::NegativeLifespan { row: 2, .. }))
        ));
    }
}
