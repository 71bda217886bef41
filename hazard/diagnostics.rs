//! Convergence checks for a finished sampler run.
//!
//! R-hat and effective sample size come from the sampler's own run statistics;
//! divergences from the count kept by the posterior target. Nothing here aborts
//! the pipeline. Problems are collected as [`FitQualityWarning`]s, logged, and
//! carried into the output document through [`FitQuality`].

use crate::config::SamplerConfig;
use crate::hmc::NutsResult;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A non-fatal problem with the posterior fit.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FitQualityWarning {
    #[error("{divergences} divergent transitions ({rate:.3} of iterations, limit {threshold})")]
    #[serde(rename_all = "camelCase")]
    ExcessiveDivergence {
        divergences: usize,
        rate: f64,
        threshold: f64,
    },
    #[error("mean R-hat is {value:.3} (limit {threshold})")]
    #[serde(rename_all = "camelCase")]
    HighRhat { value: f64, threshold: f64 },
    #[error("mean effective sample size is {value:.1} (minimum {threshold})")]
    #[serde(rename_all = "camelCase")]
    LowEss { value: f64, threshold: f64 },
}

/// Summary of how trustworthy a sampler run is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FitQuality {
    /// Kept draws over every chain
    pub samples: usize,
    /// Transitions over every chain, tuning included
    pub iterations: usize,
    pub divergences: usize,
    /// `divergences / iterations`
    pub divergence_rate: f64,
    /// Mean R-hat over parameters; absent when the sampler could not compute it.
    pub rhat: Option<f64>,
    pub ess: Option<f64>,
    pub warnings: Vec<FitQualityWarning>,
    /// True when at least one warning was raised.
    pub flagged: bool,
}

/// Compares the run against the configured limits and collects the warnings.
pub fn assess_fit(result: &NutsResult, config: &SamplerConfig) -> FitQuality {
    let samples = result.total_samples();
    let divergence_rate = if result.iterations > 0 {
        result.divergences as f64 / result.iterations as f64
    } else {
        0.0
    };

    let mut warnings = Vec::new();
    if divergence_rate > config.max_divergence_rate {
        warnings.push(FitQualityWarning::ExcessiveDivergence {
            divergences: result.divergences,
            rate: divergence_rate,
            threshold: config.max_divergence_rate,
        });
    }
    if let Some(value) = result.rhat.filter(|r| *r > config.max_rhat) {
        warnings.push(FitQualityWarning::HighRhat {
            value,
            threshold: config.max_rhat,
        });
    }
    if let Some(value) = result.ess.filter(|e| *e < config.min_ess) {
        warnings.push(FitQualityWarning::LowEss {
            value,
            threshold: config.min_ess,
        });
    }

    for warning in &warnings {
        log::warn!("Fit quality: {warning}");
    }

    FitQuality {
        samples,
        iterations: result.iterations,
        divergences: result.divergences,
        divergence_rate,
        rhat: result.rhat,
        ess: result.ess,
        flagged: !warnings.is_empty(),
        warnings,
    }
}
