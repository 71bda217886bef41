//! Survival curves from the posterior trace.
//!
//! For posterior sample `s` and a covariate vector `x`:
//!
//! ```text
//! hazard[s, j]     = lambda[s, j] * exp(beta[s] . x)
//! cumhaz[s, j]     = sum_{j' <= j} w * hazard[s, j']
//! survival[s, 0]   = 1
//! survival[s, j+1] = exp(-cumhaz[s, j])
//! ```
//!
//! Curves are indexed by interval boundary `t_j = j * w` for `j = 0..=H`, so a
//! curve over `H` intervals has `H + 1` points and the age of index `j` is `j * w`.

use crate::config::{BaselineKind, CurveOutput, ModelConfig, SummaryConfig};
use crate::hmc::PosteriorTrace;
use crate::model::{LOG_CLAMP, ModelSpecificationError};
use ndarray::{Array1, Array2, ArrayView1, Axis, s};
use serde::{Deserialize, Serialize};

/// Where a survival curve first reaches a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdCrossing {
    /// Boundary index of the crossing.
    pub index: usize,
    pub age: f64,
    /// The curve stayed above the threshold over the whole horizon; `index` is
    /// the last boundary and the true crossing lies beyond it.
    pub horizon_limited: bool,
}

/// First boundary at which `curve` is at or below `threshold`.
///
/// Falls back to the final boundary, flagged as horizon-limited, when the curve
/// never gets there.
pub fn threshold_crossing(
    curve: ArrayView1<'_, f64>,
    threshold: f64,
    interval_length: f64,
) -> ThresholdCrossing {
    match curve.iter().position(|&survival| survival <= threshold) {
        Some(index) => ThresholdCrossing {
            index,
            age: index as f64 * interval_length,
            horizon_limited: false,
        },
        None => {
            let index = curve.len().saturating_sub(1);
            ThresholdCrossing {
                index,
                age: index as f64 * interval_length,
                horizon_limited: true,
            }
        }
    }
}

/// Pointwise posterior mean of a `[n_samples, H + 1]` curve matrix.
pub fn mean_curve(curves: &Array2<f64>) -> Array1<f64> {
    curves
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(curves.ncols()))
}

/// Everything the output document needs about one character.
#[derive(Debug, Clone)]
pub struct CharacterSurvival {
    pub mean_curve: Array1<f64>,
    /// Per-sample curves, kept only when full curves were requested.
    pub curves: Option<Array2<f64>>,
    pub predicted: ThresholdCrossing,
    /// Crossing of the upper confidence threshold (the earlier age).
    pub lower_bound: ThresholdCrossing,
    /// Crossing of the lower confidence threshold (the later age).
    pub upper_bound: ThresholdCrossing,
    /// Mean over samples of each sample's own crossing age.
    pub posterior_survival_age: f64,
    /// Share of samples whose own curve never crossed the threshold.
    pub posterior_horizon_limited: f64,
}

/// Evaluates survival curves for arbitrary covariate vectors against one
/// immutable trace.
#[derive(Debug, Clone, Copy)]
pub struct SurvivalEvaluator<'a> {
    trace: &'a PosteriorTrace,
    interval_length: f64,
    horizon: usize,
}

impl<'a> SurvivalEvaluator<'a> {
    /// `horizon` is the number of intervals projected. A piecewise trace must
    /// carry exactly one hazard per projected interval.
    pub fn new(
        trace: &'a PosteriorTrace,
        interval_length: f64,
        horizon: usize,
    ) -> Result<Self, ModelSpecificationError> {
        let expected = match trace.baseline {
            BaselineKind::Piecewise => horizon,
            BaselineKind::Constant => 1,
        };
        if trace.baseline_hazard.ncols() != expected {
            return Err(ModelSpecificationError::ParameterLength {
                expected,
                found: trace.baseline_hazard.ncols(),
            });
        }
        if trace.coefficients.nrows() != trace.baseline_hazard.nrows() {
            return Err(ModelSpecificationError::ParameterLength {
                expected: trace.baseline_hazard.nrows(),
                found: trace.coefficients.nrows(),
            });
        }
        Ok(Self {
            trace,
            interval_length,
            horizon,
        })
    }

    /// Picks the horizon the model implies: the data grid for a piecewise
    /// baseline, the configured projection for a constant one.
    pub fn for_model(
        trace: &'a PosteriorTrace,
        interval_length: f64,
        n_intervals: usize,
        model: &ModelConfig,
    ) -> Result<Self, ModelSpecificationError> {
        let horizon = match trace.baseline {
            BaselineKind::Piecewise => n_intervals,
            BaselineKind::Constant => model.horizon_intervals,
        };
        Self::new(trace, interval_length, horizon)
    }

    pub fn horizon(&self) -> usize {
        self.horizon
    }

    pub fn interval_length(&self) -> f64 {
        self.interval_length
    }

    /// `[n_samples, H]` hazard per sample and interval.
    pub fn hazard(
        &self,
        covariates: ArrayView1<'_, f64>,
    ) -> Result<Array2<f64>, ModelSpecificationError> {
        let n_coefficients = self.trace.n_coefficients();
        if covariates.len() != n_coefficients {
            return Err(ModelSpecificationError::ParameterLength {
                expected: n_coefficients,
                found: covariates.len(),
            });
        }
        let risk = self
            .trace
            .coefficients
            .dot(&covariates)
            .mapv(|eta| eta.clamp(-LOG_CLAMP, LOG_CLAMP).exp());

        let baseline = &self.trace.baseline_hazard;
        let mut hazard = Array2::<f64>::zeros((self.trace.len(), self.horizon));
        for (sample, mut row) in hazard.rows_mut().into_iter().enumerate() {
            match self.trace.baseline {
                BaselineKind::Piecewise => row.assign(&baseline.row(sample)),
                BaselineKind::Constant => row.fill(baseline[[sample, 0]]),
            }
            row *= risk[sample];
        }
        Ok(hazard)
    }

    /// `[n_samples, H]` left-inclusive running sum of `w * hazard`.
    pub fn cumulative_hazard(
        &self,
        covariates: ArrayView1<'_, f64>,
    ) -> Result<Array2<f64>, ModelSpecificationError> {
        let mut cumulative = self.hazard(covariates)? * self.interval_length;
        cumulative.accumulate_axis_inplace(Axis(1), |&previous, current| *current += previous);
        Ok(cumulative)
    }

    /// `[n_samples, H + 1]` survival probability at each boundary.
    pub fn survival_curves(
        &self,
        covariates: ArrayView1<'_, f64>,
    ) -> Result<Array2<f64>, ModelSpecificationError> {
        let cumulative = self.cumulative_hazard(covariates)?;
        let mut curves = Array2::<f64>::ones((cumulative.nrows(), self.horizon + 1));
        curves
            .slice_mut(s![.., 1..])
            .assign(&cumulative.mapv(|c| (-c).exp()));
        Ok(curves)
    }

    /// Curves and derived ages for one character.
    pub fn summarize(
        &self,
        covariates: ArrayView1<'_, f64>,
        summary: &SummaryConfig,
    ) -> Result<CharacterSurvival, ModelSpecificationError> {
        let curves = self.survival_curves(covariates)?;
        let mean = mean_curve(&curves);
        let w = self.interval_length;

        let per_sample: Vec<ThresholdCrossing> = curves
            .rows()
            .into_iter()
            .map(|curve| threshold_crossing(curve, summary.survival_threshold, w))
            .collect();
        let n = per_sample.len().max(1) as f64;
        let posterior_survival_age = per_sample.iter().map(|c| c.age).sum::<f64>() / n;
        let posterior_horizon_limited =
            per_sample.iter().filter(|c| c.horizon_limited).count() as f64 / n;

        Ok(CharacterSurvival {
            predicted: threshold_crossing(mean.view(), summary.survival_threshold, w),
            lower_bound: threshold_crossing(mean.view(), summary.confidence_upper, w),
            upper_bound: threshold_crossing(mean.view(), summary.confidence_lower, w),
            posterior_survival_age,
            posterior_horizon_limited,
            mean_curve: mean,
            curves: (summary.curve == CurveOutput::Full).then_some(curves),
        })
    }
}
