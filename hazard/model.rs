//! Piecewise-exponential proportional-hazards model.
//!
//! For character `i` and interval `j` the expected number of deaths is
//!
//! ```text
//! mu[i, j] = exposure[i, j] * lambda[j] * exp(x_i . beta)
//! ```
//!
//! and the observed death indicator is modelled as `Poisson(mu[i, j])`. The
//! baseline `lambda` gets a Gamma prior and `beta` a wide zero-centred Normal.
//!
//! The sampler works on the unconstrained vector `q = [log lambda, beta]`, so the
//! Gamma prior is evaluated on the log scale including its Jacobian. Log-density
//! and gradient are computed analytically:
//!
//! ```text
//! log p(q) = sum_i d_i eta_i + sum_p D_p theta_p - sum_i exp(eta_i) (E lambda)_i
//!          + sum_p (alpha theta_p - rate lambda_p) - |beta|^2 / (2 sd^2) + const
//! ```
//!
//! where `d_i` is the death count of row `i`, `D_p` the deaths attributed to
//! baseline parameter `p`, and `E` the exposure matrix with its columns
//! collapsed onto baseline parameters (one column per interval for the
//! piecewise baseline, a single column for the constant baseline).

use crate::config::{BaselineKind, ModelConfig};
use crate::discretize::DiscretizedData;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use std::sync::Arc;
use thiserror::Error;

pub(crate) const LOG_CLAMP: f64 = 700.0;

#[derive(Error, Debug)]
pub enum ModelSpecificationError {
    #[error("covariate matrix has {covariate_rows} rows but the exposure matrix has {exposure_rows}")]
    CovariateRowMismatch {
        covariate_rows: usize,
        exposure_rows: usize,
    },
    #[error("death matrix shape {death:?} does not match exposure matrix shape {exposure:?}")]
    DeathShapeMismatch {
        death: (usize, usize),
        exposure: (usize, usize),
    },
    #[error("expected {expected} values, got {found}")]
    ParameterLength { expected: usize, found: usize },
    #[error("row {row} has no exposure at all (lifespan {lifespan})")]
    ZeroExposureRow { row: usize, lifespan: f64 },
    #[error("row {row} has an observed death in an interval with exposure {exposure}")]
    DegenerateEvent { row: usize, exposure: f64 },
    #[error("invalid prior: {0}")]
    InvalidPrior(String),
}

/// Gamma prior on a positive rate, parameterised by shape and rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GammaPrior {
    pub shape: f64,
    pub rate: f64,
}

impl GammaPrior {
    /// The Gamma distribution with the given mean and standard deviation.
    pub fn from_mean_sd(mean: f64, sd: f64) -> Result<Self, ModelSpecificationError> {
        if !(mean > 0.0 && sd > 0.0 && mean.is_finite() && sd.is_finite()) {
            return Err(ModelSpecificationError::InvalidPrior(format!(
                "gamma prior needs positive mean and sd, got mean={mean}, sd={sd}"
            )));
        }
        let variance = sd * sd;
        Ok(Self {
            shape: mean * mean / variance,
            rate: mean / variance,
        })
    }

    pub fn mean(&self) -> f64 {
        self.shape / self.rate
    }

    /// Log density of `lambda = exp(theta)` on the `theta` scale, up to a
    /// constant, with its derivative in `theta`.
    #[inline]
    fn log_density_on_log_scale(&self, theta: f64, lambda: f64) -> (f64, f64) {
        (
            self.shape * theta - self.rate * lambda,
            self.shape - self.rate * lambda,
        )
    }
}

/// Zero-centred Normal prior.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalPrior {
    pub sd: f64,
}

impl NormalPrior {
    #[inline]
    fn log_density(&self, beta: f64) -> (f64, f64) {
        let precision = 1.0 / (self.sd * self.sd);
        (-0.5 * beta * beta * precision, -beta * precision)
    }
}

/// Read-only model data, shared between chains without copying.
#[derive(Debug)]
struct SharedData {
    /// Covariates X [n_characters, n_coefficients]
    covariates: Array2<f64>,
    /// Exposure with columns collapsed onto baseline parameters [n_characters, n_baseline]
    exposure: Array2<f64>,
    /// Deaths per character
    row_deaths: Array1<f64>,
    /// Deaths per baseline parameter
    baseline_deaths: Array1<f64>,
}

/// The hazard model bound to one discretized dataset.
#[derive(Debug, Clone)]
pub struct HazardModel {
    data: Arc<SharedData>,
    baseline: BaselineKind,
    baseline_prior: GammaPrior,
    coefficient_prior: NormalPrior,
    n_intervals: usize,
}

impl HazardModel {
    pub fn new(
        discretized: &DiscretizedData,
        covariates: ArrayView2<'_, f64>,
        config: &ModelConfig,
    ) -> Result<Self, ModelSpecificationError> {
        let exposure = &discretized.exposure;
        let death = &discretized.death;
        if covariates.nrows() != exposure.nrows() {
            return Err(ModelSpecificationError::CovariateRowMismatch {
                covariate_rows: covariates.nrows(),
                exposure_rows: exposure.nrows(),
            });
        }
        if death.dim() != exposure.dim() {
            return Err(ModelSpecificationError::DeathShapeMismatch {
                death: death.dim(),
                exposure: exposure.dim(),
            });
        }
        for (row, &lifespan) in discretized.lifespans.iter().enumerate() {
            if lifespan <= 0.0 {
                return Err(ModelSpecificationError::ZeroExposureRow { row, lifespan });
            }
            if death.row(row).sum() > 0.0 {
                let final_exposure = discretized.raw_final_exposure(row);
                if final_exposure <= 0.0 {
                    return Err(ModelSpecificationError::DegenerateEvent {
                        row,
                        exposure: final_exposure,
                    });
                }
            }
        }

        let baseline_prior =
            GammaPrior::from_mean_sd(config.baseline_prior_mean, config.baseline_prior_sd)?;
        if !(config.coefficient_prior_sd > 0.0 && config.coefficient_prior_sd.is_finite()) {
            return Err(ModelSpecificationError::InvalidPrior(format!(
                "coefficient prior sd must be positive, got {}",
                config.coefficient_prior_sd
            )));
        }
        let coefficient_prior = NormalPrior {
            sd: config.coefficient_prior_sd,
        };

        let (collapsed_exposure, baseline_deaths) = match config.baseline {
            BaselineKind::Piecewise => (exposure.clone(), death.sum_axis(Axis(0))),
            BaselineKind::Constant => (
                exposure.sum_axis(Axis(1)).insert_axis(Axis(1)),
                Array1::from_elem(1, death.sum()),
            ),
        };

        log::info!(
            "Hazard model: {} characters, {} baseline parameters ({:?}), {} coefficients, {} observed deaths",
            exposure.nrows(),
            collapsed_exposure.ncols(),
            config.baseline,
            covariates.ncols(),
            death.sum()
        );

        Ok(Self {
            data: Arc::new(SharedData {
                covariates: covariates.to_owned(),
                exposure: collapsed_exposure,
                row_deaths: death.sum_axis(Axis(1)),
                baseline_deaths,
            }),
            baseline: config.baseline,
            baseline_prior,
            coefficient_prior,
            n_intervals: discretized.grid.n_intervals(),
        })
    }

    pub fn baseline_kind(&self) -> BaselineKind {
        self.baseline
    }

    pub fn n_baseline(&self) -> usize {
        self.data.exposure.ncols()
    }

    pub fn n_coefficients(&self) -> usize {
        self.data.covariates.ncols()
    }

    pub fn n_intervals(&self) -> usize {
        self.n_intervals
    }

    /// Length of the unconstrained vector `[log lambda, beta]`.
    pub fn dim(&self) -> usize {
        self.n_baseline() + self.n_coefficients()
    }

    /// Starting point for the sampler: the prior mean of the baseline hazard and
    /// zero coefficients.
    pub fn initial_position(&self) -> Array1<f64> {
        let mut q = Array1::<f64>::zeros(self.dim());
        q.slice_mut(s![..self.n_baseline()])
            .fill(self.baseline_prior.mean().ln());
        q
    }

    /// Splits an unconstrained position into `(baseline hazard, coefficients)`.
    pub fn unpack(
        &self,
        position: ArrayView1<'_, f64>,
    ) -> Result<(Array1<f64>, Array1<f64>), ModelSpecificationError> {
        self.check_len(position.len())?;
        let p = self.n_baseline();
        let baseline = position
            .slice(s![..p])
            .mapv(|theta| theta.clamp(-LOG_CLAMP, LOG_CLAMP).exp());
        let coefficients = position.slice(s![p..]).to_owned();
        Ok((baseline, coefficients))
    }

    /// Log posterior (up to a constant) and gradient, with a length check.
    pub fn log_posterior(
        &self,
        position: ArrayView1<'_, f64>,
    ) -> Result<(f64, Array1<f64>), ModelSpecificationError> {
        self.check_len(position.len())?;
        Ok(self.compute_logp_and_grad(position))
    }

    /// Expected event counts `mu[i, p]` per character and baseline parameter.
    pub fn expected_events(
        &self,
        position: ArrayView1<'_, f64>,
    ) -> Result<Array2<f64>, ModelSpecificationError> {
        let (baseline, coefficients) = self.unpack(position)?;
        let risk = self
            .data
            .covariates
            .dot(&coefficients)
            .mapv(|eta| eta.clamp(-LOG_CLAMP, LOG_CLAMP).exp());
        let mut mu = self.data.exposure.clone();
        for (mut row, &r) in mu.rows_mut().into_iter().zip(risk.iter()) {
            row *= r;
            row *= &baseline;
        }
        Ok(mu)
    }

    /// Diagonal of the negative Hessian of the log posterior. Every entry is
    /// positive, so its inverse square root is a usable per-coordinate scale.
    pub fn curvature(
        &self,
        position: ArrayView1<'_, f64>,
    ) -> Result<Array1<f64>, ModelSpecificationError> {
        self.check_len(position.len())?;
        let data = &self.data;
        let p = self.n_baseline();
        let lambda = position
            .slice(s![..p])
            .mapv(|t| t.clamp(-LOG_CLAMP, LOG_CLAMP).exp());
        let risk = data
            .covariates
            .dot(&position.slice(s![p..]))
            .mapv(|e| e.clamp(-LOG_CLAMP, LOG_CLAMP).exp());

        let mut curvature = Array1::<f64>::zeros(self.dim());
        // lambda_p (E^T risk)_p + rate lambda_p
        let exposed_risk = data.exposure.t().dot(&risk);
        for k in 0..p {
            curvature[k] = lambda[k] * (exposed_risk[k] + self.baseline_prior.rate);
        }
        // sum_i x_ik^2 risk_i (E lambda)_i + 1 / sd^2
        let row_rate = &risk * &data.exposure.dot(&lambda);
        let precision = 1.0 / (self.coefficient_prior.sd * self.coefficient_prior.sd);
        for (k, column) in data.covariates.columns().into_iter().enumerate() {
            let weighted: f64 = column.iter().zip(&row_rate).map(|(x, r)| x * x * r).sum();
            curvature[p + k] = weighted + precision;
        }
        Ok(curvature)
    }

    fn check_len(&self, found: usize) -> Result<(), ModelSpecificationError> {
        if found == self.dim() {
            Ok(())
        } else {
            Err(ModelSpecificationError::ParameterLength {
                expected: self.dim(),
                found,
            })
        }
    }

    pub(crate) fn compute_logp_and_grad(&self, position: ArrayView1<'_, f64>) -> (f64, Array1<f64>) {
        let data = &self.data;
        let p = self.n_baseline();
        let theta = position.slice(s![..p]);
        let beta = position.slice(s![p..]);

        // === Step 1: baseline hazard and per-character relative risk ===
        let theta_clamped = theta.mapv(|t| t.clamp(-LOG_CLAMP, LOG_CLAMP));
        let lambda = theta_clamped.mapv(f64::exp);
        let eta = data
            .covariates
            .dot(&beta)
            .mapv(|e| e.clamp(-LOG_CLAMP, LOG_CLAMP));
        let risk = eta.mapv(f64::exp);

        // === Step 2: Poisson log-likelihood ===
        // sum_j mu[i, j] = risk_i * (E lambda)_i
        let exposure_lambda = data.exposure.dot(&lambda);
        let row_rate = &risk * &exposure_lambda;
        let log_lik = data.row_deaths.dot(&eta) + data.baseline_deaths.dot(&theta_clamped)
            - row_rate.sum();

        // === Step 3: likelihood gradient ===
        // d/dtheta_p = D_p - lambda_p * (E^T risk)_p
        let grad_theta_lik = &data.baseline_deaths - &(&lambda * &data.exposure.t().dot(&risk));
        // d/dbeta = X^T (d - risk * (E lambda))
        let grad_beta_lik = data.covariates.t().dot(&(&data.row_deaths - &row_rate));

        // === Step 4: priors ===
        let mut log_prior = 0.0;
        let mut grad = Array1::<f64>::zeros(self.dim());
        for (k, (&t, &l)) in theta_clamped.iter().zip(lambda.iter()).enumerate() {
            let (lp, g) = self.baseline_prior.log_density_on_log_scale(t, l);
            log_prior += lp;
            grad[k] = grad_theta_lik[k] + g;
        }
        for (k, &b) in beta.iter().enumerate() {
            let (lp, g) = self.coefficient_prior.log_density(b);
            log_prior += lp;
            grad[p + k] = grad_beta_lik[k] + g;
        }

        (log_lik + log_prior, grad)
    }
}
