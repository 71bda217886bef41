//! NUTS sampling of the hazard posterior using mini-mcmc.
//!
//! # Design
//!
//! mini-mcmc's NUTS uses an identity mass matrix, while log-hazards and
//! covariate coefficients live on very different scales. The sampler therefore
//! explores a whitened vector `z`:
//!
//! - Transform: `q = mode + scale * z`, with `scale_k = curvature_k^(-1/2)`
//!   taken from the diagonal of the negative Hessian at the mode
//! - The mode is found by damped diagonal Newton ascent from the prior mean
//! - Draws are mapped back to `q = [log lambda, beta]` before anything else
//!   sees them
//!
//! # Analytical Gradients
//!
//! `unnorm_logp_and_grad` is overridden to evaluate the model's analytic
//! gradient with ndarray; burn's autodiff is never used.
//!
//! # Divergences
//!
//! mini-mcmc stops a trajectory internally when its energy error passes
//! [`MAX_ENERGY_ERROR`] but does not report it. The target counts those
//! evaluations itself: every log density that is not finite, or that lies more
//! than [`MAX_ENERGY_ERROR`] below the log density at the mode, is recorded as a
//! divergence on a counter shared by every chain. A trajectory stops at its
//! first divergent point, so each such evaluation stands for one divergent
//! transition. The count covers tuning and sampling together.
//!
//! # Chains
//!
//! mini-mcmc clones the target once per chain. The model data, the transform
//! and the divergence counter sit behind `Arc`, so clones share them. Each chain
//! starts from its own jittered point and the sampler's random streams are
//! seeded from the run seed.

use crate::config::{BaselineKind, SamplerConfig};
use crate::model::{HazardModel, ModelSpecificationError};
use burn::backend::{Autodiff, NdArray};
use burn::prelude::*;
use burn::tensor::TensorData;
use mini_mcmc::distributions::GradientTarget;
use mini_mcmc::nuts::NUTS;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

/// Backend type for NUTS - f64 throughout
pub type NutsBackend = Autodiff<NdArray<f64>>;

/// Drop in log density below the mode that counts as a divergence.
pub const MAX_ENERGY_ERROR: f64 = 1000.0;

/// Spread of the jitter around the mode, in whitened units.
const INIT_JITTER: f64 = 0.1;

const INIT_ATTEMPTS: usize = 100;

const MODE_ITERATIONS: usize = 200;

const MODE_TOLERANCE: f64 = 1e-8;

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("chain {chain}: log density is not finite at every initial point tried (last value {logp})")]
    NonFiniteStart { chain: usize, logp: f64 },
    #[error("log density is not finite at the starting point (value {logp})")]
    NonFiniteMode { logp: f64 },
    #[error("sampler returned draws of length {found}, the model has {expected} parameters")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("could not unpack a draw into model parameters: {0}")]
    Unpack(#[from] ModelSpecificationError),
    #[error("NUTS sampling failed: {0}")]
    Backend(String),
}

/// Whitened hazard posterior with analytical gradients.
#[derive(Clone)]
pub struct HazardPosterior {
    model: HazardModel,
    /// Mode of the log posterior in `q` space
    mode: Arc<Array1<f64>>,
    /// Per-coordinate scale: `q = mode + scale * z`
    scale: Arc<Array1<f64>>,
    mode_logp: f64,
    divergences: Arc<AtomicUsize>,
}

impl HazardPosterior {
    /// Locates the mode from `start` and fixes the whitening transform there.
    pub fn new(model: HazardModel, start: ArrayView1<'_, f64>) -> Result<Self, SamplerError> {
        let (mode, mode_logp) = locate_mode(&model, start)?;
        let scale = model.curvature(mode.view())?.mapv(|c| {
            let s = c.sqrt().recip();
            if s.is_finite() && s > 0.0 { s } else { 1.0 }
        });
        log::debug!(
            "Posterior mode found at log density {mode_logp:.3}; scales {:?}",
            scale.to_vec()
        );
        Ok(Self {
            model,
            mode: Arc::new(mode),
            scale: Arc::new(scale),
            mode_logp,
            divergences: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn dim(&self) -> usize {
        self.mode.len()
    }

    pub fn mode(&self) -> &Array1<f64> {
        &self.mode
    }

    pub fn scale(&self) -> &Array1<f64> {
        &self.scale
    }

    /// Divergent evaluations recorded so far, over every clone.
    pub fn divergences(&self) -> usize {
        self.divergences.load(Ordering::Relaxed)
    }

    /// Maps whitened draws (one per row) back to `q` space.
    pub fn unwhiten(&self, z: &Array2<f64>) -> Array2<f64> {
        z * &*self.scale + &*self.mode
    }

    /// Log posterior and gradient in whitened coordinates, recording
    /// divergent evaluations.
    fn compute_logp_and_grad_nd(&self, z: ArrayView1<'_, f64>) -> (f64, Array1<f64>) {
        // === Step 1: Transform z (whitened) -> q (model space) ===
        let q = &*self.mode + &(&z * &*self.scale);

        // === Step 2: Model log posterior and gradient in q ===
        let (logp, grad_q) = self.model.compute_logp_and_grad(q.view());

        // === Step 3: Chain rule: grad_z = scale * grad_q ===
        let grad_z = grad_q * &*self.scale;

        if !logp.is_finite()
            || self.mode_logp - logp > MAX_ENERGY_ERROR
            || grad_z.iter().any(|g| !g.is_finite())
        {
            self.divergences.fetch_add(1, Ordering::Relaxed);
        }
        (logp, grad_z)
    }

    /// Reads a position tensor. A tensor that cannot be read, or has the wrong
    /// length, is treated as a divergent point.
    fn evaluate(&self, z: Tensor<NutsBackend, 1>) -> (f64, Array1<f64>) {
        let values: Option<Vec<f64>> = z.into_data().to_vec().ok();
        match values {
            Some(values) if values.len() == self.dim() => {
                self.compute_logp_and_grad_nd(Array1::from_vec(values).view())
            }
            _ => {
                self.divergences.fetch_add(1, Ordering::Relaxed);
                (f64::NEG_INFINITY, Array1::zeros(self.dim()))
            }
        }
    }

    /// Jittered starting point for one chain, in whitened coordinates.
    fn initial_point(&self, chain: usize, seed: u64) -> Result<Vec<f64>, SamplerError> {
        let mut rng = StdRng::seed_from_u64(chain_seed(seed, chain));
        let mut logp = f64::NAN;
        for _ in 0..INIT_ATTEMPTS {
            let z: Array1<f64> = (0..self.dim())
                .map(|_| {
                    let n: f64 = StandardNormal.sample(&mut rng);
                    INIT_JITTER * n
                })
                .collect();
            let q = &*self.mode + &(&z * &*self.scale);
            let (lp, grad) = self.model.compute_logp_and_grad(q.view());
            logp = lp;
            if lp.is_finite() && grad.iter().all(|g| g.is_finite()) {
                return Ok(z.to_vec());
            }
        }
        Err(SamplerError::NonFiniteStart { chain, logp })
    }
}

impl GradientTarget<f64, NutsBackend> for HazardPosterior {
    fn unnorm_logp(&self, z: Tensor<NutsBackend, 1>) -> Tensor<NutsBackend, 1> {
        let device = z.device();
        let (logp, _) = self.evaluate(z);
        Tensor::<NutsBackend, 1>::from_data(TensorData::new(vec![logp], [1]), &device)
    }

    fn unnorm_logp_and_grad(
        &self,
        z: Tensor<NutsBackend, 1>,
    ) -> (Tensor<NutsBackend, 1>, Tensor<NutsBackend, 1>) {
        let device = z.device();
        let (logp, grad_z) = self.evaluate(z);

        let logp_tensor =
            Tensor::<NutsBackend, 1>::from_data(TensorData::new(vec![logp], [1]), &device);
        let grad_tensor = Tensor::<NutsBackend, 1>::from_data(
            TensorData::new(grad_z.to_vec(), [self.dim()]),
            &device,
        );
        (logp_tensor, grad_tensor)
    }
}

/// Damped diagonal Newton ascent on the log posterior.
///
/// Each step is `grad / curvature`, halved until the log density improves.
/// Returns the last accepted point and its log density.
pub fn locate_mode(
    model: &HazardModel,
    start: ArrayView1<'_, f64>,
) -> Result<(Array1<f64>, f64), SamplerError> {
    let (mut logp, mut grad) = model.log_posterior(start)?;
    if !logp.is_finite() {
        return Err(SamplerError::NonFiniteMode { logp });
    }
    let mut q = start.to_owned();
    for _ in 0..MODE_ITERATIONS {
        let step = &grad / &model.curvature(q.view())?;
        if step.iter().all(|s| s.abs() < MODE_TOLERANCE) {
            break;
        }
        let mut damping = 1.0;
        let mut improved = false;
        for _ in 0..30 {
            let candidate = &q + &(&step * damping);
            let (lp, g) = model.compute_logp_and_grad(candidate.view());
            if lp.is_finite() && lp >= logp {
                q = candidate;
                logp = lp;
                grad = g;
                improved = true;
                break;
            }
            damping *= 0.5;
        }
        if !improved {
            break;
        }
    }
    Ok((q, logp))
}

/// Raw output of [`run_nuts_sampling`], in model space `q`.
#[derive(Clone, Debug)]
pub struct NutsResult {
    /// One `[samples_per_chain, dim]` matrix per chain.
    pub draws: Vec<Array2<f64>>,
    /// Mean split R-hat over parameters, as reported by the sampler
    pub rhat: Option<f64>,
    /// Mean effective sample size over parameters
    pub ess: Option<f64>,
    /// Divergent transitions over tuning and sampling
    pub divergences: usize,
    /// Transitions run over every chain, tuning included
    pub iterations: usize,
    pub seed: u64,
}

impl NutsResult {
    pub fn total_samples(&self) -> usize {
        self.draws.iter().map(|d| d.nrows()).sum()
    }

    pub fn dim(&self) -> usize {
        self.draws.first().map_or(0, |d| d.ncols())
    }
}

/// Posterior samples in model space, shared read-only by every evaluation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PosteriorTrace {
    pub baseline: BaselineKind,
    /// `[n_samples, n_baseline]`: one hazard per interval, or a single column
    /// for the constant baseline.
    pub baseline_hazard: Array2<f64>,
    /// `[n_samples, n_coefficients]`
    pub coefficients: Array2<f64>,
    pub chain_count: usize,
    pub samples_per_chain: usize,
}

impl PosteriorTrace {
    /// Maps every draw through the model's parameterisation.
    pub fn from_draws(model: &HazardModel, result: &NutsResult) -> Result<Self, SamplerError> {
        let total = result.total_samples();
        let mut baseline_hazard = Array2::<f64>::zeros((total, model.n_baseline()));
        let mut coefficients = Array2::<f64>::zeros((total, model.n_coefficients()));
        let draws = result.draws.iter().flat_map(|chain| chain.rows());
        for (row, draw) in draws.enumerate() {
            let (baseline, beta) = model.unpack(draw)?;
            baseline_hazard.row_mut(row).assign(&baseline);
            coefficients.row_mut(row).assign(&beta);
        }
        Ok(Self {
            baseline: model.baseline_kind(),
            baseline_hazard,
            coefficients,
            chain_count: result.draws.len(),
            samples_per_chain: result.draws.first().map_or(0, |d| d.nrows()),
        })
    }

    pub fn len(&self) -> usize {
        self.baseline_hazard.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn n_coefficients(&self) -> usize {
        self.coefficients.ncols()
    }

    pub fn mean_baseline_hazard(&self) -> Array1<f64> {
        self.baseline_hazard
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(self.baseline_hazard.ncols()))
    }

    pub fn mean_coefficients(&self) -> Array1<f64> {
        self.coefficients
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(self.coefficients.ncols()))
    }
}

/// Derives an independent seed for one chain from the run seed (SplitMix64).
pub fn chain_seed(seed: u64, chain: usize) -> u64 {
    let mut z = seed.wrapping_add((chain as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Runs NUTS on the hazard posterior of `model`.
pub fn run_nuts_sampling(
    model: &HazardModel,
    config: &SamplerConfig,
    seed: u64,
) -> Result<NutsResult, SamplerError> {
    let posterior = HazardPosterior::new(model.clone(), model.initial_position().view())?;
    let dim = posterior.dim();

    let initial_positions: Vec<Vec<f64>> = (0..config.chain_count)
        .map(|chain| posterior.initial_point(chain, seed))
        .collect::<Result<_, _>>()?;

    log::info!(
        "NUTS: {} chains x ({} tuning + {} kept) iterations, target acceptance {}, seed {}",
        config.chain_count,
        config.tune_count,
        config.sample_count,
        config.target_acceptance,
        seed
    );

    let mut sampler = NUTS::<f64, NutsBackend, HazardPosterior>::new(
        posterior.clone(),
        initial_positions,
        config.target_acceptance,
    )
    .set_seed(seed);

    let (samples_tensor, run_stats) = sampler
        .run_progress(config.sample_count, config.tune_count)
        .map_err(|e| SamplerError::Backend(e.to_string()))?;

    log::info!("NUTS sampling complete: {}", run_stats);

    // === Un-whiten: q = mode + scale * z, chain-major rows ===
    let shape = samples_tensor.dims();
    let (n_chains, n_draws) = (shape[0], shape[1]);
    if shape[2] != dim {
        return Err(SamplerError::DimensionMismatch {
            expected: dim,
            found: shape[2],
        });
    }
    let data: Vec<f64> = samples_tensor
        .into_data()
        .to_vec()
        .map_err(|e| SamplerError::Backend(format!("{e:?}")))?;
    let whitened = Array2::from_shape_vec((n_chains * n_draws, dim), data)
        .map_err(|e| SamplerError::Backend(e.to_string()))?;
    let unwhitened = posterior.unwhiten(&whitened);
    let draws: Vec<Array2<f64>> = (0..n_chains)
        .map(|chain| {
            unwhitened
                .slice(ndarray::s![chain * n_draws..(chain + 1) * n_draws, ..])
                .to_owned()
        })
        .collect();

    let rhat = f64::from(run_stats.rhat.mean);
    let ess = f64::from(run_stats.ess.mean);
    let result = NutsResult {
        draws,
        rhat: rhat.is_finite().then_some(rhat),
        ess: ess.is_finite().then_some(ess),
        divergences: posterior.divergences(),
        iterations: n_chains * (config.tune_count + config.sample_count),
        seed,
    };
    if result.divergences > 0 {
        log::warn!(
            "{} divergent transitions over {} iterations",
            result.divergences,
            result.iterations
        );
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DiscretizationConfig, ModelConfig};
    use crate::discretize::discretize;
    use ndarray::array;

    fn toy_model(baseline: BaselineKind) -> HazardModel {
        let lifespans = array![5.0, 3.0, 4.5, 2.2, 6.0, 1.5];
        let dead = [true, false, true, false, true, true];
        let data = discretize(lifespans.view(), &dead, &DiscretizationConfig::default()).unwrap();
        let covariates = array![[1.0], [0.0], [1.0], [0.0], [0.0], [1.0]];
        let config = ModelConfig {
            baseline,
            ..ModelConfig::default()
        };
        HazardModel::new(&data, covariates.view(), &config).unwrap()
    }

    fn posterior(baseline: BaselineKind) -> HazardPosterior {
        let model = toy_model(baseline);
        let start = model.initial_position();
        HazardPosterior::new(model, start.view()).unwrap()
    }

    fn config(seed: u64) -> SamplerConfig {
        SamplerConfig {
            sample_count: 100,
            tune_count: 100,
            chain_count: 2,
            random_seed: Some(seed),
            ..SamplerConfig::default()
        }
    }

    fn tensor(values: Vec<f64>) -> Tensor<NutsBackend, 1> {
        let len = values.len();
        Tensor::<NutsBackend, 1>::from_data(TensorData::new(values, [len]), &Default::default())
    }

    #[test]
    fn mode_is_a_stationary_point() {
        let model = toy_model(BaselineKind::Constant);
        let start = model.initial_position();
        let (start_logp, _) = model.log_posterior(start.view()).unwrap();
        let (mode, logp) = locate_mode(&model, start.view()).unwrap();
        assert!(logp >= start_logp);
        let (_, grad) = model.log_posterior(mode.view()).unwrap();
        assert!(grad.iter().all(|g| g.abs() < 1e-4), "gradient at mode: {grad}");
    }

    #[test]
    fn whitened_gradient_matches_finite_differences() {
        let posterior = posterior(BaselineKind::Piecewise);
        let z: Array1<f64> = (0..posterior.dim()).map(|i| 0.3 - 0.1 * i as f64).collect();
        let (_, grad) = posterior.compute_logp_and_grad_nd(z.view());
        let eps = 1e-6;
        for i in 0..posterior.dim() {
            let mut plus = z.clone();
            let mut minus = z.clone();
            plus[i] += eps;
            minus[i] -= eps;
            let (lp_plus, _) = posterior.compute_logp_and_grad_nd(plus.view());
            let (lp_minus, _) = posterior.compute_logp_and_grad_nd(minus.view());
            let fd = (lp_plus - lp_minus) / (2.0 * eps);
            assert!(
                (grad[i] - fd).abs() <= 1e-5 * (1.0 + fd.abs()),
                "gradient mismatch at {i}: analytical={}, fd={fd}",
                grad[i]
            );
        }
        assert_eq!(posterior.divergences(), 0);
    }

    #[test]
    fn tensor_interface_matches_ndarray_evaluation() {
        let posterior = posterior(BaselineKind::Constant);
        let z = vec![0.2, -0.4];
        let (logp, grad) = posterior.unnorm_logp_and_grad(tensor(z.clone()));
        let (expected_logp, expected_grad) =
            posterior.compute_logp_and_grad_nd(Array1::from_vec(z.clone()).view());
        let logp: Vec<f64> = logp.into_data().to_vec().unwrap();
        let grad: Vec<f64> = grad.into_data().to_vec().unwrap();
        assert_eq!(logp, vec![expected_logp]);
        assert_eq!(grad, expected_grad.to_vec());
        let logp_only: Vec<f64> = posterior.unnorm_logp(tensor(z)).into_data().to_vec().unwrap();
        assert_eq!(logp_only, vec![expected_logp]);
    }

    #[test]
    fn far_points_are_counted_as_divergent() {
        let posterior = posterior(BaselineKind::Constant);
        let clone = posterior.clone();

        posterior.compute_logp_and_grad_nd(array![0.1, -0.1].view());
        assert_eq!(posterior.divergences(), 0);

        // Thousands of standard deviations from the mode.
        let (logp, _) = clone.compute_logp_and_grad_nd(array![5000.0, 5000.0].view());
        assert!(!(posterior.mode_logp - logp <= MAX_ENERGY_ERROR));
        assert_eq!(posterior.divergences(), 1, "clones share one counter");

        let (logp, grad) = posterior.unnorm_logp_and_grad(tensor(vec![0.0; 5]));
        let logp: Vec<f64> = logp.into_data().to_vec().unwrap();
        assert_eq!(logp, vec![f64::NEG_INFINITY]);
        assert_eq!(grad.dims(), [2]);
        assert_eq!(posterior.divergences(), 2);
    }

    #[test]
    fn unwhiten_inverts_the_transform() {
        let posterior = posterior(BaselineKind::Constant);
        let z = array![[0.0, 0.0], [1.0, -2.0]];
        let q = posterior.unwhiten(&z);
        assert_eq!(q.row(0), posterior.mode().view());
        let expected = posterior.mode()[1] - 2.0 * posterior.scale()[1];
        assert!((q[[1, 1]] - expected).abs() < 1e-12);
    }

    #[test]
    fn chain_starting_points_differ() {
        let posterior = posterior(BaselineKind::Piecewise);
        let a = posterior.initial_point(0, 7).unwrap();
        let b = posterior.initial_point(1, 7).unwrap();
        assert_eq!(a, posterior.initial_point(0, 7).unwrap());
        assert_ne!(a, b);
        assert_eq!(posterior.divergences(), 0);
    }

    #[test]
    fn chain_seeds_are_distinct() {
        let seeds: Vec<u64> = (0..16).map(|c| chain_seed(1234, c)).collect();
        for i in 0..seeds.len() {
            for j in (i + 1)..seeds.len() {
                assert_ne!(seeds[i], seeds[j]);
            }
            assert_ne!(seeds[i], 1234);
        }
    }

    #[test]
    fn sampling_returns_chain_major_draws_in_model_space() {
        let model = toy_model(BaselineKind::Constant);
        let result = run_nuts_sampling(&model, &config(11), 11).unwrap();
        assert_eq!(result.draws.len(), 2);
        assert_eq!(result.total_samples(), 200);
        assert_eq!(result.dim(), 2);
        assert_eq!(result.iterations, 400);
        assert!(result.draws.iter().all(|d| d.iter().all(|v| v.is_finite())));

        // Log-hazard draws sit around the mode, not around the whitened origin.
        let (mode, _) = locate_mode(&model, model.initial_position().view()).unwrap();
        let mut all = Array2::<f64>::zeros((0, 2));
        for chain in &result.draws {
            all.append(Axis(0), chain.view()).unwrap();
        }
        let mean = all.mean_axis(Axis(0)).unwrap();
        assert!((mean[0] - mode[0]).abs() < 1.0, "mean {mean}, mode {mode}");

        let trace = PosteriorTrace::from_draws(&model, &result).unwrap();
        assert_eq!(trace.len(), 200);
        assert!(trace.baseline_hazard.iter().all(|&h| h > 0.0));
    }

    #[test]
    fn same_seed_reproduces_draws() {
        let model = toy_model(BaselineKind::Constant);
        let mut cfg = config(5);
        cfg.sample_count = 30;
        cfg.tune_count = 30;
        let a = run_nuts_sampling(&model, &cfg, 5).unwrap();
        let b = run_nuts_sampling(&model, &cfg, 5).unwrap();
        assert_eq!(a.draws, b.draws);
        assert_ne!(a.draws[0], a.draws[1], "chains must not share a random stream");
    }
}
