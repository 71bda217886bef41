//! Interval discretization of lifespans.
//!
//! Lifespans are mapped onto a fixed-width grid `[0, w), [w, 2w), ...` that covers
//! the longest observed lifespan. Each character contributes one row to two
//! matrices:
//!
//! - exposure: time at risk inside each interval (full width before the last
//!   observed interval, the fractional remainder inside it, nothing after it);
//! - death: a single 1 at the last observed interval if the death was observed,
//!   an all-zero row if the character is censored.
//!
//! Exposure cells at or below zero are replaced by a tiny positive floor before
//! the matrix leaves this module. Zero exposure makes the Poisson rate of that
//! cell exactly zero, which the sampler handles poorly; the floor keeps every
//! rate strictly positive at the cost of a negligible amount of phantom
//! exposure. This is an approximation, and the number of floored cells is
//! reported so it can be audited.

use crate::config::DiscretizationConfig;
use crate::data::InputValidationError;
use ndarray::{Array1, Array2, ArrayView1};

/// A fixed-width partition of `[0, n_intervals * interval_length)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalGrid {
    interval_length: f64,
    n_intervals: usize,
}

impl IntervalGrid {
    /// Smallest grid of width `interval_length` that covers `max_lifespan`.
    /// Always has at least one interval.
    pub fn covering(max_lifespan: f64, interval_length: f64) -> Result<Self, InputValidationError> {
        if !(interval_length.is_finite() && interval_length > 0.0) {
            return Err(InputValidationError::NonPositiveIntervalLength(interval_length));
        }
        let n_intervals = ((max_lifespan / interval_length).ceil() as usize).max(1);
        Ok(Self {
            interval_length,
            n_intervals,
        })
    }

    #[inline]
    pub fn interval_length(&self) -> f64 {
        self.interval_length
    }

    #[inline]
    pub fn n_intervals(&self) -> usize {
        self.n_intervals
    }

    /// Start of interval `j` (equivalently, the end of interval `j - 1`).
    #[inline]
    pub fn boundary(&self, j: usize) -> f64 {
        j as f64 * self.interval_length
    }

    /// All `n_intervals + 1` boundaries, starting at zero.
    pub fn boundaries(&self) -> Array1<f64> {
        (0..=self.n_intervals).map(|j| self.boundary(j)).collect()
    }

    /// Index of the interval holding the last observed instant of a lifespan,
    /// `floor((lifespan - epsilon) / w)`, kept inside the grid.
    #[inline]
    pub fn last_interval(&self, lifespan: f64, epsilon: f64) -> usize {
        let raw = ((lifespan - epsilon) / self.interval_length).floor();
        if raw <= 0.0 {
            0
        } else {
            (raw as usize).min(self.n_intervals - 1)
        }
    }
}

/// Output of [`discretize`].
#[derive(Debug, Clone)]
pub struct DiscretizedData {
    pub grid: IntervalGrid,
    /// characters x intervals, floored at the configured epsilon
    pub exposure: Array2<f64>,
    /// characters x intervals, 0.0 or 1.0
    pub death: Array2<f64>,
    pub last_interval: Vec<usize>,
    pub lifespans: Array1<f64>,
    /// Number of exposure cells that were raised to the floor.
    pub clamped_cells: usize,
}

impl DiscretizedData {
    pub fn n_characters(&self) -> usize {
        self.exposure.nrows()
    }

    /// Exposure of character `i` inside its last observed interval, before any
    /// flooring.
    pub fn raw_final_exposure(&self, i: usize) -> f64 {
        self.lifespans[i] - self.grid.boundary(self.last_interval[i])
    }
}

/// Exposure matrix before flooring. Row `i` sums to `lifespans[i]`.
pub fn raw_exposure(
    lifespans: ArrayView1<'_, f64>,
    grid: &IntervalGrid,
    epsilon: f64,
) -> Array2<f64> {
    let w = grid.interval_length();
    let mut exposure = Array2::<f64>::zeros((lifespans.len(), grid.n_intervals()));
    for (mut row, &lifespan) in exposure.rows_mut().into_iter().zip(lifespans.iter()) {
        let last = grid.last_interval(lifespan, epsilon);
        for j in 0..last {
            row[j] = w;
        }
        row[last] = lifespan - grid.boundary(last);
    }
    exposure
}

/// Builds the interval grid, exposure matrix and death matrix for a set of
/// `(lifespan, is_dead)` pairs.
pub fn discretize(
    lifespans: ArrayView1<'_, f64>,
    dead: &[bool],
    config: &DiscretizationConfig,
) -> Result<DiscretizedData, InputValidationError> {
    for (row, &lifespan) in lifespans.iter().enumerate() {
        if !lifespan.is_finite() {
            return Err(InputValidationError::NonFinite {
                row,
                field: "lifespan".to_string(),
                value: lifespan,
            });
        }
        if lifespan < 0.0 {
            return Err(InputValidationError::NegativeLifespan {
                row,
                value: lifespan,
            });
        }
    }
    if lifespans.is_empty() {
        return Err(InputValidationError::EmptyTable);
    }

    let max_lifespan = lifespans.iter().copied().fold(0.0_f64, f64::max);
    let grid = IntervalGrid::covering(max_lifespan, config.interval_length)?;
    let epsilon = config.boundary_epsilon;

    let last_interval: Vec<usize> = lifespans
        .iter()
        .map(|&lifespan| grid.last_interval(lifespan, epsilon))
        .collect();

    let mut death = Array2::<f64>::zeros((lifespans.len(), grid.n_intervals()));
    for (i, (&last, &is_dead)) in last_interval.iter().zip(dead.iter()).enumerate() {
        if is_dead {
            death[[i, last]] = 1.0;
        }
    }

    let mut exposure = raw_exposure(lifespans, &grid, epsilon);
    let mut clamped_cells = 0usize;
    exposure.mapv_inplace(|v| {
        if v <= 0.0 {
            clamped_cells += 1;
            config.exposure_floor
        } else {
            v
        }
    });

    log::info!(
        "Discretized {} characters onto {} intervals of width {}",
        lifespans.len(),
        grid.n_intervals(),
        grid.interval_length()
    );
    if clamped_cells > 0 {
        log::warn!(
            "Raised {} non-positive exposure cells to {:e} ({:.1}% of the matrix)",
            clamped_cells,
            config.exposure_floor,
            100.0 * clamped_cells as f64 / exposure.len() as f64
        );
    }

    Ok(DiscretizedData {
        grid,
        exposure,
        death,
        last_interval,
        lifespans: lifespans.to_owned(),
        clamped_cells,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn config(interval_length: f64) -> DiscretizationConfig {
        DiscretizationConfig {
            interval_length,
            ..DiscretizationConfig::default()
        }
    }

    #[test]
    fn two_character_scenario() {
        let lifespans = array![5.0, 3.0];
        let data = discretize(lifespans.view(), &[true, false], &config(1.0)).unwrap();

        assert_eq!(data.grid.n_intervals(), 5);
        assert_eq!(data.exposure.dim(), (2, 5));
        assert_eq!(data.last_interval, vec![4, 2]);

        let raw = raw_exposure(lifespans.view(), &data.grid, 0.01);
        assert_abs_diff_eq!(raw.row(0).sum(), 5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(raw.row(1).sum(), 3.0, epsilon = 1e-12);
        assert_eq!(raw.row(1).to_vec(), vec![1.0, 1.0, 1.0, 0.0, 0.0]);

        assert_eq!(data.death.row(0).to_vec(), vec![0.0, 0.0, 0.0, 0.0, 1.0]);
        assert_eq!(data.death.row(1).sum(), 0.0);

        // The two cells after the censored character's last interval are floored.
        assert_eq!(data.clamped_cells, 2);
        assert_eq!(data.exposure[[1, 3]], 1e-200);
        assert_eq!(data.exposure[[1, 4]], 1e-200);
    }

    #[test]
    fn fractional_lifespan_gets_remainder_in_last_interval() {
        let lifespans = array![2.5];
        let data = discretize(lifespans.view(), &[true], &config(1.0)).unwrap();
        assert_eq!(data.grid.n_intervals(), 3);
        assert_eq!(data.exposure.row(0).to_vec(), vec![1.0, 1.0, 0.5]);
        assert_eq!(data.death[[0, 2]], 1.0);
        assert_eq!(data.clamped_cells, 0);
        assert_abs_diff_eq!(data.raw_final_exposure(0), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn last_interval_matches_floor_and_stays_in_grid() {
        let mut rng = StdRng::seed_from_u64(0x5EED);
        for _ in 0..200 {
            let w: f64 = rng.gen_range(0.1..5.0);
            let lifespans: Array1<f64> = (0..20).map(|_| rng.gen_range(0.02..80.0)).collect();
            let max = lifespans.iter().copied().fold(0.0, f64::max);
            let grid = IntervalGrid::covering(max, w).unwrap();
            for &l in lifespans.iter() {
                let last = grid.last_interval(l, 0.01);
                let expected = ((l - 0.01) / w).floor() as usize;
                assert_eq!(last, expected.min(grid.n_intervals() - 1));
                assert!(last < grid.n_intervals());
            }
        }
    }

    #[test]
    fn raw_row_sums_equal_lifespans_for_any_width() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let w: f64 = rng.gen_range(0.05..10.0);
            let lifespans: Array1<f64> = (0..15).map(|_| rng.gen_range(0.0..60.0)).collect();
            let max = lifespans.iter().copied().fold(0.0, f64::max);
            let grid = IntervalGrid::covering(max, w).unwrap();
            let raw = raw_exposure(lifespans.view(), &grid, 0.01);
            for (row, &l) in raw.rows().into_iter().zip(lifespans.iter()) {
                assert_abs_diff_eq!(row.sum(), l, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn death_matrix_has_one_entry_per_observed_death() {
        let mut rng = StdRng::seed_from_u64(7);
        let lifespans: Array1<f64> = (0..50).map(|_| rng.gen_range(0.5..40.0)).collect();
        let dead: Vec<bool> = (0..50).map(|_| rng.r#gen::<bool>()).collect();
        let data = discretize(lifespans.view(), &dead, &config(2.0)).unwrap();
        for (row, &is_dead) in data.death.rows().into_iter().zip(dead.iter()) {
            let ones = row.iter().filter(|&&v| v == 1.0).count();
            let zeros = row.iter().filter(|&&v| v == 0.0).count();
            assert_eq!(ones, usize::from(is_dead));
            assert_eq!(ones + zeros, row.len());
        }
    }

    #[test]
    fn no_cell_is_left_at_or_below_zero() {
        let lifespans = array![0.0, 4.0, 10.0, 10.0];
        let data = discretize(lifespans.view(), &[false, true, true, false], &config(3.0)).unwrap();
        assert!(data.exposure.iter().all(|&v| v > 0.0));
        let floored = data.exposure.iter().filter(|&&v| v == 1e-200).count();
        assert_eq!(floored, data.clamped_cells);
    }

    #[test]
    fn boundary_lifespan_stays_in_closing_interval() {
        let grid = IntervalGrid::covering(6.0, 2.0).unwrap();
        assert_eq!(grid.n_intervals(), 3);
        assert_eq!(grid.last_interval(4.0, 0.01), 1);
        assert_eq!(grid.last_interval(4.02, 0.01), 2);
        assert_eq!(grid.last_interval(0.0, 0.01), 0);
        assert_eq!(grid.boundaries().to_vec(), vec![0.0, 2.0, 4.0, 6.0]);
    }

    #[test]
    fn rejects_negative_lifespan_and_bad_width() {
        assert!(matches!(
            discretize(array![1.0, -0.5].view(), &[false, false], &config(1.0)),
            Err(InputValidationError::NegativeLifespan { row: 1, .. })
        ));
        assert!(matches!(
            discretize(array![1.0].view(), &[false], &config(0.0)),
            Err(InputValidationError::NonPositiveIntervalLength(_))
        ));
        assert!(matches!(
            discretize(array![1.0].view(), &[false], &config(-2.0)),
            Err(InputValidationError::NonPositiveIntervalLength(_))
        ));
    }
}
