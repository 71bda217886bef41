use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

// --- Public Data Structures ---
// These structs mirror the sections of the TOML configuration file. Every field
// has a default so a file only needs to list what it changes.

/// How the baseline hazard varies across the interval grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BaselineKind {
    /// One baseline hazard per interval.
    Piecewise,
    /// A single baseline hazard shared by every interval.
    Constant,
}

/// Which survival curve representation ends up in each character record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurveOutput {
    /// The posterior-mean curve.
    Mean,
    /// One curve per posterior sample.
    Full,
}

/// Describes which columns of the character table play which role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputSchema {
    pub name_column: String,
    pub lifespan_column: String,
    pub death_column: String,
    /// Columns that are neither covariates nor one of the named roles.
    pub exclude_columns: Vec<String>,
    /// Added to every lifespan on load.
    pub lifespan_offset: f64,
    /// Declared width of an attached external feature matrix, if checked.
    pub feature_dimensions: Option<usize>,
}

impl Default for InputSchema {
    fn default() -> Self {
        Self {
            name_column: "name".to_string(),
            lifespan_column: "age".to_string(),
            death_column: "isDead".to_string(),
            exclude_columns: Vec::new(),
            lifespan_offset: 0.0,
            feature_dimensions: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscretizationConfig {
    pub interval_length: f64,
    /// Offset subtracted before locating the last interval, so a lifespan that
    /// sits on a boundary stays in the interval that ends there.
    pub boundary_epsilon: f64,
    /// Replacement for exposure cells at or below zero.
    pub exposure_floor: f64,
}

impl Default for DiscretizationConfig {
    fn default() -> Self {
        Self {
            interval_length: 1.0,
            boundary_epsilon: 0.01,
            exposure_floor: 1e-200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub baseline: BaselineKind,
    pub baseline_prior_mean: f64,
    pub baseline_prior_sd: f64,
    pub coefficient_prior_sd: f64,
    /// Projection length for the constant baseline. Ignored for the piecewise
    /// baseline, whose horizon is the grid itself.
    pub horizon_intervals: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            baseline: BaselineKind::Piecewise,
            baseline_prior_mean: 0.01,
            baseline_prior_sd: 0.01,
            coefficient_prior_sd: 1000.0,
            horizon_intervals: 20,
        }
    }
}

/// Configuration for NUTS sampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Number of samples to keep per chain (after tuning)
    pub sample_count: usize,
    /// Number of tuning iterations to discard per chain
    pub tune_count: usize,
    /// Number of independent chains
    pub chain_count: usize,
    /// Target acceptance statistic for step-size adaptation
    pub target_acceptance: f64,
    /// Absent seed means a fresh seed per run
    pub random_seed: Option<u64>,
    /// Divergent transitions tolerated before the fit is flagged, as a fraction
    /// of all iterations, tuning included.
    pub max_divergence_rate: f64,
    /// Highest mean R-hat accepted without a warning
    pub max_rhat: f64,
    /// Minimum mean effective sample size before the fit is flagged.
    pub min_ess: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            sample_count: 1000,
            tune_count: 1000,
            chain_count: 2,
            target_acceptance: 0.8,
            random_seed: None,
            max_divergence_rate: 0.01,
            max_rhat: 1.1,
            min_ess: 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    pub survival_threshold: f64,
    pub confidence_lower: f64,
    pub confidence_upper: f64,
    pub curve: CurveOutput,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            survival_threshold: 0.5,
            confidence_lower: 0.2,
            confidence_upper: 0.8,
            curve: CurveOutput::Mean,
        }
    }
}

/// The complete set of knobs for one pipeline invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub input: InputSchema,
    pub discretization: DiscretizationConfig,
    pub model: ModelConfig,
    pub sampler: SamplerConfig,
    pub summary: SummaryConfig,
}

/// Named dataset variants. Each is the same pipeline bound to a different
/// schema and prior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    Reference,
    Book,
    Show,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl PipelineConfig {
    pub fn preset(preset: Preset) -> Self {
        let mut config = Self::default();
        match preset {
            Preset::Reference => {}
            Preset::Book => {
                config.model.baseline_prior_mean = 0.02;
                config.model.baseline_prior_sd = 0.02;
                config.sampler.target_acceptance = 0.9;
            }
            Preset::Show => {
                config.input.lifespan_column = "livedTo".to_string();
                config.input.lifespan_offset = 1.0;
                config.model.baseline = BaselineKind::Constant;
                config.model.baseline_prior_mean = 0.15;
                config.model.baseline_prior_sd = 0.1;
                config.model.horizon_intervals = 20;
                config.sampler.target_acceptance = 0.85;
            }
        }
        config
    }

    /// Loads a configuration from a TOML file. Sections and fields that are
    /// absent keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.discretization;
        require(
            d.interval_length.is_finite() && d.interval_length > 0.0,
            "interval_length",
            || format!("must be a positive finite number, got {}", d.interval_length),
        )?;
        require(
            d.boundary_epsilon.is_finite() && d.boundary_epsilon >= 0.0,
            "boundary_epsilon",
            || format!("must be non-negative, got {}", d.boundary_epsilon),
        )?;
        require(
            d.boundary_epsilon < d.interval_length,
            "boundary_epsilon",
            || {
                format!(
                    "must be below interval_length ({} >= {})",
                    d.boundary_epsilon, d.interval_length
                )
            },
        )?;
        require(d.exposure_floor > 0.0, "exposure_floor", || {
            format!("must be positive, got {}", d.exposure_floor)
        })?;

        let m = &self.model;
        require(
            m.baseline_prior_mean.is_finite() && m.baseline_prior_mean > 0.0,
            "baseline_prior_mean",
            || format!("must be positive, got {}", m.baseline_prior_mean),
        )?;
        require(
            m.baseline_prior_sd.is_finite() && m.baseline_prior_sd > 0.0,
            "baseline_prior_sd",
            || format!("must be positive, got {}", m.baseline_prior_sd),
        )?;
        require(
            m.coefficient_prior_sd.is_finite() && m.coefficient_prior_sd > 0.0,
            "coefficient_prior_sd",
            || format!("must be positive, got {}", m.coefficient_prior_sd),
        )?;
        require(
            m.baseline != BaselineKind::Constant || m.horizon_intervals > 0,
            "horizon_intervals",
            || "must be positive for a constant baseline".to_string(),
        )?;

        let s = &self.sampler;
        require(s.sample_count > 0, "sample_count", || {
            "must be at least 1".to_string()
        })?;
        require(s.chain_count > 0, "chain_count", || {
            "must be at least 1".to_string()
        })?;
        require(
            s.target_acceptance > 0.0 && s.target_acceptance < 1.0,
            "target_acceptance",
            || format!("must lie strictly between 0 and 1, got {}", s.target_acceptance),
        )?;

        let t = &self.summary;
        for (field, value) in [
            ("survival_threshold", t.survival_threshold),
            ("confidence_lower", t.confidence_lower),
            ("confidence_upper", t.confidence_upper),
        ] {
            require(value > 0.0 && value < 1.0, field, || {
                format!("must lie strictly between 0 and 1, got {value}")
            })?;
        }
        require(
            t.confidence_lower < t.confidence_upper,
            "confidence_lower",
            || {
                format!(
                    "must be below confidence_upper ({} >= {})",
                    t.confidence_lower, t.confidence_upper
                )
            },
        )?;
        Ok(())
    }
}

fn require(
    condition: bool,
    field: &'static str,
    reason: impl FnOnce() -> String,
) -> Result<(), ConfigError> {
    if condition {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field,
            reason: reason(),
        })
    }
}
