#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process;

use morghulis::compact::{DEFAULT_DIGITS, compact_file};
use morghulis::config::{CurveOutput, PipelineConfig, Preset};
use morghulis::hmc::PosteriorTrace;
use morghulis::pipeline;

#[derive(Clone, Copy, ValueEnum)]
pub enum PresetCli {
    Reference,
    Book,
    Show,
}

impl From<PresetCli> for Preset {
    fn from(preset: PresetCli) -> Self {
        match preset {
            PresetCli::Reference => Preset::Reference,
            PresetCli::Book => Preset::Book,
            PresetCli::Show => Preset::Show,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum CurveCli {
    Mean,
    Full,
}

impl From<CurveCli> for CurveOutput {
    fn from(curve: CurveCli) -> Self {
        match curve {
            CurveCli::Mean => CurveOutput::Mean,
            CurveCli::Full => CurveOutput::Full,
        }
    }
}

/// Where the configuration comes from, plus per-knob overrides.
#[derive(Args)]
pub struct ConfigArgs {
    /// TOML configuration file; takes precedence over --preset
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Dataset variant to start from
    #[arg(long, value_enum, default_value_t = PresetCli::Reference)]
    pub preset: PresetCli,

    /// Width of one discretization interval, in years
    #[arg(long)]
    pub interval_length: Option<f64>,

    /// Posterior samples kept per chain
    #[arg(long)]
    pub samples: Option<usize>,

    /// Tuning iterations discarded per chain
    #[arg(long)]
    pub tune: Option<usize>,

    /// Number of independent chains
    #[arg(long)]
    pub chains: Option<usize>,

    /// Target acceptance statistic for step-size adaptation
    #[arg(long)]
    pub target_accept: Option<f64>,

    /// Random seed; a fresh one is drawn and reported when absent
    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long)]
    pub survival_threshold: Option<f64>,

    #[arg(long)]
    pub confidence_lower: Option<f64>,

    #[arg(long)]
    pub confidence_upper: Option<f64>,

    /// Emit the posterior-mean curve or every per-sample curve
    #[arg(long, value_enum)]
    pub curve: Option<CurveCli>,
}

impl ConfigArgs {
    fn resolve(&self) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::preset(self.preset.into()),
        };
        if let Some(v) = self.interval_length {
            config.discretization.interval_length = v;
        }
        if let Some(v) = self.samples {
            config.sampler.sample_count = v;
        }
        if let Some(v) = self.tune {
            config.sampler.tune_count = v;
        }
        if let Some(v) = self.chains {
            config.sampler.chain_count = v;
        }
        if let Some(v) = self.target_accept {
            config.sampler.target_acceptance = v;
        }
        if self.seed.is_some() {
            config.sampler.random_seed = self.seed;
        }
        if let Some(v) = self.survival_threshold {
            config.summary.survival_threshold = v;
        }
        if let Some(v) = self.confidence_lower {
            config.summary.confidence_lower = v;
        }
        if let Some(v) = self.confidence_upper {
            config.summary.confidence_upper = v;
        }
        if let Some(v) = self.curve {
            config.summary.curve = v.into();
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args)]
pub struct PredictArgs {
    /// Character table: a JSON array of records, or a CSV/TSV file with a header row
    pub input: PathBuf,

    /// Where to write the prediction document (JSON)
    #[arg(long, short, default_value = "predictions.json")]
    pub output: PathBuf,

    /// Delimited numeric feature matrix appended to the covariates, one row per character
    #[arg(long)]
    pub features: Option<PathBuf>,

    /// Also write the posterior trace (JSON)
    #[arg(long)]
    pub trace_output: Option<PathBuf>,

    #[command(flatten)]
    pub config: ConfigArgs,
}

#[derive(Parser)]
#[command(
    name = "morghulis",
    about = "Bayesian survival predictions for character tables",
    long_about = "Fits a piecewise-exponential proportional-hazards model by NUTS sampling \
                 and reports per-character survival curves and survival ages."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit the hazard model and predict survival for every character
    #[command(about = "Fit and predict (outputs: predictions.json)")]
    Predict(PredictArgs),
    /// Reduce a prediction document to alive characters with rounded numbers
    #[command(about = "Compact a prediction document for publication")]
    Compact {
        /// Prediction document written by `predict`
        input: PathBuf,
        /// Where to write the compact document
        output: PathBuf,
        /// Significant digits kept for every number
        #[arg(long, default_value_t = DEFAULT_DIGITS)]
        digits: usize,
    },
    /// Print the effective configuration as TOML
    #[command(about = "Print the resolved configuration")]
    Config(ConfigArgs),
}

fn predict(args: PredictArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.config.resolve()?;
    let output = pipeline::run(&config, &args.input, args.features.as_deref())?;

    let quality = &output.document.fit_quality;
    if quality.flagged {
        log::warn!(
            "Fit flagged with {} warning(s); see fitQuality in {}",
            quality.warnings.len(),
            args.output.display()
        );
    }
    output.document.write_json(&args.output)?;
    if let Some(path) = &args.trace_output {
        write_trace(&output.trace, path)?;
    }
    Ok(())
}

fn write_trace(trace: &PosteriorTrace, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(writer, trace)?;
    log::info!("Wrote {} posterior samples to {}", trace.len(), path.display());
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();
    let result = match command {
        Some(Commands::Predict(args)) => predict(args),
        Some(Commands::Compact {
            input,
            output,
            digits,
        }) => compact_file(&input, &output, digits)
            .map(|_| ())
            .map_err(Into::into),
        Some(Commands::Config(args)) => args
            .resolve()
            .and_then(|config| Ok(config.to_toml()?))
            .map(|text| print!("{text}")),
        None => {
            Cli::command().print_help().expect("print help");
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
