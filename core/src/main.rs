//! POSE ESTIMATOR: replay and simulation front end for the position / velocity / yaw-bias EKF.
//!
//! - `replay`: push a recorded CSV event log through the filter and write the estimates.
//! - `simulate`: generate a seeded synthetic event log (and its ground truth), optionally
//!   replaying it straight away.
//! - `template`: write the default filter configuration to a file to start from.
//!
//! The filter itself is configured from a TOML/JSON/YAML file given with `--config`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};

use pose_estimator::config::FilterConfig;
use pose_estimator::filter::MeasurementStream;
use pose_estimator::replay::{
    EventRecord, ScenarioConfig, read_events, run_replay, synthesize, write_estimates,
    write_events, write_truth,
};

/// Command line arguments
#[derive(Parser)]
#[command(
    author,
    version,
    about = "Extended Kalman filter over position, velocity and yaw bias."
)]
struct Cli {
    /// Filter configuration file (TOML/JSON/YAML). Defaults are used when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (off, error, warn, info, debug, trace). Overrides the configuration file.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone)]
enum Command {
    /// Replay a CSV event log through the filter
    Replay(ReplayArgs),
    /// Generate a synthetic event log
    Simulate(SimulateArgs),
    /// Write the default filter configuration
    Template {
        /// Output path; the extension selects the format
        output: PathBuf,
    },
}

#[derive(Args, Clone, Debug)]
struct ReplayArgs {
    /// Event log with columns time,kind,x,y,z,sx,sy,sz
    #[arg(short, long)]
    input: PathBuf,
    /// Where to write the per-row estimates
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Args, Clone, Debug)]
struct SimulateArgs {
    /// Where to write the synthetic event log
    #[arg(short, long)]
    output: PathBuf,
    /// Also write the ground truth to this CSV
    #[arg(long)]
    truth: Option<PathBuf>,
    /// Replay the generated log and write the estimates here
    #[arg(long)]
    estimates: Option<PathBuf>,
    #[arg(long, default_value_t = 60.0)]
    duration: f64,
    #[arg(long, default_value_t = 100.0)]
    imu_rate: f64,
    #[arg(long, default_value_t = 1.0)]
    fix_rate: f64,
    /// True yaw bias in degrees
    #[arg(long, default_value_t = 5.0)]
    yaw_bias_deg: f64,
    #[arg(long, default_value_t = 0.05)]
    imu_noise: f64,
    #[arg(long, default_value_t = 0.5)]
    position_noise: f64,
    #[arg(long, default_value_t = 0.1)]
    velocity_noise: f64,
    /// Probability of replacing a position fix with an outlier
    #[arg(long, default_value_t = 0.0)]
    outlier_probability: f64,
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

impl SimulateArgs {
    fn scenario(&self) -> ScenarioConfig {
        ScenarioConfig {
            duration: self.duration,
            imu_rate_hz: self.imu_rate,
            fix_rate_hz: self.fix_rate,
            yaw_bias: self.yaw_bias_deg.to_radians(),
            imu_noise_std: self.imu_noise,
            position_noise_std: self.position_noise,
            velocity_noise_std: self.velocity_noise,
            outlier_probability: self.outlier_probability,
            seed: self.seed,
            ..ScenarioConfig::default()
        }
    }
}

/// Initialize env_logger with a timestamped format, optionally appending to a file.
fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<()> {
    use std::io::Write;

    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log_level);
        log::LevelFilter::Info
    });

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    });

    if let Some(log_path) = log_file {
        if let Some(parent) = log_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let target = Box::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .with_context(|| format!("opening log file {}", log_path.display()))?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.try_init()?;
    Ok(())
}

fn replay(config: &FilterConfig, events: &[EventRecord], output: &Path) -> Result<()> {
    let mut filter = config.build().context("building filter from configuration")?;
    let estimates = run_replay(&mut filter, events);
    write_estimates(&estimates, output)
        .with_context(|| format!("writing estimates to {}", output.display()))?;

    let state = filter.state();
    info!("Final estimate: {}", state);
    info!(
        "Yaw bias: {:.3} deg (1σ {:.3} deg)",
        state.yaw_bias().to_degrees(),
        state.yaw_bias_variance().max(0.0).sqrt().to_degrees()
    );
    let rejected: u64 = MeasurementStream::ALL
        .iter()
        .map(|s| filter.statistics(*s).rejected)
        .sum();
    if rejected > 0 {
        warn!("{} observations rejected by the chi-square gate", rejected);
    }
    info!("Wrote {} estimates to {}", estimates.len(), output.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => FilterConfig::from_file(path)
            .with_context(|| format!("reading configuration {}", path.display()))?,
        None => FilterConfig::default(),
    };
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let log_file = cli.log_file.as_ref().or(config.logging.file.as_ref());
    init_logger(&level, log_file)?;

    match &cli.command {
        Command::Replay(args) => {
            if !args.input.is_file() {
                bail!("input event log {} does not exist", args.input.display());
            }
            let events = read_events(&args.input)
                .with_context(|| format!("reading events from {}", args.input.display()))?;
            info!("Loaded {} events from {}", events.len(), args.input.display());
            replay(&config, &events, &args.output)?;
        }
        Command::Simulate(args) => {
            let scenario = synthesize(&args.scenario())?;
            write_events(&scenario.events, &args.output)
                .with_context(|| format!("writing events to {}", args.output.display()))?;
            info!(
                "Wrote {} events ({} outliers) to {}",
                scenario.events.len(),
                scenario.outliers,
                args.output.display()
            );
            if let Some(truth_path) = &args.truth {
                write_truth(&scenario.truth, truth_path)
                    .with_context(|| format!("writing truth to {}", truth_path.display()))?;
            }
            if let Some(estimates) = &args.estimates {
                replay(&config, &scenario.events, estimates)?;
            }
        }
        Command::Template { output } => {
            FilterConfig::default()
                .to_file(output)
                .with_context(|| format!("writing configuration to {}", output.display()))?;
            info!("Wrote default configuration to {}", output.display());
        }
    }
    Ok(())
}
