//! SMOOTHER: particle smoothing of latent factor trajectories from panel measurements.
//!
//! All model coefficients, data locations and run sizes come from a configuration file
//! (TOML/JSON/YAML). Use `smoother config --output run.toml` to write a template.

use clap::{Args, Parser, Subcommand};
use factor_smoother::config::RunConfig;
use factor_smoother::sim::{
    ErrorSummaryRecord, ensure_parent, load_truth, prepare_inputs, run_from_config,
    summarize_errors, write_population, write_shocks,
};
use factor_smoother::smoother::EstimateTable;
use log::{error, info};
use std::error::Error;
use std::path::PathBuf;

const LONG_ABOUT: &str = "SMOOTHER: particle smoothing of latent factor trajectories.

Follows many observation units over several periods. Each unit carries three latent factors
that evolve with a CES law of motion and are observed through noisy linear measurements. A
bootstrap particle filter runs forward over the periods and a backward pass picks the most
probable particle path of every unit.

Commands:
  run      smooth the configured data set and write the estimates
  draw     draw the prior population and transition shocks and write them as CSV
  summary  compare an estimate table with the true factors
  config   write a template configuration file";

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about = "Particle smoothing of latent factor trajectories.", long_about = LONG_ABOUT)]
struct Cli {
    /// Run configuration file (TOML/JSON/YAML); without a subcommand this runs the smoother
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Clone, Debug)]
enum Command {
    /// Smooth the configured data set and write the estimates
    Run,
    /// Draw the prior population and transition shocks of the configured run
    Draw(DrawArgs),
    /// Compare an estimate table with the true factors
    Summary(SummaryArgs),
    /// Write a template configuration file
    Config(ConfigArgs),
}

#[derive(Args, Clone, Debug)]
struct DrawArgs {
    /// Output CSV for the prior population
    #[arg(long, default_value = "prior.csv")]
    prior: PathBuf,
    /// Output CSV for the transition shocks
    #[arg(long, default_value = "shocks.csv")]
    shocks: PathBuf,
}

#[derive(Args, Clone, Debug)]
struct SummaryArgs {
    /// Estimate table written by `smoother run`
    #[arg(long)]
    estimates: PathBuf,
    /// True factor table
    #[arg(long)]
    truth: PathBuf,
    /// Output CSV for the error summary
    #[arg(short, long)]
    output: PathBuf,
}

#[derive(Args, Clone, Debug)]
struct ConfigArgs {
    /// Output file; the format follows the extension (.toml, .json, .yaml, .yml)
    #[arg(short, long, default_value = "smoother.toml")]
    output: PathBuf,
}

/// Initialize the logger with the specified configuration.
///
/// # Arguments
/// * `log_level` - Log level string (off, error, warn, info, debug, trace)
/// * `log_file` - Optional path to log file (logs to stderr if None)
fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<(), Box<dyn Error>> {
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
        ensure_parent(log_path)?;
        let target = Box::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.try_init()?;
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<RunConfig, Box<dyn Error>> {
    let path = path.ok_or("this command needs a configuration file (--config FILE)")?;
    info!("Loading configuration from {}", path.display());
    let config = RunConfig::from_file(path)?;
    config.validate()?;
    Ok(config)
}

fn run(config_path: Option<&PathBuf>) -> Result<(), Box<dyn Error>> {
    let config = load_config(config_path)?;
    run_from_config(&config)?;
    Ok(())
}

fn draw(config_path: Option<&PathBuf>, args: &DrawArgs) -> Result<(), Box<dyn Error>> {
    let config = load_config(config_path)?;
    let truth = load_truth(&config)?;
    let (prior, shocks) = prepare_inputs(&config, truth.as_ref())?;
    ensure_parent(&args.prior)?;
    write_population(&prior, &args.prior)?;
    info!("Prior written to {}", args.prior.display());
    ensure_parent(&args.shocks)?;
    write_shocks(&shocks, &args.shocks)?;
    info!("Transition shocks written to {}", args.shocks.display());
    Ok(())
}

fn summary(args: &SummaryArgs) -> Result<(), Box<dyn Error>> {
    let estimates = EstimateTable::from_csv(&args.estimates)?;
    let truth = EstimateTable::from_csv(&args.truth)?;
    let summary = summarize_errors(&estimates, &truth)?;
    ensure_parent(&args.output)?;
    ErrorSummaryRecord::to_csv(&summary, &args.output)?;
    info!("Error summary written to {}", args.output.display());
    Ok(())
}

fn create_config_file(args: &ConfigArgs) -> Result<(), Box<dyn Error>> {
    ensure_parent(&args.output)?;
    RunConfig::default().to_file(&args.output)?;
    info!("Template configuration written to {}", args.output.display());
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())?;

    let result = match &cli.command {
        Some(Command::Run) => run(cli.config.as_ref()),
        Some(Command::Draw(args)) => draw(cli.config.as_ref(), args),
        Some(Command::Summary(args)) => summary(args),
        Some(Command::Config(args)) => create_config_file(args),
        None if cli.config.is_some() => run(cli.config.as_ref()),
        None => {
            eprintln!("Error: No command provided. Use -h or --help for usage information.");
            std::process::exit(1);
        }
    };
    if let Err(e) = &result {
        error!("{}", e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }
    #[test]
    fn global_config_after_subcommand() {
        let cli = Cli::try_parse_from(["smoother", "run", "--config", "run.toml"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Run)));
        assert_eq!(cli.config, Some(PathBuf::from("run.toml")));
        assert_eq!(cli.log_level, "info");
    }
    #[test]
    fn summary_requires_paths() {
        assert!(Cli::try_parse_from(["smoother", "summary", "--estimates", "e.csv"]).is_err());
        let cli = Cli::try_parse_from([
            "smoother",
            "summary",
            "--estimates",
            "e.csv",
            "--truth",
            "t.csv",
            "-o",
            "s.csv",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Summary(args)) => assert_eq!(args.truth, PathBuf::from("t.csv")),
            other => panic!("unexpected command {other:?}"),
        }
    }
    #[test]
    fn draw_defaults() {
        let cli = Cli::try_parse_from(["smoother", "-c", "run.yaml", "draw"]).unwrap();
        match cli.command {
            Some(Command::Draw(args)) => {
                assert_eq!(args.prior, PathBuf::from("prior.csv"));
                assert_eq!(args.shocks, PathBuf::from("shocks.csv"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
    #[test]
    fn commands_needing_config_fail_without_it() {
        assert!(load_config(None).is_err());
    }
}
