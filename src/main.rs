//! RBMK Spent Fuel Dose-Rate Calculation - Main Entry Point
//!
//! Command-line front end: load static data, run the envelope or a single
//! cell, or append a snapshot to the core history log.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};

use rbmk_dose_rate_lib::calculation::append_snapshot;
use rbmk_dose_rate_lib::{DoseCalculation, DoseError, RunConfig, StaticData};

#[derive(Parser)]
#[command(author, version, about = "RBMK fuel assembly burnup and handling dose rates", long_about = None)]
struct Cli {
    /// Run configuration (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Decay horizon in hours, overrides the configuration
    #[arg(long, global = true)]
    decay_hours: Option<f64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load algorithms and Green's functions and report what was found
    Init,
    /// Envelope dose rates on the surface of the hottest assembly
    Envelope,
    /// Dose rates around one cell
    Cell {
        /// Cell identifier, e.g. 27-45
        cell: String,
    },
    /// Append a core snapshot to the history log
    Append {
        /// Core power [W]
        #[arg(long)]
        power: f64,
        /// Active algorithm name
        #[arg(long)]
        algorithm: String,
        /// Number of fuel assemblies the algorithm was calculated for
        #[arg(long)]
        assemblies: u32,
        /// "DD.MM.YYYY HH:MM:SS" or hours for test plans; now by default
        #[arg(long)]
        time: Option<String>,
    },
}

fn run(cli: Cli) -> Result<()> {
    let mut config = RunConfig::load(cli.config.as_deref()).context("reading run configuration")?;
    if let Some(hours) = cli.decay_hours {
        config.decay_hours = hours;
    }

    if let Command::Append {
        power,
        algorithm,
        assemblies,
        time,
    } = &cli.command
    {
        let rec = append_snapshot(&config, time.as_deref(), *power, algorithm, *assemblies)
            .context("appending history record")?;
        info!("{:?}", rec);
        return Ok(());
    }

    let data = StaticData::load(&config).context("loading static data")?;
    info!(
        "{} algorithms, {} segments per FA, {} Green's functions",
        data.model.len(),
        data.model.segment_count(),
        data.greens.len()
    );
    let calculation = DoseCalculation::new(&config, &data)?;

    match &cli.command {
        Command::Init | Command::Append { .. } => {}
        Command::Envelope => {
            let report = calculation.envelope()?;
            info!("FA surface:");
            for (zone, rates) in &report.dose_rates {
                info!("Zone {}: {:?} uSv/h", zone, rates);
            }
        }
        Command::Cell { cell } => {
            let rates = calculation.cell(cell)?;
            info!("Cell {}: dose rates for {} zones written", cell, rates.len());
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let start = Instant::now();
    let cli = Cli::parse();
    let result = run(cli);
    info!("Work time was {:.3} seconds", start.elapsed().as_secs_f64());

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if let Some(DoseError::HistoryInvalid(why)) = err.downcast_ref::<DoseError>() {
                error!("CoreHistory exception: {}", why);
            } else {
                error!("{:#}", err);
            }
            ExitCode::FAILURE
        }
    }
}
