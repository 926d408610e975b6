//! Medallion ETL CLI
//!
//! Entrypoint for running the pipeline or its individual layers against a
//! SQLite store and a partitioned raw directory.
//!
//! # Usage
//!
//! ```bash
//! medallion --db pipeline.db --raw-dir ./raw pipeline
//! medallion --db pipeline.db --raw-dir ./raw raw --full-refresh
//! medallion --db pipeline.db prod --start 2025-03-01 --end 2025-03-31
//! medallion --db pipeline.db validate
//! ```
//!
//! # Exit Codes
//!
//! - 0: Success (for `validate`: every check passed)
//! - 1: `validate` found failing checks
//! - 2: Configuration or argument error
//! - 3: Runtime error (store, I/O, ...)

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

use medallion_etl::config::PipelineConfig;
use medallion_etl::context::{DateRange, Layer, RunContext, RunMode};
use medallion_etl::db::open_store;
use medallion_etl::model::EntityKind;
use medallion_etl::{aggregator, cleaner, orchestrator, quality, raw_store};

#[derive(Parser, Debug)]
#[command(name = "medallion", about = "Batch medallion ETL over SQLite", version)]
struct Cli {
    /// TOML config file; the flags below override its values.
    #[arg(long, env = "MEDALLION_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite store path.
    #[arg(long, env = "MEDALLION_DB")]
    db: Option<PathBuf>,

    /// Root of the partitioned raw inputs.
    #[arg(long, env = "MEDALLION_RAW_DIR")]
    raw_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest raw partitions into the raw tables.
    Raw {
        /// Truncate the raw tables and re-ingest every partition.
        #[arg(long)]
        full_refresh: bool,
    },
    /// Clean raw rows into canonical staging rows.
    Staging {
        /// Clean only this entity type (customers, products, orders,
        /// order_items) instead of all four in dependency order.
        #[arg(long)]
        entity: Option<String>,
    },
    /// Recompute the prod aggregates from staging.
    Prod {
        /// First order date to recompute (inclusive).
        #[arg(long, requires = "end")]
        start: Option<NaiveDate>,
        /// Last order date to recompute (inclusive).
        #[arg(long, requires = "start")]
        end: Option<NaiveDate>,
    },
    /// Run raw -> staging -> prod with fail-fast semantics.
    Pipeline {
        #[arg(long)]
        full_refresh: bool,
        /// Skip the layers before this one (raw, staging, prod).
        #[arg(long, default_value = "raw")]
        resume_from: String,
        #[arg(long, requires = "end")]
        start: Option<NaiveDate>,
        #[arg(long, requires = "start")]
        end: Option<NaiveDate>,
    },
    /// Read-only quality report over all three layers.
    Validate,
}

fn main() -> ExitCode {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            error!("configuration error: {err:#}");
            return ExitCode::from(2);
        }
    };

    match execute(cli.command, &config) {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(3)
        }
    }
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(db) = &cli.db {
        config.db_path = db.clone();
    }
    if let Some(raw_dir) = &cli.raw_dir {
        config.raw_dir = raw_dir.clone();
    }
    Ok(config)
}

fn execute(command: Command, config: &PipelineConfig) -> Result<ExitCode> {
    match command {
        Command::Raw { full_refresh } => {
            let mut conn = open_store(&config.db_path)?;
            let summary = raw_store::ingest(&mut conn, &config.raw_dir, mode(full_refresh))?;
            emit(&summary)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Staging { entity } => {
            let mut conn = open_store(&config.db_path)?;
            let mut ctx = RunContext::new(RunMode::Incremental, None, Layer::Staging);
            match entity {
                Some(name) => {
                    let Some(kind) = EntityKind::from_name(&name) else {
                        error!("unknown entity {name:?}, expected customers, products, orders or order_items");
                        return Ok(ExitCode::from(2));
                    };
                    let summary = cleaner::clean_one(&mut conn, &mut ctx, kind)?;
                    emit(&summary)?;
                }
                None => {
                    let summary = cleaner::clean_all(&mut conn, &mut ctx)?;
                    emit(&summary)?;
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Prod { start, end } => {
            let mut conn = open_store(&config.db_path)?;
            let ctx = RunContext::new(RunMode::Incremental, range(start, end), Layer::Prod);
            let summary = aggregator::aggregate(&mut conn, &ctx)?;
            emit(&summary)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Pipeline {
            full_refresh,
            resume_from,
            start,
            end,
        } => {
            let Some(resume_from) = Layer::from_name(&resume_from) else {
                error!("unknown layer {resume_from:?}, expected raw, staging or prod");
                return Ok(ExitCode::from(2));
            };
            let mut ctx = RunContext::new(mode(full_refresh), range(start, end), resume_from);
            let report = orchestrator::run(config, &mut ctx)?;
            emit(&report)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Validate => {
            let conn = open_store(&config.db_path)?;
            let report = quality::validate(&conn, &config.quality)?;
            emit(&report)?;
            if report.passed() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(1))
            }
        }
    }
}

fn mode(full_refresh: bool) -> RunMode {
    if full_refresh {
        RunMode::FullRefresh
    } else {
        RunMode::Incremental
    }
}

fn range(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Option<DateRange> {
    match (start, end) {
        (Some(start), Some(end)) => Some(DateRange::new(start, end)),
        _ => None,
    }
}

fn emit<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
