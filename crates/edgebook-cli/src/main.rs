use std::path::PathBuf;

use anyhow::{anyhow, bail, Result};
use chrono::{Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use clap::{Args, Parser, Subcommand};
use edgebook_analytics::{export_reports, AggregationEngine, EngineOptions, ReportFilter, ReportName, ReportTable, SkippedRow};
use edgebook_core::{AnalysisClassifier, AnalysisType, ConfidenceTier, DEFAULT_GRACE_MINUTES, DEFAULT_TIMEZONE};
use edgebook_ingest::{
    apply_settlements, ingest_into_store, load_bundle, load_settlements, pending_due, place_bet, BetRegistration,
};
use edgebook_reconcile::{OverrideList, Reconciler};
use edgebook_storage::{JsonFileStore, OpportunityStore, UpdateOutcome};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct LoggingConfig {
    level: String,
    format: String,
}

impl LoggingConfig {
    fn init(&self) -> Result<()> {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));
        let result = match self.format.as_str() {
            "json" => fmt().json().with_env_filter(filter).with_writer(std::io::stderr).try_init(),
            _ => fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init(),
        };
        result.map_err(|err| anyhow!("initializing tracing subscriber: {err}"))
    }
}

#[derive(Debug, Clone)]
struct EngineConfig {
    data_dir: PathBuf,
    reports_dir: PathBuf,
    timezone: Tz,
    grace_minutes: i64,
    overrides_path: PathBuf,
    logging: LoggingConfig,
}

impl EngineConfig {
    fn from_env() -> Result<Self> {
        let timezone = match std::env::var("EDGEBOOK_TIMEZONE") {
            Ok(raw) => raw
                .parse::<Tz>()
                .map_err(|err| anyhow!("invalid EDGEBOOK_TIMEZONE {raw:?}: {err}"))?,
            Err(_) => DEFAULT_TIMEZONE,
        };
        Ok(Self {
            data_dir: std::env::var("EDGEBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            reports_dir: std::env::var("EDGEBOOK_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            timezone,
            grace_minutes: std::env::var("EDGEBOOK_GRACE_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_GRACE_MINUTES),
            overrides_path: std::env::var("EDGEBOOK_OVERRIDES")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./overrides.yaml")),
            logging: LoggingConfig {
                level: std::env::var("EDGEBOOK_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
                format: std::env::var("EDGEBOOK_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string()),
            },
        })
    }

    fn classifier(&self) -> AnalysisClassifier {
        AnalysisClassifier::new(self.timezone, Duration::minutes(self.grace_minutes))
    }

    fn store(&self) -> JsonFileStore {
        JsonFileStore::new(&self.data_dir)
    }
}

#[derive(Debug, Parser)]
#[command(name = "edgebook")]
#[command(about = "Opportunity scoring and performance analytics")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Store a pipeline bundle, scoring and classifying its opportunities.
    Ingest { bundle: PathBuf },
    /// Apply match outcomes from a JSON settlement file.
    Settle { file: PathBuf },
    /// Record a placed bet on an opportunity.
    Bet {
        id: Uuid,
        #[arg(long)]
        amount: f64,
        #[arg(long = "return")]
        bet_return: Option<f64>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// List pending opportunities whose match date has arrived.
    Pending {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Print one named performance table as JSON.
    Report {
        #[arg(long, default_value = "summary")]
        name: ReportName,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Write every report table plus Parquet snapshots to the reports directory.
    Export {
        #[arg(long)]
        id: Option<String>,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Backfill analysis types, missing scores and manual overrides.
    Reconcile {
        #[arg(long)]
        overrides: Option<PathBuf>,
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Debug, Args)]
struct FilterArgs {
    #[arg(long)]
    market: Option<String>,
    #[arg(long)]
    from: Option<NaiveDate>,
    #[arg(long)]
    to: Option<NaiveDate>,
    #[arg(long)]
    analysis_type: Option<AnalysisType>,
    #[arg(long)]
    confidence: Option<ConfidenceTier>,
    /// Keep opportunities whose match record is missing.
    #[arg(long)]
    allow_missing_matches: bool,
}

impl FilterArgs {
    fn filter(&self) -> ReportFilter {
        ReportFilter {
            market: self.market.clone(),
            from: self.from,
            to: self.to,
            analysis_type: self.analysis_type,
            confidence: self.confidence,
        }
    }

    fn options(&self) -> EngineOptions {
        EngineOptions {
            require_match_reference: !self.allow_missing_matches,
        }
    }
}

#[derive(Serialize)]
struct ReportOutput<'a> {
    report: ReportTable,
    warnings: &'a [SkippedRow],
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let config = EngineConfig::from_env()?;
    config.logging.init()?;
    info!(data_dir = %config.data_dir.display(), timezone = %config.timezone, "edgebook starting");

    let store = config.store();
    match cli.command {
        Commands::Ingest { bundle } => {
            let bundle = load_bundle(&bundle)?;
            let summary = ingest_into_store(&store, bundle, &config.classifier()).await?;
            print_json(&summary)?;
        }
        Commands::Settle { file } => {
            let updates = load_settlements(&file)?;
            let summary = apply_settlements(&store, &updates, Utc::now()).await?;
            print_json(&summary)?;
        }
        Commands::Bet {
            id,
            amount,
            bet_return,
            notes,
        } => {
            let registration = BetRegistration {
                amount,
                bet_return,
                notes,
            };
            match place_bet(&store, id, &registration).await? {
                UpdateOutcome::Written { record, .. } => print_json(&record)?,
                UpdateOutcome::Unchanged => bail!("bet on {id} was not recorded"),
                UpdateOutcome::Conflicted => bail!("opportunity {id} kept changing, try again"),
            }
        }
        Commands::Pending { date } => {
            let today = date.unwrap_or_else(|| config.classifier().local_date(Utc::now()));
            let dataset = store.load().await?;
            print_json(&pending_due(&dataset, today))?;
        }
        Commands::Report { name, filter } => {
            let dataset = store.load().await?;
            let engine = AggregationEngine::with_options(&dataset, &filter.filter(), filter.options());
            print_json(&ReportOutput {
                report: engine.report(name),
                warnings: engine.warnings(),
            })?;
        }
        Commands::Export { id, filter } => {
            let dataset = store.load().await?;
            let report_filter = filter.filter();
            let engine = AggregationEngine::with_options(&dataset, &report_filter, filter.options());
            let now = Utc::now();
            let export_id = id.unwrap_or_else(|| now.format("%Y%m%dT%H%M%SZ").to_string());
            let set = engine.report_set(&report_filter, now);
            let summary = export_reports(&set, &config.reports_dir, &export_id).await?;
            print_json(&summary)?;
        }
        Commands::Reconcile { overrides, dry_run } => {
            let overrides = OverrideList::from_path(overrides.unwrap_or_else(|| config.overrides_path.clone()))?;
            let reconciler = Reconciler::new(config.classifier(), overrides);
            let report = if dry_run {
                reconciler.preview(&store.load().await?)
            } else {
                reconciler.run(&store).await?
            };
            print_json(&report)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn every_subcommand_has_help() {
        let command = Cli::command();
        command.clone().debug_assert();
        for sub in command.get_subcommands() {
            assert!(sub.get_about().is_some(), "{} has no help line", sub.get_name());
        }
    }
}
