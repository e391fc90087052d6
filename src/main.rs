use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use sqlx::PgPool;

use engagement_monitor::aggregate::{cutoff, retain_recent, sort_aggregates, timeline};
use engagement_monitor::db::{self, PgFetcher};
use engagement_monitor::fetch::{read_records_csv, CsvFetcher, HttpFetcher};
use engagement_monitor::models::{EngagementRecord, Snapshot};
use engagement_monitor::report;
use engagement_monitor::{
    aggregate, derive_alerts, AggregateOrder, AlertPolicy, EngineConfig, Fetcher, GroupBy,
    RefreshScheduler, SourceConfig, Thresholds, TierScale,
};

const DEFAULT_TOKEN_ENV: &str = "ENGAGEMENT_API_TOKEN";

#[derive(Parser)]
#[command(name = "engagement-monitor")]
#[command(about = "Classroom engagement aggregation and live monitoring", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Aggregate a CSV export and print tiers and alerts
    Score {
        #[arg(long)]
        csv: PathBuf,
        #[command(flatten)]
        rules: RuleArgs,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Generate a markdown report from a CSV export
    Report {
        #[arg(long)]
        csv: PathBuf,
        #[command(flatten)]
        rules: RuleArgs,
        #[arg(long, default_value_t = 10)]
        bucket_mins: i64,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Poll every configured domain and print snapshots as they change
    Watch {
        #[arg(long, default_value = "engine.toml")]
        config: PathBuf,
    },
    /// Validate an engine configuration file
    CheckConfig {
        #[arg(long, default_value = "engine.toml")]
        config: PathBuf,
    },
}

#[derive(Args)]
struct RuleArgs {
    #[arg(long, default_value_t = 60.0)]
    low: f64,
    #[arg(long, default_value_t = 80.0)]
    high: f64,
    #[arg(long)]
    urgent_below: Option<f64>,
    #[arg(long, value_enum, default_value_t = GroupArg::Classroom)]
    group_by: GroupArg,
    #[arg(long, value_enum, default_value_t = ScaleArg::Risk)]
    scale: ScaleArg,
    /// Only use records from the last N minutes
    #[arg(long)]
    window_mins: Option<i64>,
}

#[derive(Clone, Copy, ValueEnum)]
enum GroupArg {
    Entity,
    Classroom,
    Session,
    Kind,
    Platform,
}

impl From<GroupArg> for GroupBy {
    fn from(value: GroupArg) -> Self {
        match value {
            GroupArg::Entity => GroupBy::Entity,
            GroupArg::Classroom => GroupBy::Classroom,
            GroupArg::Session => GroupBy::Session,
            GroupArg::Kind => GroupBy::Kind,
            GroupArg::Platform => GroupBy::Platform,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ScaleArg {
    Risk,
    LiveStatus,
    Health,
}

impl From<ScaleArg> for TierScale {
    fn from(value: ScaleArg) -> Self {
        match value {
            ScaleArg::Risk => TierScale::Risk,
            ScaleArg::LiveStatus => TierScale::LiveStatus,
            ScaleArg::Health => TierScale::Health,
        }
    }
}

impl RuleArgs {
    fn policy(&self) -> anyhow::Result<AlertPolicy> {
        let thresholds = Thresholds::new(self.low, self.high)?;
        Ok(AlertPolicy::new(thresholds, self.urgent_below, self.scale.into())?)
    }

    fn load(&self, csv: &Path) -> anyhow::Result<Vec<EngagementRecord>> {
        let records = read_records_csv(csv)
            .with_context(|| format!("failed to read records from {}", csv.display()))?;
        Ok(match self.window_mins {
            Some(mins) => {
                let window = chrono::Duration::try_minutes(mins.max(1))
                    .context("window is out of range")?;
                retain_recent(records, cutoff(Utc::now(), window))
            }
            None => records,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info,engagement_monitor=debug"))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Score { csv, rules, limit } => {
            let policy = rules.policy()?;
            let records = rules.load(&csv)?;
            let group_by = GroupBy::from(rules.group_by);
            let mut aggregates = aggregate(&records, |r| group_by.key(r), policy.thresholds());

            if aggregates.is_empty() {
                println!("No engagement records found for this window.");
                return Ok(());
            }

            sort_aggregates(&mut aggregates, AggregateOrder::MeanAscending);
            let scale = TierScale::from(rules.scale);
            println!("Groups by engagement (lowest first):");
            for aggregate in aggregates.iter().take(limit) {
                println!(
                    "- {} {:.1}% across {} records ({})",
                    aggregate.display_name(),
                    aggregate.mean,
                    aggregate.count,
                    scale.label(aggregate.tier)
                );
            }

            let alerts = derive_alerts("cli", &aggregates, None, &policy, Utc::now());
            if !alerts.is_empty() {
                println!();
                println!("Alerts:");
                for alert in &alerts {
                    println!("- [{}] {}", alert.severity.as_str(), alert.message);
                }
            }
        }
        Commands::Report {
            csv,
            rules,
            bucket_mins,
            out,
        } => {
            let policy = rules.policy()?;
            let records = rules.load(&csv)?;
            let group_by = GroupBy::from(rules.group_by);
            let aggregates = aggregate(&records, |r| group_by.key(r), policy.thresholds());
            let alerts = derive_alerts("report", &aggregates, None, &policy, Utc::now());
            let bucket = chrono::Duration::try_minutes(bucket_mins.max(1))
                .context("bucket size is out of range")?;
            let points = timeline(&records, bucket);
            let title = csv
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "engagement export".to_string());

            let report = report::build_report(
                &title,
                rules.scale.into(),
                &aggregates,
                &alerts,
                &points,
            );
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Watch { config } => watch(&config).await?,
        Commands::CheckConfig { config } => {
            let engine = EngineConfig::from_path(&config)
                .with_context(|| format!("invalid config {}", config.display()))?;
            println!("{} domains configured:", engine.domains.len());
            for section in &engine.domains {
                let domain = section.domain_config();
                let period = domain
                    .period
                    .map(|p| format!("every {}ms", p.as_millis()))
                    .unwrap_or_else(|| "once".to_string());
                println!(
                    "- {} ({period}, timeout {}ms, cut points {}/{}, source {})",
                    domain.name,
                    domain.fetch_timeout.as_millis(),
                    domain.thresholds.low(),
                    domain.thresholds.high(),
                    source_kind(&section.source)
                );
            }
        }
    }

    Ok(())
}

fn source_kind(source: &SourceConfig) -> &'static str {
    match source {
        SourceConfig::Http { .. } => "http",
        SourceConfig::Postgres { .. } => "postgres",
        SourceConfig::Csv { .. } => "csv",
    }
}

async fn postgres_pool(pool: &mut Option<PgPool>) -> anyhow::Result<PgPool> {
    if let Some(existing) = pool {
        return Ok(existing.clone());
    }
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set for postgres sources")?;
    let connected = db::connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    *pool = Some(connected.clone());
    Ok(connected)
}

async fn watch(path: &Path) -> anyhow::Result<()> {
    let engine = EngineConfig::from_path(path)
        .with_context(|| format!("invalid config {}", path.display()))?;
    if engine.domains.is_empty() {
        anyhow::bail!("no [[domain]] entries in {}", path.display());
    }

    let client = reqwest::Client::new();
    let mut pool = None;
    let mut domains = Vec::with_capacity(engine.domains.len());
    let mut scales = Vec::with_capacity(engine.domains.len());

    for section in &engine.domains {
        let fetcher: Arc<dyn Fetcher> = match &section.source {
            SourceConfig::Http {
                url,
                decoder,
                token_env,
            } => {
                let token = std::env::var(token_env.as_deref().unwrap_or(DEFAULT_TOKEN_ENV)).ok();
                Arc::new(HttpFetcher::new(client.clone(), url.clone(), token, *decoder))
            }
            SourceConfig::Postgres {
                lookback_secs,
                classroom,
            } => {
                let lookback = chrono::Duration::try_seconds(i64::try_from(*lookback_secs)?)
                    .context("lookback_secs is out of range")?;
                Arc::new(PgFetcher::new(
                    postgres_pool(&mut pool).await?,
                    lookback,
                    classroom.clone(),
                ))
            }
            SourceConfig::Csv { path } => Arc::new(CsvFetcher::new(path.clone())),
        };
        scales.push((section.name.clone(), section.scale));
        domains.push((section.domain_config(), fetcher));
    }

    let scheduler = RefreshScheduler::new(domains)?;
    let printers: Vec<_> = scales
        .into_iter()
        .filter_map(|(name, scale)| {
            scheduler.on_snapshot_change(&name, move |snapshot| print_snapshot(&snapshot, scale))
        })
        .collect();

    scheduler.start();
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    scheduler.stop_all();
    for printer in printers {
        printer.abort();
    }
    Ok(())
}

fn print_snapshot(snapshot: &Snapshot, scale: TierScale) {
    let state = if snapshot.stale { "stale" } else { "fresh" };
    println!(
        "[{}] #{} {} with {} groups",
        snapshot.domain,
        snapshot.seq,
        state,
        snapshot.aggregates.len()
    );
    if let Some(error) = &snapshot.last_error {
        println!("  last error: {error}");
    }
    let mut ranked = snapshot.aggregates.clone();
    sort_aggregates(&mut ranked, AggregateOrder::MeanAscending);
    for aggregate in &ranked {
        println!(
            "  - {} {:.1}% ({})",
            aggregate.display_name(),
            aggregate.mean,
            scale.label(aggregate.tier)
        );
    }
    for alert in &snapshot.alerts {
        println!("  ! [{}] {}", alert.severity.as_str(), alert.message);
    }
}
