//! EnergyAudit CLI - synchronize Schedule of Loads and Voltage Drop
//! calculations from the command line.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use energyaudit::{
    import_calculations, AuditSession, BatchResolution, CalculationKind, CalculationStore, Conflict, ConflictSeverity,
    EventFilter, EventPage, EventSource, MemoryStore, ResolutionStrategy, SqliteStore, SyncConfig, SyncEventType,
    SyncReport,
};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "energyaudit")]
#[command(about = "Schedule of Loads / Voltage Drop synchronization tool", long_about = None)]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a sync pass and report conflicts between the calculators
    Sync {
        #[command(flatten)]
        input: InputArgs,

        /// Output format
        #[arg(short, long, value_enum, default_value = "human")]
        format: OutputFormat,

        /// Exit with error code if unresolved conflicts at this severity or higher remain
        #[arg(long, value_enum)]
        fail_on: Option<FailOnSeverity>,
    },

    /// Resolve conflicts found by a sync pass
    Resolve {
        #[command(flatten)]
        input: InputArgs,

        /// Resolution strategy
        #[arg(short, long, value_enum, default_value = "merge")]
        strategy: StrategyArg,

        /// Value to apply with the manual strategy
        #[arg(long, required_if_eq("strategy", "manual"))]
        value: Option<f64>,

        /// Only resolve conflicts on these circuits (default: all unresolved)
        #[arg(long = "circuit", value_name = "CIRCUIT_ID")]
        circuits: Vec<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "human")]
        format: OutputFormat,
    },

    /// Run a sync pass and list the event log
    Events {
        #[command(flatten)]
        input: InputArgs,

        /// Only show these event types (e.g. conflict-detected)
        #[arg(long = "type", value_name = "TYPE")]
        types: Vec<SyncEventType>,

        /// Only show events from these sources (e.g. system, user)
        #[arg(long = "source", value_name = "SOURCE")]
        sources: Vec<EventSource>,

        /// Case-insensitive text search over event payloads
        #[arg(long)]
        search: Option<String>,

        /// Only show events on or after this UTC date (YYYY-MM-DD)
        #[arg(long, value_name = "DATE")]
        since: Option<NaiveDate>,

        /// Only show events on or before this UTC date (YYYY-MM-DD)
        #[arg(long, value_name = "DATE")]
        until: Option<NaiveDate>,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        #[arg(long, default_value_t = 50)]
        limit: usize,

        /// Output format
        #[arg(short, long, value_enum, default_value = "human")]
        format: OutputFormat,
    },
}

#[derive(Args)]
struct InputArgs {
    /// JSON array of saved Schedule of Loads panels
    #[arg(long, value_name = "FILE")]
    schedules: Option<PathBuf>,

    /// JSON array of saved Voltage Drop records
    #[arg(long = "voltage-drop", value_name = "FILE")]
    voltage_drop: Option<PathBuf>,

    /// SQLite database holding saved calculations (resolutions are written back)
    #[arg(long, value_name = "FILE", conflicts_with_all = ["schedules", "voltage_drop"])]
    db: Option<PathBuf>,

    /// Engine configuration (JSON)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON output for CI/CD
    Json,
}

#[derive(Clone, ValueEnum)]
enum FailOnSeverity {
    Critical,
    High,
    Medium,
    Low,
}

impl FailOnSeverity {
    fn threshold(&self) -> ConflictSeverity {
        match self {
            FailOnSeverity::Critical => ConflictSeverity::Critical,
            FailOnSeverity::High => ConflictSeverity::High,
            FailOnSeverity::Medium => ConflictSeverity::Medium,
            FailOnSeverity::Low => ConflictSeverity::Low,
        }
    }
}

#[derive(Clone, PartialEq, ValueEnum)]
enum StrategyArg {
    /// Keep the Voltage Drop calculator's value
    VoltageDrop,
    /// Keep the Schedule of Loads value
    ScheduleOfLoads,
    /// Keep whichever side was edited last
    Merge,
    /// Apply the value given with --value
    Manual,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Sync { input, format, fail_on } => handle_sync(&input, format, fail_on).await,
        Commands::Resolve {
            input,
            strategy,
            value,
            circuits,
            format,
        } => handle_resolve(&input, strategy, value, &circuits, format).await,
        Commands::Events {
            input,
            types,
            sources,
            search,
            since,
            until,
            offset,
            limit,
            format,
        } => {
            let mut filter = EventFilter::new()
                .with_types(types)
                .with_sources(sources)
                .between(since, until)
                .page(offset, limit);
            if let Some(search) = search {
                filter = filter.with_search(search);
            }
            handle_events(&input, &filter, format).await
        }
    };

    let exit_code = match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };
    process::exit(exit_code);
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Build a session over the requested inputs
async fn open_session(input: &InputArgs) -> Result<AuditSession> {
    let config = match &input.config {
        Some(path) => SyncConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => SyncConfig::default(),
    };

    let store: Arc<dyn CalculationStore> = match &input.db {
        Some(db) => Arc::new(SqliteStore::open(db).with_context(|| format!("opening {}", db.display()))?),
        None => {
            if input.schedules.is_none() && input.voltage_drop.is_none() {
                bail!("no input given: pass --schedules/--voltage-drop or --db");
            }
            let store = MemoryStore::new();
            if let Some(path) = &input.schedules {
                import_calculations(&store, CalculationKind::ScheduleOfLoads, path)
                    .await
                    .with_context(|| format!("importing {}", path.display()))?;
            }
            if let Some(path) = &input.voltage_drop {
                import_calculations(&store, CalculationKind::VoltageDrop, path)
                    .await
                    .with_context(|| format!("importing {}", path.display()))?;
            }
            Arc::new(store)
        }
    };

    Ok(AuditSession::new(config, store))
}

async fn synced_session(input: &InputArgs) -> Result<(AuditSession, SyncReport)> {
    let session = open_session(input).await?;
    let report = session.sync(true).await;
    if let Some(error) = &report.outcome.error {
        bail!("sync failed: {}", error);
    }
    if report.outcome.skipped {
        bail!("sync is disabled in the configuration");
    }
    Ok((session, report))
}

async fn handle_sync(input: &InputArgs, format: OutputFormat, fail_on: Option<FailOnSeverity>) -> Result<i32> {
    let (_session, report) = synced_session(input).await?;

    match format {
        OutputFormat::Human => output_report_human(&report),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }

    if let Some(severity) = fail_on {
        if report.has_severity_at_least(severity.threshold()) {
            return Ok(1);
        }
    }
    Ok(0)
}

async fn handle_resolve(
    input: &InputArgs,
    strategy: StrategyArg,
    value: Option<f64>,
    circuits: &[String],
    format: OutputFormat,
) -> Result<i32> {
    let strategy = match strategy {
        StrategyArg::VoltageDrop => ResolutionStrategy::VoltageDrop,
        StrategyArg::ScheduleOfLoads => ResolutionStrategy::ScheduleOfLoads,
        StrategyArg::Merge => ResolutionStrategy::Merge,
        StrategyArg::Manual => match value {
            Some(v) => ResolutionStrategy::Manual(v),
            None => bail!("--value is required with --strategy manual"),
        },
    };

    let (session, report) = synced_session(input).await?;
    let ids: Vec<String> = report
        .unresolved()
        .filter(|c| {
            circuits.is_empty() || circuits.contains(&c.circuit_id) || circuits.contains(&c.counterpart_id)
        })
        .map(|c| c.id.clone())
        .collect();

    let batch = session.engine().resolve_conflicts(&ids, strategy).await;
    let remaining = session.engine().unresolved_conflicts().await;

    match format {
        OutputFormat::Human => output_resolution_human(&batch, &remaining),
        OutputFormat::Json => {
            let output = serde_json::json!({
                "strategy": strategy,
                "resolution": batch,
                "remaining": remaining,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(if batch.failure_count() > 0 { 1 } else { 0 })
}

async fn handle_events(input: &InputArgs, filter: &EventFilter, format: OutputFormat) -> Result<i32> {
    let (session, _report) = synced_session(input).await?;
    let page = session.engine().get_sync_events(filter);

    match format {
        OutputFormat::Human => output_events_human(&page),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&page)?),
    }
    Ok(0)
}

fn output_conflict(conflict: &Conflict) {
    let unit = conflict.conflict_type.unit();
    println!(
        "    - {} <-> {}: {}",
        conflict.circuit_id, conflict.counterpart_id, conflict.conflict_type
    );
    println!(
        "      Voltage Drop: {:.2}{}  Schedule of Loads: {:.2}{}  (id {})",
        conflict.voltage_drop_source.value, unit, conflict.schedule_of_loads_source.value, unit, conflict.id
    );
}

fn output_report_human(report: &SyncReport) {
    println!("\nSync pass");
    println!("{}", "─".repeat(60));
    println!("  Circuits processed: {}", report.outcome.circuits_processed);
    println!(
        "  Panels: {}  Branches: {}  Voltage drop runs: {}  Links: {}",
        report.topology.panel_count,
        report.topology.branch_count,
        report.topology.voltage_drop_count,
        report.topology.link_count
    );

    if report.unresolved().next().is_none() {
        println!("\n  No conflicts found");
        return;
    }

    for severity in [
        ConflictSeverity::Critical,
        ConflictSeverity::High,
        ConflictSeverity::Medium,
        ConflictSeverity::Low,
    ] {
        let conflicts: Vec<_> = report.unresolved().filter(|c| c.severity == severity).collect();
        if conflicts.is_empty() {
            continue;
        }
        println!("\n  {}:", severity.to_string().to_uppercase());
        for conflict in conflicts {
            output_conflict(conflict);
        }
    }

    println!("\n  Summary:");
    println!("    Critical: {}", report.count_by_severity(ConflictSeverity::Critical));
    println!("    High:     {}", report.count_by_severity(ConflictSeverity::High));
    println!("    Medium:   {}", report.count_by_severity(ConflictSeverity::Medium));
    println!("    Low:      {}", report.count_by_severity(ConflictSeverity::Low));
}

fn output_resolution_human(batch: &BatchResolution, remaining: &[Conflict]) {
    println!("\nResolved {} conflict(s)", batch.success_count());
    for failure in &batch.failed {
        println!("  Failed {}: {}", failure.conflict_id, failure.error);
    }
    if remaining.is_empty() {
        println!("  No unresolved conflicts remain");
    } else {
        println!("\n  Remaining:");
        for conflict in remaining {
            output_conflict(conflict);
        }
    }
}

fn output_events_human(page: &EventPage) {
    println!("\nEvents ({} of {})", page.events.len(), page.total);
    println!("{}", "─".repeat(60));
    for event in &page.events {
        let data = serde_json::to_value(&event.kind)
            .ok()
            .and_then(|v| v.get("data").cloned())
            .map(|d| d.to_string())
            .unwrap_or_default();
        println!(
            "  #{:<4} {}  {:<22} {:<18} {}",
            event.seq,
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.event_type(),
            event.source,
            data
        );
    }
}
