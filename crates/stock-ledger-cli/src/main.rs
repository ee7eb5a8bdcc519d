use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use stock_ledger_api::{
    parse_category, EngineConfig, EngineError, JsonFileSource, StockLedgerApi, WorkbookSource,
    API_CONTRACT_VERSION,
};
use stock_ledger_core::{format_duration, ActionKind, PersistenceGateway, SnapshotSource};
use stock_ledger_store_sqlite::SqliteStore;
use time::OffsetDateTime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "sl")]
#[command(about = "Stock Ledger CLI")]
struct Cli {
    #[arg(long, default_value = "./stock_ledger.sqlite3")]
    db: PathBuf,

    /// YAML engine config; built-in defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, default_value_t = false)]
    log_json: bool,

    /// Evaluation time (RFC3339, UTC). Defaults to the current time.
    #[arg(long)]
    now: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Ingest(IngestArgs),
    Watch(WatchArgs),
    Categories,
    View(ViewArgs),
    Buyers(CategoryArgs),
    Action {
        #[command(subcommand)]
        command: ActionCommand,
    },
    History(StockIdArgs),
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SourceFormat {
    Xlsx,
    Json,
}

#[derive(Debug, Args)]
struct IngestArgs {
    #[arg(long)]
    file: PathBuf,
    /// Inferred from the file extension when omitted.
    #[arg(long, value_enum)]
    format: Option<SourceFormat>,
}

#[derive(Debug, Args)]
struct WatchArgs {
    #[command(flatten)]
    source: IngestArgs,
    #[arg(long)]
    interval_secs: Option<u64>,
    /// Stop after this many cycles; runs until interrupted when omitted.
    #[arg(long)]
    cycles: Option<u64>,
}

#[derive(Debug, Args)]
struct CategoryArgs {
    #[arg(long)]
    category: String,
}

#[derive(Debug, Args)]
struct ViewArgs {
    #[arg(long)]
    category: String,
    #[arg(long, default_value = "all")]
    buyer: String,
}

#[derive(Debug, Args)]
struct StockIdArgs {
    #[arg(long)]
    stock_id: String,
}

#[derive(Debug, Subcommand)]
enum ActionCommand {
    Set {
        #[arg(long)]
        stock_id: String,
        #[arg(long)]
        kind: String,
    },
    Text {
        #[arg(long)]
        stock_id: String,
        #[arg(long)]
        text: String,
    },
    Bulk {
        #[arg(long = "stock-id", required = true)]
        stock_ids: Vec<String>,
        #[arg(long)]
        kind: String,
        #[arg(long)]
        text: Option<String>,
    },
    Show(StockIdArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate,
    IntegrityCheck,
    Backup(DbBackupArgs),
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

fn init_logging(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            object.insert(
                "api_contract_version".to_string(),
                Value::String(API_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "api_contract_version": API_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let config = match cli.config.as_deref() {
        Some(path) => EngineConfig::from_path(path)?,
        None => EngineConfig::default(),
    };
    let now = parse_optional_rfc3339(cli.now.as_deref())?;

    match cli.command {
        Command::Db { command } => run_db(command, &cli.db),
        Command::Ingest(args) => {
            let api = open_engine(&cli.db, &config)?;
            run_ingest(&api, &args, now.unwrap_or_else(OffsetDateTime::now_utc))
        }
        Command::Watch(args) => {
            let api = open_engine(&cli.db, &config)?;
            run_watch(&api, &args, &config, now)
        }
        Command::Categories => {
            let api = open_engine(&cli.db, &config)?;
            run_categories(&api)
        }
        Command::View(args) => {
            let api = open_engine(&cli.db, &config)?;
            run_view(&api, &args, now.unwrap_or_else(OffsetDateTime::now_utc))
        }
        Command::Buyers(args) => {
            let api = open_engine(&cli.db, &config)?;
            run_buyers(&api, &args)
        }
        Command::Action { command } => {
            let api = open_engine(&cli.db, &config)?;
            run_action(&api, command)
        }
        Command::History(args) => {
            let api = open_engine(&cli.db, &config)?;
            run_history(&api, &args, now.unwrap_or_else(OffsetDateTime::now_utc))
        }
    }
}

fn open_engine(db: &Path, config: &EngineConfig) -> Result<StockLedgerApi> {
    let store = SqliteStore::open_migrated(db)?;
    let gateway: Arc<dyn PersistenceGateway> = Arc::new(store);
    StockLedgerApi::open(gateway, config)
        .with_context(|| format!("failed to load ledger state from {}", db.display()))
}

fn snapshot_source(args: &IngestArgs) -> Box<dyn SnapshotSource> {
    let format = args.format.unwrap_or_else(|| {
        let is_json = args
            .file
            .extension()
            .and_then(|extension| extension.to_str())
            .is_some_and(|extension| extension.eq_ignore_ascii_case("json"));
        if is_json {
            SourceFormat::Json
        } else {
            SourceFormat::Xlsx
        }
    });
    match format {
        SourceFormat::Json => Box::new(JsonFileSource::new(&args.file)),
        SourceFormat::Xlsx => Box::new(WorkbookSource::new(&args.file)),
    }
}

fn run_ingest(api: &StockLedgerApi, args: &IngestArgs, now: OffsetDateTime) -> Result<()> {
    let source = snapshot_source(args);
    let report = api.ingest(source.as_ref(), now)?;
    emit_json(serde_json::to_value(report)?)
}

fn run_watch(
    api: &StockLedgerApi,
    args: &WatchArgs,
    config: &EngineConfig,
    fixed_now: Option<OffsetDateTime>,
) -> Result<()> {
    let source = snapshot_source(&args.source);
    let interval =
        args.interval_secs.map_or_else(|| config.watch_interval(), Duration::from_secs);
    tracing::info!(source = %source.describe(), interval_secs = interval.as_secs(), "watching snapshot");

    let mut cycle: u64 = 0;
    loop {
        cycle += 1;
        let now = fixed_now.unwrap_or_else(OffsetDateTime::now_utc);
        match api.ingest(source.as_ref(), now) {
            Ok(report) => emit_json(serde_json::json!({
                "cycle": cycle,
                "report": serde_json::to_value(report)?,
            }))?,
            Err(EngineError::IngestionInFlight) => {
                tracing::warn!(cycle, "previous ingestion still running; skipping cycle");
            }
            Err(err @ EngineError::SourceUnavailable(_)) => {
                tracing::warn!(cycle, error = %err, "snapshot unavailable; will retry");
                emit_json(serde_json::json!({ "cycle": cycle, "error": err.to_string() }))?;
            }
            Err(err) => return Err(err.into()),
        }

        if args.cycles.is_some_and(|limit| cycle >= limit) {
            return Ok(());
        }
        thread::sleep(interval);
    }
}

fn run_categories(api: &StockLedgerApi) -> Result<()> {
    let state = api.snapshot();
    emit_json(serde_json::json!({
        "version": state.version,
        "last_update": format_optional_rfc3339(state.last_update)?,
        "categories": state.classification.summaries(),
    }))
}

fn run_view(api: &StockLedgerApi, args: &ViewArgs, now: OffsetDateTime) -> Result<()> {
    let category = parse_category(&args.category)?;
    let rows = api.view(category, &args.buyer, now)?;
    let totals = api.buyer_totals(category);
    emit_json(serde_json::json!({
        "category": category,
        "buyer": args.buyer,
        "count": rows.len(),
        "total_cost": totals.get(&args.buyer),
        "rows": rows,
    }))
}

fn run_buyers(api: &StockLedgerApi, args: &CategoryArgs) -> Result<()> {
    let category = parse_category(&args.category)?;
    let totals = api.buyer_totals(category);
    emit_json(serde_json::json!({
        "category": category,
        "totals": totals,
    }))
}

fn run_action(api: &StockLedgerApi, command: ActionCommand) -> Result<()> {
    match command {
        ActionCommand::Set { stock_id, kind } => {
            let action = api.set_action(&stock_id, parse_action_kind(&kind)?)?;
            emit_json(serde_json::json!({ "stock_id": stock_id, "action": action }))
        }
        ActionCommand::Text { stock_id, text } => {
            let action = api.set_action_text(&stock_id, &text)?;
            emit_json(serde_json::json!({ "stock_id": stock_id, "action": action }))
        }
        ActionCommand::Bulk { stock_ids, kind, text } => {
            let kind = parse_action_kind(&kind)?;
            // Bulk always writes its text, so a missing `--text` clears earlier text.
            let text = text.unwrap_or_default();
            let applied = api.bulk_apply(&stock_ids, kind, Some(&text))?;
            emit_json(serde_json::json!({ "applied": applied, "kind": kind }))
        }
        ActionCommand::Show(args) => {
            let action = api.get_action(&args.stock_id);
            emit_json(serde_json::json!({ "stock_id": args.stock_id, "action": action }))
        }
    }
}

fn run_history(api: &StockLedgerApi, args: &StockIdArgs, now: OffsetDateTime) -> Result<()> {
    let entry = api
        .history(&args.stock_id)
        .ok_or_else(|| anyhow!("no status history for stock id `{}`", args.stock_id))?;
    let days = api.current_duration(&args.stock_id, now);
    emit_json(serde_json::json!({
        "stock_id": args.stock_id,
        "entry": entry,
        "status_days": days,
        "status_duration": days.map(format_duration),
    }))
}

fn run_db(command: DbCommand, db: &Path) -> Result<()> {
    let store = SqliteStore::open(db)?;
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))
        }
        DbCommand::Migrate => {
            let before = store.schema_status()?;
            store.migrate()?;
            let after = store.schema_status()?;
            emit_json(serde_json::json!({
                "before_version": before.current_version,
                "applied_versions": before.pending_versions,
                "after_version": after.current_version,
                "up_to_date": after.pending_versions.is_empty()
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = store.integrity_check()?;
            emit_json(serde_json::to_value(report)?)
        }
        DbCommand::Backup(args) => {
            store.backup_database(&args.out)?;
            emit_json(serde_json::json!({ "backup": args.out.display().to_string() }))
        }
    }
}

fn parse_action_kind(value: &str) -> Result<ActionKind> {
    ActionKind::parse(value).ok_or_else(|| {
        let known = ActionKind::CONCRETE.iter().map(|kind| kind.as_str()).collect::<Vec<_>>();
        anyhow!("unknown action kind `{value}` (expected one of: {}, or unset)", known.join(", "))
    })
}

fn parse_optional_rfc3339(value: Option<&str>) -> Result<Option<OffsetDateTime>> {
    value.map(parse_rfc3339).transpose()
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 UTC timestamp: {value}"))?;

    if parsed.offset() != time::UtcOffset::UTC {
        return Err(anyhow!("timestamp MUST use UTC offset Z (received: {value})"));
    }

    Ok(parsed)
}

fn format_optional_rfc3339(value: Option<OffsetDateTime>) -> Result<Option<String>> {
    value
        .map(|value| {
            value
                .format(&time::format_description::well_known::Rfc3339)
                .context("failed to format RFC3339 timestamp")
        })
        .transpose()
}
