//! eventgate CLI: feed events through the rule pipeline.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use eventgate::cancel::EvalContext;
use eventgate::config::Config;
use eventgate::config::secrets::redacted_dsn;
use eventgate::db::Db;
use eventgate::events;
use eventgate::janitor::Janitor;
use eventgate::processor::Orchestrator;
use eventgate::registry::EventRegistry;
use eventgate::rules::{DEFAULT_TENANT, RuleRepository, RuleSource};
use eventgate::store::{EventStore, MemoryEventStore};
use eventgate::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use secrecy::ExposeSecret;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "eventgate", about = "Multi-tenant event classification")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Evaluate newline-delimited JSON events
    Process {
        /// Read events from this file instead of stdin
        #[arg(long)]
        file: Option<PathBuf>,
        /// Keep processed events in memory instead of Postgres
        #[arg(long)]
        dry_run: bool,
    },
    /// Load and statically validate the rule document
    CheckRules {
        /// Rule document (defaults to RULES_PATH)
        #[arg(long)]
        rules: Option<PathBuf>,
    },
    /// Run one retention sweep
    Cleanup,
    /// Process events from stdin with the cleanup janitor running
    Serve,
    /// Show recently processed events for a tenant
    History {
        tenant: String,
        /// Maximum records to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::CheckRules { rules } => cmd_check_rules(rules).await,
        Command::Process { file, dry_run } => {
            let (config, _guard) = setup()?;
            cmd_process(&config, file, dry_run).await
        }
        Command::Cleanup => {
            let (config, _guard) = setup()?;
            cmd_cleanup(&config).await
        }
        Command::Serve => {
            let (config, _guard) = setup()?;
            cmd_serve(&config).await
        }
        Command::History { tenant, limit } => {
            let (config, _guard) = setup()?;
            cmd_history(&config, &tenant, limit).await
        }
    }
}

fn setup() -> anyhow::Result<(Config, TelemetryGuard)> {
    let config = Config::from_env()?;
    let guard = init_telemetry(TelemetryConfig::new(
        config.otel_endpoint.clone(),
        config.log_level.clone(),
    ))?;
    Ok((config, guard))
}

async fn open_db(config: &Config) -> anyhow::Result<Db> {
    let url = config.require_database_url()?;
    let db = Db::connect(url.expose_secret())
        .await
        .with_context(|| format!("connecting to {}", redacted_dsn(url)))?;
    db.migrate().await?;
    info!(dsn = %redacted_dsn(url), "database ready");
    Ok(db)
}

struct Pipeline {
    registry: EventRegistry,
    processor: Orchestrator,
    eval_timeout: Option<Duration>,
}

/// Load rules up front so a bad document fails at startup, not on the first event.
async fn build_pipeline(config: &Config, store: Arc<dyn EventStore>) -> anyhow::Result<Pipeline> {
    let registry = EventRegistry::new();
    events::register_builtin(&registry);

    let rules = Arc::new(RuleSource::new(&config.rules_path, &config.default_tenant));
    rules.get().await?.validate_payload_fields(&registry)?;

    Ok(Pipeline {
        registry,
        processor: Orchestrator::with_builtin_evaluator(rules, store),
        eval_timeout: config.eval_timeout,
    })
}

/// Evaluate one event per line, printing the outcome of each.
async fn process_lines<R>(
    reader: R,
    pipeline: &Pipeline,
    shutdown: &CancellationToken,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let (mut handled, mut total) = (0usize, 0usize);

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        total += 1;

        let mut ctx = EvalContext::with_token(shutdown.child_token());
        if let Some(timeout) = pipeline.eval_timeout {
            ctx = ctx.with_timeout(timeout);
        }

        match pipeline
            .registry
            .resolve_and_dispatch(&ctx, &pipeline.processor, line.as_bytes())
            .await
        {
            Ok(true) => {
                handled += 1;
                println!("handled");
            }
            Ok(false) => println!("unhandled"),
            Err(e) => println!("error: {e} (stage: {})", e.stage()),
        }
    }

    info!(total, handled, "input drained");
    Ok(())
}

fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let t = token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        t.cancel();
    });
    token
}

async fn cmd_process(config: &Config, file: Option<PathBuf>, dry_run: bool) -> anyhow::Result<()> {
    let store: Arc<dyn EventStore> = if dry_run {
        Arc::new(MemoryEventStore::new())
    } else {
        Arc::new(open_db(config).await?)
    };
    let pipeline = build_pipeline(config, store).await?;
    let shutdown = ctrl_c_token();

    match file {
        Some(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("opening {}", path.display()))?;
            process_lines(BufReader::new(file), &pipeline, &shutdown).await
        }
        None => process_lines(BufReader::new(tokio::io::stdin()), &pipeline, &shutdown).await,
    }
}

async fn cmd_check_rules(rules: Option<PathBuf>) -> anyhow::Result<()> {
    let (path, default_tenant) = match rules {
        Some(path) => (
            path,
            std::env::var("DEFAULT_TENANT").unwrap_or_else(|_| DEFAULT_TENANT.to_string()),
        ),
        None => {
            let config = Config::from_env()?;
            (config.rules_path, config.default_tenant)
        }
    };

    let registry = EventRegistry::new();
    events::register_builtin(&registry);

    let repo = RuleRepository::load(&path, &default_tenant).await?;
    repo.validate_payload_fields(&registry)?;
    println!("{}: {} rule(s) OK", path.display(), repo.rule_count());
    Ok(())
}

async fn cmd_cleanup(config: &Config) -> anyhow::Result<()> {
    let db = open_db(config).await?;
    let janitor = Janitor::new(Arc::new(db), config.cleanup_interval, config.retention);
    let deleted = janitor.sweep_once().await?;
    println!("deleted {deleted} processed event(s)");
    Ok(())
}

async fn cmd_serve(config: &Config) -> anyhow::Result<()> {
    let store: Arc<dyn EventStore> = Arc::new(open_db(config).await?);
    let pipeline = build_pipeline(config, Arc::clone(&store)).await?;
    let shutdown = ctrl_c_token();

    let janitor = Janitor::new(store, config.cleanup_interval, config.retention);
    let janitor_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { janitor.run(shutdown).await }
    });

    let result = process_lines(BufReader::new(tokio::io::stdin()), &pipeline, &shutdown).await;

    shutdown.cancel();
    janitor_task.await?;
    result
}

async fn cmd_history(config: &Config, tenant: &str, limit: i64) -> anyhow::Result<()> {
    let db = open_db(config).await?;
    let events = db.list_processed_events(tenant, limit).await?;

    if events.is_empty() {
        println!("No processed events for tenant {tenant}.");
        return Ok(());
    }

    println!(
        "{:<6}  {:<14}  {:<20}  {:<16}  CREATED",
        "ID", "TYPE", "RULE", "SHA"
    );
    println!("{}", "-".repeat(80));
    for event in &events {
        println!(
            "{:<6}  {:<14}  {:<20}  {:<16}  {}",
            event.id,
            event.event_type,
            event.rule_id,
            &event.event_sha[..event.event_sha.len().min(16)],
            event.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!("\n{} event(s)", events.len());
    Ok(())
}
