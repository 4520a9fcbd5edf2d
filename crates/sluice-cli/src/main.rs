use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use sluice_core::DocumentType;
use sluice_source::{FixtureTransport, HttpSource, RemoteSource};
use sluice_storage::{IngestStore, JobQueue, MemoryJobQueue, MemoryStore, PgJobQueue, PgStore};
use sluice_sync::{maybe_build_scheduler, Engine, SyncConfig, TenantRegistry};
use sluice_web::AppState;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "sluice")]
#[command(about = "Resumable ingestion of paginated tenant listings")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json: bool,
    /// Keep progress, documents and jobs in process memory instead of Postgres.
    #[arg(long, global = true)]
    memory: bool,
    /// Serve tenant listings from `<dir>/<tenant>/<document_type>.json`.
    #[arg(long, global = true, value_name = "DIR")]
    fixtures: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    /// Start or resume ingestion of every document type for a tenant.
    Trigger {
        tenant: String,
        /// Run the queued chain to completion in this process.
        #[arg(long)]
        drain: bool,
    },
    /// Discard checkpoints and re-ingest a tenant from the first page.
    ForceRefresh {
        tenant: String,
        #[arg(long)]
        drain: bool,
    },
    /// Resume a failed run.
    Retry {
        tenant: String,
        document_type: DocumentType,
        #[arg(long)]
        drain: bool,
    },
    /// Stop a running chain after its current unit.
    Pause {
        tenant: String,
        document_type: DocumentType,
    },
    /// Print the progress records of a tenant.
    Status { tenant: String },
    /// Execute queued units until interrupted.
    Worker,
    /// Run the operator API, a worker and the refresh scheduler.
    Serve,
}

impl Commands {
    fn drains(&self) -> bool {
        match self {
            Commands::Trigger { drain, .. }
            | Commands::ForceRefresh { drain, .. }
            | Commands::Retry { drain, .. } => *drain,
            _ => false,
        }
    }
}

struct Runtime {
    engine: Engine,
    tenants: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = SyncConfig::from_env();
    let long_running = matches!(cli.command, Commands::Serve | Commands::Worker);
    if cli.memory && !cli.command.drains() && !long_running {
        warn!("--memory state is discarded when this command exits");
    }

    if let Commands::Migrate = cli.command {
        if cli.memory {
            info!("memory store needs no migrations");
            return Ok(());
        }
        let store = PgStore::connect(&config.database_url)
            .await
            .context("connecting to database")?;
        store.migrate().await.context("applying migrations")?;
        println!("migrations applied");
        return Ok(());
    }

    let runtime = build_runtime(&cli, &config).await?;
    let engine = &runtime.engine;
    let drain = cli.command.drains();

    match cli.command {
        Commands::Migrate => {}
        Commands::Trigger { tenant, .. } => {
            print_json(&engine.orchestrator.start_ingestion(&tenant).await?)?;
        }
        Commands::ForceRefresh { tenant, .. } => {
            print_json(&engine.orchestrator.force_full_refresh(&tenant).await?)?;
        }
        Commands::Retry {
            tenant,
            document_type,
            ..
        } => {
            print_json(&engine.orchestrator.retry_failed(&tenant, document_type).await?)?;
        }
        Commands::Pause {
            tenant,
            document_type,
        } => {
            print_json(&engine.orchestrator.pause(&tenant, document_type).await?)?;
        }
        Commands::Status { tenant } => {
            print_json(&engine.orchestrator.progress_for_tenant(&tenant).await?)?;
        }
        Commands::Worker => {
            let shutdown = shutdown_channel();
            let report = engine.worker.run(wait_for(shutdown)).await;
            print_json(&report)?;
        }
        Commands::Serve => serve(&runtime, &config).await?,
    }

    if drain {
        let report = engine.worker.run_until_idle().await?;
        info!(?report, "queue drained");
        print_json(&report)?;
        for tenant in &runtime.tenants {
            print_json(&engine.orchestrator.progress_for_tenant(tenant).await?)?;
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

async fn build_runtime(cli: &Cli, config: &SyncConfig) -> Result<Runtime> {
    let store: Arc<dyn IngestStore>;
    let queue: Arc<dyn JobQueue>;
    if cli.memory {
        store = Arc::new(MemoryStore::new());
        queue = Arc::new(MemoryJobQueue::new());
    } else {
        let pg = PgStore::connect(&config.database_url)
            .await
            .context("connecting to database")?;
        queue = Arc::new(PgJobQueue::new(pg.pool().clone()));
        store = Arc::new(pg);
    }

    let http = config.http_client_config();
    let source: Arc<dyn RemoteSource>;
    let tenants: Vec<String>;
    match &cli.fixtures {
        Some(dir) => {
            let transport = FixtureTransport::load_dir(dir)?;
            tenants = transport.tenant_ids();
            let endpoints = transport.endpoints();
            info!(dir = %dir.display(), tenants = tenants.len(), "serving fixture listings");
            source = Arc::new(HttpSource::with_transport(transport, &http, endpoints));
        }
        None => {
            let registry = TenantRegistry::load(&config.tenants_file).await?;
            source = Arc::new(HttpSource::new(&http, registry.endpoints()?)?);
            tenants = registry.enabled_tenant_ids();
        }
    }

    Ok(Runtime {
        engine: Engine::from_config(store, queue, source, config),
        tenants,
    })
}

async fn serve(runtime: &Runtime, config: &SyncConfig) -> Result<()> {
    let engine = &runtime.engine;
    let shutdown = shutdown_channel();

    let mut scheduler =
        maybe_build_scheduler(config, engine.orchestrator.clone(), runtime.tenants.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.refresh_cron, "refresh scheduler started");
    }

    let state = AppState::new(engine.orchestrator.clone());
    let web = sluice_web::serve(config.web_port, state, wait_for(shutdown.clone()));
    let worker = async { anyhow::Ok(engine.worker.run(wait_for(shutdown.clone())).await) };
    let ((), report) = tokio::try_join!(web, worker)?;
    info!(?report, "worker drained");

    if let Some(sched) = scheduler.as_mut() {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    Ok(())
}

fn shutdown_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "listening for ctrl-c failed");
        }
        info!("shutdown requested");
        let _ = tx.send(true);
    });
    rx
}

async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
