use clap::{Parser, Subcommand, ValueEnum};
use rampart_cache::Cache;
use rampart_controller::{
    run_watch, AdmissionCheckCoordinator, CheckControllerRegistry, CheckRunner, CoordinatorConfig,
    EventHandler, Informer, Reporter, ReporterConfig,
};
use rampart_core::{parse_manifests, ApiObject, Configuration};
use rampart_queue::{QueueConfig, QueueManager};
use rampart_scheduler::{Scheduler, SchedulerConfig};
use rampart_storage::{EventBusConfig, ObjectStore, RedbBackend};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "rampart", about = "Rampart job queueing and admission control")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the informer, scheduler, admission-check coordinator and reporter
    Run {
        /// Path to the redb database file
        #[arg(long, env = "RAMPART_DATA_DIR", default_value = "./rampart.redb")]
        data_dir: PathBuf,
        /// YAML configuration file
        #[arg(long, env = "RAMPART_CONFIG")]
        config: Option<PathBuf>,
        /// YAML manifests applied at startup
        #[arg(long)]
        manifests: Vec<PathBuf>,
        /// Log output format
        #[arg(long, value_enum, default_value_t = LogFormat::Text)]
        log_format: LogFormat,
    },
    /// Parse and validate manifests without applying them
    Validate {
        /// Manifest files to check
        #[arg(required = true)]
        manifests: Vec<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            data_dir,
            config,
            manifests,
            log_format,
        } => {
            init_tracing(log_format);
            run(&data_dir, config.as_deref(), &manifests).await
        }
        Commands::Validate { manifests } => {
            init_tracing(LogFormat::Text);
            validate(&manifests)
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

/// Read and validate every object in `paths`
fn load_manifests(paths: &[PathBuf]) -> miette::Result<Vec<ApiObject>> {
    let mut objects = Vec::new();
    for path in paths {
        let data = std::fs::read_to_string(path)
            .map_err(|e| miette::miette!("Failed to read {}: {}", path.display(), e))?;
        let parsed = parse_manifests(&data)
            .map_err(|e| miette::miette!("Invalid manifest {}: {}", path.display(), e))?;
        for object in &parsed {
            object.validate().map_err(|e| {
                miette::miette!("Invalid {} in {}: {}", object.kind(), path.display(), e)
            })?;
        }
        objects.extend(parsed);
    }
    Ok(objects)
}

fn validate(paths: &[PathBuf]) -> miette::Result<()> {
    let objects = load_manifests(paths)?;
    for object in &objects {
        if let Ok(key) = object.resource_key() {
            info!(kind = object.kind(), object = %key, "Valid");
        }
    }
    info!(objects = objects.len(), "Manifests are valid");
    Ok(())
}

async fn run(data_dir: &Path, config: Option<&Path>, manifests: &[PathBuf]) -> miette::Result<()> {
    let config = match config {
        Some(path) => Configuration::from_yaml_file(path)?,
        None => Configuration::default(),
    };
    info!("Starting rampart");

    let backend = Arc::new(RedbBackend::new(data_dir).map_err(|e| {
        miette::miette!("Failed to open storage at '{}': {}", data_dir.display(), e)
    })?);
    let store = Arc::new(ObjectStore::with_event_bus_config(
        backend,
        EventBusConfig {
            capacity: config.event_bus_capacity,
        },
    ));

    for object in load_manifests(manifests)? {
        let kind = object.kind();
        let key = store
            .apply_object(object)
            .map_err(|e| miette::miette!("Failed to apply {}: {}", kind, e))?;
        info!(object = %key, "Applied manifest");
    }

    let registry = Arc::new(if config.admission_checks.enable_always_ready {
        CheckControllerRegistry::with_builtin()
    } else {
        CheckControllerRegistry::new()
    });
    info!(controllers = ?registry.names().collect::<Vec<_>>(), "Check controllers ready");

    let cache = Arc::new(Cache::new());
    let queues = Arc::new(QueueManager::new(QueueConfig::from_settings(&config.queueing)?));
    let coordinator_config = CoordinatorConfig::from_settings(&config.admission_checks);
    let resync_interval = coordinator_config.resync_interval;

    let token = CancellationToken::new();
    let mut handles = Vec::new();

    let scheduler = Scheduler::new(
        cache.clone(),
        queues.clone(),
        store.clone(),
        SchedulerConfig::from_settings(&config.scheduler),
    )?;

    // 1. Informer: feeds the cache and queues, then retries deferred work.
    // Its resyncs wait for the running scheduling cycle.
    let informer = Arc::new(
        Informer::new(store.clone(), cache.clone(), queues.clone(), registry.clone())
            .with_cycle_gate(scheduler.cycle_gate()),
    );
    handles.push(spawn_watch(informer, store.clone(), Duration::from_secs(1), token.clone()));

    // 2. Scheduler
    let scheduler_token = token.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = scheduler.run(scheduler_token).await {
            error!("Scheduler error: {}", e);
        }
    }));

    // 3. Admission-check coordinator and in-process check controllers
    let coordinator = Arc::new(AdmissionCheckCoordinator::new(
        store.clone(),
        cache.clone(),
        queues.clone(),
        store.clone(),
        coordinator_config,
    ));
    handles.push(spawn_watch(coordinator, store.clone(), resync_interval, token.clone()));

    let runner = Arc::new(CheckRunner::new(
        store.clone(),
        cache.clone(),
        store.clone(),
        registry,
    ));
    handles.push(spawn_watch(runner, store.clone(), resync_interval, token.clone()));

    // 4. Reporter
    if config.report_interval_seconds > 0 {
        let reporter = Reporter::new(
            cache.clone(),
            queues.clone(),
            ReporterConfig {
                interval: Duration::from_secs(config.report_interval_seconds),
            },
        );
        let reporter_token = token.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = reporter.run(reporter_token).await {
                error!("Reporter error: {}", e);
            }
        }));
    }

    info!(data_dir = %data_dir.display(), "All components started");

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| miette::miette!("Failed to listen for ctrl-c: {}", e))?;

    info!("Shutting down gracefully...");
    token.cancel();

    let shutdown_timeout = Duration::from_secs(config.shutdown_timeout_seconds);
    let joined = tokio::time::timeout(shutdown_timeout, async {
        for handle in handles {
            let _ = handle.await;
        }
    })
    .await;
    if joined.is_err() {
        error!("Shutdown timed out after {:?}", shutdown_timeout);
    }

    info!("Shutdown complete");
    Ok(())
}

/// Run `handler` on the watch bus in its own task
fn spawn_watch<H>(
    handler: Arc<H>,
    store: Arc<ObjectStore>,
    tick_every: Duration,
    token: CancellationToken,
) -> JoinHandle<()>
where
    H: EventHandler + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = run_watch(handler.as_ref(), &store, tick_every, token).await {
            error!(worker = handler.name(), "Watch error: {}", e);
        }
    })
}
