//! `lastseen-daemon` -- adaptive entity health monitor.
//!
//! Learns how often each entity reports, classifies it as ok, late or
//! stale, and persists what it learned. State changes and commands arrive
//! as JSON lines on stdin; command responses go to stdout. Configuration
//! is read from the environment (see [`DaemonConfig::from_env`]).

use std::sync::Arc;
use std::time::Duration;

use lastseen_daemon::config::{DaemonConfig, LogFormat};
use lastseen_daemon::{ingest, logbook};
use lastseen_engine::guardian::{Guardian, GuardianOptions};
use lastseen_engine::notifier::{NotificationManager, TracingSink};
use lastseen_engine::panel::{register_panel, LoggingRegistrar, PanelDescriptor};
use lastseen_engine::registry::{EntityRegistry, FileRegistry};
use lastseen_engine::storage::JsonFileStore;
use lastseen_engine::CommandRouter;
use lastseen_events::EventBus;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long each background task gets to finish after shutdown starts.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = DaemonConfig::from_env()?;
    init_tracing(config.log_format);

    tracing::info!(
        store_path = %config.store_path.display(),
        profile = %config.profile,
        max_entities = config.limits.max_entities,
        debounce_secs = config.persistence.debounce.as_secs(),
        "Starting lastseen-daemon",
    );

    let bus = Arc::new(EventBus::default());
    let registry = config.registry_path.as_ref().map(|path| {
        tracing::info!(path = %path.display(), "Using file entity registry");
        Arc::new(FileRegistry::new(path)) as Arc<dyn EntityRegistry>
    });

    let options = GuardianOptions {
        limits: config.limits,
        persistence: config.persistence,
        diagnostics_dir: config.diagnostics_dir.clone(),
        registry,
        ..GuardianOptions::default()
    };
    let store = Arc::new(JsonFileStore::new(&config.store_path));
    let guardian = Guardian::load(store, bus.clone(), options).await;

    let cancel = CancellationToken::new();
    let (handle, guardian_task) = guardian.spawn(cancel.clone());

    let logbook_task = tokio::spawn(logbook::run(bus.subscribe(), cancel.child_token()));
    let notifier = NotificationManager::new(handle.clone(), Arc::new(TracingSink))
        .with_events(bus.subscribe());
    let notifier_task = tokio::spawn(notifier.run(cancel.child_token()));

    if let Some(dir) = &config.panel_dir {
        match register_panel(&LoggingRegistrar, &PanelDescriptor::new(dir)).await {
            Ok(strategy) => tracing::info!(?strategy, "Panel registered"),
            Err(e) => tracing::warn!(error = %e, "Panel not available, core functionality unaffected"),
        }
    }

    let router = CommandRouter::new(handle.clone());
    let connection_id = uuid::Uuid::new_v4().to_string();
    let ingest_task = tokio::spawn(ingest::run(
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        bus.clone(),
        handle.clone(),
        router,
        connection_id,
        cancel.child_token(),
    ));

    shutdown_signal().await;

    // --- Shutdown ---
    cancel.cancel();
    for (name, task) in [
        ("logbook", logbook_task),
        ("notifier", notifier_task),
    ] {
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await.is_err() {
            tracing::warn!(task = name, "Task did not stop in time");
        }
    }

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, ingest_task).await {
        Ok(Ok(Ok(stats))) => tracing::info!(
            events = stats.events,
            commands = stats.commands,
            rejected = stats.rejected,
            "Ingest stopped"
        ),
        Ok(Ok(Err(e))) => tracing::error!(error = %e, "Ingest failed"),
        Ok(Err(e)) => tracing::error!(error = %e, "Ingest task panicked"),
        Err(_) => tracing::warn!(task = "ingest", "Task did not stop in time"),
    }

    // The guardian flushes once more before its task ends.
    drop(handle);
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, guardian_task).await {
        Ok(Ok(())) => tracing::info!("Guardian stopped"),
        Ok(Err(e)) => tracing::error!(error = %e, "Guardian task failed"),
        Err(_) => tracing::error!("Guardian did not stop in time, last changes may be lost"),
    }

    tracing::info!("Graceful shutdown complete");

    // A pending blocking stdin read would otherwise keep the runtime alive.
    std::process::exit(0)
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "lastseen_daemon=info,lastseen_engine=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Wait for SIGINT (Ctrl-C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
