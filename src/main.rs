// qserv-core entry point.
//
// Loads configuration, initializes structured logging, and starts the
// subsystem selected by --role. Each role owns its own Tokio runtime
// task set; this binary's job is wiring them up, not running them.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{info, warn};

use qserv_core::config::Config;
use qserv_core::controller::Controller;
use qserv_core::czar::CzarManagementServer;
use qserv_core::querymgmt::WorkerQueryManagement;
use qserv_core::registry::server::RegistryServer;
use qserv_core::registry::RegistryState;
use qserv_core::scheduler::{Examiner, Lane, LaneName, Scheduler};
use qserv_core::stats::Stats;
use qserv_core::transport::TcpTransport;
use qserv_core::Result;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Role {
    Czar,
    Worker,
    Registry,
    Controller,
}

#[derive(Debug, Parser)]
#[command(name = "qserv-core", version)]
struct Cli {
    /// Which subsystem this process runs.
    #[arg(long, value_enum)]
    role: Role,

    /// Path to a TOML configuration file. Missing file falls back to
    /// documented defaults.
    #[arg(long, default_value = "qserv.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        Config::from_file(&cli.config)?
    } else {
        info!(path = %cli.config.display(), "no config file found, using defaults");
        Config::default()
    };

    info!(role = ?cli.role, "starting qserv-core");

    match cli.role {
        Role::Registry => run_registry(&config).await,
        Role::Czar => run_czar(&config).await,
        Role::Worker => run_worker(&config).await,
        Role::Controller => run_controller(&config).await,
    }
}

async fn run_registry(config: &Config) -> Result<()> {
    let state = Arc::new(RegistryState::new());
    let server = RegistryServer::with_security(state, config.registry.security_context());
    let addr: SocketAddr = format!("{}:{}", config.registry.host, config.registry.port)
        .parse()
        .map_err(|e| qserv_core::Error::Config(format!("invalid registry bind address: {e}")))?;

    info!(%addr, "registry HTTP service listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        server.router().into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// Czar process: owns a [`Controller`] driving worker-bound operations
/// over real TCP connections, and serves the `/query` control-plane
/// endpoint alongside a directory workers register against directly
/// (the czar's own colocated registry routes stand in for polling a
/// separately-run registry service, which would otherwise need an HTTP
/// client dependency this crate doesn't carry).
async fn run_czar(config: &Config) -> Result<()> {
    let directory = Arc::new(RegistryState::new());
    let query_client: Arc<dyn WorkerQueryManagement> =
        Controller::new(|worker_name: &str| TcpTransport::new(worker_name.to_string()));

    let registry_server = RegistryServer::with_security(directory.clone(), config.registry.security_context());
    let management_server = CzarManagementServer::new(query_client, directory);

    let addr: SocketAddr = format!("{}:{}", config.czar.management_host, config.czar.management_port)
        .parse()
        .map_err(|e| qserv_core::Error::Config(format!("invalid czar management bind address: {e}")))?;

    info!(%addr, czar = %config.czar.name, "czar management HTTP service listening");
    let router = management_server.router().merge(registry_server.router());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

/// Worker process: owns the scan-lane [`Scheduler`], its [`Stats`]
/// engine, and an [`Examiner`] tick that periodically sweeps dead
/// queries and boots overrunning tasks.
async fn run_worker(config: &Config) -> Result<()> {
    let lanes = vec![
        Lane::new(LaneName::VeryHigh, 4, 1.0),
        Lane::new(LaneName::High, 8, 5.0),
        Lane::new(LaneName::Normal, 16, 15.0),
        Lane::new(LaneName::Low, 16, 60.0),
        Lane::new(LaneName::Snail, 32, 240.0),
    ];
    let scheduler = Arc::new(Scheduler::new(lanes));
    let stats = Arc::new(Stats::new(Duration::from_secs(300), config.worker.required_tasks_completed));
    // Constructed here so it's ready for the task-execution surface that
    // drives examine()/boot() once this worker actually runs chunk
    // queries; the tick loop below already exercises the stats side.
    let _examiner = Examiner::new(stats.clone(), config.worker.max_tasks_booted);

    info!(
        svc_port = config.worker.svc_port,
        num_proc_threads = config.worker.num_proc_threads,
        "worker scheduler and examiner started"
    );

    if config.worker.examine_interval_sec == 0 {
        warn!("examine_interval_sec is 0, examiner tick loop disabled");
        std::future::pending::<()>().await;
        return Ok(());
    }

    let tick = Duration::from_secs(config.worker.examine_interval_sec);
    loop {
        tokio::time::sleep(tick).await;
        stats.sweep_newly_dead();
        for query_id in stats.remove_dead() {
            scheduler.remove_query_from(query_id, None);
            info!(query_id, "retired dead query from scheduler and stats");
        }
    }
}

/// Replication controller process: owns a [`Controller`] and keeps it
/// alive, logging how many requests are in flight on each heartbeat.
async fn run_controller(config: &Config) -> Result<()> {
    let controller = Controller::new(|worker_name: &str| TcpTransport::new(worker_name.to_string()));
    let tick = Duration::from_secs(config.controller.job_heartbeat_sec.max(1));

    info!(num_threads = config.controller.num_threads, "replication controller started");
    loop {
        tokio::time::sleep(tick).await;
        info!(in_flight = controller.in_flight(), "replication controller heartbeat");
    }
}
