//! icarium daemon

use anyhow::Context;
use clap::Parser;
use icarium_builder::{BuildPipeline, ProcessRunner};
use icarium_db::{
    PgCredentialStore, PgRepositoryStore, create_lazy_pool, create_pool, run_migrations,
};
use icarium_scheduler::{BuildService, DispatchOutcome, Dispatcher, PgMessageQueue};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command, LogFormat};

/// How long a store or queue query waits for a connection before failing.
const DB_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = cli.system_config().context("failed to load configuration")?;
    let database_url = config
        .database
        .url
        .clone()
        .context("no database URL configured (set DATABASE_URL or database.url)")?;

    if cli.command == Some(Command::Migrate) {
        info!("Connecting to database...");
        let pool = create_pool(&database_url).await?;
        run_migrations(&pool).await?;
        info!("Migrations applied");
        return Ok(ExitCode::SUCCESS);
    }

    // Connection failures count as queue read failures from here on.
    let pool = create_lazy_pool(&database_url, DB_ACQUIRE_TIMEOUT)
        .context("invalid database URL")?;

    let pipeline = BuildPipeline::new(config.builder.clone(), Arc::new(ProcessRunner))
        .with_timeout(config.dispatcher.build_timeout);
    let service = BuildService::new(
        Arc::new(PgRepositoryStore::new(pool.clone())),
        Arc::new(PgCredentialStore::new(pool.clone())),
        pipeline,
    );
    let dispatcher = Dispatcher::new(
        Arc::new(PgMessageQueue::new(pool)),
        Arc::new(service),
        &config.queue,
        config.dispatcher.clone(),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    match dispatcher.run(shutdown).await {
        DispatchOutcome::Shutdown => Ok(ExitCode::SUCCESS),
        DispatchOutcome::ReadFailuresExhausted { attempts } => {
            error!(attempts, "Giving up after repeated queue read failures");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
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
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received, draining builds");
    shutdown.cancel();
}
