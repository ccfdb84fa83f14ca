use clap::{Args, Parser};
use docapi::DocApiError;
use docapi::documents::DocumentService;
use rotation::cosmos::CosmosDriver;
use rotation::database::DatabaseError;
use rotation::secrets::{self, SecretError};
use rotation::{RotationError, RotationService};
use shared::admin_service::{AdminError, AdminService, AdminStatus};
use shared::http::run_http_service;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

mod config;
mod logging;
mod statsd;

use config::{Config, ConfigError};

#[derive(Parser)]
#[command(name = "docgate", version, about = "Document REST API with live credential rotation")]
enum CliCommand {
    /// Serve the document API and the admin endpoints
    Run(ConfigArgs),
    /// Parse and validate a config file, then exit
    ValidateConfig(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long, short)]
    config: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum DocgateError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Metrics(#[from] statsd::MetricsError),
    #[error("secret store: {0}")]
    Secrets(#[from] SecretError),
    #[error("database driver: {0}")]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    Rotation(#[from] RotationError),
    #[error("document api: {0}")]
    Api(#[from] DocApiError),
    #[error("admin listener: {0}")]
    Admin(#[from] AdminError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn load_config(path: &std::path::Path) -> Result<Config, ConfigError> {
    let config = Config::from_file(path)?;
    config.validate()?;
    Ok(config)
}

fn main() -> Result<(), DocgateError> {
    let cli = CliCommand::parse();

    match cli {
        CliCommand::ValidateConfig(args) => {
            load_config(&args.config)?;
            println!("{}: ok", args.config.display());
            Ok(())
        }
        CliCommand::Run(args) => {
            let config = load_config(&args.config)?;
            // Sentry must be set up before the runtime starts its threads
            let _sentry = logging::init(&config.logging);

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            let result = runtime.block_on(run(config));
            if let Err(err) = &result {
                tracing::error!(error = %err, "docgate exited with an error");
            }
            result
        }
    }
}

async fn run(config: Config) -> Result<(), DocgateError> {
    if let Some(metrics_config) = &config.metrics {
        statsd::init(metrics_config)?;
    }

    let store = secrets::get_store(config.secret_store())?;
    let driver = Arc::new(CosmosDriver::new(config.request_timeout())?);
    let rotation = RotationService::start(&config.rotation, store, driver).await?;
    tracing::info!(generation = rotation.generation(), "credential rotation started");

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("received ctrl-c, shutting down"),
            Err(err) => {
                tracing::error!(error = %err, "cannot listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        }
        let _ = shutdown_tx.send(());
    });

    let documents = DocumentService::new(
        rotation.policy().clone(),
        config.rotation.database.partition_key_field.clone(),
    );
    let api = docapi::serve(
        &config.listener.host,
        config.listener.port,
        documents,
        shutdown_signal(shutdown_rx.clone()),
    );

    let status = rotation.clone();
    let admin = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        AdminService::new(move || AdminStatus {
            ready: status.is_ready(),
            generation: status.generation(),
        }),
        shutdown_signal(shutdown_rx),
    );

    let served = tokio::try_join!(
        async { api.await.map_err(DocgateError::from) },
        async { admin.await.map_err(DocgateError::from) },
    );
    rotation.shutdown().await;
    served?;

    Ok(())
}

fn shutdown_signal(mut rx: watch::Receiver<()>) -> impl Future<Output = ()> + Send + 'static {
    async move {
        let _ = rx.changed().await;
    }
}
