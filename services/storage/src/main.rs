use album_pipeline::config::MailTransportKind;
use album_pipeline::notify::{
    EmailTransport, LogTransport, NotificationDispatcher, NotificationTemplates, SesTransport,
};
use album_storage::change_feed::NotificationFeed;
use album_storage::change_stream::PgChangeListener;
use album_storage::config::Config;
use album_storage::ingress::{start_api_server, AppState};
use album_storage::metadata_store::{InMemoryMetadataStore, MetadataStore, PgMetadataStore};
use album_storage::topology::{Pipeline, Topology};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration; missing mail settings are fatal here
    let config = Config::load().context("Failed to load configuration")?;

    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Album Storage Service"
    );

    init_metrics(config.service.metrics_port)?;

    let shutdown = CancellationToken::new();
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    let topology = Arc::new(Topology::build(&config.queues));

    // Metadata store and the source of its change stream
    let store: Arc<dyn MetadataStore> = match config.database.url {
        Some(_) => {
            let store = PgMetadataStore::connect(&config.database)
                .await
                .context("Failed to initialize metadata store")?;

            if config.database.run_migrations {
                store
                    .run_migrations()
                    .await
                    .context("Failed to run database migrations")?;
            }

            let listener = PgChangeListener::new(store.pool().clone(), topology.changes.clone());
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move { listener.run(token).await }));

            Arc::new(store)
        }
        None => {
            warn!("No database configured, keeping metadata in memory");
            Arc::new(InMemoryMetadataStore::new().with_change_stream(topology.changes.clone()))
        }
    };

    let transport: Arc<dyn EmailTransport> = match config.mail.transport {
        MailTransportKind::Ses => Arc::new(SesTransport::new(&config.mail).await),
        MailTransportKind::Log => Arc::new(LogTransport::new()),
    };
    let dispatcher = Arc::new(NotificationDispatcher::from_config(transport, &config.mail));
    let templates = NotificationTemplates::from_config(&config.mail);

    let pipeline = Pipeline::new(
        topology.clone(),
        store.clone(),
        dispatcher,
        templates,
        &config.queues,
        &config.records,
    )
    .context("Failed to build pipeline")?;

    handles.extend(pipeline.spawn(&shutdown));

    // Optional Kafka ingress
    if let Some(ref kafka) = config.kafka {
        let feed = NotificationFeed::new(kafka, pipeline.publisher.clone())
            .context("Failed to initialize Kafka notification feed")?;
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = feed.run(token).await {
                error!(error = %e, "Kafka notification feed error");
            }
        }));
    }

    let api_state = AppState {
        publisher: pipeline.publisher.clone(),
        store,
        topology,
    };
    let api_config = config.api.clone();
    let token = shutdown.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, token).await {
            error!(error = %e, "API server error");
        }
    }));

    info!("Storage service started successfully");

    shutdown_signal().await;

    info!("Shutting down storage service");

    shutdown.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Task ended abnormally");
        }
    }

    info!("Storage service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
