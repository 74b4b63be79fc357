use std::sync::Arc;

use anyhow::Context;
use crystal_core::config::CoreConfig;
use crystal_engine::{
    DryRunInstaller, EngineApiBuilder, EngineServiceConfig, FilterInstaller, HttpFilterInstaller,
    MemoryStore, MetricStreamListener, MonitorSettings, PgStore, PolicyService, PolicyStore,
    StoreTenantDirectory,
};
use crystal_rules::DslParser;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = CoreConfig::from_env().context("failed to load engine configuration")?;
    if let Err(err) = crystal_core::logging::init_tracing(&config) {
        eprintln!("⚠️ failed to initialise tracing: {err}");
    }

    let store: Arc<dyn PolicyStore> = match config.database_url() {
        Some(_) => Arc::new(
            PgStore::from_config(&config)
                .await
                .context("failed to open the policy store")?,
        ),
        None => {
            warn!("DATABASE_URL not set, policies are kept in memory and lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    let installer: Arc<dyn FilterInstaller> = match &config.filter_api_url {
        Some(url) => Arc::new(
            HttpFilterInstaller::new(url, config.auth_token.clone())
                .context("invalid filter service url")?,
        ),
        None => {
            warn!("no filter service configured, filter actions are only logged");
            Arc::new(DryRunInstaller)
        }
    };

    let service = PolicyService::new(
        store.clone(),
        Arc::new(StoreTenantDirectory::new(store)),
        installer,
        Arc::new(DslParser::new()),
        MonitorSettings::from_config(&config),
    );

    let report = service.reload().await.context("failed to restore dynamic policies")?;
    for failure in &report.failed {
        error!(key = %failure.key, reason = %failure.reason, "dynamic policy left without a monitor");
    }

    let service_config = EngineServiceConfig::from_core(&config);
    let metrics_shutdown = match &service_config.metrics_bind {
        Some(address) => {
            let listener = MetricStreamListener::bind(address, service.fanout().clone())
                .await
                .context("failed to bind metric listener")?;
            Some(listener.spawn())
        }
        None => None,
    };

    let server_shutdown = EngineApiBuilder::new(service.clone())
        .serve(service_config)
        .await?;

    shutdown_signal().await;
    info!("shutting down crystal engine");

    if let Some(tx) = metrics_shutdown {
        let _ = tx.send(());
    }
    let _ = server_shutdown.send(());
    service.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sigterm) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
