use std::sync::Arc;

use clap::Parser;
use connector_sync::cli::{require_found, Cli, Commands};
use connector_sync::config::{RecoveryConfig, StoreBackend, StoreConfig};
use connector_sync::postgres::PgConnectorStore;
use connector_sync::sqlite::SqliteConnectorStore;
use connector_sync::ConnectorSyncService;
use serde::Serialize;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    connector_sync::telemetry::init_from_env()?;
    let cli = Cli::parse();

    let store_cfg = match cli.database_url {
        Some(url) => {
            let cfg = StoreConfig::new(url);
            cfg.validate()?;
            cfg
        }
        None => StoreConfig::from_env()?,
    };
    let recovery = RecoveryConfig::from_env();

    if let Commands::Migrate = cli.command {
        match store_cfg.backend() {
            Some(StoreBackend::Postgres) => {
                PgConnectorStore::connect(&store_cfg, recovery)
                    .await?
                    .migrate()
                    .await?;
            }
            // Schema is applied on connect.
            Some(StoreBackend::Sqlite) | None => {
                SqliteConnectorStore::connect(&store_cfg, recovery).await?;
            }
        }
        tracing::info!("connector sync schema applied");
        return Ok(());
    }

    let svc = connect_service(&store_cfg, recovery).await?;
    match cli.command {
        Commands::Migrate => {}
        Commands::State { tenant, connector } => {
            print_json(&svc.get_connector_sync_state(tenant, &connector).await?)?;
        }
        Commands::Due { tenant, limit } => {
            print_json(&svc.list_due_connector_errors(tenant, limit).await?)?;
        }
        Commands::DeadLetter { tenant, limit } => {
            print_json(&svc.list_dead_letter_errors(tenant, limit).await?)?;
        }
        Commands::Retry { tenant, id } => {
            let record = require_found(svc.retry_dead_letter_error(tenant, id).await?, || {
                format!("dead-lettered error {id} for tenant {tenant}")
            })?;
            print_json(&record)?;
        }
        Commands::Resolve {
            tenant,
            id,
            connector,
        } => {
            if let Some(id) = id {
                let resolved = require_found(
                    svc.resolve_connector_error_by_id(tenant, id).await?,
                    || format!("connector error {id} for tenant {tenant}"),
                )?;
                print_json(&serde_json::json!({ "resolved": resolved }))?;
            } else if let Some(connector) = connector {
                let resolved = svc.resolve_connector_errors(tenant, &connector).await?;
                print_json(&serde_json::json!({ "resolved": resolved }))?;
            }
        }
        Commands::Summary { tenant } => {
            print_json(&svc.summarize_connector_errors(tenant).await?)?;
        }
    }
    Ok(())
}

async fn connect_service(
    store_cfg: &StoreConfig,
    recovery: RecoveryConfig,
) -> anyhow::Result<ConnectorSyncService> {
    let svc = match store_cfg.backend() {
        Some(StoreBackend::Postgres) => {
            let store = PgConnectorStore::connect(store_cfg, recovery).await?;
            ConnectorSyncService::from_store(Arc::new(store))
        }
        Some(StoreBackend::Sqlite) => {
            let store = SqliteConnectorStore::connect(store_cfg, recovery).await?;
            ConnectorSyncService::from_store(Arc::new(store))
        }
        None => anyhow::bail!("unsupported database url: {}", store_cfg.url),
    };
    Ok(svc)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
