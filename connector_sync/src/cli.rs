use crate::models::TenantId;
use crate::{Error, Result};
use clap::{ArgGroup, Parser, Subcommand};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(
    name = "connector-sync",
    version,
    about = "Inspect and operate the connector sync error ledger"
)]
pub struct Cli {
    /// Store URL (`sqlite://...` or `postgres://...`).
    ///
    /// Falls back to DATABASE_URL when neither the flag nor the env var is set.
    #[arg(long, global = true, env = "CONNECTOR_SYNC_DATABASE_URL")]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create tables and indexes (idempotent).
    Migrate,

    /// Print the sync state row of one connector.
    State {
        #[arg(long)]
        tenant: TenantId,
        #[arg(long)]
        connector: String,
    },

    /// List ledger records whose retry time has passed.
    Due {
        #[arg(long)]
        tenant: TenantId,
        /// Clamped to 1..=500 (default 20).
        #[arg(long)]
        limit: Option<usize>,
    },

    /// List dead-lettered records, most recent first.
    DeadLetter {
        #[arg(long)]
        tenant: TenantId,
        /// Clamped to 1..=500 (default 50).
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Requeue a dead-lettered record with a fresh retry budget.
    Retry {
        #[arg(long)]
        tenant: TenantId,
        #[arg(long)]
        id: Uuid,
    },

    /// Resolve one record by id, or every active record of a connector.
    #[command(group(ArgGroup::new("target").required(true).args(["id", "connector"])))]
    Resolve {
        #[arg(long)]
        tenant: TenantId,
        #[arg(long)]
        id: Option<Uuid>,
        #[arg(long)]
        connector: Option<String>,
    },

    /// Per-status record counts for a tenant.
    Summary {
        #[arg(long)]
        tenant: TenantId,
    },
}

/// Treat an empty lookup as `Error::NotFound` so the command exits non-zero.
pub fn require_found<T>(value: Option<T>, what: impl FnOnce() -> String) -> Result<T> {
    value.ok_or_else(|| Error::NotFound(what()))
}
