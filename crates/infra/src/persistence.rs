//! Backend selection: Postgres when `TALLY_USE_POSTGRES=true`, otherwise the
//! caller keeps the in-memory stores.
//!
//! The pool connects lazily, so building the backend does no IO. Schema comes
//! from `crates/infra/migrations/`.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::info;

use crate::config::TallyConfig;
use crate::event_store::PostgresEventStore;
use crate::projections::{PostgresCursorStore, ReadModels};

const MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("DATABASE_URL must be set when TALLY_USE_POSTGRES=true")]
    MissingDatabaseUrl,

    #[error("invalid database url: {0}")]
    InvalidUrl(String),
}

/// Event store and projection cursors sharing one pool.
#[derive(Debug, Clone)]
pub struct PostgresBackend {
    pub events: PostgresEventStore,
    pub cursors: Arc<PostgresCursorStore>,
}

impl PostgresBackend {
    /// `Ok(None)` when the configuration selects the in-memory backend.
    pub fn from_config(config: &TallyConfig, runtime: Handle) -> Result<Option<Self>, BackendError> {
        if !config.use_postgres {
            return Ok(None);
        }
        let url = config.database_url.as_deref().ok_or(BackendError::MissingDatabaseUrl)?;

        let pool = {
            let _guard = runtime.enter();
            PgPoolOptions::new()
                .max_connections(MAX_CONNECTIONS)
                .connect_lazy(url)
                .map_err(|e| BackendError::InvalidUrl(e.to_string()))?
        };
        info!(max_connections = MAX_CONNECTIONS, "postgres backend configured");

        Ok(Some(Self {
            events: PostgresEventStore::new(pool.clone(), runtime.clone()),
            cursors: Arc::new(PostgresCursorStore::new(pool, runtime)),
        }))
    }

    /// Read models whose cursors live next to the events.
    pub fn read_models(&self) -> ReadModels {
        ReadModels::with_cursor_store(self.cursors.clone())
    }
}
