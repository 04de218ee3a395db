//! Database connection management with lazy initialization.

use std::sync::LazyLock;

use ingest_core::config::Env;
use surrealdb::Surreal;
use surrealdb::engine::any::{Any, connect};
use surrealdb::opt::auth::Root;
use thiserror::Error;
use tokio::sync::OnceCell;

/// Global database instance using lazy initialization.
static DB: LazyLock<OnceCell<Surreal<Any>>> = LazyLock::new(OnceCell::new);

/// Database connection wrapper.
pub type Database = Surreal<Any>;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Connection endpoint: "mem://", "rocksdb://path" or a remote "ws://host:port"
    pub endpoint: String,
    pub namespace: String,
    pub database: String,
    /// Optional root credentials for authentication
    pub credentials: Option<(String, String)>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            endpoint: "mem://".to_string(),
            namespace: "ingest".to_string(),
            database: "main".to_string(),
            credentials: None,
        }
    }
}

impl DbConfig {
    /// Create a config for in-memory testing.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Read `INGEST_LEDGER_*` variables, falling back to defaults.
    ///
    /// `INGEST_LEDGER_ENDPOINT` takes any engine address, e.g.
    /// `rocksdb://data/ledger` (with the `rocksdb` feature).
    pub fn from_env(env: &Env) -> Self {
        let mut cfg = match env.string("INGEST_LEDGER_ENDPOINT") {
            Some(endpoint) => Self {
                endpoint,
                ..Self::default()
            },
            None => Self::memory(),
        };

        if let Some(namespace) = env.string("INGEST_LEDGER_NAMESPACE") {
            cfg = cfg.with_namespace(namespace);
        }
        if let Some(database) = env.string("INGEST_LEDGER_DATABASE") {
            cfg = cfg.with_database(database);
        }
        if let (Some(user), Some(pass)) = (
            env.string("INGEST_LEDGER_USER"),
            env.string("INGEST_LEDGER_PASSWORD"),
        ) {
            cfg = cfg.with_credentials(user, pass);
        }
        cfg
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }
}

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Database not initialized - call init_db first")]
    NotInitialized,
    #[error("Connection error: {0}")]
    Connection(#[from] surrealdb::Error),
    #[error("Query error: {0}")]
    Query(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Initialize the database connection.
///
/// Later calls return the connection made by the first one.
pub async fn init_db(config: DbConfig) -> Result<&'static Database, DbError> {
    DB.get_or_try_init(|| async {
        tracing::info!(endpoint = %config.endpoint, "Connecting to ledger database");

        let db = connect(&config.endpoint).await?;

        if let Some((username, password)) = &config.credentials {
            db.signin(Root { username, password }).await?;
        }

        db.use_ns(&config.namespace).use_db(&config.database).await?;

        tracing::info!(
            namespace = %config.namespace,
            database = %config.database,
            "Connected to ledger database"
        );

        Ok(db)
    })
    .await
}

/// Get the database connection.
pub fn get_db() -> Result<&'static Database, DbError> {
    DB.get().ok_or(DbError::NotInitialized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_defaults() {
        let env = Env::from_pairs([
            ("INGEST_LEDGER_ENDPOINT", "ws://ledger:8000"),
            ("INGEST_LEDGER_NAMESPACE", "results"),
            ("INGEST_LEDGER_USER", "root"),
        ]);
        let cfg = DbConfig::from_env(&env);
        assert_eq!(cfg.endpoint, "ws://ledger:8000");
        assert_eq!(cfg.namespace, "results");
        assert_eq!(cfg.database, "main");
        // A user without a password is ignored.
        assert!(cfg.credentials.is_none());
    }

    #[test]
    fn unset_env_is_the_memory_engine_with_full_credentials_kept() {
        let cfg = DbConfig::from_env(&Env::from_pairs([
            ("INGEST_LEDGER_DATABASE", "ledger"),
            ("INGEST_LEDGER_USER", "root"),
            ("INGEST_LEDGER_PASSWORD", "secret"),
        ]));
        assert_eq!(cfg.endpoint, "mem://");
        assert_eq!(cfg.namespace, "ingest");
        assert_eq!(cfg.database, "ledger");
        assert_eq!(cfg.credentials, Some(("root".to_string(), "secret".to_string())));
    }
}
