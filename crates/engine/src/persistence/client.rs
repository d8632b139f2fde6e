//! Store connection handling.
//!
//! `EngineStore` wraps one SurrealDB connection behind the `any`
//! engine, so the same code path serves `mem://` in tests and a
//! WebSocket endpoint in deployments. Record operations live next to
//! their record types; this module owns only connecting, schema
//! application and the health probe.

use std::sync::Arc;

use surrealdb::engine::any::Any;
use surrealdb::opt::auth::Root;
use surrealdb::Surreal;

use super::error::{from_surrealdb_error, PersistenceResult};

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Connection URL, `mem://` or `ws://host:port`.
    pub url: String,
    /// SurrealDB namespace.
    pub namespace: String,
    /// Database within the namespace.
    pub database: String,
    /// Root credentials; in-memory stores need none.
    pub credentials: Option<Credentials>,
}

/// Root sign-in for remote endpoints.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl StoreConfig {
    /// Create an in-memory configuration for testing.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            url: "mem://".to_string(),
            namespace: "muster".to_string(),
            database: "test".to_string(),
            credentials: None,
        }
    }

    /// Create a WebSocket configuration.
    #[must_use]
    pub fn websocket(host: &str, port: u16) -> Self {
        Self {
            url: format!("ws://{host}:{port}"),
            namespace: "muster".to_string(),
            database: "engine".to_string(),
            credentials: None,
        }
    }

    /// Set credentials for authentication.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Set the namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the database.
    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// Handle on the engine database. Cloning shares the connection, so
/// the same store can be handed to every worker.
#[derive(Debug, Clone)]
pub struct EngineStore {
    db: Arc<Surreal<Any>>,
    config: StoreConfig,
}

impl EngineStore {
    /// Connect, sign in when credentials are configured, and select
    /// the namespace/database pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or authentication fails.
    pub async fn connect(config: StoreConfig) -> PersistenceResult<Self> {
        let db = Surreal::<Any>::init();

        db.connect(&config.url)
            .await
            .map_err(from_surrealdb_error)?;

        if let Some(creds) = &config.credentials {
            db.signin(Root {
                username: &creds.username,
                password: &creds.password,
            })
            .await
            .map_err(from_surrealdb_error)?;
        }

        db.use_ns(&config.namespace)
            .use_db(&config.database)
            .await
            .map_err(from_surrealdb_error)?;

        Ok(Self {
            db: Arc::new(db),
            config,
        })
    }

    /// The raw client, for the record modules' `impl EngineStore`
    /// blocks.
    #[must_use]
    pub fn db(&self) -> &Surreal<Any> {
        &self.db
    }

    /// The configuration this store was connected with.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Apply the table and index definitions. Idempotent; every
    /// definition carries `IF NOT EXISTS`.
    ///
    /// # Errors
    ///
    /// Returns an error if schema initialization fails.
    pub async fn initialize_schema(&self) -> PersistenceResult<()> {
        let schema = include_str!("schema.surql");

        self.db.query(schema).await.map_err(from_surrealdb_error)?;

        Ok(())
    }

    /// Probe the connection with a trivial query.
    ///
    /// # Errors
    ///
    /// Returns an error if the database does not answer.
    pub async fn health_check(&self) -> PersistenceResult<()> {
        self.db
            .query("INFO FOR DB")
            .await
            .map_err(from_surrealdb_error)?;

        Ok(())
    }
}
