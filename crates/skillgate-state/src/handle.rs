//! SurrealDB connection setup
//!
//! Supports in-memory (`mem://`), embedded durable (`surrealkv://<path>`) and
//! remote (`ws://`, `wss://`) endpoints through the `any` engine.

use std::path::Path;

use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::{info, instrument};

use crate::error::StateError;
use crate::migrations;
use crate::Result;

fn default_url() -> String {
    "surrealkv://.skillgate/db".to_string()
}

fn default_namespace() -> String {
    "skillgate".to_string()
}

fn default_database() -> String {
    "governance".to_string()
}

/// Connection settings for the governance database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Endpoint URL (`mem://`, `surrealkv://path`, `ws://host:port`, ...)
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_database")]
    pub database: String,
    /// Credentials for remote endpoints.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Whether the credentials belong to a root user (true) or database user (false)
    #[serde(default)]
    pub is_root: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            namespace: default_namespace(),
            database: default_database(),
            username: None,
            password: None,
            is_root: false,
        }
    }
}

impl StoreConfig {
    /// Volatile in-process database.
    pub fn in_memory() -> Self {
        Self {
            url: "mem://".to_string(),
            ..Self::default()
        }
    }

    /// Durable embedded database rooted at `path`.
    pub fn embedded(path: impl AsRef<Path>) -> Self {
        Self {
            url: format!("surrealkv://{}", path.as_ref().display()),
            ..Self::default()
        }
    }

    /// Apply environment overrides.
    ///
    /// Reads:
    /// - SKILLGATE_STORE_URL
    /// - SKILLGATE_STORE_NAMESPACE
    /// - SKILLGATE_STORE_DATABASE
    /// - SKILLGATE_STORE_USERNAME / SKILLGATE_STORE_PASSWORD
    /// - SKILLGATE_STORE_ROOT ("true" for root users)
    pub fn apply_env(mut self) -> Self {
        if let Ok(url) = std::env::var("SKILLGATE_STORE_URL") {
            self.url = url;
        }
        if let Ok(ns) = std::env::var("SKILLGATE_STORE_NAMESPACE") {
            self.namespace = ns;
        }
        if let Ok(db) = std::env::var("SKILLGATE_STORE_DATABASE") {
            self.database = db;
        }
        if let Ok(user) = std::env::var("SKILLGATE_STORE_USERNAME") {
            self.username = Some(user);
        }
        if let Ok(pass) = std::env::var("SKILLGATE_STORE_PASSWORD") {
            self.password = Some(pass);
        }
        if let Ok(root) = std::env::var("SKILLGATE_STORE_ROOT") {
            self.is_root = root.eq_ignore_ascii_case("true");
        }
        self
    }
}

/// Open a connection, authenticate if credentials are configured, select the
/// namespace/database and initialize the schema.
#[instrument(skip(config), fields(url = %config.url, namespace = %config.namespace, database = %config.database))]
pub async fn connect(config: &StoreConfig) -> Result<Surreal<Any>> {
    if let Some(path) = config.url.strip_prefix("surrealkv://") {
        std::fs::create_dir_all(path).map_err(|e| {
            StateError::Connection(format!(
                "Failed to create database directory {}: {}",
                path, e
            ))
        })?;
    }

    let db = surrealdb::engine::any::connect(config.url.as_str())
        .await
        .map_err(|e| StateError::Connection(format!("Failed to connect to {}: {}", config.url, e)))?;

    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        if config.is_root {
            db.signin(Root { username, password })
                .await
                .map_err(|e| StateError::Connection(format!("Root authentication failed: {e}")))?;
        } else {
            db.signin(Database {
                namespace: &config.namespace,
                database: &config.database,
                username,
                password,
            })
            .await
            .map_err(|e| StateError::Connection(format!("Database authentication failed: {e}")))?;
        }
    }

    db.use_ns(config.namespace.as_str())
        .use_db(config.database.as_str())
        .await
        .map_err(|e| StateError::Connection(format!("Failed to select namespace/database: {e}")))?;

    migrations::init_schema(&db).await?;

    info!("Governance database connected and schema initialized");
    Ok(db)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_durable() {
        let cfg = StoreConfig::default();
        assert!(cfg.url.starts_with("surrealkv://"));
        assert_eq!(cfg.namespace, "skillgate");
    }

    #[test]
    fn test_embedded_url() {
        let cfg = StoreConfig::embedded("/tmp/sg");
        assert_eq!(cfg.url, "surrealkv:///tmp/sg");
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let cfg: StoreConfig = serde_json::from_str(r#"{"url": "mem://"}"#).unwrap();
        assert_eq!(cfg.url, "mem://");
        assert_eq!(cfg.database, "governance");
        assert!(cfg.username.is_none());
    }
}
