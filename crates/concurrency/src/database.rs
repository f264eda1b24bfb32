//! Database handle and configuration via `rywdb.toml`
//!
//! A [`Database`] wraps a [`TransactionFactory`] and hands out
//! [`ReadYourWritesTransaction`]s that start from the database's default
//! options, limits, retry policy and registered special key modules.
//!
//! Defaults come from a [`DatabaseConfig`], which can be loaded from a TOML
//! file. Missing fields take their default values.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;
use rywdb_core::{Error, KeyRange, Limits, Result, TransactionFactory};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::options::{TransactionOption, TransactionOptions};
use crate::retry::RetryPolicy;
use crate::special_keys::{SpecialKeyRouter, SpecialKeyWriteModule};
use crate::transaction::{ReadYourWritesTransaction, SessionConfig};

/// Config file name conventionally used for database settings.
pub const CONFIG_FILE_NAME: &str = "rywdb.toml";

/// Database configuration loaded from `rywdb.toml`.
///
/// # Example
///
/// ```toml
/// transaction_timeout_ms = 5000
/// transaction_retry_limit = 10
///
/// [retry]
/// base_delay_ms = 10
/// max_delay_ms = 1000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Default transaction timeout in milliseconds; 0 disables
    pub transaction_timeout_ms: i64,
    /// Default retry limit; -1 means unlimited
    pub transaction_retry_limit: i64,
    /// Cap on the retry backoff in milliseconds; unset defers to `retry.max_delay_ms`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_max_retry_delay_ms: Option<i64>,
    /// Whether snapshot reads see the transaction's own writes
    pub snapshot_ryw_enabled: bool,
    /// Key, value and transaction size limits
    pub limits: Limits,
    /// Backoff used by `on_error`
    pub retry: RetryPolicy,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            transaction_timeout_ms: 0,
            transaction_retry_limit: -1,
            transaction_max_retry_delay_ms: None,
            snapshot_ryw_enabled: true,
            limits: Limits::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl DatabaseConfig {
    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# rywdb database configuration
#
# Default transaction timeout in milliseconds (0 = no timeout)
transaction_timeout_ms = 0

# Default number of retries granted by on_error (-1 = unlimited)
transaction_retry_limit = -1

# Cap on the backoff between retries, in milliseconds (unset = retry.max_delay_ms)
# transaction_max_retry_delay_ms = 1000

# Snapshot reads see the transaction's own writes
snapshot_ryw_enabled = true

[limits]
max_key_bytes = 10000
max_system_key_bytes = 30000
max_value_bytes = 100000
max_transaction_bytes = 10000000

[retry]
base_delay_ms = 10
max_delay_ms = 1000
version_error_delay_ms = 10
jitter = true
"#
    }

    /// Parse config from TOML text and validate it.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: DatabaseConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.transaction_options()?;
        Ok(config)
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("{} ({})", msg, path.display())),
            other => other,
        })
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                Error::Config(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            Error::Config(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }

    /// Options every new transaction starts with
    pub fn default_options(&self) -> Vec<TransactionOption> {
        let mut options = Vec::new();
        if self.transaction_timeout_ms != 0 {
            options.push(TransactionOption::Timeout(self.transaction_timeout_ms));
        }
        if self.transaction_retry_limit != -1 {
            options.push(TransactionOption::RetryLimit(self.transaction_retry_limit));
        }
        if let Some(ms) = self.transaction_max_retry_delay_ms {
            options.push(TransactionOption::MaxRetryDelay(ms));
        }
        if !self.snapshot_ryw_enabled {
            options.push(TransactionOption::SnapshotRywDisable);
        }
        options
    }

    /// Default options folded into their effective state
    pub fn transaction_options(&self) -> Result<TransactionOptions> {
        TransactionOptions::from_options(&self.default_options())
            .map_err(|e| Error::Config(format!("Invalid transaction defaults: {}", e)))
    }
}

/// Boxed future returned by a [`Database::transact`] body
pub type TransactFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Source of read-your-writes transactions
pub struct Database<F: TransactionFactory> {
    factory: F,
    config: DatabaseConfig,
    base_options: TransactionOptions,
    modules: RwLock<Vec<Arc<dyn SpecialKeyWriteModule>>>,
}

impl<F: TransactionFactory> Database<F> {
    /// Database with default configuration
    pub fn new(factory: F) -> Self {
        Database {
            factory,
            config: DatabaseConfig::default(),
            base_options: TransactionOptions::default(),
            modules: RwLock::new(Vec::new()),
        }
    }

    /// Database with the given configuration
    pub fn with_config(factory: F, config: DatabaseConfig) -> Result<Self> {
        let base_options = config.transaction_options()?;
        Ok(Database {
            factory,
            config,
            base_options,
            modules: RwLock::new(Vec::new()),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Register a special key write module
    ///
    /// Transactions created afterwards route reads and writes of the module's
    /// range to it.
    pub fn register_special_key_module(&self, module: Arc<dyn SpecialKeyWriteModule>) -> Result<()> {
        let mut modules = self.modules.write();
        let router = SpecialKeyRouter::new(modules.iter().map(|m| m.range()));
        let range: KeyRange = module.range();
        router.check_registration(&range)?;
        debug!(%range, "Registered special key module");
        modules.push(module);
        Ok(())
    }

    /// Create a transaction
    pub fn create_transaction(&self) -> ReadYourWritesTransaction<F::Native> {
        let config = SessionConfig {
            limits: self.config.limits.clone(),
            retry: self.config.retry.clone(),
            base_options: self.base_options.clone(),
            modules: self.modules.read().clone(),
        };
        ReadYourWritesTransaction::with_config(self.factory.create_transaction(), config)
    }

    /// Run `body` in a transaction, committing and retrying until it succeeds
    ///
    /// Errors `on_error` does not retry are returned to the caller.
    ///
    /// # Example
    /// ```ignore
    /// db.transact(|tr| Box::pin(async move {
    ///     tr.set("k", "v")?;
    ///     Ok(())
    /// })).await?;
    /// ```
    pub async fn transact<T, B>(&self, mut body: B) -> Result<T>
    where
        B: for<'a> FnMut(&'a ReadYourWritesTransaction<F::Native>) -> TransactFuture<'a, T>,
    {
        let tr = self.create_transaction();
        loop {
            let attempt = match body(&tr).await {
                Ok(value) => tr.commit().await.map(|_| value),
                Err(e) => Err(e),
            };
            match attempt {
                Ok(value) => return Ok(value),
                Err(e) => tr.on_error(e).await?,
            }
        }
    }
}
