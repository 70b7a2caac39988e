//! TOML configuration file loading with environment variable overrides.
//!
//! Deserializes a [`Config`] from an optional TOML file using [Figment], merging
//! `TEMPLATEDB_CONFIG_*` environment variables on top.
//!
//! ## Priority chain
//!
//! | Priority | Source | Mechanism |
//! |----------|--------|-----------|
//! | 1 (highest) | `TEMPLATEDB_CONFIG_*` env vars | `merge`, always wins |
//! | 2 | TOML file values | `merge`, base configuration |
//! | 3 (lowest) | Serde defaults | missing keys only |
//!
//! ## Environment variables
//!
//! All env vars are prefixed with `TEMPLATEDB_CONFIG_` and use double underscores to separate
//! nested keys. For example, `TEMPLATEDB_CONFIG_POSTGRES__POOL_SIZE` maps to
//! `postgres.pool_size` in the config file.
//!
//! ## Example
//!
//! ```toml
//! backend = "integresql"
//!
//! [integresql]
//! base_url = "http://integresql:5000"
//! host_is_localhost = false
//! ```

use std::path::Path;

use figment::{
    Figment,
    providers::{Env, Format as _, Toml},
};
use template_postgres::{KEEP_TEMP_DIRS, PostgresOptions};

use crate::redacted::Redacted;

/// Prefix of environment variables overriding file values
pub const ENV_PREFIX: &str = "TEMPLATEDB_CONFIG_";

/// Default prefix of databases created on a local server
pub const DEFAULT_DATABASE_PREFIX: &str = "test_";

/// Default size of the admin connection pool
pub const DEFAULT_POOL_SIZE: u32 = 5;

/// Default IntegreSQL server address
pub const DEFAULT_INTEGRESQL_URL: &str = "http://localhost:5001";

/// Default IntegreSQL request timeout (in seconds)
pub const DEFAULT_TIMEOUT_SECS: u64 = 20;

/// Load a [`Config`] from an optional TOML file with env-var overrides.
///
/// A missing file is treated as empty. See the [module-level docs](self) for the priority chain.
pub fn load(config_path: Option<&Path>) -> Result<Config, LoadConfigFileError> {
    let mut figment = Figment::new();
    if let Some(path) = config_path {
        figment = figment.merge(Toml::file(path));
    }

    figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|err| LoadConfigFileError(Box::new(err)))
}

/// Strategy used to hold templates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Templates on a local PostgreSQL server
    #[default]
    Postgres,
    /// Templates managed by an IntegreSQL server
    Integresql,
}

/// Configuration of a database factory.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct Config {
    /// Strategy to use (default: `postgres`)
    #[serde(default)]
    pub backend: Backend,
    #[serde(default)]
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub integresql: IntegresqlConfig,
}

/// Settings of the local PostgreSQL strategy.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct PostgresConfig {
    /// Admin connection URL. A throwaway server is started when absent.
    pub url: Option<Redacted<String>>,
    /// Prefix of every database created (default: `test_`)
    #[serde(default = "default_database_prefix")]
    pub database_prefix: String,
    /// Size of the admin connection pool (default: 5)
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    /// Keep the data directory of a throwaway server (default: the `KEEP_TEMP_DIRS` env var)
    pub keep_data: Option<bool>,
    /// Report `127.0.0.1` instead of `localhost` as host (default: true)
    #[serde(default = "default_true")]
    pub rewrite_localhost: bool,
}

impl PostgresConfig {
    /// Resolves the settings into backend options.
    pub fn to_options(&self) -> PostgresOptions {
        PostgresOptions {
            url: self.url.clone().map(Redacted::into_inner),
            database_prefix: self.database_prefix.clone(),
            pool_size: self.pool_size,
            keep_data: self.keep_data.unwrap_or(*KEEP_TEMP_DIRS),
            rewrite_localhost: self.rewrite_localhost,
        }
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            url: None,
            database_prefix: default_database_prefix(),
            pool_size: default_pool_size(),
            keep_data: None,
            rewrite_localhost: true,
        }
    }
}

/// Settings of the IntegreSQL strategy.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct IntegresqlConfig {
    /// Server address (default: `http://localhost:5001`)
    #[serde(default = "default_integresql_url")]
    pub base_url: String,
    /// Replace the host of returned databases with `localhost` (default: true)
    #[serde(default = "default_true")]
    pub host_is_localhost: bool,
    /// Request timeout in seconds (default: 20)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for IntegresqlConfig {
    fn default() -> Self {
        Self {
            base_url: default_integresql_url(),
            host_is_localhost: true,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_database_prefix() -> String {
    DEFAULT_DATABASE_PREFIX.into()
}

fn default_pool_size() -> u32 {
    DEFAULT_POOL_SIZE
}

fn default_true() -> bool {
    true
}

fn default_integresql_url() -> String {
    DEFAULT_INTEGRESQL_URL.into()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// Error when loading configuration from a TOML file.
#[derive(Debug, thiserror::Error)]
#[error("Failed to load configuration file")]
pub struct LoadConfigFileError(#[source] pub Box<figment::Error>);
