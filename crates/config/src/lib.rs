//! Configuration of template database factories.
//!
//! [`load`] reads a [`Config`] from TOML and `TEMPLATEDB_CONFIG_*` environment variables, and
//! [`build_factory`] turns it into the configured [`DatabaseFactory`].

use std::{sync::Arc, time::Duration};

use provisioning::DatabaseFactory;
use template_integresql::IntegresqlBackend;
use template_postgres::PostgresBackend;
use url::Url;

pub mod config_file;
pub mod redacted;

pub use self::{
    config_file::{
        Backend, Config, IntegresqlConfig, LoadConfigFileError, PostgresConfig, load,
    },
    redacted::Redacted,
};

/// Builds the factory selected by `config`.
///
/// Nothing is connected yet: a local server is started or reached on the factory's
/// `prepare()` or first request.
pub fn build_factory(config: &Config) -> Result<Arc<dyn DatabaseFactory>, BuildFactoryError> {
    match config.backend {
        Backend::Postgres => {
            let backend = PostgresBackend::new(config.postgres.to_options());
            Ok(Arc::new(backend.into_factory()))
        }
        Backend::Integresql => {
            let base_url = Url::parse(&config.integresql.base_url)
                .map_err(BuildFactoryError::InvalidBaseUrl)?;
            let timeout = Duration::from_secs(config.integresql.timeout_secs);
            let client = integresql_client::Client::new(base_url, timeout)
                .map_err(BuildFactoryError::HttpClient)?;
            let backend = IntegresqlBackend::new(client)
                .with_host_is_localhost(config.integresql.host_is_localhost);
            Ok(Arc::new(backend.into_factory()))
        }
    }
}

/// Errors that can occur when building a factory
#[derive(Debug, thiserror::Error)]
pub enum BuildFactoryError {
    /// The IntegreSQL address is not a valid URL
    #[error("invalid IntegreSQL base URL")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The HTTP client could not be built
    #[error("failed to build IntegreSQL HTTP client")]
    HttpClient(#[source] reqwest::Error),
}
