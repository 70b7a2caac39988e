//! The PostgreSQL server that holds templates and test databases.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use monitoring::logging;
use percent_encoding::percent_decode_str;
use pgtemp::{PgTempDB, PgTempDBBuilder};
use provisioning::ConnectionInfo;
use sqlx::{PgPool, postgres::PgPoolOptions};
use url::Url;

use crate::{Error, PostgresOptions};

/// Connected server: an admin pool plus, for throwaway servers, the handle keeping it alive.
pub struct Engine {
    pool: PgPool,
    server: ConnectionInfo,

    /// Temporary server handle
    ///
    /// On drop, the server is stopped and its data directory deleted.
    _temp: Option<PgTempDB>,
}

impl Engine {
    /// Connects to the configured server, starting a throwaway one if no URL is configured.
    #[tracing::instrument(skip_all, err)]
    pub async fn start(options: &PostgresOptions) -> Result<Self, Error> {
        let (url, temp) = match options.url.as_deref() {
            Some(url) => (url.to_string(), None),
            None => {
                let temp = start_temp_server(options.keep_data).await?;
                (temp.connection_uri(), Some(temp))
            }
        };

        let mut server = parse_admin_url(&url)?;
        if options.rewrite_localhost && server.host == "localhost" {
            server = server.with_host("127.0.0.1");
        }
        tracing::info!(host = %server.host, port = server.port, "connecting to PostgreSQL server");

        let pool = connect_with_retry(&server, options.pool_size).await?;

        Ok(Self {
            pool,
            server,
            _temp: temp,
        })
    }

    /// Pool of connections to the admin database.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Connection parameters of database `database` on this server.
    pub fn connection_info(&self, database: &str) -> ConnectionInfo {
        ConnectionInfo {
            database: database.to_string(),
            ..self.server.clone()
        }
    }
}

async fn start_temp_server(keep: bool) -> Result<PgTempDB, Error> {
    // Runs initdb and waits for the server, both blocking
    let pg_temp = tokio::task::spawn_blocking(move || {
        PgTempDBBuilder::new()
            .with_initdb_arg("locale", "C")
            .persist_data(keep)
            .start()
    })
    .await
    .map_err(Error::StartServer)?;

    tracing::info!("initializing temp database at: {}", pg_temp.data_dir().display());
    Ok(pg_temp)
}

/// Splits an admin URL into connection parameters.
///
/// User and database default to `postgres`, the port to 5432.
fn parse_admin_url(url: &str) -> Result<ConnectionInfo, Error> {
    let parsed = Url::parse(url).map_err(Error::InvalidUrl)?;
    let host = parsed
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or(Error::MissingHost)?;

    let decode = |part: &str| percent_decode_str(part).decode_utf8_lossy().into_owned();
    let username = match parsed.username() {
        "" => "postgres".to_string(),
        username => decode(username),
    };
    let database = match parsed.path().trim_start_matches('/') {
        "" => "postgres".to_string(),
        database => decode(database),
    };

    Ok(ConnectionInfo {
        host: host.to_string(),
        port: parsed.port().unwrap_or(5432),
        database,
        username,
        password: parsed.password().map(decode).unwrap_or_default(),
    })
}

async fn connect_with_retry(server: &ConnectionInfo, pool_size: u32) -> Result<PgPool, Error> {
    let retry_policy = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(100))
        .with_max_times(20);

    fn is_db_starting_up(err: &sqlx::Error) -> bool {
        err.as_database_error()
            .and_then(|db_err| db_err.code())
            .is_some_and(|code| code == "57P03")
    }

    fn notify_retry(err: &sqlx::Error, dur: Duration) {
        tracing::warn!(
            error = %err,
            error_source = logging::error_source(err),
            "Database still starting up during connection. Retrying in {:.1}s",
            dur.as_secs_f32()
        );
    }

    let options = server.pg_connect_options();
    (|| {
        PgPoolOptions::new()
            .max_connections(pool_size)
            .connect_with(options.clone())
    })
    .retry(retry_policy)
    .when(is_db_starting_up)
    .notify(notify_retry)
    .await
    .map_err(Error::Connect)
}
