//! Test database provisioning from templates on a local PostgreSQL server.
//!
//! Templates are ordinary databases named after their content key, created and populated on
//! first use. Test databases are cloned from them with `CREATE DATABASE … TEMPLATE …`. The
//! server is either an existing one given by URL or a throwaway server started with `pgtemp`.

use std::{fmt, sync::LazyLock, time::Duration};

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use provisioning::{
    ConnectionInfo, ContentKey, Ensured, Issued, TemplateBackend, TemplateFactory,
};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tokio::sync::OnceCell;
use uuid::Uuid;

pub mod engine;

use self::engine::Engine;

/// Whether to keep the data directory of a throwaway server after it stops
///
/// This is set to `false` by default, but can be overridden by the `KEEP_TEMP_DIRS` environment
/// variable.
pub static KEEP_TEMP_DIRS: LazyLock<bool> = LazyLock::new(|| {
    std::env::var("KEEP_TEMP_DIRS")
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false)
});

/// SQLSTATE `object_in_use`: the template still has sessions attached.
const OBJECT_IN_USE: &str = "55006";

/// SQLSTATE `invalid_catalog_name`: the template does not exist.
const INVALID_CATALOG_NAME: &str = "3D000";

/// Factory provisioning test databases from templates on a local server.
pub type PostgresFactory = TemplateFactory<PostgresBackend>;

/// Settings of the local PostgreSQL strategy.
#[derive(Clone)]
pub struct PostgresOptions {
    /// Admin connection URL. A throwaway server is started when absent.
    pub url: Option<String>,
    /// Prefix of every database created.
    pub database_prefix: String,
    /// Size of the admin connection pool.
    pub pool_size: u32,
    /// Keep the data directory of a throwaway server.
    pub keep_data: bool,
    /// Report `127.0.0.1` instead of `localhost` as host.
    pub rewrite_localhost: bool,
}

impl Default for PostgresOptions {
    fn default() -> Self {
        Self {
            url: None,
            database_prefix: "test_".to_string(),
            pool_size: 5,
            keep_data: *KEEP_TEMP_DIRS,
            rewrite_localhost: true,
        }
    }
}

impl fmt::Debug for PostgresOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresOptions")
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .field("database_prefix", &self.database_prefix)
            .field("pool_size", &self.pool_size)
            .field("keep_data", &self.keep_data)
            .field("rewrite_localhost", &self.rewrite_localhost)
            .finish()
    }
}

/// Template backend running on one PostgreSQL server.
///
/// The server is connected lazily, on [`prepare`](TemplateBackend::prepare) or the first
/// request.
pub struct PostgresBackend {
    options: PostgresOptions,
    engine: OnceCell<Engine>,
}

impl PostgresBackend {
    pub fn new(options: PostgresOptions) -> Self {
        Self {
            options,
            engine: OnceCell::new(),
        }
    }

    /// Wraps the backend into a factory.
    pub fn into_factory(self) -> PostgresFactory {
        TemplateFactory::new(self)
    }

    /// Admin connection pool, connecting first if needed.
    pub async fn admin_pool(&self) -> Result<&PgPool, Error> {
        Ok(self.engine().await?.pool())
    }

    /// Name of the template database of `key`.
    pub fn template_name(&self, key: &ContentKey) -> String {
        let prefix = self.options.database_prefix.trim_end_matches('_');
        format!("template_{prefix}_{}", key.short())
    }

    async fn engine(&self) -> Result<&Engine, Error> {
        self.engine
            .get_or_try_init(|| Engine::start(&self.options))
            .await
    }

    fn instance_name(&self) -> String {
        format!("{}{}", self.options.database_prefix, Uuid::new_v4().simple())
    }
}

#[async_trait]
impl TemplateBackend for PostgresBackend {
    type Instance = String;
    type Error = Error;

    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn prepare(&self) -> Result<(), Error> {
        self.engine().await.map(|_| ())
    }

    #[tracing::instrument(skip(self, schema), fields(%key), err)]
    async fn ensure_template(
        &self,
        key: &ContentKey,
        schema: Option<&str>,
    ) -> Result<Ensured, Error> {
        let engine = self.engine().await?;
        let template = self.template_name(key);

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)")
                .bind(&template)
                .fetch_one(engine.pool())
                .await
                .map_err(|source| Error::CheckTemplate {
                    database: template.clone(),
                    source,
                })?;
        if exists {
            tracing::debug!(%template, "reusing existing template");
            return Ok(Ensured::Ready);
        }

        let create = format!("CREATE DATABASE {}", quote_ident(&template));
        sqlx::raw_sql(&create)
            .execute(engine.pool())
            .await
            .map_err(|source| Error::CreateTemplate {
                database: template.clone(),
                source,
            })?;

        if let Some(schema) = schema {
            populate(&engine.connection_info(&template), schema).await?;
        }
        Ok(Ensured::Ready)
    }

    #[tracing::instrument(skip(self), fields(%key), err)]
    async fn discard_template(&self, key: &ContentKey) -> Result<(), Error> {
        let engine = self.engine().await?;
        let template = self.template_name(key);

        let drop = format!("DROP DATABASE IF EXISTS {}", quote_ident(&template));
        sqlx::raw_sql(&drop)
            .execute(engine.pool())
            .await
            .map_err(|source| Error::DropDatabase {
                database: template,
                source,
            })?;
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(%key), err)]
    async fn clone_template(&self, key: &ContentKey) -> Result<Option<Issued<String>>, Error> {
        let engine = self.engine().await?;
        let template = self.template_name(key);
        let database = self.instance_name();

        let create = format!(
            "CREATE DATABASE {} TEMPLATE {}",
            quote_ident(&database),
            quote_ident(&template)
        );
        let sql = create.as_str();
        let pool = engine.pool();

        let retry_policy = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(100))
            .with_max_times(20);

        fn notify_retry(err: &sqlx::Error, dur: Duration) {
            tracing::debug!(
                error = %err,
                "Template still in use. Retrying clone in {:.1}s",
                dur.as_secs_f32()
            );
        }

        let result = (move || async move { sqlx::raw_sql(sql).execute(pool).await })
            .retry(retry_policy)
            .when(|err| has_code(err, OBJECT_IN_USE))
            .notify(notify_retry)
            .await;

        match result {
            Ok(_) => Ok(Some(Issued {
                connection: engine.connection_info(&database),
                instance: database,
            })),
            Err(err) if has_code(&err, INVALID_CATALOG_NAME) => {
                tracing::debug!(%template, "template does not exist");
                Ok(None)
            }
            Err(source) => Err(Error::Clone {
                database,
                template,
                source,
            }),
        }
    }

    #[tracing::instrument(skip(self), err)]
    async fn destroy(&self, database: &String) -> Result<(), Error> {
        let engine = self.engine().await?;

        let drop = format!("DROP DATABASE IF EXISTS {}", quote_ident(database));
        sqlx::raw_sql(&drop)
            .execute(engine.pool())
            .await
            .map_err(|source| Error::DropDatabase {
                database: database.clone(),
                source,
            })?;
        Ok(())
    }
}

/// Runs `schema` against the template database over a dedicated connection.
///
/// The connection is closed before returning, as cloning requires the template to have no
/// sessions.
#[tracing::instrument(skip_all, fields(database = %info.database), err)]
async fn populate(info: &ConnectionInfo, schema: &str) -> Result<(), Error> {
    let populate_err = |source| Error::Populate {
        database: info.database.clone(),
        source,
    };

    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect_with(info.pg_connect_options())
        .await
        .map_err(populate_err)?;
    let result = sqlx::raw_sql(schema).execute(&pool).await;
    pool.close().await;
    result.map(|_| ()).map_err(populate_err)
}

fn has_code(err: &sqlx::Error, code: &str) -> bool {
    err.as_database_error()
        .and_then(|db_err| db_err.code())
        .is_some_and(|actual| actual == code)
}

/// Quotes a database name for use as an SQL identifier.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Errors of the local PostgreSQL template backend
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Starting the throwaway server failed
    #[error("failed to start temporary PostgreSQL server")]
    StartServer(#[source] tokio::task::JoinError),

    /// The admin URL could not be parsed
    #[error("invalid PostgreSQL admin URL")]
    InvalidUrl(#[source] url::ParseError),

    /// The admin URL has no host
    #[error("PostgreSQL admin URL has no host")]
    MissingHost,

    /// Connecting to the server failed
    #[error("failed to connect to PostgreSQL server")]
    Connect(#[source] sqlx::Error),

    /// Looking up the template in the catalog failed
    #[error("failed to check whether template database {database} exists")]
    CheckTemplate {
        database: String,
        #[source]
        source: sqlx::Error,
    },

    /// Creating the empty template database failed
    #[error("failed to create template database {database}")]
    CreateTemplate {
        database: String,
        #[source]
        source: sqlx::Error,
    },

    /// Running the schema against the template database failed
    #[error("error in template init: failed to run schema against database {database}")]
    Populate {
        database: String,
        #[source]
        source: sqlx::Error,
    },

    /// Cloning the template failed
    #[error("failed to create database {database} from template {template}")]
    Clone {
        database: String,
        template: String,
        #[source]
        source: sqlx::Error,
    },

    /// Dropping a database failed
    #[error("failed to drop database {database}")]
    DropDatabase {
        database: String,
        #[source]
        source: sqlx::Error,
    },
}
