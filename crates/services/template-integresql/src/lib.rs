//! Test database provisioning through an IntegreSQL server.
//!
//! IntegreSQL is the authority on which templates exist. The factory in front of
//! [`IntegresqlBackend`] remembers the hashes it already submitted in this process, so each
//! template is claimed at most once per process. Across processes the server arbitrates: the
//! first claimant populates the template, the others see it as locked and simply ask for test
//! databases, which the server holds back until the template is finalized. A locked template
//! that still cannot be read is claimed again by the next request.

use async_trait::async_trait;
use integresql_client::{
    Client, CreateTemplate, CreateTemplateError, DatabaseConfig, DiscardTemplateError,
    FinalizeTemplateError, GetTestDatabaseError, ReleaseTestDatabaseError,
};
use provisioning::{
    ConnectionInfo, ContentKey, Ensured, Issued, TemplateBackend, TemplateFactory,
};
use sqlx::postgres::PgPoolOptions;

/// Factory provisioning test databases from IntegreSQL templates.
pub type IntegresqlFactory = TemplateFactory<IntegresqlBackend>;

/// Template backend delegating storage and cloning to IntegreSQL.
#[derive(Debug, Clone)]
pub struct IntegresqlBackend {
    client: Client,
    host_is_localhost: bool,
}

/// A test database handed out by IntegreSQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegresqlInstance {
    pub hash: String,
    pub id: i64,
}

impl IntegresqlBackend {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            host_is_localhost: false,
        }
    }

    /// Replaces the host of every returned database with `localhost`.
    ///
    /// For servers that report a container-internal host name.
    pub fn with_host_is_localhost(mut self, host_is_localhost: bool) -> Self {
        self.host_is_localhost = host_is_localhost;
        self
    }

    /// Wraps the backend into a factory.
    pub fn into_factory(self) -> IntegresqlFactory {
        TemplateFactory::new(self)
    }

    fn connection_info(&self, config: DatabaseConfig) -> ConnectionInfo {
        let info = ConnectionInfo {
            host: config.host,
            port: config.port,
            database: config.database,
            username: config.username,
            password: config.password,
        };
        if self.host_is_localhost {
            info.with_host("localhost")
        } else {
            info
        }
    }
}

#[async_trait]
impl TemplateBackend for IntegresqlBackend {
    type Instance = IntegresqlInstance;
    type Error = Error;

    fn name(&self) -> &'static str {
        "integresql"
    }

    async fn ensure_template(
        &self,
        key: &ContentKey,
        schema: Option<&str>,
    ) -> Result<Ensured, Error> {
        let template = match self
            .client
            .templates()
            .create(key.as_str())
            .await
            .map_err(Error::CreateTemplate)?
        {
            CreateTemplate::Created(template) => template,
            CreateTemplate::Locked => {
                tracing::debug!(%key, "template claimed elsewhere");
                return Ok(Ensured::ClaimedElsewhere);
            }
        };

        let info = self.connection_info(template.database.config);
        if let Some(schema) = schema {
            populate(&info, schema).await?;
        }

        self.client
            .templates()
            .finalize(key.as_str())
            .await
            .map_err(Error::FinalizeTemplate)?;
        Ok(Ensured::Ready)
    }

    async fn discard_template(&self, key: &ContentKey) -> Result<(), Error> {
        self.client
            .templates()
            .discard(key.as_str())
            .await
            .map_err(Error::DiscardTemplate)
    }

    async fn clone_template(
        &self,
        key: &ContentKey,
    ) -> Result<Option<Issued<IntegresqlInstance>>, Error> {
        let Some(test_db) = self
            .client
            .templates()
            .get_test_database(key.as_str())
            .await
            .map_err(Error::GetTestDatabase)?
        else {
            return Ok(None);
        };

        Ok(Some(Issued {
            instance: IntegresqlInstance {
                hash: test_db.database.template_hash.clone(),
                id: test_db.id,
            },
            connection: self.connection_info(test_db.database.config),
        }))
    }

    async fn destroy(&self, instance: &IntegresqlInstance) -> Result<(), Error> {
        self.client
            .templates()
            .release_test_database(&instance.hash, instance.id)
            .await
            .map_err(Error::ReleaseTestDatabase)
    }
}

/// Runs `schema` against the template database over a dedicated connection.
///
/// The connection is closed before returning, as the template must have no sessions once it is
/// finalized.
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

/// Errors of the IntegreSQL template backend
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Claiming the template failed
    #[error("failed to create template")]
    CreateTemplate(#[source] CreateTemplateError),

    /// Running the schema against the template database failed
    ///
    /// Kept apart from the service errors: this one comes from the schema itself or from
    /// reaching the database, not from IntegreSQL.
    #[error("error in template init: failed to run schema against database {database}")]
    Populate {
        database: String,
        #[source]
        source: sqlx::Error,
    },

    /// Finalizing the populated template failed
    #[error("failed to finalize template")]
    FinalizeTemplate(#[source] FinalizeTemplateError),

    /// Discarding the template failed
    #[error("failed to discard template")]
    DiscardTemplate(#[source] DiscardTemplateError),

    /// Getting a test database failed
    #[error("failed to get test database")]
    GetTestDatabase(#[source] GetTestDatabaseError),

    /// Releasing a test database failed
    #[error("failed to release test database")]
    ReleaseTestDatabase(#[source] ReleaseTestDatabaseError),
}
