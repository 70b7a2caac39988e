//! Template factory: drives key derivation, single-flight initialization and cloning.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use monitoring::logging;
use parking_lot::Mutex;
use tracing::Instrument as _;

use crate::{
    DatabaseFactory,
    backend::{Ensured, Issued, TemplateBackend},
    database::{Release, TestDatabase},
    error::ProvisionError,
    key::ContentKey,
    single_flight::{Flight, FlightError, Init, SingleFlight},
};

/// Outcome of [`TemplateFactory::cleanup`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupSummary {
    /// Number of test databases destroyed.
    pub destroyed: usize,
    /// Names of the test databases that could not be destroyed.
    pub failed: Vec<String>,
}

impl CleanupSummary {
    /// Whether every issued database was destroyed.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Provisions test databases from templates held by backend `B`.
///
/// Cheap to clone; clones share the same registry of templates and issued databases.
pub struct TemplateFactory<B: TemplateBackend> {
    inner: Arc<Inner<B>>,
}

struct Inner<B: TemplateBackend> {
    backend: B,
    flights: SingleFlight<ContentKey>,
    issued: Mutex<BTreeMap<u64, IssuedInstance<B::Instance>>>,
    next_id: AtomicU64,
}

struct IssuedInstance<I> {
    key: ContentKey,
    database: String,
    instance: I,
}

impl<B: TemplateBackend> TemplateFactory<B> {
    pub fn new(backend: B) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                flights: SingleFlight::new(),
                issued: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    /// Label of the active strategy.
    pub fn name(&self) -> &'static str {
        self.inner.backend.name()
    }

    /// Number of issued databases not yet closed or cleaned up.
    pub fn outstanding(&self) -> usize {
        self.inner.issued.lock().len()
    }

    /// Warms up the backend. Optional.
    pub async fn prepare(&self) -> Result<(), ProvisionError> {
        self.inner
            .backend
            .prepare()
            .await
            .map_err(|err| ProvisionError::Prepare {
                backend: self.name(),
                source: err.into(),
            })
    }

    /// Provisions a private database holding `schema`.
    ///
    /// The template of the schema is built at most once per factory. Concurrent callers with
    /// the same schema wait for the one building it.
    ///
    /// A template that cannot be cloned gets one more attempt, unless this call just built it.
    /// If it is still unavailable, the key is forgotten so the next call ensures it again.
    #[tracing::instrument(skip_all, fields(backend = self.name(), key = tracing::field::Empty), err)]
    pub async fn provision(&self, schema: Option<&str>) -> Result<TestDatabase, ProvisionError> {
        let key = ContentKey::derive(schema);
        tracing::Span::current().record("key", key.as_str());

        let flight = self.ensure_template(key, schema).await?;

        let issued = match self.clone_template(&key).await? {
            Some(issued) => issued,
            None if flight != Flight::Initialized => {
                // The key was known before its template became usable
                tracing::debug!(?flight, "template not available yet, retrying once");
                self.inner.flights.settled(&key).await;
                match self.clone_template(&key).await? {
                    Some(issued) => issued,
                    None => return Err(self.template_not_found(key, flight)),
                }
            }
            None => return Err(self.template_not_found(key, flight)),
        };

        let Issued {
            instance,
            connection,
        } = issued;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.issued.lock().insert(
            id,
            IssuedInstance {
                key,
                database: connection.database.clone(),
                instance,
            },
        );
        tracing::debug!(database = %connection.database, "issued test database");

        Ok(TestDatabase::new(
            id,
            key,
            connection,
            self.inner.clone(),
        ))
    }

    /// Destroys every database issued so far.
    ///
    /// All destroys are attempted even if some fail; failures are logged and listed in the
    /// returned summary.
    #[tracing::instrument(skip_all, fields(backend = self.name()))]
    pub async fn cleanup(&self) -> CleanupSummary {
        let issued = std::mem::take(&mut *self.inner.issued.lock());
        let backend = &self.inner.backend;

        let results = futures::future::join_all(issued.into_values().map(move |issued| async move {
            let result = backend.destroy(&issued.instance).await;
            (issued, result)
        }))
        .await;

        let mut summary = CleanupSummary::default();
        for (issued, result) in results {
            match result {
                Ok(()) => summary.destroyed += 1,
                Err(err) => {
                    tracing::warn!(
                        database = %issued.database,
                        key = %issued.key,
                        error = %err,
                        error_source = logging::error_source(&err),
                        "failed to destroy test database"
                    );
                    summary.failed.push(issued.database);
                }
            }
        }

        tracing::info!(
            destroyed = summary.destroyed,
            failed = summary.failed.len(),
            "cleaned up test databases"
        );
        summary
    }

    async fn ensure_template(
        &self,
        key: ContentKey,
        schema: Option<&str>,
    ) -> Result<Flight, ProvisionError> {
        let backend = &self.inner.backend;
        let init = move || {
            async move {
                tracing::info!("initializing template");
                match backend.ensure_template(&key, schema).await {
                    Ok(Ensured::Ready) => {
                        tracing::info!("template initialized");
                        Ok(Init::Done)
                    }
                    Ok(Ensured::ClaimedElsewhere) => {
                        tracing::info!("template claimed by another process");
                        Ok(Init::Deferred)
                    }
                    Err(err) => {
                        tracing::error!(
                            error = %err,
                            error_source = logging::error_source(&err),
                            "template initialization failed, discarding template"
                        );
                        if let Err(discard_err) = backend.discard_template(&key).await {
                            tracing::warn!(
                                error = %discard_err,
                                error_source = logging::error_source(&discard_err),
                                "failed to discard template"
                            );
                        }
                        Err(err)
                    }
                }
            }
            .instrument(tracing::info_span!("ensure_template"))
        };

        self.inner
            .flights
            .run(key, init)
            .await
            .map_err(|err| match err {
                FlightError::Init(err) => ProvisionError::Template {
                    key,
                    source: err.into(),
                },
                FlightError::Peer(source) => ProvisionError::ConcurrentInit { key, source },
            })
    }

    fn template_not_found(&self, key: ContentKey, flight: Flight) -> ProvisionError {
        tracing::warn!(?flight, "template not available for cloning, forgetting key");
        self.inner.flights.forget(&key);
        ProvisionError::TemplateNotFound { key, flight }
    }

    async fn clone_template(
        &self,
        key: &ContentKey,
    ) -> Result<Option<Issued<B::Instance>>, ProvisionError> {
        self.inner
            .backend
            .clone_template(key)
            .await
            .map_err(|err| ProvisionError::Clone {
                key: *key,
                source: err.into(),
            })
    }
}

impl<B: TemplateBackend> Clone for TemplateFactory<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[async_trait]
impl<B: TemplateBackend> Release for Inner<B> {
    async fn release(&self, id: u64) -> Result<(), ProvisionError> {
        let Some(issued) = self.issued.lock().remove(&id) else {
            return Ok(());
        };

        match self.backend.destroy(&issued.instance).await {
            Ok(()) => {
                tracing::debug!(database = %issued.database, "closed test database");
                Ok(())
            }
            Err(err) => {
                let database = issued.database.clone();
                self.issued.lock().insert(id, issued);
                Err(ProvisionError::Destroy {
                    database,
                    source: err.into(),
                })
            }
        }
    }
}

#[async_trait]
impl<B: TemplateBackend> DatabaseFactory for TemplateFactory<B> {
    fn name(&self) -> &'static str {
        TemplateFactory::name(self)
    }

    async fn prepare(&self) -> Result<(), ProvisionError> {
        TemplateFactory::prepare(self).await
    }

    async fn provision(&self, schema: Option<&str>) -> Result<TestDatabase, ProvisionError> {
        TemplateFactory::provision(self, schema).await
    }

    async fn cleanup(&self) -> CleanupSummary {
        TemplateFactory::cleanup(self).await
    }
}
