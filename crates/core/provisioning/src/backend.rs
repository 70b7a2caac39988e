//! Storage and cloning strategy behind a [`TemplateFactory`](crate::TemplateFactory).

use async_trait::async_trait;

use crate::{database::ConnectionInfo, key::ContentKey};

/// A cloned test database as returned by a backend.
pub struct Issued<I> {
    /// Backend-specific identity, handed back to [`TemplateBackend::destroy`].
    pub instance: I,
    /// Where callers connect to the new database.
    pub connection: ConnectionInfo,
}

/// State of a template after [`TemplateBackend::ensure_template`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ensured {
    /// The template exists and is populated, whether it was just built or found in place.
    Ready,
    /// Another process owns the template and may still be populating it.
    ///
    /// Cloning is expected to work once that process finishes. The factory gives a failed
    /// clone one more attempt and otherwise treats the key as unknown again.
    ClaimedElsewhere,
}

/// Template storage and cloning mechanics of one strategy.
///
/// The factory owns all coordination: [`ensure_template`](Self::ensure_template) and
/// [`discard_template`](Self::discard_template) are only ever called by the single caller that
/// currently initializes a key, and [`clone_template`](Self::clone_template) only after that
/// initialization finished. Implementations therefore need no locking of their own beyond what
/// their I/O requires.
#[async_trait]
pub trait TemplateBackend: Send + Sync + 'static {
    /// Backend-specific identity of a cloned database.
    type Instance: Send + Sync + 'static;

    /// Backend failure.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Label of the strategy, e.g. for log fields.
    fn name(&self) -> &'static str;

    /// Warms up the backing engine ahead of the first request.
    ///
    /// Optional: every other operation must work without it. Does nothing by default.
    async fn prepare(&self) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Makes sure a template for `key` exists and holds `schema`.
    ///
    /// Creates and populates the template when it is absent, and leaves an existing one
    /// untouched. Returns [`Ensured::ClaimedElsewhere`] when another process is in charge of it.
    async fn ensure_template(
        &self,
        key: &ContentKey,
        schema: Option<&str>,
    ) -> Result<Ensured, Self::Error>;

    /// Deletes a template whose initialization failed partway.
    async fn discard_template(&self, key: &ContentKey) -> Result<(), Self::Error>;

    /// Creates a fresh database from the template of `key`.
    ///
    /// Returns `Ok(None)` when the template is not available (yet).
    async fn clone_template(
        &self,
        key: &ContentKey,
    ) -> Result<Option<Issued<Self::Instance>>, Self::Error>;

    /// Destroys a database created by [`clone_template`](Self::clone_template).
    ///
    /// Destroying an instance that is already gone is not an error.
    async fn destroy(&self, instance: &Self::Instance) -> Result<(), Self::Error>;
}
