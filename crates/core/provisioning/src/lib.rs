//! Template-based provisioning of disposable test databases.
//!
//! A test asks a [`DatabaseFactory`] for a database holding some schema and gets back a private
//! [`TestDatabase`] of its own. The schema is applied once per distinct schema text, to a
//! *template* database, and every request is served by cloning that template.
//!
//! [`TemplateFactory`] implements the protocol on top of a [`TemplateBackend`], which supplies
//! the storage and cloning mechanics of one strategy (a local engine or a remote template
//! service).

use async_trait::async_trait;

pub mod backend;
pub mod database;
pub mod error;
pub mod factory;
pub mod key;
pub mod single_flight;

pub use self::{
    backend::{Ensured, Issued, TemplateBackend},
    database::{ConnectionInfo, TestDatabase},
    error::{BoxError, ProvisionError},
    factory::{CleanupSummary, TemplateFactory},
    key::{ContentKey, KeyError, NO_SCHEMA_KEY},
    single_flight::{Flight, Init, PeerFailure},
};

/// Capability handed to test code, independent of the backing strategy.
#[async_trait]
pub trait DatabaseFactory: Send + Sync {
    /// Label of the backing strategy.
    fn name(&self) -> &'static str;

    /// Warms up the backing engine ahead of the first request.
    ///
    /// Optional: skipping it has no effect on correctness. Does nothing by default.
    async fn prepare(&self) -> Result<(), ProvisionError> {
        Ok(())
    }

    /// Provisions a private database holding `schema`, or an empty one for `None`.
    async fn provision(&self, schema: Option<&str>) -> Result<TestDatabase, ProvisionError>;

    /// Destroys every database issued so far. Best-effort; never fails.
    async fn cleanup(&self) -> CleanupSummary;
}
