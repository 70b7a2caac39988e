//! Errors surfaced by test database provisioning.

use crate::{
    key::ContentKey,
    single_flight::{Flight, PeerFailure},
};

/// Boxed backend error, kept as the `source` of [`ProvisionError`] variants.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned by a database factory.
///
/// Every variant names the content key or database it concerns. The backend failure that caused
/// it is available through [`std::error::Error::source`].
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// Warming up the backend failed.
    #[error("failed to prepare the {backend} backend")]
    Prepare {
        backend: &'static str,
        #[source]
        source: BoxError,
    },

    /// Creating or populating the template failed.
    ///
    /// The key was reverted to unknown and the half-built template discarded, so a later
    /// request for the same schema starts from scratch.
    #[error("failed to initialize template {key}")]
    Template {
        key: ContentKey,
        #[source]
        source: BoxError,
    },

    /// Another caller was initializing the template and did not succeed.
    #[error("template {key} was not initialized by the concurrent caller that owned it")]
    ConcurrentInit {
        key: ContentKey,
        #[source]
        source: PeerFailure,
    },

    /// Cloning the template into a new test database failed.
    #[error("failed to clone template {key}")]
    Clone {
        key: ContentKey,
        #[source]
        source: BoxError,
    },

    /// The template was still not available after waiting for its initialization.
    ///
    /// The key is reverted to unknown, so the next request for the schema ensures the template
    /// again.
    #[error("template {key} is not available for cloning ({flight:?})")]
    TemplateNotFound { key: ContentKey, flight: Flight },

    /// Destroying a test database failed.
    #[error("failed to destroy test database {database}")]
    Destroy {
        database: String,
        #[source]
        source: BoxError,
    },
}
