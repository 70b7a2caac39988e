//! HTTP client for the IntegreSQL template database service.
//!
//! IntegreSQL keeps template databases keyed by a 32 character hash and hands out clones of
//! them. The lifecycle of a template, as seen by [`TemplatesClient`]:
//!
//! 1. `POST /api/v1/templates` claims the hash. The first claimant receives the connection
//!    parameters of an empty template database, which it populates itself. Everybody else
//!    receives `423 Locked`.
//! 2. `PUT /api/v1/templates/{hash}` finalizes the populated template, or
//!    `DELETE /api/v1/templates/{hash}` discards it.
//! 3. `GET /api/v1/templates/{hash}/tests` hands out a fresh test database cloned from the
//!    template, and `DELETE /api/v1/templates/{hash}/tests/{id}` releases it again.

use std::time::Duration;

use url::Url;

pub mod models;
pub mod templates;

pub use self::{
    models::{Database, DatabaseConfig, TemplateDatabase, TestDatabase},
    templates::{
        CreateTemplate, CreateTemplateError, DiscardTemplateError, FinalizeTemplateError,
        GetTestDatabaseError, InvalidHashError, ReleaseTestDatabaseError, TemplatesClient,
    },
};

/// Default timeout of a single request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Client of one IntegreSQL server.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: Url,
}

impl Client {
    /// Creates a client for the server at `base_url`, e.g. `http://localhost:5000`.
    ///
    /// # Errors
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_http_client(http, base_url))
    }

    /// Creates a client reusing an existing HTTP client.
    pub fn with_http_client(http: reqwest::Client, mut base_url: Url) -> Self {
        // Relative joins drop the last path segment unless it ends with a slash
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Template and test database operations.
    pub fn templates(&self) -> TemplatesClient<'_> {
        TemplatesClient::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_gets_a_trailing_slash() {
        let base_url = Url::parse("http://localhost:5000/integresql").expect("valid url");

        let client = Client::with_http_client(reqwest::Client::new(), base_url);

        assert_eq!(client.base_url().as_str(), "http://localhost:5000/integresql/");
        assert_eq!(
            client
                .base_url()
                .join("api/v1/templates")
                .expect("valid url")
                .as_str(),
            "http://localhost:5000/integresql/api/v1/templates"
        );
    }
}
