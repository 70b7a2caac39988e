//! Template API client.
//!
//! Provides methods for interacting with the `/api/v1/templates` endpoints of IntegreSQL.

use monitoring::logging;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;

use super::{
    Client,
    models::{InitializeTemplateRequest, TemplateDatabase, TestDatabase},
};

/// Length of a template hash accepted by IntegreSQL.
pub const HASH_LEN: usize = 32;

/// Build URL path for creating a template.
///
/// POST `/api/v1/templates`
fn templates_create() -> &'static str {
    "api/v1/templates"
}

/// Build URL path for finalizing or discarding a template.
///
/// PUT/DELETE `/api/v1/templates/{hash}`
fn template_by_hash(hash: &str) -> String {
    format!("api/v1/templates/{hash}")
}

/// Build URL path for getting a test database.
///
/// GET `/api/v1/templates/{hash}/tests`
fn template_tests(hash: &str) -> String {
    format!("api/v1/templates/{hash}/tests")
}

/// Build URL path for releasing a test database.
///
/// DELETE `/api/v1/templates/{hash}/tests/{id}`
fn template_test_by_id(hash: &str, id: i64) -> String {
    format!("api/v1/templates/{hash}/tests/{id}")
}

/// Response to a template creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateTemplate {
    /// The hash was claimed by this caller, who must populate the template and finalize it.
    Created(TemplateDatabase),
    /// Another caller claimed the hash first, or the template is already finalized.
    Locked,
}

/// Client for template-related API operations.
///
/// Created via [`Client::templates`](crate::Client::templates).
#[derive(Debug)]
pub struct TemplatesClient<'a> {
    client: &'a Client,
}

impl<'a> TemplatesClient<'a> {
    pub(crate) fn new(client: &'a Client) -> Self {
        Self { client }
    }

    /// Claims the template for `hash`.
    ///
    /// POSTs to `/api/v1/templates`.
    ///
    /// # Errors
    ///
    /// Returns [`CreateTemplateError`] for an invalid hash, network errors, or responses other
    /// than 200 and 423.
    #[tracing::instrument(skip(self), err)]
    pub async fn create(&self, hash: &str) -> Result<CreateTemplate, CreateTemplateError> {
        validate_hash(hash)?;
        let url = self.url(templates_create());

        tracing::debug!("Sending POST request");

        let response = self
            .client
            .http()
            .post(url.as_str())
            .json(&InitializeTemplateRequest { hash })
            .send()
            .await
            .map_err(|err| CreateTemplateError::Network {
                url: url.to_string(),
                source: err,
            })?;

        let status = response.status();
        tracing::debug!(status = %status, "Received API response");

        match status {
            StatusCode::OK => {
                let template = parse_body(response).await.map_err(|message| {
                    CreateTemplateError::UnexpectedResponse {
                        status: status.as_u16(),
                        message,
                    }
                })?;
                Ok(CreateTemplate::Created(template))
            }
            StatusCode::LOCKED => {
                tracing::debug!("Template locked by another caller");
                Ok(CreateTemplate::Locked)
            }
            _ => Err(CreateTemplateError::UnexpectedResponse {
                status: status.as_u16(),
                message: read_body(response).await,
            }),
        }
    }

    /// Marks the template for `hash` as populated, ready to be cloned.
    ///
    /// PUTs to `/api/v1/templates/{hash}`.
    ///
    /// # Errors
    ///
    /// Returns [`FinalizeTemplateError`] for an invalid hash, network errors, or any non-2xx
    /// response.
    #[tracing::instrument(skip(self), err)]
    pub async fn finalize(&self, hash: &str) -> Result<(), FinalizeTemplateError> {
        validate_hash(hash)?;
        let url = self.url(&template_by_hash(hash));

        tracing::debug!("Sending PUT request");

        let response = self
            .client
            .http()
            .put(url.as_str())
            .send()
            .await
            .map_err(|err| FinalizeTemplateError::Network {
                url: url.to_string(),
                source: err,
            })?;

        let status = response.status();
        tracing::debug!(status = %status, "Received API response");

        if status.is_success() {
            return Ok(());
        }
        Err(FinalizeTemplateError::UnexpectedResponse {
            status: status.as_u16(),
            message: read_body(response).await,
        })
    }

    /// Discards the template for `hash`, typically after populating it failed.
    ///
    /// DELETEs `/api/v1/templates/{hash}`. A template that does not exist (404) counts as
    /// discarded.
    ///
    /// # Errors
    ///
    /// Returns [`DiscardTemplateError`] for an invalid hash, network errors, or unexpected
    /// responses.
    #[tracing::instrument(skip(self), err)]
    pub async fn discard(&self, hash: &str) -> Result<(), DiscardTemplateError> {
        validate_hash(hash)?;
        let url = self.url(&template_by_hash(hash));

        tracing::debug!("Sending DELETE request");

        let response = self
            .client
            .http()
            .delete(url.as_str())
            .send()
            .await
            .map_err(|err| DiscardTemplateError::Network {
                url: url.to_string(),
                source: err,
            })?;

        let status = response.status();
        tracing::debug!(status = %status, "Received API response");

        match status {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                tracing::debug!("Template already gone");
                Ok(())
            }
            _ => Err(DiscardTemplateError::UnexpectedResponse {
                status: status.as_u16(),
                message: read_body(response).await,
            }),
        }
    }

    /// Gets a fresh test database cloned from the template for `hash`.
    ///
    /// GETs `/api/v1/templates/{hash}/tests`. The server holds the request until a template
    /// that is still being populated is finalized.
    ///
    /// Returns `None` if no template exists for the hash (404).
    ///
    /// # Errors
    ///
    /// Returns [`GetTestDatabaseError`] for an invalid hash, network errors, or unexpected
    /// responses, including empty or malformed bodies.
    #[tracing::instrument(skip(self), err)]
    pub async fn get_test_database(
        &self,
        hash: &str,
    ) -> Result<Option<TestDatabase>, GetTestDatabaseError> {
        validate_hash(hash)?;
        let url = self.url(&template_tests(hash));

        tracing::debug!("Sending GET request");

        let response = self
            .client
            .http()
            .get(url.as_str())
            .send()
            .await
            .map_err(|err| GetTestDatabaseError::Network {
                url: url.to_string(),
                source: err,
            })?;

        let status = response.status();
        tracing::debug!(status = %status, "Received API response");

        match status {
            StatusCode::OK => {
                let database = parse_body(response).await.map_err(|message| {
                    GetTestDatabaseError::UnexpectedResponse {
                        status: status.as_u16(),
                        message,
                    }
                })?;
                Ok(Some(database))
            }
            StatusCode::NOT_FOUND => {
                tracing::debug!("Template not found");
                Ok(None)
            }
            _ => Err(GetTestDatabaseError::UnexpectedResponse {
                status: status.as_u16(),
                message: read_body(response).await,
            }),
        }
    }

    /// Releases test database `id` of the template for `hash`.
    ///
    /// DELETEs `/api/v1/templates/{hash}/tests/{id}`. A test database that does not exist (404)
    /// counts as released.
    ///
    /// # Errors
    ///
    /// Returns [`ReleaseTestDatabaseError`] for an invalid hash, network errors, or unexpected
    /// responses.
    #[tracing::instrument(skip(self), err)]
    pub async fn release_test_database(
        &self,
        hash: &str,
        id: i64,
    ) -> Result<(), ReleaseTestDatabaseError> {
        validate_hash(hash)?;
        let url = self.url(&template_test_by_id(hash, id));

        tracing::debug!("Sending DELETE request");

        let response = self
            .client
            .http()
            .delete(url.as_str())
            .send()
            .await
            .map_err(|err| ReleaseTestDatabaseError::Network {
                url: url.to_string(),
                source: err,
            })?;

        let status = response.status();
        tracing::debug!(status = %status, "Received API response");

        match status {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                tracing::debug!("Test database already gone");
                Ok(())
            }
            _ => Err(ReleaseTestDatabaseError::UnexpectedResponse {
                status: status.as_u16(),
                message: read_body(response).await,
            }),
        }
    }

    fn url(&self, path: &str) -> url::Url {
        // Paths are built from validated hex hashes and integers
        self.client.base_url().join(path).expect("valid URL")
    }
}

fn validate_hash(hash: &str) -> Result<(), InvalidHashError> {
    if hash.len() != HASH_LEN {
        return Err(InvalidHashError::InvalidLength {
            hash: hash.to_string(),
        });
    }
    if let Some((index, character)) = hash
        .char_indices()
        .find(|(_, c)| !matches!(c, '0'..='9' | 'a'..='f'))
    {
        return Err(InvalidHashError::InvalidCharacter {
            hash: hash.to_string(),
            character,
            index,
        });
    }
    Ok(())
}

/// Parses a JSON body, rejecting empty and malformed bodies with a message carrying the raw
/// response.
async fn parse_body<T: DeserializeOwned>(response: Response) -> Result<T, String> {
    let text = response.text().await.map_err(|err| {
        tracing::error!(error = %err, error_source = logging::error_source(&err), "Failed to read response body");
        format!("Failed to read response body: {err}")
    })?;

    if text.trim().is_empty() {
        return Err("Unexpected empty response body".to_string());
    }

    serde_json::from_str(&text).map_err(|err| {
        tracing::error!(error = %err, error_source = logging::error_source(&err), "Failed to parse response body");
        format!("Failed to parse response ({err}): {text}")
    })
}

async fn read_body(response: Response) -> String {
    response
        .text()
        .await
        .unwrap_or_else(|_| String::from("Failed to read response body"))
}

/// Malformed template hash, rejected before any request is sent.
#[derive(Debug, thiserror::Error)]
pub enum InvalidHashError {
    /// Hash must be exactly 32 characters
    #[error("template hash must be exactly {HASH_LEN} characters, got {} characters: {hash:?}", .hash.len())]
    InvalidLength { hash: String },

    /// Hash contains something other than lowercase hex digits
    #[error("template hash contains invalid character {character:?} at index {index}: {hash:?}")]
    InvalidCharacter {
        hash: String,
        character: char,
        index: usize,
    },
}

/// Errors that can occur when creating a template
#[derive(Debug, thiserror::Error)]
pub enum CreateTemplateError {
    /// The hash was rejected locally
    #[error(transparent)]
    InvalidHash(#[from] InvalidHashError),

    /// Network or connection error
    #[error("network error connecting to {url}")]
    Network { url: String, source: reqwest::Error },

    /// Unexpected response from the service
    #[error("unexpected response (status {status}): {message}")]
    UnexpectedResponse { status: u16, message: String },
}

/// Errors that can occur when finalizing a template
#[derive(Debug, thiserror::Error)]
pub enum FinalizeTemplateError {
    /// The hash was rejected locally
    #[error(transparent)]
    InvalidHash(#[from] InvalidHashError),

    /// Network or connection error
    #[error("network error connecting to {url}")]
    Network { url: String, source: reqwest::Error },

    /// Unexpected response from the service
    #[error("unexpected response (status {status}): {message}")]
    UnexpectedResponse { status: u16, message: String },
}

/// Errors that can occur when discarding a template
#[derive(Debug, thiserror::Error)]
pub enum DiscardTemplateError {
    /// The hash was rejected locally
    #[error(transparent)]
    InvalidHash(#[from] InvalidHashError),

    /// Network or connection error
    #[error("network error connecting to {url}")]
    Network { url: String, source: reqwest::Error },

    /// Unexpected response from the service
    #[error("unexpected response (status {status}): {message}")]
    UnexpectedResponse { status: u16, message: String },
}

/// Errors that can occur when getting a test database
#[derive(Debug, thiserror::Error)]
pub enum GetTestDatabaseError {
    /// The hash was rejected locally
    #[error(transparent)]
    InvalidHash(#[from] InvalidHashError),

    /// Network or connection error
    #[error("network error connecting to {url}")]
    Network { url: String, source: reqwest::Error },

    /// Unexpected response from the service
    #[error("unexpected response (status {status}): {message}")]
    UnexpectedResponse { status: u16, message: String },
}

/// Errors that can occur when releasing a test database
#[derive(Debug, thiserror::Error)]
pub enum ReleaseTestDatabaseError {
    /// The hash was rejected locally
    #[error(transparent)]
    InvalidHash(#[from] InvalidHashError),

    /// Network or connection error
    #[error("network error connecting to {url}")]
    Network { url: String, source: reqwest::Error },

    /// Unexpected response from the service
    #[error("unexpected response (status {status}): {message}")]
    UnexpectedResponse { status: u16, message: String },
}
