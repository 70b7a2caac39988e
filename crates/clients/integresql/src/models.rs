//! JSON bodies exchanged with IntegreSQL.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

/// A template database handed to the caller that claimed its hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateDatabase {
    pub database: Database,
}

/// A test database cloned from a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDatabase {
    /// Identifier of the test database within its template, used to release it.
    pub id: i64,
    pub database: Database,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Database {
    pub template_hash: String,
    pub config: DatabaseConfig,
}

/// Connection parameters of a database managed by IntegreSQL.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    /// Extra connection string parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_params: Option<BTreeMap<String, String>>,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("additional_params", &self.additional_params)
            .finish()
    }
}

/// Body of `POST /api/v1/templates`.
#[derive(Debug, Serialize)]
pub(crate) struct InitializeTemplateRequest<'a> {
    pub hash: &'a str,
}
