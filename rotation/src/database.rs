//! Document database driver abstraction.
//!
//! A driver turns an endpoint and an access key into a client. Clients are
//! immutable once built: rotating the key means building a new client and
//! publishing it through the connection holder.
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use url::Url;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DatabaseError {
    /// The credential was rejected (401). Usually a rotated key.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The credential is not allowed to perform the operation (403).
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("document not found")]
    NotFound,

    #[error("document already exists")]
    Conflict,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("request rate too large")]
    Throttled,

    #[error("database request timed out")]
    Timeout,

    #[error("database returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid database response: {0}")]
    InvalidResponse(String),
}

impl DatabaseError {
    /// True for failures caused by a stale or rejected credential. Only
    /// these trigger a reconnect.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            DatabaseError::Unauthorized(_) | DatabaseError::Forbidden(_)
        )
    }
}

impl From<reqwest::Error> for DatabaseError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DatabaseError::Timeout
        } else {
            DatabaseError::Transport(err.to_string())
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueryParameter {
    pub name: String,
    pub value: Value,
}

/// Parameterized query. Values are never interpolated into `text`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Query {
    #[serde(rename = "query")]
    pub text: String,
    pub parameters: Vec<QueryParameter>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Query {
            text: text.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.push(QueryParameter {
            name: name.into(),
            value: value.into(),
        });
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PageOptions {
    pub max_item_count: Option<u32>,
    pub continuation: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DocumentPage {
    pub documents: Vec<Value>,
    pub continuation: Option<String>,
}

/// Addresses one collection within a database.
#[derive(Clone, Copy, Debug)]
pub struct CollectionRef<'a> {
    pub database: &'a str,
    pub collection: &'a str,
}

#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// Cheap probe proving the credential works against `database`.
    async fn validate(&self, database: &str) -> Result<(), DatabaseError>;

    async fn read_document(
        &self,
        target: CollectionRef<'_>,
        id: &str,
        partition_key: &Value,
    ) -> Result<Value, DatabaseError>;

    async fn create_document(
        &self,
        target: CollectionRef<'_>,
        document: &Value,
        partition_key: &Value,
    ) -> Result<Value, DatabaseError>;

    async fn upsert_document(
        &self,
        target: CollectionRef<'_>,
        document: &Value,
        partition_key: &Value,
    ) -> Result<Value, DatabaseError>;

    async fn delete_document(
        &self,
        target: CollectionRef<'_>,
        id: &str,
        partition_key: &Value,
    ) -> Result<(), DatabaseError>;

    async fn query_documents(
        &self,
        target: CollectionRef<'_>,
        query: &Query,
        options: &PageOptions,
    ) -> Result<DocumentPage, DatabaseError>;
}

#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    async fn build_client(
        &self,
        endpoint: &Url,
        credential: &str,
    ) -> Result<Arc<dyn DatabaseClient>, DatabaseError>;
}
