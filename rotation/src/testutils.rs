//! In-memory secret store and database driver used by tests in this and
//! dependent crates (enable the `testutils` feature).
use crate::database::{
    CollectionRef, DatabaseClient, DatabaseDriver, DatabaseError, DocumentPage, PageOptions, Query,
};
use crate::secrets::{SecretError, SecretMetadata, SecretStore};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use url::Url;

pub const KEY_SECRET: &str = "cosmosKey";

pub fn endpoint() -> Url {
    Url::parse("https://localhost:8081/").unwrap()
}

struct StoredSecret {
    metadata: SecretMetadata,
    value: String,
}

/// Secret store whose contents tests rotate by hand.
#[derive(Default)]
pub struct MockSecretStore {
    secrets: Mutex<HashMap<String, StoredSecret>>,
    fetches: AtomicUsize,
    lists: AtomicUsize,
    fetch_delay: Mutex<Option<Duration>>,
    unavailable: Mutex<bool>,
}

impl MockSecretStore {
    pub fn with_secret(name: &str, value: &str) -> Self {
        let store = MockSecretStore::default();
        store.set(name, value);
        store
    }

    /// Creates or rotates `name`. Each call moves `updated_at` forward.
    pub fn set(&self, name: &str, value: &str) {
        let mut secrets = self.secrets.lock();
        let base: DateTime<Utc> = DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default();
        match secrets.get_mut(name) {
            Some(secret) => {
                secret.metadata.updated_at += ChronoDuration::seconds(1);
                secret.value = value.to_string();
            }
            None => {
                secrets.insert(
                    name.to_string(),
                    StoredSecret {
                        metadata: SecretMetadata {
                            name: name.to_string(),
                            created_at: base,
                            updated_at: base,
                        },
                        value: value.to_string(),
                    },
                );
            }
        }
    }

    /// Rewrites the value without touching the timestamps.
    pub fn set_value_only(&self, name: &str, value: &str) {
        if let Some(secret) = self.secrets.lock().get_mut(name) {
            secret.value = value.to_string();
        }
    }

    pub fn remove(&self, name: &str) {
        self.secrets.lock().remove(name);
    }

    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        *self.fetch_delay.lock() = delay;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn list_count(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretStore for MockSecretStore {
    async fn list_secret_metadata(&self) -> Result<Vec<SecretMetadata>, SecretError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        if *self.unavailable.lock() {
            return Err(SecretError::InvalidResponse("store unavailable".into()));
        }
        let mut secrets: Vec<_> = self
            .secrets
            .lock()
            .values()
            .map(|s| s.metadata.clone())
            .collect();
        secrets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(secrets)
    }

    async fn fetch_secret_value(&self, name: &str) -> Result<String, SecretError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if *self.unavailable.lock() {
            return Err(SecretError::InvalidResponse("store unavailable".into()));
        }
        self.secrets
            .lock()
            .get(name)
            .map(|s| s.value.clone())
            .ok_or_else(|| SecretError::NotFound(name.to_string()))
    }
}

/// Keys the simulated database currently accepts, plus its documents.
#[derive(Default)]
pub struct MockDatabase {
    accepted_keys: Mutex<HashSet<String>>,
    documents: Mutex<BTreeMap<String, Value>>,
    operations: AtomicUsize,
}

impl MockDatabase {
    pub fn accepting(key: &str) -> Arc<Self> {
        let db = MockDatabase::default();
        db.accepted_keys.lock().insert(key.to_string());
        Arc::new(db)
    }

    /// Revokes every key and accepts only `key` from now on.
    pub fn rotate_to(&self, key: &str) {
        let mut keys = self.accepted_keys.lock();
        keys.clear();
        keys.insert(key.to_string());
    }

    pub fn accept(&self, key: &str) {
        self.accepted_keys.lock().insert(key.to_string());
    }

    pub fn operation_count(&self) -> usize {
        self.operations.load(Ordering::SeqCst)
    }

    pub fn insert(&self, document: Value) {
        if let Some(id) = document.get("id").and_then(Value::as_str) {
            self.documents.lock().insert(id.to_string(), document.clone());
        }
    }

    fn authorize(&self, key: &str) -> Result<(), DatabaseError> {
        if self.accepted_keys.lock().contains(key) {
            Ok(())
        } else {
            Err(DatabaseError::Unauthorized("key rejected".into()))
        }
    }
}

/// Counts client constructions and can slow them down to widen races.
pub struct MockDriver {
    pub database: Arc<MockDatabase>,
    builds: AtomicUsize,
    build_delay: Mutex<Option<Duration>>,
}

impl MockDriver {
    pub fn new(database: Arc<MockDatabase>) -> Self {
        MockDriver {
            database,
            builds: AtomicUsize::new(0),
            build_delay: Mutex::new(None),
        }
    }

    pub fn set_build_delay(&self, delay: Option<Duration>) {
        *self.build_delay.lock() = delay;
    }

    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DatabaseDriver for MockDriver {
    async fn build_client(
        &self,
        _endpoint: &Url,
        credential: &str,
    ) -> Result<Arc<dyn DatabaseClient>, DatabaseError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let delay = *self.build_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(Arc::new(MockClient {
            key: credential.to_string(),
            database: self.database.clone(),
        }))
    }
}

/// Client bound to the key it was built with; fails with `Unauthorized` once
/// the database stops accepting that key.
pub struct MockClient {
    pub key: String,
    database: Arc<MockDatabase>,
}

impl Default for MockClient {
    fn default() -> Self {
        MockClient {
            key: String::new(),
            database: Arc::new(MockDatabase::default()),
        }
    }
}

impl MockClient {
    fn begin(&self) -> Result<(), DatabaseError> {
        self.database.operations.fetch_add(1, Ordering::SeqCst);
        self.database.authorize(&self.key)
    }
}

#[async_trait]
impl DatabaseClient for MockClient {
    async fn validate(&self, _database: &str) -> Result<(), DatabaseError> {
        self.database.authorize(&self.key)
    }

    async fn read_document(
        &self,
        _target: CollectionRef<'_>,
        id: &str,
        _partition_key: &Value,
    ) -> Result<Value, DatabaseError> {
        self.begin()?;
        self.database
            .documents
            .lock()
            .get(id)
            .cloned()
            .ok_or(DatabaseError::NotFound)
    }

    async fn create_document(
        &self,
        _target: CollectionRef<'_>,
        document: &Value,
        _partition_key: &Value,
    ) -> Result<Value, DatabaseError> {
        self.begin()?;
        let id = document_id(document)?;
        let mut documents = self.database.documents.lock();
        if documents.contains_key(&id) {
            return Err(DatabaseError::Conflict);
        }
        documents.insert(id, document.clone());
        Ok(document.clone())
    }

    async fn upsert_document(
        &self,
        _target: CollectionRef<'_>,
        document: &Value,
        _partition_key: &Value,
    ) -> Result<Value, DatabaseError> {
        self.begin()?;
        let id = document_id(document)?;
        self.database.documents.lock().insert(id, document.clone());
        Ok(document.clone())
    }

    async fn delete_document(
        &self,
        _target: CollectionRef<'_>,
        id: &str,
        _partition_key: &Value,
    ) -> Result<(), DatabaseError> {
        self.begin()?;
        self.database
            .documents
            .lock()
            .remove(id)
            .map(|_| ())
            .ok_or(DatabaseError::NotFound)
    }

    /// Understands an optional `@pk` parameter compared against the
    /// document's `category` field; the continuation token is an offset.
    async fn query_documents(
        &self,
        _target: CollectionRef<'_>,
        query: &Query,
        options: &PageOptions,
    ) -> Result<DocumentPage, DatabaseError> {
        self.begin()?;
        let filter = query
            .parameters
            .iter()
            .find(|p| p.name == "@pk")
            .map(|p| p.value.clone());
        let offset: usize = match &options.continuation {
            Some(token) => token
                .parse()
                .map_err(|_| DatabaseError::BadRequest("bad continuation".into()))?,
            None => 0,
        };
        let matching: Vec<Value> = self
            .database
            .documents
            .lock()
            .values()
            .filter(|d| filter.as_ref().is_none_or(|f| d.get("category") == Some(f)))
            .cloned()
            .collect();
        let limit = options.max_item_count.map(|m| m as usize).unwrap_or(usize::MAX);
        let documents: Vec<Value> = matching.iter().skip(offset).take(limit).cloned().collect();
        let next = offset + documents.len();
        let continuation = (next < matching.len()).then(|| next.to_string());
        Ok(DocumentPage {
            documents,
            continuation,
        })
    }
}

fn document_id(document: &Value) -> Result<String, DatabaseError> {
    document
        .get("id")
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| DatabaseError::BadRequest("document has no id".into()))
}
