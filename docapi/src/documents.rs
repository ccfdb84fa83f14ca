use crate::errors::ApiError;
use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
};
use rotation::database::{self, PageOptions};
use rotation::retry::AuthRetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const MAX_PAGE_SIZE: u32 = 1000;

/// Shared state of the document routes. Every database call goes through the
/// retry policy so a rotated key is picked up transparently.
#[derive(Clone)]
pub struct DocumentService {
    policy: AuthRetryPolicy,
    partition_key_field: String,
}

impl DocumentService {
    pub fn new(policy: AuthRetryPolicy, partition_key_field: impl Into<String>) -> Self {
        DocumentService {
            policy,
            partition_key_field: partition_key_field.into(),
        }
    }

    fn list_query(&self, partition_key: Option<String>) -> database::Query {
        match partition_key {
            Some(pk) => database::Query::new(format!(
                "SELECT * FROM c WHERE c[\"{}\"] = @pk",
                self.partition_key_field
            ))
            .with_parameter("@pk", Value::String(pk)),
            None => database::Query::new("SELECT * FROM c"),
        }
    }

    fn partition_key_of(&self, document: &Value) -> Result<Value, ApiError> {
        match document.get(&self.partition_key_field) {
            Some(pk @ (Value::String(_) | Value::Number(_))) => Ok(pk.clone()),
            _ => Err(ApiError::InvalidRequest(format!(
                "document must carry a string or number '{}'",
                self.partition_key_field
            ))),
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct ListParams {
    partition_key: Option<String>,
    max_items: Option<u32>,
    continuation: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct KeyParams {
    partition_key: Option<String>,
}

impl KeyParams {
    // Documents partitioned by their id are the common case
    fn resolve(self, id: &str) -> Value {
        Value::String(self.partition_key.unwrap_or_else(|| id.to_string()))
    }
}

#[derive(Serialize, Debug)]
pub struct ListResponse {
    documents: Vec<Value>,
    count: usize,
    continuation: Option<String>,
}

fn document_id(document: &Value) -> Result<&str, ApiError> {
    if !document.is_object() {
        return Err(ApiError::InvalidRequest("document must be a JSON object".into()));
    }
    document
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::InvalidRequest("document must carry a string 'id'".into()))
}

pub async fn list_documents(
    State(service): State<DocumentService>,
    Query(params): Query<ListParams>,
) -> Result<Json<ListResponse>, ApiError> {
    if let Some(max) = params.max_items
        && !(1..=MAX_PAGE_SIZE).contains(&max)
    {
        return Err(ApiError::InvalidRequest(format!(
            "max_items must be between 1 and {MAX_PAGE_SIZE}"
        )));
    }

    let query = &service.list_query(params.partition_key);
    let options = &PageOptions {
        max_item_count: params.max_items,
        continuation: params.continuation,
    };

    let page = service
        .policy
        .execute(|conn| async move {
            conn.client
                .query_documents(conn.target(), query, options)
                .await
        })
        .await?;

    Ok(Json(ListResponse {
        count: page.documents.len(),
        documents: page.documents,
        continuation: page.continuation,
    }))
}

pub async fn get_document(
    State(service): State<DocumentService>,
    Path(id): Path<String>,
    Query(params): Query<KeyParams>,
) -> Result<Json<Value>, ApiError> {
    let partition_key = &params.resolve(&id);
    let id = id.as_str();

    let document = service
        .policy
        .execute(|conn| async move {
            conn.client
                .read_document(conn.target(), id, partition_key)
                .await
        })
        .await?;

    Ok(Json(document))
}

pub async fn create_document(
    State(service): State<DocumentService>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(document) = body?;
    let id = document_id(&document)?;
    let partition_key = &service.partition_key_of(&document)?;
    let document = &document;

    let created = service
        .policy
        .execute(|conn| async move {
            conn.client
                .create_document(conn.target(), document, partition_key)
                .await
        })
        .await?;

    tracing::debug!(id, "document created");
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn upsert_document(
    State(service): State<DocumentService>,
    Path(id): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(mut document) = body?;
    match document.as_object_mut() {
        Some(object) => {
            object
                .entry("id")
                .or_insert_with(|| Value::String(id.clone()));
        }
        None => {
            return Err(ApiError::InvalidRequest(
                "document must be a JSON object".into(),
            ));
        }
    }
    if document_id(&document)? != id {
        return Err(ApiError::InvalidRequest(
            "document id does not match the path".into(),
        ));
    }
    let partition_key = &service.partition_key_of(&document)?;
    let document = &document;

    let stored = service
        .policy
        .execute(|conn| async move {
            conn.client
                .upsert_document(conn.target(), document, partition_key)
                .await
        })
        .await?;

    Ok(Json(stored))
}

pub async fn delete_document(
    State(service): State<DocumentService>,
    Path(id): Path<String>,
    Query(params): Query<KeyParams>,
) -> Result<StatusCode, ApiError> {
    let partition_key = &params.resolve(&id);
    let id = id.as_str();

    service
        .policy
        .execute(|conn| async move {
            conn.client
                .delete_document(conn.target(), id, partition_key)
                .await
        })
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router;
    use axum::Router;
    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request};
    use rotation::config::Rotation;
    use rotation::reconnector::{ReconnectSettings, Reconnector};
    use rotation::testutils::{KEY_SECRET, MockDatabase, MockDriver, MockSecretStore, endpoint};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    struct Fixture {
        secrets: Arc<MockSecretStore>,
        driver: Arc<MockDriver>,
        reconnector: Reconnector,
        app: Router,
    }

    async fn fixture() -> Fixture {
        let secrets = Arc::new(MockSecretStore::with_secret(KEY_SECRET, "key-1"));
        let database = MockDatabase::accepting("key-1");
        database.insert(json!({"id": "a", "category": "books", "title": "Dune"}));
        database.insert(json!({"id": "b", "category": "books", "title": "Emma"}));
        database.insert(json!({"id": "c", "category": "games", "title": "Go"}));
        let driver = Arc::new(MockDriver::new(database));
        let settings = ReconnectSettings {
            endpoint: endpoint(),
            database: "catalog".into(),
            collection: "items".into(),
            key_secret: KEY_SECRET.into(),
            rebuild_timeout: Duration::from_secs(5),
        };
        let reconnector = Reconnector::connect(settings, secrets.clone(), driver.clone())
            .await
            .unwrap();
        let policy = AuthRetryPolicy::new(&Rotation::default(), reconnector.clone());
        Fixture {
            secrets,
            driver,
            reconnector,
            app: router(DocumentService::new(policy, "category")),
        }
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let body = match body {
            Some(value) => Body::from(value.to_string()),
            None => Body::empty(),
        };
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let f = fixture().await;
        let doc = json!({"id": "d", "category": "music", "title": "Kind of Blue"});

        let (status, body) = send(&f.app, Method::POST, "/api/documents", Some(doc.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body, doc);

        let (status, body) = send(&f.app, Method::GET, "/api/documents/d?partition_key=music", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["title"], "Kind of Blue");
    }

    #[tokio::test]
    async fn test_create_rejects_bad_documents() {
        let f = fixture().await;

        let (status, body) = send(&f.app, Method::POST, "/api/documents", Some(json!({"category": "x"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error_message"].as_str().unwrap().contains("'id'"));

        let (status, _) = send(&f.app, Method::POST, "/api/documents", Some(json!({"id": "z"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&f.app, Method::POST, "/api/documents", Some(json!(["not", "an", "object"]))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&f.app, Method::POST, "/api/documents", Some(json!({"id": "a", "category": "books"}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_malformed_json_is_bad_request() {
        let f = fixture().await;
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/documents")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = f.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_get_missing_document() {
        let f = fixture().await;
        let (status, body) = send(&f.app, Method::GET, "/api/documents/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error_message"], "document not found");
    }

    #[tokio::test]
    async fn test_upsert_and_delete() {
        let f = fixture().await;

        let (status, _) = send(&f.app, Method::PUT, "/api/documents/a", Some(json!({"id": "b", "category": "books"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // The id is taken from the path when the body omits it
        let (status, body) = send(&f.app, Method::PUT, "/api/documents/a", Some(json!({"category": "books", "title": "Dune Messiah"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], "a");

        let (status, body) = send(&f.app, Method::DELETE, "/api/documents/a?partition_key=books", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(body, Value::Null);

        let (status, _) = send(&f.app, Method::DELETE, "/api/documents/a", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_with_partition_and_paging() {
        let f = fixture().await;

        let (status, body) = send(&f.app, Method::GET, "/api/documents?partition_key=books&max_items=1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["documents"][0]["id"], "a");
        let token = body["continuation"].as_str().unwrap().to_string();

        let uri = format!("/api/documents?partition_key=books&max_items=1&continuation={token}");
        let (_, body) = send(&f.app, Method::GET, &uri, None).await;
        assert_eq!(body["documents"][0]["id"], "b");
        assert_eq!(body["continuation"], Value::Null);

        let (_, body) = send(&f.app, Method::GET, "/api/documents", None).await;
        assert_eq!(body["count"], 3);

        let (status, _) = send(&f.app, Method::GET, "/api/documents?max_items=0", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotated_key_is_transparent() {
        let f = fixture().await;
        f.secrets.set(KEY_SECRET, "key-2");
        f.driver.database.rotate_to("key-2");

        let (status, body) = send(&f.app, Method::GET, "/api/documents/c?partition_key=games", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["title"], "Go");
        assert_eq!(f.reconnector.current().generation, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecoverable_auth_failure_is_unavailable() {
        let f = fixture().await;
        f.driver.database.rotate_to("key-2");

        let (status, body) = send(&f.app, Method::GET, "/api/documents/c", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error_message"].is_string());
        assert!(!f.reconnector.is_healthy());
    }
}
