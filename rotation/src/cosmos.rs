//! Cosmos DB SQL API over REST with master key authentication.
use crate::database::{
    CollectionRef, DatabaseClient, DatabaseDriver, DatabaseError, DocumentPage, PageOptions, Query,
};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

type HmacSha256 = Hmac<Sha256>;

const API_VERSION: &str = "2018-12-31";
const QUERY_CONTENT_TYPE: &str = "application/query+json";

mod headers {
    pub const DATE: &str = "x-ms-date";
    pub const VERSION: &str = "x-ms-version";
    pub const PARTITION_KEY: &str = "x-ms-documentdb-partitionkey";
    pub const IS_UPSERT: &str = "x-ms-documentdb-is-upsert";
    pub const IS_QUERY: &str = "x-ms-documentdb-isquery";
    pub const CROSS_PARTITION: &str = "x-ms-documentdb-query-enablecrosspartition";
    pub const MAX_ITEM_COUNT: &str = "x-ms-max-item-count";
    pub const CONTINUATION: &str = "x-ms-continuation";
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(rename = "Documents")]
    documents: Vec<Value>,
}

/// Builds [`CosmosClient`]s sharing one HTTP connection pool.
pub struct CosmosDriver {
    http: reqwest::Client,
}

impl CosmosDriver {
    pub fn new(request_timeout: Duration) -> Result<Self, DatabaseError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(CosmosDriver { http })
    }
}

#[async_trait]
impl DatabaseDriver for CosmosDriver {
    async fn build_client(
        &self,
        endpoint: &Url,
        credential: &str,
    ) -> Result<Arc<dyn DatabaseClient>, DatabaseError> {
        let client = CosmosClient::new(self.http.clone(), endpoint.clone(), credential)?;
        Ok(Arc::new(client))
    }
}

pub struct CosmosClient {
    http: reqwest::Client,
    endpoint: Url,
    // Keyed with the decoded master key, cloned for every request
    mac: HmacSha256,
}

impl CosmosClient {
    pub fn new(http: reqwest::Client, endpoint: Url, master_key: &str) -> Result<Self, DatabaseError> {
        let key = STANDARD
            .decode(master_key.trim())
            .map_err(|e| DatabaseError::InvalidCredential(format!("key is not base64: {e}")))?;
        let mac = HmacSha256::new_from_slice(&key)
            .map_err(|e| DatabaseError::InvalidCredential(e.to_string()))?;

        Ok(CosmosClient {
            http,
            endpoint,
            mac,
        })
    }

    /// Master key token for one request, already url-encoded.
    fn authorization(&self, method: &Method, resource_type: &str, resource_link: &str, date: &str) -> String {
        let payload = format!(
            "{}\n{}\n{}\n{}\n\n",
            method.as_str().to_lowercase(),
            resource_type.to_lowercase(),
            resource_link,
            date.to_lowercase()
        );
        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());
        let token = format!("type=master&ver=1.0&sig={signature}");
        url::form_urlencoded::byte_serialize(token.as_bytes()).collect()
    }

    fn url(&self, segments: &[&str]) -> Result<Url, DatabaseError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| DatabaseError::InvalidResponse(format!("invalid endpoint {}", self.endpoint)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// `resource_link` is the path of the addressed resource, which for
    /// feeds (create, query) is the parent collection.
    fn request(
        &self,
        method: Method,
        segments: &[&str],
        resource_type: &str,
        resource_link: &str,
    ) -> Result<RequestBuilder, DatabaseError> {
        let date = chrono::Utc::now()
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();
        let auth = self.authorization(&method, resource_type, resource_link, &date);

        Ok(self
            .http
            .request(method, self.url(segments)?)
            .header(http::header::AUTHORIZATION, auth)
            .header(headers::DATE, date)
            .header(headers::VERSION, API_VERSION))
    }
}

fn partition_key_header(partition_key: &Value) -> Result<String, DatabaseError> {
    serde_json::to_string(&[partition_key])
        .map_err(|e| DatabaseError::BadRequest(format!("invalid partition key: {e}")))
}

async fn check_response(response: Response) -> Result<Response, DatabaseError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .and_then(|b| b.message)
        .unwrap_or(body);

    Err(match status {
        StatusCode::UNAUTHORIZED => DatabaseError::Unauthorized(message),
        StatusCode::FORBIDDEN => DatabaseError::Forbidden(message),
        StatusCode::NOT_FOUND => DatabaseError::NotFound,
        StatusCode::CONFLICT => DatabaseError::Conflict,
        StatusCode::BAD_REQUEST => DatabaseError::BadRequest(message),
        StatusCode::REQUEST_TIMEOUT => DatabaseError::Timeout,
        StatusCode::TOO_MANY_REQUESTS => DatabaseError::Throttled,
        status => DatabaseError::Status {
            status: status.as_u16(),
            message,
        },
    })
}

#[async_trait]
impl DatabaseClient for CosmosClient {
    async fn validate(&self, database: &str) -> Result<(), DatabaseError> {
        let link = format!("dbs/{database}");
        let response = self
            .request(Method::GET, &["dbs", database], "dbs", &link)?
            .send()
            .await?;
        check_response(response).await?;
        Ok(())
    }

    async fn read_document(
        &self,
        target: CollectionRef<'_>,
        id: &str,
        partition_key: &Value,
    ) -> Result<Value, DatabaseError> {
        let link = format!("dbs/{}/colls/{}/docs/{id}", target.database, target.collection);
        let segments = ["dbs", target.database, "colls", target.collection, "docs", id];
        let response = self
            .request(Method::GET, &segments, "docs", &link)?
            .header(headers::PARTITION_KEY, partition_key_header(partition_key)?)
            .send()
            .await?;
        Ok(check_response(response).await?.json().await?)
    }

    async fn create_document(
        &self,
        target: CollectionRef<'_>,
        document: &Value,
        partition_key: &Value,
    ) -> Result<Value, DatabaseError> {
        let link = format!("dbs/{}/colls/{}", target.database, target.collection);
        let segments = ["dbs", target.database, "colls", target.collection, "docs"];
        let response = self
            .request(Method::POST, &segments, "docs", &link)?
            .header(headers::PARTITION_KEY, partition_key_header(partition_key)?)
            .json(document)
            .send()
            .await?;
        Ok(check_response(response).await?.json().await?)
    }

    async fn upsert_document(
        &self,
        target: CollectionRef<'_>,
        document: &Value,
        partition_key: &Value,
    ) -> Result<Value, DatabaseError> {
        let link = format!("dbs/{}/colls/{}", target.database, target.collection);
        let segments = ["dbs", target.database, "colls", target.collection, "docs"];
        let response = self
            .request(Method::POST, &segments, "docs", &link)?
            .header(headers::PARTITION_KEY, partition_key_header(partition_key)?)
            .header(headers::IS_UPSERT, "True")
            .json(document)
            .send()
            .await?;
        Ok(check_response(response).await?.json().await?)
    }

    async fn delete_document(
        &self,
        target: CollectionRef<'_>,
        id: &str,
        partition_key: &Value,
    ) -> Result<(), DatabaseError> {
        let link = format!("dbs/{}/colls/{}/docs/{id}", target.database, target.collection);
        let segments = ["dbs", target.database, "colls", target.collection, "docs", id];
        let response = self
            .request(Method::DELETE, &segments, "docs", &link)?
            .header(headers::PARTITION_KEY, partition_key_header(partition_key)?)
            .send()
            .await?;
        check_response(response).await?;
        Ok(())
    }

    async fn query_documents(
        &self,
        target: CollectionRef<'_>,
        query: &Query,
        options: &PageOptions,
    ) -> Result<DocumentPage, DatabaseError> {
        let link = format!("dbs/{}/colls/{}", target.database, target.collection);
        let segments = ["dbs", target.database, "colls", target.collection, "docs"];
        let body = serde_json::to_vec(query)
            .map_err(|e| DatabaseError::BadRequest(format!("invalid query: {e}")))?;

        let mut request = self
            .request(Method::POST, &segments, "docs", &link)?
            .header(http::header::CONTENT_TYPE, QUERY_CONTENT_TYPE)
            .header(headers::IS_QUERY, "True")
            .header(headers::CROSS_PARTITION, "True")
            .body(body);
        if let Some(max) = options.max_item_count {
            request = request.header(headers::MAX_ITEM_COUNT, max.to_string());
        }
        if let Some(continuation) = &options.continuation {
            request = request.header(headers::CONTINUATION, continuation);
        }

        let response = check_response(request.send().await?).await?;
        let continuation = response
            .headers()
            .get(headers::CONTINUATION)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let page = response.json::<QueryResponse>().await?;

        Ok(DocumentPage {
            documents: page.documents,
            continuation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TEST_KEY: &str = "ZG9jZ2F0ZS10ZXN0LW1hc3Rlci1rZXk=";

    async fn client(server: &MockServer) -> Arc<dyn DatabaseClient> {
        let driver = CosmosDriver::new(Duration::from_secs(5)).unwrap();
        driver
            .build_client(&Url::parse(&server.uri()).unwrap(), TEST_KEY)
            .await
            .unwrap()
    }

    const CATALOG: CollectionRef<'static> = CollectionRef {
        database: "catalog",
        collection: "items",
    };

    #[test]
    fn test_master_key_signature() {
        let client = CosmosClient::new(
            reqwest::Client::new(),
            Url::parse("https://localhost:8081").unwrap(),
            TEST_KEY,
        )
        .unwrap();
        let token = client.authorization(
            &Method::GET,
            "dbs",
            "dbs/catalog",
            "Tue, 01 Nov 1994 08:12:31 GMT",
        );
        assert_eq!(
            token,
            "type%3Dmaster%26ver%3D1.0%26sig%3Dmokd2xmcsDK0Mr%2BDJOm%2Fjg7oTG1Bymvxp0to2AWMqsE%3D"
        );
    }

    #[test]
    fn test_rejects_non_base64_key() {
        let result = CosmosClient::new(
            reqwest::Client::new(),
            Url::parse("https://localhost:8081").unwrap(),
            "not base64!",
        );
        assert!(matches!(result, Err(DatabaseError::InvalidCredential(_))));
    }

    #[tokio::test]
    async fn test_validate_maps_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/dbs/catalog"))
            .and(header_exists("authorization"))
            .and(header(headers::VERSION, API_VERSION))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "code": "Unauthorized",
                "message": "The input authorization token can't serve the request."
            })))
            .mount(&server)
            .await;

        let err = client(&server).await.validate("catalog").await.unwrap_err();
        assert!(err.is_auth_failure());
        assert_eq!(
            err,
            DatabaseError::Unauthorized(
                "The input authorization token can't serve the request.".into()
            )
        );
    }

    #[tokio::test]
    async fn test_read_and_missing_document() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/dbs/catalog/colls/items/docs/book-1"))
            .and(header(headers::PARTITION_KEY, r#"["books"]"#))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "book-1", "category": "books"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/dbs/catalog/colls/items/docs/book-2"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client(&server).await;
        let doc = client
            .read_document(CATALOG, "book-1", &json!("books"))
            .await
            .unwrap();
        assert_eq!(doc["id"], "book-1");

        let missing = client.read_document(CATALOG, "book-2", &json!("books")).await;
        assert_eq!(missing, Err(DatabaseError::NotFound));
    }

    #[tokio::test]
    async fn test_upsert_sets_header() {
        let server = MockServer::start().await;
        let doc = json!({"id": "book-1", "category": "books"});
        Mock::given(method("POST"))
            .and(path("/dbs/catalog/colls/items/docs"))
            .and(header(headers::IS_UPSERT, "True"))
            .and(body_json(&doc))
            .respond_with(ResponseTemplate::new(200).set_body_json(&doc))
            .expect(1)
            .mount(&server)
            .await;

        let stored = client(&server)
            .await
            .upsert_document(CATALOG, &doc, &json!("books"))
            .await
            .unwrap();
        assert_eq!(stored, doc);
    }

    #[tokio::test]
    async fn test_query_pages() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/dbs/catalog/colls/items/docs"))
            .and(header(headers::IS_QUERY, "True"))
            .and(header(headers::MAX_ITEM_COUNT, "2"))
            .and(header(headers::CONTINUATION, "page-1"))
            .and(body_json(json!({
                "query": "SELECT * FROM c WHERE c.category = @pk",
                "parameters": [{"name": "@pk", "value": "books"}]
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(headers::CONTINUATION, "page-2")
                    .set_body_json(json!({
                        "_rid": "abc",
                        "Documents": [{"id": "a"}, {"id": "b"}],
                        "_count": 2
                    })),
            )
            .mount(&server)
            .await;

        let query =
            Query::new("SELECT * FROM c WHERE c.category = @pk").with_parameter("@pk", "books");
        let options = PageOptions {
            max_item_count: Some(2),
            continuation: Some("page-1".into()),
        };
        let page = client(&server)
            .await
            .query_documents(CATALOG, &query, &options)
            .await
            .unwrap();
        assert_eq!(page.documents.len(), 2);
        assert_eq!(page.continuation.as_deref(), Some("page-2"));
    }

    #[tokio::test]
    async fn test_conflict_and_throttle() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/dbs/catalog/colls/items/docs"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let client = client(&server).await;
        let doc = json!({"id": "book-1"});
        assert_eq!(
            client.create_document(CATALOG, &doc, &json!("book-1")).await,
            Err(DatabaseError::Conflict)
        );
        assert_eq!(
            client.delete_document(CATALOG, "book-1", &json!("book-1")).await,
            Err(DatabaseError::Throttled)
        );
    }
}
