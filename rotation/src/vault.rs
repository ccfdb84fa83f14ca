//! HashiCorp Vault KV v2 secret store.
//!
//! Secrets are stored with the key value under the `value` field. Change
//! detection reads the `created_time`/`updated_time` of the metadata
//! endpoint; values are only read from the data endpoint on demand.
use crate::secrets::{SecretError, SecretMetadata, SecretStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use url::Url;

const TOKEN_HEADER: &str = "X-Vault-Token";
const NAMESPACE_HEADER: &str = "X-Vault-Namespace";
const VALUE_FIELD: &str = "value";

#[derive(Deserialize)]
struct ListData {
    keys: Vec<String>,
}

#[derive(Deserialize)]
struct MetadataData {
    created_time: String,
    updated_time: String,
}

#[derive(Deserialize)]
struct SecretData {
    data: HashMap<String, String>,
}

#[derive(Deserialize)]
struct VaultResponse<T> {
    data: T,
}

pub struct VaultSecretStore {
    client: reqwest::Client,
    address: Url,
    mount: String,
    path: String,
    namespace: Option<String>,
    token: String,
}

impl VaultSecretStore {
    pub fn new(
        address: Url,
        mount: String,
        path: String,
        namespace: Option<String>,
        token: String,
    ) -> Self {
        VaultSecretStore {
            client: reqwest::Client::new(),
            address,
            mount,
            path,
            namespace,
            token,
        }
    }

    /// Builds `{address}/v1/{mount}/{kind}/{path}[/{key}]`.
    fn url(&self, kind: &str, key: Option<&str>) -> Result<Url, SecretError> {
        let mut url = self.address.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| SecretError::InvalidAddress(self.address.to_string()))?;
            segments.pop_if_empty().push("v1").push(&self.mount).push(kind);
            for part in self.path.split('/').filter(|p| !p.is_empty()) {
                segments.push(part);
            }
            if let Some(key) = key {
                segments.push(key);
            }
        }
        Ok(url)
    }

    async fn get(&self, url: Url) -> Result<Response, SecretError> {
        let mut request = self.client.get(url).header(TOKEN_HEADER, &self.token);
        if let Some(namespace) = &self.namespace {
            request = request.header(NAMESPACE_HEADER, namespace);
        }
        Ok(request.send().await?)
    }

    async fn list_keys(&self) -> Result<Vec<String>, SecretError> {
        let mut url = self.url("metadata", None)?;
        url.query_pairs_mut().append_pair("list", "true");

        let response = self.get(url).await?;
        // Vault answers 404 for an empty folder
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let response = check_status(response, &self.path)?;
        let listed = response.json::<VaultResponse<ListData>>().await?;

        // Keys ending in '/' are sub-folders
        Ok(listed
            .data
            .keys
            .into_iter()
            .filter(|key| !key.ends_with('/'))
            .collect())
    }

    async fn read_metadata(&self, name: &str) -> Result<SecretMetadata, SecretError> {
        let response = self.get(self.url("metadata", Some(name))?).await?;
        let response = check_status(response, name)?;
        let metadata = response.json::<VaultResponse<MetadataData>>().await?.data;

        Ok(SecretMetadata {
            name: name.to_string(),
            created_at: parse_time(&metadata.created_time)?,
            updated_at: parse_time(&metadata.updated_time)?,
        })
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, SecretError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SecretError::InvalidResponse(format!("bad timestamp '{value}': {e}")))
}

fn check_status(response: Response, name: &str) -> Result<Response, SecretError> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::NOT_FOUND => Err(SecretError::NotFound(name.to_string())),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SecretError::Unauthorized(
            format!("vault returned {} for '{name}'", response.status()),
        )),
        status => Err(SecretError::InvalidResponse(format!(
            "vault returned {status} for '{name}'"
        ))),
    }
}

#[async_trait]
impl SecretStore for VaultSecretStore {
    async fn list_secret_metadata(&self) -> Result<Vec<SecretMetadata>, SecretError> {
        let keys = self.list_keys().await?;

        let mut secrets = Vec::with_capacity(keys.len());
        for key in keys {
            match self.read_metadata(&key).await {
                Ok(metadata) => secrets.push(metadata),
                // Credential problems affect every key, report them instead of hiding them
                Err(err @ SecretError::Unauthorized(_)) => return Err(err),
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "failed to read secret metadata");
                }
            }
        }

        Ok(secrets)
    }

    async fn fetch_secret_value(&self, name: &str) -> Result<String, SecretError> {
        let response = self.get(self.url("data", Some(name))?).await?;
        let response = check_status(response, name)?;
        let secret = response.json::<VaultResponse<SecretData>>().await?.data;

        secret.data.get(VALUE_FIELD).cloned().ok_or_else(|| {
            SecretError::InvalidResponse(format!("secret '{name}' has no '{VALUE_FIELD}' field"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store(server: &MockServer, path: &str) -> VaultSecretStore {
        VaultSecretStore::new(
            Url::parse(&server.uri()).unwrap(),
            "secret".into(),
            path.into(),
            Some("team-a".into()),
            "s.token".into(),
        )
    }

    #[test]
    fn test_url_layout() {
        let store = VaultSecretStore::new(
            Url::parse("https://vault.internal:8200/").unwrap(),
            "kv".into(),
            "/apps/docgate/".into(),
            None,
            "t".into(),
        );
        assert_eq!(
            store.url("data", Some("cosmosKey")).unwrap().as_str(),
            "https://vault.internal:8200/v1/kv/data/apps/docgate/cosmosKey"
        );
        assert_eq!(
            store.url("metadata", None).unwrap().as_str(),
            "https://vault.internal:8200/v1/kv/metadata/apps/docgate"
        );
    }

    #[tokio::test]
    async fn test_list_secret_metadata() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/secret/metadata/docgate"))
            .and(query_param("list", "true"))
            .and(header(TOKEN_HEADER, "s.token"))
            .and(header(NAMESPACE_HEADER, "team-a"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"keys": ["cosmosKey", "nested/"]}
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/v1/secret/metadata/docgate/cosmosKey"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "created_time": "2024-03-01T10:00:00.000000Z",
                    "updated_time": "2024-05-01T12:30:00.5Z",
                    "current_version": 4
                }
            })))
            .mount(&server)
            .await;

        let secrets = store(&server, "docgate").list_secret_metadata().await.unwrap();
        assert_eq!(secrets.len(), 1);
        assert_eq!(secrets[0].name, "cosmosKey");
        assert_eq!(
            secrets[0].updated_at,
            parse_time("2024-05-01T12:30:00.5Z").unwrap()
        );
        assert!(secrets[0].created_at < secrets[0].updated_at);
    }

    #[tokio::test]
    async fn test_empty_folder_lists_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/metadata/docgate"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"errors": []})))
            .mount(&server)
            .await;

        let secrets = store(&server, "docgate").list_secret_metadata().await.unwrap();
        assert!(secrets.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_secret_value() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/docgate/cosmosKey"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"data": {"value": "bmV3LWtleQ=="}, "metadata": {"version": 4}}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/secret/data/docgate/other"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"data": {"password": "x"}}
            })))
            .mount(&server)
            .await;

        let store = store(&server, "docgate");
        assert_eq!(
            store.fetch_secret_value("cosmosKey").await.unwrap(),
            "bmV3LWtleQ=="
        );
        assert!(matches!(
            store.fetch_secret_value("other").await,
            Err(SecretError::InvalidResponse(_))
        ));
        assert!(matches!(
            store.fetch_secret_value("missing").await,
            Err(SecretError::NotFound(name)) if name == "missing"
        ));
    }

    #[tokio::test]
    async fn test_forbidden_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let store = store(&server, "");
        assert!(matches!(
            store.list_secret_metadata().await,
            Err(SecretError::Unauthorized(_))
        ));
        assert!(matches!(
            store.fetch_secret_value("cosmosKey").await,
            Err(SecretError::Unauthorized(_))
        ));
    }
}
