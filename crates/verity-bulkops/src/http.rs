//! HTTP transport for the Verity controller.
//!
//! Bulk writes go to `{base}/{path}` with the body `{json_key: {name: obj}}`;
//! bulk deletes pass the names as repeated query parameters. The session
//! token obtained from `POST {base}/auth` travels in the `ivn_api` cookie.

use crate::cache::ObjectMap;
use crate::dag::KindSpec;
use crate::error::{BulkError, Result};
use crate::payload::Payload;
use crate::transport::{
    error_from_body, objects_from_body, results_from_body, BulkResponse, Transport, TransportError,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::COOKIE;
use reqwest::{Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};
use tracing::{debug, info};

const TOKEN_COOKIE: &str = "ivn_api";

/// Controller tokens are refreshed after this long.
const TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

fn default_connect_timeout_ms() -> u64 {
    30_000
}

/// Connection settings for the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// e.g. `https://verity.example.net/api`
    pub base_url: String,
    pub username: String,
    #[serde(default)]
    pub password: String,

    /// Skip TLS certificate verification (lab controllers)
    #[serde(default)]
    pub accept_invalid_certs: bool,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.base_url.is_empty() {
            return Err(BulkError::config("controller base_url must be set"));
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(BulkError::config(format!(
                "controller base_url must be an http(s) URL, got {}",
                self.base_url
            )));
        }
        if self.username.is_empty() {
            return Err(BulkError::config("controller username must be set"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Token {
    value: String,
    obtained_at: Instant,
}

/// [`Transport`] over reqwest.
pub struct HttpTransport {
    config: ControllerConfig,
    client: reqwest::Client,
    token: RwLock<Option<Token>>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.config.base_url)
            .field("username", &self.config.username)
            .finish()
    }
}

impl HttpTransport {
    pub fn new(config: ControllerConfig) -> Result<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| BulkError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            config,
            client,
            token: RwLock::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        collection_url(&self.config.base_url, path)
    }

    fn current_token(&self) -> Option<String> {
        self.token
            .read()
            .as_ref()
            .filter(|t| t.obtained_at.elapsed() < TOKEN_LIFETIME)
            .map(|t| t.value.clone())
    }

    async fn ensure_token(&self) -> std::result::Result<String, TransportError> {
        if let Some(token) = self.current_token() {
            return Ok(token);
        }
        self.authenticate().await?;
        self.current_token()
            .ok_or_else(|| TransportError::http(401, "no token after authentication"))
    }

    async fn request(
        &self,
        method: Method,
        kind: &KindSpec,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> std::result::Result<(u16, Value), TransportError> {
        let token = self.ensure_token().await?;
        let mut request: RequestBuilder = self
            .client
            .request(method.clone(), self.url(&kind.path))
            .header(COOKIE, format!("{TOKEN_COOKIE}={token}"));

        let mut params: Vec<(&str, &str)> =
            kind.query.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        params.extend_from_slice(query);
        if !params.is_empty() {
            request = request.query(&params);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        debug!(method = %method, kind = %kind.name, path = %kind.path, "Controller request");
        let response = request
            .send()
            .await
            .map_err(|e| TransportError::network(format!("{method} {} failed: {e}", kind.path)))?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(|e| {
            TransportError::network(format!("failed reading {} response: {e}", kind.path))
        })?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| json!({ "message": String::from_utf8_lossy(&bytes) }))
        };

        if (200..300).contains(&status) {
            Ok((status, body))
        } else {
            Err(error_from_body(kind, status, &body))
        }
    }

    async fn write(
        &self,
        method: Method,
        kind: &KindSpec,
        items: &[(String, Payload)],
    ) -> std::result::Result<BulkResponse, TransportError> {
        let body = write_body(kind, items);
        let (_, response) = self.request(method, kind, &[], Some(&body)).await?;
        Ok(results_from_body(kind, &response))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn put_bulk(
        &self,
        kind: &KindSpec,
        items: &[(String, Payload)],
    ) -> std::result::Result<BulkResponse, TransportError> {
        self.write(Method::PUT, kind, items).await
    }

    async fn patch_bulk(
        &self,
        kind: &KindSpec,
        items: &[(String, Payload)],
    ) -> std::result::Result<BulkResponse, TransportError> {
        self.write(Method::PATCH, kind, items).await
    }

    async fn delete_bulk(
        &self,
        kind: &KindSpec,
        names: &[String],
    ) -> std::result::Result<BulkResponse, TransportError> {
        let param = kind.delete_param.as_deref().ok_or_else(|| {
            TransportError::http(405, format!("{} does not support delete", kind.name))
        })?;
        let query: Vec<(&str, &str)> = names.iter().map(|n| (param, n.as_str())).collect();
        let (_, response) = self.request(Method::DELETE, kind, &query, None).await?;
        Ok(results_from_body(kind, &response))
    }

    async fn get(&self, kind: &KindSpec) -> std::result::Result<ObjectMap, TransportError> {
        let (_, body) = self.request(Method::GET, kind, &[], None).await?;
        Ok(objects_from_body(kind, &body))
    }

    async fn authenticate(&self) -> std::result::Result<(), TransportError> {
        let body = json!({
            "auth": {
                "username": self.config.username,
                "password": self.config.password,
            }
        });
        let response = self
            .client
            .post(self.url("auth"))
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::network(format!("authentication request failed: {e}")))?;

        let status = response.status().as_u16();
        let value: Value = response.json().await.unwrap_or(Value::Null);
        if !(200..300).contains(&status) {
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("authentication failed");
            return Err(TransportError::http(status, message));
        }
        let token = value
            .get("token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| TransportError::http(401, "no token found in authentication response"))?;

        *self.token.write() = Some(Token {
            value: token.to_string(),
            obtained_at: Instant::now(),
        });
        info!(base_url = %self.config.base_url, "Authenticated with controller");
        Ok(())
    }
}

fn collection_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// `{json_key: {name: payload}}` in request order.
fn write_body(kind: &KindSpec, items: &[(String, Payload)]) -> Value {
    let objects: Map<String, Value> = items
        .iter()
        .map(|(name, payload)| (name.clone(), payload.to_json()))
        .collect();
    let mut body = Map::new();
    body.insert(kind.json_key.clone(), Value::Object(objects));
    Value::Object(body)
}
