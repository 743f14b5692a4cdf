use crate::{RouterTransport, TransportError};
use async_trait::async_trait;
use docrouter_core::codec::{decode_batch_response, decode_topology, encode_batch_request};
use docrouter_core::{BatchResult, Endpoint, FrameFormat, Method, OperationSpec, TopologyDescriptor};
use reqwest::Client as HttpClient;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, trace};

/// HTTP transport configuration
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Hard ceiling for one HTTP exchange in milliseconds; the router applies
    /// its own, usually tighter, per-attempt timeout on top
    pub timeout_ms: u64,
    /// Encoding used for composite request bodies
    pub batch_format: FrameFormat,
    /// Path, relative to the database root, of the composite endpoint
    pub batch_path: String,
    /// Path, relative to the database root, of the topology endpoint
    pub topology_path: String,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30000,
            batch_format: FrameFormat::JsonArray,
            batch_path: "/multi_get".to_string(),
            topology_path: "/topology".to_string(),
        }
    }
}

/// Talks to nodes over HTTP:
/// `{node}/databases/{database}{path}`
#[derive(Debug, Clone)]
pub struct HttpTransport {
    config: HttpTransportConfig,
    http_client: HttpClient,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self, TransportError> {
        let http_client = HttpClient::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| TransportError::Network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            config,
            http_client,
        })
    }

    pub fn config(&self) -> &HttpTransportConfig {
        &self.config
    }

    fn database_url(base: &str, database: &str, target: &str) -> String {
        format!("{}/databases/{}{}", base.trim_end_matches('/'), database, target)
    }

    fn method(method: Method) -> reqwest::Method {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Head => reqwest::Method::HEAD,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }

    /// Read a response, mapping error statuses; returns body bytes and content type
    async fn read(response: reqwest::Response) -> Result<(bytes::Bytes, String), TransportError> {
        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
            .to_string();
        let body = response.bytes().await.map_err(classify)?;

        if !status.is_success() {
            let text = String::from_utf8_lossy(&body).into_owned();
            return Err(TransportError::from_status(status.as_u16(), text));
        }

        trace!("Response body: {} byte(s)", body.len());
        Ok((body, content_type))
    }
}

/// Map a reqwest failure onto the transport taxonomy
fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::ConnectionRefused(err.to_string())
    } else if err.is_decode() {
        TransportError::Codec(err.to_string())
    } else {
        TransportError::Network(err.to_string())
    }
}

#[async_trait]
impl RouterTransport for HttpTransport {
    async fn send(
        &self,
        endpoint: &Endpoint,
        database: &str,
        operation: &OperationSpec,
    ) -> Result<Value, TransportError> {
        let url = Self::database_url(&endpoint.url, database, &operation.target());
        debug!(endpoint = %endpoint.id, "{} {}", operation.method, url);

        let mut request = self
            .http_client
            .request(Self::method(operation.method), &url);
        if let Some(body) = &operation.body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(classify)?;
        let (body, _) = Self::read(response).await?;

        if body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&body).map_err(|e| TransportError::Codec(e.to_string()))
    }

    async fn send_batch(
        &self,
        endpoint: &Endpoint,
        database: &str,
        items: &[OperationSpec],
    ) -> Result<BatchResult, TransportError> {
        let url = Self::database_url(&endpoint.url, database, &self.config.batch_path);
        let format = self.config.batch_format;
        let body = encode_batch_request(items, format)
            .map_err(|e| TransportError::Codec(e.to_string()))?;

        debug!(
            endpoint = %endpoint.id,
            "Sending batch request to {}: {} item(s)",
            url,
            items.len()
        );

        let response = self
            .http_client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, format.content_type())
            .body(body)
            .send()
            .await
            .map_err(classify)?;

        let (body, content_type) = Self::read(response).await?;
        let slots = decode_batch_response(
            &body,
            FrameFormat::from_content_type(&content_type),
            items.len(),
        )
        .map_err(|e| TransportError::Codec(e.to_string()))?;

        debug!("Received {} batch slot(s)", slots.len());
        Ok(slots)
    }

    async fn fetch_topology(
        &self,
        primary_url: &str,
        database: &str,
    ) -> Result<TopologyDescriptor, TransportError> {
        let url = Self::database_url(primary_url, database, &self.config.topology_path);
        debug!(database, "Fetching topology from {}", url);

        let response = self.http_client.get(&url).send().await.map_err(classify)?;
        let (body, _) = Self::read(response).await?;
        decode_topology(&body).map_err(|e| TransportError::Codec(e.to_string()))
    }
}
