//! HTTP probe strategy.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{config_timeout, Collector, CollectorOutput, ProbeConnection, ProbeError, ProbeStrategy};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest body prefix kept in a result, in bytes.
const BODY_PREVIEW_BYTES: usize = 1024;

/// Reaches a system over HTTP(S). Config: `{ "url": ..., "timeoutMs"?: ... }`.
pub struct HttpStrategy;

#[async_trait]
impl ProbeStrategy for HttpStrategy {
    fn id(&self) -> &str {
        "http"
    }

    async fn create_connection(&self, config: &Value) -> Result<Arc<dyn ProbeConnection>, ProbeError> {
        let address = config
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| ProbeError::Config("http probe requires a url".to_string()))?;
        let base_url = normalize_url(address);
        let timeout = config_timeout(config, DEFAULT_TIMEOUT);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProbeError::Network(e.to_string()))?;

        Ok(Arc::new(HttpConnection {
            client,
            base_url,
            timeout,
        }))
    }
}

fn normalize_url(address: &str) -> String {
    let url = if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    };
    url.trim_end_matches('/').to_string()
}

/// A reusable client bound to one base URL.
pub struct HttpConnection {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

#[async_trait]
impl ProbeConnection for HttpConnection {
    /// Request: `{ "method"?: "GET", "path"?: "/" }`.
    async fn invoke(&self, request: &Value) -> Result<Value, ProbeError> {
        let method = request
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| ProbeError::Config(e.to_string()))?;
        let path = request.get("path").and_then(Value::as_str).unwrap_or("");
        let url = if path.is_empty() || path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        };

        let start = Instant::now();

        let response = self
            .client
            .request(method, url.as_str())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProbeError::Timeout(self.timeout)
                } else {
                    ProbeError::Network(e.to_string())
                }
            })?;

        let status = response.status().as_u16();

        // Read the full body to measure complete transfer time.
        let body = response
            .bytes()
            .await
            .map_err(|e| ProbeError::Network(e.to_string()))?;

        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        let preview_len = body.len().min(BODY_PREVIEW_BYTES);
        let preview = String::from_utf8_lossy(&body[..preview_len]).into_owned();

        Ok(json!({
            "url": url,
            "statusCode": status,
            "latencyMs": latency_ms,
            "bodyLength": body.len(),
            "body": preview,
        }))
    }

    async fn close(&self) {}
}

/// Issues one request and reports status code, latency and body.
pub struct HttpRequestCollector;

#[async_trait]
impl Collector for HttpRequestCollector {
    fn id(&self) -> &str {
        "http.request"
    }

    async fn execute(&self, config: &Value, connection: &dyn ProbeConnection) -> CollectorOutput {
        match connection.invoke(config).await {
            Ok(result) => CollectorOutput::ok(result),
            Err(e) => CollectorOutput::failed(e.to_string()),
        }
    }
}
