//! TCP probe strategy.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::{config_timeout, Collector, CollectorOutput, ProbeConnection, ProbeError, ProbeStrategy};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const BANNER_BYTES: usize = 1024;

/// Opens a TCP connection. Config: `{ "host": ..., "port": ..., "timeoutMs"?: ... }`.
pub struct TcpStrategy;

#[async_trait]
impl ProbeStrategy for TcpStrategy {
    fn id(&self) -> &str {
        "tcp"
    }

    async fn create_connection(&self, config: &Value) -> Result<Arc<dyn ProbeConnection>, ProbeError> {
        let host = config
            .get("host")
            .and_then(Value::as_str)
            .ok_or_else(|| ProbeError::Config("tcp probe requires a host".to_string()))?;
        let port = config
            .get("port")
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| ProbeError::Config("tcp probe requires a valid port".to_string()))?;
        let timeout = config_timeout(config, DEFAULT_TIMEOUT);

        let start = Instant::now();
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ProbeError::Timeout(timeout))?
            .map_err(|e| ProbeError::Network(format!("failed to connect to {}:{}: {}", host, port, e)))?;
        let connect_ms = start.elapsed().as_secs_f64() * 1000.0;

        Ok(Arc::new(TcpConnection {
            stream: Mutex::new(Some(stream)),
            connect_ms,
            timeout,
        }))
    }
}

/// An established TCP stream.
pub struct TcpConnection {
    stream: Mutex<Option<TcpStream>>,
    connect_ms: f64,
    timeout: Duration,
}

#[async_trait]
impl ProbeConnection for TcpConnection {
    /// Request: `{ "send"?: "...", "readBanner"?: bool }`.
    async fn invoke(&self, request: &Value) -> Result<Value, ProbeError> {
        let mut guard = self.stream.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| ProbeError::Network("connection already closed".to_string()))?;

        if let Some(payload) = request.get("send").and_then(Value::as_str) {
            stream
                .write_all(payload.as_bytes())
                .await
                .map_err(|e| ProbeError::Network(format!("failed to send: {}", e)))?;
        }

        let mut banner = None;
        if request.get("readBanner").and_then(Value::as_bool).unwrap_or(false) {
            let mut buf = vec![0u8; BANNER_BYTES];
            let n = tokio::time::timeout(self.timeout, stream.read(&mut buf))
                .await
                .map_err(|_| ProbeError::Timeout(self.timeout))?
                .map_err(|e| ProbeError::Network(format!("failed to read: {}", e)))?;
            banner = Some(String::from_utf8_lossy(&buf[..n]).trim_end().to_string());
        }

        Ok(json!({
            "connected": true,
            "connectTimeMs": self.connect_ms,
            "banner": banner,
        }))
    }

    async fn close(&self) {
        if let Some(mut stream) = self.stream.lock().await.take() {
            let _ = stream.shutdown().await;
        }
    }
}

/// Reports connect time and, optionally, the server banner.
pub struct TcpBannerCollector;

#[async_trait]
impl Collector for TcpBannerCollector {
    fn id(&self) -> &str {
        "tcp.banner"
    }

    async fn execute(&self, config: &Value, connection: &dyn ProbeConnection) -> CollectorOutput {
        match connection.invoke(config).await {
            Ok(result) => CollectorOutput::ok(result),
            Err(e) => CollectorOutput::failed(e.to_string()),
        }
    }
}
