//! Publishing the telemetry snapshot to the external metrics sink.
//!
//! The sink accepts `POST <url>` with a JSON [`TelemetryPayload`] and answers
//! 2xx on success. Failures are reported to the caller, which logs them;
//! nothing is queued or retried because the next tick supersedes the payload.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use spinbridge_types::TelemetryPayload;

/// Error type for publish operations.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// HTTP request failed (connect, timeout, body).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The sink answered with a non-2xx status.
    #[error("Sink returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Invalid URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// Destination for telemetry snapshots.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Deliver one payload.
    async fn publish(&self, payload: &TelemetryPayload) -> Result<(), PublishError>;
}

/// JSON-over-HTTP sink.
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: Client,
    url: String,
}

impl HttpSink {
    /// Create a sink posting to `url`, with a per-request timeout.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, PublishError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(PublishError::Request)?;
        Self::with_client(url, client)
    }

    /// Create a sink with a custom reqwest Client.
    pub fn with_client(url: &str, client: Client) -> Result<Self, PublishError> {
        let url = url.trim().to_string();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(PublishError::InvalidUrl(format!(
                "URL must start with http:// or https://, got: {}",
                url
            )));
        }
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl TelemetrySink for HttpSink {
    async fn publish(&self, payload: &TelemetryPayload) -> Result<(), PublishError> {
        let response = self.client.post(&self.url).json(payload).send().await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(PublishError::Status {
            status: status.as_u16(),
            body: body.trim().chars().take(200).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accept one request, hand back its body, and answer with `status_line`.
    async fn one_shot_server(status_line: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/api/metrics", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                request.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text[..split]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if request.len() >= split + 4 + length || n == 0 {
                        let response = format!(
                            "HTTP/1.1 {}\r\nContent-Length: 4\r\nConnection: close\r\n\r\nnope",
                            status_line
                        );
                        socket.write_all(response.as_bytes()).await.unwrap();
                        return text[split + 4..].to_string();
                    }
                }
                if n == 0 {
                    return String::new();
                }
            }
        });

        (url, handle)
    }

    #[test]
    fn test_sink_rejects_bad_url() {
        let result = HttpSink::new("localhost:3000/api/metrics", Duration::from_secs(1));
        assert!(matches!(result, Err(PublishError::InvalidUrl(_))));
    }

    #[test]
    fn test_sink_keeps_url() {
        let sink = HttpSink::new("http://localhost:3000/api/metrics", Duration::from_secs(1))
            .unwrap();
        assert_eq!(sink.url(), "http://localhost:3000/api/metrics");
    }

    #[tokio::test]
    async fn test_publish_posts_json() {
        let (url, server) = one_shot_server("200 OK").await;
        let sink = HttpSink::new(&url, Duration::from_secs(5)).unwrap();

        let payload = TelemetryPayload {
            power: 200,
            hr: 72,
            cadence: 60,
            elapsed: None,
        };
        sink.publish(&payload).await.unwrap();

        let body: serde_json::Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(body, serde_json::json!({"power": 200, "hr": 72, "cadence": 60}));
    }

    #[tokio::test]
    async fn test_publish_non_2xx_is_error() {
        let (url, _server) = one_shot_server("500 Internal Server Error").await;
        let sink = HttpSink::new(&url, Duration::from_secs(5)).unwrap();

        let err = sink.publish(&TelemetryPayload::default()).await.unwrap_err();
        match err {
            PublishError::Status { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "nope");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_publish_unreachable_is_request_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/api/metrics", listener.local_addr().unwrap());
        drop(listener);

        let sink = HttpSink::new(&url, Duration::from_secs(2)).unwrap();
        let err = sink.publish(&TelemetryPayload::default()).await.unwrap_err();
        assert!(matches!(err, PublishError::Request(_)));
    }
}
