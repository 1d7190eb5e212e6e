use crate::{format_notification_message, AlertChannel, Notification};
use async_trait::async_trait;
use pulse_core::{config::WebhookConfig, PulseError, Result, Severity};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

/// Posts each notification as a JSON document to a fixed URL.
#[derive(Debug)]
pub struct WebhookChannel {
    config: WebhookConfig,
    client: Client,
}

impl WebhookChannel {
    pub fn new(config: WebhookConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| PulseError::Alert(format!("Failed to build webhook client: {}", e)))?;

        Ok(Self { config, client })
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    id: String,
    severity: Severity,
    title: &'a str,
    message: &'a str,
    text: String,
    timestamp: String,
    anomaly: Option<&'a serde_json::Value>,
}

#[async_trait]
impl AlertChannel for WebhookChannel {
    async fn send(&self, notification: &Notification) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let payload = WebhookPayload {
            id: notification.id.to_string(),
            severity: notification.severity,
            title: &notification.title,
            message: &notification.message,
            text: format_notification_message(notification),
            timestamp: notification.timestamp.to_rfc3339(),
            anomaly: notification.data.as_ref(),
        };

        debug!("Posting alert {} to {}", notification.id, self.config.url);
        let response = self
            .client
            .post(&self.config.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| PulseError::Alert(format!("Webhook request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PulseError::Alert(format!(
                "Webhook returned {}: {}",
                status, body
            )));
        }

        info!("Webhook alert {} delivered", notification.id);
        Ok(())
    }

    fn name(&self) -> &str {
        "webhook"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled && !self.config.url.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accepts one request, answers with `status`, and returns the body.
    async fn serve_once(listener: TcpListener, status: &'static str) -> String {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];

        let body_start = loop {
            let n = socket.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let head = String::from_utf8_lossy(&buf[..body_start]).to_lowercase();
        let length: usize = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .map(|v| v.trim().parse().unwrap())
            .unwrap_or(0);

        while buf.len() < body_start + length {
            let n = socket.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
        }

        let response = format!("HTTP/1.1 {}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n", status);
        socket.write_all(response.as_bytes()).await.unwrap();

        String::from_utf8_lossy(&buf[body_start..body_start + length]).to_string()
    }

    fn channel_for(listener: &TcpListener) -> WebhookChannel {
        WebhookChannel::new(WebhookConfig {
            enabled: true,
            url: format!("http://{}/alerts", listener.local_addr().unwrap()),
            timeout_ms: 2000,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_posts_json_payload() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let channel = channel_for(&listener);
        let server = tokio::spawn(serve_once(listener, "200 OK"));

        let notification = Notification::test();
        channel.send(&notification).await.unwrap();

        let body: serde_json::Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(body["id"], notification.id.to_string());
        assert_eq!(body["severity"], "low");
        assert_eq!(body["title"], "PulseScan test alert");
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let channel = channel_for(&listener);
        let server = tokio::spawn(serve_once(listener, "500 Internal Server Error"));

        let result = channel.send(&Notification::test()).await;
        assert!(matches!(result, Err(PulseError::Alert(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_without_url() {
        let channel = WebhookChannel::new(WebhookConfig {
            enabled: true,
            ..WebhookConfig::default()
        })
        .unwrap();
        assert!(!channel.is_enabled());
    }
}
