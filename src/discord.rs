use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, StatusCode};
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, warn};

use crate::config::DiscordConfig;
use crate::routing::extension_of;

/// Posts content to Discord webhooks. Both calls report failure as `false`
/// instead of an error; the caller decides what a failed delivery means.
#[async_trait]
pub trait WebhookSender: Send + Sync {
    async fn send_message(&self, webhook_url: &str, content: &str) -> bool;

    async fn send_message_with_file(
        &self,
        webhook_url: &str,
        caption: &str,
        bytes: &[u8],
        filename: &str,
    ) -> bool;

    /// Release pooled connections. Sends after `close` fail.
    async fn close(&self) {}
}

#[derive(Debug, Error)]
enum SendError {
    #[error("retryable: {0}")]
    Retryable(String),
    #[error("{0}")]
    Fatal(String),
}

impl SendError {
    fn is_retryable(&self) -> bool {
        matches!(self, SendError::Retryable(_))
    }
}

/// Discord webhook client over reqwest with exponential backoff.
pub struct DiscordWebhook {
    client: RwLock<Option<Client>>,
    max_retries: usize,
    base_delay_ms: u64,
    max_delay: Duration,
}

impl DiscordWebhook {
    pub fn new(config: &DiscordConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("telecord/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client: RwLock::new(Some(client)),
            max_retries: config.max_retries,
            base_delay_ms: config.retry_base_delay_ms,
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        })
    }

    fn client(&self) -> Option<Client> {
        self.client.read().ok().and_then(|guard| guard.clone())
    }

    fn strategy(&self) -> impl Iterator<Item = Duration> {
        // from_millis(2) doubles each step; the factor scales it to the base delay
        ExponentialBackoff::from_millis(2)
            .factor(self.base_delay_ms.max(2) / 2)
            .max_delay(self.max_delay)
            .map(jitter)
            .take(self.max_retries)
    }

    async fn post_json(&self, client: &Client, url: &str, content: &str) -> Result<(), SendError> {
        let response = client
            .post(url)
            .json(&serde_json::json!({ "content": content }))
            .send()
            .await;
        check(response).await
    }

    async fn post_file(
        &self,
        client: &Client,
        url: &str,
        caption: &str,
        bytes: &[u8],
        filename: &str,
    ) -> Result<(), SendError> {
        let part = Part::bytes(bytes.to_vec())
            .file_name(filename.to_string())
            .mime_str(content_type_for(filename))
            .map_err(|e| SendError::Fatal(format!("invalid content type: {}", e)))?;
        let form = Form::new()
            .text("payload_json", serde_json::json!({ "content": caption }).to_string())
            .part("files[0]", part);

        let response = client.post(url).multipart(form).send().await;
        check(response).await
    }
}

async fn check(response: reqwest::Result<Response>) -> Result<(), SendError> {
    let response = match response {
        Ok(r) => r,
        Err(e) => return Err(SendError::Retryable(format!("transport error: {}", e))),
    };

    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let wait = retry_after(&response);
        warn!(wait_secs = wait.as_secs_f64(), "Discord rate limited webhook");
        tokio::time::sleep(wait).await;
        return Err(SendError::Retryable("rate limited".to_string()));
    }

    let body = response.text().await.unwrap_or_default();
    let message = format!("HTTP {}: {}", status, body.chars().take(200).collect::<String>());
    if status.is_server_error() {
        Err(SendError::Retryable(message))
    } else {
        Err(SendError::Fatal(message))
    }
}

fn retry_after(response: &Response) -> Duration {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or(Duration::from_secs(1))
}

/// MIME type for an attachment, guessed from its extension.
pub fn content_type_for(filename: &str) -> &'static str {
    match extension_of(filename).as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        Some("avi") => "video/x-msvideo",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("ogg") => "audio/ogg",
        Some("m4a") => "audio/mp4",
        Some("flac") => "audio/flac",
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl WebhookSender for DiscordWebhook {
    async fn send_message(&self, webhook_url: &str, content: &str) -> bool {
        let Some(client) = self.client() else {
            warn!("Discord sender is closed");
            return false;
        };

        let result = RetryIf::spawn(
            self.strategy(),
            || self.post_json(&client, webhook_url, content),
            SendError::is_retryable,
        )
        .await;

        match result {
            Ok(()) => {
                debug!(chars = content.chars().count(), "Message posted to Discord");
                true
            }
            Err(e) => {
                warn!(error = %e, "Discord message delivery failed");
                false
            }
        }
    }

    async fn send_message_with_file(
        &self,
        webhook_url: &str,
        caption: &str,
        bytes: &[u8],
        filename: &str,
    ) -> bool {
        let Some(client) = self.client() else {
            warn!("Discord sender is closed");
            return false;
        };

        let result = RetryIf::spawn(
            self.strategy(),
            || self.post_file(&client, webhook_url, caption, bytes, filename),
            SendError::is_retryable,
        )
        .await;

        match result {
            Ok(()) => {
                debug!(filename, bytes = bytes.len(), "File posted to Discord");
                true
            }
            Err(e) => {
                warn!(filename, error = %e, "Discord file delivery failed");
                false
            }
        }
    }

    async fn close(&self) {
        if let Ok(mut guard) = self.client.write() {
            guard.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn sender(max_retries: usize) -> DiscordWebhook {
        DiscordWebhook::new(&DiscordConfig {
            max_retries,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 5,
            ..DiscordConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_send_message_posts_json() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/webhook")
            .match_body(Matcher::PartialJson(serde_json::json!({ "content": "hello" })))
            .with_status(204)
            .create_async()
            .await;

        let url = format!("{}/webhook", server.url());
        assert!(sender(3).send_message(&url, "hello").await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_errors_are_retried_until_exhausted() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/webhook")
            .with_status(500)
            .expect(4)
            .create_async()
            .await;

        let url = format!("{}/webhook", server.url());
        assert!(!sender(3).send_message(&url, "hello").await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/webhook")
            .with_status(400)
            .expect(1)
            .create_async()
            .await;

        let url = format!("{}/webhook", server.url());
        assert!(!sender(3).send_message(&url, "hello").await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rate_limit_is_retried() {
        let mut server = mockito::Server::new_async().await;
        let limited = server
            .mock("POST", "/webhook")
            .with_status(429)
            .with_header("retry-after", "0")
            .expect(2)
            .create_async()
            .await;

        let url = format!("{}/webhook", server.url());
        assert!(!sender(1).send_message(&url, "hello").await);
        limited.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_file_uses_multipart() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/webhook")
            .match_header(
                "content-type",
                Matcher::Regex("^multipart/form-data".to_string()),
            )
            .match_body(Matcher::Regex("report\\.pdf".to_string()))
            .with_status(200)
            .create_async()
            .await;

        let url = format!("{}/webhook", server.url());
        let ok = sender(0)
            .send_message_with_file(&url, "caption", b"%PDF-1.4 test", "report.pdf")
            .await;
        assert!(ok);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_closed_sender_fails() {
        let sender = sender(0);
        sender.close().await;
        assert!(!sender.send_message("http://127.0.0.1:1/webhook", "hi").await);
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("photo.JPG"), "image/jpeg");
        assert_eq!(content_type_for("clip.mp4"), "video/mp4");
        assert_eq!(content_type_for("archive"), "application/octet-stream");
    }
}
