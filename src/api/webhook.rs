use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Fire-and-forget completion notifications for async batch jobs.
#[derive(Clone)]
pub struct WebhookClient {
    http: reqwest::Client,
}

impl WebhookClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http }
    }

    /// POST `payload` to `url`. Failures are logged and otherwise ignored.
    pub async fn notify(&self, url: &str, payload: &Value) -> bool {
        match self.http.post(url).json(payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(url, "Webhook delivered");
                true
            }
            Ok(resp) => {
                warn!(url, status = resp.status().as_u16(), "Webhook rejected");
                false
            }
            Err(e) => {
                warn!(url, error = %e, "Webhook delivery failed");
                false
            }
        }
    }
}

impl Default for WebhookClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn posts_payload_as_json() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .match_body(mockito::Matcher::PartialJson(json!({"job_id": "j1"})))
            .with_status(200)
            .create_async()
            .await;

        let client = WebhookClient::new();
        let url = format!("{}/hook", server.url());
        assert!(client.notify(&url, &json!({"job_id": "j1", "status": "completed"})).await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn server_error_is_swallowed() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server.mock("POST", "/hook").with_status(500).create_async().await;

        let client = WebhookClient::new();
        let url = format!("{}/hook", server.url());
        assert!(!client.notify(&url, &json!({})).await);
    }

    #[tokio::test]
    async fn unreachable_host_is_swallowed() {
        let client = WebhookClient::new();
        assert!(!client.notify("http://127.0.0.1:1/hook", &json!({})).await);
    }
}
