use std::time::Duration;

use tracing::{debug, error};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(3);

/// Fire-and-forget association hooks posted on request state transitions.
/// Failures are logged and dropped; nothing in the engine waits on them.
#[derive(Clone)]
pub struct WebhookClient {
    client: reqwest::Client,
    post_url: Option<String>,
}

impl WebhookClient {
    pub fn new(post_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            post_url,
        }
    }

    /// POST a form-encoded association of two tokens to the configured
    /// hook endpoint.
    pub async fn associate(
        &self,
        left_type: &str,
        left_token: &str,
        right_type: &str,
        right_token: &str,
    ) {
        let Some(url) = &self.post_url else {
            debug!("no web hook post_url configured, skipping {left_type}/{right_type} hook");
            return;
        };
        let form = [
            ("reason", "pushmanager"),
            ("left_type", left_type),
            ("left_token", left_token),
            ("right_type", right_type),
            ("right_token", right_token),
        ];
        let result = self
            .client
            .post(url)
            .timeout(WEBHOOK_TIMEOUT)
            .form(&form)
            .send()
            .await
            .and_then(|resp| resp.error_for_status());
        if let Err(err) = result {
            error!("web hook POST failed: {err}");
        }
    }
}
