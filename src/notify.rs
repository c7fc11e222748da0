// backend/src/notify.rs

use serde_json::json;

use crate::config::Config;

/// Fire-and-forget "needs review" ping to the configured webhook. Not
/// required for correctness; failures are logged and dropped.
pub fn notify_approvers(cfg: &Config, message: String) {
    let Some(url) = cfg.notify_webhook_url.clone() else {
        return;
    };
    tokio::spawn(async move {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build();
        let client = match client {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("notify: client build failed: {e}");
                return;
            }
        };
        let body = json!({
            "event": "REGULARISATION_REQUEST",
            "message": message,
        });
        if let Err(e) = client.post(&url).json(&body).send().await {
            tracing::warn!("notify: webhook delivery failed: {e}");
        }
    });
}
