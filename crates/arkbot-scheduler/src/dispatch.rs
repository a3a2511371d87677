//! Reminder dispatch: posts reminder payloads to a chat webhook, or just logs
//! them when no webhook is configured.

use arkbot_core::config::DeliveryConfig;
use arkbot_core::error::DeliveryError;
use arkbot_core::traits::Deliverer;
use arkbot_core::types::{NotifyPriority, ReminderPayload, channel_id, offset_label};
use async_trait::async_trait;
use reqwest::StatusCode;

/// Delivers reminders through a Discord-style webhook as an embed that
/// mentions the recipient. Channel recipients get the embed with no mention.
pub struct WebhookDeliverer {
    client: reqwest::Client,
    webhook_url: String,
    username: Option<String>,
}

impl WebhookDeliverer {
    pub fn new(webhook_url: impl Into<String>, username: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: webhook_url.into(),
            username,
        }
    }

    fn body(&self, recipient_id: &str, payload: &ReminderPayload) -> serde_json::Value {
        let color = match payload.priority {
            NotifyPriority::Urgent => 0xFF0000,  // Red
            NotifyPriority::High => 0xFF8800,    // Orange
            NotifyPriority::Normal => 0x00AAFF,  // Blue
            NotifyPriority::Low => 0x888888,     // Gray
        };
        let (content, mentions) = match channel_id(recipient_id) {
            Some(_) => (None, serde_json::json!({ "parse": [] })),
            None => (
                Some(format!("<@{recipient_id}>")),
                serde_json::json!({ "users": [recipient_id] }),
            ),
        };
        let mut body = serde_json::json!({
            "allowed_mentions": mentions,
            "embeds": [{
                "title": payload.title(),
                "description": format!(
                    "Starts <t:{}:R> ({})",
                    payload.reference_time.timestamp(),
                    payload.reference_time.format("%Y-%m-%d %H:%M UTC")
                ),
                "color": color,
                "footer": { "text": format!("{} • {}", payload.target_id, offset_label(payload.offset_seconds)) }
            }]
        });
        if let Some(content) = content {
            body["content"] = serde_json::Value::String(content);
        }
        if let Some(name) = &self.username {
            body["username"] = serde_json::Value::String(name.clone());
        }
        body
    }
}

/// Map a webhook response status onto the delivery taxonomy.
/// `None` means success.
pub fn classify_status(status: StatusCode) -> Option<DeliveryError> {
    if status.is_success() {
        return None;
    }
    let reason = format!("webhook returned {status}");
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
            Some(DeliveryError::Permanent(reason))
        }
        StatusCode::TOO_MANY_REQUESTS => Some(DeliveryError::Transient(reason)),
        s if s.is_server_error() => Some(DeliveryError::Transient(reason)),
        _ => Some(DeliveryError::Permanent(reason)),
    }
}

#[async_trait]
impl Deliverer for WebhookDeliverer {
    async fn deliver(
        &self,
        recipient_id: &str,
        payload: &ReminderPayload,
    ) -> Result<(), DeliveryError> {
        let resp = self
            .client
            .post(&self.webhook_url)
            .json(&self.body(recipient_id, payload))
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(format!("webhook send failed: {e}")))?;

        match classify_status(resp.status()) {
            None => {
                tracing::debug!("✅ Webhook reminder sent to {recipient_id}: {}", payload.title());
                Ok(())
            }
            Some(err) => Err(err),
        }
    }
}

/// Delivery that only logs. Used when no webhook is configured.
pub struct LogDeliverer;

#[async_trait]
impl Deliverer for LogDeliverer {
    async fn deliver(
        &self,
        recipient_id: &str,
        payload: &ReminderPayload,
    ) -> Result<(), DeliveryError> {
        tracing::info!("📢 [{}] {} → {}", recipient_id, payload.title(), payload.target_id);
        Ok(())
    }
}

/// Build the deliverer described by the delivery config.
pub fn deliverer_from_config(config: &DeliveryConfig) -> std::sync::Arc<dyn Deliverer> {
    match config.webhook_url.as_deref().filter(|u| !u.trim().is_empty()) {
        Some(url) => std::sync::Arc::new(WebhookDeliverer::new(url, config.username.clone())),
        None => {
            tracing::warn!("⚠️ No webhook configured, reminders will only be logged");
            std::sync::Arc::new(LogDeliverer)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arkbot_core::types::NotificationTarget;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_classify_status() {
        assert!(classify_status(StatusCode::NO_CONTENT).is_none());
        assert!(classify_status(StatusCode::OK).is_none());
        assert!(!classify_status(StatusCode::FORBIDDEN).unwrap().is_transient());
        assert!(!classify_status(StatusCode::NOT_FOUND).unwrap().is_transient());
        assert!(!classify_status(StatusCode::BAD_REQUEST).unwrap().is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS).unwrap().is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY).unwrap().is_transient());
    }

    #[test]
    fn test_body_mentions_recipient() {
        let start = Utc.with_ymd_and_hms(2026, 3, 7, 20, 0, 0).unwrap();
        let target = NotificationTarget::new("7", start, ["123"]).with_label("Ark");
        let payload = ReminderPayload::new(&target, "123", 0);
        let deliverer = WebhookDeliverer::new("http://localhost/hook", Some("ArkBot".into()));

        let body = deliverer.body("123", &payload);
        assert_eq!(body["content"], "<@123>");
        assert_eq!(body["username"], "ArkBot");
        assert_eq!(body["embeds"][0]["title"], "Ark reminder (start)");
        assert_eq!(body["embeds"][0]["color"], 0xFF0000);
    }

    #[test]
    fn test_channel_body_has_no_mention() {
        let start = Utc.with_ymd_and_hms(2026, 3, 7, 20, 0, 0).unwrap();
        let target = NotificationTarget::new("7", start, ["channel:555"]).with_label("Ark");
        let payload = ReminderPayload::new(&target, "channel:555", -3600);
        let deliverer = WebhookDeliverer::new("http://localhost/hook", None);

        let body = deliverer.body("channel:555", &payload);
        assert!(body.get("content").is_none());
        assert_eq!(body["allowed_mentions"]["parse"], serde_json::json!([]));
        assert!(body["allowed_mentions"].get("users").is_none());
        assert_eq!(body["embeds"][0]["title"], "Ark reminder (1h)");
    }

    #[tokio::test]
    async fn test_unreachable_webhook_is_transient() {
        let deliverer = WebhookDeliverer::new("http://127.0.0.1:9/hook", None);
        let start = Utc.with_ymd_and_hms(2026, 3, 7, 20, 0, 0).unwrap();
        let payload = ReminderPayload::new(&NotificationTarget::new("7", start, ["1"]), "1", 0);
        let err = deliverer.deliver("1", &payload).await.unwrap_err();
        assert!(err.is_transient());
    }
}
