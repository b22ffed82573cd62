use std::sync::Mutex;
use tracing::{info, warn};

/// Telegram transport. Without token/chat id every send is a no-op.
#[derive(Clone)]
struct TelegramTransport {
    bot_token: Option<String>,
    chat_id: Option<String>,
    client: reqwest::Client,
}

impl TelegramTransport {
    fn from_env() -> Self {
        let bot_token = std::env::var("TELEGRAM_BOT_TOKEN")
            .ok()
            .filter(|s| !s.is_empty());
        let chat_id = std::env::var("TELEGRAM_CHAT_ID")
            .ok()
            .filter(|s| !s.is_empty());

        if bot_token.is_some() && chat_id.is_some() {
            info!("Telegram notifications enabled");
        } else {
            info!("Telegram notifications disabled (missing TELEGRAM_BOT_TOKEN or TELEGRAM_CHAT_ID)");
        }

        TelegramTransport {
            bot_token,
            chat_id,
            client: reqwest::Client::new(),
        }
    }

    async fn send(&self, text: &str) {
        let (Some(token), Some(chat_id)) = (&self.bot_token, &self.chat_id) else {
            return;
        };

        let url = format!("https://api.telegram.org/bot{}/sendMessage", token);
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true
        });

        match self.client.post(&url).json(&body).send().await {
            Ok(resp) if !resp.status().is_success() => {
                warn!("Telegram API error: {}", resp.status());
            }
            Err(e) => {
                warn!("Telegram send failed: {}", e);
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    channel: String,
    text: String,
}

/// Queued notification sink. Routine messages accumulate across a tick
/// and go out on `flush`; critical alerts bypass the queue.
pub struct Notifier {
    transport: TelegramTransport,
    queue: Mutex<Vec<QueuedMessage>>,
}

impl Notifier {
    pub fn from_env() -> Self {
        Notifier {
            transport: TelegramTransport::from_env(),
            queue: Mutex::new(Vec::new()),
        }
    }

    pub fn queue(&self, channel: &str, text: impl Into<String>) {
        self.queue.lock().unwrap().push(QueuedMessage {
            channel: channel.to_string(),
            text: text.into(),
        });
    }

    pub fn queued_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Drain the queue, one message per channel batch.
    pub async fn flush(&self) {
        let drained: Vec<QueuedMessage> = {
            let mut queue = self.queue.lock().unwrap();
            queue.drain(..).collect()
        };
        if drained.is_empty() {
            return;
        }

        let mut channels: Vec<String> = Vec::new();
        for m in &drained {
            if !channels.contains(&m.channel) {
                channels.push(m.channel.clone());
            }
        }
        for channel in channels {
            let batch: Vec<&str> = drained
                .iter()
                .filter(|m| m.channel == channel)
                .map(|m| m.text.as_str())
                .collect();
            let text = format!("<b>[{}]</b>\n{}", channel, batch.join("\n"));
            self.transport.send(&text).await;
        }
    }

    /// Immediate send for guaranteed-win-path errors and detections.
    pub async fn send_critical(&self, text: &str) {
        self.transport
            .send(&format!("<b>[critical]</b>\n{}", html_escape(text)))
            .await;
    }
}

pub fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
