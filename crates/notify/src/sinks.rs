use async_trait::async_trait;
use teloxide::prelude::Requester;
use teloxide::types::ChatId;
use teloxide::Bot;
use tracing::info;

use common::{Error, Notification, NotificationSink, Priority, Result};

/// Delivers notifications to one or more Telegram chats.
pub struct TelegramSink {
    bot: Bot,
    chat_ids: Vec<ChatId>,
}

impl TelegramSink {
    pub fn new(token: impl Into<String>, chat_ids: &[i64]) -> Self {
        Self {
            bot: Bot::new(token.into()),
            chat_ids: chat_ids.iter().map(|&id| ChatId(id)).collect(),
        }
    }

    fn render(notification: &Notification) -> String {
        let marker = match notification.priority {
            Priority::High => "🚨",
            Priority::Normal => "ℹ️",
            Priority::Low => "·",
        };
        format!("{marker} {}\n{}", notification.title, notification.body)
    }
}

#[async_trait]
impl NotificationSink for TelegramSink {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let text = Self::render(notification);
        for chat_id in &self.chat_ids {
            self.bot
                .send_message(*chat_id, text.clone())
                .await
                .map_err(|e| Error::Http(e.to_string()))?;
        }
        Ok(())
    }
}

/// Fallback sink when no Telegram token is configured: alerts land in the
/// process log.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, notification: &Notification) -> Result<()> {
        info!(
            priority = ?notification.priority,
            title = %notification.title,
            body = %notification.body,
            "Notification"
        );
        Ok(())
    }
}
