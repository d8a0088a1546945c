// =============================================================================
// Telegram transport — alert delivery and command long-polling
// =============================================================================
//
// Built on teloxide:
//   - send_message (HTML parse mode, optional inline keyboard) for alerts,
//   - get_updates long-polling for operator commands,
//   - answer_callback_query to acknowledge inline button presses.
//
// Updates from any chat other than the configured one are ignored.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{
    AllowedUpdate, ChatId, InlineKeyboardButton, InlineKeyboardMarkup, ParseMode, UpdateKind,
};
use tracing::{debug, info, warn};

use crate::alerts::{self, AlertControl, AlertSink};
use crate::commands;
use crate::guardian::GuardianController;

/// Seconds the server holds a getUpdates request open. Stays below the
/// default teloxide client timeout.
const LONG_POLL_SECS: u32 = 10;

/// Pause after a failed poll before trying again.
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);

pub struct TelegramNotifier {
    bot: Bot,
    chat_id: ChatId,
}

impl TelegramNotifier {
    pub fn new(bot_token: &str, chat_id: i64) -> Self {
        Self {
            bot: Bot::new(bot_token),
            chat_id: ChatId(chat_id),
        }
    }

    pub async fn send_text(&self, chat_id: ChatId, text: &str, controls: &[AlertControl]) -> Result<()> {
        let mut request = self
            .bot
            .send_message(chat_id, text)
            .parse_mode(ParseMode::Html);
        if !controls.is_empty() {
            request = request.reply_markup(keyboard(controls));
        }

        request.await.context("Telegram sendMessage failed")?;
        debug!(chat_id = chat_id.0, length = text.len(), "Telegram message sent");
        Ok(())
    }

    /// Long-poll for commands forever, answering each in the configured chat.
    pub async fn run_command_loop(self: Arc<Self>, controller: Arc<GuardianController>) {
        info!(chat_id = self.chat_id.0, "Telegram command loop started");
        let mut offset: i32 = 0;

        loop {
            let mut request = self
                .bot
                .get_updates()
                .timeout(LONG_POLL_SECS)
                .allowed_updates(vec![AllowedUpdate::Message, AllowedUpdate::CallbackQuery]);
            if offset > 0 {
                request = request.offset(offset);
            }

            let updates = match request.await {
                Ok(updates) => updates,
                Err(e) => {
                    warn!(error = %e, "Telegram getUpdates failed — retrying");
                    tokio::time::sleep(POLL_RETRY_DELAY).await;
                    continue;
                }
            };

            for update in &updates {
                offset = offset.max(update.id.0 as i32 + 1);
                if let Some(incoming) = extract_command(update) {
                    self.handle_command(&controller, incoming).await;
                }
            }
        }
    }

    async fn handle_command(&self, controller: &GuardianController, incoming: IncomingCommand) {
        if incoming.chat_id != self.chat_id {
            warn!(chat_id = incoming.chat_id.0, "ignoring command from unknown chat");
            return;
        }

        if let Some(callback_id) = incoming.callback_id {
            if let Err(e) = self.bot.answer_callback_query(callback_id).await {
                debug!(error = %e, "callback acknowledgement failed");
            }
        }

        let Some(reply) = commands::handle(controller, &incoming.text) else {
            debug!(text = %incoming.text, "ignoring non-command message");
            return;
        };
        info!(command = %incoming.text, "operator command handled");

        if let Err(e) = self.send_text(self.chat_id, &reply, &alerts::status_controls()).await {
            warn!(error = %e, "failed to send command reply");
        }
    }
}

#[async_trait]
impl AlertSink for TelegramNotifier {
    async fn send(&self, message: &str, controls: &[AlertControl]) -> Result<()> {
        self.send_text(self.chat_id, message, controls).await
    }
}

impl std::fmt::Debug for TelegramNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramNotifier")
            .field("bot_token", &"<redacted>")
            .field("chat_id", &self.chat_id.0)
            .finish()
    }
}

/// One row of callback buttons, each carrying its command as callback data.
fn keyboard(controls: &[AlertControl]) -> InlineKeyboardMarkup {
    let row: Vec<InlineKeyboardButton> = controls
        .iter()
        .map(|c| InlineKeyboardButton::callback(c.label.clone(), c.command.clone()))
        .collect();
    InlineKeyboardMarkup::new(vec![row])
}

/// A command-bearing update: plain message text or inline button data.
#[derive(Debug, PartialEq)]
struct IncomingCommand {
    chat_id: ChatId,
    text: String,
    callback_id: Option<String>,
}

fn extract_command(update: &Update) -> Option<IncomingCommand> {
    let chat_id = update.chat()?.id;
    match &update.kind {
        UpdateKind::Message(message) => Some(IncomingCommand {
            chat_id,
            text: message.text()?.to_string(),
            callback_id: None,
        }),
        UpdateKind::CallbackQuery(query) => Some(IncomingCommand {
            chat_id,
            text: query.data.clone()?,
            callback_id: Some(query.id.clone()),
        }),
        _ => None,
    }
}
