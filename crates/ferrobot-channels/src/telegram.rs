//! Telegram channel — bot integration via `teloxide`.
//!
//! - Long polling (no webhook/public IP needed)
//! - Text, photo, voice, audio, document handling with media download
//! - Voice/audio transcription hook (`[transcription: ...]`)
//! - Markdown → Telegram HTML conversion with plain-text fallback
//! - Typed outbound attachments extracted from content
//! - Allowlist by user ID or username
//! - Commands: /start, /reset, /help
//! - Message splitting for >4096 char responses

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{
    BotCommand, ChatAction, InputFile, MediaKind, MessageKind, ParseMode, UpdateKind,
};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use ferrobot_core::bus::queue::MessageBus;
use ferrobot_core::bus::types::{InboundMessage, OutboundMessage};
use ferrobot_core::types::MediaAttachment;
use ferrobot_core::utils::get_media_path;

use crate::attachments::{render_outbound, AttachmentKind};
use crate::base::{allowlist_permits, Channel};
use crate::formatting::{split_chunks, to_telegram_html};

/// Telegram message length limit.
const TELEGRAM_MAX_LEN: usize = 4096;

/// Transport error backoff.
const RECONNECT_DELAY_SECS: u64 = 5;

/// Callback for voice/audio transcription: file path in, transcript out.
pub type TranscribeFn = Arc<
    dyn Fn(String) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send>> + Send + Sync,
>;

/// Telegram bot channel using long polling.
pub struct TelegramChannel {
    token: String,
    bus: Arc<MessageBus>,
    /// Workspace for resolving relative outbound file references.
    workspace: Option<std::path::PathBuf>,
    /// Allowlist of user IDs / usernames. Empty = allow everyone.
    allowed_users: Vec<String>,
    /// Optional voice transcription callback.
    transcriber: Option<TranscribeFn>,
    shutdown: Arc<Notify>,
}

impl TelegramChannel {
    /// Create a new Telegram channel.
    pub fn new(
        token: String,
        bus: Arc<MessageBus>,
        allowed_users: Vec<String>,
        workspace: Option<std::path::PathBuf>,
    ) -> Self {
        Self {
            token,
            bus,
            workspace,
            allowed_users,
            transcriber: None,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Set the voice transcription callback.
    pub fn with_transcriber(mut self, transcriber: TranscribeFn) -> Self {
        self.transcriber = Some(transcriber);
        self
    }

    async fn try_transcribe(&self, path: &str) -> Option<String> {
        let transcriber = self.transcriber.as_ref()?;
        match transcriber(path.to_string()).await {
            Ok(text) if !text.is_empty() => {
                debug!(path = %path, chars = text.len(), "voice transcribed");
                Some(text)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "voice transcription failed");
                None
            }
        }
    }

    /// Handle an incoming Telegram update.
    async fn handle_update(&self, bot: &Bot, update: &Update) {
        let message = match &update.kind {
            UpdateKind::Message(msg) => msg,
            _ => return,
        };

        let user = match message.from.as_ref() {
            Some(u) => u,
            None => return,
        };

        let user_id = user.id.0.to_string();
        let username = user.username.as_deref().unwrap_or("").to_string();
        let first_name = user.first_name.clone();
        let sender_id = format!("{user_id}|{username}");
        let chat_id = message.chat.id.0.to_string();
        let is_group = message.chat.is_group() || message.chat.is_supergroup();

        if !self.is_allowed(&sender_id) {
            warn!(sender = %sender_id, chat = %chat_id, "unauthorized telegram sender, ignoring");
            return;
        }

        if let Some(text) = message.text() {
            if text.starts_with('/') {
                self.handle_command(bot, message, text, &first_name).await;
                return;
            }
        }

        let mut content_parts: Vec<String> = Vec::new();
        let mut media_paths: Vec<String> = Vec::new();

        match &message.kind {
            MessageKind::Common(common) => match &common.media_kind {
                MediaKind::Text(text_msg) => {
                    content_parts.push(text_msg.text.clone());
                }
                MediaKind::Photo(photo) => {
                    if let Some(caption) = &photo.caption {
                        content_parts.push(caption.clone());
                    }
                    if let Some(largest) = photo.photo.last() {
                        match self.download_file(bot, &largest.file.id.0).await {
                            Ok(path) => {
                                content_parts.push(format!("[attachment: {path}]"));
                                media_paths.push(path);
                            }
                            Err(e) => {
                                warn!(error = %e, "failed to download photo");
                                content_parts.push("[attachment: download failed]".into());
                            }
                        }
                    }
                }
                MediaKind::Voice(voice) => {
                    match self.download_file(bot, &voice.voice.file.id.0).await {
                        Ok(path) => {
                            if let Some(text) = self.try_transcribe(&path).await {
                                content_parts.push(format!("[transcription: {text}]"));
                            } else {
                                content_parts.push(format!("[attachment: {path}]"));
                            }
                            media_paths.push(path);
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to download voice");
                            content_parts.push("[attachment: download failed]".into());
                        }
                    }
                }
                MediaKind::Audio(audio) => {
                    if let Some(caption) = &audio.caption {
                        content_parts.push(caption.clone());
                    }
                    match self.download_file(bot, &audio.audio.file.id.0).await {
                        Ok(path) => {
                            if let Some(text) = self.try_transcribe(&path).await {
                                content_parts.push(format!("[transcription: {text}]"));
                            } else {
                                content_parts.push(format!("[attachment: {path}]"));
                            }
                            media_paths.push(path);
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to download audio");
                            content_parts.push("[attachment: download failed]".into());
                        }
                    }
                }
                MediaKind::Document(doc) => {
                    if let Some(caption) = &doc.caption {
                        content_parts.push(caption.clone());
                    }
                    match self.download_file(bot, &doc.document.file.id.0).await {
                        Ok(path) => {
                            content_parts.push(format!("[attachment: {path}]"));
                            media_paths.push(path);
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to download document");
                            content_parts.push("[attachment: download failed]".into());
                        }
                    }
                }
                _ => {
                    debug!("unsupported telegram media type, ignoring");
                    return;
                }
            },
            _ => return,
        }

        let content = content_parts.join("\n");
        if content.is_empty() {
            return;
        }

        debug!(sender = %sender_id, chat = %chat_id, content_len = content.len(), "telegram inbound");

        // Typing indicator while the agent works.
        let typing_bot = bot.clone();
        let typing_chat = message.chat.id;
        let typing_stop = Arc::new(Notify::new());
        let typing_signal = typing_stop.clone();
        tokio::spawn(async move {
            loop {
                let _ = typing_bot.send_chat_action(typing_chat, ChatAction::Typing).await;
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(4)) => {}
                    _ = typing_signal.notified() => break,
                }
            }
        });
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(120)).await;
            typing_stop.notify_waiters();
        });

        let mut inbound = InboundMessage::new("telegram", &sender_id, &chat_id, &content);
        for path in &media_paths {
            inbound.media.push(MediaAttachment {
                path: path.clone(),
                mime_type: "application/octet-stream".into(),
                filename: None,
                size: None,
            });
        }
        inbound.metadata.insert("user_id".into(), json!(user_id));
        inbound.metadata.insert("username".into(), json!(username));
        inbound.metadata.insert("is_group".into(), json!(is_group));
        inbound
            .metadata
            .insert("message_ts".into(), json!(message.id.0.to_string()));

        if let Err(e) = self.bus.publish_inbound(inbound).await {
            error!(error = %e, "failed to publish telegram message to bus");
        }
    }

    async fn handle_command(&self, bot: &Bot, message: &Message, text: &str, first_name: &str) {
        let command = text.split_whitespace().next().unwrap_or("");
        // Strip @botname (e.g. /start@mybot)
        let command = command.split('@').next().unwrap_or(command);
        let chat = message.chat.id;

        match command {
            "/start" => {
                let greeting = format!(
                    "Hi {first_name}! I'm Ferrobot, your AI assistant.\n\n\
                     Send me any message and I'll do my best to help!\n\n\
                     Commands:\n\
                     /help — Show available commands\n\
                     /reset — Clear conversation history"
                );
                let _ = bot.send_message(chat, greeting).await;
            }
            "/help" => {
                let help = "<b>Ferrobot Commands</b>\n\n\
                     /start — Start the bot\n\
                     /reset — Clear conversation history\n\
                     /help — Show this message\n\n\
                     Just send me text, photos, voice messages, or documents.";
                let _ = bot.send_message(chat, help).parse_mode(ParseMode::Html).await;
            }
            "/reset" => {
                // TODO: wire the session manager so /reset actually clears
                // the conversation instead of only acknowledging.
                let _ = bot.send_message(chat, "Conversation history cleared.").await;
            }
            _ => {
                debug!(command = command, "unknown telegram command");
            }
        }
    }

    /// Download a file from Telegram into the shared media directory.
    async fn download_file(&self, bot: &Bot, file_id: &str) -> anyhow::Result<String> {
        use teloxide::types::FileId;
        let file = bot.get_file(FileId(file_id.to_string())).send().await?;

        let media_dir = get_media_path();
        std::fs::create_dir_all(&media_dir)?;

        let ext = file
            .path
            .rsplit('.')
            .next()
            .map(|e| format!(".{e}"))
            .unwrap_or_default();

        let local_path = media_dir.join(format!("{}{}", file_id.replace('/', "_"), ext));

        let mut dst = tokio::fs::File::create(&local_path).await?;
        let mut stream = bot.download_file_stream(&file.path);
        use futures_util::StreamExt;
        while let Some(chunk) = stream.next().await {
            dst.write_all(&chunk?).await?;
        }

        info!(path = %local_path.display(), "downloaded telegram file");
        Ok(local_path.display().to_string())
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    fn is_allowed(&self, sender_id: &str) -> bool {
        allowlist_permits(&self.allowed_users, sender_id)
    }

    async fn start(&self) -> anyhow::Result<()> {
        info!("starting telegram channel (long polling)");

        let bot = Bot::new(&self.token);

        let commands = vec![
            BotCommand::new("start", "Start the bot"),
            BotCommand::new("help", "Show available commands"),
            BotCommand::new("reset", "Clear conversation history"),
        ];
        if let Err(e) = bot.set_my_commands(commands).await {
            warn!(error = %e, "failed to set bot commands menu");
        }

        info!("telegram bot connected, polling for updates");

        let mut offset: i32 = 0;

        loop {
            tokio::select! {
                updates = bot.get_updates().offset(offset).timeout(30).send() => {
                    match updates {
                        Ok(updates) => {
                            for update in &updates {
                                offset = (update.id.0 as i32).wrapping_add(1);
                                self.handle_update(&bot, update).await;
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "telegram polling error");
                            tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_DELAY_SECS)).await;
                        }
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("telegram channel shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.shutdown.notify_waiters();
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> anyhow::Result<()> {
        let bot = Bot::new(&self.token);
        let chat_id: i64 = msg
            .chat_id
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid telegram chat_id: {}", msg.chat_id))?;
        let chat = ChatId(chat_id);

        // Extract typed attachments, then format what's left.
        let rendered = render_outbound(&msg.content, self.workspace.as_deref());

        for attachment in &rendered.attachments {
            let input = InputFile::file(attachment.path.clone());
            let result = match attachment.kind {
                AttachmentKind::Image => {
                    bot.send_photo(chat, input)
                        .caption(attachment.filename.clone())
                        .await
                        .map(|_| ())
                }
                AttachmentKind::Audio => {
                    bot.send_audio(chat, input)
                        .caption(attachment.filename.clone())
                        .await
                        .map(|_| ())
                }
                AttachmentKind::Video => {
                    bot.send_video(chat, input)
                        .caption(attachment.filename.clone())
                        .await
                        .map(|_| ())
                }
                AttachmentKind::Document => {
                    bot.send_document(chat, input)
                        .caption(attachment.filename.clone())
                        .await
                        .map(|_| ())
                }
            };
            if let Err(e) = result {
                warn!(
                    path = %attachment.path.display(),
                    error = %e,
                    "failed to send telegram attachment"
                );
            }
        }

        if rendered.text.is_empty() {
            return Ok(());
        }

        let html = to_telegram_html(&rendered.text);
        let chunks = split_chunks(&html, TELEGRAM_MAX_LEN);

        for chunk in &chunks {
            let result = bot
                .send_message(chat, chunk)
                .parse_mode(ParseMode::Html)
                .await;

            if let Err(e) = result {
                debug!(error = %e, "HTML send failed, retrying as plain text");
                let plain_chunks = split_chunks(&rendered.text, TELEGRAM_MAX_LEN);
                for plain_chunk in &plain_chunks {
                    let _ = bot.send_message(chat, plain_chunk).await;
                }
                return Ok(());
            }
        }

        debug!(chat_id = chat_id, "telegram message sent");
        Ok(())
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
