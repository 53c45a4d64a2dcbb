//! Prompt assembly for the agent loop.
//!
//! Each LM call gets: one system message (identity, workspace primer
//! files, memory, session footer), the session history tail, and the
//! incoming user turn with any image media inlined as data-URI parts.

use std::path::{Path, PathBuf};

use base64::Engine;
use chrono::Utc;
use tracing::debug;

use ferrobot_core::types::{ContentPart, ImageUrl, Message, ToolCall};

use crate::memory::MemoryStore;

/// Workspace files folded into the system prompt when present.
const PRIMER_FILES: &[&str] = &["AGENTS.md", "SOUL.md", "USER.md", "TOOLS.md", "IDENTITY.md"];

/// Media with these extensions never becomes a vision part — the
/// transcript already rides in the message text.
const AUDIO_EXTENSIONS: &[&str] = &["ogg", "oga", "opus", "mp3", "m4a", "wav", "flac", "aac", "wma"];

/// Builds the message list handed to the LM provider each turn.
pub struct ContextBuilder {
    workspace: PathBuf,
    agent_name: String,
    memory: MemoryStore,
}

impl ContextBuilder {
    pub fn new(workspace: impl Into<PathBuf>, agent_name: impl Into<String>) -> Self {
        let workspace = workspace.into();
        let memory = MemoryStore::new(&workspace);
        Self {
            workspace,
            agent_name: agent_name.into(),
            memory,
        }
    }

    /// The memory store backing the prompt.
    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    // ────────────── Per-turn assembly ──────────────

    /// Assemble the full message list for one LM call.
    pub fn messages_for_turn(
        &self,
        history: &[Message],
        user_text: &str,
        media: &[String],
        channel: &str,
        chat_id: &str,
    ) -> Vec<Message> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(self.system_message(channel, chat_id));
        messages.extend_from_slice(history);
        messages.push(user_turn(user_text, media));
        messages
    }

    /// The system message: identity, primers, memory, session footer.
    fn system_message(&self, channel: &str, chat_id: &str) -> Message {
        let mut prompt = self.identity_block();

        for name in PRIMER_FILES {
            let path = self.workspace.join(name);
            if let Ok(body) = std::fs::read_to_string(&path) {
                debug!(file = name, "picked up workspace primer");
                prompt.push_str("\n\n---\n\n");
                prompt.push_str(&format!("## {name}\n\n{body}"));
            }
        }

        if let Some(memory) = self.memory.get_memory_context() {
            prompt.push_str("\n\n---\n\n");
            prompt.push_str(&memory);
        }

        prompt.push_str(&format!(
            "\n\n## Current Session\nChannel: {channel}\nChat ID: {chat_id}"
        ));

        Message::system(prompt)
    }

    /// Who the agent is and how it should behave.
    fn identity_block(&self) -> String {
        let now = Utc::now();
        format!(
            "# {name}\n\n\
             You are {name}, a tool-using assistant people reach over chat.\n\n\
             Environment:\n\
             - Time: {time}\n\
             - Host: Rust runtime on {os}/{arch}\n\
             - Workspace root: `{workspace}`\n\n\
             Reach for your tools instead of guessing — they read and write \
             files, run commands, and browse the web. Keep answers short and \
             concrete.\n\n\
             ## Remembering\n\n\
             Durable facts about the user or the project belong in \
             `{memory_file}`; update it with the file tools. Day-to-day notes \
             go to `{workspace}/memory/{date}.md`.",
            name = self.agent_name,
            time = now.format("%Y-%m-%d %H:%M:%S UTC"),
            os = std::env::consts::OS,
            arch = std::env::consts::ARCH,
            workspace = self.workspace.display(),
            memory_file = self.memory.memory_file().display(),
            date = now.format("%Y-%m-%d"),
        )
    }

    // ────────────── Transcript helpers ──────────────

    /// Append an assistant turn. A turn that only requests tools carries
    /// the calls; a plain turn carries its text.
    pub fn push_assistant(
        messages: &mut Vec<Message>,
        content: Option<String>,
        tool_calls: Vec<ToolCall>,
    ) {
        if tool_calls.is_empty() {
            if let Some(text) = content {
                messages.push(Message::assistant(text));
            }
        } else {
            messages.push(Message::assistant_tool_calls(tool_calls));
        }
    }

    /// Append a tool result paired to its call id.
    pub fn push_tool_result(messages: &mut Vec<Message>, call_id: &str, output: &str) {
        messages.push(Message::tool_result(call_id, output));
    }
}

// ─────────────────────────────────────────────
// User turn + media parts
// ─────────────────────────────────────────────

/// The incoming user turn, multipart only when image media is attached.
fn user_turn(text: &str, media: &[String]) -> Message {
    let mut parts = image_parts(media);
    if parts.is_empty() {
        return Message::user(text);
    }
    parts.push(ContentPart::Text {
        text: text.to_string(),
    });
    Message::user_parts(parts)
}

/// Readable image media as base64 data-URI vision parts. Audio is
/// filtered out; unreadable files are silently dropped.
fn image_parts(media: &[String]) -> Vec<ContentPart> {
    media
        .iter()
        .filter(|path| !has_audio_extension(path))
        .filter_map(|path| {
            let bytes = std::fs::read(path).ok()?;
            let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
            Some(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:{};base64,{encoded}", image_mime(path)),
                    detail: None,
                },
            })
        })
        .collect()
}

fn has_audio_extension(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| AUDIO_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn image_mime(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use ferrobot_core::types::MessageContent;

    fn system_text(messages: &[Message]) -> &str {
        match &messages[0] {
            Message::System { content } => content,
            other => panic!("expected system message, got {other:?}"),
        }
    }

    #[test]
    fn identity_names_agent_and_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ContextBuilder::new(dir.path(), "Ferrobot");

        let identity = ctx.identity_block();
        assert!(identity.starts_with("# Ferrobot"));
        assert!(identity.contains(&dir.path().display().to_string()));
        assert!(identity.contains("Rust runtime on"));
        assert!(identity.contains("## Remembering"));
    }

    #[test]
    fn primer_files_folded_into_prompt() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("AGENTS.md"), "Always be brief.").unwrap();
        std::fs::write(dir.path().join("USER.md"), "The user is Ada.").unwrap();

        let ctx = ContextBuilder::new(dir.path(), "Ferrobot");
        let messages = ctx.messages_for_turn(&[], "hi", &[], "cli", "direct");
        let prompt = system_text(&messages);

        assert!(prompt.contains("## AGENTS.md"));
        assert!(prompt.contains("Always be brief."));
        assert!(prompt.contains("The user is Ada."));
    }

    #[test]
    fn memory_lands_in_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let memory_dir = dir.path().join("memory");
        std::fs::create_dir(&memory_dir).unwrap();
        std::fs::write(memory_dir.join("MEMORY.md"), "Prefers dark mode.").unwrap();

        let ctx = ContextBuilder::new(dir.path(), "Ferrobot");
        let messages = ctx.messages_for_turn(&[], "hi", &[], "cli", "direct");

        assert!(system_text(&messages).contains("Prefers dark mode."));
    }

    #[test]
    fn session_footer_closes_the_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ContextBuilder::new(dir.path(), "Ferrobot");

        let messages = ctx.messages_for_turn(&[], "hello", &[], "telegram", "chat_42");
        let prompt = system_text(&messages);

        assert!(prompt.ends_with("## Current Session\nChannel: telegram\nChat ID: chat_42"));
    }

    #[test]
    fn history_sits_between_system_and_user_turn() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ContextBuilder::new(dir.path(), "Ferrobot");

        let history = vec![Message::user("earlier"), Message::assistant("noted")];
        let messages = ctx.messages_for_turn(&history, "and now?", &[], "cli", "direct");

        assert_eq!(messages.len(), 4);
        assert!(matches!(messages[0], Message::System { .. }));
        assert_eq!(messages[1], Message::user("earlier"));
        assert_eq!(messages[3], Message::user("and now?"));
    }

    #[test]
    fn turn_without_media_is_plain_text() {
        let msg = user_turn("no pictures", &[]);
        assert_eq!(msg, Message::user("no pictures"));
    }

    #[test]
    fn image_media_becomes_data_uri_part() {
        let dir = tempfile::tempdir().unwrap();
        let picture = dir.path().join("shot.png");
        std::fs::write(&picture, b"\x89PNG\r\n").unwrap();

        let msg = user_turn("look at this", &[picture.display().to_string()]);
        let Message::User {
            content: MessageContent::Parts(parts),
        } = msg
        else {
            panic!("expected multipart turn");
        };

        assert_eq!(parts.len(), 2);
        let ContentPart::ImageUrl { image_url } = &parts[0] else {
            panic!("expected image part first");
        };
        assert!(image_url.url.starts_with("data:image/png;base64,"));
        assert_eq!(parts[1], ContentPart::Text { text: "look at this".into() });
    }

    #[test]
    fn audio_media_never_becomes_a_part() {
        let dir = tempfile::tempdir().unwrap();
        let voice = dir.path().join("note.OGG");
        std::fs::write(&voice, b"opusdata").unwrap();

        // With only audio attached the turn stays plain text.
        let msg = user_turn("listen", &[voice.display().to_string()]);
        assert_eq!(msg, Message::user("listen"));
    }

    #[test]
    fn unreadable_media_is_dropped() {
        let msg = user_turn("gone", &["/no/such/image.png".to_string()]);
        assert_eq!(msg, Message::user("gone"));
    }

    #[test]
    fn image_mime_by_extension() {
        assert_eq!(image_mime("a.png"), "image/png");
        assert_eq!(image_mime("a.PNG"), "image/png");
        assert_eq!(image_mime("a.webp"), "image/webp");
        assert_eq!(image_mime("a.jpg"), "image/jpeg");
        assert_eq!(image_mime("mystery"), "image/jpeg");
    }

    #[test]
    fn push_assistant_prefers_tool_calls() {
        let mut messages = Vec::new();
        let call = ToolCall::new("c1", "read_file", r#"{"path":"x"}"#);
        ContextBuilder::push_assistant(&mut messages, Some("interim".into()), vec![call]);

        assert_eq!(messages.len(), 1);
        assert!(matches!(
            &messages[0],
            Message::Assistant { tool_calls: Some(calls), .. } if calls.len() == 1
        ));
    }

    #[test]
    fn push_assistant_with_no_content_is_a_noop() {
        let mut messages = Vec::new();
        ContextBuilder::push_assistant(&mut messages, None, vec![]);
        assert!(messages.is_empty());
    }

    #[test]
    fn push_tool_result_pairs_by_id() {
        let mut messages = Vec::new();
        ContextBuilder::push_tool_result(&mut messages, "c9", "output");
        assert_eq!(messages[0], Message::tool_result("c9", "output"));
    }
}
