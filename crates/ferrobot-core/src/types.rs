//! Chat and tool-call types in the OpenAI chat-completions shape used by
//! every LM provider.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ─────────────────────────────────────────────
// Messages (OpenAI chat completions format)
// ─────────────────────────────────────────────

/// A chat message. Each variant maps to a `role` field value.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role")]
pub enum Message {
    #[serde(rename = "system")]
    System { content: String },

    #[serde(rename = "user")]
    User { content: MessageContent },

    #[serde(rename = "assistant")]
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<ToolCall>>,
    },

    #[serde(rename = "tool")]
    Tool {
        content: String,
        tool_call_id: String,
    },
}

impl Message {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Message::System {
            content: content.into(),
        }
    }

    /// Create a user message with text content.
    pub fn user(content: impl Into<String>) -> Self {
        Message::User {
            content: MessageContent::Text(content.into()),
        }
    }

    /// Create a user message with multipart content (text + images).
    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Message::User {
            content: MessageContent::Parts(parts),
        }
    }

    /// Create an assistant message with text content.
    pub fn assistant(content: impl Into<String>) -> Self {
        Message::Assistant {
            content: Some(content.into()),
            tool_calls: None,
        }
    }

    /// Create an assistant message carrying tool calls (no text content).
    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Message::Assistant {
            content: None,
            tool_calls: Some(tool_calls),
        }
    }

    /// Create a tool result message paired to a tool call by id.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Message::Tool {
            content: content.into(),
            tool_call_id: tool_call_id.into(),
        }
    }
}

// ─────────────────────────────────────────────
// Message content (text or multipart/vision)
// ─────────────────────────────────────────────

/// User message content — plain text or multipart (for vision models).
///
/// When serialized: text becomes a plain string, parts become an array.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// A single part of a multipart user message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

/// Image URL payload (either a URL or a base64 data URI).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ImageUrl {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

// ─────────────────────────────────────────────
// Tool calls (function calling)
// ─────────────────────────────────────────────

/// A tool call from the assistant, requesting execution of a function.
///
/// The `id` is opaque to us; the loop echoes it back paired with the tool's
/// result.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    /// Always "function" in the current API.
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        ToolCall {
            id: id.into(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// The function name and JSON-encoded arguments within a tool call.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

// ─────────────────────────────────────────────
// Tool definitions (sent to the LM)
// ─────────────────────────────────────────────

/// Definition of a tool, forwarded to the LM provider verbatim.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

/// Schema of a function tool: name, description, JSON-Schema parameters.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        ToolDefinition {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

// ─────────────────────────────────────────────
// LM response
// ─────────────────────────────────────────────

/// Response from an LM provider after a chat completion call.
#[derive(Clone, Debug, Default)]
pub struct LlmResponse {
    /// Text content from the assistant (None if only tool calls).
    pub content: Option<String>,
    /// Tool calls requested by the assistant.
    pub tool_calls: Vec<ToolCall>,
    /// Why the model stopped generating.
    pub finish_reason: Option<String>,
    /// Token usage statistics.
    pub usage: Option<UsageInfo>,
}

impl LlmResponse {
    /// Whether the response contains tool calls.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Token usage statistics from the LM.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct UsageInfo {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

// ─────────────────────────────────────────────
// Media attachments
// ─────────────────────────────────────────────

/// A media attachment (photo, voice, document) carried on a bus message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MediaAttachment {
    /// MIME type (e.g. "image/jpeg", "audio/ogg").
    pub mime_type: String,
    /// Local file path to the media.
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

// ─────────────────────────────────────────────
// Wire types for OpenAI-compatible APIs
// ─────────────────────────────────────────────

/// Raw chat completion response, used for deserialization.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionResponse {
    pub choices: Vec<ChatChoice>,
    pub usage: Option<UsageInfo>,
}

#[derive(Debug, Deserialize)]
pub struct ChatChoice {
    pub message: AssistantMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl From<ChatCompletionResponse> for LlmResponse {
    fn from(resp: ChatCompletionResponse) -> Self {
        match resp.choices.into_iter().next() {
            Some(c) => LlmResponse {
                content: c.message.content,
                tool_calls: c.message.tool_calls.unwrap_or_default(),
                finish_reason: c.finish_reason,
                usage: resp.usage,
            },
            None => LlmResponse {
                content: Some("No choices in response".into()),
                ..Default::default()
            },
        }
    }
}

/// Request body for an OpenAI-compatible chat completion API.
#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

// ─────────────────────────────────────────────
// Sessions
// ─────────────────────────────────────────────

/// A conversation session with message history, keyed by session key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub key: String,
    pub messages: Vec<Message>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Session {
    /// Create a new empty session.
    pub fn new(key: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        Session {
            key: key.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            metadata: HashMap::new(),
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_system_message_serialization() {
        let msg = Message::system("You are a helpful assistant.");
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["role"], "system");
        assert_eq!(json["content"], "You are a helpful assistant.");
    }

    #[test]
    fn test_user_text_message_serialization() {
        let msg = Message::user("Hello, world!");
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "Hello, world!");
    }

    #[test]
    fn test_user_multipart_message_serialization() {
        let msg = Message::user_parts(vec![
            ContentPart::Text {
                text: "What's in this image?".to_string(),
            },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "data:image/png;base64,abc123".to_string(),
                    detail: None,
                },
            },
        ]);
        let json = serde_json::to_value(&msg).unwrap();

        let content = json["content"].as_array().unwrap();
        assert_eq!(content.len(), 2);
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[1]["type"], "image_url");
        assert_eq!(content[1]["image_url"]["url"], "data:image/png;base64,abc123");
    }

    #[test]
    fn test_assistant_text_message_serialization() {
        let msg = Message::assistant("The answer is 42.");
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["role"], "assistant");
        assert_eq!(json["content"], "The answer is 42.");
        // tool_calls should be absent (not null)
        assert!(json.get("tool_calls").is_none());
    }

    #[test]
    fn test_assistant_tool_calls_serialization() {
        let tool_calls = vec![ToolCall::new(
            "call_123",
            "web_search",
            r#"{"query": "Rust programming"}"#,
        )];
        let msg = Message::assistant_tool_calls(tool_calls);
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["role"], "assistant");
        assert!(json.get("content").is_none());

        let calls = json["tool_calls"].as_array().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["id"], "call_123");
        assert_eq!(calls[0]["type"], "function");
        assert_eq!(calls[0]["function"]["name"], "web_search");
    }

    #[test]
    fn test_tool_result_serialization() {
        let msg = Message::tool_result("call_123", "Search results: Rust is great!");
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["role"], "tool");
        assert_eq!(json["content"], "Search results: Rust is great!");
        assert_eq!(json["tool_call_id"], "call_123");
    }

    #[test]
    fn test_message_round_trip() {
        let messages = vec![
            Message::system("You are Ferrobot."),
            Message::user("What is 2+2?"),
            Message::assistant("The answer is 4."),
            Message::tool_result("call_1", "done"),
        ];

        let json_str = serde_json::to_string(&messages).unwrap();
        let deserialized: Vec<Message> = serde_json::from_str(&json_str).unwrap();

        assert_eq!(messages, deserialized);
    }

    #[test]
    fn test_tool_definition_serialization() {
        let tool_def = ToolDefinition::new(
            "read_file",
            "Read the contents of a file",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" }
                },
                "required": ["path"]
            }),
        );
        let json = serde_json::to_value(&tool_def).unwrap();

        assert_eq!(json["type"], "function");
        assert_eq!(json["function"]["name"], "read_file");
        assert_eq!(json["function"]["parameters"]["type"], "object");
    }

    #[test]
    fn test_chat_completion_response_parsing() {
        let api_json = json!({
            "id": "chatcmpl-abc123",
            "choices": [{
                "message": {
                    "content": "Hello! How can I help?",
                    "tool_calls": null
                },
                "finish_reason": "stop"
            }],
            "usage": {
                "prompt_tokens": 10,
                "completion_tokens": 8,
                "total_tokens": 18
            }
        });

        let resp: ChatCompletionResponse = serde_json::from_value(api_json).unwrap();
        let llm_resp: LlmResponse = resp.into();

        assert_eq!(llm_resp.content.as_deref(), Some("Hello! How can I help?"));
        assert!(!llm_resp.has_tool_calls());
        assert_eq!(llm_resp.usage.as_ref().unwrap().prompt_tokens, 10);
    }

    #[test]
    fn test_chat_completion_with_tool_calls_parsing() {
        let api_json = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_42",
                        "type": "function",
                        "function": {
                            "name": "exec",
                            "arguments": "{\"command\": \"ls -la\"}"
                        }
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": null
        });

        let resp: ChatCompletionResponse = serde_json::from_value(api_json).unwrap();
        let llm_resp: LlmResponse = resp.into();

        assert!(llm_resp.content.is_none());
        assert!(llm_resp.has_tool_calls());
        assert_eq!(llm_resp.tool_calls[0].function.name, "exec");
    }

    #[test]
    fn test_chat_request_serialization_skips_none() {
        let request = ChatCompletionRequest {
            model: "gpt-4o".to_string(),
            messages: vec![Message::user("Hello")],
            tools: None,
            tool_choice: None,
            max_tokens: Some(4096),
            temperature: None,
        };

        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["max_tokens"], 4096);
        assert!(json.get("tools").is_none());
        assert!(json.get("tool_choice").is_none());
        assert!(json.get("temperature").is_none());
    }

    #[test]
    fn test_session_creation() {
        let session = Session::new("telegram:123456");
        assert_eq!(session.key, "telegram:123456");
        assert!(session.messages.is_empty());
    }

    #[test]
    fn test_session_serialization_round_trip() {
        let mut session = Session::new("slack:C789");
        session.messages.push(Message::user("Hello"));
        session.messages.push(Message::assistant("Hi there!"));

        let json_str = serde_json::to_string(&session).unwrap();
        let deserialized: Session = serde_json::from_str(&json_str).unwrap();

        assert_eq!(deserialized.key, "slack:C789");
        assert_eq!(deserialized.messages.len(), 2);
    }
}
