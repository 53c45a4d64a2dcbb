//! Voice transcription — speech-to-text via Whisper APIs.
//!
//! Currently backed by Groq's Whisper endpoint; any OpenAI-compatible
//! `/v1/audio/transcriptions` endpoint works.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

/// Trait for speech-to-text transcription providers.
#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    /// Transcribe an audio file to text.
    ///
    /// Returns the transcribed text, or an empty string when transcription
    /// is unavailable (missing key, missing file).
    async fn transcribe(&self, file_path: &Path) -> anyhow::Result<String>;

    /// Display name for logging.
    fn display_name(&self) -> &str;
}

/// Groq-based transcription using their Whisper API.
pub struct GroqTranscriber {
    api_key: String,
    api_url: String,
    model: String,
    client: reqwest::Client,
}

impl GroqTranscriber {
    /// Create a new Groq transcriber.
    ///
    /// Falls back to `GROQ_API_KEY` env var if `api_key` is empty.
    pub fn new(api_key: &str) -> Self {
        let key = if api_key.is_empty() {
            std::env::var("GROQ_API_KEY").unwrap_or_default()
        } else {
            api_key.to_string()
        };

        Self {
            api_key: key,
            api_url: "https://api.groq.com/openai/v1/audio/transcriptions".into(),
            model: "whisper-large-v3".into(),
            client: reqwest::Client::new(),
        }
    }

    /// Create with a custom API URL (for other OpenAI-compatible endpoints).
    pub fn with_url(api_key: &str, api_url: &str) -> Self {
        let mut t = Self::new(api_key);
        t.api_url = api_url.to_string();
        t
    }

    /// Whether the transcriber has an API key.
    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }
}

#[async_trait]
impl TranscriptionProvider for GroqTranscriber {
    async fn transcribe(&self, file_path: &Path) -> anyhow::Result<String> {
        if !self.is_configured() {
            warn!("transcription: no API key configured, skipping");
            return Ok(String::new());
        }

        if !file_path.exists() {
            warn!(path = %file_path.display(), "transcription: file not found");
            return Ok(String::new());
        }

        let file_name = file_path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();

        debug!(path = %file_path.display(), model = %self.model, "transcribing audio");

        let file_bytes = tokio::fs::read(file_path).await?;

        let file_part = reqwest::multipart::Part::bytes(file_bytes)
            .file_name(file_name)
            .mime_str("application/octet-stream")?;

        let form = reqwest::multipart::Form::new()
            .part("file", file_part)
            .text("model", self.model.clone());

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .timeout(Duration::from_secs(60))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("transcription API returned {status}: {body}");
        }

        let body: serde_json::Value = response.json().await?;
        let text = body["text"].as_str().unwrap_or("").trim().to_string();
        Ok(text)
    }

    fn display_name(&self) -> &str {
        "GroqWhisper"
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_transcribe_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transcribe"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"text": " hello world "})),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("voice.ogg");
        std::fs::write(&audio, b"fake audio").unwrap();

        let t = GroqTranscriber::with_url("test-key", &format!("{}/transcribe", server.uri()));
        let text = t.transcribe(&audio).await.unwrap();
        assert_eq!(text, "hello world");
    }

    #[tokio::test]
    async fn test_transcribe_missing_file() {
        let t = GroqTranscriber::with_url("test-key", "http://localhost:1/none");
        let text = t.transcribe(Path::new("/nonexistent/voice.ogg")).await.unwrap();
        assert_eq!(text, "");
    }

    #[tokio::test]
    async fn test_transcribe_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transcribe"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("voice.ogg");
        std::fs::write(&audio, b"fake audio").unwrap();

        let t = GroqTranscriber::with_url("test-key", &format!("{}/transcribe", server.uri()));
        assert!(t.transcribe(&audio).await.is_err());
    }
}
