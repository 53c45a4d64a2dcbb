//! LM provider clients: the `LlmProvider` trait, an OpenAI-compatible HTTP
//! implementation, and the voice transcription client.

pub mod http;
pub mod traits;
pub mod transcription;

pub use http::{create_provider, HttpProvider};
pub use traits::{LlmProvider, LlmRequestConfig};
pub use transcription::{GroqTranscriber, TranscriptionProvider};
