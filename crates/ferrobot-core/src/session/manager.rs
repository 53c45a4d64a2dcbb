//! Session persistence and caching.
//!
//! File format: JSONL in `{workspace}/sessions/{safe_key}.jsonl`
//! - Line 1: `{"_type":"metadata","created_at":"...","updated_at":"...","metadata":{}}`
//! - Line 2+: `{"role":"user","content":"hello"}`
//!
//! Sessions are created on first reference and mutated only by the agent
//! loop. History reads return a deterministic bounded tail.

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{Message, Session};
use crate::utils;

/// Bounded history tail returned to the context builder.
pub const HISTORY_LIMIT: usize = 50;

/// Metadata header written as the first line of each JSONL session file.
#[derive(Debug, Serialize, Deserialize)]
struct SessionMetadata {
    #[serde(rename = "_type")]
    record_type: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

/// Manages conversation sessions with in-memory caching and JSONL
/// persistence rooted at `{workspace}/sessions/`.
///
/// Thread-safe via `RwLock` — multiple readers, exclusive writer.
pub struct SessionManager {
    sessions_dir: PathBuf,
    cache: RwLock<HashMap<String, Session>>,
}

impl SessionManager {
    /// Create a session manager storing files under `{workspace}/sessions/`.
    pub fn new(workspace: &Path) -> std::io::Result<Self> {
        let dir = workspace.join("sessions");
        std::fs::create_dir_all(&dir)?;

        Ok(SessionManager {
            sessions_dir: dir,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Get an existing session or create a new one.
    ///
    /// 1. Check in-memory cache
    /// 2. Try to load from disk
    /// 3. Create new empty session
    pub fn get_or_create(&self, key: &str) -> Session {
        {
            let cache = self.cache.read().unwrap();
            if let Some(session) = cache.get(key) {
                return session.clone();
            }
        }

        if let Some(session) = self.load_from_disk(key) {
            let mut cache = self.cache.write().unwrap();
            cache.insert(key.to_string(), session.clone());
            return session;
        }

        let session = Session::new(key);
        let mut cache = self.cache.write().unwrap();
        cache.insert(key.to_string(), session.clone());
        session
    }

    /// Add a message to a session and persist to disk.
    pub fn add_message(&self, key: &str, message: Message) {
        let mut session = self.get_or_create(key);
        session.messages.push(message);
        session.updated_at = Utc::now();

        {
            let mut cache = self.cache.write().unwrap();
            cache.insert(key.to_string(), session.clone());
        }

        if let Err(e) = self.save_to_disk(&session) {
            warn!("Failed to persist session {}: {}", key, e);
        }
    }

    /// Get the bounded history tail of a session (the last
    /// [`HISTORY_LIMIT`] messages, deterministic).
    pub fn get_history(&self, key: &str) -> Vec<Message> {
        self.get_history_n(key, HISTORY_LIMIT)
    }

    /// Get the last `max_messages` from a session's history.
    pub fn get_history_n(&self, key: &str, max_messages: usize) -> Vec<Message> {
        let session = self.get_or_create(key);
        let len = session.messages.len();
        if len <= max_messages {
            session.messages
        } else {
            session.messages[len - max_messages..].to_vec()
        }
    }

    /// Clear all messages in a session (reset conversation).
    pub fn clear(&self, key: &str) {
        let mut session = self.get_or_create(key);
        session.messages.clear();
        session.updated_at = Utc::now();

        {
            let mut cache = self.cache.write().unwrap();
            cache.insert(key.to_string(), session.clone());
        }

        if let Err(e) = self.save_to_disk(&session) {
            warn!("Failed to persist cleared session {}: {}", key, e);
        }
    }

    /// Delete a session from cache and disk.
    ///
    /// Returns `true` if the session file existed on disk.
    pub fn delete(&self, key: &str) -> bool {
        {
            let mut cache = self.cache.write().unwrap();
            cache.remove(key);
        }

        let path = self.session_path(key);
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("Failed to delete session file: {}", e);
                return false;
            }
            debug!("Deleted session file: {}", path.display());
            true
        } else {
            false
        }
    }

    fn session_path(&self, key: &str) -> PathBuf {
        let safe_key = utils::safe_filename(&key.replace(':', "_"));
        self.sessions_dir.join(format!("{}.jsonl", safe_key))
    }

    fn load_from_disk(&self, key: &str) -> Option<Session> {
        let path = self.session_path(key);
        if !path.exists() {
            return None;
        }

        let file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) => {
                warn!("Failed to open session file {}: {}", path.display(), e);
                return None;
            }
        };

        let reader = std::io::BufReader::new(file);
        let mut session = Session::new(key);
        let mut messages = Vec::new();

        for line in reader.lines() {
            let line = match line {
                Ok(l) => l,
                Err(_) => continue,
            };

            if line.trim().is_empty() {
                continue;
            }

            if let Ok(meta) = serde_json::from_str::<SessionMetadata>(&line) {
                if meta.record_type == "metadata" {
                    session.created_at = meta.created_at;
                    session.updated_at = meta.updated_at;
                    session.metadata = meta.metadata;
                    continue;
                }
            }

            if let Ok(msg) = serde_json::from_str::<Message>(&line) {
                messages.push(msg);
            }
        }

        session.messages = messages;
        debug!(
            "Loaded session '{}' with {} messages from disk",
            key,
            session.messages.len()
        );
        Some(session)
    }

    fn save_to_disk(&self, session: &Session) -> std::io::Result<()> {
        let path = self.session_path(&session.key);

        let mut file = std::fs::File::create(&path)?;

        let meta = SessionMetadata {
            record_type: "metadata".to_string(),
            created_at: session.created_at,
            updated_at: session.updated_at,
            metadata: session.metadata.clone(),
        };
        writeln!(file, "{}", serde_json::to_string(&meta)?)?;

        for msg in &session.messages {
            writeln!(file, "{}", serde_json::to_string(msg)?)?;
        }

        Ok(())
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
