//! File-backed conversation history.
//!
//! One JSONL file per session under a date tree:
//! `{root}/{yyyy}/{mm}/{dd}/{timestamp}.{session_id}.jsonl`. Appends are the
//! only mutation; listing walks the tree and orders by the filename
//! timestamp, newest first. The chat and heartbeat flows each get their own
//! root so background traffic never shows up in the user's history.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use shunt_types::AgentEvent;

/// One persisted message line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: String,
    pub content: String,
    pub timestamp: String,
    /// Full classified stream, kept for assistant messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<AgentEvent>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl StoredMessage {
    pub fn user(content: impl Into<String>, timestamp: DateTime<Local>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
            timestamp: timestamp.to_rfc3339(),
            events: None,
            meta: None,
        }
    }

    pub fn assistant(
        content: impl Into<String>,
        events: Vec<AgentEvent>,
        meta: Option<Value>,
    ) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
            timestamp: Local::now().to_rfc3339(),
            events: Some(events),
            meta,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub session_id: String,
    pub timestamp: String,
    /// First user message, truncated for list views.
    pub first_message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub session_id: String,
    pub messages: Vec<StoredMessage>,
}

#[derive(Debug, Clone)]
pub struct HistoryStore {
    root: PathBuf,
}

impl HistoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Append one message to the session's file, creating it on first use.
    pub fn save_message(&self, session_id: &str, message: &StoredMessage) -> anyhow::Result<()> {
        let path = match self.find_session_file(session_id)? {
            Some(existing) => existing,
            None => self.new_session_path(session_id, Local::now())?,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening history file {}", path.display()))?;
        writeln!(file, "{}", serde_json::to_string(message)?)?;
        Ok(())
    }

    /// Summaries ordered newest first.
    pub fn list(&self, limit: usize, offset: usize) -> anyhow::Result<Vec<ConversationSummary>> {
        let mut entries: Vec<(String, PathBuf, String)> = Vec::new();
        for (stamp, session_id, path) in self.walk()? {
            entries.push((stamp, path, session_id));
        }
        entries.sort_by(|a, b| b.0.cmp(&a.0));

        let mut summaries = Vec::new();
        for (stamp, path, session_id) in entries.into_iter().skip(offset).take(limit) {
            let first_message = first_user_message(&path).unwrap_or_default();
            summaries.push(ConversationSummary {
                session_id,
                timestamp: stamp,
                first_message,
            });
        }
        Ok(summaries)
    }

    pub fn load(&self, session_id: &str) -> anyhow::Result<Option<Conversation>> {
        let Some(path) = self.find_session_file(session_id)? else {
            return Ok(None);
        };
        let raw = fs::read_to_string(&path)?;
        let mut messages = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(message) => messages.push(message),
                Err(err) => warn!("skipping corrupt history line in {}: {err}", path.display()),
            }
        }
        Ok(Some(Conversation {
            session_id: session_id.to_string(),
            messages,
        }))
    }

    fn new_session_path(
        &self,
        session_id: &str,
        now: DateTime<Local>,
    ) -> anyhow::Result<PathBuf> {
        let dir = self
            .root
            .join(now.format("%Y").to_string())
            .join(now.format("%m").to_string())
            .join(now.format("%d").to_string());
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating history dir {}", dir.display()))?;
        let stamp = now.format("%Y-%m-%dT%H-%M-%S%.3f").to_string();
        Ok(dir.join(format!("{stamp}.{session_id}.jsonl")))
    }

    fn find_session_file(&self, session_id: &str) -> anyhow::Result<Option<PathBuf>> {
        for (_, candidate, path) in self.walk()? {
            if candidate == session_id {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    /// Yields `(timestamp, session_id, path)` for every history file.
    fn walk(&self) -> anyhow::Result<Vec<(String, String, PathBuf)>> {
        let mut found = Vec::new();
        if !self.root.exists() {
            return Ok(found);
        }
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Some((stamp, session_id)) = parse_file_name(&path) {
                    found.push((stamp, session_id, path));
                }
            }
        }
        Ok(found)
    }
}

/// `{timestamp}.{session_id}.jsonl` → `(timestamp, session_id)`.
fn parse_file_name(path: &Path) -> Option<(String, String)> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(".jsonl")?;
    // The timestamp itself contains dots (millis), so split from the right.
    let (stamp, session_id) = stem.rsplit_once('.')?;
    if stamp.is_empty() || session_id.is_empty() {
        return None;
    }
    Some((stamp.to_string(), session_id.to_string()))
}

fn first_user_message(path: &Path) -> Option<String> {
    let raw = fs::read_to_string(path).ok()?;
    for line in raw.lines() {
        if let Ok(message) = serde_json::from_str::<StoredMessage>(line) {
            if message.role == "user" {
                let mut preview: String = message.content.chars().take(100).collect();
                if preview.len() < message.content.len() {
                    preview.push('…');
                }
                return Some(preview);
            }
        }
    }
    None
}
