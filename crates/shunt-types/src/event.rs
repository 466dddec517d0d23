use serde::{Deserialize, Serialize};

/// Which descriptor of the supervised child a raw line came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamSource {
    Stdout,
    Stderr,
}

/// One `\n`-terminated line read from the supervised process.
///
/// The trailing newline is preserved; a partial tail flushed at end of
/// stream may lack it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    pub source: StreamSource,
    pub text: String,
}

impl RawLine {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            source: StreamSource::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            source: StreamSource::Stderr,
            text: text.into(),
        }
    }
}

/// The shared classification vocabulary both transcript parsers emit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Title,
    User,
    Thinking,
    Agent,
    Exec,
    ExecOutput,
    ExecError,
    ExecTime,
    FileUpdate,
    TokensUsed,
    Meta,
    Stdout,
    Stderr,
    Error,
    Raw,
    Done,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Title => "title",
            EventKind::User => "user",
            EventKind::Thinking => "thinking",
            EventKind::Agent => "agent",
            EventKind::Exec => "exec",
            EventKind::ExecOutput => "exec_output",
            EventKind::ExecError => "exec_error",
            EventKind::ExecTime => "exec_time",
            EventKind::FileUpdate => "file_update",
            EventKind::TokensUsed => "tokens_used",
            EventKind::Meta => "meta",
            EventKind::Stdout => "stdout",
            EventKind::Stderr => "stderr",
            EventKind::Error => "error",
            EventKind::Raw => "raw",
            EventKind::Done => "done",
        }
    }
}

/// A classified `(kind, data)` pair. Ordering within one execution is part
/// of the contract: history storage and live consumers replay these as-is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentEvent {
    pub kind: EventKind,
    pub data: String,
}

impl AgentEvent {
    pub fn new(kind: EventKind, data: impl Into<String>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_serializes_snake_case() {
        let json = serde_json::to_string(&EventKind::ExecOutput).unwrap();
        assert_eq!(json, "\"exec_output\"");
        assert_eq!(EventKind::ExecOutput.as_str(), "exec_output");
    }

    #[test]
    fn agent_event_round_trips() {
        let event = AgentEvent::new(EventKind::TokensUsed, "1234");
        let json = serde_json::to_string(&event).unwrap();
        let back: AgentEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
