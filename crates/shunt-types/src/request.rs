use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::AgentEvent;

/// One execution of an agent CLI. Immutable once built; a retry against a
/// different provider reuses the same request.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub prompt: String,
    pub resume_session_id: Option<String>,
    /// Maps to the CLI's danger/bypass-approvals flag.
    pub allow_mutating_actions: bool,
    pub skip_repo_check: bool,
    pub working_dir: PathBuf,
    pub model: Option<String>,
}

impl ExecRequest {
    pub fn new(prompt: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            resume_session_id: None,
            allow_mutating_actions: false,
            skip_repo_check: false,
            working_dir: working_dir.into(),
            model: None,
        }
    }

    pub fn with_resume(mut self, session_id: impl Into<String>) -> Self {
        self.resume_session_id = Some(session_id.into());
        self
    }

    pub fn with_mutating_actions(mut self, allow: bool) -> Self {
        self.allow_mutating_actions = allow;
        self
    }

    pub fn with_skip_repo_check(mut self, skip: bool) -> Self {
        self.skip_repo_check = skip;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Everything one finished (or aborted) execution produced.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunOutcome {
    pub session_id: Option<String>,
    /// Concatenation of `agent`-tagged payloads, the conversational reply.
    pub agent_content: String,
    pub events: Vec<AgentEvent>,
    pub meta: Option<Value>,
    pub success: bool,
}
