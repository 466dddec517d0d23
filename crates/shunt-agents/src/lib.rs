mod codex;
mod gemini;
mod rotation;

pub use codex::{CodexClient, TaggedTranscript};
pub use gemini::{GeminiClient, StreamJsonTranscript};
pub use rotation::{ProviderRotation, QuotaSignature};

use std::path::PathBuf;

use shunt_runtime::SpawnSpec;
use shunt_types::{AgentEvent, ExecRequest, ProviderKind, ProviderSelection, RawLine};

/// Incremental transcript classifier. One instance per execution; `feed`
/// receives raw lines in stream order and the returned events keep that
/// order. `finish` closes the sequence (always ending in `done`).
pub trait Classifier: Send {
    fn feed(&mut self, line: &RawLine) -> Vec<AgentEvent>;
    fn finish(&mut self) -> Vec<AgentEvent>;
}

/// A fully prepared execution: how to spawn the CLI, lines to inject ahead
/// of its output, and the classifier that understands its transcript.
pub struct PreparedRun {
    pub spawn: SpawnSpec,
    /// Injected before the child's own stream, e.g. gemini's synthetic
    /// `init` carrying the session id the core minted.
    pub preamble: Vec<RawLine>,
    pub classifier: Box<dyn Classifier>,
    /// Session id known before spawn, if the core minted one.
    pub session_id: Option<String>,
}

/// Host-side context shared by all clients: where state lives and which
/// extra variables (vault contents included) go into the child environment.
#[derive(Debug, Clone, Default)]
pub struct ClientContext {
    pub storage_path: PathBuf,
    pub agent_home: PathBuf,
    /// Optional directory holding `config.base.toml` / `settings.base.json`
    /// templates rendered into the working dir before spawn.
    pub template_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// One agent CLI wrapper. Implementations build the argv/env for a request
/// and hand back the matching classifier.
pub trait AgentClient: Send + Sync {
    fn kind(&self) -> ProviderKind;
    fn prepare(&self, req: &ExecRequest) -> anyhow::Result<PreparedRun>;
}

/// Construct the client for one rotation entry.
pub fn client_for(selection: &ProviderSelection, ctx: ClientContext) -> Box<dyn AgentClient> {
    match selection.kind {
        ProviderKind::Codex => Box::new(CodexClient::new(selection.profile.clone(), ctx)),
        ProviderKind::Gemini => Box::new(GeminiClient::new(selection.profile.clone(), ctx)),
    }
}
