mod event;
mod provider;
mod request;

pub use event::{AgentEvent, EventKind, RawLine, StreamSource};
pub use provider::{ProviderKind, ProviderSelection};
pub use request::{ExecRequest, RunOutcome};
