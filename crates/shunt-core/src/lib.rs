pub mod activity;
pub mod heartbeat;
pub mod history;
pub mod notify;
pub mod orchestrator;
pub mod settings;
pub mod vault;

pub use activity::{ActivityCoordinator, ActivityStatus, IdleTrigger};
pub use heartbeat::{HeartbeatRunner, HEARTBEAT_PROMPT};
pub use history::{Conversation, ConversationSummary, HistoryStore, StoredMessage};
pub use notify::{Notifier, NullNotifier, TelegramNotifier};
pub use orchestrator::{Orchestrator, NEW_SESSION_PREAMBLE};
pub use settings::{Settings, SettingsStore};
pub use vault::Vault;
