//! Failure notifications.
//!
//! Best-effort only: a notification that cannot be delivered is logged and
//! dropped, it never fails the run that produced it.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use crate::vault::Vault;

const TELEGRAM_API: &str = "https://api.telegram.org/bot";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Report that `prompt` could not be completed by any provider.
    async fn run_failed(&self, prompt: &str);
}

/// Sink for deployments without a configured channel.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn run_failed(&self, prompt: &str) {
        debug!("run failed (no notifier configured): {prompt}");
    }
}

/// Telegram `sendMessage` notifier. Bot token and recipient ids come from
/// the vault (`TELEGRAM_BOT_TOKEN`, `TELEGRAM_USER_IDS` comma-separated) so
/// they are read fresh on every send.
pub struct TelegramNotifier {
    vault: Vault,
    client: Client,
}

impl TelegramNotifier {
    pub fn new(vault: Vault) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { vault, client })
    }

    fn recipients(&self) -> Option<(String, Vec<String>)> {
        let token = self.vault.get("TELEGRAM_BOT_TOKEN").ok().flatten()?;
        let user_ids = self.vault.get("TELEGRAM_USER_IDS").ok().flatten()?;
        let ids: Vec<String> = user_ids
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
        if ids.is_empty() {
            return None;
        }
        Some((token, ids))
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn run_failed(&self, prompt: &str) {
        let Some((token, ids)) = self.recipients() else {
            debug!("telegram credentials missing from vault, skipping notification");
            return;
        };
        let url = format!("{TELEGRAM_API}{token}/sendMessage");
        for chat_id in ids {
            let body = serde_json::json!({
                "chat_id": chat_id,
                "text": format!("'{prompt}' is failed to ran."),
            });
            if let Err(err) = self.client.post(&url).json(&body).send().await {
                warn!("telegram notification to {chat_id} failed: {err}");
            }
        }
    }
}
