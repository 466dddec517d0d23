//! Provider failover on quota exhaustion.
//!
//! Providers are tried in a fixed order; when the streamed transcript of the
//! current provider shows its quota-exhaustion signature the rotation
//! advances (wrapping) and the caller aborts and retries the request against
//! the new provider. Signatures are substring matches on human-readable CLI
//! text, so they stay configurable data rather than hard-coded rules.

use std::sync::Mutex;

use tracing::info;

use shunt_types::{AgentEvent, EventKind, ProviderKind, ProviderSelection};

/// Textual fingerprint of a provider's quota-exhaustion output. An event
/// matches when its kind is one of `kinds` and its payload contains every
/// needle.
#[derive(Debug, Clone)]
pub struct QuotaSignature {
    pub provider: ProviderKind,
    pub kinds: Vec<EventKind>,
    pub needles: Vec<String>,
}

impl QuotaSignature {
    pub fn new(
        provider: ProviderKind,
        kinds: Vec<EventKind>,
        needles: Vec<impl Into<String>>,
    ) -> Self {
        Self {
            provider,
            kinds,
            needles: needles.into_iter().map(Into::into).collect(),
        }
    }

    /// Signatures observed from the current CLI releases.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new(
                ProviderKind::Codex,
                vec![EventKind::User],
                vec!["ERROR: You've hit your usage limit"],
            ),
            Self::new(
                ProviderKind::Gemini,
                vec![EventKind::Stderr, EventKind::Error],
                vec!["exhausted", "capacity"],
            ),
        ]
    }

    fn matches(&self, event: &AgentEvent) -> bool {
        self.kinds.contains(&event.kind)
            && self.needles.iter().all(|needle| event.data.contains(needle))
    }
}

/// Ordered provider list with a current position. Shared across concurrent
/// executions; the position survives individual requests so a drained
/// provider stays skipped until the rotation wraps back to it.
pub struct ProviderRotation {
    providers: Vec<ProviderSelection>,
    signatures: Vec<QuotaSignature>,
    index: Mutex<usize>,
}

impl ProviderRotation {
    pub fn new(providers: Vec<ProviderSelection>, signatures: Vec<QuotaSignature>) -> Self {
        debug_assert!(!providers.is_empty());
        Self {
            providers,
            signatures,
            index: Mutex::new(0),
        }
    }

    /// Parse a comma-separated order string such as `"codex,gemini:work"`.
    pub fn from_order(order: &str, signatures: Vec<QuotaSignature>) -> anyhow::Result<Self> {
        let providers = order
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                ProviderSelection::parse(entry)
                    .ok_or_else(|| anyhow::anyhow!("unknown provider entry {entry:?}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        anyhow::ensure!(!providers.is_empty(), "provider order is empty");
        Ok(Self::new(providers, signatures))
    }

    /// Number of providers, which is also the retry cap per logical request.
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn current(&self) -> ProviderSelection {
        let index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        self.providers[*index].clone()
    }

    /// Move to the next provider, wrapping at the end of the list.
    pub fn advance(&self) -> ProviderSelection {
        let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        let previous = self.providers[*index].clone();
        *index = (*index + 1) % self.providers.len();
        let next = self.providers[*index].clone();
        info!("provider rotation: {previous} -> {next}");
        next
    }

    /// Check one streamed event against the current provider's signature.
    /// On a match the rotation advances and `true` is returned so the caller
    /// can abort the stream and retry. Signatures of other providers never
    /// match, which keeps a provider's error text from rotating past a
    /// provider that did not produce it.
    pub fn inspect(&self, event: &AgentEvent) -> bool {
        let current_kind = self.current().kind;
        let hit = self
            .signatures
            .iter()
            .filter(|sig| sig.provider == current_kind)
            .any(|sig| sig.matches(event));
        if hit {
            info!("quota exhaustion detected for {current_kind}");
            self.advance();
        }
        hit
    }

    /// Inspect a whole batch; true when any event triggered a rotation.
    pub fn inspect_batch<'a>(&self, events: impl IntoIterator<Item = &'a AgentEvent>) -> bool {
        let mut rotated = false;
        for event in events {
            rotated |= self.inspect(event);
        }
        rotated
    }
}
