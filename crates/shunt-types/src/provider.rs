use std::fmt;

use serde::{Deserialize, Serialize};

/// The interchangeable agent CLI families Shunt can drive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Codex,
    Gemini,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Codex => "codex",
            ProviderKind::Gemini => "gemini",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "codex" => Some(ProviderKind::Codex),
            "gemini" => Some(ProviderKind::Gemini),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the configured provider order.
///
/// The profile suffix (`codex:main`) selects an isolated credential/config
/// home for the child process; it never influences failover decisions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderSelection {
    pub kind: ProviderKind,
    pub profile: String,
}

impl ProviderSelection {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            profile: "main".to_string(),
        }
    }

    /// Parse a `kind` or `kind:profile` entry from the configured order.
    pub fn parse(entry: &str) -> Option<Self> {
        let mut parts = entry.splitn(2, ':');
        let kind = ProviderKind::parse(parts.next()?)?;
        let profile = parts
            .next()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "main".to_string());
        Some(Self { kind, profile })
    }
}

impl fmt::Display for ProviderSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.profile == "main" {
            f.write_str(self.kind.as_str())
        } else {
            write!(f, "{}:{}", self.kind, self.profile)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_entry_defaults_profile_to_main() {
        let sel = ProviderSelection::parse("codex").unwrap();
        assert_eq!(sel.kind, ProviderKind::Codex);
        assert_eq!(sel.profile, "main");
    }

    #[test]
    fn parse_entry_with_profile_suffix() {
        let sel = ProviderSelection::parse("gemini:work").unwrap();
        assert_eq!(sel.kind, ProviderKind::Gemini);
        assert_eq!(sel.profile, "work");
        assert_eq!(sel.to_string(), "gemini:work");
    }

    #[test]
    fn parse_rejects_unknown_kind() {
        assert!(ProviderSelection::parse("claude").is_none());
    }

    #[test]
    fn parse_is_case_insensitive_and_trims() {
        let sel = ProviderSelection::parse(" Codex ").unwrap();
        assert_eq!(sel.kind, ProviderKind::Codex);
    }
}
