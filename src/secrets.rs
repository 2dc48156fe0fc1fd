//! Token retrieval from the configured keystores.
//!
//! Each secret the pipeline can need is a tagged variant carrying its
//! configured storage key; lookup order is environment (exact name, then
//! uppercased) when the environment keystore is enabled, then the macOS
//! keychain when that one is.

use std::process::Command;

use crate::config::KeystoreConfig;
use crate::error::{Error, Result};

/// Keychain account name our secrets are stored under.
const KEYCHAIN_ACCOUNT: &str = "kustom";

/// A secret the pipeline knows how to look up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Kandji API bearer token, stored under the configured name.
    Kandji { name: String },
    /// Slack webhook URL, stored under the configured name.
    Slack { name: String },
}

impl Token {
    /// The keystore item name for this token.
    pub fn storage_key(&self) -> &str {
        match self {
            Self::Kandji { name } | Self::Slack { name } => name,
        }
    }

    /// Whether a resolved value looks plausible for this token kind.
    pub fn validates(&self, value: &str) -> bool {
        match self {
            Self::Kandji { .. } => !value.trim().is_empty(),
            Self::Slack { .. } => value.trim().starts_with("https://"),
        }
    }

    /// Resolve the token from the enabled keystores.
    ///
    /// Returns [`Error::TokenMissing`] when nothing usable is found; the
    /// Kandji variant is fatal for the run, the Slack variant merely
    /// disables notifications.
    pub fn resolve(&self, keystores: &KeystoreConfig) -> Result<String> {
        if keystores.environment
            && let Some(value) = env_lookup(self.storage_key())
            && self.validates(&value)
        {
            log::debug!("Resolved '{}' from environment", self.storage_key());
            return Ok(value);
        }

        if keystores.keychain
            && let Some(value) = keychain_lookup(self.storage_key())
            && self.validates(&value)
        {
            log::debug!("Resolved '{}' from keychain", self.storage_key());
            return Ok(value);
        }

        Err(Error::TokenMissing {
            name: self.storage_key().to_string(),
        })
    }
}

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name)
        .or_else(|_| std::env::var(name.to_uppercase()))
        .ok()
        .filter(|v| !v.is_empty())
}

fn keychain_lookup(name: &str) -> Option<String> {
    let output = Command::new("/usr/bin/security")
        .args(["find-generic-password", "-w", "-s", name, "-a", KEYCHAIN_ACCOUNT])
        .output()
        .ok()?;
    if !output.status.success() {
        log::debug!("Keychain lookup for '{name}' failed");
        return None;
    }
    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!value.is_empty()).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_key() {
        let token = Token::Kandji {
            name: "kandji-api".to_string(),
        };
        assert_eq!(token.storage_key(), "kandji-api");
    }

    #[test]
    fn test_validation_rules() {
        let kandji = Token::Kandji {
            name: "k".to_string(),
        };
        assert!(kandji.validates("abc123"));
        assert!(!kandji.validates("  "));

        let slack = Token::Slack {
            name: "s".to_string(),
        };
        assert!(slack.validates("https://hooks.slack.com/services/x"));
        assert!(!slack.validates("not-a-url"));
    }

    #[test]
    fn test_disabled_keystores_yield_missing() {
        let token = Token::Kandji {
            name: "kustom-test-token-that-should-not-exist".to_string(),
        };
        let keystores = KeystoreConfig {
            environment: false,
            keychain: false,
        };
        match token.resolve(&keystores) {
            Err(Error::TokenMissing { name }) => {
                assert_eq!(name, "kustom-test-token-that-should-not-exist");
            }
            other => panic!("expected TokenMissing, got {other:?}"),
        }
    }

    #[test]
    fn test_env_lookup_uppercases() {
        // Env mutation requires unsafe in edition 2024; single-threaded test.
        unsafe {
            std::env::set_var("KUSTOM_UNIT_TOKEN", "sekrit");
        }
        assert_eq!(env_lookup("kustom_unit_token").as_deref(), Some("sekrit"));
        unsafe {
            std::env::remove_var("KUSTOM_UNIT_TOKEN");
        }
    }
}
