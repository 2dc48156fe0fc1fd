//! Immutable runtime configuration.
//!
//! Loaded once from `config.json` in the kustom config directory and passed
//! by reference to every component; nothing in the pipeline mutates it or
//! reaches for process-wide state. Validation beyond JSON shape is the
//! setup tooling's job — this module treats the file as already vetted.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

use crate::kandji::Enforcement;
use crate::paths;

/// Default enforcement delay in days for production entries.
const DEFAULT_PROD_DELAY_DAYS: i64 = 5;
/// Default enforcement delay in days for test entries.
const DEFAULT_TEST_DELAY_DAYS: i64 = 0;
/// Delay applied when a configured value exists but cannot be parsed.
const UNPARSABLE_DELAY_DAYS: i64 = 3;

/// Which tenant environment a Custom App name targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetEnv {
    Prod,
    Test,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub kandji: KandjiConfig,
    pub token_keystore: KeystoreConfig,
    #[serde(default)]
    pub slack: SlackConfig,
    #[serde(default)]
    pub enforcement: EnforcementConfig,
    #[serde(default)]
    pub defaults: Defaults,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KandjiConfig {
    /// Tenant API base, e.g. `https://accuhive.api.kandji.io`.
    pub api_url: String,
    /// Keystore item name holding the bearer token.
    pub token_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeystoreConfig {
    #[serde(default)]
    pub environment: bool,
    #[serde(default)]
    pub keychain: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SlackConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub webhook_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnforcementConfig {
    /// Default enforcement for newly created entries: `audit_enforce`,
    /// `install_once`, or `self_service`.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub delays: DelayConfig,
}

/// Delay values are kept raw: admins write numbers, quoted numbers, and the
/// occasional typo, and a typo must degrade to a short delay rather than
/// fail the run.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DelayConfig {
    #[serde(default)]
    pub prod: Option<Value>,
    #[serde(default)]
    pub test: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Defaults {
    #[serde(default)]
    pub auto_create: bool,
    #[serde(default)]
    pub dynamic_lookup: bool,
    #[serde(default)]
    pub dry_run: bool,
    /// Naming template for entries with no explicit name; `APPNAME` is
    /// replaced with the recipe name.
    #[serde(default)]
    pub naming_template: Option<String>,
    #[serde(default)]
    pub self_service_category: Option<String>,
    #[serde(default)]
    pub test_self_service_category: Option<String>,
}

impl Config {
    /// Load config.json from the kustom config directory.
    pub fn load_default() -> Result<Self> {
        let path = paths::config_dir()?.join("config.json");
        Self::load(&path)
    }

    /// Load configuration from an explicit path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read config: {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Invalid JSON in config: {}", path.display()))?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// The recipe-map file sitting next to the config, if present.
    pub fn mapping_path() -> Result<PathBuf> {
        Ok(paths::config_dir()?.join("recipe_map.json"))
    }

    /// Default enforcement type for created entries, `None` when the config
    /// value is missing or unrecognized (the executor then falls back to
    /// install-once).
    pub fn default_enforcement(&self) -> Option<Enforcement> {
        match self.enforcement.kind.as_deref()?.trim().to_lowercase().as_str() {
            "audit_enforce" => Some(Enforcement::AuditEnforce),
            "install_once" => Some(Enforcement::InstallOnce),
            "self_service" => Some(Enforcement::SelfService),
            other => {
                log::warn!("Unrecognized enforcement type '{other}' in config");
                None
            }
        }
    }

    /// Enforcement delay in days for an environment.
    ///
    /// Unset values use the 5-day prod / 0-day test defaults; a value that
    /// is present but unparsable degrades to 3 days.
    pub fn delay_days(&self, env: TargetEnv) -> i64 {
        let (raw, fallback) = match env {
            TargetEnv::Prod => (&self.enforcement.delays.prod, DEFAULT_PROD_DELAY_DAYS),
            TargetEnv::Test => (&self.enforcement.delays.test, DEFAULT_TEST_DELAY_DAYS),
        };
        match raw {
            None | Some(Value::Null) => fallback,
            Some(value) => parse_delay(value).unwrap_or_else(|| {
                log::warn!("Unparsable enforcement delay {value}; using {UNPARSABLE_DELAY_DAYS} days");
                UNPARSABLE_DELAY_DAYS
            }),
        }
    }

    /// Resolve the default Custom App name for a recipe from the naming
    /// template, falling back to the `(AutoPkg)` suffix convention.
    pub fn default_app_name(&self, recipe_name: &str) -> String {
        match &self.defaults.naming_template {
            Some(template) => template.replace("APPNAME", recipe_name),
            None => format!("{recipe_name} (AutoPkg)"),
        }
    }

    /// Default self-service category name for an environment.
    pub fn default_category(&self, env: TargetEnv) -> Option<&str> {
        match env {
            TargetEnv::Prod => self.defaults.self_service_category.as_deref(),
            TargetEnv::Test => self.defaults.test_self_service_category.as_deref(),
        }
    }
}

fn parse_delay(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}
