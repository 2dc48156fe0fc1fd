//! Centralized path resolution for kustom
//!
//! # Environment Variables
//!
//! - `KUSTOM_CONFIG_DIR` - Override config directory (e.g., `~/dotfiles/kustom`)
//! - `KUSTOM_STATE_DIR` - Override the on-device enforcement state directory
//!
//! Config resolution prefers the env override, then `~/.config/kustom`.
//! Enforcement state defaults to a machine-wide location because the audit
//! runs as root under the MDM agent, not as the console user.

use anyhow::{Context, Result};
use std::path::PathBuf;

/// Environment variable for config directory override
pub const ENV_CONFIG_DIR: &str = "KUSTOM_CONFIG_DIR";

/// Environment variable for enforcement state directory override
pub const ENV_STATE_DIR: &str = "KUSTOM_STATE_DIR";

/// Machine-wide enforcement state directory used on managed devices.
const DEVICE_STATE_DIR: &str = "/Library/Application Support/kustom";

/// Get the kustom config directory path
pub fn config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_CONFIG_DIR) {
        let path = PathBuf::from(dir);
        log::debug!("Using config dir from {}: {}", ENV_CONFIG_DIR, path.display());
        return Ok(path);
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".config").join("kustom"))
}

/// Get the enforcement state directory path
///
/// This is the fixed, well-known location the audit reads and writes its
/// delay record under; the env override exists for tests and dry runs.
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(ENV_STATE_DIR) {
        let path = PathBuf::from(dir);
        log::debug!("Using state dir from {}: {}", ENV_STATE_DIR, path.display());
        return path;
    }

    PathBuf::from(DEVICE_STATE_DIR)
}
