//! Audit script generation.
//!
//! Custom Apps with audit enforcement carry a zsh script that Kandji runs
//! on every check-in. The script is a thin parametrized shim around the
//! `kustom audit` subcommand deployed on managed devices: all decision
//! logic lives in the binary, the script only pins the app identity,
//! required version and due date chosen at push time. Rendering happens in
//! memory; the only artifact is the script text handed to the API.

use chrono::{DateTime, TimeDelta, Utc};

/// Parameters baked into an audit script at push time.
#[derive(Debug, Clone)]
pub struct AuditParams<'a> {
    pub app_name: Option<&'a str>,
    pub bundle_id: Option<&'a str>,
    pub pkg_id: Option<&'a str>,
    pub required_version: &'a str,
    pub due_at: DateTime<Utc>,
}

impl<'a> AuditParams<'a> {
    /// Compute the due date for a fresh push: now plus the configured
    /// delay. The result is fixed in the script and only changes when a
    /// later push regenerates it.
    pub fn due_from_delay(now: DateTime<Utc>, delay_days: i64) -> DateTime<Utc> {
        now + TimeDelta::days(delay_days)
    }
}

const TEMPLATE: &str = r#"#!/bin/zsh
# Managed by kustom; regenerated on every push.
APP_NAME="__APP_NAME__"
BUNDLE_ID="__BUNDLE_ID__"
PKG_ID="__PKG_ID__"
MINIMUM_ENFORCED_VERSION="__MINIMUM_ENFORCED_VERSION__"
ENFORCEMENT_DUE_AT="__ENFORCEMENT_DUE_AT__"

KUSTOM="/usr/local/bin/kustom"
if [[ ! -x "$KUSTOM" ]]; then
    echo "kustom binary not installed; failing audit to force remediation"
    exit 1
fi

ARGS=(audit --required-version "$MINIMUM_ENFORCED_VERSION" --due "$ENFORCEMENT_DUE_AT")
[[ -n "$APP_NAME" ]] && ARGS+=(--app-name "$APP_NAME")
[[ -n "$BUNDLE_ID" ]] && ARGS+=(--bundle-id "$BUNDLE_ID")
[[ -n "$PKG_ID" ]] && ARGS+=(--pkg-id "$PKG_ID")

exec "$KUSTOM" "${ARGS[@]}"
"#;

/// Render the audit script with the given parameters.
///
/// Absent identity fields render as empty strings; the shim skips empty
/// arguments. The due date is embedded as epoch seconds so the on-device
/// comparison needs no timezone handling.
pub fn render(params: &AuditParams) -> String {
    TEMPLATE
        .replace("__APP_NAME__", params.app_name.unwrap_or_default())
        .replace("__BUNDLE_ID__", params.bundle_id.unwrap_or_default())
        .replace("__PKG_ID__", params.pkg_id.unwrap_or_default())
        .replace("__MINIMUM_ENFORCED_VERSION__", params.required_version)
        .replace("__ENFORCEMENT_DUE_AT__", &params.due_at.timestamp().to_string())
}
