//! `kustom audit` — the per-device enforcement check.
//!
//! Invoked by the audit script Kandji runs on each check-in. Gathers the
//! installed-version facts, feeds them through the enforcement state
//! machine, prompts the user when a deferral is on offer, and maps the
//! verdict to the exit-code contract: 0 passes the audit, non-zero makes
//! the MDM install the required version.

use anyhow::{Context as AnyhowContext, Result};
use chrono::{DateTime, Utc};
use plist::Value as PlistValue;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::Command;

use crate::Context;
use crate::cli::AuditArgs;
use crate::enforcement::{
    self, AuditState, DelayRecord, DelayStore, EnforcementFacts, TriggerReason, Verdict,
    EXIT_COMPLIANT, EXIT_TRIGGER,
};
use crate::ui;
use crate::version::PackageVersion;

/// User response to the deferral prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Choice {
    Delay,
    Quit,
}

pub fn run(ctx: &Context, args: AuditArgs) -> Result<i32> {
    let required = PackageVersion::parse(&args.required_version);
    let due_at = DateTime::<Utc>::from_timestamp(args.due, 0)
        .context("--due is not a valid epoch timestamp")?;

    let identifier = args
        .bundle_id
        .clone()
        .or_else(|| args.pkg_id.clone())
        .or_else(|| args.app_name.clone())
        .context("one of --app-name, --bundle-id or --pkg-id is required")?;

    let installed = installed_version(&args);
    let process = process_name(&args);
    let process_running = process.as_deref().is_some_and(is_process_running);

    let store = DelayStore::at_default();
    let facts = EnforcementFacts {
        installed,
        required: required.clone(),
        due_at,
        now: Utc::now(),
        process_running,
        record: store.load(&identifier),
    };
    if ctx.verbose > 1 {
        ui::dim(&format!("{facts:?}"));
    }
    log::debug!("Audit facts: {facts:?}");

    let verdict = enforcement::assess(&facts);
    let (state, exit) = apply_verdict(&verdict, &facts, &identifier, &store, &args);
    log::info!("Audit state {state:?}, exit {exit}");
    Ok(exit)
}

/// Act on the verdict (prompting and record upkeep) and resolve the state
/// the run actually landed in plus its exit code.
fn apply_verdict(
    verdict: &Verdict,
    facts: &EnforcementFacts,
    identifier: &str,
    store: &DelayStore,
    args: &AuditArgs,
) -> (AuditState, i32) {
    let label = display_label(args);
    match verdict {
        Verdict::Compliant { stale_record } => {
            if *stale_record {
                store.discard(identifier);
            }
            ui::success(&format!("{label} satisfies required version {}", facts.required));
            (AuditState::Compliant, EXIT_COMPLIANT)
        }
        Verdict::Pending { remaining } => {
            ui::info(&format!(
                "{label} is below {}; enforcement due in {}",
                facts.required,
                human_delta(*remaining)
            ));
            (AuditState::PendingEnforcement, EXIT_COMPLIANT)
        }
        Verdict::DelayActive { remaining } => {
            ui::info(&format!(
                "Upgrade deferral active for {label}; {} remaining",
                human_delta(*remaining)
            ));
            (AuditState::DelayGranted, EXIT_COMPLIANT)
        }
        Verdict::OfferDelay => match prompt_offer(&label, facts.required.as_str()) {
            Choice::Delay => {
                let record =
                    DelayRecord::grant(identifier, &facts.required, facts.due_at, facts.now);
                match store.save(&record) {
                    Ok(()) => {
                        ui::info(&format!(
                            "Deferral granted until {}",
                            record.delay_expires_at.format("%H:%M")
                        ));
                        (AuditState::DelayGranted, EXIT_COMPLIANT)
                    }
                    Err(err) => {
                        // Cannot remember the deferral; enforcing beats
                        // prompting forever.
                        ui::error(&format!("Could not persist deferral: {err}"));
                        (AuditState::Triggered, EXIT_TRIGGER)
                    }
                }
            }
            Choice::Quit => {
                ui::warn(&format!("Quitting {label} for upgrade to {}", facts.required));
                (AuditState::Triggered, EXIT_TRIGGER)
            }
        },
        Verdict::DelayElapsed => {
            announce_upgrade(&label, facts.required.as_str());
            (AuditState::DelayExpired, EXIT_TRIGGER)
        }
        Verdict::Triggered(reason) => {
            let state = match reason {
                TriggerReason::NotInstalled => {
                    ui::warn(&format!("{label} is not installed; triggering install"));
                    AuditState::NotInstalled
                }
                TriggerReason::ProcessNotRunning => {
                    ui::warn(&format!(
                        "{label} is not running; triggering upgrade to {}",
                        facts.required
                    ));
                    AuditState::Triggered
                }
            };
            (state, EXIT_TRIGGER)
        }
    }
}

// =============================================================================
// Installed-version facts
// =============================================================================

/// Read the installed version, trying the app bundle first and the package
/// receipt second. `None` means not installed.
fn installed_version(args: &AuditArgs) -> Option<PackageVersion> {
    if let Some(path) = app_bundle_path(args)
        && let Some(version) = bundle_short_version(&path)
    {
        log::debug!("Installed version {version} from {}", path.display());
        return Some(PackageVersion::parse(&version));
    }
    if let Some(pkg_id) = &args.pkg_id
        && let Some(version) = receipt_version(pkg_id)
    {
        log::debug!("Installed version {version} from receipt {pkg_id}");
        return Some(PackageVersion::parse(&version));
    }
    None
}

/// Locate the installed app bundle by name, else by bundle id via Spotlight.
fn app_bundle_path(args: &AuditArgs) -> Option<PathBuf> {
    if let Some(app_name) = &args.app_name {
        let path = PathBuf::from("/Applications").join(app_name);
        if path.exists() {
            return Some(path);
        }
    }
    if let Some(bundle_id) = &args.bundle_id {
        let output = Command::new("mdfind")
            .arg(format!("kMDItemCFBundleIdentifier == '{bundle_id}'"))
            .output()
            .ok()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let first = stdout.lines().find(|line| line.ends_with(".app"))?;
        return Some(PathBuf::from(first));
    }
    None
}

fn bundle_short_version(bundle: &std::path::Path) -> Option<String> {
    let plist_path = bundle.join("Contents").join("Info.plist");
    let value = PlistValue::from_file(&plist_path).ok()?;
    value
        .as_dictionary()?
        .get("CFBundleShortVersionString")
        .and_then(PlistValue::as_string)
        .map(str::to_string)
}

/// Version from the package receipt database.
fn receipt_version(pkg_id: &str) -> Option<String> {
    let output = Command::new("pkgutil")
        .args(["--pkg-info", pkg_id])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .find_map(|line| line.strip_prefix("version: "))
        .map(|version| version.trim().to_string())
}

/// The process checked before interrupting anyone: an explicit override, or
/// the app bundle name without its `.app` suffix.
fn process_name(args: &AuditArgs) -> Option<String> {
    args.process_name.clone().or_else(|| {
        args.app_name
            .as_deref()
            .map(|name| name.strip_suffix(".app").unwrap_or(name).to_string())
    })
}

fn is_process_running(name: &str) -> bool {
    Command::new("pgrep")
        .args(["-x", name])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn display_label(args: &AuditArgs) -> String {
    args.app_name
        .clone()
        .or_else(|| args.bundle_id.clone())
        .or_else(|| args.pkg_id.clone())
        .unwrap_or_else(|| "managed app".to_string())
}

// =============================================================================
// Prompting
// =============================================================================

/// Offer {Delay 1 hour | Quit now}. Interactive runs use a terminal picker;
/// audit runs under the MDM agent fall back to an osascript dialog aimed at
/// the console user. With nobody reachable the deferral is declined.
fn prompt_offer(label: &str, required: &str) -> Choice {
    let message = format!("{label} must be upgraded to {required}.");
    if std::io::stdin().is_terminal() {
        use dialoguer::Select;
        let picked = Select::new()
            .with_prompt(message)
            .items(&["Delay 1 hour", "Quit now"])
            .default(0)
            .interact();
        return match picked {
            Ok(0) => Choice::Delay,
            Ok(_) => Choice::Quit,
            Err(err) => {
                log::warn!("Prompt failed: {err}");
                Choice::Quit
            }
        };
    }

    match dialog(&format!("{message} Delay one hour?"), &["Delay 1 hour", "Quit now"]) {
        Some(button) if button == "Delay 1 hour" => Choice::Delay,
        Some(_) => Choice::Quit,
        None => {
            log::warn!("No user reachable for deferral prompt; proceeding");
            Choice::Quit
        }
    }
}

/// The no-choice announcement before a forced upgrade.
fn announce_upgrade(label: &str, required: &str) {
    let message = format!("The deferral for {label} has ended; upgrading to {required} now.");
    if std::io::stdin().is_terminal() {
        ui::warn(&message);
    } else {
        let _ = dialog(&message, &["Quit"]);
    }
}

/// Show a dialog to the console user via osascript; returns the button
/// pressed, or None when no dialog could be shown.
fn dialog(message: &str, buttons: &[&str]) -> Option<String> {
    let buttons_list = buttons
        .iter()
        .map(|b| format!("\"{b}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let script = format!(
        "display dialog \"{}\" buttons {{{buttons_list}}} default button 1 with icon caution",
        message.replace('"', "\\\"")
    );
    let output = Command::new("osascript").args(["-e", &script]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .trim()
        .strip_prefix("button returned:")
        .map(str::to_string)
}

fn human_delta(delta: chrono::TimeDelta) -> String {
    let minutes = delta.num_minutes();
    if minutes >= 60 * 24 {
        format!("{} day(s)", minutes / (60 * 24))
    } else if minutes >= 60 {
        format!("{} hour(s)", minutes / 60)
    } else {
        format!("{} minute(s)", minutes.max(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> AuditArgs {
        AuditArgs {
            app_name: Some("Google Drive.app".to_string()),
            bundle_id: None,
            pkg_id: None,
            required_version: "90.0".to_string(),
            due: 1_710_000_000,
            process_name: None,
        }
    }

    #[test]
    fn test_process_name_strips_app_suffix() {
        assert_eq!(process_name(&args()).as_deref(), Some("Google Drive"));

        let mut with_override = args();
        with_override.process_name = Some("GoogleDriveFS".to_string());
        assert_eq!(process_name(&with_override).as_deref(), Some("GoogleDriveFS"));

        let mut nameless = args();
        nameless.app_name = None;
        assert!(process_name(&nameless).is_none());
    }

    #[test]
    fn test_display_label_preference() {
        assert_eq!(display_label(&args()), "Google Drive.app");

        let mut by_bundle = args();
        by_bundle.app_name = None;
        by_bundle.bundle_id = Some("com.google.drivefs".to_string());
        assert_eq!(display_label(&by_bundle), "com.google.drivefs");
    }

    #[test]
    fn test_human_delta() {
        assert_eq!(human_delta(chrono::TimeDelta::days(3)), "3 day(s)");
        assert_eq!(human_delta(chrono::TimeDelta::hours(5)), "5 hour(s)");
        assert_eq!(human_delta(chrono::TimeDelta::minutes(42)), "42 minute(s)");
        assert_eq!(human_delta(chrono::TimeDelta::minutes(-1)), "0 minute(s)");
    }
}
