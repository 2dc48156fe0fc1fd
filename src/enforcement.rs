//! Enforcement state machine for the on-device audit.
//!
//! Each audit run assembles the facts (installed version, required version,
//! due date, process state, persisted delay record) and asks [`assess`] for
//! a verdict. The function is pure: prompting the user and touching the
//! delay record are the driving command's job, so every branch is testable
//! as a table of facts. The record is re-derived from scratch each run; an
//! interrupted write can at worst cost one extra prompt, never a wrong
//! enforce/skip outcome.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::version::PackageVersion;

/// Audit passes; no install action.
pub const EXIT_COMPLIANT: i32 = 0;
/// Audit fails; the MDM install mechanism runs the upgrade.
pub const EXIT_TRIGGER: i32 = 1;

/// Length of the single user-requested deferral.
pub fn delay_grace() -> TimeDelta {
    TimeDelta::hours(1)
}

/// States an audit run can land in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditState {
    NotInstalled,
    Compliant,
    PendingEnforcement,
    DelayGranted,
    DelayExpired,
    Triggered,
}

/// Why an audit triggered an install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    /// The app is absent; install immediately regardless of due date.
    NotInstalled,
    /// Enforcement is due and no user session is there to defer for.
    ProcessNotRunning,
}

/// One-time deferral persisted on the device.
///
/// Keyed per enforced version: pushing a new version invalidates any delay
/// granted against the previous one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DelayRecord {
    pub app_identifier: String,
    pub enforced_version: String,
    pub enforcement_due_at: DateTime<Utc>,
    pub delay_granted_at: DateTime<Utc>,
    pub delay_expires_at: DateTime<Utc>,
}

impl DelayRecord {
    /// Grant a fresh one-hour deferral starting now.
    pub fn grant(
        app_identifier: &str,
        required: &PackageVersion,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            app_identifier: app_identifier.to_string(),
            enforced_version: required.as_str().to_string(),
            enforcement_due_at: due_at,
            delay_granted_at: now,
            delay_expires_at: now + delay_grace(),
        }
    }
}

/// Everything one audit run knows.
#[derive(Debug, Clone)]
pub struct EnforcementFacts {
    pub installed: Option<PackageVersion>,
    pub required: PackageVersion,
    pub due_at: DateTime<Utc>,
    pub now: DateTime<Utc>,
    pub process_running: bool,
    pub record: Option<DelayRecord>,
}

/// What the audit run should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Exit non-zero and let the MDM install.
    Triggered(TriggerReason),
    /// Installed version satisfies the requirement; exit zero. Any record
    /// still on disk is stale and should be discarded.
    Compliant { stale_record: bool },
    /// Behind the required version but inside the grace window; exit zero.
    Pending { remaining: TimeDelta },
    /// A granted delay is still running; exit zero, no new prompt.
    DelayActive { remaining: TimeDelta },
    /// No delay yet and a user is present: offer {Delay 1 hour | Quit now}.
    OfferDelay,
    /// The delay ran out (or a new version superseded it) with a user
    /// present: announce, then trigger regardless of the response.
    DelayElapsed,
}

/// Evaluate the transition rules in order.
pub fn assess(facts: &EnforcementFacts) -> Verdict {
    let Some(installed) = &facts.installed else {
        return Verdict::Triggered(TriggerReason::NotInstalled);
    };

    if installed >= &facts.required {
        return Verdict::Compliant {
            stale_record: facts.record.is_some(),
        };
    }

    if facts.now < facts.due_at {
        return Verdict::Pending {
            remaining: facts.due_at - facts.now,
        };
    }

    match &facts.record {
        Some(record)
            if record.enforced_version == facts.required.as_str()
                && facts.now < record.delay_expires_at =>
        {
            Verdict::DelayActive {
                remaining: record.delay_expires_at - facts.now,
            }
        }
        Some(_) => {
            // Expired, or granted against a version that has since been
            // superseded. Either way the deferral is spent.
            if facts.process_running {
                Verdict::DelayElapsed
            } else {
                Verdict::Triggered(TriggerReason::ProcessNotRunning)
            }
        }
        None => {
            if facts.process_running {
                Verdict::OfferDelay
            } else {
                Verdict::Triggered(TriggerReason::ProcessNotRunning)
            }
        }
    }
}

// =============================================================================
// Delay record persistence
// =============================================================================

/// On-disk store for delay records, one JSON file per app identifier.
pub struct DelayStore {
    dir: PathBuf,
}

impl DelayStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store rooted at the fixed, well-known state directory.
    pub fn at_default() -> Self {
        Self::new(crate::paths::state_dir())
    }

    fn record_path(&self, app_identifier: &str) -> PathBuf {
        let slug: String = app_identifier
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '-' })
            .collect();
        self.dir.join(format!("{slug}.delay.json"))
    }

    /// Load the record for an app, if one exists and parses.
    ///
    /// A corrupt record is treated as absent: the state machine re-derives
    /// everything from versions and timestamps, so the only cost is a
    /// possible extra prompt.
    pub fn load(&self, app_identifier: &str) -> Option<DelayRecord> {
        let path = self.record_path(app_identifier);
        let content = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&content) {
            Ok(record) => Some(record),
            Err(err) => {
                log::warn!("Ignoring unreadable delay record {}: {err}", path.display());
                None
            }
        }
    }

    /// Persist a record atomically: write a sibling temp file, then rename
    /// over the final path so an interrupted run never leaves a torn file.
    pub fn save(&self, record: &DelayRecord) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| Error::io(&self.dir, e))?;
        let path = self.record_path(&record.app_identifier);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(record)?;
        fs::write(&tmp, content).map_err(|e| Error::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| Error::io(&path, e))?;
        log::debug!("Persisted delay record at {}", path.display());
        Ok(())
    }

    /// Remove a stale record. Absence is not an error.
    pub fn discard(&self, app_identifier: &str) {
        let path = self.record_path(app_identifier);
        match fs::remove_file(&path) {
            Ok(()) => log::debug!("Discarded delay record {}", path.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => log::warn!("Could not remove {}: {err}", path.display()),
        }
    }

    #[cfg(test)]
    fn path_for(&self, app_identifier: &str) -> PathBuf {
        self.record_path(app_identifier)
    }
}
