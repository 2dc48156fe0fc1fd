//! Upload/Update execution.
//!
//! Takes the Resolver's decision and performs the implied tenant mutation:
//! create a new Custom App, refresh an existing one, or report a duplicate
//! conflict. Audit-enforced entries get their script regenerated with a
//! freshly computed required version and due date, superseding any delay
//! persisted on devices. Re-running against an already-updated entry is a
//! no-op update, so partial failures are always safe to retry by hand.

use chrono::{DateTime, Utc};

use crate::artifact::ArtifactDescriptor;
use crate::audit_script::{self, AuditParams};
use crate::config::{Config, TargetEnv};
use crate::error::{Error, Result};
use crate::kandji::{Backend, CreateRequest, Enforcement, ManagedApp, UpdateRequest};
use crate::notify::{DuplicateEntry, Event, Notifier};
use crate::resolver::Decision;

/// One Custom App name the pipeline maintains for this artifact.
#[derive(Debug, Clone)]
pub struct Target {
    pub env: TargetEnv,
    pub name: String,
    /// Resolved Self Service category id; presence forces self-service
    /// enforcement on create.
    pub category_id: Option<String>,
}

/// What the Executor did for one target.
#[derive(Debug, Clone)]
pub enum ExecOutcome {
    Created(ManagedApp),
    Updated(ManagedApp),
    /// Dry run; the decision that would have been taken.
    WouldMutate { action: &'static str },
}

/// Executes resolver decisions against a backend.
pub struct Executor<'a, B: Backend> {
    backend: &'a B,
    config: &'a Config,
    notifier: &'a dyn Notifier,
    dry_run: bool,
}

impl<'a, B: Backend> Executor<'a, B> {
    pub fn new(
        backend: &'a B,
        config: &'a Config,
        notifier: &'a dyn Notifier,
        dry_run: bool,
    ) -> Self {
        Self {
            backend,
            config,
            notifier,
            dry_run,
        }
    }

    /// Apply a decision for one target.
    ///
    /// `file_key` is the uploaded package key; absent only in dry runs,
    /// which never touch the backend.
    pub fn execute(
        &self,
        descriptor: &ArtifactDescriptor,
        target: &Target,
        decision: &Decision,
        file_key: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ExecOutcome> {
        match decision {
            Decision::Create => self.create(descriptor, target, file_key, now),
            Decision::Update(existing) => self.update(descriptor, target, existing, file_key, now),
            Decision::Conflict(duplicates) => Err(self.report_conflict(target, duplicates)),
            Decision::NotFound => Err(Error::NotFoundNoAutoCreate {
                name: target.name.clone(),
            }),
        }
    }

    /// Enforcement for a new entry: a Self Service category wins, then the
    /// config default, then install-once.
    fn create_enforcement(&self, target: &Target) -> Enforcement {
        if target.category_id.is_some() {
            Enforcement::SelfService
        } else {
            self.config.default_enforcement().unwrap_or(Enforcement::InstallOnce)
        }
    }

    fn create(
        &self,
        descriptor: &ArtifactDescriptor,
        target: &Target,
        file_key: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ExecOutcome> {
        let enforcement = self.create_enforcement(target);
        let audit_script = if enforcement == Enforcement::AuditEnforce {
            Some(self.render_audit_script(descriptor, target.env, now)?)
        } else {
            None
        };

        if self.dry_run {
            log::info!(
                "DRY RUN: would create Custom App '{}' with enforcement {}",
                target.name,
                enforcement.config_name()
            );
            return Ok(ExecOutcome::WouldMutate { action: "create" });
        }

        let file_key = file_key.ok_or_else(|| Error::Other("no uploaded package key".to_string()))?;
        let request = CreateRequest {
            name: target.name.clone(),
            file_key: file_key.to_string(),
            enforcement,
            audit_script,
            self_service_category_id: target.category_id.clone(),
        };
        let created = self
            .backend
            .create_custom_app(&request)
            .map_err(|err| wrap_mutation_error(&target.name, "create", err))?;

        log::info!("Created Custom App '{}' ({})", created.name, created.id);
        self.notify_mutation("create", descriptor, &created);
        Ok(ExecOutcome::Created(created))
    }

    fn update(
        &self,
        descriptor: &ArtifactDescriptor,
        target: &Target,
        existing: &ManagedApp,
        file_key: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ExecOutcome> {
        // The tenant's enforcement is authoritative on update; only the
        // audit script follows it.
        let audit_script = if existing.install_enforcement == Enforcement::AuditEnforce {
            if self.config.default_enforcement() != Some(Enforcement::AuditEnforce) {
                log::info!("Existing entry is audit-enforced; deferring to tenant enforcement");
            }
            Some(self.render_audit_script(descriptor, target.env, now)?)
        } else {
            None
        };

        if self.dry_run {
            log::info!(
                "DRY RUN: would update Custom App '{}' ({})",
                existing.name,
                existing.id
            );
            return Ok(ExecOutcome::WouldMutate { action: "update" });
        }

        let file_key = file_key.ok_or_else(|| Error::Other("no uploaded package key".to_string()))?;
        let request = UpdateRequest {
            file_key: file_key.to_string(),
            audit_script,
        };
        let updated = self
            .backend
            .update_custom_app(&existing.id, &request)
            .map_err(|err| wrap_mutation_error(&target.name, "update", err))?;

        log::info!("Updated Custom App '{}' ({})", updated.name, updated.id);
        self.notify_mutation("update", descriptor, &updated);
        Ok(ExecOutcome::Updated(updated))
    }

    /// Report duplicates and hand back the (non-fatal) conflict error.
    /// Nothing is mutated, in dry runs or otherwise.
    fn report_conflict(&self, target: &Target, duplicates: &[ManagedApp]) -> Error {
        log::error!(
            "{} Custom Apps match '{}'; skipping mutation",
            duplicates.len(),
            target.name
        );
        let entries = duplicates
            .iter()
            .map(|app| DuplicateEntry {
                name: app.name.clone(),
                pkg_name: app.pkg_name().map(str::to_string),
                created_at: app.created_at,
                last_modified: app.file_updated.or(app.updated_at),
                console_url: self.backend.console_url(&app.id),
            })
            .collect();
        self.notifier.notify(&Event::DuplicateConflict {
            name: target.name.clone(),
            duplicates: entries,
        });
        Error::DuplicateConflict {
            name: target.name.clone(),
            count: duplicates.len(),
        }
    }

    fn render_audit_script(
        &self,
        descriptor: &ArtifactDescriptor,
        env: TargetEnv,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let version = descriptor.version.as_deref().ok_or_else(|| {
            Error::Other(format!(
                "audit enforcement for {} requires a package version",
                descriptor.pkg_name
            ))
        })?;
        let delay_days = self.config.delay_days(env);
        let due_at = AuditParams::due_from_delay(now, delay_days);
        Ok(audit_script::render(&AuditParams {
            app_name: descriptor.app_name.as_deref(),
            bundle_id: descriptor.bundle_id.as_deref(),
            pkg_id: descriptor.pkg_id.as_deref(),
            required_version: version,
            due_at,
        }))
    }

    fn notify_mutation(&self, action: &'static str, descriptor: &ArtifactDescriptor, app: &ManagedApp) {
        self.notifier.notify(&Event::Mutated {
            action,
            name: app.name.clone(),
            id: app.id.clone(),
            pkg_name: descriptor.pkg_name.clone(),
            enforcement: app.install_enforcement.config_name(),
            console_url: self.backend.console_url(&app.id),
        });
    }
}

/// A failed mutation after a successful upload is a partial update: fatal,
/// but the next run re-discovers the same entry, so re-running is safe.
/// Auth failures keep their own category.
fn wrap_mutation_error(name: &str, operation: &str, err: Error) -> Error {
    match err {
        Error::Http { message, status, .. } => Error::PartialUpdate {
            name: name.to_string(),
            operation: operation.to_string(),
            message: match status {
                Some(code) => format!("HTTP {code}: {message}"),
                None => message,
            },
        },
        other => other,
    }
}
