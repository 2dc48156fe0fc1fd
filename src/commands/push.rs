//! `kustom push` — reconcile a built package with the tenant.
//!
//! One synchronous pass per artifact: extract the descriptor, work out the
//! target name(s), list the tenant's Custom Apps, resolve a decision per
//! target, then execute it. The package uploads once and the resulting file
//! key is shared by every target mutation.

use anyhow::{Context as AnyhowContext, Result, bail};
use chrono::Utc;

use crate::Context;
use crate::artifact::ArtifactDescriptor;
use crate::cli::PushArgs;
use crate::config::{Config, TargetEnv};
use crate::executor::{ExecOutcome, Executor, Target};
use crate::kandji::{Backend, Enforcement, KandjiClient, SelfServiceCategory};
use crate::mapping::{MappingRule, RecipeMap};
use crate::notify::{Event, Notifier, NoopNotifier, SlackNotifier};
use crate::resolver::{self, Decision, ResolveOptions};
use crate::secrets::Token;
use crate::ui;

pub fn run(ctx: &Context, args: PushArgs) -> Result<()> {
    if !args.pkg.exists() {
        bail!("Package not found: {}", args.pkg.display());
    }

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    let dry_run = args.dry_run || config.defaults.dry_run;
    if dry_run {
        ui::warn(&format!(
            "DRY RUN: {} will not make any Custom App modifications",
            args.name
        ));
    }

    let descriptor = ArtifactDescriptor::new(
        &args.name,
        &args.pkg,
        args.app_name.clone(),
        args.bundle_id.clone(),
        args.version.clone(),
    );
    if !ctx.quiet {
        ui::kv("Package", &descriptor.pkg_name);
        if let Some(version) = &descriptor.version {
            ui::kv("Version", version);
        }
    }

    let mapping = RecipeMap::load(&Config::mapping_path()?)?;
    let targets = plan_targets(&args, &config, mapping.lookup(&descriptor.recipe_name));

    let token = Token::Kandji {
        name: config.kandji.token_name.clone(),
    }
    .resolve(&config.token_keystore)
    .context("Kandji API token is required")?;
    let client = KandjiClient::new(&config.kandji.api_url, token);

    let notifier = build_notifier(&config);
    let summary = run_pipeline(
        &client,
        &config,
        notifier.as_ref(),
        descriptor,
        &targets,
        PipelineOptions {
            dry_run,
            create_new: args.create_new,
        },
    );

    match summary {
        Ok(()) => Ok(()),
        Err(err) => {
            notifier.notify(&Event::Failure {
                name: args.name.clone(),
                detail: err.to_string(),
            });
            Err(err)
        }
    }
}

/// Per-run pipeline switches.
#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub dry_run: bool,
    /// Skip update resolution and create outright.
    pub create_new: bool,
}

/// A target name plus the category name it may carry into Self Service.
#[derive(Debug, Clone)]
pub struct TargetSpec {
    pub env: TargetEnv,
    pub name: String,
    pub category: Option<String>,
}

/// Decide which Custom App names this run maintains.
///
/// Invocation overrides beat the mapping, which beats the config naming
/// template. A test entry only exists when a test name comes from one of
/// the first two.
fn plan_targets(args: &PushArgs, config: &Config, rule: Option<&MappingRule>) -> Vec<TargetSpec> {
    let prod_name = args
        .prod_name
        .clone()
        .or_else(|| rule.and_then(|r| r.prod_name.clone()))
        .unwrap_or_else(|| config.default_app_name(&args.name));
    let prod_category = args
        .ss_category
        .clone()
        .or_else(|| rule.and_then(|r| r.ss_category.clone()));

    let mut targets = vec![TargetSpec {
        env: TargetEnv::Prod,
        name: prod_name,
        category: prod_category,
    }];

    if let Some(test_name) = args
        .test_name
        .clone()
        .or_else(|| rule.and_then(|r| r.test_name.clone()))
    {
        targets.push(TargetSpec {
            env: TargetEnv::Test,
            name: test_name,
            category: args
                .test_category
                .clone()
                .or_else(|| rule.and_then(|r| r.test_category.clone())),
        });
    }

    targets
}

fn build_notifier(config: &Config) -> Box<dyn Notifier> {
    if !config.slack.enabled {
        return Box::new(NoopNotifier);
    }
    let Some(webhook_name) = config.slack.webhook_name.clone() else {
        log::warn!("Slack enabled but no webhook name configured");
        return Box::new(NoopNotifier);
    };
    match (Token::Slack { name: webhook_name }).resolve(&config.token_keystore) {
        Ok(webhook) => Box::new(SlackNotifier::new(webhook)),
        Err(err) => {
            log::warn!("Slack notifications disabled: {err}");
            Box::new(NoopNotifier)
        }
    }
}

/// The core pipeline, generic over the backend so tests can run it against
/// an in-memory tenant.
pub fn run_pipeline<B: Backend>(
    backend: &B,
    config: &Config,
    notifier: &dyn Notifier,
    mut descriptor: ArtifactDescriptor,
    targets: &[TargetSpec],
    opts: PipelineOptions,
) -> Result<()> {
    let listing = backend.list_custom_apps()?;
    log::debug!("Tenant has {} Custom Apps", listing.len());

    // Category names only resolve to ids when something needs them.
    let needs_categories = targets.iter().any(|t| t.category.is_some())
        || config.default_enforcement() == Some(Enforcement::SelfService);
    let categories = if needs_categories {
        backend.list_self_service_categories()?
    } else {
        Vec::new()
    };

    // Audit enforcement needs app identity; pull it out of the package
    // before any mutation if the config default calls for it.
    if config.default_enforcement() == Some(Enforcement::AuditEnforce) {
        descriptor.ensure_audit_identity()?;
    }

    let file_key = if opts.dry_run {
        ui::info(&format!("DRY RUN: would upload {}", descriptor.pkg_name));
        None
    } else {
        ui::info(&format!("Uploading {}...", descriptor.pkg_name));
        Some(backend.upload_package(&descriptor.pkg_path, &descriptor.pkg_name)?)
    };

    let resolve_opts = ResolveOptions {
        dynamic_lookup: config.defaults.dynamic_lookup,
        auto_create: config.defaults.auto_create,
    };
    let executor = Executor::new(backend, config, notifier, opts.dry_run);

    let mut first_failure: Option<anyhow::Error> = None;
    for spec in targets {
        // Entries that land in Self Service purely via the config default
        // enforcement still get the default category.
        let wanted_category = spec.category.as_deref().or_else(|| {
            (config.default_enforcement() == Some(Enforcement::SelfService))
                .then(|| config.default_category(spec.env))
                .flatten()
        });
        let category_id =
            resolve_category_id(&categories, wanted_category, config.default_category(spec.env));
        let target = Target {
            env: spec.env,
            name: spec.name.clone(),
            category_id,
        };

        let decision = if opts.create_new {
            Decision::Create
        } else {
            resolver::resolve(
                &descriptor,
                &target.name,
                target.category_id.as_deref(),
                &listing,
                resolve_opts,
            )
        };
        log::info!("Decision for '{}': {}", target.name, decision.describe());

        // An update against an audit-enforced entry regenerates the script
        // even when local config would not have asked for one.
        if let Decision::Update(existing) = &decision
            && existing.install_enforcement == Enforcement::AuditEnforce
            && let Err(err) = descriptor.ensure_audit_identity()
        {
            report_target_failure(&mut first_failure, &target.name, err);
            continue;
        }

        match executor.execute(&descriptor, &target, &decision, file_key.as_deref(), Utc::now()) {
            Ok(outcome) => report_outcome(&target, &outcome),
            Err(err) if !err.category().is_fatal() => {
                // Conflicts are reported (console + notifier) but do not
                // fail the run.
                ui::warn(&format!("Skipped '{}': {err}", target.name));
            }
            Err(err) => report_target_failure(&mut first_failure, &target.name, err),
        }
    }

    match first_failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// A failed target does not stop the remaining targets; the run still exits
/// non-zero afterward so the operator sees it.
fn report_target_failure(
    first: &mut Option<anyhow::Error>,
    name: &str,
    err: crate::error::Error,
) {
    ui::error(&format!("{name}: {err}"));
    ui::dim(err.category().advice());
    if first.is_none() {
        *first = Some(anyhow::Error::new(err).context(format!(
            "processing Custom App '{name}' failed"
        )));
    }
}

fn report_outcome(target: &Target, outcome: &ExecOutcome) {
    match outcome {
        ExecOutcome::Created(app) => {
            ui::success(&format!("Created Custom App '{}' ({})", app.name, app.id));
        }
        ExecOutcome::Updated(app) => {
            ui::success(&format!("Updated Custom App '{}' ({})", app.name, app.id));
        }
        ExecOutcome::WouldMutate { action } => {
            ui::info(&format!("DRY RUN: would {action} Custom App '{}'", target.name));
        }
    }
}

/// Map a category name to its id, falling back to the configured default
/// category when the named one is missing from Self Service.
fn resolve_category_id(
    categories: &[SelfServiceCategory],
    name: Option<&str>,
    default_name: Option<&str>,
) -> Option<String> {
    let find = |wanted: &str| {
        categories
            .iter()
            .find(|category| category.name == wanted)
            .map(|category| category.id.clone())
    };

    if let Some(wanted) = name {
        if let Some(id) = find(wanted) {
            return Some(id);
        }
        log::warn!("Category '{wanted}' not found in Self Service; trying default");
        return default_name.and_then(|fallback| {
            let id = find(fallback);
            if id.is_none() {
                log::warn!("Default category '{fallback}' not found in Self Service");
            }
            id
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::tests::{InMemoryBackend, RecordingNotifier};
    use crate::kandji::Enforcement;

    fn config(auto_create: bool, dynamic_lookup: bool) -> Config {
        serde_json::from_str(&format!(
            r#"{{
            "kandji": {{"api_url": "https://test.api.kandji.io", "token_name": "t"}},
            "token_keystore": {{"environment": true}},
            "enforcement": {{"type": "audit_enforce", "delays": {{"prod": 5, "test": 0}}}},
            "defaults": {{"auto_create": {auto_create}, "dynamic_lookup": {dynamic_lookup}}}
        }}"#
        ))
        .unwrap()
    }

    fn descriptor() -> ArtifactDescriptor {
        ArtifactDescriptor::new(
            "GoogleDrive",
            "/tmp/GoogleDrive-90.0.pkg",
            Some("Google Drive.app".to_string()),
            Some("com.google.drivefs".to_string()),
            Some("90.0".to_string()),
        )
    }

    fn prod_target(name: &str) -> Vec<TargetSpec> {
        vec![TargetSpec {
            env: TargetEnv::Prod,
            name: name.to_string(),
            category: None,
        }]
    }

    const LIVE: PipelineOptions = PipelineOptions {
        dry_run: false,
        create_new: false,
    };

    #[test]
    fn test_pipeline_creates_missing_entry() {
        let backend = InMemoryBackend::new(Vec::new());
        let notifier = RecordingNotifier::new();
        let cfg = config(true, false);

        run_pipeline(
            &backend,
            &cfg,
            &notifier,
            descriptor(),
            &prod_target("Google Drive"),
            LIVE,
        )
        .unwrap();

        assert_eq!(backend.uploads.borrow().len(), 1);
        let creates = backend.creates.borrow();
        assert_eq!(creates.len(), 1);
        assert_eq!(creates[0].name, "Google Drive");
        assert_eq!(creates[0].enforcement, Enforcement::AuditEnforce);
    }

    #[test]
    fn test_pipeline_twice_never_duplicates() {
        let backend = InMemoryBackend::new(Vec::new());
        let notifier = RecordingNotifier::new();
        let cfg = config(true, true);

        for _ in 0..2 {
            run_pipeline(
                &backend,
                &cfg,
                &notifier,
                descriptor(),
                &prod_target("Google Drive"),
                LIVE,
            )
            .unwrap();
        }

        assert_eq!(backend.apps.borrow().len(), 1);
        assert_eq!(backend.creates.borrow().len(), 1);
        assert_eq!(backend.updates.borrow().len(), 1);
    }

    #[test]
    fn test_dry_run_issues_zero_backend_mutations() {
        let backend = InMemoryBackend::new(Vec::new());
        let notifier = RecordingNotifier::new();
        let cfg = config(true, false);

        run_pipeline(
            &backend,
            &cfg,
            &notifier,
            descriptor(),
            &prod_target("Google Drive"),
            PipelineOptions {
                dry_run: true,
                create_new: false,
            },
        )
        .unwrap();

        assert_eq!(backend.mutation_count(), 0);
    }

    #[test]
    fn test_not_found_without_autocreate_fails_run() {
        let backend = InMemoryBackend::new(Vec::new());
        let notifier = RecordingNotifier::new();
        let cfg = config(false, false);

        let result = run_pipeline(
            &backend,
            &cfg,
            &notifier,
            descriptor(),
            &prod_target("Google Drive"),
            LIVE,
        );
        assert!(result.is_err());
        assert!(backend.creates.borrow().is_empty());
    }

    #[test]
    fn test_one_failed_target_does_not_block_the_other() {
        let backend = InMemoryBackend::new(Vec::new());
        let notifier = RecordingNotifier::new();
        let cfg = config(false, false);

        // Prod target cannot resolve (no auto-create), but the test target
        // matches an existing entry and still updates.
        let existing = serde_json::from_value(serde_json::json!({
            "id": "test-1",
            "name": "Google Drive (Test)",
            "install_enforcement": "install_once",
            "file_key": "companies/x/library/custom_apps/GoogleDrive-89.0_ab12cd34.pkg",
        }))
        .unwrap();
        backend.apps.borrow_mut().push(existing);

        let targets = vec![
            TargetSpec {
                env: TargetEnv::Prod,
                name: "Google Drive".to_string(),
                category: None,
            },
            TargetSpec {
                env: TargetEnv::Test,
                name: "Google Drive (Test)".to_string(),
                category: None,
            },
        ];
        let result = run_pipeline(&backend, &cfg, &notifier, descriptor(), &targets, LIVE);
        assert!(result.is_err());
        assert_eq!(backend.updates.borrow().len(), 1);
    }

    #[test]
    fn test_duplicate_conflict_does_not_fail_the_run() {
        let backend = InMemoryBackend::new(Vec::new());
        for id in ["1", "2"] {
            let dup = serde_json::from_value(serde_json::json!({
                "id": id,
                "name": "Google Drive",
                "install_enforcement": "install_once",
                "file_key": format!("companies/x/library/custom_apps/GoogleDrive-89.0_0000000{id}.pkg"),
            }))
            .unwrap();
            backend.apps.borrow_mut().push(dup);
        }
        let notifier = RecordingNotifier::new();
        let cfg = config(true, false);

        run_pipeline(
            &backend,
            &cfg,
            &notifier,
            descriptor(),
            &prod_target("Google Drive"),
            LIVE,
        )
        .unwrap();

        assert!(backend.creates.borrow().is_empty());
        assert!(backend.updates.borrow().is_empty());
        assert_eq!(notifier.events.borrow().len(), 1);
    }

    #[test]
    fn test_create_new_skips_resolution() {
        let backend = InMemoryBackend::new(Vec::new());
        let existing = serde_json::from_value(serde_json::json!({
            "id": "1",
            "name": "Google Drive",
            "install_enforcement": "install_once",
            "file_key": "companies/x/library/custom_apps/GoogleDrive-89.0_ab12cd34.pkg",
        }))
        .unwrap();
        backend.apps.borrow_mut().push(existing);
        let notifier = RecordingNotifier::new();
        let cfg = config(true, true);

        run_pipeline(
            &backend,
            &cfg,
            &notifier,
            descriptor(),
            &prod_target("Google Drive"),
            PipelineOptions {
                dry_run: false,
                create_new: true,
            },
        )
        .unwrap();

        // Deliberate duplicate: the operator asked for a fresh entry.
        assert_eq!(backend.creates.borrow().len(), 1);
        assert_eq!(backend.updates.borrow().len(), 0);
    }

    #[test]
    fn test_resolve_category_id_with_fallback() {
        let categories = vec![
            SelfServiceCategory {
                id: "cat-apps".to_string(),
                name: "Apps".to_string(),
            },
            SelfServiceCategory {
                id: "cat-dev".to_string(),
                name: "Developer Tools".to_string(),
            },
        ];

        assert_eq!(
            resolve_category_id(&categories, Some("Apps"), Some("Developer Tools")),
            Some("cat-apps".to_string())
        );
        // Missing name falls back to the default category.
        assert_eq!(
            resolve_category_id(&categories, Some("Nope"), Some("Developer Tools")),
            Some("cat-dev".to_string())
        );
        assert_eq!(resolve_category_id(&categories, Some("Nope"), Some("Also Nope")), None);
        // No explicit category: nothing forces Self Service.
        assert_eq!(resolve_category_id(&categories, None, Some("Apps")), None);
    }
}
