//! Custom App resolution.
//!
//! Decides what an incoming artifact means for the tenant: update an
//! existing entry, create a new one, or report an unresolvable duplicate
//! conflict. Exact name matching runs first; when it fails or is ambiguous,
//! an optional dynamic-lookup pass matches entries by their uploaded
//! package names, preferring the highest package version and breaking ties
//! deterministically toward the longest-standing entry.

use regex::Regex;

use crate::artifact::ArtifactDescriptor;
use crate::kandji::ManagedApp;
use crate::version::PackageVersion;

/// What the Executor should do for one (artifact, target name) pair.
#[derive(Debug, Clone)]
pub enum Decision {
    /// No resolvable match; create a new entry.
    Create,
    /// Update this entry in place.
    Update(ManagedApp),
    /// Multiple matches, none selectable; report and do nothing.
    Conflict(Vec<ManagedApp>),
    /// No match and auto-create is disabled.
    NotFound,
}

impl Decision {
    /// Short operator-facing label.
    pub fn describe(&self) -> String {
        match self {
            Self::Create => "create".to_string(),
            Self::Update(app) => format!("update '{}' ({})", app.name, app.id),
            Self::Conflict(apps) => format!("conflict ({} duplicates)", apps.len()),
            Self::NotFound => "not found".to_string(),
        }
    }
}

/// Flags steering resolution, copied out of the immutable config.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    pub dynamic_lookup: bool,
    pub auto_create: bool,
}

/// Resolve an artifact against the tenant's current Custom App listing.
///
/// Deterministic: for identical inputs the same decision comes back
/// regardless of listing order. Dry-run mode does not influence the
/// decision, only whether the Executor acts on it.
pub fn resolve(
    descriptor: &ArtifactDescriptor,
    target_name: &str,
    category_id: Option<&str>,
    listing: &[ManagedApp],
    opts: ResolveOptions,
) -> Decision {
    let exact: Vec<&ManagedApp> = listing.iter().filter(|app| app.name == target_name).collect();

    match exact.len() {
        1 => Decision::Update(exact[0].clone()),
        0 => {
            log::warn!("No existing Custom App named '{target_name}'");
            if opts.dynamic_lookup {
                dynamic_lookup(descriptor, listing, &[], opts)
            } else {
                create_or_not_found(target_name, opts)
            }
        }
        count => {
            log::warn!("{count} Custom Apps share the name '{target_name}'");
            // A Self Service category can disambiguate duplicates that only
            // differ by where they surface.
            if let Some(category) = category_id {
                let by_category: Vec<&ManagedApp> = exact
                    .iter()
                    .copied()
                    .filter(|app| {
                        app.show_in_self_service
                            && app.self_service_category_id.as_deref() == Some(category)
                    })
                    .collect();
                if let [only] = by_category.as_slice() {
                    return Decision::Update((*only).clone());
                }
            }
            if opts.dynamic_lookup {
                dynamic_lookup(descriptor, listing, &exact, opts)
            } else {
                Decision::Conflict(exact.into_iter().cloned().collect())
            }
        }
    }
}

/// Fuzzy fallback pass over uploaded package names.
fn dynamic_lookup(
    descriptor: &ArtifactDescriptor,
    listing: &[ManagedApp],
    duplicates: &[&ManagedApp],
    opts: ResolveOptions,
) -> Decision {
    let incoming_base = pkg_base_name(descriptor.pkg_stem());

    // Candidates: entries whose package stem matches the incoming package
    // once upload suffix and version are stripped, unioned with any
    // duplicate set carried over from the exact-match pass.
    let mut candidates: Vec<&ManagedApp> = listing
        .iter()
        .filter(|app| {
            app.pkg_name()
                .filter(|name| name.ends_with(".pkg"))
                .map(sanitize_pkg_stem)
                .is_some_and(|stem| pkg_base_name(&stem) == incoming_base)
        })
        .collect();
    for dup in duplicates {
        if !candidates.iter().any(|c| c.id == dup.id) {
            candidates.push(dup);
        }
    }

    if candidates.is_empty() {
        log::warn!("Dynamic lookup found no candidate for '{incoming_base}'");
        return create_or_not_found(&descriptor.pkg_name, opts);
    }

    // Keep only the candidates carrying the maximal package version.
    let versions: Vec<PackageVersion> = candidates
        .iter()
        .map(|app| {
            app.pkg_name()
                .map(sanitize_pkg_stem)
                .and_then(|stem| pkg_version(&stem))
                .unwrap_or_else(|| PackageVersion::parse(""))
        })
        .collect();
    let best = versions.iter().max().cloned().unwrap_or_else(|| PackageVersion::parse(""));
    let mut maximal: Vec<&ManagedApp> = candidates
        .iter()
        .zip(&versions)
        .filter(|(_, version)| **version == best)
        .map(|(app, _)| *app)
        .collect();

    // Ties favor the longest-standing entry: earliest package upload, then
    // earliest entry modification. Stable under listing permutation.
    maximal.sort_by_key(|app| (app.last_modified_key(), app.id.clone()));
    match maximal.first() {
        Some(chosen) => {
            log::info!(
                "Dynamic lookup selected '{}' ({}) at version {}",
                chosen.name,
                chosen.id,
                best
            );
            Decision::Update((*chosen).clone())
        }
        None => create_or_not_found(&descriptor.pkg_name, opts),
    }
}

fn create_or_not_found(name: &str, opts: ResolveOptions) -> Decision {
    if opts.auto_create {
        log::info!("Will create '{name}' as a new Custom App");
        Decision::Create
    } else {
        Decision::NotFound
    }
}

/// Strip the `_XXXXXXXX` suffix the backend appends to uploaded package
/// names, and the `.pkg` extension.
fn sanitize_pkg_stem(pkg_name: &str) -> String {
    let stem = pkg_name.strip_suffix(".pkg").unwrap_or(pkg_name);
    let re = Regex::new(r"_\w{8}$").unwrap();
    re.replace(stem, "").into_owned()
}

/// The package stem with any trailing `-VERSION` suffix removed.
fn pkg_base_name(stem: &str) -> String {
    let re = Regex::new(r"-\d[\w.]*$").unwrap();
    re.replace(stem, "").into_owned()
}

/// The trailing `-VERSION` suffix of a package stem, parsed.
fn pkg_version(stem: &str) -> Option<PackageVersion> {
    let re = Regex::new(r"-(\d[\w.]*)$").unwrap();
    re.captures(stem)
        .and_then(|caps| caps.get(1))
        .map(|m| PackageVersion::parse(m.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(pkg: &str) -> ArtifactDescriptor {
        ArtifactDescriptor::new("GoogleDrive", format!("/tmp/{pkg}"), None, None, None)
    }

    fn app(id: &str, name: &str, pkg: Option<&str>, modified_day: u32) -> ManagedApp {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "name": name,
            "install_enforcement": "install_once",
            "file_key": pkg.map(|p| format!("companies/x/library/custom_apps/{p}")),
            "file_updated": format!("2024-01-{modified_day:02}T00:00:00Z"),
            "updated_at": format!("2024-01-{modified_day:02}T12:00:00Z"),
        }))
        .unwrap()
    }

    const OPTS_PLAIN: ResolveOptions = ResolveOptions {
        dynamic_lookup: false,
        auto_create: true,
    };
    const OPTS_DYNAMIC: ResolveOptions = ResolveOptions {
        dynamic_lookup: true,
        auto_create: true,
    };

    #[test]
    fn test_single_exact_match_updates() {
        let listing = vec![app("1", "Google Drive", Some("GoogleDrive-89.0_ab12cd34.pkg"), 1)];
        let decision = resolve(
            &descriptor("GoogleDrive-90.0.pkg"),
            "Google Drive",
            None,
            &listing,
            OPTS_PLAIN,
        );
        assert!(matches!(decision, Decision::Update(app) if app.id == "1"));
    }

    #[test]
    fn test_no_match_no_lookup_creates() {
        // Artifact GoogleDrive-90.0.pkg, no entry named "Google Drive",
        // lookup off, auto-create on: a create decision.
        let listing = vec![app("1", "Dropbox", Some("Dropbox-1.0_ab12cd34.pkg"), 1)];
        let decision = resolve(
            &descriptor("GoogleDrive-90.0.pkg"),
            "Google Drive",
            None,
            &listing,
            OPTS_PLAIN,
        );
        assert!(matches!(decision, Decision::Create));
    }

    #[test]
    fn test_no_match_no_autocreate_is_not_found() {
        let decision = resolve(
            &descriptor("GoogleDrive-90.0.pkg"),
            "Google Drive",
            None,
            &[],
            ResolveOptions {
                dynamic_lookup: false,
                auto_create: false,
            },
        );
        assert!(matches!(decision, Decision::NotFound));
    }

    #[test]
    fn test_duplicates_without_lookup_conflict() {
        let listing = vec![
            app("1", "Google Drive", Some("GoogleDrive-89.0_ab12cd34.pkg"), 1),
            app("2", "Google Drive", Some("GoogleDrive-89.0_ef56gh78.pkg"), 5),
        ];
        let decision = resolve(
            &descriptor("GoogleDrive-90.0.pkg"),
            "Google Drive",
            None,
            &listing,
            OPTS_PLAIN,
        );
        match decision {
            Decision::Conflict(apps) => assert_eq!(apps.len(), 2),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicates_disambiguated_by_category() {
        let mut a = app("1", "Google Drive", Some("GoogleDrive-89.0_ab12cd34.pkg"), 1);
        a.show_in_self_service = true;
        a.self_service_category_id = Some("cat-1".to_string());
        let b = app("2", "Google Drive", Some("GoogleDrive-89.0_ef56gh78.pkg"), 5);
        let decision = resolve(
            &descriptor("GoogleDrive-90.0.pkg"),
            "Google Drive",
            Some("cat-1"),
            &[a, b],
            OPTS_PLAIN,
        );
        assert!(matches!(decision, Decision::Update(app) if app.id == "1"));
    }

    #[test]
    fn test_dynamic_lookup_highest_version_wins() {
        let listing = vec![
            app("old", "Google Drive (AutoPkg)", Some("GoogleDrive-88.0_ab12cd34.pkg"), 1),
            app("new", "Google Drive (legacy)", Some("GoogleDrive-89.0_ef56gh78.pkg"), 5),
        ];
        let decision = resolve(
            &descriptor("GoogleDrive-90.0.pkg"),
            "Google Drive",
            None,
            &listing,
            OPTS_DYNAMIC,
        );
        assert!(matches!(decision, Decision::Update(app) if app.id == "new"));
    }

    #[test]
    fn test_dynamic_lookup_tie_prefers_earliest_modified() {
        // Both candidates sit at 89.0 (neither equals the incoming 90.0);
        // the Jan 1 entry wins over the Jan 5 duplicate.
        let jan1 = app("jan1", "Google Drive (AutoPkg)", Some("GoogleDrive-89.0_ab12cd34.pkg"), 1);
        let jan5 = app("jan5", "Google Drive (AutoPkg)", Some("GoogleDrive-89.0_ef56gh78.pkg"), 5);
        let decision = resolve(
            &descriptor("GoogleDrive-90.0.pkg"),
            "Google Drive",
            None,
            &[jan1.clone(), jan5.clone()],
            OPTS_DYNAMIC,
        );
        assert!(matches!(&decision, Decision::Update(app) if app.id == "jan1"));

        // Stable under permutation of the listing.
        let decision = resolve(
            &descriptor("GoogleDrive-90.0.pkg"),
            "Google Drive",
            None,
            &[jan5, jan1],
            OPTS_DYNAMIC,
        );
        assert!(matches!(&decision, Decision::Update(app) if app.id == "jan1"));
    }

    #[test]
    fn test_dynamic_lookup_unique_max_order_independent() {
        let apps = vec![
            app("a", "GD 1", Some("GoogleDrive-88.0_aaaaaaaa.pkg"), 3),
            app("b", "GD 2", Some("GoogleDrive-90.1_bbbbbbbb.pkg"), 9),
            app("c", "GD 3", Some("GoogleDrive-89.5_cccccccc.pkg"), 1),
        ];
        for rotation in 0..apps.len() {
            let mut rotated = apps.clone();
            rotated.rotate_left(rotation);
            let decision = resolve(
                &descriptor("GoogleDrive-91.0.pkg"),
                "Google Drive",
                None,
                &rotated,
                OPTS_DYNAMIC,
            );
            assert!(
                matches!(&decision, Decision::Update(app) if app.id == "b"),
                "rotation {rotation} changed the winner"
            );
        }
    }

    #[test]
    fn test_dynamic_lookup_ignores_unrelated_packages() {
        let listing = vec![
            app("1", "Dropbox", Some("Dropbox-190.0_ab12cd34.pkg"), 1),
            app("2", "Zoom", Some("zoomusInstallerFull-6.0_ef56gh78.pkg"), 2),
        ];
        let decision = resolve(
            &descriptor("GoogleDrive-90.0.pkg"),
            "Google Drive",
            None,
            &listing,
            OPTS_DYNAMIC,
        );
        assert!(matches!(decision, Decision::Create));
    }

    #[test]
    fn test_dynamic_lookup_duplicate_seed_without_pkg_match() {
        // Duplicates from the exact pass stay candidates even when their
        // package names have drifted from the incoming stem.
        let listing = vec![
            app("1", "Google Drive", Some("GDrive_Rebrand-89.0_ab12cd34.pkg"), 7),
            app("2", "Google Drive", Some("GDrive_Rebrand-89.0_ef56gh78.pkg"), 2),
        ];
        let decision = resolve(
            &descriptor("GoogleDrive-90.0.pkg"),
            "Google Drive",
            None,
            &listing,
            OPTS_DYNAMIC,
        );
        assert!(matches!(decision, Decision::Update(app) if app.id == "2"));
    }

    #[test]
    fn test_pkg_name_helpers() {
        assert_eq!(sanitize_pkg_stem("GoogleDrive-90.0_ab12cd34.pkg"), "GoogleDrive-90.0");
        assert_eq!(sanitize_pkg_stem("GoogleDrive-90.0.pkg"), "GoogleDrive-90.0");
        assert_eq!(pkg_base_name("GoogleDrive-90.0"), "GoogleDrive");
        assert_eq!(pkg_base_name("NoVersionHere"), "NoVersionHere");
        assert_eq!(pkg_version("GoogleDrive-90.0").unwrap().as_str(), "90.0");
        assert!(pkg_version("NoVersionHere").is_none());
    }
}
