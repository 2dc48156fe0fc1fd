//! Artifact descriptor extraction from built installer packages.
//!
//! A descriptor is produced once per build: recipe name plus whatever app
//! identity the invocation supplied. When audit enforcement needs the
//! missing pieces (bundle id, version), the package is expanded with
//! `pkgutil --expand-full` and mined for the main app bundle's Info.plist,
//! falling back to package-receipt metadata (`PackageInfo`/`Distribution`)
//! for payload-free packages.

use plist::Value as PlistValue;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Directories whose Info.plists never describe the main app bundle.
const HELPER_DIRS: &[&str] = &[
    "Extensions/",
    "Frameworks/",
    "Helpers/",
    "Library/",
    "MacOS/",
    "PlugIns/",
    "Resources/",
    "SharedSupport/",
    "opt/",
    "bin/",
];

/// Metadata describing one freshly built installer package.
#[derive(Debug, Clone)]
pub struct ArtifactDescriptor {
    /// Recipe name, used for target-name resolution.
    pub recipe_name: String,
    /// `.app` bundle name inside the payload, when known.
    pub app_name: Option<String>,
    /// Bundle identifier of the payload app.
    pub bundle_id: Option<String>,
    /// Package identifier, for payload-free packages.
    pub pkg_id: Option<String>,
    /// Version of the payload app or package.
    pub version: Option<String>,
    /// Path of the built package on disk.
    pub pkg_path: PathBuf,
    /// Package basename.
    pub pkg_name: String,
}

impl ArtifactDescriptor {
    /// Build a descriptor from invocation inputs.
    pub fn new(
        recipe_name: impl Into<String>,
        pkg_path: impl Into<PathBuf>,
        app_name: Option<String>,
        bundle_id: Option<String>,
        version: Option<String>,
    ) -> Self {
        let pkg_path = pkg_path.into();
        let pkg_name = pkg_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            recipe_name: recipe_name.into(),
            app_name,
            bundle_id,
            pkg_id: None,
            version,
            pkg_path,
            pkg_name,
        }
    }

    /// Package basename without the `.pkg` extension.
    pub fn pkg_stem(&self) -> &str {
        self.pkg_name.strip_suffix(".pkg").unwrap_or(&self.pkg_name)
    }

    /// Whether enough identity exists to parametrize an audit script.
    pub fn has_audit_identity(&self) -> bool {
        (self.app_name.is_some() || self.bundle_id.is_some() || self.pkg_id.is_some())
            && self.version.is_some()
    }

    /// Fill any missing audit identity by expanding the package.
    pub fn ensure_audit_identity(&mut self) -> Result<()> {
        if self.has_audit_identity() {
            log::debug!("Skipping package expansion, app identity already known");
            return Ok(());
        }
        let extracted = extract_from_pkg(&self.pkg_path)?;
        log::info!(
            "Extracted identity from {}: {:?}",
            self.pkg_name,
            extracted
        );
        if self.app_name.is_none() {
            self.app_name = extracted.app_name;
        }
        if self.bundle_id.is_none() {
            self.bundle_id = extracted.bundle_id;
        }
        if self.pkg_id.is_none() {
            self.pkg_id = extracted.pkg_id;
        }
        if self.version.is_none() {
            self.version = extracted.version;
        }
        Ok(())
    }
}

/// Identity fields mined out of a package.
#[derive(Debug, Clone, Default)]
pub struct ExtractedIdentity {
    pub app_name: Option<String>,
    pub bundle_id: Option<String>,
    pub pkg_id: Option<String>,
    pub version: Option<String>,
}

/// Expand a package into a scratch directory and extract identity.
pub fn extract_from_pkg(pkg_path: &Path) -> Result<ExtractedIdentity> {
    let scratch = tempfile::tempdir().map_err(|e| Error::io(pkg_path, e))?;
    let expanded = scratch.path().join("expanded");

    let output = Command::new("pkgutil")
        .arg("--expand-full")
        .arg(pkg_path)
        .arg(&expanded)
        .output()
        .map_err(|e| Error::io(pkg_path, e))?;
    if !output.status.success() {
        return Err(Error::PackageMetadata {
            pkg: pkg_path.to_path_buf(),
            message: format!(
                "pkgutil --expand-full failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    extract_from_expanded(&expanded, pkg_path)
}

/// Extract identity from an already-expanded package tree.
///
/// Split out from [`extract_from_pkg`] so the discovery heuristics are
/// testable without `pkgutil`.
pub fn extract_from_expanded(root: &Path, pkg_path: &Path) -> Result<ExtractedIdentity> {
    match app_plist_identity(root) {
        Some(identity) => Ok(identity),
        None => {
            log::warn!("No usable app Info.plist in package; trying receipt metadata");
            receipt_identity(root, pkg_path)
        }
    }
}

/// Find the main app bundle's Info.plist and read its identity.
fn app_plist_identity(root: &Path) -> Option<ExtractedIdentity> {
    let candidates: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.into_path())
        .filter(|path| is_core_app_plist(root, path))
        .collect();

    let plist_path = match candidates.len() {
        0 => return None,
        1 => candidates.into_iter().next()?,
        _ => largest_parent(candidates)?,
    };

    let dict = PlistValue::from_file(&plist_path).ok()?;
    let dict = dict.as_dictionary()?;
    let get = |key: &str| {
        dict.get(key)
            .and_then(PlistValue::as_string)
            .map(str::to_string)
    };

    let bundle_id = get("CFBundleIdentifier")?;
    let version = get("CFBundleShortVersionString")?;

    // The bundle directory name beats CFBundleName: the two disagree often
    // enough that the audit would look for the wrong .app.
    let bundle_dir = plist_path.parent()?.parent()?;
    let dir_name = bundle_dir.file_name()?.to_string_lossy().into_owned();
    let app_name = if dir_name.ends_with(".app") {
        Some(dir_name)
    } else {
        get("CFBundleName").map(|name| format!("{name}.app"))
    };

    Some(ExtractedIdentity {
        app_name,
        bundle_id: Some(bundle_id),
        version: Some(version),
        pkg_id: None,
    })
}

/// True for `*/Contents/Info.plist` paths outside helper directories.
fn is_core_app_plist(root: &Path, path: &Path) -> bool {
    let Ok(relative) = path.strip_prefix(root) else {
        return false;
    };
    let text = relative.to_string_lossy();
    text.ends_with("Contents/Info.plist") && !HELPER_DIRS.iter().any(|dir| text.contains(dir))
}

/// Of several candidate files, keep the one whose parent directory holds
/// the most bytes — the main app bundle dwarfs its helpers.
fn largest_parent(candidates: Vec<PathBuf>) -> Option<PathBuf> {
    candidates.into_iter().max_by_key(|path| {
        path.parent().map_or(0, |parent| {
            WalkDir::new(parent)
                .into_iter()
                .filter_map(std::result::Result::ok)
                .filter(|e| e.file_type().is_file())
                .filter_map(|e| e.metadata().ok())
                .map(|m| m.len())
                .sum::<u64>()
        })
    })
}

/// Parse `identifier`/`version` from receipt metadata.
fn receipt_identity(root: &Path, pkg_path: &Path) -> Result<ExtractedIdentity> {
    let mut package_infos = Vec::new();
    let mut distributions = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_map(std::result::Result::ok) {
        match entry.file_name().to_string_lossy().as_ref() {
            "PackageInfo" => package_infos.push(entry.into_path()),
            "Distribution" => distributions.push(entry.into_path()),
            _ => {}
        }
    }

    if package_infos.is_empty() {
        return Err(Error::PackageMetadata {
            pkg: pkg_path.to_path_buf(),
            message: "no PackageInfo file found in package".to_string(),
        });
    }

    let chosen = if package_infos.len() > 1 {
        // A Distribution file names the authoritative sub-package; match
        // its first pkg-ref against the PackageInfo identifiers.
        if let Some(distribution) = distributions.first()
            && let Some((distro_id, _)) = parse_receipt_attrs(distribution, true)
            && let Some(matching) = package_infos.iter().find(|info| {
                parse_receipt_attrs(info, false).is_some_and(|(id, _)| id == distro_id)
            })
        {
            matching.clone()
        } else {
            largest_parent(package_infos).ok_or_else(|| Error::PackageMetadata {
                pkg: pkg_path.to_path_buf(),
                message: "could not choose among PackageInfo files".to_string(),
            })?
        }
    } else {
        package_infos.into_iter().next().unwrap_or_default()
    };

    let (pkg_id, version) =
        parse_receipt_attrs(&chosen, false).ok_or_else(|| Error::PackageMetadata {
            pkg: pkg_path.to_path_buf(),
            message: format!("identifier/version missing from {}", chosen.display()),
        })?;

    Ok(ExtractedIdentity {
        pkg_id: Some(pkg_id),
        version: Some(version),
        ..Default::default()
    })
}

/// Pull the id/version attribute pair from a receipt XML file.
///
/// `PackageInfo` carries them on its root `pkg-info` element,
/// `Distribution` on its first `pkg-ref`. Two attributes do not justify an
/// XML parser dependency.
fn parse_receipt_attrs(path: &Path, distribution: bool) -> Option<(String, String)> {
    let content = fs::read_to_string(path).ok()?;
    let element = if distribution {
        let re = Regex::new(r"<pkg-ref\b[^>]*>").ok()?;
        re.find(&content)?.as_str().to_string()
    } else {
        let re = Regex::new(r"<pkg-info\b[^>]*>").ok()?;
        re.find(&content)?.as_str().to_string()
    };

    let id_attr = if distribution { "id" } else { "identifier" };
    let id_re = Regex::new(&format!(r#"\b{id_attr}="([^"]+)""#)).ok()?;
    let version_re = Regex::new(r#"\bversion="([^"]+)""#).ok()?;

    let id = id_re.captures(&element)?.get(1)?.as_str().to_string();
    let version = version_re.captures(&element)?.get(1)?.as_str().to_string();
    Some((id, version))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn app_plist_xml(bundle_id: &str, version: &str, name: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>CFBundleIdentifier</key><string>{bundle_id}</string>
    <key>CFBundleShortVersionString</key><string>{version}</string>
    <key>CFBundleName</key><string>{name}</string>
</dict>
</plist>"#
        )
    }

    #[test]
    fn test_descriptor_basics() {
        let desc = ArtifactDescriptor::new(
            "GoogleDrive",
            "/tmp/GoogleDrive-90.0.pkg",
            None,
            None,
            Some("90.0".to_string()),
        );
        assert_eq!(desc.pkg_name, "GoogleDrive-90.0.pkg");
        assert_eq!(desc.pkg_stem(), "GoogleDrive-90.0");
        assert!(!desc.has_audit_identity());
    }

    #[test]
    fn test_audit_identity_complete() {
        let desc = ArtifactDescriptor::new(
            "GoogleDrive",
            "/tmp/GoogleDrive-90.0.pkg",
            Some("Google Drive.app".to_string()),
            None,
            Some("90.0".to_string()),
        );
        assert!(desc.has_audit_identity());
    }

    #[test]
    fn test_plist_discovery_skips_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(
            &root.join("Payload/Google Drive.app/Contents/Info.plist"),
            &app_plist_xml("com.google.drivefs", "90.0", "Google Drive"),
        );
        write(
            &root.join("Payload/Google Drive.app/Contents/Frameworks/Helper.app/Contents/Info.plist"),
            &app_plist_xml("com.google.drivefs.helper", "1.0", "Helper"),
        );

        let identity = extract_from_expanded(root, Path::new("/tmp/x.pkg")).unwrap();
        assert_eq!(identity.bundle_id.as_deref(), Some("com.google.drivefs"));
        assert_eq!(identity.version.as_deref(), Some("90.0"));
        assert_eq!(identity.app_name.as_deref(), Some("Google Drive.app"));
        assert!(identity.pkg_id.is_none());
    }

    #[test]
    fn test_app_name_from_bundle_dir() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        // Bundle dir name wins over CFBundleName.
        write(
            &root.join("Payload/Firefox.app/Contents/Info.plist"),
            &app_plist_xml("org.mozilla.firefox", "120.0", "firefox-bin"),
        );
        let identity = extract_from_expanded(root, Path::new("/tmp/x.pkg")).unwrap();
        assert_eq!(identity.app_name.as_deref(), Some("Firefox.app"));
    }

    #[test]
    fn test_receipt_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(
            &root.join("PackageInfo"),
            r#"<pkg-info format-version="2" identifier="com.example.tool" version="3.1.4" install-location="/">
</pkg-info>"#,
        );
        let identity = extract_from_expanded(root, Path::new("/tmp/x.pkg")).unwrap();
        assert_eq!(identity.pkg_id.as_deref(), Some("com.example.tool"));
        assert_eq!(identity.version.as_deref(), Some("3.1.4"));
        assert!(identity.app_name.is_none());
    }

    #[test]
    fn test_receipt_distribution_selects_matching_packageinfo() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(
            &root.join("Distribution"),
            r#"<installer-gui-script minSpecVersion="1">
    <pkg-ref id="com.example.main" version="2.0"/>
    <pkg-ref id="com.example.extra" version="9.9"/>
</installer-gui-script>"#,
        );
        write(
            &root.join("extra.pkg/PackageInfo"),
            r#"<pkg-info identifier="com.example.extra" version="9.9"></pkg-info>"#,
        );
        write(
            &root.join("main.pkg/PackageInfo"),
            r#"<pkg-info identifier="com.example.main" version="2.0"></pkg-info>"#,
        );
        let identity = extract_from_expanded(root, Path::new("/tmp/x.pkg")).unwrap();
        assert_eq!(identity.pkg_id.as_deref(), Some("com.example.main"));
        assert_eq!(identity.version.as_deref(), Some("2.0"));
    }

    #[test]
    fn test_no_metadata_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = extract_from_expanded(dir.path(), Path::new("/tmp/x.pkg")).unwrap_err();
        assert!(matches!(err, Error::PackageMetadata { .. }));
    }
}
