//! Kandji tenant API client.
//!
//! Thin typed wrapper over the Custom Apps REST surface: list entries, list
//! Self Service categories, presign + upload a package, create and update
//! entries. Listing calls retry a bounded number of times on transient
//! network failures; mutating calls never auto-retry — the pipeline is
//! idempotent, so the recovery path for a failed mutation is a manual
//! re-run that re-discovers the same entry.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// Attempts for idempotent read calls.
const READ_ATTEMPTS: u32 = 3;
/// Pause between read retries.
const RETRY_BACKOFF: Duration = Duration::from_secs(2);
/// Grace period after an S3 upload before the file key is usable.
const UPLOAD_SETTLE: Duration = Duration::from_secs(5);

/// Install enforcement for a Custom App, in the API's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Enforcement {
    /// Audit script decides; failing audits trigger installs.
    #[serde(rename = "continuously_enforce")]
    AuditEnforce,
    /// Installed once, never re-checked.
    #[serde(rename = "install_once")]
    InstallOnce,
    /// Offered through Self Service, never enforced.
    #[serde(rename = "no_enforcement")]
    SelfService,
}

impl Enforcement {
    /// The value the API expects in form submissions.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::AuditEnforce => "continuously_enforce",
            Self::InstallOnce => "install_once",
            Self::SelfService => "no_enforcement",
        }
    }

    /// The name used in config files and operator-facing output.
    pub fn config_name(&self) -> &'static str {
        match self {
            Self::AuditEnforce => "audit_enforce",
            Self::InstallOnce => "install_once",
            Self::SelfService => "self_service",
        }
    }
}

/// A Custom App entry as returned by the tenant.
///
/// The tenant owns these records; the pipeline reads and mutates them via
/// the API but never caches them beyond a single run.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagedApp {
    pub id: String,
    pub name: String,
    pub install_enforcement: Enforcement,
    #[serde(default)]
    pub file_key: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub show_in_self_service: bool,
    #[serde(default)]
    pub self_service_category_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub file_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ManagedApp {
    /// Basename of the uploaded package, if any.
    pub fn pkg_name(&self) -> Option<&str> {
        self.file_key
            .as_deref()
            .map(|key| key.rsplit('/').next().unwrap_or(key))
    }

    /// Sort key for the "earliest last-modified wins" tie-break: package
    /// upload time first, then entry modification time. Missing timestamps
    /// sort last so an entry with real history is preferred.
    pub fn last_modified_key(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let max = DateTime::<Utc>::MAX_UTC;
        (
            self.file_updated.or(self.updated_at).unwrap_or(max),
            self.updated_at.unwrap_or(max),
        )
    }
}

/// A Self Service category.
#[derive(Debug, Clone, Deserialize)]
pub struct SelfServiceCategory {
    pub id: String,
    pub name: String,
}

/// Fields for a Custom App create call.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub name: String,
    pub file_key: String,
    pub enforcement: Enforcement,
    /// Audit script body, only for [`Enforcement::AuditEnforce`].
    pub audit_script: Option<String>,
    /// Category id, only for [`Enforcement::SelfService`].
    pub self_service_category_id: Option<String>,
}

/// Fields for a Custom App update call. Enforcement is deliberately absent:
/// the tenant's current setting is authoritative on update.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub file_key: String,
    pub audit_script: Option<String>,
}

/// Operations the pipeline needs from the device-management backend.
pub trait Backend {
    /// List all Custom Apps in the tenant.
    fn list_custom_apps(&self) -> Result<Vec<ManagedApp>>;

    /// List Self Service categories.
    fn list_self_service_categories(&self) -> Result<Vec<SelfServiceCategory>>;

    /// Upload a package and return the file key for create/update calls.
    fn upload_package(&self, pkg_path: &Path, pkg_name: &str) -> Result<String>;

    /// Create a new Custom App.
    fn create_custom_app(&self, req: &CreateRequest) -> Result<ManagedApp>;

    /// Update an existing Custom App in place.
    fn update_custom_app(&self, id: &str, req: &UpdateRequest) -> Result<ManagedApp>;

    /// Web console URL of a Custom App entry, for reports and notifications.
    fn console_url(&self, id: &str) -> String;
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    results: Vec<ManagedApp>,
}

#[derive(Debug, Deserialize)]
struct PresignedUpload {
    post_url: String,
    post_data: BTreeMap<String, String>,
    file_key: String,
}

/// Kandji REST client over a blocking HTTP agent.
pub struct KandjiClient {
    agent: ureq::Agent,
    api_base: String,
    token: String,
}

impl KandjiClient {
    /// Create a client for a tenant API base URL.
    #[must_use]
    pub fn new(api_url: &str, token: impl Into<String>) -> Self {
        // Non-2xx responses are handled explicitly so error bodies reach
        // the operator instead of being swallowed by the transport.
        let config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .build();
        Self {
            agent: config.into(),
            api_base: ensure_https(api_url),
            token: token.into(),
        }
    }

    /// Create a client with a custom API base (for testing).
    #[must_use]
    pub fn with_api_base(api_base: impl Into<String>, token: impl Into<String>) -> Self {
        let config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .build();
        Self {
            agent: config.into(),
            api_base: api_base.into(),
            token: token.into(),
        }
    }

    /// Get the current API base URL.
    #[must_use]
    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// Web console base for this tenant (the API subdomain stripped).
    #[must_use]
    pub fn tenant_url(&self) -> String {
        self.api_base.replacen(".api.", ".", 1)
    }

    fn custom_apps_url(&self) -> String {
        format!("{}/api/v1/library/custom-apps", self.api_base)
    }

    fn upload_url(&self) -> String {
        format!("{}/upload", self.custom_apps_url())
    }

    fn self_service_url(&self) -> String {
        format!("{}/api/v1/self-service/categories", self.api_base)
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }

    /// GET with bounded retry on transient network failures.
    fn get_json<T: serde::de::DeserializeOwned>(&self, operation: &str, url: &str) -> Result<T> {
        let mut attempt = 1;
        loop {
            let result = self
                .agent
                .get(url)
                .query("source", "kustom")
                .header("Authorization", &self.bearer())
                .call()
                .map_err(|e| Error::http(operation, e.to_string(), None))
                .and_then(|resp| read_response(operation, resp));

            match result {
                Err(err) if err.is_retryable() && attempt < READ_ATTEMPTS => {
                    log::warn!("{operation} failed (attempt {attempt}/{READ_ATTEMPTS}): {err}; retrying");
                    thread::sleep(RETRY_BACKOFF);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        operation: &str,
        url: &str,
        form: MultipartForm,
    ) -> Result<T> {
        let (content_type, body) = form.finish();
        let resp = self
            .agent
            .post(url)
            .query("source", "kustom")
            .header("Authorization", &self.bearer())
            .header("Content-Type", &content_type)
            .send(&body[..])
            .map_err(|e| Error::http(operation, e.to_string(), None))?;
        read_response(operation, resp)
    }

    fn patch_form<T: serde::de::DeserializeOwned>(
        &self,
        operation: &str,
        url: &str,
        form: MultipartForm,
    ) -> Result<T> {
        let (content_type, body) = form.finish();
        let resp = self
            .agent
            .patch(url)
            .query("source", "kustom")
            .header("Authorization", &self.bearer())
            .header("Content-Type", &content_type)
            .send(&body[..])
            .map_err(|e| Error::http(operation, e.to_string(), None))?;
        read_response(operation, resp)
    }

    fn fill_entry_form(form: &mut MultipartForm, audit_script: Option<&str>) {
        if let Some(script) = audit_script {
            form.text("audit_script", script);
        }
    }
}

impl Backend for KandjiClient {
    fn list_custom_apps(&self) -> Result<Vec<ManagedApp>> {
        let response: ListResponse = self.get_json("list custom apps", &self.custom_apps_url())?;
        Ok(response.results)
    }

    fn list_self_service_categories(&self) -> Result<Vec<SelfServiceCategory>> {
        self.get_json("list self service categories", &self.self_service_url())
    }

    fn upload_package(&self, pkg_path: &Path, pkg_name: &str) -> Result<String> {
        let mut form = MultipartForm::new();
        form.text("name", pkg_name);
        let presigned: PresignedUpload = self.post_form("presign upload", &self.upload_url(), form)?;

        let bytes = fs::read(pkg_path).map_err(|e| Error::io(pkg_path, e))?;
        log::info!("Uploading {pkg_name} ({} bytes)", bytes.len());

        let mut form = MultipartForm::new();
        for (field, value) in &presigned.post_data {
            form.text(field, value);
        }
        form.file("file", pkg_name, &bytes);
        let (content_type, body) = form.finish();

        // The presigned URL carries its own auth; no bearer header here.
        let mut resp = self
            .agent
            .post(&presigned.post_url)
            .header("Content-Type", &content_type)
            .send(&body[..])
            .map_err(|e| Error::http("upload package", e.to_string(), None))?;
        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let detail = resp.body_mut().read_to_string().unwrap_or_default();
            return Err(Error::http("upload package", detail, Some(status)));
        }

        // S3 needs a moment before the key is attachable to an entry.
        thread::sleep(UPLOAD_SETTLE);
        Ok(presigned.file_key)
    }

    fn create_custom_app(&self, req: &CreateRequest) -> Result<ManagedApp> {
        let mut form = MultipartForm::new();
        form.text("name", &req.name);
        form.text("file_key", &req.file_key);
        form.text("install_type", "package");
        form.text("install_enforcement", req.enforcement.wire_name());
        Self::fill_entry_form(&mut form, req.audit_script.as_deref());
        if req.enforcement == Enforcement::SelfService {
            form.text("show_in_self_service", "true");
            if let Some(category) = &req.self_service_category_id {
                form.text("self_service_category_id", category);
            }
        }
        self.post_form("create custom app", &self.custom_apps_url(), form)
    }

    fn update_custom_app(&self, id: &str, req: &UpdateRequest) -> Result<ManagedApp> {
        let mut form = MultipartForm::new();
        form.text("file_key", &req.file_key);
        Self::fill_entry_form(&mut form, req.audit_script.as_deref());
        let url = format!("{}/{id}", self.custom_apps_url());
        self.patch_form("update custom app", &url, form)
    }

    fn console_url(&self, id: &str) -> String {
        format!("{}/library/custom-apps/{id}", self.tenant_url())
    }
}

fn read_response<T: serde::de::DeserializeOwned>(
    operation: &str,
    mut resp: ureq::http::Response<ureq::Body>,
) -> Result<T> {
    let status = resp.status().as_u16();
    if (200..300).contains(&status) {
        resp.body_mut().read_json().map_err(|e| Error::InvalidResponse {
            operation: operation.to_string(),
            message: e.to_string(),
        })
    } else {
        let detail = resp.body_mut().read_to_string().unwrap_or_default();
        Err(Error::http(operation, detail, Some(status)))
    }
}

/// Force an https scheme onto a configured URL.
fn ensure_https(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("https://{rest}")
    } else if trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

// =============================================================================
// Multipart form encoding
// =============================================================================

/// Minimal multipart/form-data encoder.
///
/// The transport has no multipart support of its own; the tenant API and the
/// S3 presigned POST both take plain form fields plus at most one file part,
/// which this covers without pulling in a client swap.
pub struct MultipartForm {
    boundary: String,
    body: Vec<u8>,
}

impl MultipartForm {
    pub fn new() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        Self {
            boundary: format!("----kustom{:x}{nanos:x}", std::process::id()),
            body: Vec::new(),
        }
    }

    /// Append a text field.
    pub fn text(&mut self, name: &str, value: &str) {
        self.body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n",
                self.boundary
            )
            .as_bytes(),
        );
    }

    /// Append a file field.
    pub fn file(&mut self, name: &str, filename: &str, bytes: &[u8]) {
        self.body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n",
                self.boundary
            )
            .as_bytes(),
        );
        self.body.extend_from_slice(bytes);
        self.body.extend_from_slice(b"\r\n");
    }

    /// Close the form, returning the Content-Type header value and body.
    pub fn finish(mut self) -> (String, Vec<u8>) {
        self.body
            .extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        (
            format!("multipart/form-data; boundary={}", self.boundary),
            self.body,
        )
    }
}

impl Default for MultipartForm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let client = KandjiClient::with_api_base("https://accuhive.api.kandji.io", "tok");
        assert_eq!(
            client.custom_apps_url(),
            "https://accuhive.api.kandji.io/api/v1/library/custom-apps"
        );
        assert_eq!(
            client.upload_url(),
            "https://accuhive.api.kandji.io/api/v1/library/custom-apps/upload"
        );
        assert_eq!(
            client.self_service_url(),
            "https://accuhive.api.kandji.io/api/v1/self-service/categories"
        );
    }

    #[test]
    fn test_tenant_and_console_urls() {
        let client = KandjiClient::with_api_base("https://accuhive.api.kandji.io", "tok");
        assert_eq!(client.tenant_url(), "https://accuhive.kandji.io");
        assert_eq!(
            client.console_url("abc-123"),
            "https://accuhive.kandji.io/library/custom-apps/abc-123"
        );
    }

    #[test]
    fn test_ensure_https() {
        assert_eq!(ensure_https("http://x.api.kandji.io"), "https://x.api.kandji.io");
        assert_eq!(ensure_https("x.api.kandji.io/"), "https://x.api.kandji.io");
        assert_eq!(ensure_https("https://x.api.kandji.io"), "https://x.api.kandji.io");
    }

    #[test]
    fn test_enforcement_wire_round_trip() {
        let parsed: Enforcement = serde_json::from_str("\"continuously_enforce\"").unwrap();
        assert_eq!(parsed, Enforcement::AuditEnforce);
        assert_eq!(parsed.wire_name(), "continuously_enforce");
        assert_eq!(parsed.config_name(), "audit_enforce");

        let parsed: Enforcement = serde_json::from_str("\"no_enforcement\"").unwrap();
        assert_eq!(parsed, Enforcement::SelfService);
    }

    #[test]
    fn test_managed_app_pkg_name() {
        let app: ManagedApp = serde_json::from_str(
            r#"{
            "id": "1",
            "name": "Firefox (AutoPkg)",
            "install_enforcement": "install_once",
            "file_key": "companies/x/library/custom_apps/Firefox-120.0_ab12cd34.pkg"
        }"#,
        )
        .unwrap();
        assert_eq!(app.pkg_name(), Some("Firefox-120.0_ab12cd34.pkg"));
    }

    #[test]
    fn test_managed_app_timestamps_parse() {
        let app: ManagedApp = serde_json::from_str(
            r#"{
            "id": "1",
            "name": "Firefox",
            "install_enforcement": "continuously_enforce",
            "created_at": "2024-01-05T12:00:00.123456Z",
            "updated_at": "2024-02-01T00:00:00Z"
        }"#,
        )
        .unwrap();
        assert!(app.created_at.is_some());
        let (uploaded, modified) = app.last_modified_key();
        // No file_updated: falls back to updated_at for the first key.
        assert_eq!(uploaded, app.updated_at.unwrap());
        assert_eq!(modified, app.updated_at.unwrap());
    }

    #[test]
    fn test_multipart_encoding() {
        let mut form = MultipartForm::new();
        form.text("name", "Firefox.pkg");
        form.file("file", "Firefox.pkg", b"PKGDATA");
        let (content_type, body) = form.finish();

        let boundary = content_type
            .strip_prefix("multipart/form-data; boundary=")
            .unwrap()
            .to_string();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains(&format!("--{boundary}\r\n")));
        assert!(text.contains("name=\"name\"\r\n\r\nFirefox.pkg"));
        assert!(text.contains("filename=\"Firefox.pkg\""));
        assert!(text.contains("PKGDATA"));
        assert!(text.ends_with(&format!("--{boundary}--\r\n")));
    }
}
