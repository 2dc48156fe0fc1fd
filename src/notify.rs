//! Slack notifications for pipeline outcomes.
//!
//! Successes, unresolved duplicate conflicts, and fatal failures get posted
//! to a webhook when Slack is enabled in config; everything degrades to a
//! no-op otherwise. Notification failures are logged, never fatal.

use chrono::{DateTime, Utc};
use serde_json::json;

/// Severity → attachment color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Success,
    Error,
}

impl Severity {
    fn color(&self) -> &'static str {
        match self {
            Self::Success => "00FF00",
            Self::Error => "FF0000",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
        }
    }
}

/// One duplicate entry in a conflict report.
#[derive(Debug, Clone)]
pub struct DuplicateEntry {
    pub name: String,
    pub pkg_name: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_modified: Option<DateTime<Utc>>,
    pub console_url: String,
}

/// Events the pipeline reports.
#[derive(Debug, Clone)]
pub enum Event {
    /// A Custom App was created or updated.
    Mutated {
        action: &'static str,
        name: String,
        id: String,
        pkg_name: String,
        enforcement: &'static str,
        console_url: String,
    },
    /// Duplicates blocked resolution; nothing was mutated.
    DuplicateConflict {
        name: String,
        duplicates: Vec<DuplicateEntry>,
    },
    /// A fatal pipeline error.
    Failure { name: String, detail: String },
}

/// Receiver for pipeline events.
pub trait Notifier {
    fn notify(&self, event: &Event);
}

/// Notifier that drops everything (Slack disabled or webhook unresolved).
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _event: &Event) {}
}

/// Posts events to a Slack incoming webhook.
pub struct SlackNotifier {
    agent: ureq::Agent,
    webhook_url: String,
}

impl SlackNotifier {
    #[must_use]
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            agent: ureq::Agent::new_with_defaults(),
            webhook_url: webhook_url.into(),
        }
    }

    fn post(&self, payload: serde_json::Value) {
        match self.agent.post(&self.webhook_url).send_json(&payload) {
            Ok(_) => log::debug!("Posted notification to Slack"),
            Err(err) => log::warn!("Failed to post to Slack: {err}"),
        }
    }
}

impl Notifier for SlackNotifier {
    fn notify(&self, event: &Event) {
        let payload = render_payload(event);
        self.post(payload);
    }
}

/// Build the webhook payload for an event.
fn render_payload(event: &Event) -> serde_json::Value {
    let (severity, title, text, link) = match event {
        Event::Mutated {
            action,
            name,
            id,
            pkg_name,
            enforcement,
            console_url,
        } => (
            Severity::Success,
            format!("Custom App {action}d"),
            format!(
                "*Name*: `{name}`\n*ID*: `{id}`\n*PKG*: `{pkg_name}`\n*Enforcement*: `{enforcement}`"
            ),
            Some(console_url.clone()),
        ),
        Event::DuplicateConflict { name, duplicates } => {
            let mut body = String::new();
            for dup in duplicates {
                let created = dup
                    .created_at
                    .map(|ts| ts.format("%m/%d/%Y @ %I:%M %p").to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                let modified = dup
                    .last_modified
                    .map(|ts| ts.format("%m/%d/%Y @ %I:%M %p").to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                let pkg = dup.pkg_name.as_deref().unwrap_or("none");
                body.push_str(&format!(
                    "*<{}|Custom App created {created}>*\n*PKG*: `{pkg}` (modified {modified})\n\n",
                    dup.console_url
                ));
            }
            (
                Severity::Error,
                format!("Found duplicates of Custom App {name}"),
                body,
                None,
            )
        }
        Event::Failure { name, detail } => (
            Severity::Error,
            format!("Custom App pipeline failed for {name}"),
            detail.clone(),
            None,
        ),
    };

    let mut attachment = json!({
        "color": severity.color(),
        "title": format!("{}: {title}", severity.label()),
        "text": text,
    });
    if let Some(url) = link {
        attachment["title_link"] = json!(url);
    }
    json!({ "attachments": [attachment] })
}
