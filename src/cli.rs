use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "kustom")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Publish installers to Kandji Custom Apps and audit enforcement", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Publish a built installer package to the tenant
    Push(PushArgs),

    /// Run the on-device enforcement audit (exit 0 = compliant)
    Audit(AuditArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Push
// ============================================================================

#[derive(Parser)]
pub struct PushArgs {
    /// Recipe name, used to resolve Custom App names
    #[arg(long)]
    pub name: String,

    /// Path of the built PKG to upload
    #[arg(long)]
    pub pkg: PathBuf,

    /// Name of the .app in the payload (for the audit script)
    #[arg(long)]
    pub app_name: Option<String>,

    /// Bundle ID of the .app in the payload (used if no app name)
    #[arg(long)]
    pub bundle_id: Option<String>,

    /// Version of the .app in the payload (for the audit script)
    #[arg(long)]
    pub version: Option<String>,

    /// Production Custom App name, overriding mapping and template
    #[arg(long)]
    pub prod_name: Option<String>,

    /// Test Custom App name, overriding the mapping
    #[arg(long)]
    pub test_name: Option<String>,

    /// Self Service category for the production entry
    #[arg(long)]
    pub ss_category: Option<String>,

    /// Self Service category for the test entry
    #[arg(long)]
    pub test_category: Option<String>,

    /// Create a new Custom App without resolving an update target
    #[arg(long)]
    pub create_new: bool,

    /// Report decisions without mutating the tenant
    #[arg(long)]
    pub dry_run: bool,

    /// Config file path (defaults to config.json in the config dir)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

// ============================================================================
// Audit
// ============================================================================

#[derive(Parser)]
pub struct AuditArgs {
    /// Name of the .app bundle to look for in /Applications
    #[arg(long)]
    pub app_name: Option<String>,

    /// Bundle identifier to locate the app by when the name is unknown
    #[arg(long)]
    pub bundle_id: Option<String>,

    /// Package receipt identifier for payload-free installs
    #[arg(long)]
    pub pkg_id: Option<String>,

    /// Minimum version that satisfies the audit
    #[arg(long)]
    pub required_version: String,

    /// Enforcement due date, epoch seconds
    #[arg(long)]
    pub due: i64,

    /// Process name checked before prompting (defaults to the app name stem)
    #[arg(long)]
    pub process_name: Option<String>,
}
