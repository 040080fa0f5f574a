//! Runtime configuration
//!
//! Server options come from CLI flags with environment fallbacks. The
//! constants below are the fixed defaults shared by the store, the API and
//! the outbound integrations.

use clap::Args;

/// Page number used when the client omits or mangles `page`.
pub const DEFAULT_PAGE: i64 = 1;
/// Page size used when the client omits or mangles `limit`.
pub const DEFAULT_PAGE_SIZE: i64 = 10;
/// Largest `limit` a list request is served with.
pub const MAX_PAGE_SIZE: i64 = 100;

/// Fixed document id of the one settings record.
pub const GLOBAL_SETTINGS_ID: &str = "global";

/// Lifecycle tag given to new jobs and companies.
pub const STATUS_NEW: &str = "NEW";

/// Placeholder name for companies created without one.
pub const UNKNOWN_COMPANY_NAME: &str = "Unknown";

/// Suffix appended to ids of companies created by job ingestion.
pub const SYNC_ID_SUFFIX: &str = "-sync";

/// Seeded administrator account.
pub const ADMIN_SEED_ID: &str = "admin-seed";
pub const ADMIN_USERNAME: &str = "admin";
pub const ADMIN_ROLE: &str = "ADMIN";

/// Session tokens expire after this many hours.
pub const SESSION_TTL_HOURS: i64 = 24;

/// Job descriptions are cut to this many characters before analysis.
pub const ANALYSIS_DESCRIPTION_CHARS: usize = 1500;
/// Job descriptions are cut to this many characters in email drafts.
pub const EMAIL_DESCRIPTION_CHARS: usize = 500;

/// Options for `outreach serve`.
#[derive(Args, Debug, Clone)]
pub struct ServeConfig {
    /// Address to bind the HTTP server to (host:port)
    #[arg(long, env = "OUTREACH_BIND", default_value = "127.0.0.1:3000")]
    pub bind: String,

    /// Secret used to sign session tokens
    #[arg(long, env = "JWT_SECRET", default_value = "dev-secret", hide_env_values = true)]
    pub jwt_secret: String,

    /// AI model (gemini-flash, gemini-pro, api-sonnet, api-haiku, gpt-4o)
    #[arg(long, env = "OUTREACH_MODEL", default_value = "gemini-flash")]
    pub model: String,

    /// Password given to the seeded admin account when it is first created
    #[arg(long, env = "OUTREACH_ADMIN_PASSWORD", default_value = "admin", hide_env_values = true)]
    pub admin_password: String,
}
