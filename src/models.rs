use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicI64, Ordering};

use crate::config::{DEFAULT_PAGE, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linkedin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocialLink {
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyAnalysis {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub pain_points: Vec<String>,
    #[serde(default)]
    pub social_links: Vec<SocialLink>,
    #[serde(default)]
    pub matching_skills: Vec<String>,
    #[serde(default)]
    pub recommended_approach: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Canonical company record. Fields the server does not know about are kept
/// in `extra` and written back untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Company {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub website: String,
    #[serde(default)]
    pub status: String, // "NEW", then whatever the client moves it to
    #[serde(default)]
    pub contacts: Vec<Contact>,
    #[serde(default)]
    pub general_contact_email: String,
    #[serde(default)]
    pub analysis: Option<CompanyAnalysis>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Company data embedded in a job at ingestion time. Never re-synced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCompany {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub website: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_email: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAnalysis {
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub recommendation: String, // "CONTACT" or "SKIP"
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub pain_points: Vec<String>,
    #[serde(default)]
    pub matching_skills: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    #[serde(default)]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub company: Option<JobCompany>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub analysis: Option<JobAnalysis>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Job {
    pub fn company_name(&self) -> &str {
        self.company.as_ref().map(|c| c.name.as_str()).unwrap_or("")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EmailProvider {
    Gmail,
    Custom,
}

impl EmailProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailProvider::Gmail => "GMAIL",
            EmailProvider::Custom => "CUSTOM",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SendStatus {
    Sent,
    Failed,
}

impl SendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendStatus::Sent => "SENT",
            SendStatus::Failed => "FAILED",
        }
    }
}

/// One outbound email attempt. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailLog {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub job_id: String,
    #[serde(default)]
    pub job_title: String,
    #[serde(default)]
    pub recipient: String,
    #[serde(default)]
    pub subject: String,
    pub provider: EmailProvider,
    pub status: SendStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub total_pages: i64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: i64, page: i64, limit: i64) -> Self {
        let total_pages = if limit > 0 { total.saturating_add(limit - 1) / limit } else { 0 };
        Self {
            items,
            total,
            page,
            total_pages,
        }
    }
}

/// Query string accepted by every list endpoint. Values stay raw strings so a
/// bad number falls back to the default instead of rejecting the request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub page: Option<String>,
    pub limit: Option<String>,
    pub search: Option<String>,
    pub status: Option<String>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
    pub days: Option<String>,
    pub provider: Option<String>,
}

fn positive(raw: Option<&str>) -> Option<i64> {
    raw.and_then(|s| s.trim().parse::<i64>().ok()).filter(|n| *n > 0)
}

fn filter_value(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("ALL"))
}

impl ListQuery {
    pub fn page(&self) -> i64 {
        positive(self.page.as_deref()).unwrap_or(DEFAULT_PAGE)
    }

    pub fn limit(&self) -> i64 {
        positive(self.limit.as_deref())
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .min(MAX_PAGE_SIZE)
    }

    pub fn offset(&self) -> i64 {
        (self.page() - 1).saturating_mul(self.limit())
    }

    pub fn search(&self) -> Option<&str> {
        self.search.as_deref().filter(|s| !s.is_empty())
    }

    pub fn status(&self) -> Option<&str> {
        filter_value(self.status.as_deref())
    }

    pub fn provider(&self) -> Option<&str> {
        filter_value(self.provider.as_deref())
    }

    pub fn days(&self) -> Option<i64> {
        filter_value(self.days.as_deref()).and_then(|d| d.parse::<i64>().ok())
    }

    pub fn ascending(&self) -> bool {
        self.sort_order.as_deref() == Some("asc")
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

static LAST_TOKEN: AtomicI64 = AtomicI64::new(0);

/// Time-based id: the current epoch millis, bumped past the previous token so
/// two ids minted in the same millisecond never collide.
pub fn time_token() -> String {
    let now = now_millis();
    let prev = LAST_TOKEN
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(if now > last { now } else { last + 1 })
        })
        .unwrap_or(now);
    (if now > prev { now } else { prev + 1 }).to_string()
}

/// Overlay the top-level fields of `patch` onto `base`, like a document
/// store's `$set`. `_id` is never copied.
pub fn merge_fields(base: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (key, value) in patch {
        if key == "_id" {
            continue;
        }
        base.insert(key, value);
    }
}
