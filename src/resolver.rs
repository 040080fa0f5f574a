//! Company identity resolution
//!
//! Decides whether a company reference (from a job posting or a direct
//! create) names a company that is already stored. Lookup goes by normalized
//! website first, then by case-insensitive exact name. The website lookup is
//! an unanchored substring match against the stored value, so `acme.com`
//! also matches a stored `sub.acme.com` or `acme.com.uk`.
//!
//! Callers hold the store lock across [`find_existing`] and the insert that
//! follows it.

use rusqlite::{Connection, OptionalExtension};

use crate::config::{STATUS_NEW, SYNC_ID_SUFFIX, UNKNOWN_COMPANY_NAME};
use crate::db::{contains_pattern, decode_doc, exact_pattern, insert_company};
use crate::error::Result;
use crate::models::{Company, Contact, JobCompany, now_millis, time_token};

/// Where a company reference came from. Job ingestion tags new ids so they
/// cannot collide with ids minted by direct creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Direct,
    JobSync,
}

#[derive(Debug, Clone, Default)]
pub struct CompanyCandidate {
    pub name: Option<String>,
    pub website: Option<String>,
    pub contact_name: Option<String>,
    pub contact_email: Option<String>,
}

impl From<&JobCompany> for CompanyCandidate {
    fn from(company: &JobCompany) -> Self {
        Self {
            name: Some(company.name.clone()),
            website: Some(company.website.clone()),
            contact_name: company.contact_name.clone(),
            contact_email: company.contact_email.clone(),
        }
    }
}

impl From<&Company> for CompanyCandidate {
    fn from(company: &Company) -> Self {
        Self {
            name: Some(company.name.clone()),
            website: Some(company.website.clone()),
            contact_name: None,
            contact_email: None,
        }
    }
}

impl CompanyCandidate {
    pub fn trimmed_name(&self) -> &str {
        self.name.as_deref().map(str::trim).unwrap_or("")
    }

    pub fn trimmed_website(&self) -> &str {
        self.website.as_deref().map(str::trim).unwrap_or("")
    }

    pub fn normalized_website(&self) -> String {
        normalize_website(self.website.as_deref())
    }

    /// Build the record stored when nothing matches.
    pub fn to_company(&self, origin: Origin) -> Company {
        let id = mint_id(origin);

        let name = match self.trimmed_name() {
            "" => UNKNOWN_COMPANY_NAME.to_string(),
            name => name.to_string(),
        };

        let contact_email = self.contact_email.clone().unwrap_or_default();
        let contacts = match (&self.contact_name, &self.contact_email) {
            (Some(name), Some(email)) if !name.is_empty() && !email.is_empty() => vec![Contact {
                name: name.clone(),
                email: email.clone(),
                role: "Unknown".to_string(),
                linkedin: None,
            }],
            _ => Vec::new(),
        };

        Company {
            id,
            name,
            website: self.trimmed_website().to_string(),
            status: STATUS_NEW.to_string(),
            contacts,
            general_contact_email: contact_email,
            analysis: None,
            created_at: now_millis(),
            extra: Default::default(),
        }
    }
}

/// Fresh company id. Ids minted by job ingestion carry a `-sync` suffix.
pub fn mint_id(origin: Origin) -> String {
    let mut id = time_token();
    if origin == Origin::JobSync {
        id.push_str(SYNC_ID_SUFFIX);
    }
    id
}

/// Outcome of [`resolve`]: the matched record, or the one just inserted.
#[derive(Debug, Clone)]
pub enum Resolution {
    Existing(Company),
    Created(Company),
}

impl Resolution {
    pub fn company(&self) -> &Company {
        match self {
            Resolution::Existing(c) | Resolution::Created(c) => c,
        }
    }

    pub fn into_company(self) -> Company {
        match self {
            Resolution::Existing(c) | Resolution::Created(c) => c,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Resolution::Created(_))
    }
}

/// Reduce a URL to its bare lowercase host: drop the scheme, a leading
/// `www.`, and everything from the first `/`, `?` or `#`.
///
/// `"https://www.Acme.com/careers?x=1"` becomes `"acme.com"`.
pub fn normalize_website(url: Option<&str>) -> String {
    let Some(url) = url else {
        return String::new();
    };
    let lower = url.trim().to_lowercase();
    let rest = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"))
        .unwrap_or(&lower);
    let rest = rest.strip_prefix("www.").unwrap_or(rest);
    let end = rest
        .find(|c: char| matches!(c, '/' | '?' | '#'))
        .unwrap_or(rest.len());
    rest[..end].to_string()
}

/// First stored company (insertion order) matching the candidate by website,
/// then by name. Never fails on bad input; an empty candidate matches nothing.
pub fn find_existing(conn: &Connection, candidate: &CompanyCandidate) -> Result<Option<Company>> {
    let website = candidate.normalized_website();
    if !website.is_empty() {
        let found: Option<String> = conn
            .query_row(
                "SELECT doc FROM companies WHERE website REGEXP ?1 ORDER BY rowid LIMIT 1",
                [contains_pattern(&website)],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(doc) = found {
            return Ok(Some(decode_doc(&doc)?));
        }
    }

    let name = candidate.trimmed_name();
    if !name.is_empty() {
        let found: Option<String> = conn
            .query_row(
                "SELECT doc FROM companies WHERE name REGEXP ?1 ORDER BY rowid LIMIT 1",
                [exact_pattern(name)],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(doc) = found {
            return Ok(Some(decode_doc(&doc)?));
        }
    }

    Ok(None)
}

/// Return the stored company the candidate refers to, creating it when no
/// record matches. Creates at most one record per call.
pub fn resolve(conn: &Connection, candidate: &CompanyCandidate, origin: Origin) -> Result<Resolution> {
    if let Some(existing) = find_existing(conn, candidate)? {
        tracing::debug!(id = %existing.id, name = %existing.name, "company already known");
        return Ok(Resolution::Existing(existing));
    }

    let company = candidate.to_company(origin);
    tracing::info!(
        id = %company.id,
        name = %company.name,
        website = %company.website,
        "auto-creating company"
    );
    insert_company(conn, &company)?;
    Ok(Resolution::Created(company))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn candidate(name: Option<&str>, website: Option<&str>) -> CompanyCandidate {
        CompanyCandidate {
            name: name.map(String::from),
            website: website.map(String::from),
            ..Default::default()
        }
    }

    fn resolve_in(db: &Database, c: &CompanyCandidate) -> Resolution {
        db.with_conn(|conn| resolve(conn, c, Origin::JobSync)).unwrap()
    }

    fn company_count(db: &Database) -> i64 {
        db.list_companies(&Default::default()).unwrap().total
    }

    #[test]
    fn test_normalize_website() {
        assert_eq!(normalize_website(Some("https://www.Acme.com/careers?x=1")), "acme.com");
        assert_eq!(normalize_website(Some("http://acme.com")), "acme.com");
        assert_eq!(normalize_website(Some("WWW.ACME.COM")), "acme.com");
        assert_eq!(normalize_website(Some("acme.com/jobs/123")), "acme.com");
        assert_eq!(normalize_website(Some("https://acme.com?ref=feed")), "acme.com");
        assert_eq!(normalize_website(Some("  https://acme.io/  ")), "acme.io");
        assert_eq!(normalize_website(Some("")), "");
        assert_eq!(normalize_website(None), "");
    }

    #[test]
    fn test_normalize_website_strips_one_prefix_only() {
        assert_eq!(normalize_website(Some("https://www.www.acme.com")), "www.acme.com");
        assert_eq!(normalize_website(Some("ftp://acme.com")), "ftp:");
    }

    #[test]
    fn test_equal_normalized_websites_resolve_to_same_record() {
        let db = Database::open_in_memory().unwrap();
        let first = resolve_in(&db, &candidate(Some("Acme"), Some("https://acme.com")));
        assert!(first.is_created());

        for website in ["http://www.acme.com/jobs", "ACME.COM", "https://acme.com/about?x=1"] {
            let again = resolve_in(&db, &candidate(Some("Another Name"), Some(website)));
            assert!(!again.is_created(), "{website} should match");
            assert_eq!(again.company().id, first.company().id);
        }
        assert_eq!(company_count(&db), 1);
    }

    #[test]
    fn test_name_match_is_case_insensitive_and_exact() {
        let db = Database::open_in_memory().unwrap();
        let first = resolve_in(&db, &candidate(Some("Acme Corp"), None));

        let same = resolve_in(&db, &candidate(Some("  aCME corp "), None));
        assert_eq!(same.company().id, first.company().id);
        assert!(!same.is_created());

        // Name match is anchored, unlike the website match.
        let other = resolve_in(&db, &candidate(Some("Acme"), None));
        assert!(other.is_created());
        assert_eq!(company_count(&db), 2);
    }

    #[test]
    fn test_name_is_checked_when_website_misses() {
        let db = Database::open_in_memory().unwrap();
        let first = resolve_in(&db, &candidate(Some("Globex"), Some("globex.com")));
        let same = resolve_in(&db, &candidate(Some("GLOBEX"), Some("https://globex.io")));
        assert_eq!(same.company().id, first.company().id);
    }

    #[test]
    fn test_no_match_creates_new_company() {
        let db = Database::open_in_memory().unwrap();
        let c = CompanyCandidate {
            name: Some(" Initech ".to_string()),
            website: Some(" https://initech.com ".to_string()),
            contact_name: Some("Bill".to_string()),
            contact_email: Some("bill@initech.com".to_string()),
        };
        let created = resolve_in(&db, &c);
        assert!(created.is_created());

        let company = created.company();
        assert_eq!(company.name, "Initech");
        assert_eq!(company.website, "https://initech.com");
        assert_eq!(company.status, "NEW");
        assert!(company.analysis.is_none());
        assert!(company.id.ends_with("-sync"));
        assert_eq!(company.general_contact_email, "bill@initech.com");
        assert_eq!(company.contacts.len(), 1);
        assert_eq!(company.contacts[0].role, "Unknown");

        let stored = db.get_company(&company.id).unwrap().unwrap();
        assert_eq!(stored.name, "Initech");
        assert_eq!(company_count(&db), 1);
    }

    #[test]
    fn test_contact_needs_both_name_and_email() {
        let c = CompanyCandidate {
            name: Some("Hooli".to_string()),
            contact_email: Some("hi@hooli.com".to_string()),
            ..Default::default()
        };
        let company = c.to_company(Origin::Direct);
        assert!(company.contacts.is_empty());
        assert_eq!(company.general_contact_email, "hi@hooli.com");
        assert!(!company.id.ends_with("-sync"));
    }

    #[test]
    fn test_empty_candidate_becomes_unknown() {
        let db = Database::open_in_memory().unwrap();
        let created = resolve_in(&db, &candidate(None, None));
        assert!(created.is_created());
        assert_eq!(created.company().name, "Unknown");
        assert_eq!(created.company().website, "");

        // Blank candidates are never looked up, so each one creates a record.
        let blank = resolve_in(&db, &candidate(Some("   "), Some("")));
        assert!(blank.is_created());
    }

    #[test]
    fn test_substring_website_match_is_preserved() {
        let db = Database::open_in_memory().unwrap();
        let sub = resolve_in(&db, &candidate(Some("Sub Acme"), Some("https://sub.acme.com")));

        let found = resolve_in(&db, &candidate(Some("Acme"), Some("acme.com")));
        assert!(!found.is_created());
        assert_eq!(found.company().id, sub.company().id);
    }

    #[test]
    fn test_website_pattern_is_escaped() {
        let db = Database::open_in_memory().unwrap();
        resolve_in(&db, &candidate(Some("Acme"), Some("acmeXcom.net")));

        // The dot must not act as a wildcard.
        let other = resolve_in(&db, &candidate(Some("Acme Two"), Some("acme.com")));
        assert!(other.is_created());
    }

    #[test]
    fn test_find_existing_does_not_write() {
        let db = Database::open_in_memory().unwrap();
        let found = db
            .with_conn(|conn| find_existing(conn, &candidate(Some("Nobody"), Some("nobody.dev"))))
            .unwrap();
        assert!(found.is_none());
        assert_eq!(company_count(&db), 0);
    }
}
