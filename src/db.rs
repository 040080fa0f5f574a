use regex::Regex;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::{GLOBAL_SETTINGS_ID, STATUS_NEW, UNKNOWN_COMPANY_NAME};
use crate::error::{AppError, Result};
use crate::models::{
    Company, EmailLog, Job, ListQuery, Page, User, merge_fields, now_millis, time_token,
};
use crate::resolver::{self, CompanyCandidate, Origin, Resolution};

const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Document store over a single SQLite connection. Each collection keeps the
/// full JSON document plus the columns it is filtered and sorted on.
pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Database {
    pub fn open(path: Option<PathBuf>) -> Result<Self> {
        let path = match path {
            Some(p) => p,
            None => Self::default_path(),
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        Self::with_connection(conn, Some(path))
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let db = Self::with_connection(Connection::open_in_memory()?, None)?;
        db.init()?;
        Ok(db)
    }

    fn with_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        register_regexp(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn default_path() -> PathBuf {
        // Use XDG data directory or fallback
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "outreach") {
            proj_dirs.data_dir().join("outreach.db")
        } else {
            PathBuf::from("outreach.db")
        }
    }

    pub fn init(&self) -> Result<()> {
        self.lock().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                company_name TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                doc TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS companies (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                website TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                doc TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS logs (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL DEFAULT '',
                job_title TEXT NOT NULL DEFAULT '',
                recipient TEXT NOT NULL DEFAULT '',
                subject TEXT NOT NULL DEFAULT '',
                provider TEXT NOT NULL CHECK (provider IN ('GMAIL', 'CUSTOM')),
                status TEXT NOT NULL CHECK (status IN ('SENT', 'FAILED')),
                timestamp INTEGER NOT NULL,
                doc TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                role TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS settings (
                id TEXT PRIMARY KEY,
                doc TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs(created_at);
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_companies_created ON companies(created_at);
            CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_logs_job ON logs(job_id);
            "#,
        )?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let tables: i64 = self.lock().query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='companies'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(AppError::Internal(
                "Database not initialized. Run 'outreach init' first.".to_string(),
            ));
        }
        Ok(())
    }

    /// Takes over a poisoned lock. A transaction interrupted by the panic
    /// has already rolled back when its guard dropped.
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("recovering database lock after a panic");
            poisoned.into_inner()
        })
    }

    /// Run `f` with the connection held for its whole duration.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock();
        f(&conn)
    }

    // --- Job operations ---

    /// Store a job, then make sure its company exists in `companies`.
    pub fn create_job(&self, mut job: Job) -> Result<Job> {
        if job.title.trim().is_empty() {
            return Err(AppError::BadRequest("Missing fields: title".to_string()));
        }
        if job.id.is_empty() {
            job.id = time_token();
        }
        if job.status.is_empty() {
            job.status = STATUS_NEW.to_string();
        }
        if job.created_at == 0 {
            job.created_at = now_millis();
        }

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        insert_job(&tx, &job)?;

        if let Some(company) = &job.company {
            if !company.name.is_empty() || !company.website.is_empty() {
                resolver::resolve(&tx, &CompanyCandidate::from(company), Origin::JobSync)?;
            }
        }

        tx.commit()?;
        tracing::debug!(id = %job.id, title = %job.title, "created job");
        Ok(job)
    }

    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        get_doc(&*self.lock(), "jobs", id)
    }

    /// Apply `patch` to the stored job. Returns `None` when no job has `id`.
    pub fn update_job(&self, id: &str, patch: Map<String, Value>) -> Result<Option<Job>> {
        let conn = self.lock();
        let Some(mut doc) = get_raw_doc(&conn, "jobs", id)? else {
            return Ok(None);
        };
        merge_fields(&mut doc, patch);
        doc.insert("id".to_string(), Value::String(id.to_string()));
        let job: Job = serde_json::from_value(Value::Object(doc))
            .map_err(|e| AppError::BadRequest(format!("Invalid job: {e}")))?;

        conn.execute(
            "UPDATE jobs SET title = ?1, company_name = ?2, status = ?3, created_at = ?4, doc = ?5
             WHERE id = ?6",
            params![
                job.title,
                job.company_name(),
                job.status,
                job.created_at,
                serde_json::to_string(&job)?,
                id
            ],
        )?;
        Ok(Some(job))
    }

    pub fn delete_job(&self, id: &str) -> Result<()> {
        self.lock().execute("DELETE FROM jobs WHERE id = ?1", [id])?;
        tracing::debug!(%id, "deleted job");
        Ok(())
    }

    pub fn list_jobs(&self, query: &ListQuery) -> Result<Page<Job>> {
        let mut filter = Filter::default();
        if let Some(search) = query.search() {
            let pattern = contains_pattern(search);
            filter.push(
                "(title REGEXP ? OR company_name REGEXP ?)",
                [pattern.clone().into(), pattern.into()],
            );
        }
        if let Some(status) = query.status() {
            filter.push("status = ?", [status.to_string().into()]);
        }
        if let Some(days) = query.days() {
            let cutoff = now_millis().saturating_sub(days.saturating_mul(DAY_MILLIS));
            filter.push("created_at >= ?", [cutoff.into()]);
        }

        let column = match query.sort_by.as_deref() {
            Some("title") => "title",
            Some("status") => "status",
            Some("company.name") | Some("companyName") => "company_name",
            _ => "created_at",
        };
        list_docs(&*self.lock(), "jobs", &filter, column, query.ascending(), query)
    }

    // --- Company operations ---

    /// Create a company unless the store already has one with the same
    /// identity, in which case that record is returned untouched.
    pub fn create_company(&self, mut company: Company) -> Result<Resolution> {
        let conn = self.lock();
        let candidate = CompanyCandidate::from(&company);
        if let Some(existing) = resolver::find_existing(&conn, &candidate)? {
            return Ok(Resolution::Existing(existing));
        }

        if company.id.is_empty() {
            company.id = resolver::mint_id(Origin::Direct);
        }
        if company.name.trim().is_empty() {
            company.name = UNKNOWN_COMPANY_NAME.to_string();
        }
        if company.status.is_empty() {
            company.status = STATUS_NEW.to_string();
        }
        if company.created_at == 0 {
            company.created_at = now_millis();
        }
        insert_company(&conn, &company)?;
        tracing::debug!(id = %company.id, name = %company.name, "created company");
        Ok(Resolution::Created(company))
    }

    pub fn get_company(&self, id: &str) -> Result<Option<Company>> {
        get_doc(&*self.lock(), "companies", id)
    }

    /// Apply `patch` to the stored company. Returns `None` when no company
    /// has `id`.
    pub fn update_company(&self, id: &str, patch: Map<String, Value>) -> Result<Option<Company>> {
        let conn = self.lock();
        let Some(mut doc) = get_raw_doc(&conn, "companies", id)? else {
            return Ok(None);
        };
        merge_fields(&mut doc, patch);
        doc.insert("id".to_string(), Value::String(id.to_string()));
        let company: Company = serde_json::from_value(Value::Object(doc))
            .map_err(|e| AppError::BadRequest(format!("Invalid company: {e}")))?;

        conn.execute(
            "UPDATE companies SET name = ?1, website = ?2, status = ?3, created_at = ?4, doc = ?5
             WHERE id = ?6",
            params![
                company.name,
                company.website,
                company.status,
                company.created_at,
                serde_json::to_string(&company)?,
                id
            ],
        )?;
        Ok(Some(company))
    }

    pub fn delete_company(&self, id: &str) -> Result<()> {
        self.lock().execute("DELETE FROM companies WHERE id = ?1", [id])?;
        tracing::debug!(%id, "deleted company");
        Ok(())
    }

    pub fn list_companies(&self, query: &ListQuery) -> Result<Page<Company>> {
        let mut filter = Filter::default();
        if let Some(search) = query.search() {
            let pattern = contains_pattern(search);
            filter.push(
                "(name REGEXP ? OR website REGEXP ?)",
                [pattern.clone().into(), pattern.into()],
            );
        }
        if let Some(status) = query.status() {
            filter.push("status = ?", [status.to_string().into()]);
        }

        let column = match query.sort_by.as_deref() {
            Some("name") => "name",
            Some("website") => "website",
            Some("status") => "status",
            _ => "created_at",
        };
        list_docs(&*self.lock(), "companies", &filter, column, query.ascending(), query)
    }

    // --- Log operations ---

    pub fn append_log(&self, mut log: EmailLog) -> Result<EmailLog> {
        if log.id.is_empty() {
            log.id = time_token();
        }
        if log.timestamp == 0 {
            log.timestamp = now_millis();
        }
        self.lock().execute(
            "INSERT INTO logs (id, job_id, job_title, recipient, subject, provider, status, timestamp, doc)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                log.id,
                log.job_id,
                log.job_title,
                log.recipient,
                log.subject,
                log.provider.as_str(),
                log.status.as_str(),
                log.timestamp,
                serde_json::to_string(&log)?
            ],
        )?;
        Ok(log)
    }

    /// Logs newest first. `sortBy`/`sortOrder` are ignored.
    pub fn list_logs(&self, query: &ListQuery) -> Result<Page<EmailLog>> {
        let mut filter = Filter::default();
        if let Some(search) = query.search() {
            let pattern = contains_pattern(search);
            filter.push(
                "(recipient REGEXP ? OR subject REGEXP ? OR job_title REGEXP ?)",
                [pattern.clone().into(), pattern.clone().into(), pattern.into()],
            );
        }
        if let Some(status) = query.status() {
            filter.push("status = ?", [status.to_string().into()]);
        }
        if let Some(provider) = query.provider() {
            filter.push("provider = ?", [provider.to_string().into()]);
        }
        list_docs(&*self.lock(), "logs", &filter, "timestamp", false, query)
    }

    // --- User operations ---

    pub fn insert_user(&self, user: &User) -> Result<()> {
        let conn = self.lock();
        let taken: Option<String> = conn
            .query_row(
                "SELECT id FROM users WHERE username = ?1",
                [&user.username],
                |row| row.get(0),
            )
            .optional()?;
        if taken.is_some() {
            return Err(AppError::BadRequest("Username already exists".to_string()));
        }

        conn.execute(
            "INSERT INTO users (id, username, password_hash, role, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user.id, user.username, user.password_hash, user.role, user.created_at],
        )?;
        tracing::debug!(id = %user.id, username = %user.username, "created user");
        Ok(())
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, username, password_hash, role, created_at FROM users ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], Self::row_to_user)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_user(&self, id: &str) -> Result<Option<User>> {
        let user = self
            .lock()
            .query_row(
                "SELECT id, username, password_hash, role, created_at FROM users WHERE id = ?1",
                [id],
                Self::row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    pub fn find_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let user = self
            .lock()
            .query_row(
                "SELECT id, username, password_hash, role, created_at FROM users WHERE username = ?1",
                [username],
                Self::row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    pub fn delete_user(&self, id: &str) -> Result<()> {
        self.lock().execute("DELETE FROM users WHERE id = ?1", [id])?;
        tracing::debug!(%id, "deleted user");
        Ok(())
    }

    fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
        Ok(User {
            id: row.get(0)?,
            username: row.get(1)?,
            password_hash: row.get(2)?,
            role: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    // --- Settings ---

    /// The global settings document without its `id`, or `None` if it was
    /// never saved.
    pub fn get_settings(&self) -> Result<Option<Map<String, Value>>> {
        let conn = self.lock();
        let Some(mut doc) = get_raw_doc(&conn, "settings", GLOBAL_SETTINGS_ID)? else {
            return Ok(None);
        };
        doc.remove("id");
        doc.remove("_id");
        Ok(Some(doc))
    }

    /// Set the given top-level fields on the global settings document,
    /// creating it if needed.
    pub fn upsert_settings(&self, patch: Map<String, Value>) -> Result<()> {
        let conn = self.lock();
        let mut doc = get_raw_doc(&conn, "settings", GLOBAL_SETTINGS_ID)?.unwrap_or_default();
        merge_fields(&mut doc, patch);
        let now = now_millis();
        doc.insert("id".to_string(), Value::String(GLOBAL_SETTINGS_ID.to_string()));
        doc.insert("updatedAt".to_string(), Value::from(now));

        conn.execute(
            "INSERT INTO settings (id, doc, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET doc = excluded.doc, updated_at = excluded.updated_at",
            params![GLOBAL_SETTINGS_ID, serde_json::to_string(&doc)?, now],
        )?;
        Ok(())
    }
}

// --- Shared document helpers ---

pub(crate) fn insert_company(conn: &Connection, company: &Company) -> Result<()> {
    conn.execute(
        "INSERT INTO companies (id, name, website, status, created_at, doc)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            company.id,
            company.name,
            company.website,
            company.status,
            company.created_at,
            serde_json::to_string(company)?
        ],
    )?;
    Ok(())
}

fn insert_job(conn: &Connection, job: &Job) -> Result<()> {
    conn.execute(
        "INSERT INTO jobs (id, title, company_name, status, created_at, doc)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            job.id,
            job.title,
            job.company_name(),
            job.status,
            job.created_at,
            serde_json::to_string(job)?
        ],
    )?;
    Ok(())
}

pub(crate) fn decode_doc<T: DeserializeOwned>(doc: &str) -> Result<T> {
    Ok(serde_json::from_str(doc)?)
}

fn get_raw_doc(conn: &Connection, table: &str, id: &str) -> Result<Option<Map<String, Value>>> {
    get_doc(conn, table, id)
}

fn get_doc<T: DeserializeOwned>(conn: &Connection, table: &str, id: &str) -> Result<Option<T>> {
    let doc: Option<String> = conn
        .query_row(&format!("SELECT doc FROM {table} WHERE id = ?1"), [id], |row| {
            row.get(0)
        })
        .optional()?;
    doc.map(|d| decode_doc(&d)).transpose()
}

/// Case-insensitive, unanchored match of `text` taken literally.
pub fn contains_pattern(text: &str) -> String {
    format!("(?i){}", regex::escape(text))
}

/// Case-insensitive, whole-value match of `text` taken literally.
pub fn exact_pattern(text: &str) -> String {
    format!("(?i)^{}$", regex::escape(text))
}

#[derive(Default)]
struct Filter {
    clauses: Vec<&'static str>,
    args: Vec<SqlValue>,
}

impl Filter {
    fn push<const N: usize>(&mut self, clause: &'static str, args: [SqlValue; N]) {
        self.clauses.push(clause);
        self.args.extend(args);
    }

    fn where_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

/// `table` and `column` come from fixed lists, never from the client.
fn list_docs<T: DeserializeOwned>(
    conn: &Connection,
    table: &str,
    filter: &Filter,
    column: &str,
    ascending: bool,
    query: &ListQuery,
) -> Result<Page<T>> {
    let where_sql = filter.where_sql();
    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {table}{where_sql}"),
        params_from_iter(filter.args.iter()),
        |row| row.get(0),
    )?;

    let direction = if ascending { "ASC" } else { "DESC" };
    let sql = format!(
        "SELECT doc FROM {table}{where_sql} ORDER BY {column} {direction}, rowid {direction} LIMIT ? OFFSET ?"
    );
    let mut args = filter.args.clone();
    args.push(query.limit().into());
    args.push(query.offset().into());

    let mut stmt = conn.prepare(&sql)?;
    let docs = stmt
        .query_map(params_from_iter(args.iter()), |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let items = docs
        .iter()
        .map(|doc| decode_doc(doc))
        .collect::<Result<Vec<T>>>()?;

    Ok(Page::new(items, total, query.page(), query.limit()))
}

/// `X REGEXP Y` for SQLite, backed by the `regex` crate. The compiled pattern
/// is cached per statement.
fn register_regexp(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let re: Arc<Regex> = ctx.get_or_create_aux(0, |pattern| -> std::result::Result<Regex, BoxError> {
                Ok(Regex::new(pattern.as_str()?)?)
            })?;
            let matched = match ctx.get_raw(1) {
                ValueRef::Text(text) => std::str::from_utf8(text)
                    .map(|t| re.is_match(t))
                    .unwrap_or(false),
                _ => false,
            };
            Ok(matched)
        },
    )
}
