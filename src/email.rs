use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{EmailLog, EmailProvider, SendStatus};

const GMAIL_SEND_URL: &str = "https://gmail.googleapis.com/gmail/v1/users/me/messages/send";

/// The job an email was sent about, copied into its log entry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobContext {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailRequest {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub job_context: Option<JobContext>,
}

/// Connection details for an HTTP mail relay that takes multipart forms.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomEmailSettings {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub from_name: String,
    #[serde(default)]
    pub from_email: String,
    #[serde(default)]
    pub reply_to: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomEmailRequest {
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub settings: CustomEmailSettings,
    #[serde(default)]
    pub job_context: Option<JobContext>,
}

/// Plain-text MIME message, base64url encoded without padding as the Gmail
/// API expects in `raw`. The subject is RFC 2047 encoded so it survives
/// non-ASCII text.
pub fn build_gmail_raw(to: &str, subject: &str, body: &str) -> String {
    let encoded_subject = format!("=?utf-8?B?{}?=", STANDARD.encode(subject));
    let message = [
        format!("To: {to}"),
        "Content-Type: text/plain; charset=utf-8".to_string(),
        "MIME-Version: 1.0".to_string(),
        format!("Subject: {encoded_subject}"),
        String::new(),
        body.to_string(),
    ]
    .join("\n");
    URL_SAFE_NO_PAD.encode(message)
}

/// Send through Gmail and record the attempt. Returns Gmail's response.
pub fn send_gmail(db: &Database, request: &GmailRequest) -> Result<Value> {
    let outcome = deliver_gmail(request);
    record_attempt(
        db,
        EmailProvider::Gmail,
        &request.to,
        &request.subject,
        request.job_context.as_ref(),
        &outcome,
    );
    outcome
}

fn deliver_gmail(request: &GmailRequest) -> Result<Value> {
    let token = request
        .access_token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::Upstream("Missing Access Token".to_string()))?;

    let raw = build_gmail_raw(&request.to, &request.subject, &request.body);
    let client = reqwest::blocking::Client::new();
    let response = client
        .post(GMAIL_SEND_URL)
        .bearer_auth(token)
        .json(&json!({ "raw": raw }))
        .send()?;

    if !response.status().is_success() {
        let error_text = response.text().unwrap_or_default();
        return Err(AppError::Upstream(error_text));
    }
    Ok(response.json()?)
}

/// Send through the configured relay and record the attempt.
pub fn send_custom(db: &Database, request: &CustomEmailRequest) -> Result<Value> {
    let outcome = deliver_custom(request);
    record_attempt(
        db,
        EmailProvider::Custom,
        &request.to,
        &request.subject,
        request.job_context.as_ref(),
        &outcome,
    );
    outcome
}

fn deliver_custom(request: &CustomEmailRequest) -> Result<Value> {
    let settings = &request.settings;
    if settings.url.is_empty() || settings.auth_token.is_empty() {
        return Err(AppError::Upstream(
            "Missing custom email configuration".to_string(),
        ));
    }

    let form = reqwest::blocking::multipart::Form::new()
        .text("from", format!("{} <{}>", settings.from_name, settings.from_email))
        .text("to", request.to.clone())
        .text("replyTo", settings.reply_to.clone())
        .text("subject", request.subject.clone())
        .text("text", request.body.clone());

    let client = reqwest::blocking::Client::new();
    let response = client
        .post(&settings.url)
        .header("Authorization", &settings.auth_token)
        .multipart(form)
        .send()?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().unwrap_or_default();
        return Err(AppError::Upstream(format!(
            "Custom API Error ({}): {}",
            status.as_u16(),
            error_text
        )));
    }
    let data: Value = response.json()?;
    Ok(json!({ "success": true, "data": data }))
}

/// Append one log entry for a finished attempt. A store failure here is
/// reported but never replaces the send outcome.
fn record_attempt(
    db: &Database,
    provider: EmailProvider,
    recipient: &str,
    subject: &str,
    context: Option<&JobContext>,
    outcome: &Result<Value>,
) {
    let (status, error_message) = match outcome {
        Ok(_) => (SendStatus::Sent, None),
        Err(e) => (SendStatus::Failed, Some(e.to_string())),
    };
    match &error_message {
        None => tracing::info!(provider = provider.as_str(), %recipient, "email sent"),
        Some(e) => tracing::warn!(provider = provider.as_str(), %recipient, error = %e, "email failed"),
    }

    let log = EmailLog {
        id: String::new(),
        job_id: context.map(|c| c.id.clone()).unwrap_or_default(),
        job_title: context.map(|c| c.title.clone()).unwrap_or_default(),
        recipient: recipient.to_string(),
        subject: subject.to_string(),
        provider,
        status,
        error_message,
        timestamp: 0,
    };
    if let Err(e) = db.append_log(log) {
        tracing::error!(error = %e, "failed to save email log");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ListQuery;

    fn logs(db: &Database) -> Vec<EmailLog> {
        db.list_logs(&ListQuery::default()).unwrap().items
    }

    #[test]
    fn test_build_gmail_raw() {
        let raw = build_gmail_raw("jo@acme.com", "héllo", "Line one\nLine two");
        assert!(!raw.contains('='));
        assert!(!raw.contains('+'));
        assert!(!raw.contains('/'));

        let decoded = String::from_utf8(URL_SAFE_NO_PAD.decode(&raw).unwrap()).unwrap();
        let subject = format!("Subject: =?utf-8?B?{}?=", STANDARD.encode("héllo"));
        assert_eq!(
            decoded,
            format!(
                "To: jo@acme.com\nContent-Type: text/plain; charset=utf-8\nMIME-Version: 1.0\n{subject}\n\nLine one\nLine two"
            )
        );
    }

    #[test]
    fn test_gmail_without_token_fails_and_logs() {
        let db = Database::open_in_memory().unwrap();
        let request = GmailRequest {
            to: "jo@acme.com".to_string(),
            subject: "re: backend engineer".to_string(),
            body: "Hi".to_string(),
            job_context: Some(JobContext {
                id: "job-1".to_string(),
                title: "Backend Engineer".to_string(),
            }),
            ..Default::default()
        };

        let err = send_gmail(&db, &request).unwrap_err();
        assert_eq!(err.to_string(), "Missing Access Token");

        let logs = logs(&db);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, SendStatus::Failed);
        assert_eq!(logs[0].provider, EmailProvider::Gmail);
        assert_eq!(logs[0].job_id, "job-1");
        assert_eq!(logs[0].job_title, "Backend Engineer");
        assert_eq!(logs[0].error_message.as_deref(), Some("Missing Access Token"));
    }

    #[test]
    fn test_custom_without_config_logs_even_without_job_context() {
        let db = Database::open_in_memory().unwrap();
        let request = CustomEmailRequest {
            to: "jo@acme.com".to_string(),
            subject: "question".to_string(),
            ..Default::default()
        };

        let err = send_custom(&db, &request).unwrap_err();
        assert_eq!(err.to_string(), "Missing custom email configuration");

        let logs = logs(&db);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].provider, EmailProvider::Custom);
        assert_eq!(logs[0].recipient, "jo@acme.com");
        assert_eq!(logs[0].job_id, "");
    }

    #[test]
    fn test_custom_unreachable_relay_logs_failure() {
        let db = Database::open_in_memory().unwrap();
        let request = CustomEmailRequest {
            to: "jo@acme.com".to_string(),
            subject: "question".to_string(),
            body: "Hi".to_string(),
            settings: CustomEmailSettings {
                url: "http://127.0.0.1:1/send".to_string(),
                auth_token: "token".to_string(),
                ..Default::default()
            },
            job_context: None,
        };

        assert!(send_custom(&db, &request).is_err());
        let logs = logs(&db);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, SendStatus::Failed);
        assert!(logs[0].error_message.is_some());
    }
}
