//! HTTP surface
//!
//! Thin axum handlers over the store, the AI operations and the mailers.
//! Store and provider calls block, so every handler hands its work to
//! [`blocking`].

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::ai::{self, AIProvider, AgencyProfile};
use crate::auth::{self, NewUser, TokenSigner};
use crate::db::Database;
use crate::email::{self, CustomEmailRequest, GmailRequest};
use crate::error::{AppError, Result};
use crate::models::{Company, EmailLog, Job, ListQuery};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub ai: Option<Arc<dyn AIProvider>>,
    pub signer: TokenSigner,
}

impl AppState {
    fn provider(&self) -> Result<Arc<dyn AIProvider>> {
        self.ai
            .clone()
            .ok_or_else(|| AppError::Internal("Server misconfigured: Missing API Key".to_string()))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/jobs", get(list_jobs).post(create_job))
        .route("/api/jobs/:id", put(update_job).delete(delete_job))
        .route("/api/companies", get(list_companies).post(create_company))
        .route("/api/companies/:id", put(update_company).delete(delete_company))
        .route("/api/logs", get(list_logs).post(create_log))
        .route("/api/users", get(list_users).post(create_user))
        .route("/api/users/login", post(login))
        .route("/api/users/me", get(me))
        .route("/api/users/:id", delete(delete_user))
        .route("/api/settings", get(get_settings).put(update_settings))
        .route("/api/analyze-job", post(analyze_job))
        .route("/api/generate-email", post(generate_email))
        .route("/api/find-email", post(find_email))
        .route("/api/analyze-company", post(analyze_company))
        .route("/api/find-decision-maker", post(find_decision_maker))
        .route("/api/generate-company-email", post(generate_company_email))
        .route("/api/send-email", post(send_email))
        .route("/api/send-custom-email", post(send_custom_email))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("outreach listening on http://{addr}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
}

/// Run blocking store or provider work off the async workers.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::Internal(format!("worker task failed: {e}")))?
}

/// Decode a JSON body, reporting both malformed JSON and wrong shapes as 400.
fn parse_body<T: DeserializeOwned>(payload: Payload) -> Result<T> {
    let Json(value) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;
    serde_json::from_value(value).map_err(|e| AppError::BadRequest(format!("Invalid request body: {e}")))
}

type Payload = std::result::Result<Json<Value>, JsonRejection>;

async fn healthz() -> StatusCode {
    StatusCode::OK
}

// --- Jobs ---

async fn list_jobs(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Result<Json<Value>> {
    let page = blocking(move || state.db.list_jobs(&query)).await?;
    Ok(Json(serde_json::to_value(page)?))
}

async fn create_job(State(state): State<AppState>, payload: Payload) -> Result<Json<Value>> {
    let job: Job = parse_body(payload)?;
    let job = blocking(move || state.db.create_job(job)).await?;
    Ok(Json(json!({ "success": true, "job": job })))
}

async fn update_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Payload,
) -> Result<Json<Value>> {
    let patch: Map<String, Value> = parse_body(payload)?;
    let echo = patch.clone();
    let updated = blocking(move || state.db.update_job(&id, patch)).await?;
    let job = match updated {
        Some(job) => serde_json::to_value(job)?,
        None => Value::Object(echo),
    };
    Ok(Json(json!({ "success": true, "job": job })))
}

async fn delete_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
    let job_id = id.clone();
    blocking(move || state.db.delete_job(&job_id)).await?;
    Ok(Json(json!({ "success": true, "id": id })))
}

// --- Companies ---

async fn list_companies(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Result<Json<Value>> {
    let page = blocking(move || state.db.list_companies(&query)).await?;
    Ok(Json(serde_json::to_value(page)?))
}

async fn create_company(State(state): State<AppState>, payload: Payload) -> Result<Json<Value>> {
    let company: Company = parse_body(payload)?;
    let resolution = blocking(move || state.db.create_company(company)).await?;
    if !resolution.is_created() {
        tracing::debug!(id = %resolution.company().id, "company already stored, returning existing record");
    }
    Ok(Json(json!({ "success": true, "company": resolution.into_company() })))
}

async fn update_company(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Payload,
) -> Result<Json<Value>> {
    let patch: Map<String, Value> = parse_body(payload)?;
    let echo = patch.clone();
    let updated = blocking(move || state.db.update_company(&id, patch)).await?;
    let company = match updated {
        Some(company) => serde_json::to_value(company)?,
        None => Value::Object(echo),
    };
    Ok(Json(json!({ "success": true, "company": company })))
}

async fn delete_company(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
    let company_id = id.clone();
    blocking(move || state.db.delete_company(&company_id)).await?;
    Ok(Json(json!({ "success": true, "id": id })))
}

// --- Logs ---

async fn list_logs(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Result<Json<Value>> {
    let page = blocking(move || state.db.list_logs(&query)).await?;
    Ok(Json(serde_json::to_value(page)?))
}

async fn create_log(State(state): State<AppState>, payload: Payload) -> Result<Json<Value>> {
    let log: EmailLog = parse_body(payload)?;
    let log = blocking(move || state.db.append_log(log)).await?;
    Ok(Json(json!({ "success": true, "log": log })))
}

// --- Users ---

#[derive(Debug, Default, Deserialize)]
struct LoginRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

async fn list_users(State(state): State<AppState>) -> Result<Json<Value>> {
    let users = blocking(move || state.db.list_users()).await?;
    Ok(Json(json!({ "users": users })))
}

async fn create_user(State(state): State<AppState>, payload: Payload) -> Result<Json<Value>> {
    let new_user: NewUser = parse_body(payload)?;
    let user = blocking(move || auth::create_user(&state.db, &new_user)).await?;
    Ok(Json(json!({ "success": true, "user": user })))
}

async fn delete_user(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>> {
    let user_id = id.clone();
    blocking(move || state.db.delete_user(&user_id)).await?;
    Ok(Json(json!({ "success": true, "id": id })))
}

async fn login(State(state): State<AppState>, payload: Payload) -> Result<Json<Value>> {
    let request: LoginRequest = parse_body(payload)?;
    let (user, token) =
        blocking(move || auth::login(&state.db, &state.signer, &request.username, &request.password)).await?;
    Ok(Json(json!({ "success": true, "user": user, "token": token })))
}

async fn me(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .map(|v| v.to_str().map(str::to_string))
        .transpose()
        .map_err(|_| AppError::Unauthorized("Invalid token format".to_string()))?;
    let user = blocking(move || auth::current_user(&state.db, &state.signer, authorization.as_deref())).await?;
    Ok(Json(json!({ "success": true, "user": user })))
}

// --- Settings ---

async fn get_settings(State(state): State<AppState>) -> Result<Json<Value>> {
    let settings = blocking(move || state.db.get_settings()).await?;
    Ok(Json(json!({ "settings": settings })))
}

async fn update_settings(State(state): State<AppState>, payload: Payload) -> Result<Json<Value>> {
    let patch: Map<String, Value> = parse_body(payload)?;
    blocking(move || state.db.upsert_settings(patch)).await?;
    Ok(Json(json!({ "success": true })))
}

// --- AI ---

#[derive(Debug, Deserialize)]
struct JobPrompt {
    job: Job,
    #[serde(default)]
    settings: AgencyProfile,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompanyPrompt {
    company: Company,
    #[serde(default)]
    settings: AgencyProfile,
    #[serde(default)]
    contact_name: Option<String>,
    #[serde(default)]
    contact_role: Option<String>,
}

async fn analyze_job(State(state): State<AppState>, payload: Payload) -> Result<Json<Value>> {
    let provider = state.provider()?;
    let request: JobPrompt = parse_body(payload)?;
    let analysis = blocking(move || ai::analyze_job(provider.as_ref(), &request.job, &request.settings)).await?;
    Ok(Json(serde_json::to_value(analysis)?))
}

async fn generate_email(State(state): State<AppState>, payload: Payload) -> Result<Json<Value>> {
    let provider = state.provider()?;
    let request: JobPrompt = parse_body(payload)?;
    let draft = blocking(move || ai::generate_email(provider.as_ref(), &request.job, &request.settings)).await?;
    Ok(Json(serde_json::to_value(draft)?))
}

async fn find_email(State(state): State<AppState>, payload: Payload) -> Result<Json<Value>> {
    let provider = state.provider()?;
    let request: JobPrompt = parse_body(payload)?;
    let found = blocking(move || ai::find_email(provider.as_ref(), &request.job)).await?;
    Ok(Json(serde_json::to_value(found)?))
}

async fn analyze_company(State(state): State<AppState>, payload: Payload) -> Result<Json<Value>> {
    let provider = state.provider()?;
    let request: CompanyPrompt = parse_body(payload)?;
    let analysis =
        blocking(move || ai::analyze_company(provider.as_ref(), &request.company, &request.settings)).await?;
    Ok(Json(analysis.unwrap_or(Value::Null)))
}

async fn find_decision_maker(State(state): State<AppState>, payload: Payload) -> Result<Json<Value>> {
    let provider = state.provider()?;
    let request: CompanyPrompt = parse_body(payload)?;
    let found = blocking(move || ai::find_decision_maker(provider.as_ref(), &request.company)).await?;
    Ok(Json(found))
}

async fn generate_company_email(State(state): State<AppState>, payload: Payload) -> Result<Json<Value>> {
    let provider = state.provider()?;
    let request: CompanyPrompt = parse_body(payload)?;
    let draft = blocking(move || {
        ai::generate_company_email(
            provider.as_ref(),
            &request.company,
            &request.settings,
            request.contact_name.as_deref(),
            request.contact_role.as_deref(),
        )
    })
    .await?;
    Ok(Json(serde_json::to_value(draft)?))
}

// --- Email ---

async fn send_email(State(state): State<AppState>, payload: Payload) -> Result<Json<Value>> {
    let request: GmailRequest = parse_body(payload)?;
    let response = blocking(move || email::send_gmail(&state.db, &request)).await?;
    Ok(Json(response))
}

async fn send_custom_email(State(state): State<AppState>, payload: Payload) -> Result<Json<Value>> {
    let request: CustomEmailRequest = parse_body(payload)?;
    let response = blocking(move || email::send_custom(&state.db, &request)).await?;
    Ok(Json(response))
}
