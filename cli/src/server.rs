use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use axum::{
    Extension, Json, Router,
    extract::{
        DefaultBodyLimit, FromRequest, FromRequestParts, Multipart, Path, Query, Request, State,
        multipart::MultipartRejection,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderValue, StatusCode, header, request::Parts},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
};
use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use careconnect_core::adherence::Period;
use careconnect_core::db::{Database, constraint_violation};
use careconnect_core::models::{
    DEFAULT_LOW_STOCK_THRESHOLD, LogStatus, NewCheckin, NewMedication, NewMedicationLog, NewUser,
    NewVoiceMessage, Role, UpdateMedication, User, validate_email, validate_medication_update,
    validate_new_medication, validate_password,
};
use careconnect_core::storage::{AudioStore, FsAudioStore, new_storage_key};

const BODY_LIMIT: usize = 25 * 1024 * 1024; // 25 MB, voice notes included
const DEFAULT_CHECKIN_LIMIT: i64 = 10;
const DEFAULT_SUMMARY_LIMIT: i64 = 7;
const MAX_LIMIT: i64 = 100;
const DEFAULT_AUDIO_TYPE: &str = "audio/webm";
const NOT_AUTHORIZED: &str = "You are not authorized to view this user's data";

#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Database>>,
    audio: Arc<dyn AudioStore>,
    session_ttl: Duration,
}

impl AppState {
    fn db(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ServerSettings {
    pub port: u16,
    pub bind: String,
    pub audio_dir: PathBuf,
    pub session_ttl: Duration,
}

/// The authenticated caller, inserted by `require_auth`.
#[derive(Clone)]
struct Session {
    user: User,
    token: String,
}

// --- Request types ---

#[derive(Deserialize)]
struct SignupRequest {
    email: Option<String>,
    password: Option<String>,
    role: Option<String>,
    full_name: Option<String>,
}

#[derive(Deserialize)]
struct SigninRequest {
    email: Option<String>,
    password: Option<String>,
}

#[derive(Deserialize)]
struct CheckinRequest {
    transcript: Option<String>,
}

#[derive(Deserialize)]
struct HistoryQuery {
    user_id: Option<String>,
    limit: Option<i64>,
}

#[derive(Deserialize)]
struct SummaryRequest {
    date: Option<String>,
    user_id: Option<String>,
}

#[derive(Deserialize)]
struct UserQuery {
    user_id: Option<String>,
}

#[derive(Deserialize)]
struct CreateMedicationRequest {
    name: Option<String>,
    dosage: Option<String>,
    time: Option<String>,
    total_stock: Option<i64>,
    low_stock_threshold: Option<i64>,
}

#[derive(Deserialize)]
struct UpdateMedicationRequest {
    name: Option<String>,
    dosage: Option<String>,
    time: Option<String>,
    total_stock: Option<i64>,
    low_stock_threshold: Option<i64>,
    is_active: Option<bool>,
}

#[derive(Deserialize)]
struct LogMedicationRequest {
    medication_id: Option<String>,
    status: Option<String>,
    scheduled_time: Option<String>,
}

#[derive(Deserialize)]
struct LogQuery {
    user_id: Option<String>,
    medication_id: Option<String>,
    limit: Option<i64>,
}

#[derive(Deserialize)]
struct AdherenceQuery {
    user_id: Option<String>,
    period: Option<String>,
}

#[derive(Deserialize)]
struct ResolveAlertRequest {
    #[serde(alias = "alertId")]
    alert_id: Option<String>,
}

#[derive(Deserialize)]
struct StockAlertQuery {
    user_id: Option<String>,
    include_resolved: Option<bool>,
}

#[derive(Deserialize)]
struct CreateLinkRequest {
    elderly_user_email: Option<String>,
}

#[derive(Deserialize)]
struct MarkReadRequest {
    is_read: Option<bool>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// --- Error handling ---

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Internal(err) => {
                tracing::error!(error = %format!("{err:#}"), "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match constraint_violation(&err) {
            Some(msg) => Self::BadRequest(msg),
            None => Self::Internal(err),
        }
    }
}

fn bad_request(err: &anyhow::Error) -> ApiError {
    ApiError::BadRequest(format!("{err}"))
}

fn required(value: Option<String>, field: &str) -> Result<String, ApiError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("{field} is required")))
}

fn resolve_limit(limit: Option<i64>, default: i64) -> Result<i64, ApiError> {
    let limit = limit.unwrap_or(default);
    if (1..=MAX_LIMIT).contains(&limit) {
        Ok(limit)
    } else {
        Err(ApiError::BadRequest(format!(
            "limit must be between 1 and {MAX_LIMIT}"
        )))
    }
}

// --- Extractors ---

/// `Json` whose rejections (malformed body, wrong field types, missing content
/// type) come back as the usual `{"error": ...}` body with status 400.
struct ApiJson<T>(T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection: JsonRejection| ApiError::BadRequest(rejection.body_text()))?;
        Ok(Self(value))
    }
}

/// `Query` with the same error body as [`ApiJson`].
struct ApiQuery<T>(T);

impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|rejection: QueryRejection| ApiError::BadRequest(rejection.body_text()))?;
        Ok(Self(value))
    }
}

/// The user whose data a request reads. Anyone other than the caller requires a
/// caregiver link from the caller to that user.
fn target_user(db: &Database, caller: &User, user_id: Option<&str>) -> Result<String, ApiError> {
    let Some(user_id) = user_id.map(str::trim).filter(|id| !id.is_empty()) else {
        return Ok(caller.id.clone());
    };
    if user_id == caller.id || db.is_linked(&caller.id, user_id).context("database error")? {
        Ok(user_id.to_string())
    } else {
        Err(ApiError::Forbidden(NOT_AUTHORIZED.to_string()))
    }
}

// --- Middleware ---

/// Token from an `Authorization` value. The scheme name is case-insensitive.
fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.trim_start().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

async fn require_auth(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_string);

    let session = match token {
        Some(token) => {
            let found = state.db().user_for_token(&token, Utc::now());
            match found {
                Ok(Some(user)) => Some(Session { user, token }),
                Ok(None) => None,
                Err(e) => return ApiError::Internal(e).into_response(),
            }
        }
        None => None,
    };

    let Some(session) = session else {
        return ApiError::Unauthorized("Invalid or missing token".to_string()).into_response();
    };
    request.extensions_mut().insert(session);
    next.run(request).await
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Auth handlers ---

async fn signup(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<SignupRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let email = validate_email(&required(req.email, "email")?).map_err(|e| bad_request(&e))?;
    let password = req
        .password
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::BadRequest("password is required".to_string()))?;
    validate_password(&password).map_err(|e| bad_request(&e))?;
    let role: Role = required(req.role, "role")?
        .parse()
        .map_err(|e| bad_request(&e))?;

    let db = state.db();
    if db
        .get_user_by_email(&email)
        .context("database error")?
        .is_some()
    {
        return Err(ApiError::BadRequest(
            "An account with this email already exists".to_string(),
        ));
    }

    let now = Utc::now();
    let new_user = NewUser {
        email,
        password,
        role,
        full_name: req.full_name,
    };
    let user = db.create_user(&new_user, now)?;
    let session = db
        .create_session(&user.id, state.session_ttl, now)
        .context("failed to create session")?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "User created successfully",
            "user": session.user,
            "token": session.token,
            "expires_at": session.expires_at,
        })),
    ))
}

async fn signin(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<SigninRequest>,
) -> Result<Json<Value>, ApiError> {
    let email = required(req.email, "email")?;
    let password = req
        .password
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::BadRequest("password is required".to_string()))?;

    let db = state.db();
    let user = db
        .authenticate(&email, &password)
        .context("database error")?
        .ok_or_else(|| ApiError::Unauthorized("Invalid email or password".to_string()))?;
    let session = db
        .create_session(&user.id, state.session_ttl, Utc::now())
        .context("failed to create session")?;

    Ok(Json(json!({
        "message": "Signed in successfully",
        "user": session.user,
        "token": session.token,
        "expires_at": session.expires_at,
    })))
}

async fn signout(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Json<Value>, ApiError> {
    state
        .db()
        .revoke_session(&session.token)
        .context("database error")?;
    Ok(Json(json!({ "message": "Signed out successfully" })))
}

async fn me(Extension(session): Extension<Session>) -> Json<Value> {
    Json(json!({ "user": session.user }))
}

// --- Check-ins and summaries ---

async fn create_checkin(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    ApiJson(req): ApiJson<CheckinRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let transcript = required(req.transcript, "transcript")?;
    let checkin = NewCheckin::analyze(&session.user.id, &transcript);

    let checkin = state
        .db()
        .insert_checkin(&checkin, Utc::now())
        .context("failed to save check-in")?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Check-in saved successfully",
            "checkin": checkin,
        })),
    ))
}

async fn list_checkins(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    ApiQuery(params): ApiQuery<HistoryQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = resolve_limit(params.limit, DEFAULT_CHECKIN_LIMIT)?;
    let db = state.db();
    let user_id = target_user(&db, &session.user, params.user_id.as_deref())?;
    let checkins = db
        .list_checkins(&user_id, limit)
        .context("database error")?;
    Ok(Json(json!({ "checkins": checkins })))
}

async fn generate_summary(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    ApiJson(req): ApiJson<SummaryRequest>,
) -> Result<Json<Value>, ApiError> {
    let now = Utc::now();
    let date = match req.date.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
        Some(d) => NaiveDate::parse_from_str(d, "%Y-%m-%d")
            .map_err(|_| ApiError::BadRequest(format!("Invalid date '{d}'. Use YYYY-MM-DD")))?,
        None => now.date_naive(),
    };

    let db = state.db();
    let user_id = target_user(&db, &session.user, req.user_id.as_deref())?;
    let summary = db
        .generate_daily_summary(&user_id, date, now)
        .context("failed to generate summary")?;

    Ok(Json(json!({
        "message": "Summary generated successfully",
        "summary": summary,
    })))
}

async fn list_summaries(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    ApiQuery(params): ApiQuery<HistoryQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = resolve_limit(params.limit, DEFAULT_SUMMARY_LIMIT)?;
    let db = state.db();
    let user_id = target_user(&db, &session.user, params.user_id.as_deref())?;
    let summaries = db
        .list_daily_summaries(&user_id, limit)
        .context("database error")?;
    Ok(Json(json!({ "summaries": summaries })))
}

// --- Medications ---

async fn create_medication(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    ApiJson(req): ApiJson<CreateMedicationRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let med = NewMedication {
        user_id: session.user.id.clone(),
        name: required(req.name, "name")?,
        dosage: required(req.dosage, "dosage")?,
        time: required(req.time, "time")?,
        total_stock: req
            .total_stock
            .ok_or_else(|| ApiError::BadRequest("total_stock is required".to_string()))?,
        low_stock_threshold: req
            .low_stock_threshold
            .unwrap_or(DEFAULT_LOW_STOCK_THRESHOLD),
    };
    validate_new_medication(&med).map_err(|e| bad_request(&e))?;

    let medication = state
        .db()
        .insert_medication(&med, Utc::now())
        .context("failed to add medication")?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Medication added successfully",
            "medication": medication,
        })),
    ))
}

async fn list_medications(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    ApiQuery(params): ApiQuery<UserQuery>,
) -> Result<Json<Value>, ApiError> {
    let db = state.db();
    let user_id = target_user(&db, &session.user, params.user_id.as_deref())?;
    let medications = db
        .list_active_medications(&user_id)
        .context("database error")?;
    Ok(Json(json!({ "medications": medications })))
}

/// Fails unless the medication exists and belongs to `user`.
fn owned_medication(db: &Database, user: &User, id: &str) -> Result<(), ApiError> {
    let med = db
        .get_medication(id)
        .context("database error")?
        .ok_or_else(|| ApiError::NotFound(format!("Medication {id} not found")))?;
    if med.user_id != user.id {
        return Err(ApiError::Forbidden(
            "You can only change your own medications".to_string(),
        ));
    }
    Ok(())
}

async fn update_medication(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<UpdateMedicationRequest>,
) -> Result<Json<Value>, ApiError> {
    let update = UpdateMedication {
        name: req.name,
        dosage: req.dosage,
        time: req.time,
        total_stock: req.total_stock,
        low_stock_threshold: req.low_stock_threshold,
        is_active: req.is_active,
    };
    if update.is_empty() {
        return Err(ApiError::BadRequest(
            "At least one field must be provided".to_string(),
        ));
    }
    validate_medication_update(&update).map_err(|e| bad_request(&e))?;

    let db = state.db();
    owned_medication(&db, &session.user, &id)?;
    let medication = db
        .update_medication(&id, &update, Utc::now())
        .context("failed to update medication")?
        .ok_or_else(|| ApiError::NotFound(format!("Medication {id} not found")))?;

    Ok(Json(json!({
        "message": "Medication updated successfully",
        "medication": medication,
    })))
}

async fn delete_medication(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let db = state.db();
    owned_medication(&db, &session.user, &id)?;
    if db
        .deactivate_medication(&id, Utc::now())
        .context("database error")?
    {
        Ok(Json(json!({ "message": "Medication deleted successfully" })))
    } else {
        Err(ApiError::NotFound(format!("Medication {id} not found")))
    }
}

async fn log_medication(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    ApiJson(req): ApiJson<LogMedicationRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let medication_id = required(req.medication_id, "medication_id")?;
    let status: LogStatus = required(req.status, "status")?
        .parse()
        .map_err(|e| bad_request(&e))?;
    let scheduled_time = required(req.scheduled_time, "scheduled_time")?;

    let db = state.db();
    let owned = db
        .get_medication(&medication_id)
        .context("database error")?
        .is_some_and(|m| m.user_id == session.user.id);
    if !owned {
        return Err(ApiError::NotFound("Medication not found".to_string()));
    }

    let dose = db
        .log_medication(
            &NewMedicationLog {
                medication_id,
                user_id: session.user.id.clone(),
                status,
                scheduled_time,
            },
            Utc::now(),
        )
        .context("failed to log medication")?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Medication logged successfully",
            "log": dose.log,
            "remaining_stock": dose.remaining_stock,
            "stock_alert": dose.stock_alert,
        })),
    ))
}

async fn list_medication_logs(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    ApiQuery(params): ApiQuery<LogQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = params
        .limit
        .map(|l| resolve_limit(Some(l), MAX_LIMIT))
        .transpose()?;
    let medication_id = params
        .medication_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty());

    let db = state.db();
    let user_id = target_user(&db, &session.user, params.user_id.as_deref())?;
    let logs = db
        .list_medication_logs(&user_id, medication_id, limit)
        .context("database error")?;
    Ok(Json(json!({ "logs": logs })))
}

async fn adherence_report(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    ApiQuery(params): ApiQuery<AdherenceQuery>,
) -> Result<Json<Value>, ApiError> {
    let period: Period = match params.period.as_deref().filter(|p| !p.is_empty()) {
        Some(p) => p.parse().map_err(|e| bad_request(&e))?,
        None => Period::default(),
    };

    let db = state.db();
    let user_id = target_user(&db, &session.user, params.user_id.as_deref())?;
    let report = db
        .build_adherence_report(&user_id, period, Utc::now())
        .context("failed to build adherence report")?;

    let value = serde_json::to_value(report).context("failed to serialize report")?;
    Ok(Json(value))
}

// --- Alerts ---

async fn list_alerts(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Json<Value>, ApiError> {
    let alerts = state
        .db()
        .build_caregiver_alerts(&session.user.id, Utc::now())
        .context("failed to build alerts")?;
    let total = alerts.len();
    Ok(Json(json!({ "alerts": alerts, "total": total })))
}

async fn list_stock_alerts(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    ApiQuery(params): ApiQuery<StockAlertQuery>,
) -> Result<Json<Value>, ApiError> {
    let db = state.db();
    let user_id = target_user(&db, &session.user, params.user_id.as_deref())?;
    let alerts = db
        .list_stock_alerts(&user_id, params.include_resolved.unwrap_or(false))
        .context("failed to list stock alerts")?;
    let total = alerts.len();
    Ok(Json(json!({ "alerts": alerts, "total": total })))
}

async fn resolve_alert(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    ApiJson(req): ApiJson<ResolveAlertRequest>,
) -> Result<Json<Value>, ApiError> {
    let alert_id = required(req.alert_id, "alert_id")?;

    let db = state.db();
    let alert = db
        .get_stock_alert(&alert_id)
        .context("database error")?
        .ok_or_else(|| ApiError::NotFound(format!("Alert {alert_id} not found")))?;
    let allowed = alert.user_id == session.user.id
        || db
            .is_linked(&session.user.id, &alert.user_id)
            .context("database error")?;
    if !allowed {
        return Err(ApiError::Forbidden(NOT_AUTHORIZED.to_string()));
    }

    db.resolve_stock_alert(&alert_id)
        .context("failed to resolve alert")?;
    Ok(Json(json!({ "message": "Alert resolved" })))
}

// --- Caregiver links ---

async fn create_link(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    ApiJson(req): ApiJson<CreateLinkRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if session.user.role != Role::Caregiver {
        return Err(ApiError::Forbidden(
            "Only caregivers can create links".to_string(),
        ));
    }
    let email = required(req.elderly_user_email, "elderly_user_email")?;

    let db = state.db();
    let elderly = db
        .get_user_by_email(&email)
        .context("database error")?
        .filter(|u| u.role == Role::ElderlyUser)
        .ok_or_else(|| {
            ApiError::NotFound(
                "Elderly user not found. Make sure they have signed up as an elderly user."
                    .to_string(),
            )
        })?;
    if db
        .is_linked(&session.user.id, &elderly.id)
        .context("database error")?
    {
        return Err(ApiError::BadRequest(
            "You are already linked to this user".to_string(),
        ));
    }

    let link = db
        .create_link(&session.user.id, &elderly.id, Utc::now())
        .context("failed to create link")?;
    let elderly = elderly.to_ref();

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": format!("Successfully linked to {}", elderly.display_name()),
            "link": link,
            "elderly_user": elderly,
        })),
    ))
}

async fn list_links(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Json<Value>, ApiError> {
    let links = state
        .db()
        .list_links(&session.user.id)
        .context("database error")?;
    Ok(Json(json!({ "links": links })))
}

async fn delete_link(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state
        .db()
        .delete_link(&id, &session.user.id)
        .context("database error")?
    {
        Ok(Json(json!({ "message": "Link removed successfully" })))
    } else {
        Err(ApiError::NotFound(format!("Link {id} not found")))
    }
}

// --- Voice messages ---

struct Upload {
    audio: Option<(Vec<u8>, String)>,
    recipient_id: Option<String>,
    duration_seconds: Option<String>,
}

async fn read_upload(mut multipart: Multipart) -> Result<Upload, ApiError> {
    let mut upload = Upload {
        audio: None,
        recipient_id: None,
        duration_seconds: None,
    };
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Invalid multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "audio" => {
                let content_type = field
                    .content_type()
                    .unwrap_or(DEFAULT_AUDIO_TYPE)
                    .to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Invalid audio upload: {e}")))?;
                upload.audio = Some((bytes.to_vec(), content_type));
            }
            "recipient_id" | "duration_seconds" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Invalid field {name}: {e}")))?;
                if name == "recipient_id" {
                    upload.recipient_id = Some(text);
                } else {
                    upload.duration_seconds = Some(text);
                }
            }
            _ => {}
        }
    }
    Ok(upload)
}

async fn send_message(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let multipart = multipart.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    let upload = read_upload(multipart).await?;
    let recipient_id = required(upload.recipient_id, "recipient_id")?;
    let (audio, content_type) = upload
        .audio
        .filter(|(bytes, _)| !bytes.is_empty())
        .ok_or_else(|| ApiError::BadRequest("audio is required".to_string()))?;
    let duration_seconds = match upload.duration_seconds.as_deref().map(str::trim) {
        Some(d) if !d.is_empty() => Some(d.parse::<i64>().map_err(|_| {
            ApiError::BadRequest(format!("Invalid duration_seconds '{d}'"))
        })?),
        _ => None,
    };

    if recipient_id == session.user.id {
        return Err(ApiError::BadRequest(
            "You cannot send a message to yourself".to_string(),
        ));
    }

    let db = state.db();
    if db
        .get_user(&recipient_id)
        .context("database error")?
        .is_none()
    {
        return Err(ApiError::NotFound("Recipient not found".to_string()));
    }
    if !db
        .linked_either_way(&session.user.id, &recipient_id)
        .context("database error")?
    {
        return Err(ApiError::Forbidden(
            "You can only message users you are linked with".to_string(),
        ));
    }

    let storage_key = new_storage_key(&content_type);
    state
        .audio
        .put(&storage_key, &audio)
        .context("failed to store audio")?;

    let inserted = db.insert_voice_message(
        &NewVoiceMessage {
            sender_id: session.user.id.clone(),
            recipient_id,
            content_type,
            storage_key: storage_key.clone(),
            duration_seconds,
        },
        Utc::now(),
    );
    let message = match inserted {
        Ok(message) => message,
        Err(e) => {
            if let Err(cleanup) = state.audio.delete(&storage_key) {
                tracing::warn!(key = %storage_key, error = %cleanup, "orphaned audio blob");
            }
            return Err(ApiError::from(e));
        }
    };

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Voice message sent successfully",
            "voice_message": message,
        })),
    ))
}

async fn list_messages(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Json<Value>, ApiError> {
    let messages = state
        .db()
        .list_voice_messages(&session.user.id)
        .context("database error")?;
    Ok(Json(json!({ "messages": messages })))
}

async fn mark_message(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<MarkReadRequest>,
) -> Result<Json<Value>, ApiError> {
    let is_read = req
        .is_read
        .ok_or_else(|| ApiError::BadRequest("is_read is required".to_string()))?;

    let db = state.db();
    let message = db
        .get_voice_message(&id)
        .context("database error")?
        .ok_or_else(|| ApiError::NotFound(format!("Message {id} not found")))?;
    if message.recipient_id != session.user.id {
        return Err(ApiError::Forbidden(
            "Only the recipient can update a message".to_string(),
        ));
    }

    db.set_message_read(&id, is_read)
        .context("failed to update message")?;
    let message = db
        .get_voice_message(&id)
        .context("database error")?
        .ok_or_else(|| ApiError::NotFound(format!("Message {id} not found")))?;

    Ok(Json(json!({
        "message": "Message updated successfully",
        "voice_message": message,
    })))
}

async fn message_audio(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let message = state
        .db()
        .get_voice_message(&id)
        .context("database error")?
        .ok_or_else(|| ApiError::NotFound(format!("Message {id} not found")))?;
    if message.sender_id != session.user.id && message.recipient_id != session.user.id {
        return Err(ApiError::Forbidden(
            "You are not a participant in this message".to_string(),
        ));
    }

    let bytes = state
        .audio
        .get(&message.storage_key)
        .context("failed to read audio")?;
    Ok(([(header::CONTENT_TYPE, message.content_type)], bytes).into_response())
}

// --- Router ---

fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/auth/signout", post(signout))
        .route("/api/me", get(me))
        .route("/api/checkin", post(create_checkin).get(list_checkins))
        .route("/api/summary", post(generate_summary).get(list_summaries))
        .route(
            "/api/medications",
            post(create_medication).get(list_medications),
        )
        .route(
            "/api/medications/log",
            post(log_medication).get(list_medication_logs),
        )
        .route("/api/medications/adherence", get(adherence_report))
        .route(
            "/api/medications/{id}",
            patch(update_medication).delete(delete_medication),
        )
        .route("/api/alerts", get(list_alerts).patch(resolve_alert))
        .route("/api/alerts/stock", get(list_stock_alerts))
        .route("/api/caregiver/links", post(create_link).get(list_links))
        .route(
            "/api/caregiver/links/{id}",
            delete(delete_link),
        )
        .route("/api/messages", post(send_message).get(list_messages))
        .route("/api/messages/{id}", patch(mark_message))
        .route("/api/messages/{id}/audio", get(message_audio))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/api/auth/signup", post(signup))
        .route("/api/auth/signin", post(signin))
        .merge(protected)
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

// --- Server startup ---

pub async fn start_server(db: Database, settings: ServerSettings) -> anyhow::Result<()> {
    let purged = db.purge_expired_sessions(Utc::now())?;
    if purged > 0 {
        tracing::info!(purged, "expired sessions removed");
    }

    let audio = FsAudioStore::new(&settings.audio_dir)?;
    let state = AppState {
        db: Arc::new(Mutex::new(db)),
        audio: Arc::new(audio),
        session_ttl: settings.session_ttl,
    };
    let app = build_router(state);

    let bind = settings.bind.as_str();
    if bind != "127.0.0.1" && bind != "localhost" {
        tracing::warn!(
            bind,
            "listening beyond loopback; put a TLS-terminating proxy in front of this server"
        );
    }

    let listener = tokio::net::TcpListener::bind(format!("{bind}:{}", settings.port))
        .await
        .with_context(|| format!("failed to bind {bind}:{}", settings.port))?;
    tracing::info!("Listening on http://{bind}:{}", settings.port);
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        state: AppState,
        _audio_dir: TempDir,
    }

    fn test_app() -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory()
            .unwrap()
            .with_password_rounds(1_000);
        let state = AppState {
            db: Arc::new(Mutex::new(db)),
            audio: Arc::new(FsAudioStore::new(dir.path()).unwrap()),
            session_ttl: Duration::days(30),
        };
        TestApp {
            router: build_router(state.clone()),
            state,
            _audio_dir: dir,
        }
    }

    impl TestApp {
        async fn send(&self, request: axum::http::Request<Body>) -> (StatusCode, Value) {
            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let body = response.into_body().collect().await.unwrap().to_bytes();
            let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
            (status, json)
        }

        async fn get(&self, uri: &str, token: &str) -> (StatusCode, Value) {
            self.send(
                axum::http::Request::get(uri)
                    .header("Authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
        }

        async fn json(
            &self,
            method: &str,
            uri: &str,
            token: Option<&str>,
            body: &Value,
        ) -> (StatusCode, Value) {
            let mut builder = axum::http::Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json");
            if let Some(token) = token {
                builder = builder.header("Authorization", format!("Bearer {token}"));
            }
            self.send(builder.body(Body::from(body.to_string())).unwrap())
                .await
        }

        /// Signs up a fresh account and returns `(token, user_id)`.
        async fn signup(&self, email: &str, role: &str) -> (String, String) {
            let (status, json) = self
                .json(
                    "POST",
                    "/api/auth/signup",
                    None,
                    &json!({
                        "email": email,
                        "password": "correct horse",
                        "role": role,
                        "full_name": email.split('@').next().unwrap(),
                    }),
                )
                .await;
            assert_eq!(status, StatusCode::CREATED, "{json}");
            (
                json["token"].as_str().unwrap().to_string(),
                json["user"]["id"].as_str().unwrap().to_string(),
            )
        }

        async fn link(&self, caregiver_token: &str, elderly_email: &str) -> String {
            let (status, json) = self
                .json(
                    "POST",
                    "/api/caregiver/links",
                    Some(caregiver_token),
                    &json!({ "elderly_user_email": elderly_email }),
                )
                .await;
            assert_eq!(status, StatusCode::CREATED, "{json}");
            json["link"]["id"].as_str().unwrap().to_string()
        }

        async fn add_medication(&self, token: &str, stock: i64) -> String {
            let (status, json) = self
                .json(
                    "POST",
                    "/api/medications",
                    Some(token),
                    &json!({
                        "name": "Metformin",
                        "dosage": "500mg",
                        "time": "08:00",
                        "total_stock": stock,
                    }),
                )
                .await;
            assert_eq!(status, StatusCode::CREATED, "{json}");
            json["medication"]["id"].as_str().unwrap().to_string()
        }

        async fn log_dose(&self, token: &str, medication_id: &str, status: &str) -> Value {
            let (code, json) = self
                .json(
                    "POST",
                    "/api/medications/log",
                    Some(token),
                    &json!({
                        "medication_id": medication_id,
                        "status": status,
                        "scheduled_time": "08:00",
                    }),
                )
                .await;
            assert_eq!(code, StatusCode::CREATED, "{json}");
            json
        }
    }

    fn voice_upload(token: &str, recipient_id: &str, audio: &[u8]) -> axum::http::Request<Body> {
        let boundary = "careconnect-test-boundary";
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"recipient_id\"\r\n\r\n{recipient_id}\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"duration_seconds\"\r\n\r\n12\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"audio\"; filename=\"note.webm\"\r\nContent-Type: audio/webm\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(audio);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        axum::http::Request::post("/api/messages")
            .header("Authorization", format!("Bearer {token}"))
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn auth_missing_token_returns_401() {
        let app = test_app();

        let (status, json) = app
            .send(
                axum::http::Request::get("/api/me")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"], "Invalid or missing token");
    }

    #[tokio::test]
    async fn auth_wrong_token_returns_401() {
        let app = test_app();
        app.signup("rose@example.com", "elderly_user").await;

        let (status, _) = app.get("/api/me", "not-a-real-token").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn security_headers_present() {
        let app = test_app();
        let (token, _) = app.signup("rose@example.com", "elderly_user").await;

        let response = app
            .router
            .clone()
            .oneshot(
                axum::http::Request::get("/api/me")
                    .header("Authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(response.headers().get("x-frame-options").unwrap(), "DENY");
        assert_eq!(
            response.headers().get("content-security-policy").unwrap(),
            "default-src 'none'"
        );
    }

    #[tokio::test]
    async fn security_headers_on_auth_failure() {
        let app = test_app();

        let response = app
            .router
            .clone()
            .oneshot(
                axum::http::Request::get("/api/alerts")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
    }

    #[tokio::test]
    async fn body_size_limit_rejects_oversized() {
        let app = test_app();

        let big_body = vec![0u8; BODY_LIMIT + 1];
        let response = app
            .router
            .clone()
            .oneshot(
                axum::http::Request::post("/api/auth/signup")
                    .header("content-type", "application/json")
                    .header("content-length", big_body.len().to_string())
                    .body(Body::from(big_body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn internal_error_does_not_leak_details() {
        let error = ApiError::Internal(anyhow::anyhow!(
            "secret database path /home/user/.careconnect/careconnect.db"
        ));
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Internal server error");
        assert!(!json["error"].as_str().unwrap().contains("secret"));
    }

    #[test]
    fn constraint_violation_maps_to_bad_request() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        let conflict = db.create_link("no-such-caregiver", "no-such-elder", now);
        let err = ApiError::from(conflict.unwrap_err());
        assert!(matches!(err, ApiError::BadRequest(_)), "{err:?}");
    }

    #[tokio::test]
    async fn bearer_scheme_is_case_insensitive() {
        let app = test_app();
        let (token, _) = app.signup("rose@example.com", "elderly_user").await;

        for value in [format!("bearer {token}"), format!("BEARER  {token} ")] {
            let (status, json) = app
                .send(
                    axum::http::Request::get("/api/me")
                        .header("Authorization", value)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await;
            assert_eq!(status, StatusCode::OK, "{json}");
            assert_eq!(json["user"]["email"], "rose@example.com");
        }

        let (status, _) = app
            .send(
                axum::http::Request::get("/api/me")
                    .header("Authorization", format!("Basic {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn bearer_token_parsing() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer abc"), Some("abc"));
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("Bearerabc"), None);
        assert_eq!(bearer_token("Token abc"), None);
    }

    #[tokio::test]
    async fn wrongly_typed_field_returns_json_400() {
        let app = test_app();
        let (token, _) = app.signup("rose@example.com", "elderly_user").await;

        let (status, json) = app
            .json(
                "POST",
                "/api/medications",
                Some(&token),
                &json!({
                    "name": "Metformin",
                    "dosage": "500mg",
                    "time": "08:00",
                    "total_stock": "ten",
                }),
            )
            .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("total_stock"), "{json}");
    }

    #[tokio::test]
    async fn malformed_json_returns_json_400() {
        let app = test_app();
        let (token, _) = app.signup("rose@example.com", "elderly_user").await;

        let (status, json) = app
            .send(
                axum::http::Request::post("/api/checkin")
                    .header("Authorization", format!("Bearer {token}"))
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("JSON"), "{json}");

        // Missing content type is reported the same way
        let (status, json) = app
            .send(
                axum::http::Request::post("/api/checkin")
                    .header("Authorization", format!("Bearer {token}"))
                    .body(Body::from(r#"{"transcript":"hello"}"#))
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].is_string(), "{json}");
    }

    #[tokio::test]
    async fn malformed_query_returns_json_400() {
        let app = test_app();
        let (token, _) = app.signup("rose@example.com", "elderly_user").await;

        let (status, json) = app.get("/api/checkin?limit=abc", &token).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("limit"), "{json}");
    }

    #[tokio::test]
    async fn malformed_multipart_returns_json_400() {
        let app = test_app();
        let (token, _) = app.signup("rose@example.com", "elderly_user").await;

        let (status, json) = app
            .json("POST", "/api/messages", Some(&token), &json!({}))
            .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].is_string(), "{json}");
    }

    #[tokio::test]
    async fn signup_then_me() {
        let app = test_app();
        let (token, user_id) = app.signup("Rose@Example.com", "elderly_user").await;

        let (status, json) = app.get("/api/me", &token).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["user"]["id"], user_id.as_str());
        assert_eq!(json["user"]["email"], "rose@example.com");
        assert_eq!(json["user"]["role"], "elderly_user");
        assert!(json["user"].get("password_hash").is_none());
    }

    #[tokio::test]
    async fn signup_duplicate_email_returns_400() {
        let app = test_app();
        app.signup("rose@example.com", "elderly_user").await;

        let (status, json) = app
            .json(
                "POST",
                "/api/auth/signup",
                None,
                &json!({
                    "email": "ROSE@example.com",
                    "password": "another one",
                    "role": "caregiver",
                }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("already exists"));
    }

    #[tokio::test]
    async fn signup_validation_names_the_field() {
        let app = test_app();

        let (status, json) = app
            .json(
                "POST",
                "/api/auth/signup",
                None,
                &json!({ "email": "rose@example.com", "role": "elderly_user" }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "password is required");

        let (status, json) = app
            .json(
                "POST",
                "/api/auth/signup",
                None,
                &json!({ "email": "rose@example.com", "password": "secret123", "role": "nurse" }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("Invalid role"));

        let (status, json) = app
            .json(
                "POST",
                "/api/auth/signup",
                None,
                &json!({ "email": "rose@example.com", "password": "abc", "role": "caregiver" }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("password"));
    }

    #[tokio::test]
    async fn signin_checks_password() {
        let app = test_app();
        app.signup("rose@example.com", "elderly_user").await;

        let (status, json) = app
            .json(
                "POST",
                "/api/auth/signin",
                None,
                &json!({ "email": "rose@example.com", "password": "wrong password" }),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"], "Invalid email or password");

        let (status, json) = app
            .json(
                "POST",
                "/api/auth/signin",
                None,
                &json!({ "email": "rose@example.com", "password": "correct horse" }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let token = json["token"].as_str().unwrap();
        let (status, _) = app.get("/api/me", token).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn signout_revokes_session() {
        let app = test_app();
        let (token, _) = app.signup("rose@example.com", "elderly_user").await;

        let (status, _) = app
            .json("POST", "/api/auth/signout", Some(&token), &json!({}))
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = app.get("/api/me", &token).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn checkin_runs_analysis() {
        let app = test_app();
        let (token, user_id) = app.signup("rose@example.com", "elderly_user").await;

        let (status, json) = app
            .json(
                "POST",
                "/api/checkin",
                Some(&token),
                &json!({ "transcript": "Feeling good today, just a little TIRED" }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["checkin"]["user_id"], user_id.as_str());
        assert_eq!(json["checkin"]["mood"], "good");
        assert_eq!(json["checkin"]["detected_keywords"], json!(["tired"]));

        let (status, json) = app.get("/api/checkin", &token).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["checkins"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn checkin_requires_transcript() {
        let app = test_app();
        let (token, _) = app.signup("rose@example.com", "elderly_user").await;

        let (status, json) = app
            .json(
                "POST",
                "/api/checkin",
                Some(&token),
                &json!({ "transcript": "   " }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "transcript is required");

        let (status, _) = app.get("/api/checkin?limit=0", &token).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unlinked_caregiver_is_forbidden() {
        let app = test_app();
        let (_, elder_id) = app.signup("rose@example.com", "elderly_user").await;
        let (carer, _) = app.signup("sam@example.com", "caregiver").await;

        let paths = [
            format!("/api/checkin?user_id={elder_id}"),
            format!("/api/summary?user_id={elder_id}"),
            format!("/api/medications?user_id={elder_id}"),
            format!("/api/medications/log?user_id={elder_id}"),
            format!("/api/medications/adherence?user_id={elder_id}"),
        ];
        for path in &paths {
            let (status, json) = app.get(path, &carer).await;
            assert_eq!(status, StatusCode::FORBIDDEN, "{path}");
            assert_eq!(json["error"], NOT_AUTHORIZED);
        }
        let (status, _) = app
            .json(
                "POST",
                "/api/summary",
                Some(&carer),
                &json!({ "user_id": elder_id }),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        app.link(&carer, "rose@example.com").await;
        for path in &paths {
            let (status, _) = app.get(path, &carer).await;
            assert_eq!(status, StatusCode::OK, "{path}");
        }
    }

    #[tokio::test]
    async fn taken_dose_decrements_stock_and_raises_alert() {
        let app = test_app();
        let (elder, elder_id) = app.signup("rose@example.com", "elderly_user").await;
        let (carer, _) = app.signup("sam@example.com", "caregiver").await;
        app.link(&carer, "rose@example.com").await;
        let med_id = app.add_medication(&elder, 6).await;

        let json = app.log_dose(&elder, &med_id, "taken").await;
        assert_eq!(json["remaining_stock"], 5);
        assert_eq!(json["log"]["status"], "taken");
        assert_eq!(
            json["stock_alert"]["message"],
            "Low stock alert: Metformin has only 5 doses remaining"
        );

        // Skips leave stock alone
        let json = app.log_dose(&elder, &med_id, "skipped").await;
        assert!(json["remaining_stock"].is_null());
        assert!(json["stock_alert"].is_null());

        let (status, json) = app
            .get(&format!("/api/medications?user_id={elder_id}"), &carer)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["medications"][0]["total_stock"], 5);

        let (_, json) = app
            .get(
                &format!("/api/medications/log?user_id={elder_id}&medication_id={med_id}"),
                &carer,
            )
            .await;
        let logs = json["logs"].as_array().unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0]["status"], "skipped");
    }

    #[tokio::test]
    async fn log_rejects_foreign_medication_and_bad_status() {
        let app = test_app();
        let (elder, _) = app.signup("rose@example.com", "elderly_user").await;
        let (other, _) = app.signup("ada@example.com", "elderly_user").await;
        let med_id = app.add_medication(&elder, 10).await;

        let (status, json) = app
            .json(
                "POST",
                "/api/medications/log",
                Some(&other),
                &json!({ "medication_id": med_id, "status": "taken", "scheduled_time": "08:00" }),
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "Medication not found");

        let (status, json) = app
            .json(
                "POST",
                "/api/medications/log",
                Some(&elder),
                &json!({ "medication_id": med_id, "status": "forgot", "scheduled_time": "08:00" }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("Invalid status"));

        let (status, json) = app
            .json(
                "POST",
                "/api/medications/log",
                Some(&elder),
                &json!({ "medication_id": med_id, "status": "taken" }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "scheduled_time is required");
    }

    #[tokio::test]
    async fn medication_update_and_soft_delete() {
        let app = test_app();
        let (elder, _) = app.signup("rose@example.com", "elderly_user").await;
        let (other, _) = app.signup("ada@example.com", "elderly_user").await;
        let med_id = app.add_medication(&elder, 10).await;
        let uri = format!("/api/medications/{med_id}");

        let (status, _) = app.json("PATCH", &uri, Some(&elder), &json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = app
            .json("PATCH", &uri, Some(&elder), &json!({ "time": "25:99" }))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = app
            .json("PATCH", &uri, Some(&other), &json!({ "total_stock": 1 }))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, json) = app
            .json(
                "PATCH",
                &uri,
                Some(&elder),
                &json!({ "total_stock": 30, "dosage": "850mg" }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["medication"]["total_stock"], 30);
        assert_eq!(json["medication"]["dosage"], "850mg");
        assert_eq!(json["medication"]["name"], "Metformin");

        let (status, _) = app.json("DELETE", &uri, Some(&elder), &json!({})).await;
        assert_eq!(status, StatusCode::OK);
        let (_, json) = app.get("/api/medications", &elder).await;
        assert!(json["medications"].as_array().unwrap().is_empty());

        let (status, _) = app.json("DELETE", &uri, Some(&elder), &json!({})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = app
            .json("DELETE", "/api/medications/missing", Some(&elder), &json!({}))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn adherence_report_counts_statuses() {
        let app = test_app();
        let (elder, elder_id) = app.signup("rose@example.com", "elderly_user").await;
        let med_id = app.add_medication(&elder, 10).await;
        app.log_dose(&elder, &med_id, "taken").await;
        app.log_dose(&elder, &med_id, "skipped").await;

        let (status, json) = app.get("/api/medications/adherence", &elder).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["user_id"], elder_id.as_str());
        assert_eq!(json["period"], "week");
        assert_eq!(json["overall"]["total"], 2);
        assert_eq!(json["overall"]["taken"], 1);
        assert_eq!(json["overall"]["adherence_rate"], "50.0");
        assert_eq!(json["by_medication"][0]["medication"]["name"], "Metformin");
        assert_eq!(json["recent_logs"].as_array().unwrap().len(), 2);

        let (status, json) = app
            .get("/api/medications/adherence?period=month", &elder)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["period"], "month");

        let (status, _) = app
            .get("/api/medications/adherence?period=year", &elder)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn summary_upsert_overwrites() {
        let app = test_app();
        let (elder, _) = app.signup("rose@example.com", "elderly_user").await;
        app.json(
            "POST",
            "/api/checkin",
            Some(&elder),
            &json!({ "transcript": "Awful night, bad cough" }),
        )
        .await;

        let (status, json) = app
            .json("POST", "/api/summary", Some(&elder), &json!({}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["summary"]["total_checkins"], 1);
        assert_eq!(json["summary"]["mood_summary"], "Overall mood: bad");
        assert_eq!(json["summary"]["medication_adherence_rate"], 100.0);

        app.json(
            "POST",
            "/api/checkin",
            Some(&elder),
            &json!({ "transcript": "A bit better now" }),
        )
        .await;
        let (_, json) = app
            .json("POST", "/api/summary", Some(&elder), &json!({}))
            .await;
        assert_eq!(json["summary"]["total_checkins"], 2);

        let (_, json) = app.get("/api/summary", &elder).await;
        let summaries = json["summaries"].as_array().unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0]["total_checkins"], 2);

        let (status, _) = app
            .json(
                "POST",
                "/api/summary",
                Some(&elder),
                &json!({ "date": "06/01/2024" }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn caregiver_alerts_are_ordered_and_resolvable() {
        let app = test_app();
        let (elder, _) = app.signup("rose@example.com", "elderly_user").await;
        let (carer, _) = app.signup("sam@example.com", "caregiver").await;
        app.link(&carer, "rose@example.com").await;
        let med_id = app.add_medication(&elder, 3).await;
        let dose = app.log_dose(&elder, &med_id, "taken").await;
        let alert_id = dose["stock_alert"]["id"].as_str().unwrap().to_string();

        let (status, json) = app.get("/api/alerts", &carer).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["total"], 2);
        let alerts = json["alerts"].as_array().unwrap();
        assert_eq!(alerts[0]["type"], "no_checkin");
        assert_eq!(alerts[0]["severity"], "medium");
        assert_eq!(alerts[1]["type"], "low_stock");
        assert_eq!(alerts[1]["severity"], "warning");

        app.json(
            "POST",
            "/api/checkin",
            Some(&elder),
            &json!({ "transcript": "I fell in the kitchen and my hip is in pain" }),
        )
        .await;
        let (_, json) = app.get("/api/alerts", &carer).await;
        let alerts = json["alerts"].as_array().unwrap();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0]["type"], "health_concern");
        assert_eq!(alerts[0]["severity"], "critical");

        let (status, json) = app
            .json("PATCH", "/api/alerts", Some(&carer), &json!({ "alertId": alert_id }))
            .await;
        assert_eq!(status, StatusCode::OK, "{json}");
        let (_, json) = app.get("/api/alerts", &carer).await;
        assert_eq!(json["total"], 1);
        assert_eq!(json["alerts"][0]["type"], "health_concern");
    }

    #[tokio::test]
    async fn resolve_alert_checks_access() {
        let app = test_app();
        let (elder, _) = app.signup("rose@example.com", "elderly_user").await;
        let (stranger, _) = app.signup("eve@example.com", "caregiver").await;
        let med_id = app.add_medication(&elder, 2).await;
        let dose = app.log_dose(&elder, &med_id, "taken").await;
        let alert_id = dose["stock_alert"]["id"].as_str().unwrap().to_string();

        let (status, _) = app
            .json("PATCH", "/api/alerts", Some(&stranger), &json!({ "alert_id": alert_id }))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = app
            .json("PATCH", "/api/alerts", Some(&elder), &json!({ "alert_id": "missing" }))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, json) = app
            .json("PATCH", "/api/alerts", Some(&elder), &json!({}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "alert_id is required");

        let (status, _) = app
            .json("PATCH", "/api/alerts", Some(&elder), &json!({ "alert_id": alert_id }))
            .await;
        assert_eq!(status, StatusCode::OK);
        let db = app.state.db();
        assert!(db.get_stock_alert(&alert_id).unwrap().unwrap().is_resolved);
    }

    #[tokio::test]
    async fn stock_alerts_listed_until_resolved() {
        let app = test_app();
        let (elder, elder_id) = app.signup("rose@example.com", "elderly_user").await;
        let (carer, _) = app.signup("sam@example.com", "caregiver").await;
        let (stranger, _) = app.signup("eve@example.com", "caregiver").await;
        app.link(&carer, "rose@example.com").await;
        let med_id = app.add_medication(&elder, 3).await;
        let dose = app.log_dose(&elder, &med_id, "taken").await;
        let alert_id = dose["stock_alert"]["id"].as_str().unwrap().to_string();

        let uri = format!("/api/alerts/stock?user_id={elder_id}");
        let (status, json) = app.get(&uri, &carer).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["total"], 1);
        assert_eq!(json["alerts"][0]["id"], alert_id.as_str());
        assert_eq!(json["alerts"][0]["is_resolved"], false);

        let (status, _) = app.get(&uri, &stranger).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = app
            .json("PATCH", "/api/alerts", Some(&carer), &json!({ "alert_id": alert_id }))
            .await;
        assert_eq!(status, StatusCode::OK);

        let (_, json) = app.get("/api/alerts/stock", &elder).await;
        assert_eq!(json["total"], 0);

        let (_, json) = app
            .get("/api/alerts/stock?include_resolved=true", &elder)
            .await;
        assert_eq!(json["total"], 1);
        assert_eq!(json["alerts"][0]["is_resolved"], true);
    }

    #[tokio::test]
    async fn caregiver_link_lifecycle() {
        let app = test_app();
        let (elder, _) = app.signup("rose@example.com", "elderly_user").await;
        let (carer, _) = app.signup("sam@example.com", "caregiver").await;
        app.signup("kim@example.com", "caregiver").await;

        let (status, json) = app
            .json(
                "POST",
                "/api/caregiver/links",
                Some(&elder),
                &json!({ "elderly_user_email": "rose@example.com" }),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json["error"], "Only caregivers can create links");

        // A caregiver account is not a linkable elderly user
        let (status, _) = app
            .json(
                "POST",
                "/api/caregiver/links",
                Some(&carer),
                &json!({ "elderly_user_email": "kim@example.com" }),
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let link_id = app.link(&carer, "rose@example.com").await;
        let (status, json) = app
            .json(
                "POST",
                "/api/caregiver/links",
                Some(&carer),
                &json!({ "elderly_user_email": "rose@example.com" }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "You are already linked to this user");

        let (_, json) = app.get("/api/caregiver/links", &carer).await;
        let links = json["links"].as_array().unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0]["elderly_user"]["email"], "rose@example.com");

        let uri = format!("/api/caregiver/links/{link_id}");
        let (status, _) = app.json("DELETE", &uri, Some(&carer), &json!({})).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = app.json("DELETE", &uri, Some(&carer), &json!({})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (_, json) = app.get("/api/caregiver/links", &carer).await;
        assert!(json["links"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn voice_message_round_trip() {
        let app = test_app();
        let (elder, elder_id) = app.signup("rose@example.com", "elderly_user").await;
        let (carer, _) = app.signup("sam@example.com", "caregiver").await;
        let (stranger, _) = app.signup("eve@example.com", "caregiver").await;
        app.link(&carer, "rose@example.com").await;

        let (status, json) = app
            .send(voice_upload(&carer, &elder_id, b"webm-bytes"))
            .await;
        assert_eq!(status, StatusCode::CREATED, "{json}");
        let message = &json["voice_message"];
        assert_eq!(message["duration_seconds"], 12);
        assert_eq!(message["content_type"], "audio/webm");
        assert_eq!(message["is_read"], false);
        assert!(message.get("storage_key").is_none());
        let id = message["id"].as_str().unwrap().to_string();
        assert_eq!(message["audio_url"], format!("/api/messages/{id}/audio"));

        let (_, json) = app.get("/api/messages", &elder).await;
        let messages = json["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["sender"]["email"], "sam@example.com");

        let response = app
            .router
            .clone()
            .oneshot(
                axum::http::Request::get(format!("/api/messages/{id}/audio"))
                    .header("Authorization", format!("Bearer {elder}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "audio/webm"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"webm-bytes");

        let (status, _) = app
            .get(&format!("/api/messages/{id}/audio"), &stranger)
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let uri = format!("/api/messages/{id}");
        let (status, _) = app
            .json("PATCH", &uri, Some(&carer), &json!({ "is_read": true }))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, json) = app
            .json("PATCH", &uri, Some(&elder), &json!({ "is_read": true }))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["voice_message"]["is_read"], true);
    }

    #[tokio::test]
    async fn voice_message_requires_link() {
        let app = test_app();
        let (_, elder_id) = app.signup("rose@example.com", "elderly_user").await;
        let (stranger, _) = app.signup("eve@example.com", "caregiver").await;

        let (status, _) = app
            .send(voice_upload(&stranger, &elder_id, b"webm-bytes"))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = app
            .send(voice_upload(&stranger, "nobody", b"webm-bytes"))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, json) = app.send(voice_upload(&stranger, &elder_id, b"")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "audio is required");
    }
}
