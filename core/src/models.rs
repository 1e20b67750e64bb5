use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analysis::{analyze_mood, detect_health_keywords};

pub const ROLES: &[&str] = &["elderly_user", "caregiver"];
pub const LOG_STATUSES: &[&str] = &["taken", "later", "skipped"];

pub const DEFAULT_LOW_STOCK_THRESHOLD: i64 = 5;
pub const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    ElderlyUser,
    Caregiver,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ElderlyUser => "elderly_user",
            Self::Caregiver => "caregiver",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "elderly_user" => Ok(Self::ElderlyUser),
            "caregiver" => Ok(Self::Caregiver),
            _ => bail!("Invalid role '{s}'. Must be one of: {}", ROLES.join(", ")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mood {
    Good,
    Bad,
    Neutral,
}

impl Mood {
    /// Tally order; also the tie-break order for the dominant mood of a day.
    pub const ALL: [Mood; 3] = [Mood::Good, Mood::Bad, Mood::Neutral];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Bad => "bad",
            Self::Neutral => "neutral",
        }
    }
}

impl fmt::Display for Mood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mood {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "good" => Ok(Self::Good),
            "bad" => Ok(Self::Bad),
            "neutral" => Ok(Self::Neutral),
            _ => bail!("Invalid mood '{s}'"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Taken,
    Later,
    Skipped,
}

impl LogStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Taken => "taken",
            Self::Later => "later",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "taken" => Ok(Self::Taken),
            "later" => Ok(Self::Later),
            "skipped" => Ok(Self::Skipped),
            _ => bail!(
                "Invalid status '{s}'. Must be one of: {}",
                LOG_STATUSES.join(", ")
            ),
        }
    }
}

// --- Accounts ---

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub role: Role,
    pub full_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    #[must_use]
    pub fn to_ref(&self) -> UserRef {
        UserRef {
            id: self.id.clone(),
            email: self.email.clone(),
            full_name: self.full_name.clone(),
        }
    }
}

/// Compact user identity embedded in alerts, links and messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: String,
    pub email: String,
    pub full_name: Option<String>,
}

impl UserRef {
    /// Full name when set, email otherwise.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.full_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&self.email)
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password: String,
    pub role: Role,
    pub full_name: Option<String>,
}

/// A freshly issued bearer session. The plaintext token is only ever held here.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedSession {
    pub token: String,
    pub user: User,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaregiverLink {
    pub id: String,
    pub caregiver_id: String,
    pub elderly_user_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkedElder {
    #[serde(flatten)]
    pub link: CaregiverLink,
    pub elderly_user: UserRef,
}

// --- Check-ins ---

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckin {
    pub id: String,
    pub user_id: String,
    pub transcript: String,
    pub detected_keywords: Vec<String>,
    pub mood: Mood,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCheckin {
    pub user_id: String,
    pub transcript: String,
    pub detected_keywords: Vec<String>,
    pub mood: Mood,
}

impl NewCheckin {
    /// Run keyword detection and mood classification over a raw transcript.
    #[must_use]
    pub fn analyze(user_id: &str, transcript: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            transcript: transcript.to_string(),
            detected_keywords: detect_health_keywords(transcript),
            mood: analyze_mood(transcript),
        }
    }
}

// --- Medications ---

#[derive(Debug, Clone, Serialize)]
pub struct Medication {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub dosage: String,
    pub time: String,
    pub total_stock: i64,
    pub low_stock_threshold: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MedicationRef {
    pub id: String,
    pub name: String,
    pub dosage: String,
}

#[derive(Debug, Clone)]
pub struct NewMedication {
    pub user_id: String,
    pub name: String,
    pub dosage: String,
    pub time: String,
    pub total_stock: i64,
    pub low_stock_threshold: i64,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateMedication {
    pub name: Option<String>,
    pub dosage: Option<String>,
    pub time: Option<String>,
    pub total_stock: Option<i64>,
    pub low_stock_threshold: Option<i64>,
    pub is_active: Option<bool>,
}

impl UpdateMedication {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.dosage.is_none()
            && self.time.is_none()
            && self.total_stock.is_none()
            && self.low_stock_threshold.is_none()
            && self.is_active.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MedicationLog {
    pub id: String,
    pub medication_id: String,
    pub user_id: String,
    pub status: LogStatus,
    pub scheduled_time: String,
    pub logged_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMedicationLog {
    pub medication_id: String,
    pub user_id: String,
    pub status: LogStatus,
    pub scheduled_time: String,
}

/// Outcome of recording one adherence event.
#[derive(Debug, Clone, Serialize)]
pub struct LoggedDose {
    pub log: MedicationLog,
    /// Stock after the decrement; `None` unless a decrement happened.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_stock: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stock_alert: Option<StockAlert>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StockAlert {
    pub id: String,
    pub medication_id: String,
    pub user_id: String,
    pub message: String,
    pub is_resolved: bool,
    pub created_at: DateTime<Utc>,
}

/// A stock alert is raised while some doses remain but no more than the threshold.
/// Running out entirely (stock 0) deliberately raises nothing.
#[must_use]
pub fn should_raise_stock_alert(remaining_stock: i64, low_stock_threshold: i64) -> bool {
    remaining_stock > 0 && remaining_stock <= low_stock_threshold
}

#[must_use]
pub fn low_stock_message(medication_name: &str, remaining_stock: i64) -> String {
    format!("Low stock alert: {medication_name} has only {remaining_stock} doses remaining")
}

// --- Summaries ---

#[derive(Debug, Clone, Serialize)]
pub struct DailySummary {
    pub id: String,
    pub user_id: String,
    pub date: NaiveDate,
    pub mood_summary: String,
    pub symptoms: Vec<String>,
    pub medication_adherence_rate: f64,
    pub total_checkins: i64,
    pub created_at: DateTime<Utc>,
}

// --- Voice messages ---

#[derive(Debug, Clone, Serialize)]
pub struct VoiceMessage {
    pub id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub audio_url: String,
    pub content_type: String,
    #[serde(skip)]
    pub storage_key: String,
    pub duration_seconds: Option<i64>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoiceMessageDetail {
    #[serde(flatten)]
    pub message: VoiceMessage,
    pub sender: UserRef,
    pub recipient: UserRef,
}

#[derive(Debug, Clone)]
pub struct NewVoiceMessage {
    pub sender_id: String,
    pub recipient_id: String,
    pub content_type: String,
    pub storage_key: String,
    pub duration_seconds: Option<i64>,
}

// --- Validation ---

pub fn validate_email(email: &str) -> Result<String> {
    let email = email.trim().to_lowercase();
    let Some((local, domain)) = email.split_once('@') else {
        bail!("Invalid email '{email}'");
    };
    if local.is_empty() || domain.is_empty() || !domain.contains('.') {
        bail!("Invalid email '{email}'");
    }
    Ok(email)
}

pub fn validate_password(password: &str) -> Result<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        bail!("password must be at least {MIN_PASSWORD_LEN} characters");
    }
    Ok(())
}

/// Medication times are wall-clock `HH:MM`.
pub fn validate_medication_time(time: &str) -> Result<String> {
    let parsed = NaiveTime::parse_from_str(time.trim(), "%H:%M")
        .map_err(|_| anyhow::anyhow!("Invalid time '{time}'. Use HH:MM"))?;
    Ok(parsed.format("%H:%M").to_string())
}

pub fn validate_new_medication(med: &NewMedication) -> Result<()> {
    if med.name.trim().is_empty() {
        bail!("name must not be empty");
    }
    if med.dosage.trim().is_empty() {
        bail!("dosage must not be empty");
    }
    validate_medication_time(&med.time)?;
    if med.total_stock < 0 {
        bail!("total_stock must not be negative");
    }
    if med.low_stock_threshold < 0 {
        bail!("low_stock_threshold must not be negative");
    }
    Ok(())
}

pub fn validate_medication_update(update: &UpdateMedication) -> Result<()> {
    if update.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
        bail!("name must not be empty");
    }
    if update.dosage.as_deref().is_some_and(|d| d.trim().is_empty()) {
        bail!("dosage must not be empty");
    }
    if let Some(time) = &update.time {
        validate_medication_time(time)?;
    }
    if update.total_stock.is_some_and(|s| s < 0) {
        bail!("total_stock must not be negative");
    }
    if update.low_stock_threshold.is_some_and(|t| t < 0) {
        bail!("low_stock_threshold must not be negative");
    }
    Ok(())
}
