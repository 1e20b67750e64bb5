use std::collections::HashMap;
use std::path::Path;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior, params};
use uuid::Uuid;

use crate::adherence::{AdherenceReport, Period, PeriodWindow, build_report};
use crate::alerts::{
    AlertSources, CONCERN_WINDOW_DAYS, CaregiverAlert, CheckinRow, LinkedUser, MedicationLogRow,
    SKIP_WINDOW_DAYS, StockAlertRow, aggregate_alerts,
};
use crate::analysis::{day_bounds, summarize_day};
use crate::auth::{DEFAULT_PBKDF2_ROUNDS, generate_token, hash_password, hash_token, verify_password};
use crate::models::{
    CaregiverLink, DailySummary, HealthCheckin, IssuedSession, LinkedElder, LogStatus, LoggedDose,
    Medication, MedicationLog, MedicationRef, NewCheckin, NewMedication, NewMedicationLog, NewUser,
    NewVoiceMessage, StockAlert, UpdateMedication, User, UserRef, VoiceMessage, VoiceMessageDetail,
    low_stock_message, should_raise_stock_alert, validate_email, validate_medication_time,
    validate_password,
};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";
const BUSY_TIMEOUT: StdDuration = StdDuration::from_secs(5);

/// Fixed-width UTC timestamp; lexicographic order equals time order.
#[must_use]
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Message of a SQLite constraint violation anywhere in the error chain.
#[must_use]
pub fn constraint_violation(err: &anyhow::Error) -> Option<String> {
    err.chain().find_map(|cause| match cause.downcast_ref::<rusqlite::Error>() {
        Some(rusqlite::Error::SqliteFailure(e, msg)) if e.code == ErrorCode::ConstraintViolation => {
            Some(msg.clone().unwrap_or_else(|| e.to_string()))
        }
        _ => None,
    })
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn get_timestamp(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn get_parsed<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = anyhow::Error>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: anyhow::Error| conversion_error(idx, e))
}

fn get_string_list(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Vec<String>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn audio_url(message_id: &str) -> String {
    format!("/api/messages/{message_id}/audio")
}

const USER_COLUMNS: &str = "id, email, role, full_name, created_at, updated_at";
const CHECKIN_COLUMNS: &str = "id, user_id, transcript, detected_keywords, mood, created_at";
const MEDICATION_COLUMNS: &str = "id, user_id, name, dosage, time, total_stock, low_stock_threshold, is_active, created_at, updated_at";
const LOG_COLUMNS: &str = "id, medication_id, user_id, status, scheduled_time, logged_at";
const SUMMARY_COLUMNS: &str = "id, user_id, date, mood_summary, symptoms, medication_adherence_rate, total_checkins, created_at";
const MESSAGE_COLUMNS: &str = "id, sender_id, recipient_id, content_type, storage_key, duration_seconds, is_read, created_at";

pub struct Database {
    conn: Connection,
    password_rounds: u32,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        let db = Database {
            conn,
            password_rounds: DEFAULT_PBKDF2_ROUNDS,
        };
        db.configure()?;
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database {
            conn,
            password_rounds: DEFAULT_PBKDF2_ROUNDS,
        };
        db.configure()?;
        db.migrate()?;
        Ok(db)
    }

    /// PBKDF2 rounds used for passwords hashed by this handle.
    #[must_use]
    pub fn with_password_rounds(mut self, rounds: u32) -> Self {
        self.password_rounds = rounds;
        self
    }

    fn configure(&self) -> Result<()> {
        self.conn.busy_timeout(BUSY_TIMEOUT)?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS users (
                    id TEXT PRIMARY KEY,
                    email TEXT NOT NULL UNIQUE,
                    password_hash TEXT NOT NULL,
                    role TEXT NOT NULL CHECK (role IN ('elderly_user', 'caregiver')),
                    full_name TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS sessions (
                    token_hash TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    created_at TEXT NOT NULL,
                    expires_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS caregiver_links (
                    id TEXT PRIMARY KEY,
                    caregiver_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    elderly_user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    created_at TEXT NOT NULL,
                    UNIQUE (caregiver_id, elderly_user_id)
                );

                CREATE TABLE IF NOT EXISTS health_checkins (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    transcript TEXT NOT NULL,
                    detected_keywords TEXT NOT NULL DEFAULT '[]',
                    mood TEXT NOT NULL CHECK (mood IN ('good', 'bad', 'neutral')),
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS medications (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    dosage TEXT NOT NULL,
                    time TEXT NOT NULL,
                    total_stock INTEGER NOT NULL CHECK (total_stock >= 0),
                    low_stock_threshold INTEGER NOT NULL DEFAULT 5 CHECK (low_stock_threshold >= 0),
                    is_active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS medication_logs (
                    id TEXT PRIMARY KEY,
                    medication_id TEXT NOT NULL REFERENCES medications(id) ON DELETE CASCADE,
                    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    status TEXT NOT NULL CHECK (status IN ('taken', 'later', 'skipped')),
                    scheduled_time TEXT NOT NULL,
                    logged_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS stock_alerts (
                    id TEXT PRIMARY KEY,
                    medication_id TEXT NOT NULL REFERENCES medications(id) ON DELETE CASCADE,
                    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    message TEXT NOT NULL,
                    is_resolved INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS daily_summaries (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    date TEXT NOT NULL,
                    mood_summary TEXT NOT NULL,
                    symptoms TEXT NOT NULL DEFAULT '[]',
                    medication_adherence_rate REAL NOT NULL,
                    total_checkins INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    UNIQUE (user_id, date)
                );

                CREATE TABLE IF NOT EXISTS voice_messages (
                    id TEXT PRIMARY KEY,
                    sender_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    recipient_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    content_type TEXT NOT NULL,
                    storage_key TEXT NOT NULL,
                    duration_seconds INTEGER,
                    is_read INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
                CREATE INDEX IF NOT EXISTS idx_links_elderly ON caregiver_links(elderly_user_id);
                CREATE INDEX IF NOT EXISTS idx_checkins_user_created ON health_checkins(user_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_medications_user ON medications(user_id);
                CREATE INDEX IF NOT EXISTS idx_logs_user_logged ON medication_logs(user_id, logged_at);
                CREATE INDEX IF NOT EXISTS idx_logs_medication ON medication_logs(medication_id);
                CREATE INDEX IF NOT EXISTS idx_stock_alerts_user ON stock_alerts(user_id, is_resolved);
                CREATE INDEX IF NOT EXISTS idx_messages_sender ON voice_messages(sender_id);
                CREATE INDEX IF NOT EXISTS idx_messages_recipient ON voice_messages(recipient_id);

                PRAGMA user_version = 1;",
            )?;
        }

        Ok(())
    }

    // --- Row mapping helpers ---

    fn user_from_row(row: &rusqlite::Row) -> rusqlite::Result<User> {
        Ok(User {
            id: row.get(0)?,
            email: row.get(1)?,
            role: get_parsed(row, 2)?,
            full_name: row.get(3)?,
            created_at: get_timestamp(row, 4)?,
            updated_at: get_timestamp(row, 5)?,
        })
    }

    fn checkin_from_row(row: &rusqlite::Row) -> rusqlite::Result<HealthCheckin> {
        Ok(HealthCheckin {
            id: row.get(0)?,
            user_id: row.get(1)?,
            transcript: row.get(2)?,
            detected_keywords: get_string_list(row, 3)?,
            mood: get_parsed(row, 4)?,
            created_at: get_timestamp(row, 5)?,
        })
    }

    fn medication_from_row(row: &rusqlite::Row) -> rusqlite::Result<Medication> {
        Ok(Medication {
            id: row.get(0)?,
            user_id: row.get(1)?,
            name: row.get(2)?,
            dosage: row.get(3)?,
            time: row.get(4)?,
            total_stock: row.get(5)?,
            low_stock_threshold: row.get(6)?,
            is_active: row.get(7)?,
            created_at: get_timestamp(row, 8)?,
            updated_at: get_timestamp(row, 9)?,
        })
    }

    fn log_from_row(row: &rusqlite::Row) -> rusqlite::Result<MedicationLog> {
        Ok(MedicationLog {
            id: row.get(0)?,
            medication_id: row.get(1)?,
            user_id: row.get(2)?,
            status: get_parsed(row, 3)?,
            scheduled_time: row.get(4)?,
            logged_at: get_timestamp(row, 5)?,
        })
    }

    fn stock_alert_from_row(row: &rusqlite::Row) -> rusqlite::Result<StockAlert> {
        Ok(StockAlert {
            id: row.get(0)?,
            medication_id: row.get(1)?,
            user_id: row.get(2)?,
            message: row.get(3)?,
            is_resolved: row.get(4)?,
            created_at: get_timestamp(row, 5)?,
        })
    }

    fn summary_from_row(row: &rusqlite::Row) -> rusqlite::Result<DailySummary> {
        let date_str: String = row.get(2)?;
        let date = NaiveDate::parse_from_str(&date_str, "%Y-%m-%d")
            .map_err(|e| conversion_error(2, e))?;
        Ok(DailySummary {
            id: row.get(0)?,
            user_id: row.get(1)?,
            date,
            mood_summary: row.get(3)?,
            symptoms: get_string_list(row, 4)?,
            medication_adherence_rate: row.get(5)?,
            total_checkins: row.get(6)?,
            created_at: get_timestamp(row, 7)?,
        })
    }

    fn message_from_row(row: &rusqlite::Row) -> rusqlite::Result<VoiceMessage> {
        let id: String = row.get(0)?;
        Ok(VoiceMessage {
            audio_url: audio_url(&id),
            id,
            sender_id: row.get(1)?,
            recipient_id: row.get(2)?,
            content_type: row.get(3)?,
            storage_key: row.get(4)?,
            duration_seconds: row.get(5)?,
            is_read: row.get(6)?,
            created_at: get_timestamp(row, 7)?,
        })
    }

    /// Three columns starting at `idx`: id, email, full name.
    fn user_ref_at(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<UserRef> {
        Ok(UserRef {
            id: row.get(idx)?,
            email: row.get(idx + 1)?,
            full_name: row.get(idx + 2)?,
        })
    }

    /// Three columns starting at `idx`: id, name, dosage.
    fn medication_ref_at(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<MedicationRef> {
        Ok(MedicationRef {
            id: row.get(idx)?,
            name: row.get(idx + 1)?,
            dosage: row.get(idx + 2)?,
        })
    }

    // --- Users ---

    pub fn create_user(&self, user: &NewUser, now: DateTime<Utc>) -> Result<User> {
        let email = validate_email(&user.email)?;
        validate_password(&user.password)?;
        let full_name = user
            .full_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty());

        let id = Uuid::new_v4().to_string();
        let ts = format_timestamp(now);
        let password_hash = hash_password(&user.password, self.password_rounds);
        self.conn
            .execute(
                "INSERT INTO users (id, email, password_hash, role, full_name, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![id, email, password_hash, user.role.as_str(), full_name, ts, ts],
            )
            .context("Failed to create user")?;
        tracing::info!(user_id = %id, role = %user.role, "user created");
        self.get_user(&id)?.context("User not found after insert")
    }

    pub fn get_user(&self, id: &str) -> Result<Option<User>> {
        let user = self
            .conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id],
                Self::user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let email = email.trim().to_lowercase();
        let user = self
            .conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
                params![email],
                Self::user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY email"))?;
        let users = stmt
            .query_map([], Self::user_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    /// The user owning `email` when `password` matches, `None` otherwise.
    pub fn authenticate(&self, email: &str, password: &str) -> Result<Option<User>> {
        let Some(user) = self.get_user_by_email(email)? else {
            return Ok(None);
        };
        let stored: String = self.conn.query_row(
            "SELECT password_hash FROM users WHERE id = ?1",
            params![user.id],
            |row| row.get(0),
        )?;
        if verify_password(password, &stored)? {
            Ok(Some(user))
        } else {
            Ok(None)
        }
    }

    // --- Sessions ---

    pub fn create_session(
        &self,
        user_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<IssuedSession> {
        let user = self.get_user(user_id)?.context("User not found")?;
        let purged = self.purge_expired_sessions(now)?;
        if purged > 0 {
            tracing::debug!(purged, "expired sessions removed");
        }

        let token = generate_token();
        let expires_at = now + ttl;
        self.conn.execute(
            "INSERT INTO sessions (token_hash, user_id, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                hash_token(&token),
                user_id,
                format_timestamp(now),
                format_timestamp(expires_at)
            ],
        )?;
        Ok(IssuedSession {
            token,
            user,
            expires_at,
        })
    }

    /// The user behind a live bearer token.
    pub fn user_for_token(&self, token: &str, now: DateTime<Utc>) -> Result<Option<User>> {
        let user = self
            .conn
            .query_row(
                "SELECT u.id, u.email, u.role, u.full_name, u.created_at, u.updated_at
                 FROM sessions s
                 JOIN users u ON u.id = s.user_id
                 WHERE s.token_hash = ?1 AND s.expires_at > ?2",
                params![hash_token(token), format_timestamp(now)],
                Self::user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn revoke_session(&self, token: &str) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM sessions WHERE token_hash = ?1",
            params![hash_token(token)],
        )?;
        Ok(rows > 0)
    }

    pub fn purge_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM sessions WHERE expires_at <= ?1",
            params![format_timestamp(now)],
        )?;
        Ok(rows)
    }

    // --- Caregiver links ---

    pub fn create_link(
        &self,
        caregiver_id: &str,
        elderly_user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CaregiverLink> {
        let id = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO caregiver_links (id, caregiver_id, elderly_user_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, caregiver_id, elderly_user_id, format_timestamp(now)],
        )?;
        tracing::info!(caregiver_id, elderly_user_id, "caregiver link created");
        self.get_link(&id)?.context("Link not found after insert")
    }

    pub fn get_link(&self, id: &str) -> Result<Option<CaregiverLink>> {
        let link = self
            .conn
            .query_row(
                "SELECT id, caregiver_id, elderly_user_id, created_at
                 FROM caregiver_links WHERE id = ?1",
                params![id],
                |row| {
                    Ok(CaregiverLink {
                        id: row.get(0)?,
                        caregiver_id: row.get(1)?,
                        elderly_user_id: row.get(2)?,
                        created_at: get_timestamp(row, 3)?,
                    })
                },
            )
            .optional()?;
        Ok(link)
    }

    /// Whether `caregiver_id` holds a link to `elderly_user_id`.
    pub fn is_linked(&self, caregiver_id: &str, elderly_user_id: &str) -> Result<bool> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM caregiver_links WHERE caregiver_id = ?1 AND elderly_user_id = ?2
             )",
            params![caregiver_id, elderly_user_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Whether a link exists between the two users in either direction.
    pub fn linked_either_way(&self, a: &str, b: &str) -> Result<bool> {
        Ok(self.is_linked(a, b)? || self.is_linked(b, a)?)
    }

    pub fn list_links(&self, caregiver_id: &str) -> Result<Vec<LinkedElder>> {
        let mut stmt = self.conn.prepare(
            "SELECT l.id, l.caregiver_id, l.elderly_user_id, l.created_at,
                    u.id, u.email, u.full_name
             FROM caregiver_links l
             JOIN users u ON u.id = l.elderly_user_id
             WHERE l.caregiver_id = ?1
             ORDER BY l.created_at DESC, l.id",
        )?;
        let links = stmt
            .query_map(params![caregiver_id], |row| {
                Ok(LinkedElder {
                    link: CaregiverLink {
                        id: row.get(0)?,
                        caregiver_id: row.get(1)?,
                        elderly_user_id: row.get(2)?,
                        created_at: get_timestamp(row, 3)?,
                    },
                    elderly_user: Self::user_ref_at(row, 4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(links)
    }

    /// Removes a link owned by `caregiver_id`. Returns false when no such link exists.
    pub fn delete_link(&self, id: &str, caregiver_id: &str) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM caregiver_links WHERE id = ?1 AND caregiver_id = ?2",
            params![id, caregiver_id],
        )?;
        Ok(rows > 0)
    }

    // --- Health check-ins ---

    pub fn insert_checkin(&self, checkin: &NewCheckin, now: DateTime<Utc>) -> Result<HealthCheckin> {
        let id = Uuid::new_v4().to_string();
        let keywords = serde_json::to_string(&checkin.detected_keywords)?;
        self.conn.execute(
            "INSERT INTO health_checkins (id, user_id, transcript, detected_keywords, mood, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                checkin.user_id,
                checkin.transcript,
                keywords,
                checkin.mood.as_str(),
                format_timestamp(now)
            ],
        )?;
        self.get_checkin(&id)?.context("Check-in not found after insert")
    }

    pub fn get_checkin(&self, id: &str) -> Result<Option<HealthCheckin>> {
        let checkin = self
            .conn
            .query_row(
                &format!("SELECT {CHECKIN_COLUMNS} FROM health_checkins WHERE id = ?1"),
                params![id],
                Self::checkin_from_row,
            )
            .optional()?;
        Ok(checkin)
    }

    /// Newest first.
    pub fn list_checkins(&self, user_id: &str, limit: i64) -> Result<Vec<HealthCheckin>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CHECKIN_COLUMNS} FROM health_checkins
             WHERE user_id = ?1
             ORDER BY created_at DESC, id
             LIMIT ?2"
        ))?;
        let checkins = stmt
            .query_map(params![user_id, limit], Self::checkin_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(checkins)
    }

    /// Check-ins in `[start, end)`, oldest first.
    pub fn checkins_between(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HealthCheckin>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CHECKIN_COLUMNS} FROM health_checkins
             WHERE user_id = ?1 AND created_at >= ?2 AND created_at < ?3
             ORDER BY created_at, id"
        ))?;
        let checkins = stmt
            .query_map(
                params![user_id, format_timestamp(start), format_timestamp(end)],
                Self::checkin_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(checkins)
    }

    // --- Medications ---

    pub fn insert_medication(&self, med: &NewMedication, now: DateTime<Utc>) -> Result<Medication> {
        let time = validate_medication_time(&med.time)?;
        let id = Uuid::new_v4().to_string();
        let ts = format_timestamp(now);
        self.conn.execute(
            "INSERT INTO medications (id, user_id, name, dosage, time, total_stock, low_stock_threshold, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?9)",
            params![
                id,
                med.user_id,
                med.name.trim(),
                med.dosage.trim(),
                time,
                med.total_stock,
                med.low_stock_threshold,
                ts,
                ts
            ],
        )?;
        self.get_medication(&id)?
            .context("Medication not found after insert")
    }

    pub fn get_medication(&self, id: &str) -> Result<Option<Medication>> {
        let med = self
            .conn
            .query_row(
                &format!("SELECT {MEDICATION_COLUMNS} FROM medications WHERE id = ?1"),
                params![id],
                Self::medication_from_row,
            )
            .optional()?;
        Ok(med)
    }

    /// Active medications ordered by time of day.
    pub fn list_active_medications(&self, user_id: &str) -> Result<Vec<Medication>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MEDICATION_COLUMNS} FROM medications
             WHERE user_id = ?1 AND is_active = 1
             ORDER BY time, name"
        ))?;
        let meds = stmt
            .query_map(params![user_id], Self::medication_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(meds)
    }

    /// Applies the present fields. Returns `None` when the medication does not exist.
    pub fn update_medication(
        &self,
        id: &str,
        update: &UpdateMedication,
        now: DateTime<Utc>,
    ) -> Result<Option<Medication>> {
        if self.get_medication(id)?.is_none() {
            return Ok(None);
        }
        let time = update
            .time
            .as_deref()
            .map(validate_medication_time)
            .transpose()?;

        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let ts = format_timestamp(now);
        if let Some(name) = &update.name {
            tx.execute(
                "UPDATE medications SET name = ?1, updated_at = ?2 WHERE id = ?3",
                params![name.trim(), ts, id],
            )?;
        }
        if let Some(dosage) = &update.dosage {
            tx.execute(
                "UPDATE medications SET dosage = ?1, updated_at = ?2 WHERE id = ?3",
                params![dosage.trim(), ts, id],
            )?;
        }
        if let Some(time) = &time {
            tx.execute(
                "UPDATE medications SET time = ?1, updated_at = ?2 WHERE id = ?3",
                params![time, ts, id],
            )?;
        }
        if let Some(total_stock) = update.total_stock {
            tx.execute(
                "UPDATE medications SET total_stock = ?1, updated_at = ?2 WHERE id = ?3",
                params![total_stock, ts, id],
            )?;
        }
        if let Some(threshold) = update.low_stock_threshold {
            tx.execute(
                "UPDATE medications SET low_stock_threshold = ?1, updated_at = ?2 WHERE id = ?3",
                params![threshold, ts, id],
            )?;
        }
        if let Some(is_active) = update.is_active {
            tx.execute(
                "UPDATE medications SET is_active = ?1, updated_at = ?2 WHERE id = ?3",
                params![is_active, ts, id],
            )?;
        }
        tx.commit()?;

        self.get_medication(id)
    }

    /// Soft delete. History and stock alerts keep pointing at the row.
    pub fn deactivate_medication(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE medications SET is_active = 0, updated_at = ?1 WHERE id = ?2 AND is_active = 1",
            params![format_timestamp(now), id],
        )?;
        Ok(rows > 0)
    }

    // --- Medication logs ---

    /// Records one adherence event. A `taken` event decrements stock (never below 0) and
    /// raises a stock alert when the remaining count falls within the threshold; all of
    /// it commits or rolls back together.
    pub fn log_medication(&self, entry: &NewMedicationLog, now: DateTime<Utc>) -> Result<LoggedDose> {
        let scheduled_time = entry.scheduled_time.trim();
        if scheduled_time.is_empty() {
            bail!("scheduled_time must not be empty");
        }

        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let (med_name, threshold): (String, i64) = tx
            .query_row(
                "SELECT name, low_stock_threshold FROM medications WHERE id = ?1",
                params![entry.medication_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .context("Medication not found")?;

        let ts = format_timestamp(now);
        let log_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO medication_logs (id, medication_id, user_id, status, scheduled_time, logged_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                log_id,
                entry.medication_id,
                entry.user_id,
                entry.status.as_str(),
                scheduled_time,
                ts
            ],
        )?;

        let mut remaining_stock = None;
        let mut alert_id = None;
        if entry.status == LogStatus::Taken {
            remaining_stock = tx
                .query_row(
                    "UPDATE medications SET total_stock = total_stock - 1, updated_at = ?2
                     WHERE id = ?1 AND total_stock > 0
                     RETURNING total_stock",
                    params![entry.medication_id, ts],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;

            if let Some(remaining) = remaining_stock {
                if should_raise_stock_alert(remaining, threshold) {
                    let id = Uuid::new_v4().to_string();
                    tx.execute(
                        "INSERT INTO stock_alerts (id, medication_id, user_id, message, is_resolved, created_at)
                         VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                        params![
                            id,
                            entry.medication_id,
                            entry.user_id,
                            low_stock_message(&med_name, remaining),
                            ts
                        ],
                    )?;
                    tracing::info!(
                        medication_id = %entry.medication_id,
                        remaining,
                        "low stock alert raised"
                    );
                    alert_id = Some(id);
                }
            } else {
                tracing::debug!(medication_id = %entry.medication_id, "taken with no stock left");
            }
        }
        tx.commit()?;

        let log = self
            .conn
            .query_row(
                &format!("SELECT {LOG_COLUMNS} FROM medication_logs WHERE id = ?1"),
                params![log_id],
                Self::log_from_row,
            )
            .context("Medication log not found after insert")?;
        let stock_alert = match alert_id {
            Some(id) => self.get_stock_alert(&id)?,
            None => None,
        };
        Ok(LoggedDose {
            log,
            remaining_stock,
            stock_alert,
        })
    }

    /// Newest first, optionally narrowed to one medication. `None` means no limit.
    pub fn list_medication_logs(
        &self,
        user_id: &str,
        medication_id: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Vec<MedicationLog>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LOG_COLUMNS} FROM medication_logs
             WHERE user_id = ?1 AND (?2 IS NULL OR medication_id = ?2)
             ORDER BY logged_at DESC, id
             LIMIT ?3"
        ))?;
        let logs = stmt
            .query_map(
                params![user_id, medication_id, limit.unwrap_or(-1)],
                Self::log_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(logs)
    }

    /// Logs in `[start, end)`, oldest first.
    pub fn logs_between(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MedicationLog>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LOG_COLUMNS} FROM medication_logs
             WHERE user_id = ?1 AND logged_at >= ?2 AND logged_at < ?3
             ORDER BY logged_at, id"
        ))?;
        let logs = stmt
            .query_map(
                params![user_id, format_timestamp(start), format_timestamp(end)],
                Self::log_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(logs)
    }

    // --- Stock alerts ---

    pub fn get_stock_alert(&self, id: &str) -> Result<Option<StockAlert>> {
        let alert = self
            .conn
            .query_row(
                "SELECT id, medication_id, user_id, message, is_resolved, created_at
                 FROM stock_alerts WHERE id = ?1",
                params![id],
                Self::stock_alert_from_row,
            )
            .optional()?;
        Ok(alert)
    }

    pub fn list_stock_alerts(&self, user_id: &str, include_resolved: bool) -> Result<Vec<StockAlert>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, medication_id, user_id, message, is_resolved, created_at
             FROM stock_alerts
             WHERE user_id = ?1 AND (?2 OR is_resolved = 0)
             ORDER BY created_at DESC, id",
        )?;
        let alerts = stmt
            .query_map(params![user_id, include_resolved], Self::stock_alert_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(alerts)
    }

    /// Marks the alert resolved. Resolving twice is not an error.
    pub fn resolve_stock_alert(&self, id: &str) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE stock_alerts SET is_resolved = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(rows > 0)
    }

    // --- Daily summaries ---

    /// Aggregates the UTC day's check-ins and logs and replaces any earlier summary
    /// for the same user and date.
    pub fn generate_daily_summary(
        &self,
        user_id: &str,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<DailySummary> {
        let (start, end) = day_bounds(date);
        let checkins = self.checkins_between(user_id, start, end)?;
        let logs = self.logs_between(user_id, start, end)?;
        let day = summarize_day(&checkins, &logs);

        let date_str = date.format("%Y-%m-%d").to_string();
        self.conn.execute(
            "INSERT INTO daily_summaries (id, user_id, date, mood_summary, symptoms, medication_adherence_rate, total_checkins, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(user_id, date) DO UPDATE SET
                mood_summary = excluded.mood_summary,
                symptoms = excluded.symptoms,
                medication_adherence_rate = excluded.medication_adherence_rate,
                total_checkins = excluded.total_checkins,
                created_at = excluded.created_at",
            params![
                Uuid::new_v4().to_string(),
                user_id,
                date_str,
                day.mood_summary,
                serde_json::to_string(&day.symptoms)?,
                day.medication_adherence_rate,
                day.total_checkins,
                format_timestamp(now)
            ],
        )?;
        tracing::info!(user_id, date = %date_str, mood = %day.mood, "daily summary upserted");

        self.get_daily_summary(user_id, date)?
            .context("Daily summary not found after upsert")
    }

    pub fn get_daily_summary(&self, user_id: &str, date: NaiveDate) -> Result<Option<DailySummary>> {
        let summary = self
            .conn
            .query_row(
                &format!(
                    "SELECT {SUMMARY_COLUMNS} FROM daily_summaries WHERE user_id = ?1 AND date = ?2"
                ),
                params![user_id, date.format("%Y-%m-%d").to_string()],
                Self::summary_from_row,
            )
            .optional()?;
        Ok(summary)
    }

    /// Most recent dates first.
    pub fn list_daily_summaries(&self, user_id: &str, limit: i64) -> Result<Vec<DailySummary>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SUMMARY_COLUMNS} FROM daily_summaries
             WHERE user_id = ?1
             ORDER BY date DESC
             LIMIT ?2"
        ))?;
        let summaries = stmt
            .query_map(params![user_id, limit], Self::summary_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(summaries)
    }

    // --- Reports ---

    pub fn build_adherence_report(
        &self,
        user_id: &str,
        period: Period,
        now: DateTime<Utc>,
    ) -> Result<AdherenceReport> {
        let window = PeriodWindow::containing(period, now);
        let logs = self.logs_between(user_id, window.start, window.end)?;

        // Inactive medications still label their history.
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, dosage FROM medications WHERE user_id = ?1")?;
        let meds: HashMap<String, MedicationRef> = stmt
            .query_map(params![user_id], |row| Self::medication_ref_at(row, 0))?
            .map(|r| r.map(|m| (m.id.clone(), m)))
            .collect::<Result<_, _>>()?;

        Ok(build_report(user_id, window, &logs, |id| meds.get(id).cloned()))
    }

    fn alert_sources(&self, caregiver_id: &str, now: DateTime<Utc>) -> Result<AlertSources> {
        let mut stmt = self.conn.prepare(
            "SELECT u.id, u.email, u.full_name,
                    (SELECT MAX(h.created_at) FROM health_checkins h WHERE h.user_id = u.id)
             FROM caregiver_links l
             JOIN users u ON u.id = l.elderly_user_id
             WHERE l.caregiver_id = ?1
             ORDER BY u.email",
        )?;
        let linked_users = stmt
            .query_map(params![caregiver_id], |row| {
                let last: Option<String> = row.get(3)?;
                let last_checkin_at = match last {
                    Some(_) => Some(get_timestamp(row, 3)?),
                    None => None,
                };
                Ok(LinkedUser {
                    user: Self::user_ref_at(row, 0)?,
                    last_checkin_at,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = self.conn.prepare(
            "SELECT a.id, a.medication_id, a.user_id, a.message, a.is_resolved, a.created_at,
                    u.id, u.email, u.full_name,
                    m.id, m.name, m.dosage
             FROM stock_alerts a
             JOIN caregiver_links l ON l.elderly_user_id = a.user_id AND l.caregiver_id = ?1
             JOIN users u ON u.id = a.user_id
             LEFT JOIN medications m ON m.id = a.medication_id
             WHERE a.is_resolved = 0",
        )?;
        let unresolved_stock_alerts = stmt
            .query_map(params![caregiver_id], |row| {
                let med_id: Option<String> = row.get(9)?;
                let medication = match med_id {
                    Some(_) => Some(Self::medication_ref_at(row, 9)?),
                    None => None,
                };
                Ok(StockAlertRow {
                    alert: Self::stock_alert_from_row(row)?,
                    user: Self::user_ref_at(row, 6)?,
                    medication,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = self.conn.prepare(
            "SELECT g.id, g.medication_id, g.user_id, g.status, g.scheduled_time, g.logged_at,
                    u.id, u.email, u.full_name,
                    m.id, m.name, m.dosage
             FROM medication_logs g
             JOIN caregiver_links l ON l.elderly_user_id = g.user_id AND l.caregiver_id = ?1
             JOIN users u ON u.id = g.user_id
             JOIN medications m ON m.id = g.medication_id
             WHERE g.status = 'skipped' AND g.logged_at >= ?2
             ORDER BY g.logged_at DESC, g.id",
        )?;
        let skipped_since = format_timestamp(now - Duration::days(SKIP_WINDOW_DAYS));
        let skipped_logs = stmt
            .query_map(params![caregiver_id, skipped_since], |row| {
                Ok(MedicationLogRow {
                    log: Self::log_from_row(row)?,
                    user: Self::user_ref_at(row, 6)?,
                    medication: Self::medication_ref_at(row, 9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = self.conn.prepare(
            "SELECT h.id, h.user_id, h.transcript, h.detected_keywords, h.mood, h.created_at,
                    u.id, u.email, u.full_name
             FROM health_checkins h
             JOIN caregiver_links l ON l.elderly_user_id = h.user_id AND l.caregiver_id = ?1
             JOIN users u ON u.id = h.user_id
             WHERE h.created_at >= ?2
             ORDER BY h.created_at DESC, h.id",
        )?;
        let checkins_since = format_timestamp(now - Duration::days(CONCERN_WINDOW_DAYS));
        let recent_checkins = stmt
            .query_map(params![caregiver_id, checkins_since], |row| {
                Ok(CheckinRow {
                    checkin: Self::checkin_from_row(row)?,
                    user: Self::user_ref_at(row, 6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(AlertSources {
            linked_users,
            unresolved_stock_alerts,
            skipped_logs,
            recent_checkins,
        })
    }

    /// Alerts across every elderly user linked to `caregiver_id`, most urgent first.
    pub fn build_caregiver_alerts(
        &self,
        caregiver_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<CaregiverAlert>> {
        let sources = self.alert_sources(caregiver_id, now)?;
        Ok(aggregate_alerts(&sources, now))
    }

    // --- Voice messages ---

    pub fn insert_voice_message(
        &self,
        msg: &NewVoiceMessage,
        now: DateTime<Utc>,
    ) -> Result<VoiceMessage> {
        if msg.duration_seconds.is_some_and(|d| d < 0) {
            bail!("duration_seconds must not be negative");
        }
        let id = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO voice_messages (id, sender_id, recipient_id, content_type, storage_key, duration_seconds, is_read, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
            params![
                id,
                msg.sender_id,
                msg.recipient_id,
                msg.content_type,
                msg.storage_key,
                msg.duration_seconds,
                format_timestamp(now)
            ],
        )?;
        self.get_voice_message(&id)?
            .context("Voice message not found after insert")
    }

    pub fn get_voice_message(&self, id: &str) -> Result<Option<VoiceMessage>> {
        let msg = self
            .conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM voice_messages WHERE id = ?1"),
                params![id],
                Self::message_from_row,
            )
            .optional()?;
        Ok(msg)
    }

    /// Messages the user sent or received, newest first.
    pub fn list_voice_messages(&self, user_id: &str) -> Result<Vec<VoiceMessageDetail>> {
        let mut stmt = self.conn.prepare(
            "SELECT m.id, m.sender_id, m.recipient_id, m.content_type, m.storage_key,
                    m.duration_seconds, m.is_read, m.created_at,
                    s.id, s.email, s.full_name,
                    r.id, r.email, r.full_name
             FROM voice_messages m
             JOIN users s ON s.id = m.sender_id
             JOIN users r ON r.id = m.recipient_id
             WHERE m.sender_id = ?1 OR m.recipient_id = ?1
             ORDER BY m.created_at DESC, m.id",
        )?;
        let messages = stmt
            .query_map(params![user_id], |row| {
                Ok(VoiceMessageDetail {
                    message: Self::message_from_row(row)?,
                    sender: Self::user_ref_at(row, 8)?,
                    recipient: Self::user_ref_at(row, 11)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    pub fn set_message_read(&self, id: &str, is_read: bool) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE voice_messages SET is_read = ?1 WHERE id = ?2",
            params![is_read, id],
        )?;
        Ok(rows > 0)
    }
}
