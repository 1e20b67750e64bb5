//! Caregiver alert aggregation.
//!
//! The database layer gathers raw rows for the caregiver's linked users into
//! [`AlertSources`]; [`aggregate_alerts`] turns them into one ordered list.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::models::{HealthCheckin, LogStatus, MedicationLog, MedicationRef, StockAlert, UserRef};

pub const CONCERNING_KEYWORDS: &[&str] = &[
    "pain",
    "dizzy",
    "chest pain",
    "emergency",
    "hospital",
    "fell",
    "bleeding",
];

pub const SKIP_WINDOW_DAYS: i64 = 7;
pub const SKIP_ALERT_MIN_COUNT: i64 = 3;
pub const CONCERN_WINDOW_DAYS: i64 = 3;
pub const MISSED_CHECKIN_DAYS: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Warning,
}

impl Severity {
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Warning => 3,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Warning => "warning",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    LowStock,
    MedicationSkipped,
    HealthConcern,
    NoCheckin,
}

impl AlertKind {
    #[must_use]
    pub fn severity(self) -> Severity {
        match self {
            Self::HealthConcern => Severity::Critical,
            Self::MedicationSkipped => Severity::High,
            Self::NoCheckin => Severity::Medium,
            Self::LowStock => Severity::Warning,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LowStock => "low_stock",
            Self::MedicationSkipped => "medication_skipped",
            Self::HealthConcern => "health_concern",
            Self::NoCheckin => "no_checkin",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CaregiverAlert {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub user: UserRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub medication: Option<MedicationRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CaregiverAlert {
    fn new(
        id: String,
        kind: AlertKind,
        message: String,
        user: UserRef,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            kind,
            severity: kind.severity(),
            message,
            user,
            medication: None,
            count: None,
            keywords: None,
            transcript: None,
            created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StockAlertRow {
    pub alert: StockAlert,
    pub user: UserRef,
    pub medication: Option<MedicationRef>,
}

#[derive(Debug, Clone)]
pub struct MedicationLogRow {
    pub log: MedicationLog,
    pub user: UserRef,
    pub medication: MedicationRef,
}

#[derive(Debug, Clone)]
pub struct CheckinRow {
    pub checkin: HealthCheckin,
    pub user: UserRef,
}

#[derive(Debug, Clone)]
pub struct LinkedUser {
    pub user: UserRef,
    pub last_checkin_at: Option<DateTime<Utc>>,
}

/// Raw inputs for one caregiver. Rows may be over-fetched; every time window is
/// re-applied against `now` during aggregation.
#[derive(Debug, Clone, Default)]
pub struct AlertSources {
    pub linked_users: Vec<LinkedUser>,
    pub unresolved_stock_alerts: Vec<StockAlertRow>,
    pub skipped_logs: Vec<MedicationLogRow>,
    pub recent_checkins: Vec<CheckinRow>,
}

fn is_concerning(keywords: &[String]) -> bool {
    keywords
        .iter()
        .any(|kw| CONCERNING_KEYWORDS.contains(&kw.to_lowercase().as_str()))
}

fn low_stock_alerts(rows: &[StockAlertRow], out: &mut Vec<CaregiverAlert>) {
    for row in rows.iter().filter(|r| !r.alert.is_resolved) {
        let mut alert = CaregiverAlert::new(
            row.alert.id.clone(),
            AlertKind::LowStock,
            row.alert.message.clone(),
            row.user.clone(),
            row.alert.created_at,
        );
        alert.medication.clone_from(&row.medication);
        out.push(alert);
    }
}

fn skipped_alerts(rows: &[MedicationLogRow], now: DateTime<Utc>, out: &mut Vec<CaregiverAlert>) {
    let since = now - Duration::days(SKIP_WINDOW_DAYS);
    let mut order: Vec<(String, String)> = Vec::new();
    let mut groups: HashMap<(String, String), Vec<&MedicationLogRow>> = HashMap::new();
    for row in rows
        .iter()
        .filter(|r| r.log.status == LogStatus::Skipped && r.log.logged_at >= since)
    {
        let key = (row.log.user_id.clone(), row.log.medication_id.clone());
        let group = groups.entry(key.clone()).or_default();
        if group.is_empty() {
            order.push(key);
        }
        group.push(row);
    }

    for key in order {
        let Some(group) = groups.get(&key) else {
            continue;
        };
        let count = i64::try_from(group.len()).unwrap_or(i64::MAX);
        if count < SKIP_ALERT_MIN_COUNT {
            continue;
        }
        let Some(newest) = group.iter().max_by_key(|r| r.log.logged_at) else {
            continue;
        };
        let (user_id, medication_id) = key;
        let mut alert = CaregiverAlert::new(
            format!("skipped-{user_id}-{medication_id}"),
            AlertKind::MedicationSkipped,
            format!(
                "{} has skipped {} {count} times in the last {SKIP_WINDOW_DAYS} days",
                newest.user.display_name(),
                newest.medication.name
            ),
            newest.user.clone(),
            newest.log.logged_at,
        );
        alert.medication = Some(newest.medication.clone());
        alert.count = Some(count);
        out.push(alert);
    }
}

fn concern_alerts(rows: &[CheckinRow], now: DateTime<Utc>, out: &mut Vec<CaregiverAlert>) {
    let since = now - Duration::days(CONCERN_WINDOW_DAYS);
    for row in rows.iter().filter(|r| r.checkin.created_at >= since) {
        let checkin = &row.checkin;
        if !is_concerning(&checkin.detected_keywords) {
            continue;
        }
        let mut alert = CaregiverAlert::new(
            format!("health-{}", checkin.id),
            AlertKind::HealthConcern,
            format!(
                "{} reported concerning symptoms: {}",
                row.user.display_name(),
                checkin.detected_keywords.join(", ")
            ),
            row.user.clone(),
            checkin.created_at,
        );
        alert.keywords = Some(checkin.detected_keywords.clone());
        alert.transcript = Some(checkin.transcript.clone());
        out.push(alert);
    }
}

fn missed_checkin_alerts(users: &[LinkedUser], now: DateTime<Utc>, out: &mut Vec<CaregiverAlert>) {
    let since = now - Duration::days(MISSED_CHECKIN_DAYS);
    for linked in users {
        if linked.last_checkin_at.is_some_and(|at| at >= since) {
            continue;
        }
        out.push(CaregiverAlert::new(
            format!("no-checkin-{}", linked.user.id),
            AlertKind::NoCheckin,
            format!(
                "{} hasn't checked in for {MISSED_CHECKIN_DAYS}+ days",
                linked.user.display_name()
            ),
            linked.user.clone(),
            since,
        ));
    }
}

/// Severity rank first, then newest first, then id.
#[must_use]
pub fn compare_alerts(a: &CaregiverAlert, b: &CaregiverAlert) -> Ordering {
    a.severity
        .rank()
        .cmp(&b.severity.rank())
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

#[must_use]
pub fn aggregate_alerts(sources: &AlertSources, now: DateTime<Utc>) -> Vec<CaregiverAlert> {
    let mut alerts = Vec::new();
    low_stock_alerts(&sources.unresolved_stock_alerts, &mut alerts);
    skipped_alerts(&sources.skipped_logs, now, &mut alerts);
    concern_alerts(&sources.recent_checkins, now, &mut alerts);
    missed_checkin_alerts(&sources.linked_users, now, &mut alerts);
    alerts.sort_by(compare_alerts);
    alerts
}
