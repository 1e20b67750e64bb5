use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, Utc};
use serde::Serialize;

use crate::models::{LogStatus, MedicationLog, MedicationRef};

pub const RECENT_LOG_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    #[default]
    Week,
    Month,
}

impl Period {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Week => "week",
            Self::Month => "month",
        }
    }

    /// First day of the period containing `date`, and the first day of the next one.
    /// Weeks start on Sunday.
    #[must_use]
    pub fn date_range(self, date: NaiveDate) -> (NaiveDate, NaiveDate) {
        match self {
            Self::Week => {
                let offset = i64::from(date.weekday().num_days_from_sunday());
                let start = date - Duration::days(offset);
                (start, start + Duration::days(7))
            }
            Self::Month => {
                let start = date.with_day(1).unwrap_or(date);
                (start, start + Months::new(1))
            }
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Period {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            _ => bail!("Invalid period '{s}'. Must be one of: week, month"),
        }
    }
}

/// Resolved reporting window. `end` is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodWindow {
    pub period: Period,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl PeriodWindow {
    #[must_use]
    pub fn containing(period: Period, now: DateTime<Utc>) -> Self {
        let (start, end) = period.date_range(now.date_naive());
        Self {
            period,
            start: start.and_time(chrono::NaiveTime::MIN).and_utc(),
            end: end.and_time(chrono::NaiveTime::MIN).and_utc(),
        }
    }

    #[must_use]
    pub fn start_date(&self) -> NaiveDate {
        self.start.date_naive()
    }

    /// Last calendar day inside the window.
    #[must_use]
    pub fn end_date(&self) -> NaiveDate {
        (self.end - Duration::days(1)).date_naive()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusCounts {
    pub total: i64,
    pub taken: i64,
    pub skipped: i64,
    pub later: i64,
}

impl StatusCounts {
    fn record(&mut self, status: LogStatus) {
        self.total += 1;
        match status {
            LogStatus::Taken => self.taken += 1,
            LogStatus::Skipped => self.skipped += 1,
            LogStatus::Later => self.later += 1,
        }
    }

    /// `taken / total * 100`, or 0 when nothing was logged.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn adherence_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.taken as f64 / self.total as f64 * 100.0
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OverallAdherence {
    #[serde(flatten)]
    pub counts: StatusCounts,
    /// One decimal place, for display.
    pub adherence_rate: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MedicationAdherence {
    pub medication_id: String,
    pub medication: Option<MedicationRef>,
    #[serde(flatten)]
    pub counts: StatusCounts,
    pub adherence_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdherenceReport {
    pub user_id: String,
    pub period: Period,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub overall: OverallAdherence,
    pub by_medication: Vec<MedicationAdherence>,
    pub recent_logs: Vec<MedicationLog>,
}

/// Build the report from every log inside `window`. `lookup` resolves display
/// details for a medication id; logs outside the window are ignored.
pub fn build_report<F>(
    user_id: &str,
    window: PeriodWindow,
    logs: &[MedicationLog],
    lookup: F,
) -> AdherenceReport
where
    F: Fn(&str) -> Option<MedicationRef>,
{
    let mut in_window: Vec<&MedicationLog> = logs
        .iter()
        .filter(|l| l.logged_at >= window.start && l.logged_at < window.end)
        .collect();
    in_window.sort_by(|a, b| b.logged_at.cmp(&a.logged_at));

    let mut overall = StatusCounts::default();
    let mut by_medication: Vec<MedicationAdherence> = Vec::new();
    for log in &in_window {
        overall.record(log.status);
        let idx = if let Some(i) = by_medication
            .iter()
            .position(|m| m.medication_id == log.medication_id)
        {
            i
        } else {
            by_medication.push(MedicationAdherence {
                medication_id: log.medication_id.clone(),
                medication: lookup(&log.medication_id),
                counts: StatusCounts::default(),
                adherence_rate: 0.0,
            });
            by_medication.len() - 1
        };
        by_medication[idx].counts.record(log.status);
    }
    for med in &mut by_medication {
        med.adherence_rate = med.counts.adherence_rate();
    }

    let overall_rate = overall.adherence_rate();
    AdherenceReport {
        user_id: user_id.to_string(),
        period: window.period,
        start_date: window.start_date(),
        end_date: window.end_date(),
        overall: OverallAdherence {
            counts: overall,
            adherence_rate: format!("{overall_rate:.1}"),
        },
        by_medication,
        recent_logs: in_window
            .into_iter()
            .take(RECENT_LOG_LIMIT)
            .cloned()
            .collect(),
    }
}
