//! Rule-based transcript analysis and per-day aggregation.
//!
//! Matching is plain case-insensitive substring containment: no stemming and
//! no word boundaries, so "coldness" counts as "cold".

use std::collections::HashSet;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;

use crate::models::{HealthCheckin, LogStatus, MedicationLog, Mood};

pub const HEALTH_KEYWORDS: &[&str] = &[
    "pain",
    "tired",
    "headache",
    "dizzy",
    "fever",
    "sad",
    "anxious",
    "depressed",
    "nausea",
    "cough",
    "cold",
    "weak",
    "sick",
    "hurt",
    "ache",
    "worry",
    "upset",
    "lonely",
    "sleepy",
    "exhausted",
];

pub const POSITIVE_MOOD_TERMS: &[&str] = &[
    "good",
    "great",
    "excellent",
    "fine",
    "well",
    "happy",
    "better",
    "okay",
];

pub const NEGATIVE_MOOD_TERMS: &[&str] = &["bad", "terrible", "awful", "worse", "poor", "sick", "ill"];

/// Health keywords present in the transcript, in vocabulary order.
#[must_use]
pub fn detect_health_keywords(transcript: &str) -> Vec<String> {
    let lower = transcript.to_lowercase();
    HEALTH_KEYWORDS
        .iter()
        .filter(|kw| lower.contains(*kw))
        .map(|kw| (*kw).to_string())
        .collect()
}

fn count_terms(haystack: &str, terms: &[&str]) -> usize {
    terms.iter().filter(|t| haystack.contains(*t)).count()
}

#[must_use]
pub fn analyze_mood(transcript: &str) -> Mood {
    let lower = transcript.to_lowercase();
    let positive = count_terms(&lower, POSITIVE_MOOD_TERMS);
    let negative = count_terms(&lower, NEGATIVE_MOOD_TERMS);
    match positive.cmp(&negative) {
        std::cmp::Ordering::Greater => Mood::Good,
        std::cmp::Ordering::Less => Mood::Bad,
        std::cmp::Ordering::Equal => Mood::Neutral,
    }
}

/// Computed fields of a daily summary, before persistence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DaySummary {
    pub mood: Mood,
    pub mood_summary: String,
    pub symptoms: Vec<String>,
    pub medication_adherence_rate: f64,
    pub total_checkins: i64,
}

/// Most frequent mood label. Ties resolve to the earliest of good, bad, neutral;
/// a day without check-ins is neutral.
#[must_use]
pub fn dominant_mood(checkins: &[HealthCheckin]) -> Mood {
    if checkins.is_empty() {
        return Mood::Neutral;
    }
    let mut best = Mood::ALL[0];
    let mut best_count = 0;
    for mood in Mood::ALL {
        let count = checkins.iter().filter(|c| c.mood == mood).count();
        if count > best_count {
            best = mood;
            best_count = count;
        }
    }
    best
}

/// Percentage of `taken` logs rounded to two decimals, or 100 when nothing was logged.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn daily_adherence_rate(logs: &[MedicationLog]) -> f64 {
    if logs.is_empty() {
        return 100.0;
    }
    let taken = logs.iter().filter(|l| l.status == LogStatus::Taken).count();
    let rate = taken as f64 / logs.len() as f64 * 100.0;
    (rate * 100.0).round() / 100.0
}

#[must_use]
pub fn summarize_day(checkins: &[HealthCheckin], logs: &[MedicationLog]) -> DaySummary {
    let mood = dominant_mood(checkins);

    let mut seen = HashSet::new();
    let symptoms = checkins
        .iter()
        .flat_map(|c| c.detected_keywords.iter())
        .filter(|kw| seen.insert(kw.as_str()))
        .cloned()
        .collect();

    DaySummary {
        mood,
        mood_summary: format!("Overall mood: {mood}"),
        symptoms,
        medication_adherence_rate: daily_adherence_rate(logs),
        total_checkins: i64::try_from(checkins.len()).unwrap_or(i64::MAX),
    }
}

/// Half-open UTC range `[date 00:00, date+1 00:00)`.
#[must_use]
pub fn day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = date.and_time(chrono::NaiveTime::MIN).and_utc();
    (start, start + Duration::days(1))
}
