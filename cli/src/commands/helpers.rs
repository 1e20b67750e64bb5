use anyhow::{Context, Result, bail};
use chrono::{NaiveDate, Utc};
use std::io::{self, BufRead, Write};

use careconnect_core::db::Database;
use careconnect_core::models::User;

/// Dates are UTC calendar days, matching how summaries bucket check-ins.
pub(crate) fn parse_date(date_str: Option<String>) -> Result<NaiveDate> {
    let today = Utc::now().date_naive();
    match date_str {
        None => Ok(today),
        Some(s) => match s.as_str() {
            "today" => Ok(today),
            "yesterday" => Ok(today - chrono::Duration::days(1)),
            _ => NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                .with_context(|| format!("Invalid date '{s}'. Use YYYY-MM-DD or today/yesterday")),
        },
    }
}

pub(crate) fn find_user(db: &Database, email: &str) -> Result<User> {
    match db.get_user_by_email(email)? {
        Some(user) => Ok(user),
        None => bail!("No user with email '{email}'"),
    }
}

pub(crate) fn prompt_line(prompt: &str) -> Result<String> {
    eprint!("{prompt}");
    io::stderr().flush()?;
    let stdin = io::stdin();
    let line = stdin.lock().lines().next().context("No input")??;
    Ok(line.trim().to_string())
}

pub(crate) fn display_name(user: &User) -> String {
    user.full_name.clone().unwrap_or_default()
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}
