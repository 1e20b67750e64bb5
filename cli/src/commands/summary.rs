use anyhow::Result;
use chrono::Utc;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use careconnect_core::db::Database;

use super::helpers::{find_user, parse_date, truncate};

pub(crate) fn cmd_summary_generate(
    db: &Database,
    email: &str,
    date: Option<String>,
    json: bool,
) -> Result<()> {
    let user = find_user(db, email)?;
    let date = parse_date(date)?;
    let summary = db.generate_daily_summary(&user.id, date, Utc::now())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("=== {} on {} ===\n", user.email, summary.date);
    println!("  {}", summary.mood_summary);
    println!("  Check-ins: {}", summary.total_checkins);
    println!(
        "  Medication adherence: {:.2}%",
        summary.medication_adherence_rate
    );
    if summary.symptoms.is_empty() {
        println!("  Symptoms: none reported");
    } else {
        println!("  Symptoms: {}", summary.symptoms.join(", "));
    }
    Ok(())
}

pub(crate) fn cmd_summary_list(db: &Database, email: &str, limit: i64, json: bool) -> Result<()> {
    let user = find_user(db, email)?;
    let summaries = db.list_daily_summaries(&user.id, limit)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    } else if summaries.is_empty() {
        eprintln!(
            "No summaries for {}. Use `careconnect summary generate` first.",
            user.email
        );
    } else {
        #[derive(Tabled)]
        struct SummaryRow {
            #[tabled(rename = "Date")]
            date: String,
            #[tabled(rename = "Mood")]
            mood: String,
            #[tabled(rename = "Check-ins")]
            checkins: i64,
            #[tabled(rename = "Adherence %")]
            adherence: String,
            #[tabled(rename = "Symptoms")]
            symptoms: String,
        }

        let rows: Vec<SummaryRow> = summaries
            .iter()
            .map(|s| SummaryRow {
                date: s.date.format("%Y-%m-%d").to_string(),
                mood: s
                    .mood_summary
                    .trim_start_matches("Overall mood: ")
                    .to_string(),
                checkins: s.total_checkins,
                adherence: format!("{:.2}", s.medication_adherence_rate),
                symptoms: truncate(&s.symptoms.join(", "), 40),
            })
            .collect();

        let table = Table::new(&rows)
            .with(Style::rounded())
            .with(Modify::new(Columns::new(2..4)).with(Alignment::right()))
            .to_string();
        println!("{table}");
    }
    Ok(())
}
