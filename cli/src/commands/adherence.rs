use anyhow::Result;
use chrono::Utc;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use careconnect_core::adherence::Period;
use careconnect_core::db::Database;

use super::helpers::find_user;

pub(crate) fn cmd_adherence(db: &Database, email: &str, period: &str, json: bool) -> Result<()> {
    let period: Period = period.parse()?;
    let user = find_user(db, email)?;
    let report = db.build_adherence_report(&user.id, period, Utc::now())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let overall = &report.overall;
    println!(
        "=== {} adherence, {} to {} ===\n",
        user.email, report.start_date, report.end_date
    );
    println!(
        "  {}% taken ({} taken, {} skipped, {} later, {} total)\n",
        overall.adherence_rate,
        overall.counts.taken,
        overall.counts.skipped,
        overall.counts.later,
        overall.counts.total
    );

    if report.by_medication.is_empty() {
        eprintln!("No medication logs this {period}.");
        return Ok(());
    }

    #[derive(Tabled)]
    struct MedRow {
        #[tabled(rename = "Medication")]
        name: String,
        #[tabled(rename = "Dosage")]
        dosage: String,
        #[tabled(rename = "Taken")]
        taken: i64,
        #[tabled(rename = "Skipped")]
        skipped: i64,
        #[tabled(rename = "Later")]
        later: i64,
        #[tabled(rename = "Rate %")]
        rate: String,
    }

    let rows: Vec<MedRow> = report
        .by_medication
        .iter()
        .map(|m| {
            let (name, dosage) = m.medication.as_ref().map_or_else(
                || (m.medication_id.clone(), String::new()),
                |r| (r.name.clone(), r.dosage.clone()),
            );
            MedRow {
                name,
                dosage,
                taken: m.counts.taken,
                skipped: m.counts.skipped,
                later: m.counts.later,
                rate: format!("{:.1}", m.adherence_rate),
            }
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(2..6)).with(Alignment::right()))
        .to_string();
    println!("{table}");
    Ok(())
}
