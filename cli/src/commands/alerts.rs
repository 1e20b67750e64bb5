use anyhow::{Result, bail};
use chrono::Utc;
use tabled::{Table, Tabled, settings::Style};

use careconnect_core::db::Database;
use careconnect_core::models::Role;

use super::helpers::{find_user, truncate};

pub(crate) fn cmd_alerts(db: &Database, caregiver_email: &str, json: bool) -> Result<()> {
    let caregiver = find_user(db, caregiver_email)?;
    if caregiver.role != Role::Caregiver {
        bail!("'{caregiver_email}' is not a caregiver");
    }
    let alerts = db.build_caregiver_alerts(&caregiver.id, Utc::now())?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "alerts": alerts,
                "total": alerts.len(),
            }))?
        );
    } else if alerts.is_empty() {
        eprintln!("No alerts for {caregiver_email}.");
    } else {
        #[derive(Tabled)]
        struct AlertRow {
            #[tabled(rename = "Severity")]
            severity: String,
            #[tabled(rename = "Type")]
            kind: String,
            #[tabled(rename = "Who")]
            who: String,
            #[tabled(rename = "Message")]
            message: String,
            #[tabled(rename = "When")]
            when: String,
        }

        let rows: Vec<AlertRow> = alerts
            .iter()
            .map(|a| AlertRow {
                severity: a.severity.as_str().to_uppercase(),
                kind: a.kind.as_str().to_string(),
                who: a.user.display_name().to_string(),
                message: truncate(&a.message, 60),
                when: a.created_at.format("%Y-%m-%d %H:%M").to_string(),
            })
            .collect();
        println!("{}", Table::new(&rows).with(Style::rounded()));
    }
    Ok(())
}
