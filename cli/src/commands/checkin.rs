use anyhow::{Result, bail};
use chrono::Utc;

use careconnect_core::db::Database;
use careconnect_core::models::NewCheckin;

use super::helpers::find_user;

pub(crate) fn cmd_checkin(db: &Database, email: &str, transcript: &str, json: bool) -> Result<()> {
    if transcript.trim().is_empty() {
        bail!("Transcript must not be empty");
    }
    let user = find_user(db, email)?;
    let checkin = db.insert_checkin(&NewCheckin::analyze(&user.id, transcript), Utc::now())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&checkin)?);
    } else {
        println!("Recorded check-in for {}", user.email);
        println!("  Mood: {}", checkin.mood);
        if checkin.detected_keywords.is_empty() {
            println!("  Keywords: none");
        } else {
            println!("  Keywords: {}", checkin.detected_keywords.join(", "));
        }
    }
    Ok(())
}
