use anyhow::{Result, bail};
use chrono::Utc;
use tabled::{Table, Tabled, settings::Style};

use careconnect_core::db::Database;
use careconnect_core::models::{NewUser, Role};

use super::helpers::{display_name, find_user, prompt_line};

pub(crate) fn cmd_user_add(
    db: &Database,
    email: &str,
    role: &str,
    full_name: Option<String>,
    password: Option<String>,
    json: bool,
) -> Result<()> {
    let role: Role = role.parse()?;
    if db.get_user_by_email(email)?.is_some() {
        bail!("A user with email '{email}' already exists");
    }
    let password = match password {
        Some(p) => p,
        None => prompt_line("Password: ")?,
    };

    let user = db.create_user(
        &NewUser {
            email: email.to_string(),
            password,
            role,
            full_name,
        },
        Utc::now(),
    )?;

    if json {
        println!("{}", serde_json::to_string_pretty(&user)?);
    } else {
        println!("Created {} {} ({})", user.role, user.email, user.id);
    }
    Ok(())
}

pub(crate) fn cmd_user_list(db: &Database, json: bool) -> Result<()> {
    let users = db.list_users()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&users)?);
    } else if users.is_empty() {
        eprintln!("No users yet. Use `careconnect user add` to create one.");
    } else {
        #[derive(Tabled)]
        struct UserRow {
            #[tabled(rename = "ID")]
            id: String,
            #[tabled(rename = "Email")]
            email: String,
            #[tabled(rename = "Name")]
            name: String,
            #[tabled(rename = "Role")]
            role: String,
            #[tabled(rename = "Created")]
            created: String,
        }

        let rows: Vec<UserRow> = users
            .iter()
            .map(|u| UserRow {
                id: u.id.clone(),
                email: u.email.clone(),
                name: display_name(u),
                role: u.role.to_string(),
                created: u.created_at.format("%Y-%m-%d").to_string(),
            })
            .collect();
        println!("{}", Table::new(&rows).with(Style::rounded()));
    }
    Ok(())
}

pub(crate) fn cmd_link(
    db: &Database,
    caregiver_email: &str,
    elderly_email: &str,
    json: bool,
) -> Result<()> {
    let caregiver = find_user(db, caregiver_email)?;
    let elder = find_user(db, elderly_email)?;
    if caregiver.role != Role::Caregiver {
        bail!("'{caregiver_email}' is not a caregiver");
    }
    if elder.role != Role::ElderlyUser {
        bail!("'{elderly_email}' is not an elderly user");
    }
    if db.is_linked(&caregiver.id, &elder.id)? {
        bail!("'{caregiver_email}' is already linked to '{elderly_email}'");
    }

    let link = db.create_link(&caregiver.id, &elder.id, Utc::now())?;
    if json {
        println!("{}", serde_json::to_string_pretty(&link)?);
    } else {
        println!("Linked {caregiver_email} -> {elderly_email}");
    }
    Ok(())
}
