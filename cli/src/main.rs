mod commands;
mod config;
mod server;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;

use crate::commands::{
    cmd_adherence, cmd_alerts, cmd_checkin, cmd_link, cmd_summary_generate, cmd_summary_list,
    cmd_user_add, cmd_user_list,
};
use crate::config::{Config, init_tracing};
use careconnect_core::db::Database;

#[derive(Parser)]
#[command(
    name = "careconnect",
    version,
    about = "Caregiving coordination: health check-ins, medication adherence and caregiver alerts"
)]
struct Cli {
    /// Data directory (default: platform data dir)
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the REST API server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Address to bind to (default: 127.0.0.1, use 0.0.0.0 to expose to network)
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
        /// Days before an issued session token expires
        #[arg(long, default_value = "30")]
        session_ttl_days: u32,
    },
    /// Manage user accounts
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
    /// Link a caregiver to an elderly user
    Link {
        /// Caregiver email
        caregiver: String,
        /// Elderly user email
        elderly: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Record a health check-in from a transcript
    Checkin {
        /// Email of the user checking in
        email: String,
        /// What the user said
        transcript: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Generate or list daily summaries
    Summary {
        #[command(subcommand)]
        command: SummaryCommands,
    },
    /// Show medication adherence for the current week or month
    Adherence {
        /// Email of the user
        email: String,
        /// Reporting period: week or month
        #[arg(short, long, default_value = "week")]
        period: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show alerts for a caregiver's linked users
    Alerts {
        /// Caregiver email
        caregiver: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum UserCommands {
    /// Create a user (prompts for the password when --password is omitted)
    Add {
        /// Email address
        email: String,
        /// Role: elderly_user or caregiver
        #[arg(short, long)]
        role: String,
        /// Full name
        #[arg(long)]
        name: Option<String>,
        /// Password
        #[arg(long)]
        password: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List all users
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum SummaryCommands {
    /// Compute and store the summary for one day
    Generate {
        /// Email of the user
        email: String,
        /// Date (YYYY-MM-DD or today/yesterday, default: today, UTC)
        #[arg(long)]
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List stored summaries, most recent first
    List {
        /// Email of the user
        email: String,
        /// Number of summaries to show
        #[arg(short, long, default_value = "7")]
        limit: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.data_dir.as_deref())?;
    let db = Database::open(&config.db_path)?;

    match cli.command {
        Commands::Serve {
            port,
            bind,
            session_ttl_days,
        } => {
            let settings = server::ServerSettings {
                port,
                bind,
                audio_dir: config.audio_dir,
                session_ttl: chrono::Duration::days(i64::from(session_ttl_days)),
            };
            server::start_server(db, settings).await
        }
        Commands::User { command } => match command {
            UserCommands::Add {
                email,
                role,
                name,
                password,
                json,
            } => cmd_user_add(&db, &email, &role, name, password, json),
            UserCommands::List { json } => cmd_user_list(&db, json),
        },
        Commands::Link {
            caregiver,
            elderly,
            json,
        } => cmd_link(&db, &caregiver, &elderly, json),
        Commands::Checkin {
            email,
            transcript,
            json,
        } => cmd_checkin(&db, &email, &transcript, json),
        Commands::Summary { command } => match command {
            SummaryCommands::Generate { email, date, json } => {
                cmd_summary_generate(&db, &email, date, json)
            }
            SummaryCommands::List { email, limit, json } => {
                cmd_summary_list(&db, &email, limit, json)
            }
        },
        Commands::Adherence {
            email,
            period,
            json,
        } => cmd_adherence(&db, &email, &period, json),
        Commands::Alerts { caregiver, json } => cmd_alerts(&db, &caregiver, json),
    }
}
