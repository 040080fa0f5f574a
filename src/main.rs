mod ai;
mod api;
mod auth;
mod config;
mod db;
mod email;
mod error;
mod models;
mod resolver;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::ServeConfig;
use db::Database;
use models::ListQuery;
use resolver::CompanyCandidate;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "outreach")]
#[command(about = "Outreach backend - jobs, companies, email logs and AI drafting")]
struct Cli {
    /// Path to the SQLite database (defaults to the platform data directory)
    #[arg(long, global = true, env = "OUTREACH_DB")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Run the HTTP API
    Serve(ServeConfig),

    /// List jobs
    Jobs {
        /// Filter by status (NEW, CONTACTED, ...)
        #[arg(short, long)]
        status: Option<String>,

        /// Match title or company name
        #[arg(long)]
        search: Option<String>,

        /// Only jobs created in the last N days
        #[arg(short, long)]
        days: Option<u32>,

        /// Number of jobs to show
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },

    /// Show job details
    Show {
        /// Job ID
        id: String,
    },

    /// Manage companies
    Companies {
        #[command(subcommand)]
        command: CompanyCommands,
    },

    /// Show the email log, newest first
    Logs {
        /// Filter by status (SENT, FAILED)
        #[arg(short, long)]
        status: Option<String>,

        /// Filter by provider (GMAIL, CUSTOM)
        #[arg(short, long)]
        provider: Option<String>,

        /// Number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },

    /// Manage user accounts
    Users {
        #[command(subcommand)]
        command: UserCommands,
    },
}

#[derive(Subcommand)]
enum CompanyCommands {
    /// List companies
    List {
        /// Filter by status
        #[arg(short, long)]
        status: Option<String>,

        /// Match name or website
        #[arg(long)]
        search: Option<String>,

        /// Number of companies to show
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },

    /// Show company details
    Show {
        /// Company ID
        id: String,
    },

    /// Show which stored company a name/website pair resolves to
    Lookup {
        #[arg(short, long)]
        name: Option<String>,

        #[arg(short, long)]
        website: Option<String>,
    },
}

#[derive(Subcommand)]
enum UserCommands {
    /// List users
    List,

    /// Create a user
    Add {
        username: String,

        #[arg(short, long)]
        password: String,

        #[arg(short, long, default_value = "USER")]
        role: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let db = Database::open(cli.database).context("Failed to open database")?;

    match cli.command {
        Commands::Init => {
            db.init()?;
            let path = db.path().map(|p| p.display().to_string()).unwrap_or_default();
            println!("Database initialized at {}", path);
        }

        Commands::Serve(config) => serve(db, config)?,

        Commands::Jobs { status, search, days, limit } => {
            db.ensure_initialized()?;
            let page = db.list_jobs(&ListQuery {
                status,
                search,
                days: days.map(|d| d.to_string()),
                limit: Some(limit.to_string()),
                ..Default::default()
            })?;
            if page.items.is_empty() {
                println!("No jobs found.");
            } else {
                println!("{:<16} {:<10} {:<30} {:<20} {:>10}", "ID", "STATUS", "TITLE", "COMPANY", "CREATED");
                println!("{}", "-".repeat(90));
                for job in &page.items {
                    println!(
                        "{:<16} {:<10} {:<30} {:<20} {:>10}",
                        truncate(&job.id, 16),
                        truncate(&job.status, 10),
                        truncate(&job.title, 28),
                        truncate(job.company_name(), 18),
                        format_date(job.created_at)
                    );
                }
                println!("\nShowing {} of {} jobs.", page.items.len(), page.total);
            }
        }

        Commands::Show { id } => {
            db.ensure_initialized()?;
            match db.get_job(&id)? {
                Some(job) => {
                    println!("Job {}", job.id);
                    println!("Title: {}", job.title);
                    if let Some(company) = &job.company {
                        println!("Company: {}", company.name);
                        if !company.website.is_empty() {
                            println!("Website: {}", company.website);
                        }
                    }
                    println!("Status: {}", job.status);
                    println!("Created: {}", format_date(job.created_at));
                    if let Some(analysis) = &job.analysis {
                        println!("\n--- Analysis ---");
                        println!("Score: {}/10 ({})", analysis.score, analysis.recommendation);
                        println!("{}", analysis.reasoning);
                        if !analysis.matching_skills.is_empty() {
                            println!("Matching skills: {}", analysis.matching_skills.join(", "));
                        }
                    }
                    if !job.description.is_empty() {
                        println!("\n--- Description ---\n{}", job.description);
                    }
                }
                None => println!("Job {} not found.", id),
            }
        }

        Commands::Companies { command } => {
            db.ensure_initialized()?;
            match command {
                CompanyCommands::List { status, search, limit } => {
                    let page = db.list_companies(&ListQuery {
                        status,
                        search,
                        limit: Some(limit.to_string()),
                        ..Default::default()
                    })?;
                    if page.items.is_empty() {
                        println!("No companies found.");
                    } else {
                        println!("{:<21} {:<10} {:<28} {:<30}", "ID", "STATUS", "NAME", "WEBSITE");
                        println!("{}", "-".repeat(92));
                        for company in &page.items {
                            println!(
                                "{:<21} {:<10} {:<28} {:<30}",
                                truncate(&company.id, 21),
                                truncate(&company.status, 10),
                                truncate(&company.name, 26),
                                truncate(&company.website, 28)
                            );
                        }
                        println!("\nShowing {} of {} companies.", page.items.len(), page.total);
                    }
                }

                CompanyCommands::Show { id } => match db.get_company(&id)? {
                    Some(company) => print_company(&company),
                    None => println!("Company {} not found.", id),
                },

                CompanyCommands::Lookup { name, website } => {
                    let candidate = CompanyCandidate {
                        name,
                        website,
                        ..Default::default()
                    };
                    println!("Normalized website: {}", candidate.normalized_website());
                    match db.with_conn(|conn| resolver::find_existing(conn, &candidate))? {
                        Some(company) => print_company(&company),
                        None => println!("No matching company. A job with this company would create a new record."),
                    }
                }
            }
        }

        Commands::Logs { status, provider, limit } => {
            db.ensure_initialized()?;
            let page = db.list_logs(&ListQuery {
                status,
                provider,
                limit: Some(limit.to_string()),
                ..Default::default()
            })?;
            if page.items.is_empty() {
                println!("No email logs found.");
            } else {
                println!("{:<10} {:<7} {:<7} {:<26} {:<30}", "DATE", "VIA", "STATUS", "RECIPIENT", "SUBJECT");
                println!("{}", "-".repeat(84));
                for log in &page.items {
                    println!(
                        "{:<10} {:<7} {:<7} {:<26} {:<30}",
                        format_date(log.timestamp),
                        log.provider.as_str(),
                        log.status.as_str(),
                        truncate(&log.recipient, 24),
                        truncate(&log.subject, 30)
                    );
                    if let Some(error) = &log.error_message {
                        println!("           error: {}", truncate(error, 70));
                    }
                }
            }
        }

        Commands::Users { command } => {
            db.ensure_initialized()?;
            match command {
                UserCommands::List => {
                    let users = db.list_users()?;
                    if users.is_empty() {
                        println!("No users found.");
                    } else {
                        println!("{:<16} {:<20} {:<8} {:>10}", "ID", "USERNAME", "ROLE", "CREATED");
                        println!("{}", "-".repeat(57));
                        for user in users {
                            println!(
                                "{:<16} {:<20} {:<8} {:>10}",
                                truncate(&user.id, 16),
                                truncate(&user.username, 20),
                                user.role,
                                format_date(user.created_at)
                            );
                        }
                    }
                }

                UserCommands::Add { username, password, role } => {
                    let user = auth::create_user(&db, &auth::NewUser { username, password, role })?;
                    println!("Created user '{}' ({}).", user.username, user.id);
                }
            }
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("outreach=debug,info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn serve(db: Database, config: ServeConfig) -> Result<()> {
    db.init().context("Failed to initialize database")?;
    auth::seed_admin(&db, &config.admin_password).context("Failed to seed admin user")?;

    // Providers are built before the runtime starts; their blocking HTTP
    // clients must not be created or dropped on an async worker.
    let provider: Option<Arc<dyn ai::AIProvider>> =
        match ai::resolve_model(&config.model).and_then(|spec| {
            let provider = ai::create_provider(&spec)?;
            tracing::info!(model = %spec.short_name, id = provider.model_name(), "AI provider ready");
            Ok(provider)
        }) {
            Ok(provider) => Some(Arc::from(provider)),
            Err(e) => {
                tracing::warn!("{e:#}. AI features will fail.");
                None
            }
        };

    let addr: SocketAddr = config
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.bind))?;
    let state = api::AppState {
        db: Arc::new(db),
        ai: provider.clone(),
        signer: auth::TokenSigner::new(&config.jwt_secret),
    };

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime
        .block_on(api::serve(addr, state))
        .with_context(|| format!("Server on {} failed", addr))?;
    drop(runtime);
    drop(provider);
    Ok(())
}

fn print_company(company: &models::Company) {
    println!("Company {}", company.id);
    println!("Name: {}", company.name);
    println!("Website: {}", company.website);
    println!("Status: {}", company.status);
    println!("Created: {}", format_date(company.created_at));
    if !company.general_contact_email.is_empty() {
        println!("General email: {}", company.general_contact_email);
    }
    if !company.contacts.is_empty() {
        println!("\nContacts ({}):", company.contacts.len());
        for contact in &company.contacts {
            println!("  {} <{}> - {}", contact.name, contact.email, contact.role);
        }
    }
    if let Some(analysis) = &company.analysis {
        println!("\n--- Analysis ---\n{}", analysis.summary);
        if !analysis.pain_points.is_empty() {
            println!("Pain points: {}", analysis.pain_points.join(", "));
        }
        if !analysis.recommended_approach.is_empty() {
            println!("Approach: {}", analysis.recommended_approach);
        }
    }
}

fn format_date(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a much longer title", 10), "a much ...");
        assert_eq!(truncate("héllo wörld", 8), "héllo...");
    }

    #[test]
    fn test_format_date() {
        assert_eq!(format_date(0), "1970-01-01");
        assert_eq!(format_date(1_700_000_000_000), "2023-11-14");
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["outreach", "--database", "/tmp/x.db", "companies", "lookup", "-w", "acme.com"]).unwrap();
        assert_eq!(cli.database, Some(PathBuf::from("/tmp/x.db")));
        assert!(matches!(
            cli.command,
            Commands::Companies { command: CompanyCommands::Lookup { website: Some(_), name: None } }
        ));

        let cli = Cli::try_parse_from(["outreach", "serve", "--bind", "0.0.0.0:8080"]).unwrap();
        match cli.command {
            Commands::Serve(config) => assert_eq!(config.bind, "0.0.0.0:8080"),
            _ => panic!("expected serve"),
        }
    }
}
