use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

// `#[zbus::proxy]` generates `ScannerProxy`; method names map to PascalCase
// members (`list_enrolled` -> `ListEnrolled`).
#[zbus::proxy(
    interface = "org.rollcall.Scanner1",
    default_service = "org.rollcall.Scanner1",
    default_path = "/org/rollcall/Scanner1"
)]
trait Scanner {
    async fn scan(&self, image: &[u8], course_id: &str, threshold: f64) -> zbus::Result<String>;
    async fn enroll(&self, identity_id: &str, image: &[u8]) -> zbus::Result<String>;
    async fn revoke(&self, identity_id: &str) -> zbus::Result<bool>;
    async fn list_enrolled(&self) -> zbus::Result<String>;
    async fn attendance(&self, identity_id: &str, course_id: &str, day: &str)
        -> zbus::Result<String>;
    async fn mark_status(
        &self,
        identity_id: &str,
        course_id: &str,
        day: &str,
        status: &str,
    ) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face attendance CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recognize a face image and optionally mark attendance
    Scan {
        /// Image file to scan
        #[arg(short, long)]
        image: PathBuf,
        /// Course to mark attendance for (omit to identify only)
        #[arg(short, long)]
        course: Option<String>,
        /// Override the daemon's similarity threshold
        #[arg(short, long, allow_negative_numbers = true)]
        threshold: Option<f64>,
    },
    /// Enroll a new identity from a face image
    Enroll {
        /// Identity to enroll (e.g., a student id)
        identity: String,
        #[arg(short, long)]
        image: PathBuf,
    },
    /// Remove an enrolled identity
    Revoke { identity: String },
    /// List enrolled identities
    List,
    /// Show attendance records
    Attendance {
        #[arg(long)]
        identity: Option<String>,
        #[arg(long)]
        course: Option<String>,
        /// YYYY-MM-DD or "today"
        #[arg(long)]
        day: Option<String>,
    },
    /// Set an attendance status by hand (present, late, absent, excused)
    Mark {
        identity: String,
        course: String,
        status: String,
        /// YYYY-MM-DD (defaults to today)
        #[arg(long)]
        day: Option<String>,
    },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("connecting to D-Bus")?;
    let proxy = ScannerProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    match cli.command {
        Commands::Scan {
            image,
            course,
            threshold,
        } => {
            let bytes = read_image(&image).await?;
            tracing::debug!(path = %image.display(), bytes = bytes.len(), "sending scan");
            let reply = proxy
                .scan(
                    &bytes,
                    course.as_deref().unwrap_or(""),
                    threshold.unwrap_or(f64::NAN),
                )
                .await?;
            print_json(&reply)?;
        }
        Commands::Enroll { identity, image } => {
            let bytes = read_image(&image).await?;
            let reply = proxy.enroll(&identity, &bytes).await?;
            print_json(&reply)?;
        }
        Commands::Revoke { identity } => {
            if proxy.revoke(&identity).await? {
                println!("Revoked {identity}");
            } else {
                println!("{identity} is not enrolled");
            }
        }
        Commands::List => print_json(&proxy.list_enrolled().await?)?,
        Commands::Attendance {
            identity,
            course,
            day,
        } => {
            let reply = proxy
                .attendance(
                    identity.as_deref().unwrap_or(""),
                    course.as_deref().unwrap_or(""),
                    day.as_deref().unwrap_or(""),
                )
                .await?;
            print_json(&reply)?;
        }
        Commands::Mark {
            identity,
            course,
            status,
            day,
        } => {
            let reply = proxy
                .mark_status(&identity, &course, day.as_deref().unwrap_or(""), &status)
                .await?;
            print_json(&reply)?;
        }
        Commands::Status => print_json(&proxy.status().await?)?,
    }

    Ok(())
}

async fn read_image(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("reading image {}", path.display()))
}

fn print_json(reply: &str) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(reply).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
