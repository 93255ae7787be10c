use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a student's reference face from an image file
    Register {
        /// Student identity (e.g., roll number)
        identity: String,
        /// Path to the face image
        image: PathBuf,
    },
    /// Run a recognition attempt against a session
    Recognize {
        /// Attendance session id
        session: i64,
        /// Path to the probe image
        image: PathBuf,
    },
    /// Adjust the recognition confidence threshold
    Threshold {
        /// New threshold in [0, 1]
        value: f64,
    },
    /// Enroll a student identity
    AddStudent {
        id: String,
        name: String,
    },
    /// Create an attendance session
    CreateSession {
        course: String,
        date: String,
        #[arg(long, default_value = "09:00")]
        starts_at: String,
        #[arg(long, default_value = "10:30")]
        ends_at: String,
    },
    /// Reload the gallery from disk
    Reload,
    /// Show daemon status
    Status,
}

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn recognize(&self, session_id: i64, image: Vec<u8>) -> zbus::Result<String>;
    async fn register(&self, identity: &str, image: Vec<u8>) -> zbus::Result<String>;
    async fn set_threshold(&self, threshold: f64) -> zbus::Result<bool>;
    async fn reload_gallery(&self) -> zbus::Result<u32>;
    async fn add_student(&self, id: &str, name: &str) -> zbus::Result<bool>;
    async fn create_session(
        &self,
        course: &str,
        date: &str,
        starts_at: &str,
        ends_at: &str,
    ) -> zbus::Result<i64>;
    async fn status(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = zbus::Connection::session()
        .await
        .context("connecting to session bus — is rollcalld running?")?;
    let proxy = AttendanceProxy::new(&conn).await?;

    match cli.command {
        Commands::Register { identity, image } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("reading {}", image.display()))?;
            println!("{}", proxy.register(&identity, bytes).await?);
        }
        Commands::Recognize { session, image } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("reading {}", image.display()))?;
            println!("{}", proxy.recognize(session, bytes).await?);
        }
        Commands::Threshold { value } => {
            if proxy.set_threshold(value).await? {
                println!("threshold set to {value}");
            } else {
                anyhow::bail!("threshold {value} rejected (must be in [0, 1])");
            }
        }
        Commands::AddStudent { id, name } => {
            if proxy.add_student(&id, &name).await? {
                println!("student {id} enrolled");
            } else {
                println!("student {id} already enrolled");
            }
        }
        Commands::CreateSession { course, date, starts_at, ends_at } => {
            let id = proxy
                .create_session(&course, &date, &starts_at, &ends_at)
                .await?;
            println!("session {id} created");
        }
        Commands::Reload => {
            let count = proxy.reload_gallery().await?;
            println!("gallery reloaded: {count} entries");
        }
        Commands::Status => {
            println!("{}", proxy.status().await?);
        }
    }

    Ok(())
}
