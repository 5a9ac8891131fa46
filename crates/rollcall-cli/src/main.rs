use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall camera attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start scanning for an attendance session
    Start {
        /// Attendance session id
        session: i64,
    },
    /// Stop the current scan and release the camera
    Stop,
    /// Select the current session (stops a scan of any other session)
    Select {
        /// Attendance session id
        session: i64,
    },
    /// End a session; students without a record are marked absent
    End {
        /// Attendance session id
        session: i64,
    },
    /// Resubmit attendance writes waiting in the outbox
    Retry,
    /// Show daemon status
    Status,
    /// List V4L2 capture devices
    Devices,
}

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    fn start_scan(&self, session_id: i64) -> zbus::Result<String>;
    fn stop_scan(&self) -> zbus::Result<bool>;
    fn select_session(&self, session_id: i64) -> zbus::Result<bool>;
    fn end_session(&self, session_id: i64) -> zbus::Result<String>;
    fn retry_pending(&self) -> zbus::Result<u32>;
    fn status(&self) -> zbus::Result<String>;
}

async fn proxy() -> Result<AttendanceProxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    AttendanceProxy::new(&conn)
        .await
        .context("failed to reach rollcalld")
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon sent invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[cfg(feature = "v4l2")]
fn list_devices() {
    let devices = rollcall_hw::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in devices {
        println!("{}  {} ({})", d.path, d.name, d.driver);
    }
}

#[cfg(not(feature = "v4l2"))]
fn list_devices() {
    println!("Built without V4L2 support (rebuild with --features v4l2)");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { session } => {
            let started = proxy().await?.start_scan(session).await?;
            print_json(&started)?;
        }
        Commands::Stop => {
            if proxy().await?.stop_scan().await? {
                println!("Scan stopped");
            } else {
                println!("No scan was running");
            }
        }
        Commands::Select { session } => {
            let stopped = proxy().await?.select_session(session).await?;
            println!("Session {session} selected");
            if stopped {
                println!("Scan of the previous session stopped");
            }
        }
        Commands::End { session } => {
            let closed = proxy().await?.end_session(session).await?;
            print_json(&closed)?;
        }
        Commands::Retry => {
            let delivered = proxy().await?.retry_pending().await?;
            println!("{delivered} queued write(s) delivered");
        }
        Commands::Status => {
            let status = proxy().await?.status().await?;
            print_json(&status)?;
        }
        Commands::Devices => list_devices(),
    }

    Ok(())
}
