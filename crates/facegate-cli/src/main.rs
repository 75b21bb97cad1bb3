use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facegate_hw::{Camera, FrameSource};
use serde_json::Value;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "facegate", about = "FaceGate face login CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan your face and store it for a user
    Register {
        user: String,
    },
    /// Scan your face and match it against all enrollments
    Authenticate,
    /// Cancel the running scan
    Cancel,
    /// Print the current scan progress
    Progress,
    /// Show daemon status
    Status,
    /// List enrollments
    List,
    /// Remove a user's enrollment
    Remove {
        user: String,
    },
    /// Activate or deactivate a user's enrollment
    Activate {
        user: String,
        /// Deactivate instead
        #[arg(long)]
        off: bool,
    },
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Frames to capture
        #[arg(short, long, default_value_t = 10)]
        frames: u32,
        /// Write the last frame to this PNG
        #[arg(long)]
        save: Option<PathBuf>,
    },
}

#[zbus::proxy(
    interface = "org.facegate.FaceGate1",
    default_service = "org.facegate.FaceGate1",
    default_path = "/org/facegate/FaceGate1"
)]
trait FaceGate {
    fn register(&self, user: &str) -> zbus::Result<String>;
    fn authenticate(&self) -> zbus::Result<String>;
    fn cancel(&self) -> zbus::Result<bool>;
    fn progress(&self) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
    fn list_enrollments(&self) -> zbus::Result<String>;
    fn remove_enrollment(&self, user: &str) -> zbus::Result<bool>;
    fn set_active(&self, user: &str, active: bool) -> zbus::Result<bool>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Register { user } => {
            let proxy = connect(cli.session).await?;
            println!("Look at the camera with your eyes open.");
            let id = with_progress(&proxy, proxy.register(&user)).await?;
            println!("Registered {user} ({id})");
        }
        Commands::Authenticate => {
            let proxy = connect(cli.session).await?;
            println!("Look at the camera with your eyes open.");
            let json = with_progress(&proxy, proxy.authenticate()).await?;
            let result: Value = serde_json::from_str(&json)?;
            println!(
                "Authenticated as {} (distance {:.3})",
                result["user"].as_str().unwrap_or("?"),
                result["distance"].as_f64().unwrap_or(f64::NAN)
            );
        }
        Commands::Cancel => {
            let proxy = connect(cli.session).await?;
            if proxy.cancel().await? {
                println!("Scan cancelled");
            } else {
                println!("No scan in progress");
            }
        }
        Commands::Progress => {
            let proxy = connect(cli.session).await?;
            let snapshot: Value = serde_json::from_str(&proxy.progress().await?)?;
            if snapshot.is_null() {
                println!("No scan has run yet");
            } else {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            }
        }
        Commands::Status => {
            let proxy = connect(cli.session).await?;
            let status: Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::List => {
            let proxy = connect(cli.session).await?;
            let list: Value = serde_json::from_str(&proxy.list_enrollments().await?)?;
            let entries = list.as_array().map(Vec::as_slice).unwrap_or_default();
            if entries.is_empty() {
                println!("No enrollments");
            }
            for e in entries {
                println!(
                    "{:<16} {}  {:<8} enrolled {}  last login {}",
                    e["user"].as_str().unwrap_or("?"),
                    e["id"].as_str().unwrap_or("?"),
                    if e["active"].as_bool().unwrap_or(false) { "active" } else { "inactive" },
                    e["enrolled_at"].as_str().unwrap_or("?"),
                    e["last_login_at"].as_str().unwrap_or("never"),
                );
            }
        }
        Commands::Remove { user } => {
            let proxy = connect(cli.session).await?;
            if !proxy.remove_enrollment(&user).await? {
                bail!("no enrollment for {user}");
            }
            println!("Removed {user}");
        }
        Commands::Activate { user, off } => {
            let proxy = connect(cli.session).await?;
            if !proxy.set_active(&user, !off).await? {
                bail!("no enrollment for {user}");
            }
            println!("{user} {}", if off { "deactivated" } else { "activated" });
        }
        Commands::Test { device, frames, save } => camera_test(&device, frames, save.as_ref())?,
    }

    Ok(())
}

async fn connect(session: bool) -> Result<FaceGateProxy<'static>> {
    tracing::debug!(bus = bus_label(session), "connecting to facegated");
    let conn = if session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("connecting to D-Bus")?;
    FaceGateProxy::new(&conn)
        .await
        .context("facegated is not reachable")
}

fn bus_label(session: bool) -> &'static str {
    if session {
        "session"
    } else {
        "system"
    }
}

/// Await a scan call while printing status changes. Ctrl-C cancels the scan
/// and keeps waiting for the daemon's answer.
async fn with_progress<T>(proxy: &FaceGateProxy<'_>, call: impl Future<Output = zbus::Result<T>>) -> Result<T> {
    tokio::pin!(call);
    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    let mut last = String::new();

    loop {
        tokio::select! {
            result = &mut call => return Ok(result?),
            _ = ticker.tick() => {
                let Ok(json) = proxy.progress().await else { continue };
                let Ok(snapshot) = serde_json::from_str::<Value>(&json) else { continue };
                let line = format!(
                    "[{:>3}%] {}",
                    snapshot["progress"].as_u64().unwrap_or(0),
                    snapshot["message"].as_str().unwrap_or(""),
                );
                if !snapshot.is_null() && line != last {
                    println!("{line}");
                    last = line;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted; cancelling scan");
                proxy.cancel().await?;
            }
        }
    }
}

fn camera_test(device: &str, frames: u32, save: Option<&PathBuf>) -> Result<()> {
    println!("Capture devices:");
    for info in Camera::list_devices() {
        println!("  {}  {} ({}, {})", info.path, info.name, info.driver, info.bus);
    }

    let mut camera = Camera::open(device).with_context(|| format!("opening {device}"))?;
    tracing::debug!(device, frames, "camera diagnostics");
    let (width, height) = camera.resolution();
    println!("Opened {device} at {width}x{height}");

    let mut last = None;
    let mut dark = 0;
    for _ in 0..frames.max(1) {
        let frame = camera.grab()?;
        if frame.is_dark {
            dark += 1;
        }
        println!(
            "  frame {:>4}: brightness {:6.1}{}",
            frame.sequence,
            frame.avg_brightness(),
            if frame.is_dark { "  (dark)" } else { "" }
        );
        last = Some(frame);
    }
    println!("{dark} of {} frames dark", frames.max(1));

    if let (Some(path), Some(frame)) = (save, last) {
        let image = image::GrayImage::from_raw(frame.width, frame.height, frame.data)
            .context("frame buffer does not match its dimensions")?;
        image.save(path).with_context(|| format!("saving {}", path.display()))?;
        println!("Saved last frame to {}", path.display());
    }
    Ok(())
}
