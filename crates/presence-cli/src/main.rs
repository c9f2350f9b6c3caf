use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "presence", about = "Presence face verification CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify the face in an image against the gallery
    Verify {
        image: PathBuf,
        /// Identity the image is claimed to show
        #[arg(short, long)]
        user: Option<String>,
    },
    /// Sync the gallery with the enrollment corpus
    Reconcile,
    /// List enrolled identities
    List,
    /// Remove an identity from the gallery (the corpus directory is kept)
    Remove { identity: String },
    /// Show daemon status
    Status,
}

#[zbus::proxy(
    interface = "org.presence.Presence1",
    default_service = "org.presence.Presence1",
    default_path = "/org/presence/Presence1"
)]
trait Presence {
    fn verify(&self, image_path: &str, claimed_user: &str) -> zbus::Result<String>;
    fn reconcile(&self) -> zbus::Result<String>;
    fn list_identities(&self) -> zbus::Result<String>;
    fn remove_identity(&self, identity: &str) -> zbus::Result<bool>;
    fn status(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = zbus::Connection::session()
        .await
        .context("connecting to the session bus")?;
    let proxy = PresenceProxy::new(&conn)
        .await
        .context("presenced is not reachable")?;

    tracing::debug!(bus = "org.presence.Presence1", "connected to presenced");

    let (json, ok) = match cli.command {
        Commands::Verify { image, user } => {
            // The daemon resolves paths against its own working directory.
            let image = std::fs::canonicalize(&image)
                .with_context(|| format!("cannot resolve {}", image.display()))?;
            let json = proxy
                .verify(&image.to_string_lossy(), user.as_deref().unwrap_or(""))
                .await?;
            let ok = outcome(&json).as_deref() == Some("matched");
            (json, ok)
        }
        Commands::Reconcile => (proxy.reconcile().await?, true),
        Commands::List => (proxy.list_identities().await?, true),
        Commands::Remove { identity } => {
            let removed = proxy.remove_identity(&identity).await?;
            (removal(&identity, removed), removed)
        }
        Commands::Status => (proxy.status().await?, true),
    };

    println!("{}", pretty(&json));
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

fn outcome(json: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(json).ok()?;
    value.get("outcome")?.as_str().map(str::to_string)
}

fn removal(identity: &str, removed: bool) -> String {
    serde_json::json!({ "identity": identity, "removed": removed }).to_string()
}

fn pretty(json: &str) -> String {
    serde_json::from_str::<serde_json::Value>(json)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| json.to_string())
}
