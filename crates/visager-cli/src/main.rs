use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "visager", about = "Visager photo library CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy local photos into the library and queue them
    Index {
        /// Files to index
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Send photos to the daemon over the bus
    Upload {
        /// Files to upload
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Show queue progress
    Status,
    /// Show daemon health
    Health,
    /// List person albums
    Albums,
    /// List every photo in the library
    Photos,
    /// List photos waiting for a name
    Review,
    /// Name a photo from the review list
    Assign {
        /// Path or file name as shown by `review`
        path: String,
        /// Person name (becomes the album folder)
        name: String,
    },
}

// `#[zbus::proxy]` generates `VisagerProxy` (async) and `VisagerProxyBlocking`.
#[zbus::proxy(
    interface = "org.freedesktop.Visager1",
    default_service = "org.freedesktop.Visager1",
    default_path = "/org/freedesktop/Visager1"
)]
trait Visager {
    async fn index(&self, paths: Vec<String>) -> zbus::Result<String>;
    async fn upload(&self, filename: &str, data: Vec<u8>) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
    async fn health(&self) -> zbus::Result<String>;
    async fn albums(&self) -> zbus::Result<String>;
    async fn photos(&self) -> zbus::Result<String>;
    async fn review(&self) -> zbus::Result<String>;
    async fn assign(&self, path: &str, name: &str) -> zbus::Result<String>;
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
    let proxy = VisagerProxy::new(&conn)
        .await
        .context("visagerd is not reachable")?;

    match cli.command {
        Commands::Index { paths } => {
            // The daemon resolves paths in its own working directory.
            let mut absolute = Vec::with_capacity(paths.len());
            for path in paths {
                let path = path
                    .canonicalize()
                    .with_context(|| format!("resolving {}", path.display()))?;
                absolute.push(path.to_string_lossy().into_owned());
            }
            print_json(&proxy.index(absolute).await?)?;
        }
        Commands::Upload { files } => {
            for file in files {
                let name = file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .with_context(|| format!("{} has no file name", file.display()))?;
                let data = tokio::fs::read(&file)
                    .await
                    .with_context(|| format!("reading {}", file.display()))?;
                tracing::debug!(file = %file.display(), bytes = data.len(), "uploading");
                print_json(&proxy.upload(&name, data).await?)?;
            }
        }
        Commands::Status => print_json(&proxy.status().await?)?,
        Commands::Health => print_json(&proxy.health().await?)?,
        Commands::Albums => print_json(&proxy.albums().await?)?,
        Commands::Photos => print_json(&proxy.photos().await?)?,
        Commands::Review => print_json(&proxy.review().await?)?,
        Commands::Assign { path, name } => print_json(&proxy.assign(&path, &name).await?)?,
    }

    Ok(())
}

/// Pretty-print a JSON reply from the daemon.
fn print_json(reply: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(reply).context("daemon sent invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
