//! polyfs command-line front-end.
//!
//! Usage:
//!   # Ephemeral in-memory filesystem
//!   polyfs put /notes.txt ./notes.txt
//!
//!   # Mounts, cache and locking from a config file
//!   polyfs --config polyfs.toml ls /
//!   polyfs --config polyfs.toml mv /scratch/a.txt /archive/a.txt
//!
//! Logging goes to stderr; set `RUST_LOG=polyfs_core=debug` for cache detail.

use std::io::Read;
use std::path::PathBuf;
use std::time::{Duration, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use polyfs_core::{
    FileInfo, Filesystem, FilesystemConfig, MemoryBackend, MountOptions, View,
};

/// Virtual filesystem over multiple storages.
#[derive(Parser, Debug)]
#[command(name = "polyfs")]
#[command(about = "Virtual filesystem over multiple storage backends")]
struct Args {
    /// TOML configuration (in-memory filesystem when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logical path the view is rooted at
    #[arg(long, default_value = "/")]
    root: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
        /// Only entries with this mimetype (`text/plain`) or top-level type (`text`)
        #[arg(long)]
        mime: Option<String>,
    },
    /// Print a file to stdout
    Cat { path: String },
    /// Write a file from a local file or stdin
    Put {
        path: String,
        source: Option<PathBuf>,
    },
    /// Create a directory
    Mkdir { path: String },
    /// Delete a file or directory tree
    Rm { path: String },
    /// Move or rename
    Mv { source: String, target: String },
    /// Copy
    Cp { source: String, target: String },
    /// Update the mtime, creating the file if missing
    Touch {
        path: String,
        /// Unix seconds (now when omitted)
        #[arg(long)]
        mtime: Option<u64>,
    },
    /// Print cached metadata as JSON
    Info { path: String },
    /// Rescan a path and every mount below it
    Scan {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Search cached names, or mimetypes with --mime
    Search {
        query: String,
        #[arg(long)]
        mime: bool,
    },
    /// List mounts
    Mounts,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let fs = match &args.config {
        Some(path) => {
            let config = FilesystemConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?;
            Filesystem::from_config(&config)?
        }
        None => {
            tracing::info!("no config given, using an in-memory filesystem");
            let fs = Filesystem::in_memory()?;
            fs.mount(std::sync::Arc::new(MemoryBackend::new()), "/", MountOptions::default())?;
            fs
        }
    };
    let view = fs.view(&args.root)?;

    run(&fs, &view, args.command).await
}

async fn run(fs: &Filesystem, view: &View, command: Command) -> Result<()> {
    match command {
        Command::Ls { path, mime } => {
            for info in view.get_directory_content(&path, mime.as_deref()).await? {
                print_entry(&info);
            }
        }
        Command::Cat { path } => {
            let Some(data) = view.file_get_contents(&path).await? else {
                bail!("read of {} was cancelled", path);
            };
            use std::io::Write;
            std::io::stdout().write_all(&data)?;
        }
        Command::Put { path, source } => {
            let data = match source {
                Some(file) => tokio::fs::read(&file)
                    .await
                    .with_context(|| format!("reading {}", file.display()))?,
                None => {
                    let mut buf = Vec::new();
                    std::io::stdin().read_to_end(&mut buf)?;
                    buf
                }
            };
            refused(view.file_put_contents(&path, &data).await?, "put", &path)?;
        }
        Command::Mkdir { path } => refused(view.mkdir(&path).await?, "mkdir", &path)?,
        Command::Rm { path } => refused(view.unlink(&path).await?, "rm", &path)?,
        Command::Mv { source, target } => {
            refused(view.rename(&source, &target).await?, "mv", &source)?
        }
        Command::Cp { source, target } => {
            refused(view.copy(&source, &target).await?, "cp", &source)?
        }
        Command::Touch { path, mtime } => {
            let mtime = mtime.map(|secs| UNIX_EPOCH + Duration::from_secs(secs));
            refused(view.touch(&path, mtime).await?, "touch", &path)?
        }
        Command::Info { path } => match view.get_file_info(&path, true).await? {
            Some(info) => {
                let json = serde_json::json!({
                    "path": info.path(),
                    "mount_point": info.mount_point(),
                    "storage": info.storage_id(),
                    "file_id": info.file_id(),
                    "size": info.size(),
                    "mtime": info.mtime(),
                    "etag": info.etag(),
                    "mimetype": info.mimetype(),
                    "permissions": info.permissions().bits(),
                    "encrypted": info.is_encrypted(),
                });
                println!("{}", serde_json::to_string_pretty(&json)?);
            }
            None => bail!("{} not found", path),
        },
        Command::Scan { path } => {
            let abs = view.get_absolute_path(&path)?;
            let mounts = fs.scan(&abs).await?;
            println!("scanned {} mount(s) under {}", mounts, abs);
        }
        Command::Search { query, mime } => {
            let results = if mime {
                view.search_by_mime(&query).await?
            } else {
                view.search(&query).await?
            };
            for info in results {
                print_entry(&info);
            }
        }
        Command::Mounts => {
            for mount in fs.registry().list() {
                println!(
                    "{:<24} {:<40} movable={} shared={} watch={}",
                    mount.path(),
                    mount.storage_id(),
                    mount.is_movable(),
                    mount.is_shared(),
                    mount.options().watch_policy
                );
            }
        }
    }
    Ok(())
}

/// Turn a refused operation into an error.
fn refused(done: bool, op: &str, path: &str) -> Result<()> {
    if !done {
        bail!("{} {} was refused", op, path);
    }
    Ok(())
}

fn print_entry(info: &FileInfo) {
    let kind = if info.is_dir() { 'd' } else { '-' };
    let size = match info.size() {
        size if size < 0 => "?".to_string(),
        size => size.to_string(),
    };
    println!("{} {:>12} {:>12} {}", kind, size, info.mtime(), info.path());
}
