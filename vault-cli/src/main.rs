use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use vault_core::{fingerprint_reader, Config, Role, Vault, Visibility};

#[derive(Parser)]
#[command(name = "vault")]
#[command(about = "Deduplicating file storage with per-user quotas")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a principal
    CreateUser {
        name: String,

        /// Storage budget in bytes (defaults to the configured quota)
        #[arg(long)]
        quota: Option<i64>,

        /// Grant the admin role
        #[arg(long)]
        admin: bool,
    },

    /// Upload one or more files
    Upload {
        /// Acting principal name
        #[arg(short, long)]
        user: String,

        /// Files to upload
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Download an owned object
    Download {
        #[arg(short, long)]
        user: String,

        object_id: String,

        /// Output path (defaults to the stored filename)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Download a public object anonymously
    Fetch {
        object_id: String,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete an object reference
    Delete {
        #[arg(short, long)]
        user: String,

        object_id: String,
    },

    /// Toggle an object between public and private
    Share {
        #[arg(short, long)]
        user: String,

        object_id: String,

        /// Make the object private again
        #[arg(long)]
        private: bool,
    },

    /// List owned objects
    List {
        #[arg(short, long)]
        user: String,

        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show storage statistics
    Stats {
        #[arg(short, long)]
        user: String,

        /// System-wide totals (admin only)
        #[arg(long)]
        global: bool,
    },

    /// Print the content fingerprint of a local file
    Fingerprint { path: PathBuf },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vault=info,vault_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    if let Err(error) = run(cli).await {
        match error.downcast_ref::<vault_core::VaultError>() {
            Some(vault_error) => tracing::error!("{} [{}]", vault_error, vault_error.code()),
            None => tracing::error!("{:#}", error),
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    let vault = Vault::open(config)?;

    match cli.command {
        Commands::CreateUser { name, quota, admin } => {
            let role = if admin { Role::Admin } else { Role::User };
            let principal = vault.create_principal(&name, role, quota)?;
            println!(
                "created {} ({}), quota {} bytes",
                principal.name, principal.id, principal.quota_total
            );
        }

        Commands::Upload { user, paths } => {
            let principal = vault.principal_by_name(&user)?;
            for path in paths {
                let filename = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .context("invalid file name")?
                    .to_string();
                let file = tokio::fs::File::open(&path)
                    .await
                    .with_context(|| format!("failed to open {}", path.display()))?;

                let admission = vault
                    .upload(&principal.id, &filename, guess_mime(&path), file)
                    .await?;

                let status = if admission.linked {
                    "duplicate (reference added)"
                } else {
                    "uploaded"
                };
                println!("{}: {} ({})", filename, status, admission.object_id);
            }
        }

        Commands::Download {
            user,
            object_id,
            output,
        } => {
            let principal = vault.principal_by_name(&user)?;
            let fetched = vault.download(&principal.id, &object_id).await?;
            let target = output.unwrap_or_else(|| PathBuf::from(&fetched.record.filename));
            tokio::fs::write(&target, &fetched.payload).await?;
            println!(
                "wrote {} bytes to {}",
                fetched.payload.len(),
                target.display()
            );
        }

        Commands::Fetch { object_id, output } => {
            let fetched = vault.download_public(&object_id).await?;
            let target = output.unwrap_or_else(|| PathBuf::from(&fetched.record.filename));
            tokio::fs::write(&target, &fetched.payload).await?;
            println!(
                "wrote {} bytes to {}",
                fetched.payload.len(),
                target.display()
            );
        }

        Commands::Delete { user, object_id } => {
            let principal = vault.principal_by_name(&user)?;
            let released = vault.delete(&principal.id, &object_id).await?;
            if released.freed {
                println!("file deleted");
            } else {
                println!("reference removed");
            }
        }

        Commands::Share {
            user,
            object_id,
            private,
        } => {
            let principal = vault.principal_by_name(&user)?;
            let visibility = if private {
                Visibility::Private
            } else {
                Visibility::Public
            };
            vault.set_visibility(&principal.id, &object_id, visibility)?;
            println!("visibility set to {}", visibility.as_str());
        }

        Commands::List { user, json } => {
            let principal = vault.principal_by_name(&user)?;
            let objects = vault.list(&principal.id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&objects)?);
            } else {
                for object in objects {
                    println!(
                        "{}  {:>10}  refs={} {:>8}  dl={}  {}",
                        object.id,
                        object.size,
                        object.ref_count,
                        object.visibility.as_str(),
                        object.download_count,
                        object.filename
                    );
                }
            }
        }

        Commands::Stats { user, global } => {
            let principal = vault.principal_by_name(&user)?;
            if global {
                let stats = vault.global_stats(&principal.id)?;
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                let stats = vault.stats(&principal.id)?;
                let remaining = vault.principal(&principal.id)?.quota_remaining;
                println!("{}", serde_json::to_string_pretty(&stats)?);
                println!("quota remaining: {} bytes", remaining);
            }
        }

        Commands::Fingerprint { path } => {
            let mut file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;
            let fingerprint = fingerprint_reader(&mut file).await?;
            println!("{}  {}", fingerprint, path.display());
        }
    }

    Ok(())
}

fn guess_mime(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("txt") | Some("md") => "text/plain",
        Some("html") => "text/html",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}
