//! # Gallery CLI (`gallery`)
//!
//! Maintenance and search commands for a gallery's metadata document and
//! vector index.
//!
//! ## Usage
//!
//! ```bash
//! gallery --config ./config/gallery.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `gallery init` | Create data directories, an empty document and the vector table |
//! | `gallery migrate` | Upgrade the document to the current schema |
//! | `gallery stats` | Show document counts and index coverage |
//! | `gallery search "<text>"` | Find images matching a text description |
//! | `gallery similar <image-id>` | Find images similar to an existing one |
//! | `gallery delete <image-id>` | Delete an image, its file and its vector |
//! | `gallery index pending` | Embed images that have no vector yet |
//! | `gallery index prune` | Drop vectors whose image no longer exists |
//!
//! Log verbosity follows `RUST_LOG` (default `info`). Logs go to stderr;
//! command output goes to stdout.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gallery_harness::{config, gallery, index_cmd, migrate, search, stats};

/// Gallery CLI: storage and semantic search for an image-generation gallery.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/gallery.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "gallery",
    about = "Gallery: storage and semantic search for an image-generation gallery",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/gallery.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directories, an empty metadata document and the vector table.
    ///
    /// Idempotent; an existing document is never overwritten.
    Init,

    /// Load the metadata document (migrating legacy shapes) and save it back.
    Migrate,

    /// Show prompt, image and index coverage counts.
    Stats,

    /// Find images matching a text description.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results to return.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Find images similar to an existing image.
    Similar {
        /// Image id.
        image_id: String,

        /// Maximum number of results to return.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Delete an image record, its file, its favorite entry and its vector.
    Delete {
        /// Image id.
        image_id: String,
    },

    /// Manage the vector index.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },
}

#[derive(Subcommand)]
enum IndexAction {
    /// Embed images that have no vector record.
    Pending {
        /// Maximum number of images to embed in this run.
        #[arg(long)]
        limit: Option<usize>,

        /// Override the batch size from config (images per embedding call).
        #[arg(long)]
        batch_size: Option<usize>,

        /// Show counts without embedding anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete vector records whose image is no longer in the document.
    Prune,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_init(&cfg).await?;
        }
        Commands::Migrate => {
            migrate::run_migrate(&cfg).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Search { query, limit } => {
            search::run_search(&cfg, &query, limit).await?;
        }
        Commands::Similar { image_id, limit } => {
            search::run_similar(&cfg, &image_id, limit).await?;
        }
        Commands::Delete { image_id } => {
            let gallery = gallery::Gallery::open(cfg)?;
            if gallery.delete_image(&image_id).await? {
                println!("Deleted {}.", image_id);
            } else {
                println!("No image with id {}.", image_id);
            }
            gallery.shutdown().await;
        }
        Commands::Index { action } => match action {
            IndexAction::Pending {
                limit,
                batch_size,
                dry_run,
            } => {
                index_cmd::run_index_pending(&cfg, limit, batch_size, dry_run).await?;
            }
            IndexAction::Prune => {
                index_cmd::run_index_prune(&cfg).await?;
            }
        },
    }

    Ok(())
}
