//! Command-line Safe Browsing database tool
//!
//! Ingests decoded chunk files into the local database and checks URLs
//! against it.

mod chunk_file;

use clap::{Args, Parser, Subcommand, ValueEnum};
use safebrowsing::{Config, DatabaseConfig, DatabaseType, SafeBrowser, UrlCheck};
use std::io::{self, BufRead};
use std::path::PathBuf;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::chunk_file::{chunk_delete, ChunkFile};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "sblookup")]
struct Cli {
    /// Database file (defaults to the user cache directory)
    #[arg(long, env = "SAFEBROWSING_DB", global = true)]
    db: Option<PathBuf>,

    /// Database type to use
    #[arg(long, value_enum, default_value_t = DatabaseTypeArg::Redb, global = true)]
    database_type: DatabaseTypeArg,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check URLs (if none are given, reads them from stdin)
    Check {
        urls: Vec<String>,
    },
    /// Apply a JSON chunk file as one update
    Ingest {
        file: PathBuf,
    },
    /// Delete add or sub chunks of a list
    Delete(DeleteArgs),
    /// Print the chunk ranges held per list
    Lists,
    /// Print database statistics
    Stats,
}

#[derive(Args)]
struct DeleteArgs {
    /// List name
    #[arg(long)]
    list: String,

    /// Add chunk ranges to delete, like `1-3,7`
    #[arg(long)]
    add: Option<String>,

    /// Sub chunk ranges to delete
    #[arg(long)]
    sub: Option<String>,
}

#[derive(Clone, Debug, ValueEnum)]
enum DatabaseTypeArg {
    /// Use in-memory database
    Memory,
    /// Use persistent redb-based database
    Redb,
}

impl From<DatabaseTypeArg> for DatabaseType {
    fn from(arg: DatabaseTypeArg) -> Self {
        match arg {
            DatabaseTypeArg::Memory => DatabaseType::Memory,
            DatabaseTypeArg::Redb => DatabaseType::Redb,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let config = Config {
        database_type: cli.database_type.into(),
        database: DatabaseConfig {
            path: cli.db,
            // Every command runs to completion before the process exits.
            synchronous: true,
            ..DatabaseConfig::default()
        },
        ..Default::default()
    };

    let mut sb = SafeBrowser::new(config).await.map_err(|e| {
        error!("Failed to open Safe Browsing database: {}", e);
        e
    })?;

    let result = run(&sb, cli.command).await;

    if let Err(e) = sb.close().await {
        warn!("Error closing Safe Browser: {}", e);
    }
    result
}

async fn run(sb: &SafeBrowser, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Check { urls } if !urls.is_empty() => {
            for url in &urls {
                check_url(sb, url).await?;
            }
        }
        Commands::Check { .. } => {
            debug!("Reading URLs from stdin");
            for line in io::stdin().lock().lines() {
                let url = line?;
                let url = url.trim();
                if url.is_empty() {
                    continue;
                }
                check_url(sb, url).await?;
            }
        }
        Commands::Ingest { file } => {
            let json = std::fs::read_to_string(&file)
                .map_err(|e| format!("Failed to read {}: {e}", file.display()))?;
            let chunk_file = ChunkFile::parse(&json)?;
            let runs = chunk_file.chunks_by_list()?;
            let deletes = chunk_file.chunk_deletes()?;

            sb.update_started().await?;
            let mut count = 0;
            for (list, chunks) in runs {
                count += chunks.len();
                sb.insert_chunks(&list, chunks).await?;
            }
            let delete_count = deletes.len();
            sb.delete_chunks(deletes).await?;
            sb.update_finished(true).await?;

            info!("Applied {}", file.display());
            println!("Ingested {count} chunks and {delete_count} deletes");
        }
        Commands::Delete(args) => {
            let mut deletes = Vec::new();
            if let Some(ranges) = &args.add {
                deletes.push(chunk_delete(&args.list, ranges, false)?);
            }
            if let Some(ranges) = &args.sub {
                deletes.push(chunk_delete(&args.list, ranges, true)?);
            }
            if deletes.is_empty() {
                return Err("Nothing to delete, pass --add or --sub".into());
            }
            sb.update_started().await?;
            sb.delete_chunks(deletes).await?;
            sb.update_finished(true).await?;
        }
        Commands::Lists => {
            for list in sb.get_lists_info().await? {
                println!("{};a:{}:s:{}", list.name, list.adds, list.subs);
            }
        }
        Commands::Stats => {
            println!("{}", sb.database_stats().await?);
        }
    }
    Ok(())
}

async fn check_url(sb: &SafeBrowser, url: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !safebrowsing::validate_url(url) {
        println!("INVALID {url}");
        return Ok(());
    }

    let checks = sb.lookup_urls(&[url]).await?;
    match checks.first() {
        Some(check) => println!("{} {url}", format_check(check)),
        None => warn!("No result for {}", url),
    }
    Ok(())
}

fn format_check(check: &UrlCheck) -> String {
    if let Some(list) = &check.matching_list {
        return format!("LISTED {list}");
    }
    if let Some(hit) = check.full_hits.first() {
        return format!("LISTED {}", hit.list_name);
    }
    if check.prefix_hits.is_empty() {
        return "SAFE".to_string();
    }
    let prefixes: Vec<String> = check
        .prefix_hits
        .iter()
        .map(|prefix| hex::encode(prefix.to_le_bytes()))
        .collect();
    format!("PREFIX {}", prefixes.join(","))
}
