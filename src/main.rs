use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ouroboros_doccache::{
    CacheConfig, CacheError, CommandProvider, DeclaredLibrary, DocCache, DocumentationProvider,
    FetchOutcome, LoadOptions, PreloadSummary, ProviderDocument, SqliteDurableTier,
    StaticManifest,
};

#[derive(Parser)]
#[command(name = "doccache")]
#[command(about = "Proactive documentation cache for coding agents", long_about = None)]
struct Cli {
    /// SQLite database file (default: DOCCACHE_DB or the user data directory)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Provider command, called as `<provider> <args..> <library> <version> <query>`
    #[arg(long)]
    provider: Option<PathBuf>,

    /// Extra argument passed to the provider command before the lookup arguments
    #[arg(long = "provider-arg")]
    provider_args: Vec<String>,

    /// Use relaxed timeouts suited to batch runs
    #[arg(long)]
    batch: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the cache database
    Init,

    /// Look up documentation through the cache
    Query {
        /// Library id (e.g. "react")
        library: String,

        /// Question text
        text: String,

        /// Library version (only the major component is used)
        #[arg(short, long)]
        version: Option<String>,

        /// Project the query belongs to
        #[arg(short, long, default_value = ".")]
        project: PathBuf,
    },

    /// Preload the most likely libraries of a project
    Preload {
        /// Project directory
        #[arg(default_value = ".")]
        project: PathBuf,

        /// Declared library, `name` or `name@version` (repeatable)
        #[arg(short, long = "manifest")]
        manifest: Vec<String>,

        /// Maximum number of libraries to preload
        #[arg(short = 'n', long)]
        max: Option<usize>,

        /// Budget for the whole batch in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,
    },

    /// Load documentation for named libraries (`react@18 tokio`)
    Load {
        libraries: Vec<String>,

        /// Question to preload instead of the default
        #[arg(short, long)]
        query: Option<String>,

        /// Fetch even if already cached
        #[arg(long)]
        force: bool,
    },

    /// Remove an entry from both tiers
    Invalidate {
        /// Fingerprint (e.g. "react-18:hooks")
        fingerprint: String,
    },

    /// Show entry counters, or cache totals when no fingerprint is given
    Stats {
        fingerprint: Option<String>,

        /// Print the query log of the entry
        #[arg(long)]
        log: bool,
    },

    /// Refresh stale, recently read entries once
    Refresh,

    /// Rank preload candidates for a project
    Rank {
        #[arg(default_value = ".")]
        project: PathBuf,

        /// Declared library, `name` or `name@version` (repeatable)
        #[arg(short, long = "manifest")]
        manifest: Vec<String>,

        #[arg(short = 'n', long, default_value = "5")]
        top: usize,
    },
}

/// Stand-in when no provider command is configured; every fetch fails
struct NoProvider;

#[async_trait]
impl DocumentationProvider for NoProvider {
    async fn fetch(
        &self,
        _library_id: &str,
        _version: &str,
        _intent_query: &str,
    ) -> ouroboros_doccache::Result<ProviderDocument> {
        Err(CacheError::ProviderFailure(
            "no provider configured (use --provider or DOCCACHE_PROVIDER)".to_string(),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "ouroboros_doccache=info,doccache=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(&cli)?;

    if let Commands::Init = cli.command {
        let durable = SqliteDurableTier::open(&db_path).await?;
        durable.health_check().await?;
        durable.close().await;
        println!("Cache database initialized at {}", db_path.display());
        return Ok(());
    }

    let config = if cli.batch {
        CacheConfig::batch()
    } else {
        CacheConfig::from_env()?
    };
    let manifest = match &cli.command {
        Commands::Preload {
            project, manifest, ..
        } => StaticManifest::new()
            .with_project(project_key(project), StaticManifest::parse_specs(manifest.as_slice())),
        _ => StaticManifest::new(),
    };

    let cache = DocCache::open(&db_path, config, provider_from(&cli), Arc::new(manifest))
        .await
        .with_context(|| format!("opening cache at {}", db_path.display()))?;

    match &cli.command {
        Commands::Init => {}

        Commands::Query {
            library,
            text,
            version,
            project,
        } => {
            let response = cache
                .query(&project_key(project), library, version.as_deref(), text)
                .await?;

            match &response.outcome {
                FetchOutcome::Cached { tier, .. } => {
                    eprintln!("{} (cache hit, {} tier, {:?})", response.fingerprint, tier, response.elapsed)
                }
                FetchOutcome::Fetched { stored, .. } => eprintln!(
                    "{} (fetched live{}, {:?})",
                    response.fingerprint,
                    if *stored { "" } else { ", not cached" },
                    response.elapsed
                ),
                FetchOutcome::Unavailable { reason } => {
                    eprintln!("{}: not found ({})", response.fingerprint, reason)
                }
            }
            if let Some(content) = response.content() {
                println!("{}", content);
            }
        }

        Commands::Preload {
            project,
            max,
            timeout_ms,
            ..
        } => {
            let config = cache.config();
            let summary = cache
                .preload(
                    &project_key(project),
                    max.unwrap_or(config.preload_candidates),
                    timeout_ms
                        .map(Duration::from_millis)
                        .unwrap_or(config.preload_budget),
                )
                .await?;
            print_summary(&summary);
        }

        Commands::Load {
            libraries,
            query,
            force,
        } => {
            let summary = cache
                .load(
                    libraries.as_slice(),
                    LoadOptions {
                        query: query.clone(),
                        timeout: None,
                        force: *force,
                    },
                )
                .await?;
            print_summary(&summary);
        }

        Commands::Invalidate { fingerprint } => {
            if cache.invalidate(fingerprint).await? {
                println!("Invalidated {}", fingerprint);
            } else {
                anyhow::bail!("durable tier unreachable; {} not invalidated", fingerprint);
            }
        }

        Commands::Stats { fingerprint, log } => match fingerprint {
            Some(fingerprint) => {
                match cache.stats(fingerprint).await? {
                    Some(stats) => {
                        println!("Fingerprint:   {}", fingerprint);
                        println!("Query count:   {}", stats.query_count);
                        println!("Created:       {}", stats.created_at.format("%Y-%m-%d %H:%M:%S"));
                        println!("Last accessed: {}", stats.last_accessed_at.format("%Y-%m-%d %H:%M:%S"));
                    }
                    None => println!("{} is not cached", fingerprint),
                }
                if *log {
                    for row in cache.manager().query_log(fingerprint).await? {
                        println!(
                            "  {}  {:<4} {:>5}ms  {}",
                            row.created_at.format("%Y-%m-%d %H:%M:%S"),
                            if row.cache_hit { "hit" } else { "miss" },
                            row.response_time_ms,
                            row.original_query.as_deref().unwrap_or("-")
                        );
                    }
                }
            }
            None => {
                let summary = cache.summary().await?;
                println!("Cache Statistics");
                println!("{}", "=".repeat(40));
                println!("Entries:         {}", summary.entries);
                println!("Queries logged:  {}", summary.logged_queries);
                println!("Hits logged:     {}", summary.logged_hits);
                println!("Hit rate:        {:.1}%", summary.hit_rate());
            }
        },

        Commands::Refresh => {
            let refreshed = cache.refresh_now().await?;
            println!("Refreshed {} entries", refreshed);
        }

        Commands::Rank {
            project,
            manifest,
            top,
        } => {
            let declared: Vec<DeclaredLibrary> = StaticManifest::parse_specs(manifest.as_slice());
            let ranked = cache.rank(&project_key(project), &declared, *top).await?;
            if ranked.is_empty() {
                println!("No candidates for {}", project.display());
            }
            for (i, library) in ranked.iter().enumerate() {
                println!("{:>2}. {}", i + 1, library);
            }
        }
    }

    cache.shutdown().await;
    Ok(())
}

fn resolve_db_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(ref db) = cli.db {
        return Ok(db.clone());
    }
    if let Ok(db) = std::env::var("DOCCACHE_DB") {
        return Ok(PathBuf::from(db));
    }
    let data_dir = dirs::data_dir().context("no user data directory; pass --db")?;
    Ok(data_dir.join("doccache").join("cache.db"))
}

fn provider_from(cli: &Cli) -> Arc<dyn DocumentationProvider> {
    let program = cli
        .provider
        .clone()
        .or_else(|| std::env::var("DOCCACHE_PROVIDER").ok().map(PathBuf::from));

    match program {
        Some(program) => {
            Arc::new(CommandProvider::new(program).with_args(cli.provider_args.clone()))
        }
        None => Arc::new(NoProvider),
    }
}

/// Projects are keyed by canonical path so `.` and the absolute path agree
fn project_key(project: &Path) -> String {
    std::fs::canonicalize(project)
        .unwrap_or_else(|_| project.to_path_buf())
        .display()
        .to_string()
}

fn print_summary(summary: &PreloadSummary) {
    for result in &summary.results {
        println!(
            "  {:<24} {:<32} {:?}",
            result.library_id,
            result.fingerprint.as_deref().unwrap_or("-"),
            result.outcome
        );
    }
    println!("{}", summary);
}
