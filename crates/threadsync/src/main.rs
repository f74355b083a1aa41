//! threadsync: operator CLI for persisted threadiverse caches
//!
//! Subcommands:
//! - `stats`: Entry counts and ages per entity kind
//! - `gc`: Evict stale entries, optionally purge a namespace
//! - `thread`: Render a comment thread from a JSON comment list

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Duration;
use clap::{Args, Parser, Subcommand};
use miette::Result;
use threadsync_cache::{BlobStore, CacheConfig, CachePrefix, FileBlobStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Login namespace selector. Takes the namespace names used in cache keys
/// (`auth`, `anon`) as well as plain booleans, so `THREADSYNC_AUTHENTICATED`
/// can be copied from a key or set like any other flag.
fn parse_namespace_mode(value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "auth" | "authenticated" | "1" | "true" | "yes" => Ok(true),
        "anon" | "anonymous" | "0" | "false" | "no" | "" => Ok(false),
        other => Err(format!("unknown namespace '{other}', expected auth or anon")),
    }
}

mod inspect;
mod thread;

#[derive(Parser)]
#[command(name = "threadsync")]
#[command(about = "Inspect and maintain threadiverse client caches", long_about = None)]
struct Cli {
    #[command(flatten)]
    cache: CacheArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Where the caches live and which namespace to look at.
#[derive(Args, Debug, Clone)]
pub struct CacheArgs {
    /// Cache directory (defaults to the platform cache dir)
    #[arg(long, global = true, env = "THREADSYNC_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Instance host, e.g. lemmy.world
    #[arg(long, global = true, env = "THREADSYNC_INSTANCE")]
    instance: Option<String>,

    /// Namespace of the instance: auth (logged in) or anon
    #[arg(long, global = true, env = "THREADSYNC_AUTHENTICATED", value_parser = parse_namespace_mode, action = clap::ArgAction::Set, default_value = "anon")]
    authenticated: bool,

    /// Days since last use before an entry is evicted
    #[arg(long, global = true, env = "THREADSYNC_MAX_AGE_DAYS", default_value = "7")]
    max_age_days: i64,
}

impl CacheArgs {
    fn cache_dir(&self) -> Result<PathBuf> {
        match &self.cache_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::cache_dir()
                .map(|dir| dir.join("threadsync"))
                .ok_or_else(|| miette::miette!("no platform cache directory, pass --cache-dir")),
        }
    }

    fn open_blob(&self) -> Result<Arc<dyn BlobStore>> {
        let dir = self.cache_dir()?;
        let blob = FileBlobStore::open(&dir)
            .map_err(|e| miette::miette!("failed to open cache directory {}: {}", dir.display(), e))?;
        Ok(Arc::new(blob))
    }

    /// Namespace selected by `--instance`/`--authenticated`, if any.
    fn prefix(&self) -> Option<CachePrefix> {
        self.instance
            .as_deref()
            .map(|host| CachePrefix::new(host, self.authenticated))
    }

    fn cache_config(&self) -> Result<CacheConfig> {
        if self.max_age_days < 0 {
            return Err(miette::miette!("--max-age-days must not be negative"));
        }
        Ok(CacheConfig {
            max_age: Duration::days(self.max_age_days),
        })
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Show entry counts per entity kind
    Stats,

    /// Evict entries unused for longer than the maximum age
    Gc {
        /// Also drop every entry of the selected namespace
        /// (all namespaces if no instance is given)
        #[arg(long)]
        purge: bool,
    },

    /// Render a comment thread from a JSON array of comments
    Thread {
        /// Path to the comments file
        #[arg(value_name = "COMMENTS_JSON")]
        file: PathBuf,

        /// Only show the subtree at this path, e.g. 12.34
        #[arg(long)]
        focus: Option<String>,

        /// Maximum number of path segments to include
        #[arg(long, default_value = "10")]
        max_depth: usize,
    },
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "threadsync=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Stats => {
            let prefix = cli.cache.prefix();
            let blob = cli.cache.open_blob()?;
            let rows = inspect::stats(blob, cli.cache.cache_config()?, prefix.as_ref())?;
            print!("{}", inspect::format_stats(&rows, prefix.as_ref()));
            Ok(())
        }

        Commands::Gc { purge } => {
            let blob = cli.cache.open_blob()?;
            let reports = inspect::gc(
                blob,
                cli.cache.cache_config()?,
                cli.cache.prefix().as_ref(),
                purge,
            )?;
            for report in reports {
                println!(
                    "{:<12} {:>6} -> {:>6}",
                    report.kind.as_str(),
                    report.before,
                    report.after
                );
            }
            Ok(())
        }

        Commands::Thread {
            file,
            focus,
            max_depth,
        } => thread::run(&file, focus.as_deref(), max_depth),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_mode_accepts_key_names() {
        assert_eq!(parse_namespace_mode("auth"), Ok(true));
        assert_eq!(parse_namespace_mode(" Anon "), Ok(false));
        assert_eq!(parse_namespace_mode("1"), Ok(true));
        assert_eq!(parse_namespace_mode(""), Ok(false));
        assert!(parse_namespace_mode("maybe").is_err());
    }

    #[test]
    fn test_instance_selects_prefix() {
        let cli = Cli::parse_from([
            "threadsync",
            "--instance",
            "lemmy.world",
            "--authenticated",
            "auth",
            "stats",
        ]);

        let prefix = cli.cache.prefix().unwrap();
        assert_eq!(prefix.as_str(), "lemmy.world/auth/");
    }
}
