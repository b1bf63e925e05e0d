use crate::services::{contents_cache::DEFAULT_CAPACITY, patcher::DEFAULT_MAX_ARCHIVE_BYTES};
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::env;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub staging_dir: String,
    pub patch_dir: String,
    pub locations: Vec<LocationSpec>,
    pub session_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub max_chunk_bytes: usize,
    pub patch_workers: usize,
    pub patch_block_size: usize,
    pub patch_max_archive_bytes: u64,
    pub contents_cache_capacity: u64,
}

/// A storage location as given on the command line or in the environment,
/// e.g. `games=/srv/games` or `mirror=s3://bucket/prefix`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationSpec {
    pub id: String,
    pub target: String,
}

impl LocationSpec {
    pub fn parse(raw: &str) -> Result<Self> {
        let (id, target) = raw
            .split_once('=')
            .with_context(|| format!("storage location `{}` must look like id=path", raw))?;
        let id = id.trim();
        let target = target.trim();
        if id.is_empty() || target.is_empty() {
            bail!("storage location `{}` has an empty id or path", raw);
        }
        Ok(Self {
            id: id.to_string(),
            target: target.to_string(),
        })
    }

    /// Remote targets are addressed by URI instead of a local directory.
    pub fn is_remote(&self) -> bool {
        ["s3://", "http://", "https://"]
            .iter()
            .any(|scheme| self.target.starts_with(scheme))
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Game archive storage and chunked upload server")]
pub struct Args {
    /// Host to bind to (overrides ARCHIVE_VAULT_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides ARCHIVE_VAULT_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides ARCHIVE_VAULT_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Directory holding in-flight upload staging files (overrides ARCHIVE_VAULT_STAGING_DIR)
    #[arg(long)]
    pub staging_dir: Option<String>,

    /// Directory where generated patches are written (overrides ARCHIVE_VAULT_PATCH_DIR)
    #[arg(long)]
    pub patch_dir: Option<String>,

    /// Storage location as `id=path`; repeatable (overrides ARCHIVE_VAULT_LOCATIONS)
    #[arg(long = "location")]
    pub locations: Vec<String>,

    /// Idle seconds before an unfinished upload session is discarded
    #[arg(long)]
    pub session_timeout_secs: Option<u64>,

    /// Seconds between expired-session sweeps
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Largest accepted chunk request body in bytes
    #[arg(long)]
    pub max_chunk_bytes: Option<usize>,

    /// Number of background patch workers
    #[arg(long)]
    pub patch_workers: Option<usize>,

    /// Delta block size in bytes (overrides ARCHIVE_VAULT_PATCH_BLOCK_SIZE)
    #[arg(long)]
    pub patch_block_size: Option<usize>,

    /// Largest archive in bytes loaded into memory for patching
    #[arg(long)]
    pub patch_max_archive_bytes: Option<u64>,

    /// Maximum number of archive content trees kept in memory
    #[arg(long)]
    pub contents_cache_capacity: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args)?, migrate))
    }

    fn merge(args: Args) -> Result<Self> {
        // --- Environment fallback ---
        let env_host = env::var("ARCHIVE_VAULT_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_number("ARCHIVE_VAULT_PORT", 3000u16)?;
        let env_db = env::var("ARCHIVE_VAULT_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/archive_vault.db".into());
        let env_staging =
            env::var("ARCHIVE_VAULT_STAGING_DIR").unwrap_or_else(|_| "./data/staging".into());
        let env_patches =
            env::var("ARCHIVE_VAULT_PATCH_DIR").unwrap_or_else(|_| "./data/patches".into());
        let env_locations =
            env::var("ARCHIVE_VAULT_LOCATIONS").unwrap_or_else(|_| "default=./data/archives".into());

        let raw_locations: Vec<String> = if args.locations.is_empty() {
            env_locations
                .split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        } else {
            args.locations
        };
        let locations = raw_locations
            .iter()
            .map(|raw| LocationSpec::parse(raw))
            .collect::<Result<Vec<_>>>()?;

        // --- Merge ---
        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            staging_dir: args.staging_dir.unwrap_or(env_staging),
            patch_dir: args.patch_dir.unwrap_or(env_patches),
            locations,
            session_timeout_secs: match args.session_timeout_secs {
                Some(v) => v,
                None => env_number("ARCHIVE_VAULT_SESSION_TIMEOUT_SECS", 3600)?,
            },
            sweep_interval_secs: match args.sweep_interval_secs {
                Some(v) => v,
                None => env_number("ARCHIVE_VAULT_SWEEP_INTERVAL_SECS", 60)?,
            },
            max_chunk_bytes: match args.max_chunk_bytes {
                Some(v) => v,
                None => env_number("ARCHIVE_VAULT_MAX_CHUNK_BYTES", 64 * 1024 * 1024)?,
            },
            patch_workers: match args.patch_workers {
                Some(v) => v.max(1),
                None => env_number("ARCHIVE_VAULT_PATCH_WORKERS", 2usize)?.max(1),
            },
            patch_block_size: match args.patch_block_size {
                Some(v) => v,
                None => env_number("ARCHIVE_VAULT_PATCH_BLOCK_SIZE", 4096usize)?,
            },
            patch_max_archive_bytes: match args.patch_max_archive_bytes {
                Some(v) => v,
                None => env_number(
                    "ARCHIVE_VAULT_PATCH_MAX_ARCHIVE_BYTES",
                    DEFAULT_MAX_ARCHIVE_BYTES,
                )?,
            },
            contents_cache_capacity: match args.contents_cache_capacity {
                Some(v) => v,
                None => env_number("ARCHIVE_VAULT_CONTENTS_CACHE_CAPACITY", DEFAULT_CAPACITY)?,
            },
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_number<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_spec_splits_on_first_equals() {
        let spec = LocationSpec::parse("games=/srv/a=b").unwrap();
        assert_eq!(spec.id, "games");
        assert_eq!(spec.target, "/srv/a=b");
        assert!(!spec.is_remote());
    }

    #[test]
    fn location_spec_detects_remote_targets() {
        assert!(LocationSpec::parse("m=s3://bucket/games").unwrap().is_remote());
        assert!(LocationSpec::parse("m=https://cdn.example/x").unwrap().is_remote());
    }

    #[test]
    fn location_spec_rejects_malformed() {
        assert!(LocationSpec::parse("no-separator").is_err());
        assert!(LocationSpec::parse("=/srv").is_err());
        assert!(LocationSpec::parse("id=").is_err());
    }

    #[test]
    fn cli_locations_override_environment() {
        let args = Args::parse_from([
            "archive-vault",
            "--location",
            "games=/tmp/games",
            "--location",
            "redist=/tmp/redist",
            "--port",
            "8081",
            "--patch-block-size",
            "1024",
            "--contents-cache-capacity",
            "16",
        ]);
        let cfg = AppConfig::merge(args).unwrap();
        assert_eq!(cfg.port, 8081);
        assert_eq!(cfg.patch_block_size, 1024);
        assert_eq!(cfg.contents_cache_capacity, 16);
        assert_eq!(cfg.locations.len(), 2);
        assert_eq!(cfg.locations[1].id, "redist");
        assert_eq!(cfg.addr(), format!("{}:8081", cfg.host));
    }
}
