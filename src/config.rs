use anyhow::{Context, Result, bail};
use clap::Parser;
use std::env;

use crate::services::blob_store::DEFAULT_CHUNK_SIZE;

/// Blob-store connection string (required).
pub const ENV_DSN: &str = "STORAGE_DSN";
/// Address to bind the HTTP server to.
pub const ENV_BIND_ADDR: &str = "STORAGE_ADDR";
/// Blob-store database name.
pub const ENV_DATABASE: &str = "STORAGE_GRIDFS_DB";
/// Blob-store collection prefix.
pub const ENV_PREFIX: &str = "STORAGE_GRIDFS_PREFIX";
/// Chunk size in bytes for new uploads.
pub const ENV_CHUNK_SIZE: &str = "STORAGE_CHUNK_SIZE";

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_PREFIX: &str = "fs";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub addr: String,
    pub dsn: String,
    pub database: String,
    pub prefix: String,
    pub chunk_size: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Object storage gateway over a chunked blob store")]
pub struct Args {
    /// Address to bind to (overrides STORAGE_ADDR)
    #[arg(long)]
    pub addr: Option<String>,

    /// Blob-store connection string (overrides STORAGE_DSN)
    #[arg(long)]
    pub dsn: Option<String>,

    /// Blob-store database name (overrides STORAGE_GRIDFS_DB)
    #[arg(long)]
    pub database: Option<String>,

    /// Blob-store collection prefix (overrides STORAGE_GRIDFS_PREFIX)
    #[arg(long)]
    pub prefix: Option<String>,

    /// Chunk size in bytes (overrides STORAGE_CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Create the blob-store schema and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        Self::resolve(args, |key| env::var(key).ok())
    }

    /// Merge `args` over the values `lookup` returns for each environment key.
    /// Empty values count as unset.
    pub fn resolve(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<(Self, bool)> {
        let env = |key: &str| lookup(key).filter(|value| !value.is_empty());

        let Some(dsn) = args.dsn.filter(|d| !d.is_empty()).or_else(|| env(ENV_DSN)) else {
            bail!("Environment not configured: {} is not set", ENV_DSN);
        };

        let chunk_size = match (args.chunk_size, env(ENV_CHUNK_SIZE)) {
            (Some(size), _) => size,
            (None, Some(value)) => value
                .parse::<usize>()
                .with_context(|| format!("parsing {} value `{}`", ENV_CHUNK_SIZE, value))?,
            (None, None) => DEFAULT_CHUNK_SIZE,
        };
        if chunk_size == 0 {
            bail!("chunk size must be greater than zero");
        }

        let addr = args
            .addr
            .or_else(|| env(ENV_BIND_ADDR))
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.into());

        let cfg = Self {
            addr: normalize_addr(&addr),
            dsn,
            database: args.database.or_else(|| env(ENV_DATABASE)).unwrap_or_default(),
            prefix: args
                .prefix
                .or_else(|| env(ENV_PREFIX))
                .unwrap_or_else(|| DEFAULT_PREFIX.into()),
            chunk_size,
        };

        Ok((cfg, args.migrate))
    }

    /// Host part of the bind address.
    pub fn host(&self) -> &str {
        self.addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.addr)
    }

    /// Port part of the bind address.
    pub fn port(&self) -> &str {
        self.addr
            .rsplit_once(':')
            .map(|(_, port)| port)
            .unwrap_or("")
    }
}

/// Accept the `:5000` shorthand for "all interfaces".
fn normalize_addr(addr: &str) -> String {
    match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => addr.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolve(args: &[&str], vars: &[(&str, &str)]) -> Result<(AppConfig, bool)> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let argv = std::iter::once("object-gateway").chain(args.iter().copied());
        let args = Args::try_parse_from(argv)?;
        AppConfig::resolve(args, |key| vars.get(key).cloned())
    }

    #[test]
    fn missing_dsn_is_fatal() {
        let err = resolve(&[], &[]).unwrap_err();
        assert!(err.to_string().contains(ENV_DSN));

        assert!(resolve(&[], &[(ENV_DSN, "")]).is_err());
    }

    #[test]
    fn defaults_apply_when_only_the_dsn_is_set() {
        let (cfg, migrate) = resolve(&[], &[(ENV_DSN, "sqlite://data/store.db")]).unwrap();

        assert_eq!(cfg.dsn, "sqlite://data/store.db");
        assert_eq!(cfg.addr, "0.0.0.0:5000");
        assert_eq!(cfg.database, "");
        assert_eq!(cfg.prefix, "fs");
        assert_eq!(cfg.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(!migrate);
    }

    #[test]
    fn flags_override_environment() {
        let (cfg, migrate) = resolve(
            &["--addr", "127.0.0.1:9000", "--prefix", "blobs", "--migrate"],
            &[
                (ENV_DSN, "sqlite::memory:"),
                (ENV_BIND_ADDR, ":7000"),
                (ENV_PREFIX, "files"),
                (ENV_DATABASE, "storage"),
            ],
        )
        .unwrap();

        assert_eq!(cfg.addr, "127.0.0.1:9000");
        assert_eq!(cfg.prefix, "blobs");
        assert_eq!(cfg.database, "storage");
        assert!(migrate);
    }

    #[test]
    fn port_only_address_binds_all_interfaces() {
        let vars = [(ENV_DSN, "sqlite::memory:"), (ENV_BIND_ADDR, ":7000")];
        let (cfg, _) = resolve(&[], &vars).unwrap();

        assert_eq!(cfg.addr, "0.0.0.0:7000");
        assert_eq!(cfg.host(), "0.0.0.0");
        assert_eq!(cfg.port(), "7000");
    }

    #[test]
    fn chunk_size_must_be_a_positive_number() {
        let dsn = (ENV_DSN, "sqlite::memory:");
        assert!(resolve(&[], &[dsn, (ENV_CHUNK_SIZE, "lots")]).is_err());
        assert!(resolve(&["--chunk-size", "0"], &[dsn]).is_err());

        let (cfg, _) = resolve(&[], &[dsn, (ENV_CHUNK_SIZE, "1024")]).unwrap();
        assert_eq!(cfg.chunk_size, 1024);
    }
}
