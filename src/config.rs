//! Staging configuration
//!
//! Settings come from command line flags layered over environment variables
//! layered over defaults.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::warn;

use crate::ecfs::client::{DEFAULT_COPY_TOOL, DEFAULT_LIST_TOOL};
use crate::stage::StagingPolicy;

/// Which archive area paths refer to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveScheme {
    /// Permanent archive (`ec:`)
    Ec,
    /// Temporary archive area (`ectmp:`), stored under `/TMP`
    EcTmp,
}

/// Path prefix of the temporary archive area
pub const TMP_PREFIX: &str = "/TMP";

impl ArchiveScheme {
    /// Archive path a user-facing path refers to
    pub fn remote_path(&self, path: &str) -> String {
        let path = format!("/{}", path.trim_start_matches('/'));
        match self {
            ArchiveScheme::Ec => path,
            ArchiveScheme::EcTmp => {
                if path == TMP_PREFIX || path.starts_with("/TMP/") {
                    path
                } else if path == "/" {
                    TMP_PREFIX.to_string()
                } else {
                    format!("{}{}", TMP_PREFIX, path)
                }
            }
        }
    }

    /// User-facing path for an archive path
    pub fn user_path(&self, remote_path: &str) -> String {
        match self {
            ArchiveScheme::Ec => remote_path.to_string(),
            ArchiveScheme::EcTmp => match remote_path.strip_prefix(TMP_PREFIX) {
                Some("") => "/".to_string(),
                Some(rest) if rest.starts_with('/') => rest.to_string(),
                _ => remote_path.to_string(),
            },
        }
    }
}

/// Configuration consumed by the catalog, filesystem and CLI
#[derive(Debug, Clone)]
pub struct StageConfig {
    /// Root of the local staging cache
    pub cache_root: PathBuf,
    pub scheme: ArchiveScheme,
    pub policy: StagingPolicy,
    /// Retries of failed archive commands (0 disables)
    pub max_retries: u32,
    pub list_tool: String,
    pub copy_tool: String,
}

impl StageConfig {
    /// Build configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup
    ///
    /// # Variables
    /// * `EC_CACHE` - cache root, falling back to `SCRATCH` and then the platform cache dir
    /// * `EC_OVERRIDE`, `EC_TOUCH` - booleans
    /// * `EC_DELAY` - batching window in seconds
    /// * `EC_FILE_PERMISSIONS` - octal permission bits
    /// * `EC_MAX_RETRIES` - archive command retries
    /// * `ECFS_ELS`, `ECFS_ECP` - archive tool binaries
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let cache_root = match lookup("EC_CACHE").filter(|v| !v.is_empty()) {
            Some(dir) => PathBuf::from(dir),
            None => match lookup("SCRATCH").filter(|v| !v.is_empty()) {
                Some(dir) => {
                    warn!(cache = %dir, "EC_CACHE is not set, falling back to SCRATCH");
                    PathBuf::from(dir)
                }
                None => {
                    let dir = dirs::cache_dir()
                        .map(|d| d.join("ecfs-mount"))
                        .ok_or_else(|| anyhow!("No cache directory specified"))?;
                    warn!(cache = %dir.display(), "Neither EC_CACHE nor SCRATCH is set, using platform cache dir");
                    dir
                }
            },
        };

        let defaults = StagingPolicy::default();
        let policy = StagingPolicy {
            override_existing: match lookup("EC_OVERRIDE") {
                Some(v) => parse_bool(&v).context("Invalid EC_OVERRIDE")?,
                None => defaults.override_existing,
            },
            touch: match lookup("EC_TOUCH") {
                Some(v) => parse_bool(&v).context("Invalid EC_TOUCH")?,
                None => defaults.touch,
            },
            permissions: match lookup("EC_FILE_PERMISSIONS") {
                Some(v) => parse_octal(&v).context("Invalid EC_FILE_PERMISSIONS")?,
                None => defaults.permissions,
            },
            delay: match lookup("EC_DELAY") {
                Some(v) => parse_delay(&v).context("Invalid EC_DELAY")?,
                None => defaults.delay,
            },
        };

        let max_retries = match lookup("EC_MAX_RETRIES") {
            Some(v) => v
                .trim()
                .parse()
                .with_context(|| format!("Invalid EC_MAX_RETRIES: {}", v))?,
            None => 0,
        };

        Ok(Self {
            cache_root,
            scheme: ArchiveScheme::Ec,
            policy,
            max_retries,
            list_tool: lookup("ECFS_ELS").unwrap_or_else(|| DEFAULT_LIST_TOOL.to_string()),
            copy_tool: lookup("ECFS_ECP").unwrap_or_else(|| DEFAULT_COPY_TOOL.to_string()),
        })
    }
}

pub fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("expected a boolean, got '{}'", other)),
    }
}

pub fn parse_octal(value: &str) -> Result<u32> {
    let digits = value.trim().trim_start_matches("0o");
    let mode = u32::from_str_radix(digits, 8)
        .with_context(|| format!("expected octal permission bits, got '{}'", value))?;
    if mode > 0o7777 {
        return Err(anyhow!("permission bits out of range: {:o}", mode));
    }
    Ok(mode)
}

/// Seconds, fractional allowed
pub fn parse_delay(value: &str) -> Result<Duration> {
    let secs: f64 = value
        .trim()
        .parse()
        .with_context(|| format!("expected seconds, got '{}'", value))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(anyhow!("delay must be a non-negative number of seconds"));
    }
    Ok(Duration::from_secs_f64(secs))
}
