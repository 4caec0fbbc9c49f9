//! Engine configuration.
//!
//! Plain struct with defaults, builder setters and an environment reader.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::error::{NocturneError, Result};
use crate::store::StoreOptions;

pub const DATA_DIR_ENV: &str = "NOCTURNE_DATA_DIR";
pub const OP_TIMEOUT_ENV: &str = "NOCTURNE_OP_TIMEOUT_MS";
pub const WRITE_RETRIES_ENV: &str = "NOCTURNE_WRITE_RETRIES";
pub const MAX_WRITERS_ENV: &str = "NOCTURNE_MAX_WRITERS";
pub const SIGNING_KEY_ENV: &str = "NOCTURNE_SIGNING_KEY";

/// Upper bound on `write_retries`.
pub const MAX_WRITE_RETRIES: u32 = 10;

#[derive(Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Filesystem persistence root; `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    pub op_timeout: Duration,
    pub write_retries: u32,
    pub max_writers: usize,
    /// Hex Ed25519 seed. Overrides any key stored under `data_dir`.
    pub signing_key: Option<String>,
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("data_dir", &self.data_dir)
            .field("op_timeout", &self.op_timeout)
            .field("write_retries", &self.write_retries)
            .field("max_writers", &self.max_writers)
            .field("signing_key", &self.signing_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let store = StoreOptions::default();
        Self {
            data_dir: None,
            op_timeout: store.op_timeout,
            write_retries: store.write_retries,
            max_writers: store.max_writers,
            signing_key: None,
        }
    }
}

impl EngineConfig {
    /// Persist under `dir`.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    pub fn with_write_retries(mut self, retries: u32) -> Self {
        self.write_retries = retries;
        self
    }

    pub fn with_max_writers(mut self, writers: usize) -> Self {
        self.max_writers = writers;
        self
    }

    pub fn with_signing_key(mut self, seed_hex: impl Into<String>) -> Self {
        self.signing_key = Some(seed_hex.into());
        self
    }

    /// Create from environment variables
    ///
    /// Reads (all optional):
    /// - NOCTURNE_DATA_DIR
    /// - NOCTURNE_OP_TIMEOUT_MS (default: 5000)
    /// - NOCTURNE_WRITE_RETRIES (default: 3, at most 10)
    /// - NOCTURNE_MAX_WRITERS (default: 8)
    /// - NOCTURNE_SIGNING_KEY
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(dir) = lookup(DATA_DIR_ENV).filter(|v| !v.trim().is_empty()) {
            config.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(ms) = parse_var::<u64>(&lookup, OP_TIMEOUT_ENV)? {
            config.op_timeout = Duration::from_millis(ms);
        }
        if let Some(retries) = parse_var(&lookup, WRITE_RETRIES_ENV)? {
            config.write_retries = retries;
        }
        if let Some(writers) = parse_var(&lookup, MAX_WRITERS_ENV)? {
            config.max_writers = writers;
        }
        config.signing_key = lookup(SIGNING_KEY_ENV).filter(|v| !v.trim().is_empty());
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.op_timeout.is_zero() {
            return Err(NocturneError::InvalidConfig(
                "operation timeout must be positive".to_string(),
            ));
        }
        if self.write_retries > MAX_WRITE_RETRIES {
            return Err(NocturneError::InvalidConfig(format!(
                "write_retries must be at most {MAX_WRITE_RETRIES}"
            )));
        }
        if self.max_writers == 0 {
            return Err(NocturneError::InvalidConfig(
                "max_writers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            op_timeout: self.op_timeout,
            write_retries: self.write_retries,
            max_writers: self.max_writers,
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| NocturneError::InvalidConfig(format!("{key}={raw:?}: {e}"))),
    }
}
