//! Configuration for talking to gpg
//!
//! Provides GpgConfig with a validating builder. Every invocation built from
//! a config runs in batch mode and, when a homedir is set, against that
//! keyring only.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::gpg::error::ConfigError;
use crate::io::Invocation;
use crate::io::process::DEFAULT_STOP_GRACE_MILLIS;
use crate::io::transport::{DEFAULT_CHUNK_SIZE, DEFAULT_POLL_INTERVAL_SECS, PumpOptions};

// ============================================================================
// Configuration Constants
// ============================================================================

/// Executable used when neither the CLI nor `GPG_PATH` names one
pub const DEFAULT_GPG_PATH: &str = "gpg";

/// Environment variable overriding the gpg executable
pub const GPG_PATH_ENV: &str = "GPG_PATH";

/// Largest accepted transfer chunk (16 MiB)
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

// ============================================================================
// Core Configuration Types
// ============================================================================

#[derive(Debug, Clone)]
pub struct GpgConfig {
    /// Path to the gpg executable
    pub gpg_path: String,

    /// Keyring directory passed as `--homedir`
    pub homedir: Option<PathBuf>,

    /// Extra arguments placed before every command
    pub extra_args: Vec<String>,

    pub transfer: TransferConfig,

    pub encryption: EncryptionConfig,
}

/// How data is streamed through the gpg process
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Maximum bytes per pipe write or read
    pub chunk_size: usize,

    /// Bound on a single readiness wait
    pub poll_interval: Duration,

    /// Optional limit on a whole invocation
    pub deadline: Option<Duration>,

    /// Time gpg gets to exit after SIGTERM
    pub stop_grace: Duration,

    /// Cancels every in-flight invocation built from this config
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionConfig {
    /// ASCII-armor ciphertext (`--armor`)
    pub armor: bool,

    /// Encrypt to keys regardless of their trust level (`--trust-model always`)
    pub always_trust: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            deadline: None,
            stop_grace: Duration::from_millis(DEFAULT_STOP_GRACE_MILLIS),
            cancel: CancellationToken::new(),
        }
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            armor: false,
            always_trust: true,
        }
    }
}

impl TransferConfig {
    pub fn pump_options(&self) -> PumpOptions {
        PumpOptions {
            chunk_size: self.chunk_size,
            poll_interval: self.poll_interval,
            deadline: self.deadline,
            cancel: self.cancel.clone(),
        }
    }
}

impl GpgConfig {
    /// Default configuration with the executable resolved from the environment
    pub fn from_env() -> Result<Self, ConfigError> {
        GpgConfigBuilder::new()
            .gpg_path(resolve_gpg_path(None))
            .build()
    }

    /// Arguments shared by every invocation
    pub fn base_args(&self) -> Vec<String> {
        let mut args = vec!["--batch".to_string(), "--no-tty".to_string()];
        if let Some(homedir) = &self.homedir {
            args.push("--homedir".to_string());
            args.push(homedir.to_string_lossy().into_owned());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// Build a full gpg invocation for `args`
    pub fn invocation(&self, args: impl IntoIterator<Item = impl Into<String>>) -> Invocation {
        Invocation::new(&self.gpg_path)
            .args(self.base_args())
            .args(args)
    }
}

/// Resolve the gpg executable: CLI arg > `GPG_PATH` env var > "gpg"
pub fn resolve_gpg_path(gpg_path_arg: Option<String>) -> String {
    gpg_path_arg
        .or_else(|| std::env::var(GPG_PATH_ENV).ok())
        .filter(|path| !path.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_GPG_PATH.to_string())
}

// ============================================================================
// Configuration Builder
// ============================================================================

#[derive(Debug, Default)]
pub struct GpgConfigBuilder {
    gpg_path: Option<String>,
    homedir: Option<PathBuf>,
    extra_args: Vec<String>,
    chunk_size: Option<usize>,
    poll_interval: Option<Duration>,
    deadline: Option<Duration>,
    stop_grace: Option<Duration>,
    cancel: Option<CancellationToken>,
    armor: Option<bool>,
    always_trust: Option<bool>,
}

impl GpgConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gpg_path(mut self, path: impl Into<String>) -> Self {
        self.gpg_path = Some(path.into());
        self
    }

    pub fn homedir(mut self, path: impl Into<PathBuf>) -> Self {
        self.homedir = Some(path.into());
        self
    }

    pub fn add_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    pub fn add_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_args
            .extend(args.into_iter().map(|arg| arg.into()));
        self
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = Some(size);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Limit every invocation to `deadline` of wall-clock time
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = Some(grace);
        self
    }

    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn armor(mut self, armor: bool) -> Self {
        self.armor = Some(armor);
        self
    }

    pub fn always_trust(mut self, always_trust: bool) -> Self {
        self.always_trust = Some(always_trust);
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> Result<GpgConfig, ConfigError> {
        let gpg_path = self
            .gpg_path
            .unwrap_or_else(|| DEFAULT_GPG_PATH.to_string());
        if gpg_path.trim().is_empty() {
            return Err(ConfigError::missing_field("gpg_path"));
        }

        if let Some(homedir) = &self.homedir {
            validate_homedir(homedir)?;
        }

        let defaults = TransferConfig::default();

        let chunk_size = self.chunk_size.unwrap_or(defaults.chunk_size);
        if chunk_size == 0 {
            return Err(ConfigError::invalid_chunk_size(chunk_size, "must be positive"));
        }
        if chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::invalid_chunk_size(
                chunk_size,
                format!("must not exceed {} bytes", MAX_CHUNK_SIZE),
            ));
        }

        let poll_interval = self.poll_interval.unwrap_or(defaults.poll_interval);
        if poll_interval.is_zero() {
            return Err(ConfigError::invalid_timeout(
                poll_interval,
                "poll interval must be positive",
            ));
        }

        if let Some(deadline) = self.deadline {
            if deadline.is_zero() {
                return Err(ConfigError::invalid_timeout(
                    deadline,
                    "deadline must be positive",
                ));
            }
        }

        let encryption_defaults = EncryptionConfig::default();

        Ok(GpgConfig {
            gpg_path,
            homedir: self.homedir,
            extra_args: self.extra_args,
            transfer: TransferConfig {
                chunk_size,
                poll_interval,
                deadline: self.deadline,
                stop_grace: self.stop_grace.unwrap_or(defaults.stop_grace),
                cancel: self.cancel.unwrap_or(defaults.cancel),
            },
            encryption: EncryptionConfig {
                armor: self.armor.unwrap_or(encryption_defaults.armor),
                always_trust: self.always_trust.unwrap_or(encryption_defaults.always_trust),
            },
        })
    }
}

fn validate_homedir(path: &Path) -> Result<(), ConfigError> {
    let metadata = std::fs::metadata(path).map_err(|source| ConfigError::HomedirValidation {
        path: path.to_path_buf(),
        source,
    })?;

    if !metadata.is_dir() {
        return Err(ConfigError::HomedirNotDirectory {
            path: path.to_path_buf(),
        });
    }

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
