//! Explicitly constructed gpg context
//!
//! A GpgContext bundles the configuration, the process runner, the record
//! parser and the gpg version detected once at construction. Callers build
//! one at startup and pass it around; nothing is cached globally.

use std::sync::Arc;

use tracing::{debug, info};

use crate::gpg::config::GpgConfig;
use crate::gpg::crypt::{self, Encryption};
use crate::gpg::error::GpgError;
use crate::gpg::key::KeyParser;
use crate::gpg::keyring::Keyring;
use crate::gpg::version::GpgVersion;
use crate::io::{CommandRunner, ProcessOutput, SubprocessRunner};

pub struct GpgContext {
    config: GpgConfig,
    runner: Arc<dyn CommandRunner>,
    parser: KeyParser,
    version: GpgVersion,
}

impl std::fmt::Debug for GpgContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpgContext")
            .field("config", &self.config)
            .field("runner", &"dyn CommandRunner")
            .field("version", &self.version)
            .finish()
    }
}

impl GpgContext {
    /// Build a context that runs gpg as a real subprocess
    pub async fn new(config: GpgConfig) -> Result<Self, GpgError> {
        let runner = SubprocessRunner::new(
            config.transfer.pump_options(),
            config.transfer.stop_grace,
        );
        Self::with_runner(config, Arc::new(runner)).await
    }

    /// Build a context on top of any runner, detecting the gpg version once
    pub async fn with_runner(
        config: GpgConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, GpgError> {
        let version = GpgVersion::detect(runner.as_ref(), &config).await?;
        info!("Using {} (GnuPG {})", config.gpg_path, version);

        Ok(Self {
            config,
            runner,
            parser: KeyParser::new()?,
            version,
        })
    }

    pub fn config(&self) -> &GpgConfig {
        &self.config
    }

    pub fn version(&self) -> &GpgVersion {
        &self.version
    }

    pub fn parser(&self) -> &KeyParser {
        &self.parser
    }

    /// Key listing, lookup and import
    pub fn keyring(&self) -> Keyring<'_> {
        Keyring::new(self)
    }

    /// Start an encryption of `data`; add recipients before calling `result`
    pub fn encrypt(&self, data: impl Into<Vec<u8>>) -> Encryption<'_> {
        Encryption::new(self, data)
    }

    /// Decrypt `ciphertext` with whatever secret keys gpg can reach
    pub async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, GpgError> {
        crypt::decrypt(self, ciphertext).await
    }

    /// Run gpg with `args` and fail on a non-zero exit
    pub async fn run(
        &self,
        args: impl IntoIterator<Item = impl Into<String>>,
        input: &[u8],
    ) -> Result<ProcessOutput, GpgError> {
        let output = self.run_unchecked(args, input).await?;
        Ok(output.into_success()?)
    }

    /// Run gpg with `args` and hand back the output whatever the exit status
    pub async fn run_unchecked(
        &self,
        args: impl IntoIterator<Item = impl Into<String>>,
        input: &[u8],
    ) -> Result<ProcessOutput, GpgError> {
        let invocation = self.config.invocation(args);
        let output = self.runner.run(&invocation, input).await?;
        debug!(
            "gpg exited with {:?}, {} stderr lines",
            output.code,
            output.stderr.len()
        );
        Ok(output)
    }
}
