use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::gpg::config::GpgConfig;
use crate::gpg::error::GpgError;
use crate::io::CommandRunner;

#[derive(Error, Debug)]
pub enum VersionError {
    #[error("Failed to parse gpg version output")]
    ParseFailed,
    #[error("Invalid version format: {0}")]
    InvalidFormat(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpgVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    /// Distribution suffix such as `unknown` in `2.4.4-unknown`
    pub variant: Option<String>,
    /// Keyring directory gpg reports on its `Home:` line
    pub home: Option<PathBuf>,
}

impl GpgVersion {
    /// Detect the gpg version by running `--version` through `runner`
    pub async fn detect(runner: &dyn CommandRunner, config: &GpgConfig) -> Result<Self, GpgError> {
        let output = runner
            .run(&config.invocation(["--version"]), b"")
            .await?
            .into_success()?;

        Ok(Self::parse_version_output(&output.stdout_lossy())?)
    }

    pub fn parse_version_output(output: &str) -> Result<Self, VersionError> {
        // Look for "gpg (GnuPG) 2.2.27" or "gpg (GnuPG/MacGPG2) 2.2.24"
        let version_line = output
            .lines()
            .find(|line| line.starts_with("gpg (GnuPG"))
            .ok_or(VersionError::ParseFailed)?;

        let version_start = version_line
            .find(") ")
            .ok_or(VersionError::ParseFailed)?
            + ") ".len();

        let version_str = version_line[version_start..].trim();

        let mut dot_parts = version_str.splitn(3, '.');

        let major = dot_parts
            .next()
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or_else(|| VersionError::InvalidFormat("major version".to_string()))?;

        let minor = dot_parts
            .next()
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or_else(|| VersionError::InvalidFormat("minor version".to_string()))?;

        let patch_part = dot_parts
            .next()
            .ok_or_else(|| VersionError::InvalidFormat("patch version".to_string()))?;

        let digits_end = patch_part
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(patch_part.len());

        let patch = patch_part[..digits_end]
            .parse::<u32>()
            .map_err(|_| VersionError::InvalidFormat("patch version".to_string()))?;

        let variant = patch_part[digits_end..]
            .trim_start_matches(['-', '_', '.'])
            .split_whitespace()
            .next()
            .map(|s| s.to_string());

        let home = output
            .lines()
            .find_map(|line| line.strip_prefix("Home:"))
            .map(|home| PathBuf::from(home.trim()));

        Ok(GpgVersion {
            major,
            minor,
            patch,
            variant,
            home,
        })
    }

    /// Whether this version is at least `major.minor.patch`
    pub fn at_least(&self, major: u32, minor: u32, patch: u32) -> bool {
        (self.major, self.minor, self.patch) >= (major, minor, patch)
    }

    /// `--import-options show-only` exists from 2.1.14 on
    pub fn supports_show_only(&self) -> bool {
        self.at_least(2, 1, 14)
    }
}

impl fmt::Display for GpgVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(variant) = &self.variant {
            write!(f, "-{}", variant)?;
        }
        Ok(())
    }
}
