//! GPG front end
//!
//! Builds gpg invocations, feeds them through the duplex transport and
//! interprets the colon listings that come back.
//!
//! # Architecture
//!
//! - **GpgContext**: configuration, runner, parser and detected version
//! - **Keyring**: listing, lookup by address, import and removal
//! - **Encryption**: recipient resolution and `--encrypt`
//! - **KeyParser**: colon-format records into [`Key`] values
//!
//! # Usage
//!
//! ```no_run
//! # async fn demo() -> Result<(), gpgwrap::gpg::GpgError> {
//! use gpgwrap::gpg::{GpgConfigBuilder, GpgContext};
//!
//! let config = GpgConfigBuilder::new().armor(true).build()?;
//! let ctx = GpgContext::new(config).await?;
//!
//! let ciphertext = ctx
//!     .encrypt("attack at dawn")
//!     .recipients(&["john@example.com"])
//!     .await?
//!     .result()
//!     .await?;
//! # let _ = ciphertext;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod crypt;
pub mod error;
pub mod key;
pub mod keyring;
pub mod version;

pub use config::{GpgConfig, GpgConfigBuilder, resolve_gpg_path};
pub use context::GpgContext;
pub use crypt::Encryption;
pub use error::{ConfigError, GpgError};
pub use key::{Key, KeyLookup, KeyParser, MalformedRecord, Validity};
pub use keyring::{ImportReport, Imported, Keyring, SkippedFile};
pub use version::{GpgVersion, VersionError};
