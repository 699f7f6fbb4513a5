//! gpgwrap: drive the gpg command line over a deadlock-free duplex pipe
//!
//! The `io` layer streams arbitrary input into a child process while
//! draining its output; the `gpg` layer turns that into key listing,
//! import, lookup, encryption and decryption.

pub mod gpg;
pub mod io;
pub mod logging;

#[cfg(test)]
mod test_utils;

#[cfg(all(test, feature = "test-logging"))]
crate::setup_test_logging!();

pub use gpg::{GpgConfig, GpgConfigBuilder, GpgContext, GpgError, Key, KeyLookup};
