//! Test utilities and global setup
//!
//! Provides test logging, colon-listing fixtures and, behind the
//! `gpg-integration-tests` feature, throwaway keyrings for a real gpg.

/// Test logging utilities
#[cfg(all(test, feature = "test-logging"))]
pub mod logging {
    use std::sync::Once;
    use tracing_subscriber::{EnvFilter, fmt};

    static INIT: Once = Once::new();

    /// Initialize test logging globally - safe to call multiple times
    ///
    /// ```bash
    /// RUST_LOG=gpgwrap=trace cargo test --features test-logging
    /// ```
    pub fn init() {
        INIT.call_once(|| {
            let env_filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("debug,tokio=info"));

            fmt()
                .with_env_filter(env_filter)
                .with_test_writer()
                .with_target(true)
                .with_thread_ids(true)
                .compact()
                .try_init()
                .ok();
        });
    }
}

/// Install test logging for every test in the invoking module
#[cfg(all(test, feature = "test-logging"))]
#[macro_export]
macro_rules! setup_test_logging {
    () => {
        #[ctor::ctor]
        fn init_test_logging() {
            $crate::test_utils::logging::init();
        }
    };
}

/// Colon-listing fixtures
pub mod fixtures {
    /// A key whose only user id carries no address
    pub const PGP_GLOBAL_DIRECTORY_LINE: &str =
        "pub:-:2048:1:9710B89BCA57AD7C:2004-12-06:::-:PGP Global Directory Verification Key::scSC:";

    pub const JOHN_EXAMPLE_LINE: &str =
        "pub:u:2048:17:0247FEC05FDA4350:2010-09-13:::u:John Example <john@example.com>::scESC:";

    /// `--fixed-list-mode` output of gpg 2.x: user ids live on `uid` records
    pub const MODERN_LISTING: &str = "\
tru::1:1700000000:0:3:1:5
pub:f:3072:1:3AA5C34371567BD2:1699920000:::f:::scESC::::::23::0:
fpr:::::::::C4A1F1F5A6E0D5D3E2B9A8C73AA5C34371567BD2:
uid:f::::1699920000::8C2B1E3F::Mark Example <mark@example.com>::::::::::0:
uid:f::::1699920000::9D3C2F40::Mark at Work <Mark@Work.example>::::::::::0:
sub:f:3072:1:5B2D1E0F9C8A7B6D:1699920000::::::e::::::23:
fpr:::::::::0F1E2D3C4B5A69788796A5B45B2D1E0F9C8A7B6D:
pub:r:2048:1:1122334455667788:1500000000:::-:::sc::::::23::0:
fpr:::::::::AABBCCDDEEFF0011223344551122334455667788:
uid:r::::1500000000::7A6B5C4D::Old Key <old@example.com>::::::::::0:
";

    /// John's key as a one-line listing, preceded by the address-less directory key
    pub fn global_directory_and_john() -> String {
        format!("{}\n{}\n", PGP_GLOBAL_DIRECTORY_LINE, JOHN_EXAMPLE_LINE)
    }

    /// A minimal modern stanza for `name <email>` with the given key id
    pub fn stanza(key_id: &str, name: &str, email: &str) -> String {
        format!(
            "pub:-:255:22:{key_id}:1699920000:::-:::scESC::::::ed25519::0:\n\
             fpr:::::::::000000000000000000000000{key_id}:\n\
             uid:-::::1699920000::0::{name} <{email}>::::::::::0:\n"
        )
    }

    pub const VERSION_OUTPUT: &str = "gpg (GnuPG) 2.2.40\nlibgcrypt 1.10.1\nHome: /tmp/gnupg\n";
}

/// Get the gpg path for integration tests
///
/// Checks the GPG_PATH environment variable and falls back to "gpg".
#[cfg(all(test, feature = "gpg-integration-tests"))]
pub fn get_test_gpg_path() -> String {
    std::env::var("GPG_PATH").unwrap_or_else(|_| "gpg".to_string())
}

/// Throwaway keyrings backed by a real gpg
#[cfg(all(test, feature = "gpg-integration-tests"))]
pub mod integration {
    use std::path::Path;
    use std::process::Command;
    use tempfile::TempDir;

    use super::get_test_gpg_path;

    /// A gpg homedir that disappears with the value
    pub struct TestKeyring {
        pub dir: TempDir,
    }

    impl TestKeyring {
        pub fn new() -> Self {
            let dir = tempfile::Builder::new()
                .prefix("gpgwrap-test-")
                .tempdir()
                .expect("Failed to create temp homedir");

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o700))
                    .expect("Failed to restrict homedir permissions");
            }

            Self { dir }
        }

        pub fn path(&self) -> &Path {
            self.dir.path()
        }

        fn gpg(&self) -> Command {
            let mut command = Command::new(get_test_gpg_path());
            command
                .arg("--batch")
                .arg("--homedir")
                .arg(self.path());
            command
        }

        /// Generate an unprotected key for `user_id` in this keyring
        pub fn generate_key(&self, user_id: &str) {
            let status = self
                .gpg()
                .args(["--pinentry-mode", "loopback", "--passphrase", ""])
                .args(["--quick-gen-key", user_id, "default", "default", "never"])
                .status()
                .expect("Failed to run gpg --quick-gen-key");
            assert!(status.success(), "key generation failed for {}", user_id);
        }

        /// Export the armored public key for `email`
        pub fn export_public_key(&self, email: &str) -> Vec<u8> {
            let output = self
                .gpg()
                .args(["--armor", "--export", email])
                .output()
                .expect("Failed to run gpg --export");
            assert!(output.status.success());
            output.stdout
        }
    }
}
