//! Encryption to public keys and decryption through gpg
//!
//! Plaintext and ciphertext travel over the duplex transport, so payloads
//! of any size pass without deadlocking against gpg's own buffering.

use tracing::{debug, info};

use crate::gpg::context::GpgContext;
use crate::gpg::error::GpgError;
use crate::gpg::key::Key;

/// A pending encryption of one payload
///
/// Built by [`GpgContext::encrypt`]; recipients are added before
/// [`Encryption::result`] runs gpg.
#[derive(Debug)]
pub struct Encryption<'a> {
    ctx: &'a GpgContext,
    data: Vec<u8>,
    keys: Vec<Key>,
    armor: bool,
}

impl<'a> Encryption<'a> {
    pub(crate) fn new(ctx: &'a GpgContext, data: impl Into<Vec<u8>>) -> Self {
        Self {
            ctx,
            data: data.into(),
            keys: Vec::new(),
            armor: ctx.config().encryption.armor,
        }
    }

    /// Add the installed keys for every address in `emails`
    ///
    /// Fails with [`GpgError::KeyNotFound`] on the first address without a
    /// usable key.
    pub async fn recipients<S: AsRef<str>>(self, emails: &[S]) -> Result<Self, GpgError> {
        let installed = self.ctx.keyring().installed_public_keys().await?;
        let mut this = self;

        for email in emails {
            let email = email.as_ref();
            let key = installed
                .iter()
                .find(|key| key.has_address(email))
                .ok_or_else(|| GpgError::key_not_found(email))?;
            this = this.key(key.clone());
        }

        Ok(this)
    }

    /// Add a recipient key; a key already present is ignored
    pub fn key(mut self, key: Key) -> Self {
        if !self.keys.contains(&key) {
            self.keys.push(key);
        }
        self
    }

    pub fn keys(self, keys: impl IntoIterator<Item = Key>) -> Self {
        keys.into_iter().fold(self, |this, key| this.key(key))
    }

    /// ASCII-armored output instead of binary
    pub fn armor(mut self, armor: bool) -> Self {
        self.armor = armor;
        self
    }

    pub fn recipient_keys(&self) -> &[Key] {
        &self.keys
    }

    /// gpg arguments for this encryption, without the base arguments
    pub fn arguments(&self) -> Vec<String> {
        let mut args = vec!["--yes".to_string()];

        if self.ctx.config().encryption.always_trust {
            args.push("--trust-model".to_string());
            args.push("always".to_string());
        }
        if self.armor {
            args.push("--armor".to_string());
        }
        for key in &self.keys {
            args.push("--recipient".to_string());
            args.push(key.selector().to_string());
        }

        args.push("--encrypt".to_string());
        args
    }

    /// Run gpg and return the ciphertext
    pub async fn result(self) -> Result<Vec<u8>, GpgError> {
        if self.keys.is_empty() {
            return Err(GpgError::NoRecipients);
        }

        let output = self.ctx.run(self.arguments(), &self.data).await?;
        if output.stdout.is_empty() {
            return Err(GpgError::empty_output("encrypt"));
        }

        info!(
            "Encrypted {} bytes to {} recipient(s), {} bytes out",
            self.data.len(),
            self.keys.len(),
            output.stdout.len()
        );
        Ok(output.stdout)
    }
}

pub(crate) async fn decrypt(ctx: &GpgContext, ciphertext: &[u8]) -> Result<Vec<u8>, GpgError> {
    let output = ctx.run(["--yes", "--quiet", "--decrypt"], ciphertext).await?;

    for line in &output.stderr {
        debug!("gpg: {}", line);
    }

    info!(
        "Decrypted {} bytes to {} bytes",
        ciphertext.len(),
        output.stdout.len()
    );
    Ok(output.stdout)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpg::config::GpgConfigBuilder;
    use crate::io::process::MockRunner;
    use crate::test_utils::fixtures;
    use std::sync::Arc;

    async fn context(runner: MockRunner, armor: bool) -> (GpgContext, Arc<MockRunner>) {
        let runner = Arc::new(runner.on("--version", fixtures::VERSION_OUTPUT));
        let config = GpgConfigBuilder::new().armor(armor).build().unwrap();
        let ctx = GpgContext::with_runner(config, runner.clone()).await.unwrap();
        (ctx, runner)
    }

    #[tokio::test]
    async fn test_encrypt_passes_plaintext_and_recipients() {
        let (ctx, runner) = context(
            MockRunner::new()
                .on("--list-public-keys", fixtures::MODERN_LISTING)
                .on("--encrypt", "CIPHERTEXT"),
            false,
        )
        .await;

        let ciphertext = ctx
            .encrypt("attack at dawn")
            .recipients(&["Mark@Example.com"])
            .await
            .unwrap()
            .result()
            .await
            .unwrap();
        assert_eq!(ciphertext, b"CIPHERTEXT");

        let calls = runner.calls_with("--encrypt");
        assert_eq!(calls.len(), 1);
        let (invocation, input) = &calls[0];
        assert_eq!(input, b"attack at dawn");
        assert!(invocation.has_arg("--batch"));
        assert!(invocation.has_arg("C4A1F1F5A6E0D5D3E2B9A8C73AA5C34371567BD2"));
        assert!(!invocation.has_arg("--armor"));
        assert_eq!(invocation.args.last().map(String::as_str), Some("--encrypt"));
    }

    #[tokio::test]
    async fn test_recipients_are_deduplicated_by_key() {
        let (ctx, _) = context(
            MockRunner::new().on("--list-public-keys", fixtures::MODERN_LISTING),
            false,
        )
        .await;

        let encryption = ctx
            .encrypt(b"data".to_vec())
            .recipients(&["mark@example.com", "MARK@work.example", "mark@example.com"])
            .await
            .unwrap();

        assert_eq!(encryption.recipient_keys().len(), 1);
        let recipients = encryption
            .arguments()
            .iter()
            .filter(|arg| *arg == "--recipient")
            .count();
        assert_eq!(recipients, 1);
    }

    #[tokio::test]
    async fn test_unknown_recipient_fails() {
        let (ctx, runner) = context(
            MockRunner::new()
                .on("--list-public-keys", fixtures::global_directory_and_john())
                .on("--encrypt", "CIPHERTEXT"),
            false,
        )
        .await;

        let result = ctx
            .encrypt("data")
            .recipients(&["john@example.com", "ghost@example.com"])
            .await;

        match result {
            Err(GpgError::KeyNotFound { email }) => assert_eq!(email, "ghost@example.com"),
            other => panic!("expected KeyNotFound, got {:?}", other.map(|_| ())),
        }
        assert!(runner.calls_with("--encrypt").is_empty());
    }

    #[tokio::test]
    async fn test_encrypt_without_recipients() {
        let (ctx, _) = context(MockRunner::new(), false).await;

        let result = ctx.encrypt("data").result().await;
        assert!(matches!(result, Err(GpgError::NoRecipients)));
    }

    #[tokio::test]
    async fn test_armor_and_trust_arguments() {
        let (ctx, _) = context(
            MockRunner::new().on("--list-public-keys", fixtures::global_directory_and_john()),
            true,
        )
        .await;

        let encryption = ctx
            .encrypt("data")
            .recipients(&["john@example.com"])
            .await
            .unwrap();
        assert_eq!(
            encryption.arguments(),
            vec![
                "--yes",
                "--trust-model",
                "always",
                "--armor",
                "--recipient",
                "0247FEC05FDA4350",
                "--encrypt"
            ]
        );

        let binary = encryption.armor(false).arguments();
        assert!(!binary.contains(&"--armor".to_string()));
    }

    #[tokio::test]
    async fn test_empty_ciphertext_is_an_error() {
        let (ctx, _) = context(
            MockRunner::new()
                .on("--list-public-keys", fixtures::global_directory_and_john())
                .on("--encrypt", ""),
            false,
        )
        .await;

        let result = ctx
            .encrypt("data")
            .recipients(&["john@example.com"])
            .await
            .unwrap()
            .result()
            .await;
        assert!(matches!(result, Err(GpgError::EmptyOutput { .. })));
    }

    #[tokio::test]
    async fn test_decrypt_feeds_ciphertext() {
        let (ctx, runner) = context(MockRunner::new().on("--decrypt", "plaintext"), false).await;

        let plaintext = ctx.decrypt(b"CIPHERTEXT").await.unwrap();
        assert_eq!(plaintext, b"plaintext");
        assert_eq!(runner.calls_with("--decrypt")[0].1, b"CIPHERTEXT");
    }

    #[tokio::test]
    async fn test_decrypt_failure_carries_stderr() {
        let (ctx, _) = context(
            MockRunner::new().fail("--decrypt", 2, "gpg: decryption failed: No secret key"),
            false,
        )
        .await;

        match ctx.decrypt(b"CIPHERTEXT").await {
            Err(GpgError::Process(crate::io::ProcessError::Failed { stderr, code, .. })) => {
                assert_eq!(code, Some(2));
                assert!(stderr.contains("No secret key"));
            }
            other => panic!("expected a failed process, got {:?}", other),
        }
    }

    #[cfg(feature = "gpg-integration-tests")]
    mod integration {
        use super::*;
        use crate::gpg::keyring::Imported;
        use crate::test_utils::get_test_gpg_path;
        use crate::test_utils::integration::TestKeyring;

        async fn real_context(keyring: &TestKeyring) -> GpgContext {
            let config = GpgConfigBuilder::new()
                .gpg_path(get_test_gpg_path())
                .homedir(keyring.path())
                .build()
                .unwrap();
            GpgContext::new(config).await.unwrap()
        }

        #[tokio::test]
        async fn test_round_trip_large_payload() {
            let keyring = TestKeyring::new();
            keyring.generate_key("Alice Example <alice@example.com>");
            let ctx = real_context(&keyring).await;

            let plaintext: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
            let ciphertext = ctx
                .encrypt(plaintext.clone())
                .recipients(&["ALICE@example.com"])
                .await
                .unwrap()
                .result()
                .await
                .unwrap();
            assert_ne!(ciphertext, plaintext);

            let decrypted = ctx.decrypt(&ciphertext).await.unwrap();
            assert_eq!(decrypted, plaintext);
        }

        #[tokio::test]
        async fn test_import_into_second_keyring() {
            let source = TestKeyring::new();
            source.generate_key("Bob Example <bob@example.com>");
            let material = source.export_public_key("bob@example.com");

            let target = TestKeyring::new();
            let ctx = real_context(&target).await;

            let inspected = ctx.keyring().inspect(&material).await.unwrap();
            assert_eq!(inspected.email, "bob@example.com");
            assert!(!ctx.keyring().is_installed("bob@example.com").await.unwrap());

            let first = ctx.keyring().import(&material).await.unwrap();
            assert!(matches!(first, Imported::New(_)));
            let second = ctx.keyring().import(&material).await.unwrap();
            assert!(matches!(second, Imported::AlreadyInstalled(_)));

            let armored = ctx
                .encrypt("hello bob")
                .armor(true)
                .recipients(&["bob@example.com"])
                .await
                .unwrap()
                .result()
                .await
                .unwrap();
            assert!(armored.starts_with(b"-----BEGIN PGP MESSAGE-----"));

            ctx.keyring().remove("bob@example.com").await.unwrap();
            assert!(!ctx.keyring().is_installed("bob@example.com").await.unwrap());
        }
    }
}
