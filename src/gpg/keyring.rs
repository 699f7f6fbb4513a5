//! Public keyring operations
//!
//! Every query lists the whole public keyring and filters in-process, so
//! address matching is always case-insensitive and an unknown address is a
//! [`KeyLookup::NotFound`] rather than a gpg failure.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::gpg::context::GpgContext;
use crate::gpg::error::GpgError;
use crate::gpg::key::{Key, KeyLookup, MalformedRecord, normalize_email};
use crate::io::ProcessError;

const LIST_ARGS: [&str; 3] = ["--list-public-keys", "--with-colons", "--fixed-list-mode"];

/// Result of importing one piece of key material
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Imported {
    New(Key),
    /// A key with the same address was already installed; nothing was imported
    AlreadyInstalled(Key),
}

impl Imported {
    pub fn key(&self) -> &Key {
        match self {
            Self::New(key) | Self::AlreadyInstalled(key) => key,
        }
    }

    pub fn into_key(self) -> Key {
        match self {
            Self::New(key) | Self::AlreadyInstalled(key) => key,
        }
    }
}

/// A file `import_keys_at` did not import
#[derive(Debug, Clone, Serialize)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

/// Summary of a directory import
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub imported: Vec<Key>,
    pub already_installed: Vec<Key>,
    pub skipped: Vec<SkippedFile>,
}

pub struct Keyring<'a> {
    ctx: &'a GpgContext,
}

impl<'a> Keyring<'a> {
    pub(crate) fn new(ctx: &'a GpgContext) -> Self {
        Self { ctx }
    }

    /// Every stanza of the public keyring, parsed or not
    pub async fn entries(&self) -> Result<Vec<Result<Key, MalformedRecord>>, GpgError> {
        let output = self.ctx.run(LIST_ARGS, b"").await?;
        Ok(self.ctx.parser().parse_listing(&output.stdout_lossy()))
    }

    /// Usable, address-bearing public keys, sorted by address
    pub async fn installed_public_keys(&self) -> Result<Vec<Key>, GpgError> {
        let mut keys: Vec<Key> = Vec::new();

        for entry in self.entries().await? {
            match entry {
                Ok(key) if key.validity.is_usable() => keys.push(key),
                Ok(key) => debug!("Skipping {:?} key {}", key.validity, key.key_id),
                Err(malformed) => debug!("Skipping key record: {}", malformed),
            }
        }

        keys.sort();
        Ok(keys)
    }

    /// Primary addresses of every installed key
    pub async fn installed_addresses(&self) -> Result<Vec<String>, GpgError> {
        Ok(self
            .installed_public_keys()
            .await?
            .into_iter()
            .map(|key| key.email)
            .collect())
    }

    /// Look up the usable key for `email`, ignoring case
    pub async fn find(&self, email: &str) -> Result<KeyLookup, GpgError> {
        self.lookup(email, true).await
    }

    /// Search every listed key for `email`; `usable_only` skips revoked,
    /// expired and disabled keys
    async fn lookup(&self, email: &str, usable_only: bool) -> Result<KeyLookup, GpgError> {
        let wanted = normalize_email(email);
        if wanted.is_empty() {
            return Ok(KeyLookup::NotFound);
        }

        let mut malformed_match = None;

        for entry in self.entries().await? {
            match entry {
                Ok(key) if key.has_address(&wanted) => {
                    if !usable_only || key.validity.is_usable() {
                        return Ok(KeyLookup::Found(key));
                    }
                }
                Ok(_) => {}
                Err(malformed) => {
                    if malformed_match.is_none() && malformed.record.to_lowercase().contains(&wanted)
                    {
                        malformed_match = Some(malformed);
                    }
                }
            }
        }

        Ok(match malformed_match {
            Some(malformed) => KeyLookup::Malformed(malformed),
            None => KeyLookup::NotFound,
        })
    }

    /// Keys for every address in `emails` that is installed; unknown addresses are ignored
    pub async fn all<S: AsRef<str>>(&self, emails: &[S]) -> Result<Vec<Key>, GpgError> {
        let installed = self.installed_public_keys().await?;
        let mut keys: Vec<Key> = Vec::new();

        for email in emails {
            if let Some(key) = installed.iter().find(|key| key.has_address(email.as_ref())) {
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
        }

        Ok(keys)
    }

    pub async fn is_installed(&self, email: &str) -> Result<bool, GpgError> {
        Ok(self.find(email).await?.is_found())
    }

    /// Parse key material without importing it
    pub async fn inspect(&self, material: &[u8]) -> Result<Key, GpgError> {
        let args: Vec<&str> = if self.ctx.version().supports_show_only() {
            vec![
                "--with-colons",
                "--fixed-list-mode",
                "--import-options",
                "show-only",
                "--import",
            ]
        } else {
            vec!["--with-colons", "--fixed-list-mode"]
        };

        let output = match self.ctx.run(args, material).await {
            Ok(output) => output,
            // Anything gpg refuses to read here is not key material
            Err(GpgError::Process(ProcessError::Failed { stderr, .. })) => {
                return Err(GpgError::invalid_key_material(stderr));
            }
            Err(e) => return Err(e),
        };
        let listing = output.stdout_lossy();

        let mut entries = self.ctx.parser().parse_listing(&listing).into_iter();
        match entries.next() {
            Some(entry) => Ok(entry?),
            None => Err(GpgError::invalid_key_material("gpg found no public key")),
        }
    }

    /// Import `material` unless a key for its address is already installed
    pub async fn import(&self, material: &[u8]) -> Result<Imported, GpgError> {
        let key = self.inspect(material).await?;

        if let KeyLookup::Found(existing) = self.find(&key.email).await? {
            debug!("Key for {} already installed as {}", existing.email, existing.key_id);
            return Ok(Imported::AlreadyInstalled(existing));
        }

        self.ctx
            .run(["--import", "--quiet", "--yes", "--no-verbose"], material)
            .await?;

        match self.find(&key.email).await? {
            KeyLookup::Found(installed) => {
                info!("Imported key {} for {}", installed.key_id, installed.email);
                Ok(Imported::New(installed))
            }
            _ => Err(GpgError::ImportFailed { email: key.email }),
        }
    }

    /// Import the key stored in `path`
    pub async fn import_file(&self, path: impl AsRef<Path>) -> Result<Imported, GpgError> {
        let path = path.as_ref();
        let material = tokio::fs::read(path).await.map_err(|source| GpgError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.import(&material).await
    }

    /// Import every key file below `dir`
    ///
    /// Files gpg rejects as key material are reported in
    /// [`ImportReport::skipped`]; any other failure aborts the walk.
    pub async fn import_keys_at(&self, dir: impl AsRef<Path>) -> Result<ImportReport, GpgError> {
        let dir = dir.as_ref();
        let mut report = ImportReport::default();

        let files = WalkDir::new(dir)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) if entry.file_type().is_file() => Some(entry.into_path()),
                Ok(_) => None,
                Err(e) => {
                    warn!("Cannot read directory entry under {}: {}", dir.display(), e);
                    None
                }
            });

        for path in files {
            match self.import_file(&path).await {
                Ok(Imported::New(key)) => report.imported.push(key),
                Ok(Imported::AlreadyInstalled(key)) => report.already_installed.push(key),
                Err(e) if e.is_rejected_key() => {
                    warn!("Skipping {}: {}", path.display(), e);
                    report.skipped.push(SkippedFile {
                        path,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            "Imported {} keys from {} ({} already installed, {} skipped)",
            report.imported.len(),
            dir.display(),
            report.already_installed.len(),
            report.skipped.len()
        );

        Ok(report)
    }

    /// Delete the public key for `email` from the keyring
    ///
    /// Revoked and expired keys can be removed too.
    pub async fn remove(&self, email: &str) -> Result<Key, GpgError> {
        let key = match self.lookup(email, false).await? {
            KeyLookup::Found(key) => key,
            KeyLookup::Malformed(malformed) => return Err(malformed.into()),
            KeyLookup::NotFound => return Err(GpgError::key_not_found(email)),
        };

        self.ctx
            .run(["--yes", "--delete-key", key.selector()], b"")
            .await?;

        info!("Removed key {} for {}", key.key_id, key.email);
        Ok(key)
    }
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

    async fn context(runner: MockRunner) -> (GpgContext, Arc<MockRunner>) {
        let runner = Arc::new(runner.on("--version", fixtures::VERSION_OUTPUT));
        let config = GpgConfigBuilder::new().build().unwrap();
        let ctx = GpgContext::with_runner(config, runner.clone()).await.unwrap();
        (ctx, runner)
    }

    #[tokio::test]
    async fn test_listing_tolerates_keys_without_address() {
        let (ctx, _) =
            context(MockRunner::new().on("--list-public-keys", fixtures::global_directory_and_john()))
                .await;

        let keys = ctx.keyring().installed_public_keys().await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].email, "john@example.com");

        let entries = ctx.keyring().entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_err());
    }

    #[tokio::test]
    async fn test_revoked_keys_are_not_installed() {
        let (ctx, _) =
            context(MockRunner::new().on("--list-public-keys", fixtures::MODERN_LISTING)).await;

        let addresses = ctx.keyring().installed_addresses().await.unwrap();
        assert_eq!(addresses, vec!["mark@example.com"]);
        assert_eq!(
            ctx.keyring().find("old@example.com").await.unwrap(),
            KeyLookup::NotFound
        );
    }

    #[tokio::test]
    async fn test_empty_address_is_never_found() {
        let (ctx, _) = context(
            MockRunner::new().on("--list-public-keys", fixtures::global_directory_and_john()),
        )
        .await;

        assert_eq!(ctx.keyring().find("").await.unwrap(), KeyLookup::NotFound);
        assert_eq!(ctx.keyring().find("   ").await.unwrap(), KeyLookup::NotFound);
    }

    #[tokio::test]
    async fn test_remove_revoked_key() {
        let (ctx, runner) = context(
            MockRunner::new()
                .on("--list-public-keys", fixtures::MODERN_LISTING)
                .on("--delete-key", ""),
        )
        .await;

        let removed = ctx.keyring().remove("OLD@example.com").await.unwrap();
        assert_eq!(removed.key_id, "1122334455667788");

        let deletes = runner.calls_with("--delete-key");
        assert_eq!(deletes.len(), 1);
        assert!(deletes[0].0.has_arg("AABBCCDDEEFF0011223344551122334455667788"));
    }

    #[tokio::test]
    async fn test_find_is_case_insensitive() {
        let (ctx, _) =
            context(MockRunner::new().on("--list-public-keys", fixtures::MODERN_LISTING)).await;
        let keyring = ctx.keyring();

        let key = keyring.find("MARK@EXAMPLE.COM").await.unwrap().found().unwrap();
        assert_eq!(key.key_id, "3AA5C34371567BD2");

        // Secondary addresses resolve to the same key
        let work = keyring.find("mark@WORK.example").await.unwrap().found().unwrap();
        assert_eq!(work, key);

        assert!(keyring.is_installed("Mark@Example.com").await.unwrap());
        assert!(!keyring.is_installed("nobody@example.com").await.unwrap());
    }

    #[tokio::test]
    async fn test_find_reports_malformed_record_mentioning_address() {
        let listing = "pub:u:2048:1:ZZZZ:2010-09-13:::u:Broken <broken@example.com>::scESC:\n";
        let (ctx, _) = context(MockRunner::new().on("--list-public-keys", listing)).await;

        match ctx.keyring().find("Broken@Example.com").await.unwrap() {
            KeyLookup::Malformed(record) => assert_eq!(record.reason, "missing or non-hex key id"),
            other => panic!("expected malformed lookup, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_all_deduplicates_and_ignores_unknown() {
        let (ctx, _) =
            context(MockRunner::new().on("--list-public-keys", fixtures::MODERN_LISTING)).await;

        let keys = ctx
            .keyring()
            .all(&["mark@example.com", "MARK@work.example", "ghost@example.com"])
            .await
            .unwrap();
        assert_eq!(keys.len(), 1);
    }

    #[tokio::test]
    async fn test_import_of_installed_key_is_noop() {
        let (ctx, runner) = context(
            MockRunner::new()
                .on("show-only", fixtures::JOHN_EXAMPLE_LINE)
                .on("--list-public-keys", fixtures::global_directory_and_john())
                .on("--import", ""),
        )
        .await;

        let imported = ctx.keyring().import(b"john's key").await.unwrap();

        assert!(matches!(imported, Imported::AlreadyInstalled(_)));
        assert_eq!(imported.key().key_id, "0247FEC05FDA4350");
        // Only the show-only inspection ran; no real import
        assert_eq!(runner.calls_with("--import").len(), 1);
        assert_eq!(runner.calls_with("show-only").len(), 1);
    }

    #[tokio::test]
    async fn test_import_new_key() {
        let (ctx, runner) = context(
            MockRunner::new()
                .on("show-only", fixtures::JOHN_EXAMPLE_LINE)
                .on("--list-public-keys", fixtures::PGP_GLOBAL_DIRECTORY_LINE)
                .on("--list-public-keys", fixtures::global_directory_and_john())
                .on("--import", ""),
        )
        .await;

        let imported = ctx.keyring().import(b"john's key").await.unwrap();

        assert!(matches!(imported, Imported::New(_)));
        assert_eq!(imported.into_key().email, "john@example.com");

        let real_imports: Vec<_> = runner
            .calls_with("--import")
            .into_iter()
            .filter(|(invocation, _)| !invocation.has_arg("show-only"))
            .collect();
        assert_eq!(real_imports.len(), 1);
        assert_eq!(real_imports[0].1, b"john's key");
        assert!(real_imports[0].0.has_arg("--batch"));
    }

    #[tokio::test]
    async fn test_import_that_does_not_land_fails() {
        let (ctx, _) = context(
            MockRunner::new()
                .on("show-only", fixtures::JOHN_EXAMPLE_LINE)
                .on("--list-public-keys", "")
                .on("--import", ""),
        )
        .await;

        let result = ctx.keyring().import(b"john's key").await;
        assert!(matches!(result, Err(GpgError::ImportFailed { .. })));
    }

    #[tokio::test]
    async fn test_inspect_rejects_empty_listing() {
        let (ctx, _) = context(MockRunner::new().on("show-only", "")).await;

        let result = ctx.keyring().inspect(b"not a key").await;
        assert!(matches!(result, Err(GpgError::InvalidKeyMaterial { .. })));
    }

    #[tokio::test]
    async fn test_import_keys_at_skips_non_key_files() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a_key.asc"), b"KEY-A").unwrap();
        std::fs::write(dir.path().join("b_notes.txt"), b"NOT A KEY").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested").join("c_key.asc"), b"KEY-C").unwrap();

        let a = fixtures::stanza("AAAAAAAAAAAAAAAA", "Testy McTest1", "testymctest1@example.com");
        let c = fixtures::stanza("CCCCCCCCCCCCCCCC", "Testy McTest3", "testymctest3@example.com");

        let (ctx, _) = context(
            MockRunner::new()
                .on("show-only", &a)
                .fail("show-only", 2, "gpg: no valid OpenPGP data found.")
                .on("show-only", &c)
                .on("--list-public-keys", "")
                .on("--list-public-keys", &a)
                .on("--list-public-keys", &a)
                .on("--list-public-keys", format!("{}{}", a, c))
                .on("--import", ""),
        )
        .await;

        let report = ctx.keyring().import_keys_at(dir.path()).await.unwrap();

        let imported: Vec<&str> = report.imported.iter().map(|k| k.email.as_str()).collect();
        assert_eq!(imported, vec!["testymctest1@example.com", "testymctest3@example.com"]);
        assert!(report.already_installed.is_empty());
        assert_eq!(report.skipped.len(), 1);
        assert!(report.skipped[0].path.ends_with("b_notes.txt"));
    }

    #[tokio::test]
    async fn test_inspect_failure_is_invalid_key_material() {
        let (ctx, _) = context(
            MockRunner::new().fail("show-only", 2, "gpg: no valid OpenPGP data found."),
        )
        .await;

        match ctx.keyring().inspect(b"not a key").await {
            Err(GpgError::InvalidKeyMaterial { reason }) => {
                assert!(reason.contains("no valid OpenPGP data"))
            }
            other => panic!("expected invalid key material, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_import_keys_at_aborts_when_keyring_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a_key.asc"), b"KEY-A").unwrap();
        std::fs::write(dir.path().join("b_key.asc"), b"KEY-B").unwrap();

        let a = fixtures::stanza("AAAAAAAAAAAAAAAA", "Testy McTest1", "testymctest1@example.com");
        let (ctx, runner) = context(
            MockRunner::new()
                .on("show-only", &a)
                .fail("--list-public-keys", 2, "gpg: keydb_search failed: Permission denied")
                .on("--import", ""),
        )
        .await;

        let result = ctx.keyring().import_keys_at(dir.path()).await;

        match result {
            Err(GpgError::Process(ProcessError::Failed { stderr, .. })) => {
                assert!(stderr.contains("Permission denied"))
            }
            other => panic!("expected the listing failure, got {:?}", other),
        }
        // The walk stopped at the first file
        assert_eq!(runner.calls_with("show-only").len(), 1);
    }

    #[tokio::test]
    async fn test_import_file_reports_missing_file() {
        let (ctx, _) = context(MockRunner::new()).await;

        let result = ctx.keyring().import_file("/nonexistent/key.asc").await;
        assert!(matches!(result, Err(GpgError::Io { .. })));
    }

    #[tokio::test]
    async fn test_remove_uses_fingerprint() {
        let (ctx, runner) = context(
            MockRunner::new()
                .on("--list-public-keys", fixtures::MODERN_LISTING)
                .on("--delete-key", ""),
        )
        .await;

        let removed = ctx.keyring().remove("mark@example.com").await.unwrap();
        assert_eq!(removed.key_id, "3AA5C34371567BD2");

        let deletes = runner.calls_with("--delete-key");
        assert_eq!(deletes.len(), 1);
        assert!(deletes[0].0.has_arg("C4A1F1F5A6E0D5D3E2B9A8C73AA5C34371567BD2"));

        let missing = ctx.keyring().remove("ghost@example.com").await;
        assert!(matches!(missing, Err(GpgError::KeyNotFound { .. })));
    }
}
