//! Config Store: per-server persisted records under
//! `<home>/.mcp-auth/<version>/<server-hash>/`.
//!
//! Atomicity of `write()` depends on the underlying filesystem's `rename()`
//! being atomic — true for local filesystems on Linux/macOS/Windows, not
//! guaranteed over some network mounts. The bridge does not attempt to
//! detect this (see `DESIGN.md`, Open Question 2); pointing
//! `MCP_REMOTE_CONFIG_DIR` at such a mount is a choice the operator makes.

pub mod records;

use std::path::{Path, PathBuf};

use serde::{Serialize, de::DeserializeOwned};

use crate::error::{BridgeError, BridgeErrorExt, BridgeResult};
use crate::hash::ServerHash;

/// Schema version embedded in the storage path so a backward-incompatible
/// record shape change doesn't collide with records written by an older
/// binary.
pub const STORAGE_VERSION: &str = "v1";

const CLIENT_INFO_FILE: &str = "client_info.json";
const TOKENS_FILE: &str = "tokens.json";
const CODE_VERIFIER_FILE: &str = "code_verifier.txt";
const SCOPES_FILE: &str = "scopes.json";
const LOCK_FILE: &str = "lock.json";
const SERVER_URL_FILE: &str = "server_url.txt";

/// Storage backend for per-server bridge state.
///
/// Implementors must make `write` atomic with respect to concurrent readers
/// in other processes, and must treat a read of a malformed file as absent
/// rather than as an error (forward compatibility across schema drift).
pub trait ConfigStore: Send + Sync {
    fn read_json<T: DeserializeOwned>(&self, hash: &ServerHash, file: &str) -> Option<T>;
    fn write_json<T: Serialize>(&self, hash: &ServerHash, file: &str, value: &T) -> BridgeResult<()>;
    fn read_text(&self, hash: &ServerHash, file: &str) -> Option<String>;
    fn write_text(&self, hash: &ServerHash, file: &str, value: &str) -> BridgeResult<()>;
    fn delete(&self, hash: &ServerHash, file: &str) -> BridgeResult<()>;
    fn server_dir(&self, hash: &ServerHash) -> PathBuf;

    /// Create the server's lock file exclusively. Returns `Ok(true)` if this
    /// call created it (caller is leader), `Ok(false)` if it already existed.
    fn create_lock_exclusive(&self, hash: &ServerHash, lock: &records::Lock) -> BridgeResult<bool>;

    /// List every server-hash directory name currently on disk. An empty
    /// (or not-yet-created) config root yields an empty list, not an error.
    fn list_server_hashes(&self) -> BridgeResult<Vec<String>>;

    /// Remove a server's entire directory, used when pruning a stale record.
    fn remove_server_dir(&self, hash: &ServerHash) -> BridgeResult<()>;
}

/// Filesystem-backed `ConfigStore`.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    root: PathBuf,
}

impl FileConfigStore {
    /// Resolve the storage root: `MCP_REMOTE_CONFIG_DIR` if set, otherwise
    /// `<home>/.mcp-auth/mcp-bridge-<version>`.
    pub fn resolve() -> BridgeResult<Self> {
        let root = if let Ok(dir) = std::env::var("MCP_REMOTE_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            let home = dirs_home()
                .ok_or_else(|| BridgeError::configuration("could not determine home directory"))?;
            home.join(".mcp-auth").join(format!("mcp-bridge-{STORAGE_VERSION}"))
        };
        Ok(Self { root })
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, hash: &ServerHash, file: &str) -> PathBuf {
        self.server_dir(hash).join(file)
    }

    /// Write bytes atomically: write to a sibling temp file, then rename
    /// over the target. Sets owner-only permissions on Unix before the
    /// rename is visible.
    fn write_atomic(&self, target: &Path, bytes: &[u8]) -> BridgeResult<()> {
        let dir = target
            .parent()
            .ok_or_else(|| BridgeError::store("target path has no parent directory"))?;
        std::fs::create_dir_all(dir).store_context("creating server config directory")?;

        let tmp_name = format!(
            ".{}.{}.tmp",
            target.file_name().and_then(|n| n.to_str()).unwrap_or("record"),
            uuid::Uuid::new_v4()
        );
        let tmp_path = dir.join(tmp_name);

        std::fs::write(&tmp_path, bytes).store_context("writing temp file")?;
        set_owner_only_permissions(&tmp_path);
        std::fs::rename(&tmp_path, target).store_context("renaming temp file into place")?;
        Ok(())
    }
}

impl ConfigStore for FileConfigStore {
    fn read_json<T: DeserializeOwned>(&self, hash: &ServerHash, file: &str) -> Option<T> {
        let bytes = std::fs::read(self.path(hash, file)).ok()?;
        // A shape mismatch is treated as absent, not a fatal error.
        serde_json::from_slice(&bytes).ok()
    }

    fn write_json<T: Serialize>(&self, hash: &ServerHash, file: &str, value: &T) -> BridgeResult<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.write_atomic(&self.path(hash, file), &bytes)
    }

    fn read_text(&self, hash: &ServerHash, file: &str) -> Option<String> {
        std::fs::read_to_string(self.path(hash, file)).ok()
    }

    fn write_text(&self, hash: &ServerHash, file: &str, value: &str) -> BridgeResult<()> {
        self.write_atomic(&self.path(hash, file), value.as_bytes())
    }

    fn delete(&self, hash: &ServerHash, file: &str) -> BridgeResult<()> {
        match std::fs::remove_file(self.path(hash, file)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BridgeError::store(format!("deleting {file}: {e}"))),
        }
    }

    fn server_dir(&self, hash: &ServerHash) -> PathBuf {
        self.root.join(hash.as_str())
    }

    fn create_lock_exclusive(&self, hash: &ServerHash, lock: &records::Lock) -> BridgeResult<bool> {
        let path = self.path(hash, LOCK_FILE);
        let dir = self.server_dir(hash);
        std::fs::create_dir_all(&dir).store_context("creating server config directory")?;

        let bytes = serde_json::to_vec_pretty(lock)?;
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut f) => {
                use std::io::Write;
                f.write_all(&bytes).store_context("writing lock file")?;
                set_owner_only_permissions(&path);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(BridgeError::store(format!("creating lock file: {e}"))),
        }
    }

    fn list_server_hashes(&self) -> BridgeResult<Vec<String>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BridgeError::store(format!("listing config root: {e}"))),
        };

        let mut hashes = Vec::new();
        for entry in entries {
            let entry = entry.store_context("reading config root entry")?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                if let Some(name) = entry.file_name().to_str() {
                    hashes.push(name.to_string());
                }
            }
        }
        Ok(hashes)
    }

    fn remove_server_dir(&self, hash: &ServerHash) -> BridgeResult<()> {
        match std::fs::remove_dir_all(self.server_dir(hash)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BridgeError::store(format!("removing server directory: {e}"))),
        }
    }
}

/// Typed convenience wrapper over the four record kinds, used by the OAuth
/// Provider and Auth Coordinator instead of poking at raw filenames.
pub struct ServerRecords<'a, S: ConfigStore> {
    store: &'a S,
    hash: ServerHash,
}

impl<'a, S: ConfigStore> ServerRecords<'a, S> {
    pub fn new(store: &'a S, hash: ServerHash) -> Self {
        Self { store, hash }
    }

    pub fn hash(&self) -> &ServerHash {
        &self.hash
    }

    pub fn client_info(&self) -> Option<records::ClientInfo> {
        self.store.read_json(&self.hash, CLIENT_INFO_FILE)
    }

    pub fn save_client_info(&self, info: &records::ClientInfo) -> BridgeResult<()> {
        self.store.write_json(&self.hash, CLIENT_INFO_FILE, info)
    }

    pub fn delete_client_info(&self) -> BridgeResult<()> {
        self.store.delete(&self.hash, CLIENT_INFO_FILE)
    }

    pub fn tokens(&self) -> Option<records::Tokens> {
        self.store.read_json(&self.hash, TOKENS_FILE)
    }

    pub fn save_tokens(&self, tokens: &records::Tokens) -> BridgeResult<()> {
        self.store.write_json(&self.hash, TOKENS_FILE, tokens)
    }

    pub fn delete_tokens(&self) -> BridgeResult<()> {
        self.store.delete(&self.hash, TOKENS_FILE)
    }

    pub fn code_verifier(&self) -> Option<records::CodeVerifier> {
        self.store
            .read_text(&self.hash, CODE_VERIFIER_FILE)
            .map(records::CodeVerifier)
    }

    pub fn save_code_verifier(&self, verifier: &records::CodeVerifier) -> BridgeResult<()> {
        self.store.write_text(&self.hash, CODE_VERIFIER_FILE, &verifier.0)
    }

    pub fn delete_code_verifier(&self) -> BridgeResult<()> {
        self.store.delete(&self.hash, CODE_VERIFIER_FILE)
    }

    pub fn scopes(&self) -> Option<records::Scopes> {
        self.store.read_json(&self.hash, SCOPES_FILE)
    }

    pub fn save_scopes(&self, scopes: &records::Scopes) -> BridgeResult<()> {
        self.store.write_json(&self.hash, SCOPES_FILE, scopes)
    }

    pub fn delete_scopes(&self) -> BridgeResult<()> {
        self.store.delete(&self.hash, SCOPES_FILE)
    }

    pub fn server_url(&self) -> Option<records::ServerUrl> {
        self.store
            .read_text(&self.hash, SERVER_URL_FILE)
            .map(records::ServerUrl)
    }

    pub fn save_server_url(&self, url: &records::ServerUrl) -> BridgeResult<()> {
        self.store.write_text(&self.hash, SERVER_URL_FILE, &url.0)
    }

    pub fn lock(&self) -> Option<records::Lock> {
        self.store.read_json(&self.hash, LOCK_FILE)
    }

    pub fn try_acquire_lock(&self, lock: &records::Lock) -> BridgeResult<bool> {
        self.store.create_lock_exclusive(&self.hash, lock)
    }

    pub fn release_lock(&self) -> BridgeResult<()> {
        self.store.delete(&self.hash, LOCK_FILE)
    }

    /// Invalidation lattice: `all` ⊇ `client` ⊇ `tokens`. `client` wipes
    /// tokens and scopes too, but leaves a verifier if a flow is in flight;
    /// `all` wipes the verifier and any held lock as well.
    pub fn invalidate(&self, scope: InvalidateScope) -> BridgeResult<()> {
        match scope {
            InvalidateScope::Tokens => {
                self.delete_tokens()?;
            }
            InvalidateScope::Client => {
                self.delete_client_info()?;
                self.delete_tokens()?;
                self.delete_scopes()?;
            }
            InvalidateScope::All => {
                self.delete_client_info()?;
                self.delete_tokens()?;
                self.delete_scopes()?;
                self.delete_code_verifier()?;
                self.release_lock()?;
            }
        }
        Ok(())
    }
}

/// Invalidation lattice levels: `All` implies `Client` implies `Tokens`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidateScope {
    Tokens,
    Client,
    All,
}

/// Drop stored records for every server-hash directory whose recorded
/// `server_url` no longer hashes back to that directory name — e.g. after a
/// server moved behind a different URL. A directory with no stored URL
/// predates this field and is left alone rather than guessed at; a
/// directory that fails to list at all is skipped rather than treated as
/// stale.
pub fn prune_stale_servers<S: ConfigStore>(store: &S) -> BridgeResult<usize> {
    let mut pruned = 0;
    for hex in store.list_server_hashes()? {
        let hash = ServerHash::from_hex(hex.clone());
        let records = ServerRecords::new(store, hash.clone());
        let Some(url) = records.server_url() else {
            continue;
        };
        if ServerHash::new(&url.0).as_str() != hex {
            store.remove_server_dir(&hash)?;
            pruned += 1;
        }
    }
    Ok(pruned)
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = std::fs::metadata(path) {
        let mut perms = meta.permissions();
        perms.set_mode(0o600);
        let _ = std::fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) {}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use records::{ClientInfo, CodeVerifier, Lock, ServerUrl, Tokens};
    use secrecy::{ExposeSecret, SecretString};

    fn store() -> (tempfile::TempDir, FileConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileConfigStore::with_root(dir.path());
        (dir, store)
    }

    #[test]
    fn round_trip_client_info() {
        let (_dir, store) = store();
        let hash = ServerHash::new("https://example.com/sse");
        let records = ServerRecords::new(&store, hash);

        assert!(records.client_info().is_none());

        let info = ClientInfo {
            client_id: "abc123".into(),
            client_secret: None,
            redirect_uris: Some(vec!["http://localhost:9000/oauth/callback".into()]),
            scope: Some("openid email profile".into()),
        };
        records.save_client_info(&info).unwrap();

        let loaded = records.client_info().unwrap();
        assert_eq!(loaded.client_id, "abc123");
    }

    #[test]
    fn round_trip_tokens() {
        let (_dir, store) = store();
        let hash = ServerHash::new("https://example.com/sse");
        let records = ServerRecords::new(&store, hash);

        let tokens = Tokens {
            access_token: SecretString::new("tok".to_string()),
            token_type: "Bearer".into(),
            refresh_token: Some(SecretString::new("refresh".to_string())),
            expires_at: Some(chrono::Utc::now()),
            scope: None,
        };
        records.save_tokens(&tokens).unwrap();
        let loaded = records.tokens().unwrap();
        assert_eq!(loaded.access_token.expose_secret(), "tok");
        assert_eq!(
            loaded.refresh_token.unwrap().expose_secret(),
            "refresh"
        );
    }

    #[test]
    fn round_trip_code_verifier() {
        let (_dir, store) = store();
        let hash = ServerHash::new("https://example.com/sse");
        let records = ServerRecords::new(&store, hash);

        records
            .save_code_verifier(&CodeVerifier("a".repeat(64)))
            .unwrap();
        assert_eq!(records.code_verifier().unwrap().0, "a".repeat(64));
    }

    #[test]
    fn invalidate_all_clears_every_record() {
        let (_dir, store) = store();
        let hash = ServerHash::new("https://example.com/sse");
        let records = ServerRecords::new(&store, hash);

        records
            .save_client_info(&ClientInfo {
                client_id: "abc".into(),
                client_secret: None,
                redirect_uris: None,
                scope: None,
            })
            .unwrap();
        records
            .save_tokens(&Tokens {
                access_token: SecretString::new("tok".to_string()),
                token_type: "Bearer".into(),
                refresh_token: None,
                expires_at: None,
                scope: None,
            })
            .unwrap();
        records.save_code_verifier(&CodeVerifier("v".into())).unwrap();
        records
            .try_acquire_lock(&Lock {
                pid: std::process::id(),
                callback_port: 9000,
                created_at: chrono::Utc::now(),
            })
            .unwrap();

        records.invalidate(InvalidateScope::All).unwrap();

        assert!(records.client_info().is_none());
        assert!(records.tokens().is_none());
        assert!(records.code_verifier().is_none());
        assert!(records.lock().is_none());
    }

    #[test]
    fn invalidate_client_keeps_verifier() {
        let (_dir, store) = store();
        let hash = ServerHash::new("https://example.com/sse");
        let records = ServerRecords::new(&store, hash);

        records.save_code_verifier(&CodeVerifier("v".into())).unwrap();
        records
            .save_tokens(&Tokens {
                access_token: SecretString::new("tok".to_string()),
                token_type: "Bearer".into(),
                refresh_token: None,
                expires_at: None,
                scope: None,
            })
            .unwrap();

        records.invalidate(InvalidateScope::Client).unwrap();

        assert!(records.tokens().is_none());
        assert!(records.code_verifier().is_some());
    }

    #[test]
    fn lock_acquisition_is_exclusive() {
        let (_dir, store) = store();
        let hash = ServerHash::new("https://example.com/sse");
        let records = ServerRecords::new(&store, hash);

        let lock = Lock {
            pid: std::process::id(),
            callback_port: 9000,
            created_at: chrono::Utc::now(),
        };
        assert!(records.try_acquire_lock(&lock).unwrap());
        assert!(!records.try_acquire_lock(&lock).unwrap());
    }

    #[test]
    fn malformed_record_reads_as_absent() {
        let (_dir, store) = store();
        let hash = ServerHash::new("https://example.com/sse");
        std::fs::create_dir_all(store.server_dir(&hash)).unwrap();
        std::fs::write(store.server_dir(&hash).join(TOKENS_FILE), b"not json").unwrap();

        let records = ServerRecords::new(&store, hash);
        assert!(records.tokens().is_none());
    }

    #[test]
    #[serial_test::serial]
    fn config_dir_env_override_is_honored() {
        let dir = tempfile::tempdir().unwrap();
        // SAFETY: test runs serially within this crate's test binary; no
        // other thread reads MCP_REMOTE_CONFIG_DIR concurrently.
        unsafe {
            std::env::set_var("MCP_REMOTE_CONFIG_DIR", dir.path());
        }
        let store = FileConfigStore::resolve().unwrap();
        assert_eq!(store.root, dir.path());
        unsafe {
            std::env::remove_var("MCP_REMOTE_CONFIG_DIR");
        }
    }

    #[test]
    fn round_trip_server_url() {
        let (_dir, store) = store();
        let hash = ServerHash::new("https://example.com/sse");
        let records = ServerRecords::new(&store, hash);

        assert!(records.server_url().is_none());
        records
            .save_server_url(&ServerUrl("https://example.com/sse".to_string()))
            .unwrap();
        assert_eq!(records.server_url().unwrap().0, "https://example.com/sse");
    }

    #[test]
    fn list_server_hashes_is_empty_for_unused_root() {
        let (_dir, store) = store();
        assert!(store.list_server_hashes().unwrap().is_empty());
    }

    #[test]
    fn list_server_hashes_finds_every_server_directory() {
        let (_dir, store) = store();
        let a = ServerHash::new("https://a.example.com/sse");
        let b = ServerHash::new("https://b.example.com/sse");
        ServerRecords::new(&store, a.clone())
            .save_server_url(&ServerUrl("https://a.example.com/sse".to_string()))
            .unwrap();
        ServerRecords::new(&store, b.clone())
            .save_server_url(&ServerUrl("https://b.example.com/sse".to_string()))
            .unwrap();

        let mut hashes = store.list_server_hashes().unwrap();
        hashes.sort();
        let mut expected = vec![a.as_str().to_string(), b.as_str().to_string()];
        expected.sort();
        assert_eq!(hashes, expected);
    }

    #[test]
    fn prune_removes_directory_whose_url_no_longer_matches_its_hash() {
        let (_dir, store) = store();
        let hash = ServerHash::new("https://example.com/sse");
        ServerRecords::new(&store, hash.clone())
            .save_server_url(&ServerUrl("https://moved.example.com/sse".to_string()))
            .unwrap();

        let pruned = prune_stale_servers(&store).unwrap();

        assert_eq!(pruned, 1);
        assert!(!store.server_dir(&hash).exists());
    }

    #[test]
    fn prune_keeps_directory_whose_url_still_matches_its_hash() {
        let (_dir, store) = store();
        let hash = ServerHash::new("https://example.com/sse");
        ServerRecords::new(&store, hash.clone())
            .save_server_url(&ServerUrl("https://example.com/sse".to_string()))
            .unwrap();

        let pruned = prune_stale_servers(&store).unwrap();

        assert_eq!(pruned, 0);
        assert!(store.server_dir(&hash).exists());
    }

    #[test]
    fn prune_leaves_directories_with_no_stored_url_alone() {
        let (_dir, store) = store();
        let hash = ServerHash::new("https://example.com/sse");
        ServerRecords::new(&store, hash.clone())
            .save_tokens(&Tokens {
                access_token: SecretString::new("tok".to_string()),
                token_type: "Bearer".into(),
                refresh_token: None,
                expires_at: None,
                scope: None,
            })
            .unwrap();

        let pruned = prune_stale_servers(&store).unwrap();

        assert_eq!(pruned, 0);
        assert!(store.server_dir(&hash).exists());
    }
}
