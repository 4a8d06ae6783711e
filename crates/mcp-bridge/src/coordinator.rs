//! Auth Coordinator: cross-process single-flight election for the
//! interactive OAuth flow.
//!
//! The lockfile created via `ConfigStore::create_lock_exclusive` is the only
//! serialization point. There is no teacher precedent for this — none of
//! the example repos coordinate an interactive flow across processes — so
//! the algorithm here is original to this crate, following the same
//! `thiserror`/`tracing` error-handling conventions as the rest of the tree.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use tracing::{debug, info, warn};

use crate::error::BridgeResult;
use crate::hash::ServerHash;
use crate::listener::find_available_port;
use crate::store::records::Lock;
use crate::store::{ConfigStore, ServerRecords};

/// Staleness window: a lock older than this is reclaimable even if its PID
/// happens to still be alive (a hung process holding the lock forever would
/// otherwise wedge every future launch).
pub const STALENESS_WINDOW: ChronoDuration = ChronoDuration::minutes(30);

/// Outcome of `AuthCoordinator::coordinate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// This process won the race; it owns `port` and must drive the flow.
    Leader { port: u16 },
    /// Another live process is driving the flow on `leader_port`; poll its
    /// `/wait-for-auth` endpoint and then read tokens from the store.
    Follower { leader_port: u16 },
}

pub struct AuthCoordinator<S: ConfigStore> {
    store: Arc<S>,
}

impl<S: ConfigStore> AuthCoordinator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Race for leadership on `hash`. `desired_port` is the operator's
    /// requested callback port (0 to let the OS/port-scanner choose).
    pub fn coordinate(&self, hash: &ServerHash, desired_port: u16) -> BridgeResult<Role> {
        let records = ServerRecords::new(self.store.as_ref(), hash.clone());

        loop {
            if let Some(existing) = records.lock() {
                let now = chrono::Utc::now();
                if existing.is_stale(now, STALENESS_WINDOW) {
                    warn!(
                        server_hash = %hash,
                        pid = existing.pid,
                        "reclaiming stale auth lock"
                    );
                    records.release_lock()?;
                    continue;
                }
                debug!(
                    server_hash = %hash,
                    leader_port = existing.callback_port,
                    "another process is already driving authorization"
                );
                return Ok(Role::Follower {
                    leader_port: existing.callback_port,
                });
            }

            let port = find_available_port(desired_port)?;
            let lock = Lock {
                pid: std::process::id(),
                callback_port: port,
                created_at: chrono::Utc::now(),
            };

            if records.try_acquire_lock(&lock)? {
                info!(server_hash = %hash, port, "acquired auth lock as leader");
                return Ok(Role::Leader { port });
            }
            // Lost the race between the read above and the create-exclusive
            // call; loop and re-evaluate the (now-present) lock.
        }
    }

    /// Release a held lock. Called by the leader on completion (success or
    /// failure) and from the process's shutdown path.
    pub fn release(&self, hash: &ServerHash) -> BridgeResult<()> {
        ServerRecords::new(self.store.as_ref(), hash.clone()).release_lock()
    }

    /// Wrap a won `Role::Leader` in a guard that releases the lock on drop,
    /// so the lock is freed even if the driving future is cancelled midway
    /// through authorization (Rust has no async `Drop` to await the release
    /// from within the cancelled future itself).
    pub fn lock_guard(&self, hash: &ServerHash) -> LeaderLock<S> {
        LeaderLock {
            store: self.store.clone(),
            hash: hash.clone(),
        }
    }
}

/// RAII guard for a leader-held auth lock. Releasing is synchronous (a file
/// removal), so a plain `Drop` impl is sufficient even though the rest of
/// the flow this guards is async.
pub struct LeaderLock<S: ConfigStore> {
    store: Arc<S>,
    hash: ServerHash,
}

impl<S: ConfigStore> Drop for LeaderLock<S> {
    fn drop(&mut self) {
        if let Err(e) = ServerRecords::new(self.store.as_ref(), self.hash.clone()).release_lock() {
            warn!(server_hash = %self.hash, error = %e, "failed to release auth lock on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileConfigStore;

    fn coordinator() -> (tempfile::TempDir, AuthCoordinator<FileConfigStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileConfigStore::with_root(dir.path()));
        (dir, AuthCoordinator::new(store))
    }

    #[test]
    fn first_caller_becomes_leader() {
        let (_dir, coordinator) = coordinator();
        let hash = ServerHash::new("https://example.com/sse");
        let role = coordinator.coordinate(&hash, 0).unwrap();
        assert!(matches!(role, Role::Leader { .. }));
    }

    #[test]
    fn second_caller_becomes_follower() {
        let (_dir, coordinator) = coordinator();
        let hash = ServerHash::new("https://example.com/sse");

        let Role::Leader { port } = coordinator.coordinate(&hash, 0).unwrap() else {
            panic!("expected leader");
        };
        let role = coordinator.coordinate(&hash, 0).unwrap();
        assert_eq!(role, Role::Follower { leader_port: port });
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let (_dir, coordinator) = coordinator();
        let hash = ServerHash::new("https://example.com/sse");
        let records = ServerRecords::new(&*coordinator.store, hash.clone());

        // Simulate a lock left behind by a long-dead flow.
        records
            .try_acquire_lock(&Lock {
                pid: std::process::id(),
                callback_port: 12345,
                created_at: chrono::Utc::now() - ChronoDuration::hours(2),
            })
            .unwrap();

        let role = coordinator.coordinate(&hash, 0).unwrap();
        assert!(matches!(role, Role::Leader { .. }));
    }

    #[test]
    fn release_clears_the_lock() {
        let (_dir, coordinator) = coordinator();
        let hash = ServerHash::new("https://example.com/sse");
        coordinator.coordinate(&hash, 0).unwrap();
        coordinator.release(&hash).unwrap();

        let role = coordinator.coordinate(&hash, 0).unwrap();
        assert!(matches!(role, Role::Leader { .. }));
    }

    #[test]
    fn at_most_one_leader_per_server_hash() {
        let (_dir, coordinator) = coordinator();
        let hash = ServerHash::new("https://example.com/sse");

        let roles: Vec<Role> = (0..5)
            .map(|_| coordinator.coordinate(&hash, 0).unwrap())
            .collect();
        let leader_count = roles.iter().filter(|r| matches!(r, Role::Leader { .. })).count();
        assert_eq!(leader_count, 1);
    }
}
