//! Keeps the local replica in step with the remote version marker.
//!
//! Two entry points:
//! - [`ReplicaSynchronizer::check_if_due`] runs before every query and is
//!   rate limited by the check interval
//! - [`ReplicaSynchronizer::force_refresh`] ignores the interval; used after
//!   mutations and for manual reloads
//!
//! Nothing here fails the caller. Every problem is logged and reported
//! as a [`SyncOutcome`] while the previous replica keeps serving.

use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::remote::{RemoteError, RemoteStore, SNAPSHOT_PATH};
use crate::replica::{LocalIndexReplica, ReplicaError, ReplicaHandle};
use crate::semantic::VectorIndex;
use crate::token::VersionToken;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("remote: {0}")]
    Remote(#[from] RemoteError),

    #[error("replica: {0}")]
    Replica(#[from] ReplicaError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Passive check inside the interval
    NotDue,
    /// Another refresh or a mutation holds the replica
    Busy,
    /// Marker read failed or timed out
    Unreachable,
    /// Remote has no marker yet
    NoRemoteIndex,
    UpToDate {
        token: VersionToken,
    },
    Refreshed {
        from: Option<VersionToken>,
        to: VersionToken,
        chunks: usize,
    },
    /// The remote snapshot does not carry the marker's token yet
    RemoteLagging {
        marker: VersionToken,
        snapshot: VersionToken,
    },
    Failed {
        reason: String,
    },
}

pub struct ReplicaSynchronizer {
    remote: Arc<dyn RemoteStore>,
    handle: Arc<ReplicaHandle>,
    interval: Duration,
    last_check: Mutex<Option<Instant>>,
    /// Held while replica directories change: refreshes and mutations.
    refresh_lock: Mutex<()>,
}

impl ReplicaSynchronizer {
    pub fn new(remote: Arc<dyn RemoteStore>, handle: Arc<ReplicaHandle>, interval: Duration) -> Self {
        Self {
            remote,
            handle,
            interval,
            last_check: Mutex::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn handle(&self) -> &Arc<ReplicaHandle> {
        &self.handle
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    /// Dispatch to [`Self::force_refresh`] or [`Self::check_if_due`].
    pub fn check_and_refresh(&self, force: bool) -> SyncOutcome {
        if force {
            self.force_refresh()
        } else {
            self.check_if_due()
        }
    }

    /// Passive check. Does nothing inside the interval or while another
    /// refresh is running.
    pub fn check_if_due(&self) -> SyncOutcome {
        if !self.claim_interval() {
            return SyncOutcome::NotDue;
        }

        let guard = match self.refresh_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return SyncOutcome::Busy,
        };

        self.refresh_locked(&guard)
    }

    /// Check now, waiting for any refresh or mutation in progress.
    pub fn force_refresh(&self) -> SyncOutcome {
        let guard = self.refresh_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.mark_checked();
        self.refresh_locked(&guard)
    }

    /// Exclusive access to the replica for a mutation. Passive checks skip
    /// while the returned guard lives.
    pub fn begin_publish(&self) -> Publisher<'_> {
        let guard = self.refresh_lock.lock().unwrap_or_else(|e| e.into_inner());
        Publisher { sync: self, guard }
    }

    fn claim_interval(&self) -> bool {
        let mut last = self.last_check.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    fn mark_checked(&self) {
        let mut last = self.last_check.lock().unwrap_or_else(|e| e.into_inner());
        *last = Some(Instant::now());
    }

    fn refresh_locked(&self, _guard: &MutexGuard<'_, ()>) -> SyncOutcome {
        let marker = match self.remote.read_marker() {
            Ok(Some(marker)) => marker,
            Ok(None) => {
                log::debug!("remote has no version marker yet");
                return SyncOutcome::NoRemoteIndex;
            }
            Err(err) => {
                log::warn!("version marker unreachable, serving current replica: {err}");
                return SyncOutcome::Unreachable;
            }
        };

        let local = self.handle.token();
        if local.as_ref() == Some(&marker) {
            return SyncOutcome::UpToDate { token: marker };
        }

        log::info!(
            "replica is stale (local {}, remote {marker}), downloading snapshot",
            local.as_ref().map(|t| t.as_str()).unwrap_or("none")
        );

        let replica = match self.download_snapshot(local.as_ref()) {
            Ok(Some(replica)) => replica,
            Ok(None) => {
                // snapshot upload for the marker has not landed yet
                let snapshot = local.clone().unwrap_or_else(|| marker.clone());
                log::warn!("remote snapshot {snapshot} trails marker {marker}, will retry");
                return SyncOutcome::RemoteLagging { marker, snapshot };
            }
            Err(err) => {
                log::warn!("replica refresh failed, keeping previous snapshot: {err}");
                return SyncOutcome::Failed {
                    reason: err.to_string(),
                };
            }
        };

        let snapshot = replica.token().clone();
        let chunks = replica.chunk_count();
        self.handle.install(replica);

        if snapshot != marker {
            log::warn!("remote snapshot {snapshot} trails marker {marker}, will retry");
            return SyncOutcome::RemoteLagging { marker, snapshot };
        }

        log::info!("replica refreshed to {snapshot} ({chunks} chunks)");
        SyncOutcome::Refreshed {
            from: local,
            to: snapshot,
            chunks,
        }
    }

    /// Fetch the remote snapshot. `None` when it holds the generation already
    /// served, which is then left in place.
    fn download_snapshot(
        &self,
        current: Option<&VersionToken>,
    ) -> Result<Option<LocalIndexReplica>, SyncError> {
        let store = self.handle.store();
        let target = store.temp_file()?;
        self.remote.download(SNAPSHOT_PATH, target.path())?;
        Ok(store.install_archive(target.path(), current)?)
    }
}

/// Held by the mutation path for the duration of one change.
pub struct Publisher<'a> {
    sync: &'a ReplicaSynchronizer,
    guard: MutexGuard<'a, ()>,
}

impl Publisher<'_> {
    /// Forced refresh under the already held lock.
    pub fn refresh(&self) -> SyncOutcome {
        self.sync.mark_checked();
        self.sync.refresh_locked(&self.guard)
    }

    pub fn current(&self) -> Option<Arc<LocalIndexReplica>> {
        self.sync.handle.current()
    }

    /// Index to edit: a copy of the active one, or empty.
    pub fn working_copy(&self) -> VectorIndex {
        match self.current() {
            Some(replica) => replica.index().clone(),
            None => self.sync.handle.store().empty_index(),
        }
    }

    /// Write `index` as a new local generation and swap it in.
    pub fn commit(
        &self,
        index: &VectorIndex,
        token: &VersionToken,
    ) -> Result<Arc<LocalIndexReplica>, ReplicaError> {
        let replica = self.sync.handle.store().commit(index, token)?;
        Ok(self.sync.handle.install(replica))
    }
}
