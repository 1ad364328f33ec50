//! # Record Store
//!
//! Durable, per-player-serialized storage of [`PlayerRecord`]s.
//!
//! ## Concurrency
//!
//! Each record sits behind its own mutex, so operations on different players
//! never wait on each other while operations on one player are strictly
//! serialized. Lock waits are bounded by the configured timeout; a timeout
//! surfaces as `StorageUnavailable`, never as a hang.
//!
//! ## Durability
//!
//! [`RecordStore::transact`] runs a closure on a private copy of the record.
//! If the closure succeeds and changed anything, the new record is written to
//! the WAL and synced *before* it replaces the in-memory copy. If the closure
//! fails or the write fails, the stored record is untouched.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[cfg(test)]
use std::sync::atomic::AtomicU32;

use crate::catalog::StarterKit;
use crate::error::{EconomyError, EconomyResult};
use crate::record::{PlayerId, PlayerRecord, PlayerUpdate};
use crate::wal::{WalOperation, WriteAheadLog};

type RecordHandle = Arc<Mutex<PlayerRecord>>;

/// Log size in bytes at which a file-backed store first compacts itself.
pub const DEFAULT_COMPACT_THRESHOLD: u64 = 16 * 1024 * 1024;

/// Keyed store of player records.
pub struct RecordStore {
    starter: StarterKit,
    records: RwLock<HashMap<PlayerId, RecordHandle>>,
    /// `None` for the in-memory store used by tests and dry runs.
    wal: Option<WriteAheadLog>,
    lock_timeout: Duration,
    /// Zero disables automatic compaction.
    compact_threshold: u64,
    /// Log size that triggers the next automatic compaction.
    compact_at: AtomicU64,
    compacting: AtomicBool,
    #[cfg(test)]
    failing_commits: AtomicU32,
}

impl RecordStore {
    /// Opens a file-backed store, replaying its log.
    ///
    /// # Errors
    ///
    /// Returns `EconomyError::CorruptStorage` if a committed record cannot be
    /// decoded, or `EconomyError::StorageUnavailable` on I/O failure.
    pub fn open(path: impl AsRef<Path>, starter: StarterKit, lock_timeout: Duration) -> EconomyResult<Self> {
        let (wal, ops) = WriteAheadLog::open(path)?;

        let mut records = HashMap::new();
        for op in ops {
            let WalOperation::PutRecord { player_id, payload } = op;
            let record = PlayerRecord::from_json(&payload)?;
            if record.player_id != player_id {
                return Err(EconomyError::CorruptStorage(format!(
                    "log entry for player {player_id} holds the record of player {}",
                    record.player_id
                )));
            }
            records.insert(player_id, Arc::new(Mutex::new(record)));
        }
        tracing::info!(
            path = %wal.path().display(),
            players = records.len(),
            bytes = wal.size_bytes(),
            next_lsn = wal.next_lsn(),
            "record store opened"
        );

        Ok(Self::with_parts(starter, records, Some(wal), lock_timeout))
    }

    /// Creates a store that keeps records in memory only.
    #[must_use]
    pub fn in_memory(starter: StarterKit, lock_timeout: Duration) -> Self {
        Self::with_parts(starter, HashMap::new(), None, lock_timeout)
    }

    fn with_parts(
        starter: StarterKit,
        records: HashMap<PlayerId, RecordHandle>,
        wal: Option<WriteAheadLog>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            starter,
            records: RwLock::new(records),
            wal,
            lock_timeout,
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
            compact_at: AtomicU64::new(DEFAULT_COMPACT_THRESHOLD),
            compacting: AtomicBool::new(false),
            #[cfg(test)]
            failing_commits: AtomicU32::new(0),
        }
    }

    /// Compacts the log automatically once it reaches `bytes`, and after
    /// that whenever it grows to twice its compacted size. Zero turns
    /// automatic compaction off.
    #[must_use]
    pub fn with_compaction_threshold(mut self, bytes: u64) -> Self {
        self.compact_threshold = bytes;
        *self.compact_at.get_mut() = bytes;
        self
    }

    /// True if writes reach disk.
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        self.wal.is_some()
    }

    /// Ids of every known player, ascending.
    ///
    /// # Errors
    ///
    /// Returns `EconomyError::StorageUnavailable` if the index lock times out.
    pub fn player_ids(&self) -> EconomyResult<Vec<PlayerId>> {
        let mut ids: Vec<_> = self.read_index()?.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// A copy of the player's current record.
    ///
    /// # Errors
    ///
    /// Returns `EconomyError::NotFound` if the player does not exist.
    pub fn get(&self, player_id: PlayerId) -> EconomyResult<PlayerRecord> {
        let handle = self.handle(player_id)?.ok_or(EconomyError::NotFound(player_id))?;
        let record = self.lock_record(&handle, player_id)?;
        Ok(record.clone())
    }

    /// Returns the player's record, creating and persisting a default one
    /// first if the player is new.
    ///
    /// # Errors
    ///
    /// Returns `EconomyError::StorageUnavailable` if a lock times out or the
    /// new record cannot be persisted.
    pub fn ensure_exists(&self, player_id: PlayerId) -> EconomyResult<PlayerRecord> {
        if self.handle(player_id)?.is_some() {
            return self.get(player_id);
        }

        // The new record is published already locked, so the index lock is
        // released before the commit and only this player waits on it.
        let record = PlayerRecord::new(player_id, &self.starter);
        let handle: RecordHandle = Arc::new(Mutex::new(record.clone()));
        let guard = handle.lock();
        {
            let mut index = self
                .records
                .try_write_for(self.lock_timeout)
                .ok_or_else(|| Self::timeout("player index"))?;
            if let Some(existing) = index.get(&player_id).cloned() {
                drop(index);
                drop(guard);
                let current = self.lock_record(&existing, player_id)?.clone();
                return Ok(current);
            }
            index.insert(player_id, Arc::clone(&handle));
        }

        // On a failed commit the default record stays in the index; the next
        // commit for this player writes it in full.
        let persisted = self.persist(&guard);
        drop(guard);
        persisted?;

        tracing::info!(player_id, "player created");
        self.compact_if_due();
        Ok(record)
    }

    /// Runs `f` against the player's record as one atomic, durable step.
    ///
    /// `f` works on a copy. If it returns an error the record is unchanged.
    /// If it returns `Ok` and the copy differs from the stored record, the
    /// copy is committed to the log and then becomes the stored record.
    ///
    /// # Errors
    ///
    /// Returns `EconomyError::NotFound` for an unknown player, any error
    /// returned by `f`, or `EconomyError::StorageUnavailable` if the lock
    /// times out or the commit fails.
    pub fn transact<T>(
        &self,
        player_id: PlayerId,
        f: impl FnOnce(&mut PlayerRecord) -> EconomyResult<T>,
    ) -> EconomyResult<T> {
        let handle = self.handle(player_id)?.ok_or(EconomyError::NotFound(player_id))?;
        let mut record = self.lock_record(&handle, player_id)?;

        let mut draft = record.clone();
        let output = f(&mut draft)?;
        if draft != *record {
            self.persist(&draft)?;
            *record = draft;
            drop(record);
            self.compact_if_due();
        }
        Ok(output)
    }

    /// Merges `update` into the player's record atomically and returns the
    /// result. A missing player is created with the default record first.
    ///
    /// # Errors
    ///
    /// Same as [`transact`](Self::transact), minus `NotFound`.
    pub fn apply(&self, player_id: PlayerId, update: PlayerUpdate) -> EconomyResult<PlayerRecord> {
        self.ensure_exists(player_id)?;
        self.transact(player_id, |record| {
            update.apply_to(record);
            Ok(record.clone())
        })
    }

    /// Rewrites the log to hold only the current record of each player.
    ///
    /// Every record is locked for the duration, so no commit can slip in
    /// between the snapshot and the rewrite. A no-op for in-memory stores.
    ///
    /// # Errors
    ///
    /// Returns `EconomyError::StorageUnavailable` if a lock times out or the
    /// rewrite fails.
    pub fn compact(&self) -> EconomyResult<()> {
        let Some(wal) = &self.wal else {
            return Ok(());
        };

        let index = self.read_index()?;
        let mut handles: Vec<_> = index.iter().map(|(&id, handle)| (id, Arc::clone(handle))).collect();
        handles.sort_unstable_by_key(|(id, _)| *id);

        let guards = handles
            .iter()
            .map(|(id, handle)| self.lock_record(handle, *id))
            .collect::<EconomyResult<Vec<_>>>()?;

        let ops = guards
            .iter()
            .map(|record| {
                Ok(WalOperation::PutRecord {
                    player_id: record.player_id,
                    payload: record.to_json()?,
                })
            })
            .collect::<EconomyResult<Vec<_>>>()?;

        wal.compact(&ops)?;
        self.schedule_next_compaction(wal.size_bytes());
        Ok(())
    }

    fn schedule_next_compaction(&self, size: u64) {
        let next = size.saturating_mul(2).max(self.compact_threshold);
        self.compact_at.store(next, Ordering::Release);
    }

    /// Runs an automatic compaction if the log has reached its trigger size.
    /// Must be called with no record lock held.
    fn compact_if_due(&self) {
        let Some(wal) = &self.wal else {
            return;
        };
        if self.compact_threshold == 0 {
            return;
        }
        let size = wal.size_bytes();
        if size < self.compact_at.load(Ordering::Acquire) {
            return;
        }
        if self.compacting.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::debug!(bytes = size, "WAL reached its compaction trigger");
        if let Err(e) = self.compact() {
            tracing::warn!(error = %e, bytes = size, "automatic WAL compaction failed");
            self.schedule_next_compaction(size);
        }
        self.compacting.store(false, Ordering::Release);
    }

    fn read_index(&self) -> EconomyResult<parking_lot::RwLockReadGuard<'_, HashMap<PlayerId, RecordHandle>>> {
        self.records
            .try_read_for(self.lock_timeout)
            .ok_or_else(|| Self::timeout("player index"))
    }

    fn handle(&self, player_id: PlayerId) -> EconomyResult<Option<RecordHandle>> {
        Ok(self.read_index()?.get(&player_id).cloned())
    }

    fn lock_record<'a>(
        &self,
        handle: &'a RecordHandle,
        player_id: PlayerId,
    ) -> EconomyResult<parking_lot::MutexGuard<'a, PlayerRecord>> {
        handle
            .try_lock_for(self.lock_timeout)
            .ok_or_else(|| Self::timeout(&format!("record of player {player_id}")))
    }

    fn timeout(what: &str) -> EconomyError {
        tracing::warn!(what, "lock wait timed out");
        EconomyError::StorageUnavailable(format!("timed out waiting for {what}"))
    }

    fn persist(&self, record: &PlayerRecord) -> EconomyResult<()> {
        self.injected_failure()?;

        let Some(wal) = &self.wal else {
            return Ok(());
        };
        let mut txn = wal.begin_transaction();
        txn.add_operation(WalOperation::PutRecord {
            player_id: record.player_id,
            payload: record.to_json()?,
        });
        let lsn = txn.commit()?;
        tracing::debug!(player_id = record.player_id, lsn, "record committed");
        Ok(())
    }

    #[cfg(not(test))]
    #[inline]
    #[allow(clippy::unused_self, clippy::unnecessary_wraps)]
    fn injected_failure(&self) -> EconomyResult<()> {
        Ok(())
    }

    #[cfg(test)]
    fn injected_failure(&self) -> EconomyResult<()> {
        let armed = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            return Err(EconomyError::StorageUnavailable("injected commit failure".to_string()));
        }
        Ok(())
    }

    /// Makes the next `count` commits fail with `StorageUnavailable`.
    #[cfg(test)]
    pub(crate) fn fail_next_commits(&self, count: u32) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }
}
