//! # Write-Ahead Log (WAL)
//!
//! **Crash-Safe Record Persistence**
//!
//! Every player mutation is appended here before it becomes visible in
//! memory. On restart the log is replayed:
//! - Committed transactions: replayed in order
//! - Anything after the last COMMIT (a torn write, a bad checksum): discarded
//!   and truncated away
//!
//! ## Guarantees
//!
//! 1. **Durability**: once `commit()` returns, the transaction is on disk
//! 2. **Atomicity**: a transaction is written as one contiguous
//!    BEGIN..COMMIT run, so replay sees all of it or none of it
//! 3. **Ordering**: LSNs are assigned under the file lock and increase in
//!    file order
//!
//! ## Format
//!
//! ```text
//! [4 bytes: magic "RWAL"]
//! [4 bytes: version]
//! [8 bytes: base LSN]
//!
//! Entry format:
//! [8 bytes: LSN (Log Sequence Number)]
//! [1 byte: record type (BEGIN/OP/COMMIT)]
//! [4 bytes: payload length]
//! [N bytes: payload (serialized operation)]
//! [4 bytes: CRC32 of above]
//! ```

use crate::error::{EconomyError, EconomyResult};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Magic bytes identifying a WAL file.
const WAL_MAGIC: &[u8; 4] = b"RWAL";

/// Current WAL format version.
const WAL_VERSION: u32 = 1;

/// Size of the file header.
const HEADER_LEN: usize = 16;

/// Fixed bytes around every record payload (LSN, type, length, CRC).
const RECORD_OVERHEAD: usize = 8 + 1 + 4 + 4;

/// WAL record types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Begin a new transaction.
    Begin = 1,
    /// An operation within a transaction.
    Operation = 2,
    /// Commit the transaction (durable).
    Commit = 3,
}

impl RecordType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Begin),
            2 => Some(Self::Operation),
            3 => Some(Self::Commit),
            _ => None,
        }
    }
}

/// Operations that can be logged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalOperation {
    /// Full replacement of one player's record.
    PutRecord {
        /// Player the record belongs to.
        player_id: u64,
        /// Encoded record.
        payload: Vec<u8>,
    },
}

impl WalOperation {
    fn encode(&self) -> EconomyResult<Vec<u8>> {
        match self {
            Self::PutRecord { player_id, payload } => {
                let len = u32::try_from(payload.len()).map_err(|_| {
                    EconomyError::StorageUnavailable(format!("record for player {player_id} is too large to log"))
                })?;
                let mut buf = Vec::with_capacity(1 + 8 + 4 + payload.len());
                buf.push(1); // Type tag
                buf.extend_from_slice(&player_id.to_le_bytes());
                buf.extend_from_slice(&len.to_le_bytes());
                buf.extend_from_slice(payload);
                Ok(buf)
            }
        }
    }

    fn decode(data: &[u8]) -> Option<Self> {
        let (&tag, rest) = data.split_first()?;
        match tag {
            1 if rest.len() >= 12 => {
                let player_id = u64::from_le_bytes(rest[0..8].try_into().ok()?);
                let len = u32::from_le_bytes(rest[8..12].try_into().ok()?) as usize;
                let payload = rest.get(12..)?;
                if payload.len() != len {
                    return None;
                }
                Some(Self::PutRecord { player_id, payload: payload.to_vec() })
            }
            _ => None,
        }
    }
}

/// A group of operations committed atomically.
///
/// Operations are buffered in memory; nothing touches the file until
/// [`commit`](Self::commit). Dropping an uncommitted transaction discards it.
pub struct Transaction<'a> {
    wal: &'a WriteAheadLog,
    operations: Vec<WalOperation>,
}

impl Transaction<'_> {
    /// Adds an operation to the transaction.
    pub fn add_operation(&mut self, op: WalOperation) {
        self.operations.push(op);
    }

    /// Commits the transaction (durable).
    ///
    /// After this returns, the data is guaranteed to be on disk. Returns the
    /// LSN of the BEGIN record.
    ///
    /// # Errors
    ///
    /// Returns `EconomyError::StorageUnavailable` if the write or sync fails;
    /// the log is left as it was before the call.
    pub fn commit(self) -> EconomyResult<u64> {
        self.wal.append_transaction(&self.operations)
    }
}

struct LogFile {
    file: File,
    /// Length of the file up to the end of the last durable COMMIT.
    len: u64,
    next_lsn: u64,
}

/// Write-ahead log for crash-safe record persistence.
pub struct WriteAheadLog {
    path: PathBuf,
    state: Mutex<LogFile>,
}

fn io_error(context: &str, path: &Path, e: &std::io::Error) -> EconomyError {
    EconomyError::StorageUnavailable(format!("{context} {}: {e}", path.display()))
}

fn encode_header(base_lsn: u64) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(WAL_MAGIC);
    header[4..8].copy_from_slice(&WAL_VERSION.to_le_bytes());
    header[8..16].copy_from_slice(&base_lsn.to_le_bytes());
    header
}

fn encode_record(buf: &mut Vec<u8>, lsn: u64, record_type: RecordType, payload: &[u8]) -> EconomyResult<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| EconomyError::StorageUnavailable("WAL record payload too large".to_string()))?;
    let start = buf.len();
    buf.extend_from_slice(&lsn.to_le_bytes());
    buf.push(record_type as u8);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(payload);
    let crc = crc32fast::hash(&buf[start..]);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(())
}

fn encode_transaction(buf: &mut Vec<u8>, first_lsn: u64, ops: &[WalOperation]) -> EconomyResult<u64> {
    let mut lsn = first_lsn;
    encode_record(buf, lsn, RecordType::Begin, &[])?;
    lsn += 1;
    for op in ops {
        encode_record(buf, lsn, RecordType::Operation, &op.encode()?)?;
        lsn += 1;
    }
    encode_record(buf, lsn, RecordType::Commit, &[])?;
    Ok(lsn + 1)
}

/// A record parsed during recovery.
struct WalRecord<'a> {
    lsn: u64,
    record_type: RecordType,
    payload: &'a [u8],
}

/// Parses the record at `offset`. `None` means the bytes there are not a
/// complete, intact record.
fn read_record(data: &[u8], offset: usize) -> Option<(WalRecord<'_>, usize)> {
    let head = data.get(offset..offset.checked_add(13)?)?;
    let lsn = u64::from_le_bytes(head[0..8].try_into().ok()?);
    let record_type = RecordType::from_u8(head[8])?;
    let payload_len = u32::from_le_bytes(head[9..13].try_into().ok()?) as usize;

    let payload_start = offset + 13;
    let payload_end = payload_start.checked_add(payload_len)?;
    let payload = data.get(payload_start..payload_end)?;
    let crc_bytes = data.get(payload_end..payload_end.checked_add(4)?)?;
    let stored_crc = u32::from_le_bytes(crc_bytes.try_into().ok()?);

    if crc32fast::hash(&data[offset..payload_end]) != stored_crc {
        return None;
    }
    Some((WalRecord { lsn, record_type, payload }, payload_end + 4))
}

/// Result of scanning the log body.
struct Recovered {
    operations: Vec<WalOperation>,
    committed_end: usize,
    max_lsn: Option<u64>,
    transactions: usize,
}

fn scan(data: &[u8]) -> Recovered {
    let mut recovered = Recovered {
        operations: Vec::new(),
        committed_end: HEADER_LEN,
        max_lsn: None,
        transactions: 0,
    };
    let mut open: Option<Vec<WalOperation>> = None;
    let mut offset = HEADER_LEN;

    while let Some((record, next)) = read_record(data, offset) {
        match record.record_type {
            RecordType::Begin => {
                if open.is_some() {
                    break;
                }
                open = Some(Vec::new());
            }
            RecordType::Operation => {
                let (Some(ops), Some(op)) = (open.as_mut(), WalOperation::decode(record.payload)) else {
                    break;
                };
                ops.push(op);
            }
            RecordType::Commit => {
                let Some(ops) = open.take() else {
                    break;
                };
                recovered.operations.extend(ops);
                recovered.committed_end = next;
                recovered.max_lsn = Some(record.lsn);
                recovered.transactions += 1;
            }
        }
        offset = next;
    }
    recovered
}

impl WriteAheadLog {
    /// Opens or creates a WAL file.
    ///
    /// Returns the log together with every committed operation, in commit
    /// order, for the caller to replay. An incomplete tail is truncated.
    ///
    /// # Errors
    ///
    /// Returns `EconomyError::CorruptStorage` if the file is not a WAL of a
    /// supported version, or `EconomyError::StorageUnavailable` on I/O failure.
    pub fn open(path: impl AsRef<Path>) -> EconomyResult<(Self, Vec<WalOperation>)> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| io_error("failed to create directory for", &path, &e))?;
        }

        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(io_error("failed to read WAL", &path, &e)),
        };

        if data.len() < HEADER_LEN {
            let prefix = &data[..data.len().min(WAL_MAGIC.len())];
            if !WAL_MAGIC.starts_with(prefix) {
                return Err(EconomyError::CorruptStorage(format!("{} is not a WAL file", path.display())));
            }
            if !data.is_empty() {
                tracing::warn!(path = %path.display(), bytes = data.len(), "WAL header incomplete, starting fresh");
            }
            let wal = Self::create(&path, 0)?;
            return Ok((wal, Vec::new()));
        }

        if &data[0..4] != WAL_MAGIC {
            return Err(EconomyError::CorruptStorage(format!("{} has invalid WAL magic", path.display())));
        }
        let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        if version != WAL_VERSION {
            return Err(EconomyError::CorruptStorage(format!("unsupported WAL version: {version}")));
        }
        let mut base_lsn = [0u8; 8];
        base_lsn.copy_from_slice(&data[8..16]);
        let base_lsn = u64::from_le_bytes(base_lsn);

        let recovered = scan(&data);
        let next_lsn = recovered.max_lsn.map_or(base_lsn, |lsn| lsn + 1).max(base_lsn);

        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| io_error("failed to open WAL", &path, &e))?;

        if recovered.committed_end < data.len() {
            tracing::warn!(
                path = %path.display(),
                discarded_bytes = data.len() - recovered.committed_end,
                "discarding incomplete WAL tail"
            );
            file.set_len(recovered.committed_end as u64)
                .and_then(|()| file.sync_all())
                .map_err(|e| io_error("failed to truncate WAL", &path, &e))?;
        }

        tracing::info!(
            path = %path.display(),
            transactions = recovered.transactions,
            operations = recovered.operations.len(),
            next_lsn,
            "WAL recovered"
        );

        let wal = Self {
            path,
            state: Mutex::new(LogFile {
                file,
                len: recovered.committed_end as u64,
                next_lsn,
            }),
        };
        Ok((wal, recovered.operations))
    }

    fn create(path: &Path, base_lsn: u64) -> EconomyResult<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)
            .map_err(|e| io_error("failed to create WAL", path, &e))?;
        file.write_all(&encode_header(base_lsn))
            .and_then(|()| file.sync_all())
            .map_err(|e| io_error("failed to write WAL header to", path, &e))?;
        drop(file);

        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|e| io_error("failed to open WAL", path, &e))?;
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(LogFile { file, len: HEADER_LEN as u64, next_lsn: base_lsn }),
        })
    }

    /// Begins a new transaction.
    #[must_use]
    pub fn begin_transaction(&self) -> Transaction<'_> {
        Transaction { wal: self, operations: Vec::new() }
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the durable portion of the log in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.state.lock().len
    }

    /// LSN the next record will receive.
    #[must_use]
    pub fn next_lsn(&self) -> u64 {
        self.state.lock().next_lsn
    }

    fn append_transaction(&self, ops: &[WalOperation]) -> EconomyResult<u64> {
        let mut guard = self.state.lock();
        let log = &mut *guard;
        let first_lsn = log.next_lsn;

        let capacity = ops
            .iter()
            .map(|WalOperation::PutRecord { payload, .. }| RECORD_OVERHEAD + 13 + payload.len())
            .sum::<usize>()
            + 2 * RECORD_OVERHEAD;
        let mut buf = Vec::with_capacity(capacity);
        let next_lsn = encode_transaction(&mut buf, first_lsn, ops)?;

        if let Err(e) = log.file.write_all(&buf).and_then(|()| log.file.sync_data()) {
            // Cut any partial bytes so later commits stay reachable on replay.
            if let Err(trunc) = log.file.set_len(log.len) {
                tracing::error!(path = %self.path.display(), error = %trunc, "failed to cut partial WAL write");
            }
            return Err(io_error("failed to append to WAL", &self.path, &e));
        }

        log.len += buf.len() as u64;
        log.next_lsn = next_lsn;
        Ok(first_lsn)
    }

    /// Rewrites the log so it holds exactly `ops` as one committed
    /// transaction, then swaps it in place of the current file.
    ///
    /// The new file is fully written and synced under a temporary name
    /// before the rename, so a crash leaves either the old or the new log.
    ///
    /// # Errors
    ///
    /// Returns `EconomyError::StorageUnavailable` on I/O failure; the current
    /// log stays in use.
    pub fn compact(&self, ops: &[WalOperation]) -> EconomyResult<()> {
        let mut state = self.state.lock();
        let base_lsn = state.next_lsn;

        let mut buf = Vec::from(encode_header(base_lsn));
        let next_lsn = if ops.is_empty() {
            base_lsn
        } else {
            encode_transaction(&mut buf, base_lsn, ops)?
        };

        let mut tmp_name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        tmp_name.push(".compact");
        let tmp_path = self.path.with_file_name(tmp_name);

        let write_tmp = || -> std::io::Result<()> {
            let mut tmp = OpenOptions::new().create(true).truncate(true).write(true).open(&tmp_path)?;
            tmp.write_all(&buf)?;
            tmp.sync_all()
        };
        write_tmp().map_err(|e| io_error("failed to write compacted WAL", &tmp_path, &e))?;
        fs::rename(&tmp_path, &self.path).map_err(|e| io_error("failed to install compacted WAL", &self.path, &e))?;

        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| io_error("failed to reopen WAL", &self.path, &e))?;

        let before = state.len;
        *state = LogFile { file, len: buf.len() as u64, next_lsn };
        tracing::info!(
            path = %self.path.display(),
            records = ops.len(),
            bytes_before = before,
            bytes_after = state.len,
            "WAL compacted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn temp_wal_path() -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let id = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("test_wal_{}_{id}_{n}.wal", std::process::id()))
    }

    fn put(player_id: u64, body: &str) -> WalOperation {
        WalOperation::PutRecord { player_id, payload: body.as_bytes().to_vec() }
    }

    fn commit(wal: &WriteAheadLog, ops: &[WalOperation]) {
        let mut txn = wal.begin_transaction();
        for op in ops {
            txn.add_operation(op.clone());
        }
        txn.commit().unwrap();
    }

    #[test]
    fn test_wal_create_and_open() {
        let path = temp_wal_path();
        {
            let (_wal, ops) = WriteAheadLog::open(&path).unwrap();
            assert!(ops.is_empty());
        }
        assert_eq!(fs::metadata(&path).unwrap().len(), HEADER_LEN as u64);
        let (_wal, ops) = WriteAheadLog::open(&path).unwrap();
        assert!(ops.is_empty());
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_wal_replays_committed_in_order() {
        let path = temp_wal_path();
        {
            let (wal, _) = WriteAheadLog::open(&path).unwrap();
            commit(&wal, &[put(1, "a1"), put(2, "b1")]);
            commit(&wal, &[put(1, "a2")]);
        }
        let (wal, ops) = WriteAheadLog::open(&path).unwrap();
        assert_eq!(ops, vec![put(1, "a1"), put(2, "b1"), put(1, "a2")]);
        // BEGIN + 2 OP + COMMIT, then BEGIN + OP + COMMIT
        assert_eq!(wal.next_lsn(), 7);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_wal_dropped_transaction_writes_nothing() {
        let path = temp_wal_path();
        {
            let (wal, _) = WriteAheadLog::open(&path).unwrap();
            let mut txn = wal.begin_transaction();
            txn.add_operation(put(1, "never"));
            drop(txn);
            assert_eq!(wal.size_bytes(), HEADER_LEN as u64);
        }
        let (_wal, ops) = WriteAheadLog::open(&path).unwrap();
        assert!(ops.is_empty());
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_wal_torn_tail_is_truncated() {
        let path = temp_wal_path();
        let committed_len;
        {
            let (wal, _) = WriteAheadLog::open(&path).unwrap();
            commit(&wal, &[put(1, "kept")]);
            committed_len = wal.size_bytes();
        }

        // Simulate a crash halfway through the next transaction.
        let mut partial = Vec::new();
        encode_transaction(&mut partial, 3, &[put(1, "lost")]).unwrap();
        partial.truncate(partial.len() - 5);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&partial).unwrap();
        drop(file);

        {
            let (wal, ops) = WriteAheadLog::open(&path).unwrap();
            assert_eq!(ops, vec![put(1, "kept")]);
            assert_eq!(fs::metadata(&path).unwrap().len(), committed_len);
            commit(&wal, &[put(1, "after")]);
        }

        let (_wal, ops) = WriteAheadLog::open(&path).unwrap();
        assert_eq!(ops, vec![put(1, "kept"), put(1, "after")]);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_wal_checksum_mismatch_drops_transaction() {
        let path = temp_wal_path();
        {
            let (wal, _) = WriteAheadLog::open(&path).unwrap();
            commit(&wal, &[put(1, "first")]);
            commit(&wal, &[put(1, "second")]);
        }

        let mut data = fs::read(&path).unwrap();
        let pos = data.windows(6).position(|w| w == b"second").unwrap();
        data[pos] ^= 0xFF;
        fs::write(&path, &data).unwrap();

        let (_wal, ops) = WriteAheadLog::open(&path).unwrap();
        assert_eq!(ops, vec![put(1, "first")]);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_wal_rejects_foreign_file() {
        let path = temp_wal_path();
        fs::write(&path, b"definitely not a write-ahead log").unwrap();
        assert!(matches!(WriteAheadLog::open(&path), Err(EconomyError::CorruptStorage(_))));
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_wal_compaction_keeps_only_given_state() {
        let path = temp_wal_path();
        {
            let (wal, _) = WriteAheadLog::open(&path).unwrap();
            for i in 0..10 {
                commit(&wal, &[put(1, &format!("v{i}"))]);
            }
            let before = wal.size_bytes();
            let lsn_before = wal.next_lsn();

            wal.compact(&[put(1, "v9")]).unwrap();
            assert!(wal.size_bytes() < before);
            assert!(wal.next_lsn() > lsn_before);

            commit(&wal, &[put(2, "new")]);
        }
        let (wal, ops) = WriteAheadLog::open(&path).unwrap();
        assert_eq!(ops, vec![put(1, "v9"), put(2, "new")]);
        assert!(wal.next_lsn() > 30);
        fs::remove_file(&path).ok();
    }
}
