//! Optional write-ahead persistence for the in-memory store (§6).
//!
//! The core is an in-memory kernel; this module is the ambient durability
//! layer embedders can opt into, in the teacher's WAL idiom (append
//! newline-delimited, checksummed records; replay them in order to
//! rebuild a store). It is not wired into [`crate::Kernel`] automatically —
//! an embedder owns the choice of when to persist and when to restore.
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};
use crate::tessella::{Res, Tessella, TessellaStore};

/// One record in the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum WalRecord {
    ResCreated(Res),
    TessellaAppended(Tessella),
}

/// A single persisted line: the record plus a checksum of its own encoded
/// bytes, so a truncated final line (a crash mid-write) is detectable
/// instead of silently corrupting replay.
#[derive(Debug, Serialize, Deserialize)]
struct WalLine {
    record: WalRecord,
    checksum: u32,
}

fn checksum(bytes: &[u8]) -> u32 {
    // A simple, dependency-free Fletcher-like checksum: good enough to
    // catch truncation/corruption, not a cryptographic guarantee.
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for &byte in bytes {
        a = (a + byte as u32) % 65_521;
        b = (b + a) % 65_521;
    }
    (b << 16) | a
}

/// An append-only writer over a WAL file.
pub struct WalWriter {
    file: BufWriter<File>,
}

impl WalWriter {
    /// Open (creating if necessary) a WAL file for appending.
    pub fn open(path: impl AsRef<Path>) -> KernelResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| KernelError::StoreError(format!("could not open WAL file: {e}")))?;
        Ok(Self { file: BufWriter::new(file) })
    }

    fn write_record(&mut self, record: WalRecord) -> KernelResult<()> {
        let encoded = serde_json::to_vec(&record).map_err(KernelError::SerializationError)?;
        let line = WalLine { record, checksum: checksum(&encoded) };
        let mut json = serde_json::to_vec(&line).map_err(KernelError::SerializationError)?;
        json.push(b'\n');
        self.file
            .write_all(&json)
            .map_err(|e| KernelError::StoreError(format!("WAL write failed: {e}")))?;
        Ok(())
    }

    /// Append a res's identity row.
    pub fn record_res(&mut self, res: Res) -> KernelResult<()> {
        self.write_record(WalRecord::ResCreated(res))
    }

    /// Append one tessella.
    pub fn record_tessella(&mut self, tessella: Tessella) -> KernelResult<()> {
        self.write_record(WalRecord::TessellaAppended(tessella))
    }

    /// Snapshot an entire store's current contents to this WAL, in res
    /// row order followed by tessella order.
    pub fn snapshot(&mut self, store: &TessellaStore) -> KernelResult<()> {
        for res in store.all_res() {
            self.record_res(res)?;
        }
        for tessella in store.all_tessellae_ordered() {
            self.record_tessella(tessella)?;
        }
        self.flush()
    }

    /// Flush buffered writes to disk.
    pub fn flush(&mut self) -> KernelResult<()> {
        self.file
            .flush()
            .map_err(|e| KernelError::StoreError(format!("WAL flush failed: {e}")))
    }
}

/// Rebuild a store by replaying a WAL file from the beginning. A trailing
/// line that fails to parse or checksum (a crash mid-write) is dropped
/// with a warning rather than failing the whole restore.
pub fn restore_store(path: impl AsRef<Path>, replay_warn_threshold: usize) -> KernelResult<TessellaStore> {
    let file = File::open(path).map_err(|e| KernelError::StoreError(format!("could not open WAL file: {e}")))?;
    let store = TessellaStore::new(replay_warn_threshold);

    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(line_no, error = %e, "WAL read error, stopping replay");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let parsed: WalLine = match serde_json::from_str(&line) {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(line_no, error = %e, "could not parse WAL line, stopping replay");
                break;
            }
        };
        let encoded = serde_json::to_vec(&parsed.record).map_err(KernelError::SerializationError)?;
        if checksum(&encoded) != parsed.checksum {
            tracing::warn!(line_no, "WAL checksum mismatch, stopping replay");
            break;
        }
        match parsed.record {
            WalRecord::ResCreated(res) => store.restore_res(res),
            WalRecord::TessellaAppended(tessella) => {
                store.ingest(tessella)?;
            }
        }
    }
    Ok(store)
}

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::*;
    use crate::genus::{define_genus, GenusDiff, GenusKind};
    use crate::ids::MAIN_BRANCH;
    use crate::session::Session;

    #[test]
    fn snapshot_and_restore_round_trips_a_store() {
        let dir = tempfile::tempdir().unwrap();
        let wal_path = dir.path().join("tessera.wal");

        let store = TessellaStore::new(0);
        let session = Session::main();
        let genus_id = crate::ids::Ulid::new();
        define_genus(&store, genus_id, "widget", GenusKind::Entity, MAIN_BRANCH, GenusDiff::default()).unwrap();
        let id = crate::entity::create_entity(&store, &session, genus_id, Map::new(), None).unwrap();

        let mut writer = WalWriter::open(&wal_path).unwrap();
        writer.snapshot(&store).unwrap();
        drop(writer);

        let restored = restore_store(&wal_path, 0).unwrap();
        assert!(restored.contains_res(&id));
        assert_eq!(restored.history(&id).len(), store.history(&id).len());
    }
}
