//! Value generations: append-only logs of value records grouped by commits.

use super::generation::generation_name;
use super::record::{open_envelope, ValueEntry, ValueHeader, ValueRecord};
use crate::error::{CoreError, CoreResult};
use crate::types::{FlushSequence, Generation, ResourceId};
use restree_storage::{StorageBackend, StorageDirectory};
use std::collections::{BTreeMap, BTreeSet};

/// Where a record lives inside a value generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// Offset of the envelope.
    pub offset: u64,
    /// Length of the envelope.
    pub len: u64,
}

/// Length of a sealed commit entry; its fields are fixed width.
fn commit_len() -> u64 {
    ValueEntry::Commit {
        flush_seq: FlushSequence::default(),
        record_count: 0,
    }
    .sealed()
    .len() as u64
}

/// Length of a sealed removal entry.
fn removal_len() -> u64 {
    ValueEntry::Removed {
        id: ResourceId::new(0),
    }
    .sealed()
    .len() as u64
}

/// Everything recovered from one value generation.
#[derive(Debug, Clone, Default)]
pub struct ValueScan {
    /// Latest committed record per id.
    pub records: BTreeMap<ResourceId, (ValueRecord, Span)>,
    /// Flush sequence of the last intact commit.
    pub last_commit: FlushSequence,
    /// Bytes up to and including the last intact commit.
    pub valid_len: u64,
    /// File size.
    pub total_len: u64,
    /// Number of intact commits.
    pub commits: u64,
    /// Number of committed removal entries.
    pub removed: u64,
    /// Highest id named by a committed entry, removals included.
    pub max_id: Option<ResourceId>,
}

/// Entry read since the last commit.
enum Pending {
    Value(ValueRecord, Span),
    Removed(ResourceId),
}

impl ValueScan {
    /// Returns `true` if bytes follow the last intact commit.
    #[must_use]
    pub fn has_torn_tail(&self) -> bool {
        self.valid_len < self.total_len
    }

    /// Scans a value generation.
    ///
    /// Records are applied commit by commit and a removal entry drops the
    /// id's earlier record. The scan stops at the first
    /// truncated, damaged or malformed entry and drops the uncommitted
    /// records before it.
    ///
    /// # Errors
    ///
    /// `Corruption` or `ChecksumMismatch` only if the header itself is bad.
    pub fn scan(data: &[u8], expected: Generation) -> CoreResult<Self> {
        let header = ValueHeader::decode(data)?;
        if header.generation != expected {
            return Err(CoreError::corruption(format!(
                "file of {expected} carries header of {}",
                header.generation
            )));
        }
        let mut scan = ValueScan {
            valid_len: ValueHeader::SIZE as u64,
            total_len: data.len() as u64,
            ..ValueScan::default()
        };
        let mut pending: Vec<Pending> = Vec::new();
        let mut offset = ValueHeader::SIZE;
        loop {
            let (body, next) = match open_envelope(data, offset) {
                Ok(Some(found)) => found,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(%expected, offset, error = %e, "value generation ends in a damaged entry");
                    break;
                }
            };
            let span = Span {
                offset: offset as u64,
                len: (next - offset) as u64,
            };
            match ValueEntry::decode(body) {
                Ok(ValueEntry::Value(record)) => pending.push(Pending::Value(record, span)),
                Ok(ValueEntry::Removed { id }) => pending.push(Pending::Removed(id)),
                Ok(ValueEntry::Commit {
                    flush_seq,
                    record_count,
                }) => {
                    if record_count as usize != pending.len() {
                        tracing::warn!(
                            %expected,
                            offset,
                            record_count,
                            found = pending.len(),
                            "commit does not match its records"
                        );
                        break;
                    }
                    for entry in pending.drain(..) {
                        let id = match entry {
                            Pending::Value(record, span) => {
                                let id = record.id;
                                scan.records.insert(id, (record, span));
                                id
                            }
                            Pending::Removed(id) => {
                                scan.records.remove(&id);
                                scan.removed += 1;
                                id
                            }
                        };
                        scan.max_id = scan.max_id.max(Some(id));
                    }
                    scan.last_commit = flush_seq;
                    scan.valid_len = next as u64;
                    scan.commits += 1;
                }
                Err(e) => {
                    tracing::warn!(%expected, offset, error = %e, "undecodable value entry");
                    break;
                }
            }
            offset = next;
        }
        Ok(scan)
    }
}

/// The value generation flushes append to.
pub struct ValueLog {
    generation: Generation,
    name: String,
    backend: Box<dyn StorageBackend>,
    live: BTreeMap<ResourceId, Span>,
    garbage: u64,
    last_commit: FlushSequence,
}

impl std::fmt::Debug for ValueLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueLog")
            .field("generation", &self.generation)
            .field("live", &self.live.len())
            .field("garbage", &self.garbage)
            .field("last_commit", &self.last_commit)
            .finish()
    }
}

impl ValueLog {
    /// Creates an empty generation holding only its header.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn create(
        dir: &dyn StorageDirectory,
        prefix: &str,
        generation: Generation,
        last_commit: FlushSequence,
    ) -> CoreResult<Self> {
        let name = generation_name(prefix, generation.as_u64());
        let mut backend = dir.create(&name)?;
        let mut header = Vec::with_capacity(ValueHeader::SIZE);
        ValueHeader { generation }.encode(&mut header);
        backend.append(&header)?;
        backend.sync()?;
        Ok(Self {
            generation,
            name,
            backend,
            live: BTreeMap::new(),
            garbage: 0,
            last_commit,
        })
    }

    /// Continues a recovered generation. Records for which `keep` returns
    /// `false` count as garbage, as do all commits but the newest.
    #[must_use]
    pub fn resume(
        name: String,
        backend: Box<dyn StorageBackend>,
        generation: Generation,
        scan: &ValueScan,
        keep: impl Fn(&ValueRecord) -> bool,
    ) -> Self {
        let live: BTreeMap<ResourceId, Span> = scan
            .records
            .iter()
            .filter(|(_, (record, _))| keep(record))
            .map(|(id, (_, span))| (*id, *span))
            .collect();
        let live_bytes: u64 = live.values().map(|s| s.len).sum();
        let newest_commit = if scan.commits > 0 { commit_len() } else { 0 };
        Self {
            generation,
            name,
            backend,
            garbage: (scan.valid_len - ValueHeader::SIZE as u64)
                .saturating_sub(live_bytes + newest_commit),
            live,
            last_commit: scan.last_commit,
        }
    }

    /// Generation number.
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// File name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes of superseded and deleted records.
    #[must_use]
    pub fn garbage(&self) -> u64 {
        self.garbage
    }

    /// Number of live records.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Flush sequence of the last commit.
    #[must_use]
    pub fn last_commit(&self) -> FlushSequence {
        self.last_commit
    }

    /// Appends a removal entry for every live id in `removed`, then
    /// `records`, and seals the group with a commit for `flush_seq`.
    /// Returns the bytes written.
    ///
    /// # Errors
    ///
    /// Returns an error if the append or sync fails. The live set is left
    /// untouched in that case.
    pub fn commit(
        &mut self,
        records: &[ValueRecord],
        removed: &BTreeSet<ResourceId>,
        flush_seq: FlushSequence,
    ) -> CoreResult<u64> {
        let mut buf = Vec::new();
        let mut spans = Vec::with_capacity(records.len());
        let base = self.backend.size()?;
        let tombstones: Vec<ResourceId> = removed
            .iter()
            .copied()
            .filter(|id| self.live.contains_key(id))
            .collect();
        for id in &tombstones {
            buf.extend_from_slice(&ValueEntry::Removed { id: *id }.sealed());
        }
        for record in records {
            let start = buf.len() as u64;
            buf.extend_from_slice(&ValueEntry::Value(record.clone()).sealed());
            spans.push((
                record.id,
                Span {
                    offset: base + start,
                    len: buf.len() as u64 - start,
                },
            ));
        }
        let commit = ValueEntry::Commit {
            flush_seq,
            record_count: (tombstones.len() + records.len()) as u32,
        }
        .sealed();
        buf.extend_from_slice(&commit);
        let superseded_commit = if base > ValueHeader::SIZE as u64 {
            commit_len()
        } else {
            0
        };

        self.backend.append(&buf)?;
        self.backend.sync()?;

        for id in &tombstones {
            if let Some(old) = self.live.remove(id) {
                self.garbage += old.len + removal_len();
            }
        }
        for (id, span) in spans {
            if let Some(old) = self.live.insert(id, span) {
                self.garbage += old.len;
            }
        }
        self.garbage += superseded_commit;
        self.last_commit = flush_seq;
        Ok(buf.len() as u64)
    }

    /// Reads back every live record, ordered by id.
    ///
    /// # Errors
    ///
    /// `Corruption` if a live record no longer decodes.
    pub fn live_records(&self) -> CoreResult<Vec<ValueRecord>> {
        self.live
            .values()
            .map(|span| {
                let bytes = self.backend.read_at(span.offset, span.len as usize)?;
                let (body, _) = open_envelope(&bytes, 0)?
                    .ok_or_else(|| CoreError::corruption("empty live record"))?;
                match ValueEntry::decode(body)? {
                    ValueEntry::Value(record) => Ok(record),
                    _ => Err(CoreError::corruption("live span points at a non-value entry")),
                }
            })
            .collect()
    }

    /// Writes the live records, sorted by id, into a fresh generation sealed
    /// by one commit carrying the last flush sequence.
    ///
    /// # Errors
    ///
    /// Returns an error if reading the live records or writing the new file
    /// fails.
    pub fn compact_into(
        &self,
        dir: &dyn StorageDirectory,
        prefix: &str,
        generation: Generation,
    ) -> CoreResult<ValueLog> {
        let mut next = ValueLog::create(dir, prefix, generation, self.last_commit)?;
        let records = self.live_records()?;
        next.commit(&records, &BTreeSet::new(), self.last_commit)?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::generation::read_file;
    use crate::types::TypeKey;
    use crate::value::Value;
    use restree_storage::MemoryDirectory;

    fn record(id: u32, v: f32) -> ValueRecord {
        ValueRecord {
            id: ResourceId::new(id),
            type_key: TypeKey::Float,
            last_modified: i64::from(id),
            path: format!("meter/r{id}"),
            type_name: "FloatResource".into(),
            value: Value::Float(v),
        }
    }

    fn scan_of(dir: &MemoryDirectory, n: u64) -> ValueScan {
        let data = read_file(dir, &generation_name("resData", n)).unwrap();
        ValueScan::scan(&data, Generation::new(n)).unwrap()
    }

    #[test]
    fn header_only_generation_is_valid() {
        let dir = MemoryDirectory::new();
        ValueLog::create(&dir, "resData", Generation::new(1), FlushSequence::default()).unwrap();
        let scan = scan_of(&dir, 1);
        assert!(scan.records.is_empty());
        assert_eq!(scan.commits, 0);
        assert!(!scan.has_torn_tail());
    }

    #[test]
    fn later_records_supersede_earlier_ones() {
        let dir = MemoryDirectory::new();
        let mut log =
            ValueLog::create(&dir, "resData", Generation::new(1), FlushSequence::default()).unwrap();
        log.commit(&[record(1, 1.0), record(2, 2.0)], &BTreeSet::new(), FlushSequence::new(1))
            .unwrap();
        log.commit(&[record(1, 10.0)], &BTreeSet::new(), FlushSequence::new(2))
            .unwrap();
        assert!(log.garbage() > 0);

        let scan = scan_of(&dir, 1);
        assert_eq!(scan.last_commit, FlushSequence::new(2));
        assert_eq!(scan.records[&ResourceId::new(1)].0.value, Value::Float(10.0));
        assert_eq!(log.live_records().unwrap().len(), 2);
    }

    #[test]
    fn uncommitted_tail_is_ignored() {
        let dir = MemoryDirectory::new();
        let mut log =
            ValueLog::create(&dir, "resData", Generation::new(1), FlushSequence::default()).unwrap();
        log.commit(&[record(1, 1.0)], &BTreeSet::new(), FlushSequence::new(1))
            .unwrap();

        let file = dir.file("resData1").unwrap();
        let mut data = file.data();
        let committed_len = data.len();
        data.extend_from_slice(&ValueEntry::Value(record(1, 99.0)).sealed());
        let torn = ValueEntry::Value(record(2, 5.0)).sealed();
        data.extend_from_slice(&torn[..torn.len() / 2]);
        dir.insert("resData1", data);

        let scan = scan_of(&dir, 1);
        assert_eq!(scan.records.len(), 1);
        assert_eq!(scan.records[&ResourceId::new(1)].0.value, Value::Float(1.0));
        assert_eq!(scan.valid_len, committed_len as u64);
        assert!(scan.has_torn_tail());
    }

    #[test]
    fn removed_records_leave_the_live_set() {
        let dir = MemoryDirectory::new();
        let mut log =
            ValueLog::create(&dir, "resData", Generation::new(1), FlushSequence::default()).unwrap();
        log.commit(&[record(1, 1.0), record(2, 2.0)], &BTreeSet::new(), FlushSequence::new(1))
            .unwrap();
        let removed: BTreeSet<_> = [ResourceId::new(2), ResourceId::new(8)].into_iter().collect();
        log.commit(&[], &removed, FlushSequence::new(2)).unwrap();
        assert_eq!(log.live_count(), 1);

        // Only the id that had a record gets a removal entry.
        let scan = scan_of(&dir, 1);
        assert_eq!(scan.removed, 1);
        assert_eq!(scan.max_id, Some(ResourceId::new(2)));
        let ids: Vec<_> = scan.records.keys().copied().collect();
        assert_eq!(ids, vec![ResourceId::new(1)]);

        let backend = dir.open("resData1").unwrap();
        let resumed = ValueLog::resume("resData1".into(), backend, Generation::new(1), &scan, |_| true);
        assert_eq!(resumed.live_count(), 1);
        assert_eq!(resumed.garbage(), log.garbage());
    }

    #[test]
    fn a_record_after_a_removal_is_live_again() {
        let dir = MemoryDirectory::new();
        let mut log =
            ValueLog::create(&dir, "resData", Generation::new(1), FlushSequence::default()).unwrap();
        log.commit(&[record(4, 1.0)], &BTreeSet::new(), FlushSequence::new(1))
            .unwrap();
        let removed: BTreeSet<_> = [ResourceId::new(4)].into_iter().collect();
        log.commit(&[record(4, 2.0)], &removed, FlushSequence::new(2)).unwrap();

        let scan = scan_of(&dir, 1);
        assert_eq!(scan.records[&ResourceId::new(4)].0.value, Value::Float(2.0));
        assert_eq!(log.live_records().unwrap(), vec![record(4, 2.0)]);
    }

    #[test]
    fn compaction_drops_removal_entries() {
        let dir = MemoryDirectory::new();
        let mut log =
            ValueLog::create(&dir, "resData", Generation::new(1), FlushSequence::default()).unwrap();
        log.commit(&[record(1, 1.0), record(2, 2.0)], &BTreeSet::new(), FlushSequence::new(1))
            .unwrap();
        let removed: BTreeSet<_> = [ResourceId::new(1)].into_iter().collect();
        log.commit(&[], &removed, FlushSequence::new(2)).unwrap();

        log.compact_into(&dir, "resData", Generation::new(2)).unwrap();
        let scan = scan_of(&dir, 2);
        assert_eq!(scan.removed, 0);
        assert_eq!(scan.commits, 1);
        let ids: Vec<_> = scan.records.keys().copied().collect();
        assert_eq!(ids, vec![ResourceId::new(2)]);
    }

    #[test]
    fn compaction_keeps_exactly_the_live_records() {
        let dir = MemoryDirectory::new();
        let mut log =
            ValueLog::create(&dir, "resData", Generation::new(1), FlushSequence::default()).unwrap();
        for seq in 1..=5u64 {
            log.commit(
                &[record(3, seq as f32), record(1, 0.5)],
                &BTreeSet::new(),
                FlushSequence::new(seq),
            )
            .unwrap();
        }
        let before = log.live_records().unwrap();

        let compacted = log.compact_into(&dir, "resData", Generation::new(2)).unwrap();
        assert_eq!(compacted.garbage(), 0);
        assert_eq!(compacted.live_records().unwrap(), before);
        assert_eq!(compacted.last_commit(), FlushSequence::new(5));

        let scan = scan_of(&dir, 2);
        assert_eq!(scan.last_commit, FlushSequence::new(5));
        let ids: Vec<_> = scan.records.keys().copied().collect();
        assert_eq!(ids, vec![ResourceId::new(1), ResourceId::new(3)]);

        let again = compacted.compact_into(&dir, "resData", Generation::new(3)).unwrap();
        assert_eq!(again.live_records().unwrap(), before);
    }
}
