//! The log store: flushes dirty state into generations and compacts them.

use super::generation::{generation_name, retire, scan, write_file};
use super::recovery::{Prefixes, Recovered};
use super::record::ValueRecord;
use super::structure::StructureSnapshot;
use super::values::ValueLog;
use crate::error::CoreResult;
use crate::overlay::VirtualResourceDb;
use crate::stats::DatabaseStats;
use crate::types::{FlushSequence, Generation};
use parking_lot::{Mutex, RwLock};
use restree_storage::StorageDirectory;
use serde::Serialize;
use std::sync::Arc;

/// What one flush wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Sequence of the flush; `None` if nothing was dirty.
    pub flush_seq: Option<FlushSequence>,
    /// Structure generation written, if the structure changed.
    pub structure: Option<u64>,
    /// Value records appended.
    pub records: usize,
    /// Bytes written.
    pub bytes: u64,
    /// Value generation compacted into, if garbage crossed the threshold.
    pub compacted_into: Option<u64>,
}

impl FlushOutcome {
    /// Returns `true` if the flush had nothing to write.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.flush_seq.is_none()
    }
}

/// Current generations, as reported by tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationInfo {
    /// Structure generation in use.
    pub structure_current: Option<u64>,
    /// Fallback structure generation.
    pub structure_old: Option<u64>,
    /// Value generation appended to.
    pub value_current: u64,
    /// Live value records.
    pub live_values: usize,
    /// Superseded bytes in the value generation.
    pub garbage_bytes: u64,
    /// Last committed flush.
    pub last_flush: u64,
}

impl GenerationInfo {
    fn of(state: &StoreState) -> Self {
        Self {
            structure_current: state.structure_current,
            structure_old: state.structure_old,
            value_current: state.values.generation().as_u64(),
            live_values: state.values.live_count(),
            garbage_bytes: state.values.garbage(),
            last_flush: state.flush_seq.as_u64(),
        }
    }
}

#[derive(Debug)]
struct StoreState {
    values: ValueLog,
    structure_current: Option<u64>,
    structure_old: Option<u64>,
    structure_max: u64,
    value_max: u64,
    flush_seq: FlushSequence,
    // An append failed part way; later appends would be unreachable.
    torn: bool,
}

/// Owns the generation files of one store.
///
/// Flushes are serialized by the store's mutex. A flush reads the tree
/// under the shared resource lock and writes outside it, so writers are only
/// held back for the time it takes to copy dirty state.
///
/// Lock order: store mutex, then the resource lock. Generation info is
/// published separately after every flush and compaction, so reading it
/// never waits on the store mutex.
pub struct LogStore {
    dir: Arc<dyn StorageDirectory>,
    prefixes: Prefixes,
    compaction_start_size: u64,
    stats: Arc<DatabaseStats>,
    state: Mutex<StoreState>,
    published: RwLock<GenerationInfo>,
}

impl std::fmt::Debug for LogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStore")
            .field("prefixes", &self.prefixes)
            .field("generations", &*self.published.read())
            .finish()
    }
}

impl LogStore {
    /// Takes over the generations found by recovery.
    #[must_use]
    pub fn new(
        dir: Arc<dyn StorageDirectory>,
        prefixes: Prefixes,
        compaction_start_size: u64,
        stats: Arc<DatabaseStats>,
        recovered: RecoveredGenerations,
    ) -> Self {
        let state = StoreState {
            values: recovered.values,
            structure_current: recovered.structure_current,
            structure_old: recovered.structure_old,
            structure_max: recovered.structure_max,
            value_max: recovered.value_max,
            flush_seq: recovered.flush_seq,
            torn: false,
        };
        Self {
            dir,
            prefixes,
            compaction_start_size,
            stats,
            published: RwLock::new(GenerationInfo::of(&state)),
            state: Mutex::new(state),
        }
    }

    /// Current generations, as of the last completed flush or compaction.
    #[must_use]
    pub fn generations(&self) -> GenerationInfo {
        self.published.read().clone()
    }

    fn publish(&self, state: &StoreState) {
        *self.published.write() = GenerationInfo::of(state);
    }

    /// Writes everything dirty in `db`.
    ///
    /// A changed structure goes to a fresh structure generation first; the
    /// dirty values follow in the value generation, sealed by a commit that
    /// makes the flush durable. On error the dirty state is put back and
    /// the next flush retries it.
    ///
    /// # Errors
    ///
    /// Returns the first I/O error. Compaction errors are logged only.
    pub fn flush(&self, db: &VirtualResourceDb) -> CoreResult<FlushOutcome> {
        let mut state = self.state.lock();
        if state.torn {
            self.compact_locked(&mut state, db)?;
        }
        let seq = state.flush_seq.next();

        let (dirty, snapshot, records) = {
            let _shared = db.lock().read();
            let index = db.index();
            let dirty = index.dirty().take();
            if dirty.is_empty() {
                return Ok(FlushOutcome::default());
            }
            let snapshot = dirty
                .structure
                .then(|| StructureSnapshot::capture(&index, seq));
            let records: Vec<ValueRecord> = dirty
                .values
                .iter()
                .filter_map(|id| {
                    let el = index.get(*id)?;
                    ValueRecord::from_element(el, index.path_of(*id)?)
                })
                .collect();
            (dirty, snapshot, records)
        };

        let written = self.write_flush(&mut state, seq, snapshot.as_ref(), &records, &dirty);
        self.publish(&state);
        let mut outcome = match written {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(flush = %seq, error = %e, "flush failed, keeping state dirty");
                self.stats.record_failed_flush();
                db.index().dirty().restore(dirty);
                return Err(e);
            }
        };
        self.stats.record_flush(records.len() as u64, outcome.bytes);

        if state.values.garbage() > self.compaction_start_size {
            match self.compact_locked(&mut state, db) {
                Ok(generation) => outcome.compacted_into = Some(generation.as_u64()),
                Err(e) => tracing::warn!(error = %e, "compaction after flush failed"),
            }
        }
        Ok(outcome)
    }

    fn write_flush(
        &self,
        state: &mut StoreState,
        seq: FlushSequence,
        snapshot: Option<&StructureSnapshot>,
        records: &[ValueRecord],
        dirty: &crate::index::DirtySet,
    ) -> CoreResult<FlushOutcome> {
        let mut outcome = FlushOutcome {
            flush_seq: Some(seq),
            records: records.len(),
            ..FlushOutcome::default()
        };

        let written_structure = match snapshot {
            Some(snapshot) => {
                let number = state.structure_max + 1;
                let data = snapshot.encode(Generation::new(number));
                write_file(
                    self.dir.as_ref(),
                    &generation_name(&self.prefixes.structure, number),
                    &data,
                )?;
                self.dir.sync()?;
                state.structure_max = number;
                self.stats.record_structure_generation(data.len() as u64);
                outcome.bytes += data.len() as u64;
                Some(number)
            }
            None => None,
        };

        outcome.bytes += state
            .values
            .commit(records, &dirty.removed, seq)
            .inspect_err(|_| state.torn = true)?;
        state.flush_seq = seq;

        if let Some(number) = written_structure {
            let keep: Vec<u64> = std::iter::once(number)
                .chain(state.structure_current)
                .collect();
            state.structure_old = state.structure_current;
            state.structure_current = Some(number);
            let files = scan(self.dir.as_ref(), &self.prefixes.structure)?;
            retire(self.dir.as_ref(), &files, &keep);
            outcome.structure = Some(number);
        }

        tracing::debug!(
            flush = %seq,
            structure = ?outcome.structure,
            records = records.len(),
            removed = dirty.removed.len(),
            bytes = outcome.bytes,
            "flushed"
        );
        Ok(outcome)
    }

    /// Rewrites the value generation without garbage.
    ///
    /// # Errors
    ///
    /// Returns an error if the new generation cannot be written, or
    /// [`crate::CoreError::IllegalState`] if the calling thread holds the
    /// resource lock shared.
    pub fn compact(&self, db: &VirtualResourceDb) -> CoreResult<Generation> {
        let mut state = self.state.lock();
        self.compact_locked(&mut state, db)
    }

    fn compact_locked(
        &self,
        state: &mut StoreState,
        db: &VirtualResourceDb,
    ) -> CoreResult<Generation> {
        let next = Generation::new(state.value_max + 1);
        let reclaimed = state.values.garbage();
        let compacted = state
            .values
            .compact_into(self.dir.as_ref(), &self.prefixes.values, next)?;
        state.value_max = next.as_u64();
        self.dir.sync()?;
        {
            let _exclusive = db.lock().write()?;
            state.values = compacted;
            state.torn = false;
        }
        self.publish(state);
        let files = scan(self.dir.as_ref(), &self.prefixes.values)?;
        retire(self.dir.as_ref(), &files, &[next.as_u64()]);
        self.stats.record_compaction(reclaimed);
        tracing::info!(generation = %next, reclaimed, "compacted value generation");
        Ok(next)
    }
}

/// The generation part of [`Recovered`].
#[derive(Debug)]
pub struct RecoveredGenerations {
    values: ValueLog,
    structure_current: Option<u64>,
    structure_old: Option<u64>,
    structure_max: u64,
    value_max: u64,
    flush_seq: FlushSequence,
}

impl Recovered {
    /// Splits off the index from the generation state.
    #[must_use]
    pub fn split(self) -> (crate::index::ResourceIndex, RecoveredGenerations) {
        (
            self.index,
            RecoveredGenerations {
                values: self.values,
                structure_current: self.structure_current,
                structure_old: self.structure_old,
                structure_max: self.structure_max,
                value_max: self.value_max,
                flush_seq: self.flush_seq,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::recovery::recover;
    use crate::schema::{builtin, SchemaRegistry, TypeDef};
    use crate::value::Value;
    use restree_storage::MemoryDirectory;

    fn prefixes() -> Prefixes {
        Prefixes {
            structure: "resMap".into(),
            values: "resData".into(),
        }
    }

    fn schema() -> Arc<SchemaRegistry> {
        let mut schema = SchemaRegistry::new();
        schema
            .register(TypeDef::new("Meter").slot("power", builtin::FLOAT))
            .unwrap();
        Arc::new(schema)
    }

    fn open(dir: &Arc<MemoryDirectory>, threshold: u64) -> (VirtualResourceDb, LogStore) {
        let recovered = recover(dir.as_ref(), &prefixes(), schema()).unwrap();
        let (index, generations) = recovered.split();
        let store = LogStore::new(
            Arc::clone(dir) as Arc<dyn StorageDirectory>,
            prefixes(),
            threshold,
            Arc::new(DatabaseStats::new()),
            generations,
        );
        (VirtualResourceDb::new(index, 64), store)
    }

    fn add_meter(db: &VirtualResourceDb) -> crate::types::ResourceId {
        let mut index = db.index_mut();
        let meter = index.add_resource("meter", "Meter", "app").unwrap();
        let power = index.add_child(meter, "power", builtin::FLOAT, false).unwrap();
        index.set_active(power, true).unwrap();
        power
    }

    #[test]
    fn clean_tree_flushes_nothing() {
        let dir = Arc::new(MemoryDirectory::new());
        let (db, store) = open(&dir, u64::MAX);
        assert!(store.flush(&db).unwrap().is_noop());
        assert_eq!(dir.list().unwrap(), vec!["resData1"]);
    }

    #[test]
    fn flushed_state_survives_reopen() {
        let dir = Arc::new(MemoryDirectory::new());
        {
            let (db, store) = open(&dir, u64::MAX);
            let power = add_meter(&db);
            db.index_mut().set_value(power, Value::Float(3.5), 10).unwrap();
            let outcome = store.flush(&db).unwrap();
            assert_eq!(outcome.structure, Some(1));
            assert_eq!(outcome.records, 1);

            db.index_mut().set_value(power, Value::Float(4.5), 11).unwrap();
            let outcome = store.flush(&db).unwrap();
            assert_eq!(outcome.structure, None);
            assert_eq!(store.generations().last_flush, 2);
        }
        let (db, _store) = open(&dir, u64::MAX);
        let index = db.index();
        let power = index.resolve_path("meter/power").unwrap();
        assert_eq!(index.value(power), Some(&Value::Float(4.5)));
        assert!(index.is_active(power));
    }

    #[test]
    fn structure_rotation_keeps_two_generations() {
        let dir = Arc::new(MemoryDirectory::new());
        let (db, store) = open(&dir, u64::MAX);
        let power = add_meter(&db);
        store.flush(&db).unwrap();
        for active in [false, true, false] {
            db.index_mut().set_active(power, active).unwrap();
            store.flush(&db).unwrap();
        }
        let info = store.generations();
        assert_eq!(info.structure_current, Some(4));
        assert_eq!(info.structure_old, Some(3));
        assert_eq!(
            dir.list().unwrap(),
            vec!["resData1", "resMap3", "resMap4"]
        );
    }

    #[test]
    fn garbage_triggers_compaction() {
        let dir = Arc::new(MemoryDirectory::new());
        let (db, store) = open(&dir, 200);
        let power = add_meter(&db);
        let mut compacted = None;
        for i in 0..20 {
            db.index_mut()
                .set_value(power, Value::Float(i as f32), i)
                .unwrap();
            if let Some(n) = store.flush(&db).unwrap().compacted_into {
                compacted = Some(n);
            }
        }
        let generation = compacted.expect("compaction should have run");
        assert!(dir.list().unwrap().contains(&generation_name("resData", generation)));
        assert!(!dir.list().unwrap().contains(&"resData1".to_string()));

        drop(db);
        drop(store);
        let (db, _store) = open(&dir, u64::MAX);
        let index = db.index();
        let power = index.resolve_path("meter/power").unwrap();
        assert_eq!(index.value(power), Some(&Value::Float(19.0)));
    }

    #[test]
    fn deleted_values_leave_the_log() {
        let dir = Arc::new(MemoryDirectory::new());
        let (db, store) = open(&dir, u64::MAX);
        let power = add_meter(&db);
        db.index_mut().set_value(power, Value::Float(1.0), 1).unwrap();
        store.flush(&db).unwrap();
        assert_eq!(store.generations().live_values, 1);

        let meter = db.index().toplevel("meter").unwrap();
        db.index_mut().delete_resource(meter).unwrap();
        store.flush(&db).unwrap();
        assert_eq!(store.generations().live_values, 0);
        assert!(store.generations().garbage_bytes > 0);
    }
}
