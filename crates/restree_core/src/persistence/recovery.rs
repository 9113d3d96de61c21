//! Startup recovery: choosing generations and rebuilding the index.

use super::generation::{generation_name, read_file, retire, scan, write_file, GenerationFile};
use super::record::ValueRecord;
use super::structure::StructureSnapshot;
use super::values::{ValueLog, ValueScan};
use crate::element::TreeElement;
use crate::error::{CoreError, CoreResult};
use crate::index::{validate_name, ResourceIndex};
use crate::schema::{builtin, SchemaRegistry};
use crate::types::{FlushSequence, Generation, ResourceId, TypeKey};
use restree_storage::StorageDirectory;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

/// File-name prefixes of the two generation families.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefixes {
    /// Structure family, `resMap` by default.
    pub structure: String,
    /// Value family, `resData` by default.
    pub values: String,
}

/// What recovery found and chose.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// The directory held no generation files.
    pub new_store: bool,
    /// Structure generation the tree was loaded from.
    pub structure_current: Option<u64>,
    /// The valid structure generation kept as fallback.
    pub structure_old: Option<u64>,
    /// Value generation flushes continue in.
    pub value_current: u64,
    /// The tree was rebuilt from value record paths.
    pub rebuilt: bool,
    /// Last committed flush.
    pub last_commit: u64,
    /// Files that failed validation.
    pub invalid: Vec<String>,
    /// Value records dropped because their node is missing or typed
    /// differently.
    pub orphaned_values: usize,
}

/// Recovered state handed to the log store.
#[derive(Debug)]
pub struct Recovered {
    /// The rebuilt index, clean.
    pub index: ResourceIndex,
    /// Value generation to append to.
    pub values: ValueLog,
    /// Current and old structure generation numbers.
    pub structure_current: Option<u64>,
    /// See [`RecoveryReport::structure_old`].
    pub structure_old: Option<u64>,
    /// Highest structure generation number present, valid or not.
    pub structure_max: u64,
    /// Highest value generation number present, valid or not.
    pub value_max: u64,
    /// Flush sequence of the last durable flush.
    pub flush_seq: FlushSequence,
    /// Summary for logging and tooling.
    pub report: RecoveryReport,
}

/// Validity of one generation file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationStatus {
    /// The file.
    pub file: GenerationFile,
    /// Size in bytes.
    pub size: u64,
    /// Flush sequence (structure) or last commit (values); `None` if
    /// invalid.
    pub flush_seq: Option<u64>,
    /// Records in the snapshot or live records in the log.
    pub records: usize,
    /// Validation error, if any.
    pub error: Option<String>,
    /// Bytes after the last intact commit (values only).
    pub torn_bytes: u64,
}

/// Validates every structure generation, newest first.
///
/// # Errors
///
/// Returns an error only if the directory cannot be listed.
pub fn inspect_structure(
    dir: &dyn StorageDirectory,
    prefix: &str,
) -> CoreResult<Vec<(GenerationStatus, Option<StructureSnapshot>)>> {
    let mut out = Vec::new();
    for file in scan(dir, prefix)?.into_iter().rev() {
        let (status, snapshot) = match read_file(dir, &file.name) {
            Ok(data) => match StructureSnapshot::decode(&data, Generation::new(file.number)) {
                Ok(snapshot) => (
                    GenerationStatus {
                        size: data.len() as u64,
                        flush_seq: Some(snapshot.flush_seq.as_u64()),
                        records: snapshot.records.len(),
                        error: None,
                        torn_bytes: 0,
                        file,
                    },
                    Some(snapshot),
                ),
                Err(e) => (GenerationStatus::invalid(file, data.len() as u64, &e), None),
            },
            Err(e) => (GenerationStatus::invalid(file, 0, &e), None),
        };
        out.push((status, snapshot));
    }
    Ok(out)
}

/// Validates every value generation, newest first.
///
/// # Errors
///
/// Returns an error only if the directory cannot be listed.
pub fn inspect_values(
    dir: &dyn StorageDirectory,
    prefix: &str,
) -> CoreResult<Vec<(GenerationStatus, Option<ValueScan>)>> {
    let mut out = Vec::new();
    for file in scan(dir, prefix)?.into_iter().rev() {
        let (status, found) = match read_file(dir, &file.name) {
            Ok(data) => match ValueScan::scan(&data, Generation::new(file.number)) {
                Ok(found) => (
                    GenerationStatus {
                        size: data.len() as u64,
                        flush_seq: Some(found.last_commit.as_u64()),
                        records: found.records.len(),
                        error: None,
                        torn_bytes: found.total_len - found.valid_len,
                        file,
                    },
                    Some(found),
                ),
                Err(e) => (GenerationStatus::invalid(file, data.len() as u64, &e), None),
            },
            Err(e) => (GenerationStatus::invalid(file, 0, &e), None),
        };
        out.push((status, found));
    }
    Ok(out)
}

impl GenerationStatus {
    fn invalid(file: GenerationFile, size: u64, error: &CoreError) -> Self {
        tracing::warn!(file = %file.name, error = %error, "skipping invalid generation");
        Self {
            file,
            size,
            flush_seq: None,
            records: 0,
            error: Some(error.to_string()),
            torn_bytes: 0,
        }
    }

    /// Returns `true` if the file validated.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }
}

/// Recovers the store in `dir`.
///
/// Picks the newest valid value generation, then the newest valid structure
/// generation whose flush it committed. Without any usable structure the
/// tree is rebuilt from value record paths and written out as a fresh
/// structure generation.
///
/// # Errors
///
/// [`CoreError::Recovery`] if generation files exist but none of them is
/// valid; I/O errors while writing replacement generations.
pub fn recover(
    dir: &dyn StorageDirectory,
    prefixes: &Prefixes,
    schema: Arc<SchemaRegistry>,
) -> CoreResult<Recovered> {
    let structures = inspect_structure(dir, &prefixes.structure)?;
    let values = inspect_values(dir, &prefixes.values)?;
    let structure_max = structures.iter().map(|(s, _)| s.file.number).max().unwrap_or(0);
    let value_max = values.iter().map(|(s, _)| s.file.number).max().unwrap_or(0);
    let mut report = RecoveryReport {
        invalid: structures
            .iter()
            .map(|(s, _)| s)
            .chain(values.iter().map(|(s, _)| s))
            .filter(|s| !s.is_valid())
            .map(|s| s.file.name.clone())
            .collect(),
        ..RecoveryReport::default()
    };

    if structures.is_empty() && values.is_empty() {
        let log = ValueLog::create(
            dir,
            &prefixes.values,
            Generation::new(1),
            FlushSequence::default(),
        )?;
        dir.sync()?;
        report.new_store = true;
        report.value_current = 1;
        tracing::info!("initialized new resource store");
        return Ok(Recovered {
            index: ResourceIndex::new(schema),
            values: log,
            structure_current: None,
            structure_old: None,
            structure_max: 0,
            value_max: 1,
            flush_seq: FlushSequence::default(),
            report,
        });
    }

    let value_choice = values
        .into_iter()
        .find_map(|(status, found)| found.map(|f| (status.file, f)));
    let committed = value_choice.as_ref().map(|(_, f)| f.last_commit);
    let highest_stored_id = structures
        .iter()
        .filter_map(|(_, snapshot)| snapshot.as_ref())
        .filter_map(|snapshot| snapshot.next_id.checked_sub(1).map(ResourceId::new))
        .chain(value_choice.as_ref().and_then(|(_, f)| f.max_id))
        .max();

    let mut valid_structures = structures.into_iter().filter_map(|(status, snapshot)| {
        let snapshot = snapshot?;
        if committed.is_some_and(|c| snapshot.flush_seq > c) {
            tracing::warn!(
                file = %status.file.name,
                flush = %snapshot.flush_seq,
                "skipping structure generation of an unfinished flush"
            );
            return None;
        }
        Some((status.file.number, snapshot))
    });
    let current = valid_structures.next();
    let old = valid_structures.next().map(|(n, _)| n);

    if value_choice.is_none() && current.is_none() {
        return Err(CoreError::recovery(format!(
            "no valid generation among {} files",
            report.invalid.len()
        )));
    }

    let mut flush_seq = committed.unwrap_or_default();
    let (mut index, structure_current, structure_old) = match current {
        Some((number, snapshot)) => {
            flush_seq = flush_seq.max(snapshot.flush_seq);
            (snapshot.into_index(Arc::clone(&schema))?, Some(number), old)
        }
        None => (
            rebuild_from_values(
                Arc::clone(&schema),
                value_choice
                    .iter()
                    .flat_map(|(_, f)| f.records.values().map(|(r, _)| r)),
            ),
            None,
            None,
        ),
    };
    report.rebuilt = structure_current.is_none();
    // An older structure may predate ids that newer files already used.
    if let Some(id) = highest_stored_id {
        index.reserve_id(id);
    }

    let mut applied = BTreeSet::new();
    if let Some((_, found)) = &value_choice {
        for (record, _) in found.records.values() {
            let fits = index
                .get(record.id)
                .is_some_and(|el| !el.is_reference() && el.type_key() == record.type_key);
            if fits
                && index
                    .set_value(record.id, record.value.clone(), record.last_modified)
                    .is_ok()
            {
                applied.insert(record.id);
            } else {
                report.orphaned_values += 1;
            }
        }
    }
    index.dirty().take();

    let values = match value_choice {
        Some((file, found)) => {
            let backend = dir.open(&file.name)?;
            let log = ValueLog::resume(
                file.name,
                backend,
                Generation::new(file.number),
                &found,
                |r| applied.contains(&r.id),
            );
            if found.has_torn_tail() {
                let next = Generation::new(value_max + 1);
                tracing::warn!(from = %log.generation(), to = %next, "rewriting value generation with a torn tail");
                let compacted = log.compact_into(dir, &prefixes.values, next)?;
                dir.sync()?;
                compacted
            } else {
                log
            }
        }
        None => {
            let next = Generation::new(value_max + 1);
            let mut log = ValueLog::create(dir, &prefixes.values, next, flush_seq)?;
            if flush_seq > FlushSequence::default() {
                log.commit(&[], &BTreeSet::new(), flush_seq)?;
            }
            dir.sync()?;
            tracing::warn!(generation = %next, "no valid value generation, starting an empty one");
            log
        }
    };
    let value_max = value_max.max(values.generation().as_u64());
    let value_files = scan(dir, &prefixes.values)?;
    retire(dir, &value_files, &[values.generation().as_u64()]);

    let (structure_current, structure_old, structure_max) = if report.rebuilt {
        let number = structure_max + 1;
        let snapshot = StructureSnapshot::capture(&index, flush_seq);
        write_file(
            dir,
            &generation_name(&prefixes.structure, number),
            &snapshot.encode(Generation::new(number)),
        )?;
        dir.sync()?;
        let files = scan(dir, &prefixes.structure)?;
        retire(dir, &files, &[number]);
        tracing::warn!(
            generation = number,
            nodes = index.len(),
            "rebuilt structure from value records"
        );
        (Some(number), None, number)
    } else {
        (structure_current, structure_old, structure_max)
    };

    report.structure_current = structure_current;
    report.structure_old = structure_old;
    report.value_current = values.generation().as_u64();
    report.last_commit = flush_seq.as_u64();
    tracing::info!(
        structure = ?structure_current,
        values = report.value_current,
        nodes = index.len(),
        flush = %flush_seq,
        invalid = report.invalid.len(),
        "recovered resource store"
    );

    Ok(Recovered {
        index,
        values,
        structure_current,
        structure_old,
        structure_max,
        value_max,
        flush_seq,
        report,
    })
}

/// Rebuilds a minimal tree from value record paths.
///
/// Missing ancestors take the type of the slot their parent declares, or
/// become plain `Resource` decorators. Every node starts inactive.
pub(crate) fn rebuild_from_values<'a>(
    schema: Arc<SchemaRegistry>,
    records: impl Iterator<Item = &'a ValueRecord>,
) -> ResourceIndex {
    let mut records: Vec<&ValueRecord> = records.collect();
    records.sort_by(|a, b| {
        let depth = |r: &ValueRecord| r.path.matches('/').count();
        depth(a).cmp(&depth(b)).then_with(|| a.path.cmp(&b.path))
    });
    let mut next_id = records.iter().map(|r| r.id.as_u32()).max().unwrap_or(0) + 1;
    let mut index = ResourceIndex::new(schema);

    for record in records {
        let segments: Vec<&str> = record.path.split('/').collect();
        if segments.iter().any(|s| validate_name(s).is_err()) {
            tracing::warn!(path = %record.path, "ignoring value record with a malformed path");
            continue;
        }
        if index.resolve_path(&record.path).is_some() || index.contains(record.id) {
            continue;
        }
        let (leaf, ancestors) = match segments.split_last() {
            Some(split) => split,
            None => continue,
        };

        let mut parent: Option<ResourceId> = None;
        let mut broken = false;
        for segment in ancestors {
            let existing = match parent {
                None => index.toplevel(segment),
                Some(p) => index.child(p, segment),
            };
            let id = match existing {
                Some(id) => id,
                None => {
                    let id = ResourceId::new(next_id);
                    next_id += 1;
                    let el = rebuilt_element(&index, id, segment, None, parent);
                    if index.insert_recovered(el).is_err() {
                        broken = true;
                        break;
                    }
                    id
                }
            };
            parent = Some(id);
        }
        if broken {
            continue;
        }
        let el = rebuilt_element(&index, record.id, leaf, Some(record), parent);
        if let Err(e) = index.insert_recovered(el) {
            tracing::warn!(path = %record.path, error = %e, "could not rebuild node");
        }
    }
    index.restore_ids(next_id);
    index
}

fn rebuilt_element(
    index: &ResourceIndex,
    id: ResourceId,
    name: &str,
    record: Option<&ValueRecord>,
    parent: Option<ResourceId>,
) -> TreeElement {
    let schema = index.schema();
    let slot = parent
        .and_then(|p| index.get(p))
        .and_then(|p| schema.slot(p.type_name(), name));
    let (type_name, type_key) = match record {
        Some(r) => (r.type_name.clone(), r.type_key),
        None => match slot {
            Some(s) => (
                s.type_name.clone(),
                schema.type_key(&s.type_name).unwrap_or(TypeKey::Complex),
            ),
            None => (builtin::RESOURCE.to_string(), TypeKey::Complex),
        },
    };
    let decorator = parent.is_some() && slot.is_none();
    let mut el = TreeElement::new_data(id, name, &type_name, type_key, parent, decorator);
    el.element_type = slot.and_then(|s| s.element_type.clone());
    el
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::record::StructureRecord;
    use crate::schema::TypeDef;
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

    fn meter_snapshot(flush: u64, active: bool) -> StructureSnapshot {
        let mut index = ResourceIndex::new(schema());
        let meter = index.add_resource("meter", "Meter", "app").unwrap();
        let power = index.add_child(meter, "power", builtin::FLOAT, false).unwrap();
        index.set_active(power, active).unwrap();
        StructureSnapshot::capture(&index, FlushSequence::new(flush))
    }

    fn write_structure(dir: &MemoryDirectory, n: u64, snapshot: &StructureSnapshot) {
        write_file(
            dir,
            &generation_name("resMap", n),
            &snapshot.encode(Generation::new(n)),
        )
        .unwrap();
    }

    fn power_record(v: f32) -> ValueRecord {
        ValueRecord {
            id: ResourceId::new(2),
            type_key: TypeKey::Float,
            last_modified: 5,
            path: "meter/power".into(),
            type_name: builtin::FLOAT.into(),
            value: Value::Float(v),
        }
    }

    fn write_values(dir: &MemoryDirectory, n: u64, commits: &[(u64, f32)]) {
        let mut log = ValueLog::create(
            dir,
            "resData",
            Generation::new(n),
            FlushSequence::default(),
        )
        .unwrap();
        for (seq, v) in commits {
            log.commit(&[power_record(*v)], &BTreeSet::new(), FlushSequence::new(*seq))
                .unwrap();
        }
    }

    fn corrupt(dir: &MemoryDirectory, name: &str) {
        let mut data = dir.file(name).unwrap().data();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        dir.insert(name, data);
    }

    #[test]
    fn empty_directory_is_a_new_store() {
        let dir = MemoryDirectory::new();
        let recovered = recover(&dir, &prefixes(), schema()).unwrap();
        assert!(recovered.report.new_store);
        assert!(recovered.index.is_empty());
        assert_eq!(dir.list().unwrap(), vec!["resData1"]);
    }

    #[test]
    fn newest_valid_generations_win() {
        let dir = MemoryDirectory::new();
        write_structure(&dir, 3, &meter_snapshot(1, false));
        write_structure(&dir, 4, &meter_snapshot(2, true));
        write_values(&dir, 6, &[(1, 1.0), (2, 2.0)]);

        let recovered = recover(&dir, &prefixes(), schema()).unwrap();
        assert_eq!(recovered.structure_current, Some(4));
        assert_eq!(recovered.structure_old, Some(3));
        assert_eq!(recovered.values.generation(), Generation::new(6));
        let power = recovered.index.resolve_path("meter/power").unwrap();
        assert!(recovered.index.is_active(power));
        assert_eq!(recovered.index.value(power), Some(&Value::Float(2.0)));
        assert_eq!(recovered.flush_seq, FlushSequence::new(2));
    }

    #[test]
    fn invalid_newer_structure_falls_back() {
        let dir = MemoryDirectory::new();
        write_structure(&dir, 3, &meter_snapshot(1, false));
        write_structure(&dir, 4, &meter_snapshot(2, true));
        corrupt(&dir, "resMap4");
        write_values(&dir, 6, &[(1, 1.0), (2, 2.0)]);

        let recovered = recover(&dir, &prefixes(), schema()).unwrap();
        assert_eq!(recovered.structure_current, Some(3));
        assert_eq!(recovered.structure_old, None);
        assert_eq!(recovered.values.generation(), Generation::new(6));
        assert_eq!(recovered.structure_max, 4);
        assert_eq!(recovered.report.invalid, vec!["resMap4".to_string()]);
        let power = recovered.index.resolve_path("meter/power").unwrap();
        assert!(!recovered.index.is_active(power));
        assert_eq!(recovered.index.value(power), Some(&Value::Float(2.0)));
    }

    #[test]
    fn uncommitted_structure_is_skipped() {
        let dir = MemoryDirectory::new();
        write_structure(&dir, 1, &meter_snapshot(1, false));
        write_structure(&dir, 2, &meter_snapshot(2, true));
        write_values(&dir, 1, &[(1, 1.0)]);

        let recovered = recover(&dir, &prefixes(), schema()).unwrap();
        assert_eq!(recovered.structure_current, Some(1));
        assert_eq!(recovered.flush_seq, FlushSequence::new(1));
    }

    #[test]
    fn rebuilds_when_no_structure_is_valid() {
        let dir = MemoryDirectory::new();
        write_structure(&dir, 3, &meter_snapshot(1, true));
        write_structure(&dir, 4, &meter_snapshot(2, true));
        corrupt(&dir, "resMap3");
        corrupt(&dir, "resMap4");
        write_values(&dir, 6, &[(1, 1.0), (2, 7.5)]);

        let recovered = recover(&dir, &prefixes(), schema()).unwrap();
        assert!(recovered.report.rebuilt);
        assert_eq!(recovered.structure_current, Some(5));
        let index = &recovered.index;
        let meter = index.toplevel("meter").unwrap();
        assert_eq!(index.get(meter).unwrap().type_name(), builtin::RESOURCE);
        let power = index.resolve_path("meter/power").unwrap();
        assert_eq!(power, ResourceId::new(2));
        assert!(index.get(power).unwrap().is_decorator());
        assert!(!index.is_active(power));
        assert_eq!(index.value(power), Some(&Value::Float(7.5)));
        assert!(index.ids().peek() > 2);
        assert_eq!(dir.list().unwrap(), vec!["resData6", "resMap5"]);
    }

    #[test]
    fn nothing_valid_is_an_error() {
        let dir = MemoryDirectory::new();
        dir.insert("resMap1", b"garbage".to_vec());
        dir.insert("resData1", b"garbage".to_vec());
        assert!(matches!(
            recover(&dir, &prefixes(), schema()),
            Err(CoreError::Recovery { .. })
        ));
    }

    #[test]
    fn values_of_unknown_nodes_are_ignored() {
        let dir = MemoryDirectory::new();
        write_structure(&dir, 1, &meter_snapshot(1, false));
        let mut log = ValueLog::create(&dir, "resData", Generation::new(1), FlushSequence::default())
            .unwrap();
        let mut stray = power_record(3.0);
        stray.id = ResourceId::new(40);
        let mut mistyped = power_record(4.0);
        mistyped.type_key = TypeKey::Int;
        mistyped.value = Value::Int(4);
        log.commit(&[stray, mistyped], &BTreeSet::new(), FlushSequence::new(1))
            .unwrap();

        let recovered = recover(&dir, &prefixes(), schema()).unwrap();
        assert_eq!(recovered.report.orphaned_values, 2);
        assert_eq!(recovered.values.live_count(), 0);
        let power = recovered.index.resolve_path("meter/power").unwrap();
        assert_eq!(recovered.index.value(power), Some(&Value::Float(0.0)));
    }

    #[test]
    fn fallback_structure_does_not_reuse_ids_seen_in_values() {
        let dir = MemoryDirectory::new();
        write_structure(&dir, 3, &meter_snapshot(1, false));
        dir.insert("resMap4", b"garbage".to_vec());
        let mut log = ValueLog::create(&dir, "resData", Generation::new(1), FlushSequence::default())
            .unwrap();
        let mut later = power_record(3.0);
        later.id = ResourceId::new(9);
        let mut deleted = power_record(4.0);
        deleted.id = ResourceId::new(12);
        log.commit(&[later, deleted], &BTreeSet::new(), FlushSequence::new(1))
            .unwrap();
        let removed: BTreeSet<_> = [ResourceId::new(12)].into_iter().collect();
        log.commit(&[], &removed, FlushSequence::new(1)).unwrap();

        let mut recovered = recover(&dir, &prefixes(), schema()).unwrap();
        assert_eq!(recovered.structure_current, Some(3));
        assert_eq!(recovered.report.orphaned_values, 1);
        let id = recovered
            .index
            .add_resource("fresh", builtin::FLOAT, "app")
            .unwrap();
        assert_eq!(id, ResourceId::new(13));
    }

    #[test]
    fn torn_value_tail_moves_to_a_new_generation() {
        let dir = MemoryDirectory::new();
        write_structure(&dir, 1, &meter_snapshot(1, false));
        write_values(&dir, 1, &[(1, 1.0)]);
        let mut data = dir.file("resData1").unwrap().data();
        data.extend_from_slice(&[9, 0, 0]);
        dir.insert("resData1", data);

        let recovered = recover(&dir, &prefixes(), schema()).unwrap();
        assert_eq!(recovered.values.generation(), Generation::new(2));
        assert_eq!(recovered.values.live_count(), 1);
        assert_eq!(dir.list().unwrap(), vec!["resData2", "resMap1"]);
    }

    #[test]
    fn structure_records_of_unknown_types_load() {
        let dir = MemoryDirectory::new();
        let snapshot = StructureSnapshot {
            flush_seq: FlushSequence::new(1),
            next_id: 2,
            records: vec![StructureRecord {
                id: ResourceId::new(1),
                parent: None,
                name: "legacy".into(),
                type_name: "SomeRetiredType".into(),
                type_key: TypeKey::Complex,
                flags: Default::default(),
                target: None,
                app_id: Some("old-app".into()),
                element_type: None,
            }],
        };
        write_structure(&dir, 1, &snapshot);
        write_values(&dir, 1, &[(1, 1.0)]);
        let recovered = recover(&dir, &prefixes(), schema()).unwrap();
        assert!(recovered.index.toplevel("legacy").is_some());
    }
}
