//! Structure generations: whole-tree snapshots.

use super::record::{
    check_structure_footer, encode_structure_footer, open_envelope, seal, StructureHeader,
    StructureRecord, STRUCTURE_FOOTER_SIZE,
};
use crate::error::{CoreError, CoreResult};
use crate::index::ResourceIndex;
use crate::types::{FlushSequence, Generation};

/// A tree snapshot as written to a structure generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructureSnapshot {
    /// Flush that wrote the snapshot.
    pub flush_seq: FlushSequence,
    /// Next id of the id sequence.
    pub next_id: u32,
    /// Nodes, parents before children.
    pub records: Vec<StructureRecord>,
}

impl StructureSnapshot {
    /// Captures the whole index.
    #[must_use]
    pub fn capture(index: &ResourceIndex, flush_seq: FlushSequence) -> Self {
        Self {
            flush_seq,
            next_id: index.ids().peek(),
            records: index.walk().into_iter().map(StructureRecord::from_element).collect(),
        }
    }

    /// Encodes the complete generation file.
    #[must_use]
    pub fn encode(&self, generation: Generation) -> Vec<u8> {
        let count = self.records.len() as u32;
        let mut out = Vec::new();
        StructureHeader {
            generation,
            flush_seq: self.flush_seq,
            next_id: self.next_id,
            record_count: count,
        }
        .encode(&mut out);
        let mut body = Vec::new();
        for record in &self.records {
            body.clear();
            record.encode(&mut body);
            seal(&body, &mut out);
        }
        encode_structure_footer(count, &mut out);
        out
    }

    /// Decodes a generation file. The file is valid only as a whole.
    ///
    /// # Errors
    ///
    /// `Corruption` or `ChecksumMismatch` if any part is damaged, missing or
    /// belongs to another generation.
    pub fn decode(data: &[u8], expected: Generation) -> CoreResult<Self> {
        let header = StructureHeader::decode(data)?;
        if header.generation != expected {
            return Err(CoreError::corruption(format!(
                "file of {expected} carries header of {}",
                header.generation
            )));
        }
        if data.len() < StructureHeader::SIZE + STRUCTURE_FOOTER_SIZE {
            return Err(CoreError::corruption("structure generation is truncated"));
        }
        let end = data.len() - STRUCTURE_FOOTER_SIZE;
        let records_area = &data[..end];
        let mut records = Vec::with_capacity((header.record_count as usize).min(1 << 16));
        let mut offset = StructureHeader::SIZE;
        while let Some((body, next)) = open_envelope(records_area, offset)? {
            records.push(StructureRecord::decode(body)?);
            offset = next;
        }
        if records.len() != header.record_count as usize {
            return Err(CoreError::corruption(format!(
                "expected {} records, found {}",
                header.record_count,
                records.len()
            )));
        }
        check_structure_footer(&data[end..], header.record_count)?;
        Ok(Self {
            flush_seq: header.flush_seq,
            next_id: header.next_id,
            records,
        })
    }

    /// Builds an index from the snapshot.
    ///
    /// References whose target is missing are dropped with a warning.
    ///
    /// # Errors
    ///
    /// `Corruption` if a node's parent is unknown or appears after it, or
    /// names collide.
    pub fn into_index(
        self,
        schema: std::sync::Arc<crate::schema::SchemaRegistry>,
    ) -> CoreResult<ResourceIndex> {
        let mut index = ResourceIndex::new(schema);
        for record in self.records {
            if !index.schema().contains(&record.type_name) {
                tracing::debug!(
                    type_name = %record.type_name,
                    id = %record.id,
                    "recovered node of a type the schema does not know"
                );
            }
            index.insert_recovered(record.into_element())?;
        }
        index.prune_dangling_references();
        index.restore_ids(self.next_id);
        index.dirty().take();
        Ok(index)
    }
}
