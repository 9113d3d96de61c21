//! Record formats of structure and value generations.
//!
//! Every record travels in an envelope: `len (4) | body | crc32c(body) (4)`.
//! A reader that runs out of bytes or meets a bad checksum stops there; what
//! it does with the rest depends on the file family.

use crate::codec::{checksum, ByteReader, PutBytes};
use crate::element::{ElementKind, TreeElement};
use crate::error::{CoreError, CoreResult};
use crate::types::{FlushSequence, Generation, ResourceId, TypeKey};
use crate::value::Value;

/// On-disk format version of both file families.
pub const FORMAT_VERSION: u16 = 1;

pub(crate) const STRUCTURE_MAGIC: &[u8; 4] = b"RMAP";
pub(crate) const STRUCTURE_FOOTER_MAGIC: &[u8; 4] = b"REND";
pub(crate) const VALUE_MAGIC: &[u8; 4] = b"RDAT";

/// Size of the envelope around a body.
pub(crate) const ENVELOPE_OVERHEAD: usize = 8;

/// Wraps a body into an envelope.
pub(crate) fn seal(body: &[u8], out: &mut Vec<u8>) {
    out.put_u32(body.len() as u32);
    out.extend_from_slice(body);
    out.put_u32(checksum(body));
}

/// Reads the envelope at `offset`.
///
/// Returns `Ok(None)` at the exact end of `data`, the body and the offset of
/// the next envelope otherwise.
///
/// # Errors
///
/// `Corruption` for a truncated envelope, `ChecksumMismatch` for a damaged
/// body.
pub(crate) fn open_envelope(data: &[u8], offset: usize) -> CoreResult<Option<(&[u8], usize)>> {
    if offset == data.len() {
        return Ok(None);
    }
    let mut r = ByteReader::new(&data[offset..]);
    let len = r.u32()? as usize;
    if r.remaining() < len + 4 {
        return Err(CoreError::corruption(format!(
            "record at offset {offset} is truncated"
        )));
    }
    let start = offset + 4;
    let body = &data[start..start + len];
    let stored = u32::from_le_bytes([
        data[start + len],
        data[start + len + 1],
        data[start + len + 2],
        data[start + len + 3],
    ]);
    let actual = checksum(body);
    if stored != actual {
        return Err(CoreError::ChecksumMismatch {
            expected: stored,
            actual,
        });
    }
    Ok(Some((body, start + len + 4)))
}

/// Node flags in a structure record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeFlags(u8);

impl NodeFlags {
    /// Node is active.
    pub const ACTIVE: Self = Self(0x01);
    /// Node is a decorator.
    pub const DECORATOR: Self = Self(0x02);
    /// Node is a reference.
    pub const REFERENCE: Self = Self(0x04);

    const KNOWN: u8 = 0x07;

    /// Raw byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self.0
    }

    /// Returns `true` if every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    const fn with(self, other: Self, on: bool) -> Self {
        if on {
            Self(self.0 | other.0)
        } else {
            self
        }
    }
}

/// One node of a structure generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructureRecord {
    /// Node id.
    pub id: ResourceId,
    /// Owning parent; `None` for toplevel resources.
    pub parent: Option<ResourceId>,
    /// Name among siblings.
    pub name: String,
    /// Schema type name.
    pub type_name: String,
    /// Storage key.
    pub type_key: TypeKey,
    /// Active/decorator/reference flags.
    pub flags: NodeFlags,
    /// Target of a reference.
    pub target: Option<ResourceId>,
    /// Owner of a toplevel resource.
    pub app_id: Option<String>,
    /// Element type of a list.
    pub element_type: Option<String>,
}

fn put_opt_str(buf: &mut Vec<u8>, v: Option<&str>) {
    match v {
        Some(s) => {
            buf.put_u8(1);
            buf.put_str(s);
        }
        None => buf.put_u8(0),
    }
}

fn opt_str(r: &mut ByteReader<'_>) -> CoreResult<Option<String>> {
    match r.u8()? {
        0 => Ok(None),
        1 => Ok(Some(r.string()?)),
        b => Err(CoreError::corruption(format!("invalid option tag {b}"))),
    }
}

fn type_key(r: &mut ByteReader<'_>) -> CoreResult<TypeKey> {
    let b = r.u8()?;
    TypeKey::from_byte(b).ok_or_else(|| CoreError::corruption(format!("unknown type key {b}")))
}

impl StructureRecord {
    /// Captures a tree element.
    #[must_use]
    pub fn from_element(el: &TreeElement) -> Self {
        let flags = NodeFlags::default()
            .with(NodeFlags::ACTIVE, el.is_active())
            .with(NodeFlags::DECORATOR, el.is_decorator())
            .with(NodeFlags::REFERENCE, el.is_reference());
        Self {
            id: el.id(),
            parent: el.parent(),
            name: el.name().to_string(),
            type_name: el.type_name().to_string(),
            type_key: el.type_key(),
            flags,
            target: el.reference_target(),
            app_id: el.app_id().map(str::to_string),
            element_type: el.element_type().map(str::to_string),
        }
    }

    /// Rebuilds the tree element, with the default value of its key.
    #[must_use]
    pub fn into_element(self) -> TreeElement {
        let mut el = TreeElement::new_data(
            self.id,
            &self.name,
            &self.type_name,
            self.type_key,
            self.parent,
            self.flags.contains(NodeFlags::DECORATOR),
        );
        el.active = self.flags.contains(NodeFlags::ACTIVE);
        el.app_id = self.app_id;
        el.element_type = self.element_type;
        if let Some(target) = self.target {
            el.kind = ElementKind::Reference(target);
        }
        el
    }

    /// Appends the record body.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u32(self.id.as_u32());
        buf.put_u32(self.parent.map_or(0, ResourceId::as_u32));
        buf.put_str(&self.name);
        buf.put_str(&self.type_name);
        buf.put_u8(self.type_key.as_byte());
        buf.put_u8(self.flags.as_byte());
        if self.flags.contains(NodeFlags::REFERENCE) {
            buf.put_u32(self.target.map_or(0, ResourceId::as_u32));
        }
        put_opt_str(buf, self.app_id.as_deref());
        put_opt_str(buf, self.element_type.as_deref());
    }

    /// Decodes a record body.
    ///
    /// # Errors
    ///
    /// `Corruption` for malformed bodies.
    pub fn decode(body: &[u8]) -> CoreResult<Self> {
        let mut r = ByteReader::new(body);
        let id = r.u32()?;
        if id == 0 {
            return Err(CoreError::corruption("node id 0"));
        }
        let parent = match r.u32()? {
            0 => None,
            p => Some(ResourceId::new(p)),
        };
        let name = r.string()?;
        let type_name = r.string()?;
        let type_key = type_key(&mut r)?;
        let raw_flags = r.u8()?;
        if raw_flags & !NodeFlags::KNOWN != 0 {
            return Err(CoreError::corruption(format!("unknown node flags {raw_flags:#x}")));
        }
        let flags = NodeFlags(raw_flags);
        let target = if flags.contains(NodeFlags::REFERENCE) {
            Some(ResourceId::new(r.u32()?))
        } else {
            None
        };
        let app_id = opt_str(&mut r)?;
        let element_type = opt_str(&mut r)?;
        r.expect_end()?;
        Ok(Self {
            id: ResourceId::new(id),
            parent,
            name,
            type_name,
            type_key,
            flags,
            target,
            app_id,
            element_type,
        })
    }
}

/// Header of a structure generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructureHeader {
    /// Generation number; matches the file name.
    pub generation: Generation,
    /// Flush that wrote the snapshot.
    pub flush_seq: FlushSequence,
    /// Next id of the id sequence.
    pub next_id: u32,
    /// Number of node records.
    pub record_count: u32,
}

impl StructureHeader {
    /// Encoded size.
    pub const SIZE: usize = 4 + 2 + 8 + 8 + 4 + 4 + 4;

    /// Appends the header.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        buf.extend_from_slice(STRUCTURE_MAGIC);
        buf.put_u16(FORMAT_VERSION);
        buf.put_u64(self.generation.as_u64());
        buf.put_u64(self.flush_seq.as_u64());
        buf.put_u32(self.next_id);
        buf.put_u32(self.record_count);
        let crc = checksum(&buf[start..]);
        buf.put_u32(crc);
    }

    /// Decodes the header at the start of `data`.
    ///
    /// # Errors
    ///
    /// `Corruption` for a short buffer, bad magic or unsupported version,
    /// `ChecksumMismatch` for a damaged header.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < Self::SIZE {
            return Err(CoreError::corruption("structure header is truncated"));
        }
        let mut r = ByteReader::new(&data[..Self::SIZE]);
        if r.u32()?.to_le_bytes() != *STRUCTURE_MAGIC {
            return Err(CoreError::corruption("bad structure magic"));
        }
        let version = r.u16()?;
        if version != FORMAT_VERSION {
            return Err(CoreError::corruption(format!(
                "unsupported structure format version {version}"
            )));
        }
        let header = Self {
            generation: Generation::new(r.u64()?),
            flush_seq: FlushSequence::new(r.u64()?),
            next_id: r.u32()?,
            record_count: r.u32()?,
        };
        let stored = r.u32()?;
        let actual = checksum(&data[..Self::SIZE - 4]);
        if stored != actual {
            return Err(CoreError::ChecksumMismatch {
                expected: stored,
                actual,
            });
        }
        Ok(header)
    }
}

/// Appends the structure footer for `count` records.
pub(crate) fn encode_structure_footer(count: u32, buf: &mut Vec<u8>) {
    let start = buf.len();
    buf.extend_from_slice(STRUCTURE_FOOTER_MAGIC);
    buf.put_u32(count);
    let crc = checksum(&buf[start..]);
    buf.put_u32(crc);
}

/// Size of the structure footer.
pub(crate) const STRUCTURE_FOOTER_SIZE: usize = 12;

/// Checks the structure footer.
pub(crate) fn check_structure_footer(footer: &[u8], count: u32) -> CoreResult<()> {
    if footer.len() != STRUCTURE_FOOTER_SIZE || &footer[..4] != STRUCTURE_FOOTER_MAGIC {
        return Err(CoreError::corruption("missing structure footer"));
    }
    let mut r = ByteReader::new(&footer[4..]);
    let stored_count = r.u32()?;
    let stored_crc = r.u32()?;
    let actual = checksum(&footer[..8]);
    if stored_crc != actual {
        return Err(CoreError::ChecksumMismatch {
            expected: stored_crc,
            actual,
        });
    }
    if stored_count != count {
        return Err(CoreError::corruption(format!(
            "footer counts {stored_count} records, header {count}"
        )));
    }
    Ok(())
}

/// Header of a value generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueHeader {
    /// Generation number; matches the file name.
    pub generation: Generation,
}

impl ValueHeader {
    /// Encoded size.
    pub const SIZE: usize = 4 + 2 + 8 + 4;

    /// Appends the header.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        buf.extend_from_slice(VALUE_MAGIC);
        buf.put_u16(FORMAT_VERSION);
        buf.put_u64(self.generation.as_u64());
        let crc = checksum(&buf[start..]);
        buf.put_u32(crc);
    }

    /// Decodes the header at the start of `data`.
    ///
    /// # Errors
    ///
    /// As [`StructureHeader::decode`].
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < Self::SIZE {
            return Err(CoreError::corruption("value header is truncated"));
        }
        let mut r = ByteReader::new(&data[..Self::SIZE]);
        if r.u32()?.to_le_bytes() != *VALUE_MAGIC {
            return Err(CoreError::corruption("bad value magic"));
        }
        let version = r.u16()?;
        if version != FORMAT_VERSION {
            return Err(CoreError::corruption(format!(
                "unsupported value format version {version}"
            )));
        }
        let generation = Generation::new(r.u64()?);
        let stored = r.u32()?;
        let actual = checksum(&data[..Self::SIZE - 4]);
        if stored != actual {
            return Err(CoreError::ChecksumMismatch {
                expected: stored,
                actual,
            });
        }
        Ok(Self { generation })
    }
}

/// The persisted value of one node.
///
/// Carries its id, key byte, path and type name so it decodes, and so a lost
/// structure can be rebuilt, without any other information.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueRecord {
    /// Node id.
    pub id: ResourceId,
    /// Storage key of the payload.
    pub type_key: TypeKey,
    /// Last write time.
    pub last_modified: i64,
    /// Path of the node when it was written.
    pub path: String,
    /// Schema type name.
    pub type_name: String,
    /// The value.
    pub value: Value,
}

impl ValueRecord {
    /// Captures a value-bearing node. `None` for references and complex
    /// nodes.
    #[must_use]
    pub fn from_element(el: &TreeElement, path: String) -> Option<Self> {
        let value = el.value()?;
        if !el.type_key().has_value() {
            return None;
        }
        Some(Self {
            id: el.id(),
            type_key: el.type_key(),
            last_modified: el.last_modified(),
            path,
            type_name: el.type_name().to_string(),
            value: value.clone(),
        })
    }
}

/// An entry of a value generation.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueEntry {
    /// A value record.
    Value(ValueRecord),
    /// Marks a node as deleted; earlier records for `id` no longer apply.
    Removed {
        /// Deleted node.
        id: ResourceId,
    },
    /// Seals the records since the previous commit.
    Commit {
        /// Flush that wrote the group.
        flush_seq: FlushSequence,
        /// Number of value and removal entries in the group.
        record_count: u32,
    },
}

const ENTRY_VALUE: u8 = 1;
const ENTRY_COMMIT: u8 = 2;
const ENTRY_REMOVED: u8 = 3;

impl ValueEntry {
    /// Appends the entry body.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            ValueEntry::Value(rec) => {
                buf.put_u8(ENTRY_VALUE);
                buf.put_u32(rec.id.as_u32());
                buf.put_u8(rec.type_key.as_byte());
                buf.put_i64(rec.last_modified);
                buf.put_str(&rec.path);
                buf.put_str(&rec.type_name);
                rec.value.encode_payload(buf);
            }
            ValueEntry::Removed { id } => {
                buf.put_u8(ENTRY_REMOVED);
                buf.put_u32(id.as_u32());
            }
            ValueEntry::Commit {
                flush_seq,
                record_count,
            } => {
                buf.put_u8(ENTRY_COMMIT);
                buf.put_u64(flush_seq.as_u64());
                buf.put_u32(*record_count);
            }
        }
    }

    /// Encodes the entry in its envelope.
    #[must_use]
    pub fn sealed(&self) -> Vec<u8> {
        let mut body = Vec::new();
        self.encode(&mut body);
        let mut out = Vec::with_capacity(body.len() + ENVELOPE_OVERHEAD);
        seal(&body, &mut out);
        out
    }

    /// Decodes an entry body.
    ///
    /// # Errors
    ///
    /// `Corruption` for malformed bodies, including payloads that do not
    /// match their key.
    pub fn decode(body: &[u8]) -> CoreResult<Self> {
        let mut r = ByteReader::new(body);
        let entry = match r.u8()? {
            ENTRY_VALUE => {
                let id = ResourceId::new(r.u32()?);
                let type_key = type_key(&mut r)?;
                if !type_key.has_value() {
                    return Err(CoreError::corruption(format!(
                        "value record for {id} has key {type_key}"
                    )));
                }
                let last_modified = r.i64()?;
                let path = r.string()?;
                let type_name = r.string()?;
                let value = Value::decode_payload(type_key, &mut r)?;
                ValueEntry::Value(ValueRecord {
                    id,
                    type_key,
                    last_modified,
                    path,
                    type_name,
                    value,
                })
            }
            ENTRY_COMMIT => ValueEntry::Commit {
                flush_seq: FlushSequence::new(r.u64()?),
                record_count: r.u32()?,
            },
            ENTRY_REMOVED => ValueEntry::Removed {
                id: ResourceId::new(r.u32()?),
            },
            kind => return Err(CoreError::corruption(format!("unknown entry kind {kind}"))),
        };
        r.expect_end()?;
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_value() -> ValueRecord {
        ValueRecord {
            id: ResourceId::new(7),
            type_key: TypeKey::FloatArr,
            last_modified: 1_700_000_000_000,
            path: "meter/readings".into(),
            type_name: "FloatArrayResource".into(),
            value: Value::FloatArr(vec![1.0, 2.5]),
        }
    }

    #[test]
    fn envelope_detects_damage() {
        let entry = ValueEntry::Value(sample_value());
        let mut sealed = entry.sealed();
        let (body, next) = open_envelope(&sealed, 0).unwrap().unwrap();
        assert_eq!(ValueEntry::decode(body).unwrap(), entry);
        assert_eq!(next, sealed.len());
        assert!(open_envelope(&sealed, next).unwrap().is_none());

        sealed[10] ^= 0xFF;
        assert!(matches!(
            open_envelope(&sealed, 0),
            Err(CoreError::ChecksumMismatch { .. })
        ));
        assert!(open_envelope(&sealed[..sealed.len() - 1], 0)
            .unwrap_err()
            .is_corruption());
    }

    #[test]
    fn structure_record_keeps_reference_and_flags() {
        let rec = StructureRecord {
            id: ResourceId::new(4),
            parent: Some(ResourceId::new(1)),
            name: "location".into(),
            type_name: "Location".into(),
            type_key: TypeKey::Complex,
            flags: NodeFlags::ACTIVE.with(NodeFlags::REFERENCE, true),
            target: Some(ResourceId::new(2)),
            app_id: None,
            element_type: None,
        };
        let mut body = Vec::new();
        rec.encode(&mut body);
        let decoded = StructureRecord::decode(&body).unwrap();
        assert_eq!(decoded, rec);

        let el = decoded.into_element();
        assert!(el.is_active());
        assert_eq!(el.reference_target(), Some(ResourceId::new(2)));
    }

    #[test]
    fn headers_reject_damage() {
        let mut buf = Vec::new();
        StructureHeader {
            generation: Generation::new(3),
            flush_seq: FlushSequence::new(9),
            next_id: 12,
            record_count: 2,
        }
        .encode(&mut buf);
        assert_eq!(buf.len(), StructureHeader::SIZE);
        assert_eq!(StructureHeader::decode(&buf).unwrap().next_id, 12);
        buf[7] ^= 1;
        assert!(StructureHeader::decode(&buf).unwrap_err().is_corruption());

        let mut buf = Vec::new();
        ValueHeader {
            generation: Generation::new(6),
        }
        .encode(&mut buf);
        assert_eq!(buf.len(), ValueHeader::SIZE);
        assert!(StructureHeader::decode(&buf).is_err());
        assert_eq!(
            ValueHeader::decode(&buf).unwrap().generation,
            Generation::new(6)
        );
    }

    #[test]
    fn footer_must_match_count() {
        let mut buf = Vec::new();
        encode_structure_footer(5, &mut buf);
        assert_eq!(buf.len(), STRUCTURE_FOOTER_SIZE);
        assert!(check_structure_footer(&buf, 5).is_ok());
        assert!(check_structure_footer(&buf, 4).is_err());
    }

    #[test]
    fn complex_value_records_are_rejected() {
        let mut body = vec![ENTRY_VALUE];
        body.put_u32(1);
        body.put_u8(TypeKey::Complex.as_byte());
        assert!(ValueEntry::decode(&body).unwrap_err().is_corruption());
    }

    #[test]
    fn removal_entries_carry_only_the_id() {
        let entry = ValueEntry::Removed {
            id: ResourceId::new(42),
        };
        let sealed = entry.sealed();
        let (body, _) = open_envelope(&sealed, 0).unwrap().unwrap();
        assert_eq!(body.len(), 5);
        assert_eq!(ValueEntry::decode(body).unwrap(), entry);

        let mut trailing = body.to_vec();
        trailing.push(0);
        assert!(ValueEntry::decode(&trailing).unwrap_err().is_corruption());
    }

    proptest! {
        #[test]
        fn decoding_arbitrary_bytes_never_panics(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = ValueEntry::decode(&data);
            let _ = StructureRecord::decode(&data);
            let _ = StructureHeader::decode(&data);
            let _ = ValueHeader::decode(&data);
            let mut offset = 0;
            while let Ok(Some((_, next))) = open_envelope(&data, offset) {
                offset = next;
            }
        }
    }
}
