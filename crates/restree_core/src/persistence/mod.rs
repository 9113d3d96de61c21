//! Generation-based persistence.
//!
//! The tree is stored in two families of numbered files inside the
//! database directory:
//!
//! - structure generations (`resMap<n>`), each a complete snapshot of the
//!   tree shape, written whenever the shape changed since the last flush;
//! - value generations (`resData<n>`), append-only logs of value records.
//!   Each flush appends its records followed by a commit marker.
//!
//! Both families carry the flush sequence number, so recovery can tell a
//! structure written by an interrupted flush from a committed one. At most
//! two structure generations (current and old) and one value generation
//! survive a flush; a compaction rewrites the live values into a fresh
//! value generation once superseded bytes pass the configured threshold.
//!
//! ```text
//! structure: "RMAP" | ver u16 | gen u64 | flush u64 | next_id u32 | count u32 | crc u32
//!            { len u32 | record | crc32c }*
//!            "REND" | count u32 | crc u32
//! values:    "RDAT" | ver u16 | gen u64 | crc u32
//!            { len u32 | entry | crc32c }*      entry = VALUE record | COMMIT
//! ```

mod generation;
mod record;
mod recovery;
mod store;
mod structure;
mod timed;
mod values;

pub use generation::{generation_name, parse_generation, GenerationFile};
pub use record::{NodeFlags, StructureRecord, ValueEntry, ValueRecord, FORMAT_VERSION};
pub use recovery::{
    inspect_structure, inspect_values, recover, GenerationStatus, Prefixes, Recovered,
    RecoveryReport,
};
pub use store::{FlushOutcome, GenerationInfo, LogStore, RecoveredGenerations};
pub use structure::StructureSnapshot;
pub use timed::TimedPersistence;
pub use values::{ValueLog, ValueScan};
