//! Compact command implementation.

use super::{format_size, tool_config};
use restree_core::schema::SchemaRegistry;
use restree_core::ResourceDb;
use std::path::Path;

/// Compaction statistics.
#[derive(Debug)]
pub struct CompactStats {
    /// Value generation before.
    pub generation_before: u64,
    /// Value generation after; equal to before on a dry run.
    pub generation_after: u64,
    /// Live value records.
    pub live_values: usize,
    /// Superseded bytes before compaction.
    pub garbage_before: u64,
    /// Records written by the flush that preceded compaction.
    pub flushed_records: usize,
}

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    println!("Compacting store at {}", path.display());
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let stats = compact(path, dry_run)?;
    println!("Compaction:");
    println!("  Live values:  {}", stats.live_values);
    println!("  Garbage:      {}", format_size(stats.garbage_before));
    if stats.flushed_records > 0 {
        println!("  Flushed:      {} records", stats.flushed_records);
    }
    if dry_run {
        println!("  Generation:   resData{}", stats.generation_before);
    } else {
        println!(
            "  Generation:   resData{} -> resData{}",
            stats.generation_before, stats.generation_after
        );
        println!();
        println!("✓ Compaction complete");
    }
    Ok(())
}

/// Opens the store, flushes what recovery left dirty and rewrites the value
/// generation.
pub fn compact(path: &Path, dry_run: bool) -> Result<CompactStats, Box<dyn std::error::Error>> {
    let db = ResourceDb::open(path, tool_config(), SchemaRegistry::new())?;
    let before = db.generations();
    let mut stats = CompactStats {
        generation_before: before.value_current,
        generation_after: before.value_current,
        live_values: before.live_values,
        garbage_before: before.garbage_bytes,
        flushed_records: 0,
    };
    if dry_run {
        return Ok(stats);
    }

    stats.flushed_records = db.flush()?.records;
    let generation = db.compact()?;
    stats.generation_after = generation.as_u64();
    tracing::info!(generation = %generation, "compacted value generation");
    db.close()?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use restree_core::schema::builtin;
    use restree_core::Config;

    #[test]
    fn compaction_drops_garbage_and_keeps_values() {
        let temp = tempfile::tempdir().unwrap();
        {
            let config = Config::default().compaction_start_size(u64::MAX);
            let db = ResourceDb::open(temp.path(), config, SchemaRegistry::new()).unwrap();
            let power = db.session("cli").add_resource("power", builtin::FLOAT).unwrap();
            for i in 0..10 {
                power.set_float(i as f32).unwrap();
                db.flush().unwrap();
            }
        }

        let dry = compact(temp.path(), true).unwrap();
        assert!(dry.garbage_before > 0);
        assert_eq!(dry.generation_before, dry.generation_after);

        let stats = compact(temp.path(), false).unwrap();
        assert!(stats.generation_after > stats.generation_before);

        let db = ResourceDb::open(temp.path(), tool_config(), SchemaRegistry::new()).unwrap();
        assert_eq!(db.generations().garbage_bytes, 0);
        let power = db.session("cli").resource("power").unwrap().unwrap();
        assert_eq!(power.float().unwrap(), 9.0);
    }
}
