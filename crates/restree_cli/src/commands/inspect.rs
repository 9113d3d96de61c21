//! Inspect command implementation.

use super::{format_size, open_files};
use crate::Format;
use restree_core::persistence::{inspect_structure, inspect_values, GenerationStatus, NodeFlags};
use restree_core::Config;
use serde::Serialize;
use std::path::Path;

/// One generation file.
#[derive(Debug, Serialize)]
pub struct GenerationReport {
    /// File name.
    pub name: String,
    /// Generation number.
    pub number: u64,
    /// Size in bytes.
    pub size: u64,
    /// Whether the file validated.
    pub valid: bool,
    /// Flush sequence of the snapshot, or last commit of the log.
    pub flush_seq: Option<u64>,
    /// Records (structure) or live records (values).
    pub records: usize,
    /// Bytes after the last intact commit.
    pub torn_bytes: u64,
    /// Validation error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&GenerationStatus> for GenerationReport {
    fn from(status: &GenerationStatus) -> Self {
        Self {
            name: status.file.name.clone(),
            number: status.file.number,
            size: status.size,
            valid: status.is_valid(),
            flush_seq: status.flush_seq,
            records: status.records,
            torn_bytes: status.torn_bytes,
            error: status.error.clone(),
        }
    }
}

/// A node of the selected structure generation.
#[derive(Debug, Serialize)]
pub struct RecordReport {
    /// Node id.
    pub id: u32,
    /// Parent id.
    pub parent: Option<u32>,
    /// Name among siblings.
    pub name: String,
    /// Schema type.
    pub type_name: String,
    /// Active flag.
    pub active: bool,
    /// Reference target id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<u32>,
}

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// Structure generations, newest first.
    pub structure: Vec<GenerationReport>,
    /// Value generations, newest first.
    pub values: Vec<GenerationReport>,
    /// Structure generation recovery would load.
    pub selected_structure: Option<u64>,
    /// Value generation recovery would continue in.
    pub selected_values: Option<u64>,
    /// Nodes of the selected structure generation (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records: Option<Vec<RecordReport>>,
}

/// Runs the inspect command.
pub fn run(path: &Path, show_records: bool, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let result = inspect(path, show_records)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Format::Text => print_text_output(&result),
    }
    Ok(())
}

/// Collects the inspection result for the store at `path`.
pub fn inspect(path: &Path, show_records: bool) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let dir = open_files(path)?;
    let config = Config::default();
    let structures = inspect_structure(&dir, &config.structure_prefix)?;
    let values = inspect_values(&dir, &config.value_prefix)?;

    // Same choice recovery makes: the newest valid log, then the newest
    // valid snapshot that log committed.
    let chosen_values = values
        .iter()
        .find(|(status, _)| status.is_valid())
        .map(|(status, scan)| (status.file.number, scan.as_ref().map(|s| s.last_commit)));
    let committed = chosen_values.and_then(|(_, commit)| commit);
    let chosen_structure = structures.iter().find_map(|(status, snapshot)| {
        let snapshot = snapshot.as_ref()?;
        if committed.is_some_and(|c| snapshot.flush_seq > c) {
            return None;
        }
        Some((status.file.number, snapshot))
    });

    let records = if show_records {
        chosen_structure.map(|(_, snapshot)| {
            snapshot
                .records
                .iter()
                .map(|r| RecordReport {
                    id: r.id.as_u32(),
                    parent: r.parent.map(|p| p.as_u32()),
                    name: r.name.clone(),
                    type_name: r.type_name.clone(),
                    active: r.flags.contains(NodeFlags::ACTIVE),
                    target: r.target.map(|t| t.as_u32()),
                })
                .collect()
        })
    } else {
        None
    };

    Ok(InspectResult {
        path: path.display().to_string(),
        structure: structures.iter().map(|(s, _)| s.into()).collect(),
        values: values.iter().map(|(s, _)| s.into()).collect(),
        selected_structure: chosen_structure.map(|(n, _)| n),
        selected_values: chosen_values.map(|(n, _)| n),
        records,
    })
}

fn print_family(title: &str, family: &[GenerationReport], selected: Option<u64>) {
    println!("{title}:");
    if family.is_empty() {
        println!("  (none)");
    }
    for generation in family {
        let marker = if Some(generation.number) == selected { "*" } else { " " };
        match &generation.error {
            None => println!(
                " {marker} {:<14} {:>10}  flush {:<6} {} records{}",
                generation.name,
                format_size(generation.size),
                generation.flush_seq.unwrap_or_default(),
                generation.records,
                if generation.torn_bytes > 0 {
                    format!(", {} torn bytes", generation.torn_bytes)
                } else {
                    String::new()
                }
            ),
            Some(error) => println!(
                " {marker} {:<14} {:>10}  INVALID: {error}",
                generation.name,
                format_size(generation.size)
            ),
        }
    }
}

fn print_text_output(result: &InspectResult) {
    println!("restree Store Inspection");
    println!("========================");
    println!();
    println!("Path: {}", result.path);
    println!();
    print_family("Structure generations", &result.structure, result.selected_structure);
    println!();
    print_family("Value generations", &result.values, result.selected_values);

    if let Some(records) = &result.records {
        println!();
        println!("Nodes:");
        for r in records {
            let target = r.target.map(|t| format!(" -> {t}")).unwrap_or_default();
            println!(
                "  [{}] parent={} {} : {}{}{}",
                r.id,
                r.parent.map_or_else(|| "-".to_string(), |p| p.to_string()),
                r.name,
                r.type_name,
                if r.active { " (active)" } else { "" },
                target
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use restree_core::schema::{builtin, SchemaRegistry};
    use restree_core::ResourceDb;

    #[test]
    fn selects_the_live_generations() {
        let temp = tempfile::tempdir().unwrap();
        {
            let db = ResourceDb::open(temp.path(), Config::default(), SchemaRegistry::new()).unwrap();
            let app = db.session("cli");
            app.add_resource("meter", builtin::FLOAT)
                .unwrap()
                .set_float(3.0)
                .unwrap();
            db.flush().unwrap();
        }

        let result = inspect(temp.path(), true).unwrap();
        assert!(result.structure.iter().all(|g| g.valid));
        assert_eq!(result.selected_structure, result.structure.first().map(|g| g.number));
        assert_eq!(result.selected_values, result.values.first().map(|g| g.number));
        let records = result.records.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "meter");
    }
}
