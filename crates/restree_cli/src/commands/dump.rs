//! Dump command implementation.

use super::tool_config;
use crate::Format;
use restree_core::schema::SchemaRegistry;
use restree_core::{NodeInfo, ResourceDb};
use std::path::Path;

/// Runs the dump command.
pub fn run(path: &Path, under: Option<&str>, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let nodes = dump(path, under)?;
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&nodes)?),
        Format::Text => {
            for node in &nodes {
                print_node(node);
            }
            println!();
            println!("{} resources", nodes.len());
        }
    }
    Ok(())
}

/// Recovers the store at `path` and lists its nodes, optionally only those
/// at or below `under`.
pub fn dump(path: &Path, under: Option<&str>) -> Result<Vec<NodeInfo>, Box<dyn std::error::Error>> {
    let db = ResourceDb::open(path, tool_config(), SchemaRegistry::new())?;
    let report = db.recovery_report();
    if report.rebuilt || !report.invalid.is_empty() {
        tracing::warn!(
            rebuilt = report.rebuilt,
            invalid = report.invalid.len(),
            "store needed repair"
        );
    }
    let prefix = under.map(|p| p.trim_matches('/').to_string());
    let nodes = db
        .dump()
        .into_iter()
        .filter(|node| match &prefix {
            Some(p) => node.path == *p || node.path.starts_with(&format!("{p}/")),
            None => true,
        })
        .collect();
    db.close()?;
    Ok(nodes)
}

fn print_node(node: &NodeInfo) {
    let depth = node.path.matches('/').count();
    let name = node.path.rsplit('/').next().unwrap_or_default();
    let mut line = format!("{}{name} : {}", "  ".repeat(depth), node.type_name);
    if let Some(target) = &node.reference {
        line.push_str(&format!(" -> {target}"));
    }
    if let Some(value) = &node.value {
        line.push_str(&format!(" = {value}"));
    }
    if node.active {
        line.push_str(" (active)");
    }
    if node.decorator {
        line.push_str(" [decorator]");
    }
    if let Some(owner) = &node.owner {
        line.push_str(&format!(" <{owner}>"));
    }
    println!("{line}");
}
