//! Verify command implementation.

use super::open_files;
use restree_core::persistence::{inspect_structure, inspect_values, GenerationStatus};
use restree_core::Config;
use std::collections::HashSet;
use std::path::Path;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of files checked.
    pub files_checked: usize,
    /// Number of files that validated.
    pub valid_files: usize,
    /// Problems that make a file unusable.
    pub errors: Vec<String>,
    /// Problems recovery repairs on its own.
    pub warnings: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn record(&mut self, status: &GenerationStatus) {
        self.files_checked += 1;
        match &status.error {
            None => {
                self.valid_files += 1;
                if status.torn_bytes > 0 {
                    self.warnings.push(format!(
                        "{}: {} bytes after the last commit",
                        status.file.name, status.torn_bytes
                    ));
                }
            }
            Some(error) => self.errors.push(format!("{}: {error}", status.file.name)),
        }
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying store at {}", path.display());
    println!();

    let result = verify(path)?;
    println!(
        "Checked {} files, {} valid",
        result.files_checked, result.valid_files
    );
    for warning in &result.warnings {
        println!("  warning: {warning}");
    }
    for error in &result.errors {
        println!("  error:   {error}");
    }

    println!();
    if result.is_ok() {
        println!("✓ Store verification passed");
        Ok(())
    } else {
        println!("✗ Store verification failed");
        Err("Verification failed".into())
    }
}

/// Checks every generation file of the store at `path`.
pub fn verify(path: &Path) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    let dir = open_files(path)?;
    let config = Config::default();
    let structures = inspect_structure(&dir, &config.structure_prefix)?;
    let values = inspect_values(&dir, &config.value_prefix)?;

    let mut result = VerifyResult::default();
    for (status, _) in &structures {
        result.record(status);
    }
    for (status, _) in &values {
        result.record(status);
    }

    let newest_structure = structures.iter().find_map(|(_, s)| s.as_ref());
    let newest_values = values.iter().find_map(|(_, v)| v.as_ref());
    if let (Some(snapshot), Some(scan)) = (newest_structure, newest_values) {
        let known: HashSet<_> = snapshot.records.iter().map(|r| r.id).collect();
        let orphans = scan
            .records
            .keys()
            .filter(|id| !known.contains(id))
            .count();
        if orphans > 0 {
            result.warnings.push(format!(
                "{orphans} value records have no node in the newest structure"
            ));
        }
    }
    if structures.is_empty() && values.is_empty() {
        result.warnings.push("no generation files".to_string());
    }
    Ok(result)
}
