//! Generation file naming and whole-file I/O.

use crate::error::CoreResult;
use restree_storage::StorageDirectory;

/// One file of a generation family.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct GenerationFile {
    /// Generation number parsed from the name.
    pub number: u64,
    /// File name.
    pub name: String,
}

/// File name of generation `number` of a family.
#[must_use]
pub fn generation_name(prefix: &str, number: u64) -> String {
    format!("{prefix}{number}")
}

/// Parses `<prefix><digits>`.
#[must_use]
pub fn parse_generation(prefix: &str, name: &str) -> Option<u64> {
    let digits = name.strip_prefix(prefix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Lists the generations of a family in ascending order.
///
/// # Errors
///
/// Returns an error if the directory cannot be listed.
pub fn scan(dir: &dyn StorageDirectory, prefix: &str) -> CoreResult<Vec<GenerationFile>> {
    let mut files: Vec<GenerationFile> = dir
        .list()?
        .into_iter()
        .filter_map(|name| {
            parse_generation(prefix, &name).map(|number| GenerationFile { number, name })
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Reads a whole file.
///
/// # Errors
///
/// Returns an error if the file is missing or unreadable.
pub fn read_file(dir: &dyn StorageDirectory, name: &str) -> CoreResult<Vec<u8>> {
    Ok(dir.open(name)?.read_all()?)
}

/// Writes a complete file and syncs it.
///
/// # Errors
///
/// Returns an error if any write or sync fails.
pub fn write_file(dir: &dyn StorageDirectory, name: &str, data: &[u8]) -> CoreResult<()> {
    let mut backend = dir.create(name)?;
    backend.append(data)?;
    backend.sync()?;
    Ok(())
}

/// Removes every listed file except `keep`, logging failures. Returns how
/// many were removed.
pub(crate) fn retire(dir: &dyn StorageDirectory, files: &[GenerationFile], keep: &[u64]) -> usize {
    let mut removed = 0;
    for file in files.iter().filter(|f| !keep.contains(&f.number)) {
        match dir.remove(&file.name) {
            Ok(()) => {
                tracing::debug!(file = %file.name, "retired generation");
                removed += 1;
            }
            Err(e) => tracing::warn!(file = %file.name, error = %e, "failed to retire generation"),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use restree_storage::MemoryDirectory;

    #[test]
    fn parse_accepts_only_digits() {
        assert_eq!(parse_generation("resMap", "resMap12"), Some(12));
        assert_eq!(parse_generation("resMap", "resMap"), None);
        assert_eq!(parse_generation("resMap", "resMap1.tmp"), None);
        assert_eq!(parse_generation("resMap", "resData1"), None);
    }

    #[test]
    fn scan_sorts_numerically() {
        let dir = MemoryDirectory::new();
        for name in ["resMap10", "resMap9", "resData3", "LOCK", "resMap2"] {
            dir.insert(name, Vec::new());
        }
        let numbers: Vec<u64> = scan(&dir, "resMap")
            .unwrap()
            .into_iter()
            .map(|f| f.number)
            .collect();
        assert_eq!(numbers, vec![2, 9, 10]);
    }

    #[test]
    fn retire_keeps_listed_generations() {
        let dir = MemoryDirectory::new();
        for n in 1..=4 {
            write_file(&dir, &generation_name("resMap", n), b"x").unwrap();
        }
        let files = scan(&dir, "resMap").unwrap();
        assert_eq!(retire(&dir, &files, &[3, 4]), 2);
        assert_eq!(dir.list().unwrap(), vec!["resMap3", "resMap4"]);
        assert_eq!(read_file(&dir, "resMap4").unwrap(), b"x");
    }
}
