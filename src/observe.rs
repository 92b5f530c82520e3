//! Observation layer: enumerate the on-disk artifacts a node produced for a
//! table, per data directory, and assert the per-directory byte totals are
//! balanced.

use std::path::{Path, PathBuf};

use crate::check::assert_almost_equal;
use crate::cluster::NodeHandle;
use crate::error::Result;

/// Relative tolerance used by the balance assertions.
pub const BALANCE_TOLERANCE: f64 = 0.2;

/// Directory holding a table's artifacts within one data directory.
pub fn table_dir(node_dir: &Path, dir_index: usize, keyspace: &str, table: &str) -> PathBuf {
    node_dir
        .join(format!("data{dir_index}"))
        .join(keyspace)
        .join(table)
}

/// Artifact files for a table, grouped by data directory. Directories that
/// never received a flush are reported as empty groups.
pub fn sstables_per_data_directory(
    node_dir: &Path,
    datadir_count: usize,
    keyspace: &str,
    table: &str,
) -> Result<Vec<Vec<PathBuf>>> {
    let mut per_dir = Vec::with_capacity(datadir_count);
    for dir_index in 0..datadir_count {
        let dir = table_dir(node_dir, dir_index, keyspace, table);
        let mut files = Vec::new();
        if dir.is_dir() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    files.push(entry.path());
                }
            }
            files.sort();
        }
        per_dir.push(files);
    }
    Ok(per_dir)
}

/// Total artifact bytes for a table in each data directory.
pub fn datadir_sizes(
    node_dir: &Path,
    datadir_count: usize,
    keyspace: &str,
    table: &str,
) -> Result<Vec<u64>> {
    let mut sums = Vec::with_capacity(datadir_count);
    for files in sstables_per_data_directory(node_dir, datadir_count, keyspace, table)? {
        let mut sum = 0u64;
        for file in files {
            sum += std::fs::metadata(&file)?.len();
        }
        sums.push(sum);
    }
    Ok(sums)
}

/// Asserts a node's per-directory byte totals for a table are within the
/// balance tolerance, failing with the node name.
#[track_caller]
pub fn assert_balanced(node: &NodeHandle, keyspace: &str, table: &str) {
    let sums = datadir_sizes(node.path(), node.datadir_count(), keyspace, table)
        .unwrap_or_else(|e| panic!("listing artifacts of {}: {e}", node.name()));
    tracing::debug!(node = node.name(), ?sums, "per-directory artifact totals");
    assert_almost_equal(&sums, BALANCE_TOLERANCE, node.name());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_artifact(dir: &Path, name: &str, len: usize) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(name), vec![0u8; len]).unwrap();
    }

    #[test]
    fn test_sizes_sum_per_directory() {
        let scratch = crate::check::temp_dir(Some("cuttle_observe"), false);
        let node_dir = scratch.path();

        write_artifact(
            &table_dir(node_dir, 0, "keyspace1", "standard1"),
            "000001-Data.db",
            100,
        );
        write_artifact(
            &table_dir(node_dir, 0, "keyspace1", "standard1"),
            "000002-Data.db",
            20,
        );
        write_artifact(
            &table_dir(node_dir, 2, "keyspace1", "standard1"),
            "000003-Data.db",
            90,
        );

        let sums = datadir_sizes(node_dir, 3, "keyspace1", "standard1").unwrap();
        assert_eq!(sums, vec![120, 0, 90]);

        let per_dir = sstables_per_data_directory(node_dir, 3, "keyspace1", "standard1").unwrap();
        assert_eq!(per_dir[0].len(), 2);
        assert_eq!(per_dir[1].len(), 0);
        assert_eq!(per_dir[2].len(), 1);
    }

    #[test]
    fn test_missing_table_dirs_are_empty() {
        let scratch = crate::check::temp_dir(Some("cuttle_observe"), false);
        let sums = datadir_sizes(scratch.path(), 3, "ks", "cf").unwrap();
        assert_eq!(sums, vec![0, 0, 0]);
    }
}
