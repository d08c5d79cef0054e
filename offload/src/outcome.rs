use std::{fs, io, path::{Path, PathBuf}};
use tracing::{debug, warn};

/// Name of the outcome record inside each sub-task directory.
pub const OUTCOME_FILE: &str = "outcome";

/// Prefix of every sub-task working directory (`st-<index>`).
pub const SUB_TASK_DIR_PREFIX: &str = "st-";

/// Prefix of a sub-task group directory (`g-<index>`). A working tree
/// either holds `st-*` directories directly or `g-*` directories each
/// holding a slice of `st-*` members; the layout is discovered, never
/// configured, so a restarted job sees the same structure it left.
pub const GROUP_DIR_PREFIX: &str = "g-";

/// Tri-state outcome of one sub-task, written whole-file by the
/// executing process and only ever read by the masters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Processing,
    Complete,
    Failed,
}

impl Outcome {
    pub fn literal(&self) -> &'static str {
        match self {
            Self::Processing => "PROCESSING",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
        }
    }

    /// Read the outcome record of a sub-task directory. Missing or
    /// corrupt records yield `None`: the sub-task is treated as never
    /// having reached a trustworthy state.
    pub fn read(sub_task_dir: &Path) -> Option<Outcome> {
        let path = sub_task_dir.join(OUTCOME_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return None,
            Err(error) => {
                warn!(path = ?path, error = ?error, "Failed to read outcome record");
                return None;
            }
        };

        match text.trim() {
            "PROCESSING" => Some(Outcome::Processing),
            "COMPLETE" => Some(Outcome::Complete),
            "FAILED" => Some(Outcome::Failed),
            other => {
                warn!(path = ?path, content = other, "Skipping corrupt outcome record");
                None
            }
        }
    }

    /// Record an outcome with a whole-file create plus rename, so a
    /// concurrent reader never observes a partial write.
    pub fn record(&self, sub_task_dir: &Path) -> io::Result<()> {
        let staging = sub_task_dir.join(format!(".{OUTCOME_FILE}.tmp"));
        fs::write(&staging, self.literal())?;
        fs::rename(&staging, sub_task_dir.join(OUTCOME_FILE))?;
        debug!(dir = ?sub_task_dir, outcome = self.literal(), "Recorded outcome");

        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// Aggregate of all outcome records under a working tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeCounts {
    pub complete: u32,
    pub failed: u32,
}

/// Sub-task directory for an index, grouped layouts included.
pub fn sub_task_dir(working_dir: &Path, index: u32, group_size: Option<u32>) -> PathBuf {
    match group_size {
        Some(size) if size > 0 => working_dir
            .join(format!("{GROUP_DIR_PREFIX}{}", index / size))
            .join(format!("{SUB_TASK_DIR_PREFIX}{index}")),
        _ => working_dir.join(format!("{SUB_TASK_DIR_PREFIX}{index}")),
    }
}

/// All sub-task directories below `working_dir`, sorted by index. Groups
/// are flattened; entries that do not follow the naming scheme are
/// ignored.
pub fn sub_task_dirs(working_dir: &Path) -> io::Result<Vec<(u32, PathBuf)>> {
    let mut found = Vec::new();
    collect_sub_task_dirs(working_dir, &mut found, true)?;
    found.sort_by_key(|(index, _)| *index);

    Ok(found)
}

fn collect_sub_task_dirs(
    dir: &Path,
    found: &mut Vec<(u32, PathBuf)>,
    descend_groups: bool,
) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }

        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };

        if let Some(index) = name.strip_prefix(SUB_TASK_DIR_PREFIX) {
            if let Ok(index) = index.parse::<u32>() {
                found.push((index, entry.path()));
            }
        } else if descend_groups && name.starts_with(GROUP_DIR_PREFIX) {
            collect_sub_task_dirs(&entry.path(), found, false)?;
        }
    }

    Ok(())
}

/// Group directories below `working_dir` with their member sub-task
/// directories. Empty when the layout is flat.
pub fn group_dirs(working_dir: &Path) -> io::Result<Vec<(PathBuf, Vec<(u32, PathBuf)>)>> {
    let mut groups = Vec::new();

    for entry in fs::read_dir(working_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(GROUP_DIR_PREFIX) {
            continue;
        }

        let mut members = Vec::new();
        collect_sub_task_dirs(&entry.path(), &mut members, false)?;
        members.sort_by_key(|(index, _)| *index);
        groups.push((entry.path(), members));
    }

    groups.sort();

    Ok(groups)
}

/// Re-derive the aggregate counters from the outcome records on disk.
/// Always counts from scratch; callers never cache across polls.
pub fn scan_counts(working_dir: &Path) -> io::Result<OutcomeCounts> {
    let mut counts = OutcomeCounts::default();

    for (_, dir) in sub_task_dirs(working_dir)? {
        match Outcome::read(&dir) {
            Some(Outcome::Complete) => counts.complete += 1,
            Some(Outcome::Failed) => counts.failed += 1,
            Some(Outcome::Processing) | None => {}
        }
    }

    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_absent_and_corrupt_records() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Outcome::read(dir.path()), None);

        fs::write(dir.path().join(OUTCOME_FILE), "DANCING").unwrap();
        assert_eq!(Outcome::read(dir.path()), None);
    }

    #[test]
    fn record_read_all_states() {
        let dir = tempfile::tempdir().unwrap();

        for outcome in [Outcome::Processing, Outcome::Complete, Outcome::Failed] {
            outcome.record(dir.path()).unwrap();
            assert_eq!(Outcome::read(dir.path()), Some(outcome));
        }
    }

    #[test]
    fn scan_counts_flat_layout() {
        let root = tempfile::tempdir().unwrap();
        for (index, outcome) in [
            Some(Outcome::Complete),
            Some(Outcome::Complete),
            Some(Outcome::Failed),
            Some(Outcome::Processing),
            None,
        ]
        .iter()
        .enumerate()
        {
            let dir = sub_task_dir(root.path(), index as u32, None);
            fs::create_dir_all(&dir).unwrap();
            if let Some(outcome) = outcome {
                outcome.record(&dir).unwrap();
            }
        }

        let counts = scan_counts(root.path()).unwrap();
        assert_eq!(
            counts,
            OutcomeCounts {
                complete: 2,
                failed: 1
            }
        );
    }

    #[test]
    fn scan_counts_grouped_layout() {
        let root = tempfile::tempdir().unwrap();
        for index in 0..4u32 {
            let dir = sub_task_dir(root.path(), index, Some(2));
            fs::create_dir_all(&dir).unwrap();
            Outcome::Complete.record(&dir).unwrap();
        }

        assert_eq!(sub_task_dirs(root.path()).unwrap().len(), 4);
        assert_eq!(group_dirs(root.path()).unwrap().len(), 2);
        assert_eq!(scan_counts(root.path()).unwrap().complete, 4);
    }
}
