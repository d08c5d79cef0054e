use ignore::WalkBuilder;
use itertools::Itertools;
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, warn};

/// Fixed name of the snapshot inside the captured directory.
pub const MANIFEST_FILE: &str = ".manifest";

// version-control metadata is never part of a working tree snapshot
const VCS_DIRS: [&str; 3] = [".git", ".svn", ".hg"];

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("manifest walk failed")]
    Walk(#[from] ignore::Error),
    #[error("manifest file operation failed")]
    Io(#[from] std::io::Error),
    #[error("manifest contains a non-relative entry: {0}")]
    NonRelativeEntry(String),
}

/// Snapshot of a directory's file list, captured before a sub-task (or
/// group) first runs. Used only to delete files created afterwards when
/// the run has to be retried.
#[derive(Debug, Clone)]
pub struct Manifest {
    root: PathBuf,
    entries: BTreeSet<PathBuf>,
}

impl Manifest {
    /// Walk `root` and persist the relative file list to
    /// [`MANIFEST_FILE`]. An existing manifest is left untouched: the
    /// first capture describes the pre-run state and must survive
    /// retries.
    pub fn create(root: &Path) -> Result<Self, ManifestError> {
        if root.join(MANIFEST_FILE).is_file() {
            return Self::load(root);
        }

        let entries: BTreeSet<PathBuf> = walk_files(root)?
            .into_iter()
            .filter(|path| path != Path::new(MANIFEST_FILE))
            .collect();

        let rendered = entries
            .iter()
            .map(|path| path.to_string_lossy())
            .join("\n");
        fs::write(root.join(MANIFEST_FILE), rendered)?;
        debug!(root = ?root, files = entries.len(), "Captured manifest");

        Ok(Self {
            root: root.to_path_buf(),
            entries,
        })
    }

    pub fn exists(root: &Path) -> bool {
        root.join(MANIFEST_FILE).is_file()
    }

    pub fn load(root: &Path) -> Result<Self, ManifestError> {
        let text = fs::read_to_string(root.join(MANIFEST_FILE))?;
        let mut entries = BTreeSet::new();

        for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let path = PathBuf::from(line);
            if path.is_absolute() {
                return Err(ManifestError::NonRelativeEntry(line.to_string()));
            }
            entries.insert(path);
        }

        Ok(Self {
            root: root.to_path_buf(),
            entries,
        })
    }

    /// Delete every file under the root that is neither the manifest
    /// itself nor listed in it, reverting the directory to its captured
    /// state. Idempotent.
    pub fn delete_non_manifest_files(&self) -> Result<(), ManifestError> {
        for path in walk_files(&self.root)? {
            if path == Path::new(MANIFEST_FILE) || self.entries.contains(&path) {
                continue;
            }

            let absolute = self.root.join(&path);
            match fs::remove_file(&absolute) {
                Ok(()) => debug!(path = ?absolute, "Deleted non-manifest file"),
                Err(error) => {
                    warn!(path = ?absolute, error = ?error, "Failed to delete non-manifest file")
                }
            }
        }

        Ok(())
    }

    pub fn entries(&self) -> &BTreeSet<PathBuf> {
        &self.entries
    }
}

/// Revert `root` to its manifest if one was captured. Without a manifest
/// the prior state is unknown and the directory is left untouched.
pub fn clean_with_manifest(root: &Path) -> Result<bool, ManifestError> {
    if !Manifest::exists(root) {
        warn!(root = ?root, "No manifest captured, leaving directory untouched");
        return Ok(false);
    }

    Manifest::load(root)?.delete_non_manifest_files()?;

    Ok(true)
}

fn walk_files(root: &Path) -> Result<Vec<PathBuf>, ManifestError> {
    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .hidden(false)
        .filter_entry(|entry| {
            !entry
                .file_name()
                .to_str()
                .map(|name| VCS_DIRS.contains(&name))
                .unwrap_or(false)
        })
        .build();

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry?;
        if entry.file_type().map(|kind| kind.is_file()).unwrap_or(false) {
            // walk roots are always prefixes of their entries
            let relative = entry
                .path()
                .strip_prefix(root)
                .expect("walker returned a path outside its root");
            files.push(relative.to_path_buf());
        }
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn file_set(root: &Path) -> BTreeSet<PathBuf> {
        walk_files(root).unwrap().into_iter().collect()
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn cleanup_deletes_only_later_files() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("input.bin"));
        touch(&dir.path().join("nested/params.txt"));

        Manifest::create(dir.path()).unwrap();

        touch(&dir.path().join("output.bin"));
        touch(&dir.path().join("nested/scratch.tmp"));

        clean_with_manifest(dir.path()).unwrap();

        let expected: BTreeSet<PathBuf> = [
            PathBuf::from(MANIFEST_FILE),
            PathBuf::from("input.bin"),
            PathBuf::from("nested/params.txt"),
        ]
        .into_iter()
        .collect();
        assert_eq!(file_set(dir.path()), expected);
    }

    #[test]
    fn cleanup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("input.bin"));
        Manifest::create(dir.path()).unwrap();
        touch(&dir.path().join("output.bin"));

        clean_with_manifest(dir.path()).unwrap();
        let after_first = file_set(dir.path());
        clean_with_manifest(dir.path()).unwrap();

        assert_eq!(file_set(dir.path()), after_first);
    }

    #[test]
    fn missing_manifest_leaves_directory_untouched() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("precious.bin"));

        assert!(!clean_with_manifest(dir.path()).unwrap());
        assert!(dir.path().join("precious.bin").exists());
    }

    #[test]
    fn create_does_not_recapture() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("input.bin"));
        Manifest::create(dir.path()).unwrap();

        touch(&dir.path().join("output.bin"));
        // second create must keep the original snapshot
        let manifest = Manifest::create(dir.path()).unwrap();
        assert!(!manifest.entries().contains(Path::new("output.bin")));
    }

    #[test]
    fn vcs_metadata_is_excluded() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("input.bin"));
        touch(&dir.path().join(".git/HEAD"));

        let manifest = Manifest::create(dir.path()).unwrap();
        assert!(!manifest
            .entries()
            .iter()
            .any(|path| path.starts_with(".git")));
    }
}
