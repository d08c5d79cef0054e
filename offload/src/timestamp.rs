use chrono::{DateTime, Duration, Utc};
use std::{fmt, fs, io, path::{Path, PathBuf}};
use tracing::{debug, warn};

/// Pipeline stages a wall-clock marker can be recorded for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Arrival,
    Queued,
    Start,
    Finish,
}

impl Stage {
    pub fn literal(&self) -> &'static str {
        match self {
            Self::Arrival => "arrival",
            Self::Queued => "queued",
            Self::Start => "start",
            Self::Finish => "finish",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.literal())
    }
}

/// Filename-encoded wall-clock marker: `<stage>.<epoch millis>`, one
/// current marker per stage in a working directory. Restamping a stage
/// replaces the previous marker.
pub struct TimestampFile;

impl TimestampFile {
    pub fn stamp(dir: &Path, stage: Stage) -> io::Result<PathBuf> {
        Self::stamp_at(dir, stage, Utc::now())
    }

    pub fn stamp_at(dir: &Path, stage: Stage, at: DateTime<Utc>) -> io::Result<PathBuf> {
        if let Some(stale) = Self::marker_path(dir, stage)? {
            fs::remove_file(&stale)?;
        }

        let path = dir.join(format!("{stage}.{}", at.timestamp_millis()));
        fs::write(&path, [])?;
        debug!(path = ?path, "Stamped stage marker");

        Ok(path)
    }

    pub fn read(dir: &Path, stage: Stage) -> io::Result<Option<DateTime<Utc>>> {
        let Some(path) = Self::marker_path(dir, stage)? else {
            return Ok(None);
        };
        // file name was produced by stamp_at, suffix is always present
        let millis = path
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| ext.parse::<i64>().ok());

        match millis.and_then(DateTime::from_timestamp_millis) {
            Some(at) => Ok(Some(at)),
            None => {
                warn!(path = ?path, "Skipping corrupt stage marker");
                Ok(None)
            }
        }
    }

    /// Wall-clock time between two recorded markers, if both exist.
    pub fn elapsed(dir: &Path, from: Stage, to: Stage) -> io::Result<Option<Duration>> {
        match (Self::read(dir, from)?, Self::read(dir, to)?) {
            (Some(from), Some(to)) => Ok(Some(to - from)),
            _ => Ok(None),
        }
    }

    fn marker_path(dir: &Path, stage: Stage) -> io::Result<Option<PathBuf>> {
        let prefix = format!("{stage}.");

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(name) = name.to_str() {
                if name.starts_with(&prefix) && entry.file_type()?.is_file() {
                    return Ok(Some(entry.path()));
                }
            }
        }

        Ok(None)
    }
}
