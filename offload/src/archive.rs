use std::{
    io,
    path::Path,
    process::{Command, Stdio},
};
use tracing::debug;

/// Pack the *contents* of `dir` into a gzipped tarball. The directory
/// name itself is not part of the archive, so the unpack side is free
/// to choose its own root.
pub fn pack(dir: &Path, archive: &Path, dereference_symlinks: bool) -> io::Result<()> {
    let mut command = Command::new("tar");
    if dereference_symlinks {
        command.arg("-h");
    }
    command
        .arg("-czf")
        .arg(archive)
        .arg("-C")
        .arg(dir)
        .arg(".");

    run_tar(command)?;
    debug!(dir = ?dir, archive = ?archive, "Packed archive");

    Ok(())
}

/// Unpack a tarball produced by [`pack`] into `dir`, creating it first.
pub fn unpack(archive: &Path, dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;

    let mut command = Command::new("tar");
    command.arg("-xzf").arg(archive).arg("-C").arg(dir);

    run_tar(command)?;
    debug!(archive = ?archive, dir = ?dir, "Unpacked archive");

    Ok(())
}

fn run_tar(mut command: Command) -> io::Result<()> {
    let output = command.stdin(Stdio::null()).output()?;

    if output.status.success() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::Other,
            format!(
                "tar exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn pack_unpack_preserves_tree() {
        let source = tempfile::tempdir().unwrap();
        fs::create_dir_all(source.path().join("st-0")).unwrap();
        fs::write(source.path().join("st-0/input.bin"), b"data").unwrap();
        fs::write(source.path().join("top.txt"), b"top").unwrap();

        let scratch = tempfile::tempdir().unwrap();
        let archive = scratch.path().join("task.tar.gz");
        pack(source.path(), &archive, false).unwrap();

        let target = scratch.path().join("restored");
        unpack(&archive, &target).unwrap();

        assert_eq!(fs::read(target.join("st-0/input.bin")).unwrap(), b"data");
        assert_eq!(fs::read(target.join("top.txt")).unwrap(), b"top");
    }

    #[test]
    fn unpack_missing_archive_fails() {
        let scratch = tempfile::tempdir().unwrap();
        assert!(unpack(&scratch.path().join("absent.tar.gz"), &scratch.path().join("out")).is_err());
    }
}
