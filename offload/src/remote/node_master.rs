use super::{server::DistributionClient, RemoteError};
use crate::{
    manifest::{clean_with_manifest, Manifest},
    outcome::{self, Outcome},
};
use parking_lot::Mutex;
use rayon::ThreadPoolBuilder;
use std::{
    collections::BTreeMap,
    fs::File,
    io,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    time::Duration,
};
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// Per-node worker role: pulls sub-task coordinates from the task
/// master's distribution server with exactly `cores_per_node` workers.
#[derive(Debug, Clone)]
pub struct NodeMasterOpts {
    pub cores_per_node: u32,
    pub node: String,
    /// `host:port` of the distribution server on the job's head node.
    pub head_node: String,
    pub exe_name: String,
    pub working_dir: PathBuf,
    pub timeout_secs: u64,
    pub dist_dir: PathBuf,
    pub memdrone_enabled: bool,
}

/// Resident memory monitor child; unconditionally terminated when the
/// node master shuts down, error paths included.
struct MemdroneGuard(Child);

impl Drop for MemdroneGuard {
    fn drop(&mut self) {
        match self.0.kill() {
            Ok(()) => {
                let _ = self.0.wait();
                debug!("Terminated memdrone");
            }
            Err(error) => warn!(error = ?error, "Failed to terminate memdrone"),
        }
    }
}

pub fn run(opts: &NodeMasterOpts) -> Result<(), RemoteError> {
    info!(
        node = %opts.node,
        cores = opts.cores_per_node,
        head = %opts.head_node,
        "Node master starting"
    );

    let _memdrone = if opts.memdrone_enabled {
        match spawn_memdrone(opts) {
            Ok(child) => Some(MemdroneGuard(child)),
            Err(error) => {
                warn!(error = ?error, "Failed to start memdrone, continuing without");
                None
            }
        }
    } else {
        None
    };

    let dirs: BTreeMap<u32, PathBuf> = outcome::sub_task_dirs(&opts.working_dir)?
        .into_iter()
        .collect();

    let pool = ThreadPoolBuilder::new()
        .num_threads(opts.cores_per_node as usize)
        .build()?;
    let worker_errors: Mutex<Vec<io::Error>> = Mutex::new(Vec::new());

    pool.scope(|scope| {
        for _ in 0..opts.cores_per_node {
            scope.spawn(|_| {
                if let Err(error) = worker_loop(opts, &dirs) {
                    worker_errors.lock().push(error);
                }
            });
        }
    });

    let mut errors = worker_errors.into_inner();
    match errors.pop() {
        Some(error) => Err(RemoteError::Io(error)),
        None => {
            info!(node = %opts.node, "Node master done");
            Ok(())
        }
    }
}

fn spawn_memdrone(opts: &NodeMasterOpts) -> io::Result<Child> {
    Command::new(opts.dist_dir.join("memdrone"))
        .arg(&opts.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
}

/// One worker: request a coordinate, handle it, report it back, repeat
/// until the distribution server runs dry.
fn worker_loop(opts: &NodeMasterOpts, dirs: &BTreeMap<u32, PathBuf>) -> io::Result<()> {
    let mut client = DistributionClient::connect(opts.head_node.as_str())?;

    while let Some(index) = client.next()? {
        match dirs.get(&index) {
            Some(dir) => execute_sub_task(opts, index, dir),
            None => warn!(index = index, "No working directory for coordinate"),
        }

        // reported regardless of success; failure lives in the outcome record
        client.done(index)?;
    }

    Ok(())
}

/// Handle one sub-task: skip finished work, revert interrupted or
/// failed work to its captured state, then run the algorithm under the
/// per-task timeout. The outcome record is written by the executed
/// process, never by the master.
pub(crate) fn execute_sub_task(opts: &NodeMasterOpts, index: u32, dir: &Path) {
    match Outcome::read(dir) {
        Some(Outcome::Complete) => {
            debug!(index = index, "Sub-task already complete, skipping");
            return;
        }
        Some(Outcome::Failed) | Some(Outcome::Processing) => {
            // a lingering PROCESSING record means an interrupted run
            if let Err(error) = clean_with_manifest(dir) {
                warn!(index = index, error = ?error, "Failed to clean sub-task before retry");
                return;
            }
        }
        None => {}
    }

    if let Err(error) = Manifest::create(dir) {
        warn!(index = index, error = ?error, "Failed to capture sub-task manifest");
    }

    let exe = opts.dist_dir.join(&opts.exe_name);
    let timeout = Duration::from_secs(opts.timeout_secs);
    debug!(index = index, exe = ?exe, "Executing sub-task");

    let spawned = stdio_files(dir).and_then(|(stdout, stderr)| {
        Command::new(&exe)
            .arg(dir)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
    });

    match spawned {
        Ok(mut child) => match child.wait_timeout(timeout) {
            Ok(Some(status)) => {
                debug!(index = index, status = ?status, "Sub-task process exited");
            }
            Ok(None) => {
                warn!(index = index, timeout = opts.timeout_secs, "Sub-task timed out, killing");
                if let Err(error) = child.kill() {
                    warn!(index = index, error = ?error, "Failed to kill timed-out sub-task");
                }
                let _ = child.wait();
            }
            Err(error) => {
                warn!(index = index, error = ?error, "Failed to wait for sub-task process");
            }
        },
        Err(error) => {
            warn!(index = index, exe = ?exe, error = ?error, "Failed to spawn sub-task process");
        }
    }
}

fn stdio_files(dir: &Path) -> io::Result<(Stdio, Stdio)> {
    let stdout = File::create(dir.join("stdout.log"))?;
    let stderr = File::create(dir.join("stderr.log"))?;

    Ok((stdout.into(), stderr.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::MANIFEST_FILE;
    use std::{fs, os::unix::fs::PermissionsExt};

    /// Algorithm stand-in: drops a marker file and records COMPLETE,
    /// like a real executable would.
    fn install_fake_exe(dist_dir: &Path, name: &str) {
        let script = format!(
            "#!/bin/sh\ntouch \"$1/ran\"\nprintf COMPLETE > \"$1/.outcome.tmp\"\nmv \"$1/.outcome.tmp\" \"$1/{}\"\n",
            crate::outcome::OUTCOME_FILE
        );
        let path = dist_dir.join(name);
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn opts(working_dir: &Path, dist_dir: &Path) -> NodeMasterOpts {
        NodeMasterOpts {
            cores_per_node: 2,
            node: "n1".to_string(),
            head_node: "127.0.0.1:1".to_string(),
            exe_name: "algo".to_string(),
            working_dir: working_dir.to_path_buf(),
            timeout_secs: 10,
            dist_dir: dist_dir.to_path_buf(),
            memdrone_enabled: false,
        }
    }

    #[test]
    fn complete_sub_task_is_skipped() {
        let work = tempfile::tempdir().unwrap();
        let dist = tempfile::tempdir().unwrap();
        install_fake_exe(dist.path(), "algo");

        let dir = work.path().join("st-0");
        fs::create_dir_all(&dir).unwrap();
        Outcome::Complete.record(&dir).unwrap();

        execute_sub_task(&opts(work.path(), dist.path()), 0, &dir);
        assert!(!dir.join("ran").exists());
    }

    #[test]
    fn interrupted_sub_task_is_cleaned_and_rerun() {
        let work = tempfile::tempdir().unwrap();
        let dist = tempfile::tempdir().unwrap();
        install_fake_exe(dist.path(), "algo");

        let dir = work.path().join("st-0");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("input.bin"), b"in").unwrap();
        Manifest::create(&dir).unwrap();

        // partial output and a PROCESSING record from an interrupted run
        fs::write(dir.join("partial.out"), b"junk").unwrap();
        Outcome::Processing.record(&dir).unwrap();

        execute_sub_task(&opts(work.path(), dist.path()), 0, &dir);

        assert!(!dir.join("partial.out").exists());
        assert!(dir.join("input.bin").exists());
        assert!(dir.join("ran").exists());
        assert_eq!(Outcome::read(&dir), Some(Outcome::Complete));
    }

    #[test]
    fn fresh_sub_task_captures_manifest_and_runs() {
        let work = tempfile::tempdir().unwrap();
        let dist = tempfile::tempdir().unwrap();
        install_fake_exe(dist.path(), "algo");

        let dir = work.path().join("st-3");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("input.bin"), b"in").unwrap();

        execute_sub_task(&opts(work.path(), dist.path()), 3, &dir);

        assert!(dir.join(MANIFEST_FILE).exists());
        assert!(dir.join("ran").exists());
        assert_eq!(Outcome::read(&dir), Some(Outcome::Complete));
    }

    #[test]
    fn timed_out_sub_task_is_killed() {
        let work = tempfile::tempdir().unwrap();
        let dist = tempfile::tempdir().unwrap();
        let script = "#!/bin/sh\nsleep 30\n";
        let path = dist.path().join("algo");
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

        let dir = work.path().join("st-0");
        fs::create_dir_all(&dir).unwrap();

        let mut options = opts(work.path(), dist.path());
        options.timeout_secs = 1;
        execute_sub_task(&options, 0, &dir);

        // no outcome record: the shortfall is charged at finalize time
        assert_eq!(Outcome::read(&dir), None);
    }
}
