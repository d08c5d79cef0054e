use std::{
    path::{Path, PathBuf},
    process::Command,
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, warn};

/// Pause between transfer attempts; transient filesystem and network
/// hiccups on the remote side usually clear within seconds.
pub const TRANSFER_RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("failed to spawn remote command")]
    Spawn(#[from] std::io::Error),
    #[error("transfer of {path} failed after {attempts} attempts")]
    TransferExhausted { path: PathBuf, attempts: u32 },
    #[error("remote command exited with {status}: {stderr}")]
    CommandFailed { status: i32, stderr: String },
}

/// One remote endpoint: login identity plus the two directories this
/// module owns there. The state directory holds progress tokens, the
/// task directory holds transferred archives and working trees.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Endpoint {
    pub host: String,
    pub user: String,
    pub task_dir: PathBuf,
    pub state_dir: PathBuf,
}

/// Identity a poller is shared under: `(host, user, state_dir)`. Two
/// endpoints differing only in their task directory share one poller.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointKey {
    pub host: String,
    pub user: String,
    pub state_dir: PathBuf,
}

impl Endpoint {
    pub fn key(&self) -> EndpointKey {
        EndpointKey {
            host: self.host.clone(),
            user: self.user.clone(),
            state_dir: self.state_dir.clone(),
        }
    }

    fn login(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn remote_spec(&self, path: &Path) -> String {
        format!("{}:{}", self.login(), path.display())
    }
}

/// The already-authenticated secure-copy/remote-command channel to one
/// endpoint. Transfers retry a bounded number of times; commands run
/// exactly once and report their failure to the caller.
pub trait RemoteChannel: Send + Sync {
    fn endpoint(&self) -> &Endpoint;

    fn copy_to(&self, local: &Path, remote: &Path) -> Result<(), ChannelError>;

    fn copy_from(&self, remote: &Path, local: &Path) -> Result<(), ChannelError>;

    fn run(&self, command: &str) -> Result<String, ChannelError>;

    /// List the file names in the remote state directory, one listing
    /// per call. The poller builds its entire view from this.
    fn list_state_dir(&self) -> Result<Vec<String>, ChannelError> {
        let listing = self.run(&format!(
            "ls -1 {}",
            self.endpoint().state_dir.display()
        ))?;

        Ok(listing.lines().map(str::to_string).collect())
    }
}

/// Channel backed by the `scp`/`ssh` binaries of the restricted login.
#[derive(Debug, Clone)]
pub struct SecureChannel {
    endpoint: Endpoint,
    transfer_retries: u32,
    retry_delay: Duration,
}

impl SecureChannel {
    pub fn new(endpoint: Endpoint, transfer_retries: u32) -> Self {
        Self {
            endpoint,
            transfer_retries: transfer_retries.max(1),
            retry_delay: TRANSFER_RETRY_DELAY,
        }
    }

    #[cfg(test)]
    fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    fn scp(&self, source: &str, target: &str, reported: &Path) -> Result<(), ChannelError> {
        for attempt in 1..=self.transfer_retries {
            let output = Command::new("scp")
                .arg("-rqB")
                .arg(source)
                .arg(target)
                .output()?;

            if output.status.success() {
                debug!(source = source, target = target, attempt = attempt, "Transfer done");
                return Ok(());
            }

            warn!(
                source = source,
                target = target,
                attempt = attempt,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "Transfer attempt failed"
            );

            if attempt < self.transfer_retries {
                thread::sleep(self.retry_delay);
            }
        }

        Err(ChannelError::TransferExhausted {
            path: reported.to_path_buf(),
            attempts: self.transfer_retries,
        })
    }
}

impl RemoteChannel for SecureChannel {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn copy_to(&self, local: &Path, remote: &Path) -> Result<(), ChannelError> {
        self.scp(
            &local.display().to_string(),
            &self.endpoint.remote_spec(remote),
            local,
        )
    }

    fn copy_from(&self, remote: &Path, local: &Path) -> Result<(), ChannelError> {
        self.scp(
            &self.endpoint.remote_spec(remote),
            &local.display().to_string(),
            remote,
        )
    }

    fn run(&self, command: &str) -> Result<String, ChannelError> {
        debug!(host = %self.endpoint.host, command = command, "Running remote command");
        let output = Command::new("ssh")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(self.endpoint.login())
            .arg(command)
            .output()?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(ChannelError::CommandFailed {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }
}
