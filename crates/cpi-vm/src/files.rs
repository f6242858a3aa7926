//! Single-file transfer into and out of a running VM
//!
//! The engine copies tar archives, so every transfer wraps or unwraps exactly
//! one archive entry.

use cpi_spec::VmId;
use std::future::Future;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::Engine;
use crate::error::{CpiError, Result};

/// Upper bound on one download, upload or in-VM command
pub const FILE_TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay between exec completion checks
pub const EXEC_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Mode given to uploaded files
const UPLOADED_FILE_MODE: u32 = 0o640;

/// File transfer bound to one VM
#[derive(Clone)]
pub struct FileService {
    engine: Arc<dyn Engine>,
    vm: VmId,
    timeout: Duration,
}

impl std::fmt::Debug for FileService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileService")
            .field("vm", &self.vm)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Split a container path into its directory and file name.
fn split_path(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some(("", name)) => ("/", name),
        Some((dir, name)) => (dir, name),
        None => (".", path),
    }
}

fn archive_single_file(name: &str, contents: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(UPLOADED_FILE_MODE);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, name, contents)?;
    builder.into_inner()
}

fn read_first_entry(archive: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut archive = tar::Archive::new(archive);
    let mut entry = archive.entries()?.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "archive has no entries")
    })??;
    let mut contents = Vec::new();
    entry.read_to_end(&mut contents)?;
    Ok(contents)
}

impl FileService {
    pub fn new(engine: Arc<dyn Engine>, vm: VmId) -> Self {
        Self {
            engine,
            vm,
            timeout: FILE_TRANSFER_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn vm(&self) -> &VmId {
        &self.vm
    }

    async fn bounded<T>(&self, path: &str, work: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| CpiError::FileTransfer {
                path: path.to_string(),
                reason: format!("timed out after {:?}", self.timeout),
            })?
    }

    /// Read the file at `path` inside the VM.
    ///
    /// A missing file is reported as [`CpiError::FileNotFound`].
    pub async fn download(&self, path: &str) -> Result<Vec<u8>> {
        tracing::debug!(vm = %self.vm, path, "downloading file");

        self.bounded(path, async {
            let archive = self
                .engine
                .copy_from_container(self.vm.as_str(), path)
                .await
                .map_err(|e| {
                    if e.is_not_found() {
                        CpiError::FileNotFound(path.to_string())
                    } else {
                        CpiError::FileTransfer {
                            path: path.to_string(),
                            reason: e.to_string(),
                        }
                    }
                })?;

            read_first_entry(&archive).map_err(|e| CpiError::FileTransfer {
                path: path.to_string(),
                reason: format!("reading archive header: {e}"),
            })
        })
        .await
    }

    /// Write `contents` to `path` inside the VM, creating the parent
    /// directory first.
    pub async fn upload(&self, path: &str, contents: &[u8]) -> Result<()> {
        let (dir, name) = split_path(path);
        tracing::debug!(vm = %self.vm, path, bytes = contents.len(), "uploading file");

        let archive = archive_single_file(name, contents).map_err(|e| CpiError::FileTransfer {
            path: path.to_string(),
            reason: format!("building archive: {e}"),
        })?;

        self.bounded(path, async {
            self.run_to_completion(&["mkdir", "-p", dir]).await?;
            self.engine
                .copy_to_container(self.vm.as_str(), dir, archive)
                .await
                .map_err(|e| CpiError::FileTransfer {
                    path: path.to_string(),
                    reason: e.to_string(),
                })
        })
        .await
    }

    /// Run a command inside the VM and wait for it to exit successfully.
    pub async fn exec(&self, cmd: &[&str]) -> Result<()> {
        let command = cmd.join(" ");
        tokio::time::timeout(self.timeout, self.run_to_completion(cmd))
            .await
            .map_err(|_| CpiError::Exec {
                command,
                reason: format!("timed out after {:?}", self.timeout),
            })?
    }

    async fn run_to_completion(&self, cmd: &[&str]) -> Result<()> {
        let command = cmd.join(" ");
        let failed = |reason: String| CpiError::Exec {
            command: command.clone(),
            reason,
        };

        let exec_id = self
            .engine
            .create_exec(
                self.vm.as_str(),
                cmd.iter().map(|arg| arg.to_string()).collect(),
            )
            .await
            .map_err(|e| failed(format!("creating exec: {e}")))?;

        self.engine
            .start_exec(&exec_id)
            .await
            .map_err(|e| failed(format!("starting exec: {e}")))?;

        loop {
            let state = self
                .engine
                .inspect_exec(&exec_id)
                .await
                .map_err(|e| failed(format!("inspecting exec: {e}")))?;

            if state.running {
                tokio::time::sleep(EXEC_POLL_INTERVAL).await;
                continue;
            }

            return match state.exit_code {
                Some(0) | None => Ok(()),
                Some(code) => Err(failed(format!("exit status {code}"))),
            };
        }
    }
}
