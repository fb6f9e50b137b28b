//! Exclusive working directory for one run.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use log::{debug, warn};

use crate::error::{BuildError, BuildResult};

pub const LOCK_FILE: &str = ".imgforge.lock";

/// Advisory lock on a workspace directory.
///
/// The lock file holds the owner's pid while a run is live and is emptied on
/// release, so a non-empty file found at acquisition time means the previous
/// owner died without tearing down. The kernel drops the advisory lock itself
/// when the process exits, so such a workspace can be claimed again.
#[derive(Debug)]
pub struct WorkspaceLock {
    file: File,
    path: PathBuf,
}

impl WorkspaceLock {
    pub fn acquire(dir: &Path) -> BuildResult<Self> {
        let path = dir.join(LOCK_FILE);
        // Never unlink an existing lock file here: a second process could then
        // lock a fresh inode at the same path while the first still holds the
        // old one.
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| BuildError::io(format!("failed to open {}", path.display()), e))?;

        if let Err(e) = file.try_lock_exclusive() {
            return Err(lock_error(dir, &path, e));
        }

        let mut previous = String::new();
        let _ = file.read_to_string(&mut previous);
        let previous = previous.trim();
        if !previous.is_empty() {
            warn!(
                "workspace {} was abandoned by process {previous}, reclaiming it",
                dir.display()
            );
        }

        file.set_len(0)
            .and_then(|_| file.seek(SeekFrom::Start(0)))
            .and_then(|_| writeln!(file, "{}", std::process::id()))
            .and_then(|_| file.sync_all())
            .map_err(|e| BuildError::io(format!("failed to write {}", path.display()), e))?;
        debug!("locked workspace {}", dir.display());

        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mark the workspace clean and drop the lock.
    pub fn release(self) -> std::io::Result<()> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        FileExt::unlock(&self.file)
    }
}

/// Only contention means busy; a filesystem without lock support is an I/O
/// failure.
fn lock_error(dir: &Path, path: &Path, e: std::io::Error) -> BuildError {
    if e.kind() == std::io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
    {
        BuildError::WorkspaceBusy(dir.to_path_buf())
    } else {
        BuildError::io(format!("failed to lock {}", path.display()), e)
    }
}

/// Working directory of a run. Temporary workspaces are created when the
/// caller does not name one and are removed after a successful build.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    temporary: bool,
}

impl Workspace {
    pub fn prepare(workdir: Option<&Path>) -> BuildResult<Self> {
        match workdir {
            Some(dir) => {
                fs::create_dir_all(dir).map_err(|e| {
                    BuildError::io(format!("failed to create workspace {}", dir.display()), e)
                })?;
                Ok(Self {
                    root: dir.to_path_buf(),
                    temporary: false,
                })
            }
            None => {
                let dir = tempfile::Builder::new()
                    .prefix("imgforge-")
                    .tempdir()
                    .map_err(|e| BuildError::io("failed to create temporary workspace", e))?;
                Ok(Self {
                    root: dir.keep(),
                    temporary: true,
                })
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    pub fn join(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.root.join(rel)
    }

    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }

    /// Remove `path` if it lives inside the workspace.
    pub fn remove_path(&self, path: &Path) -> BuildResult<()> {
        if !self.contains(path) || path == self.root {
            return Ok(());
        }
        let result = if path.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        match result {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(BuildError::Cleanup {
                path: path.to_path_buf(),
                source: e,
            }),
            _ => Ok(()),
        }
    }

    pub fn remove_all(&self) -> BuildResult<()> {
        fs::remove_dir_all(&self.root).map_err(|e| BuildError::Cleanup {
            path: self.root.clone(),
            source: e,
        })
    }
}
