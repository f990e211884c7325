//! Global advisory lock per physical device.
//!
//! Taken when the first endpoint of a device connects and released when the
//! last one disconnects. Two layers:
//!
//! - an in-process set of held identities, so two endpoints or drivers in the
//!   same process cannot both open the hardware;
//! - on unix, a non-blocking `flock` on `<dir>/astro_daq_<identity>.lock`,
//!   so a second driver process fails fast instead of fighting over the port.

use crate::error::{AppResult, AstroError};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

#[cfg(unix)]
use nix::fcntl::{Flock, FlockArg};

static HELD: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();

fn held() -> &'static Mutex<HashSet<PathBuf>> {
    HELD.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Lock file name for a device identity.
pub fn lock_file_name(identity: &str) -> String {
    let sanitized: String = identity
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("astro_daq_{sanitized}.lock")
}

/// Held advisory lock. Released on drop.
#[derive(Debug)]
pub struct GlobalLockGuard {
    identity: String,
    path: PathBuf,
    #[cfg(unix)]
    _file: Flock<File>,
    #[cfg(not(unix))]
    _file: File,
}

impl GlobalLockGuard {
    /// Lock `identity` using the system temp directory.
    pub fn acquire(identity: &str) -> AppResult<Self> {
        Self::acquire_in(&std::env::temp_dir(), identity)
    }

    /// Lock `identity` with the lock file placed in `dir`.
    pub fn acquire_in(dir: &Path, identity: &str) -> AppResult<Self> {
        let path = dir.join(lock_file_name(identity));

        if !held().lock().insert(path.clone()) {
            return Err(AstroError::LockHeld(identity.to_string()));
        }

        match open_and_lock(&path, identity) {
            Ok(file) => {
                tracing::debug!(identity, path = %path.display(), "global lock acquired");
                Ok(Self {
                    identity: identity.to_string(),
                    path,
                    _file: file,
                })
            }
            Err(e) => {
                held().lock().remove(&path);
                Err(e)
            }
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for GlobalLockGuard {
    fn drop(&mut self) {
        held().lock().remove(&self.path);
        tracing::debug!(identity = %self.identity, "global lock released");
    }
}

#[cfg(unix)]
fn open_and_lock(path: &Path, identity: &str) -> AppResult<Flock<File>> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;
    Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
        if errno == nix::errno::Errno::EWOULDBLOCK {
            AstroError::LockHeld(identity.to_string())
        } else {
            AstroError::Io(std::io::Error::from(errno))
        }
    })
}

#[cfg(not(unix))]
fn open_and_lock(path: &Path, _identity: &str) -> AppResult<File> {
    Ok(OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?)
}
