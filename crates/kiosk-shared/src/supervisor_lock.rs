//! Supervisor lock
//!
//! A single advisory `flock` on a lock file that is never deleted. The kernel
//! arbitrates ownership, so a crashed holder's lock disappears with its
//! process and two cycles can never both own it. The file body records who
//! holds it and since when; that identity is metadata only and an empty or
//! leftover body never blocks anyone.
//!
//! Acquisition never waits: a cycle that finds the lock held gets
//! `KioskError::LockHeld` and exits. A holder in another process that has
//! sat on the lock past the staleness ceiling is killed so the next cycle
//! can proceed.

use crate::error::{KioskError, Result};
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Identity written into the lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    /// Which cycle holds it ("probe", "sweep", "operator-trigger", ...)
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockHolder {
    fn current(holder: &str) -> Self {
        Self {
            pid: std::process::id(),
            holder: holder.to_string(),
            acquired_at: Utc::now(),
        }
    }

    pub fn is_alive(&self) -> bool {
        is_pid_alive(self.pid)
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.acquired_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, ceiling: Duration) -> bool {
        self.age(now) > ceiling
    }
}

fn is_pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        // EPERM: exists but owned by someone else
        Err(_) => true,
    }
}

/// The lock, keyed by a well-known path
#[derive(Debug, Clone)]
pub struct SupervisorLock {
    path: PathBuf,
    stale_after: Duration,
}

impl SupervisorLock {
    pub fn new(path: impl AsRef<Path>, stale_after: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            stale_after,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to take the lock without blocking.
    ///
    /// Returns `LockHeld` on contention. Any other error means the lock file
    /// could not be opened or locked at all.
    pub fn try_acquire(&self, holder: &str) -> Result<LockGuard> {
        let file = self.open()?;
        let mut file = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => locked,
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => return Err(self.contended()),
            Err((_, errno)) => return Err(std::io::Error::from(errno).into()),
        };

        let identity = LockHolder::current(holder);
        // The flock is the lock; a failed identity write only loses metadata.
        if let Err(e) = write_identity(&mut file, &identity) {
            warn!("Supervisor lock held without identity: {}", e);
            if let Err(e) = file.set_len(0) {
                warn!("Failed to clear partial lock identity: {}", e);
            }
        }
        debug!(pid = identity.pid, holder, "Supervisor lock acquired");
        Ok(LockGuard { file, identity })
    }

    /// Open or create the lock file. Falls back to read-only on a read-only
    /// filesystem; `flock` works on either.
    fn open(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                debug!("Cannot create lock directory {}: {}", parent.display(), e);
            }
        }
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
        {
            Ok(file) => Ok(file),
            Err(write_err) => File::open(&self.path).map_err(|_| write_err.into()),
        }
    }

    /// Build the contention error, evicting a holder that has outlived the
    /// staleness ceiling.
    fn contended(&self) -> KioskError {
        let existing = match self.read_identity() {
            Ok(Some(existing)) => existing,
            // Holder is between lock and identity write, or the write failed.
            _ => {
                return KioskError::LockHeld {
                    pid: 0,
                    holder: "unknown".to_string(),
                    acquired_at: "unknown".to_string(),
                }
            }
        };

        if existing.is_stale(Utc::now(), self.stale_after) {
            self.evict(&existing);
        }
        held(&existing)
    }

    /// SIGKILL a holder stuck past the ceiling. The kernel drops its flock
    /// when it exits. A holder inside this process cannot be evicted.
    fn evict(&self, existing: &LockHolder) {
        let age_secs = existing.age(Utc::now()).as_secs();
        if existing.pid == std::process::id() {
            warn!(
                holder = %existing.holder,
                age_secs,
                "Supervisor lock held past staleness ceiling by this process"
            );
            return;
        }
        let Ok(raw) = i32::try_from(existing.pid) else {
            return;
        };
        warn!(
            pid = existing.pid,
            holder = %existing.holder,
            age_secs,
            "Killing supervisor lock holder (exceeded staleness ceiling)"
        );
        match kill(Pid::from_raw(raw), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(pid = existing.pid, "Failed to kill stale lock holder: {}", e),
        }
    }

    fn read_identity(&self) -> Result<Option<LockHolder>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if contents.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Read the current holder without acquiring. Identity left behind by a
    /// holder that died without releasing is ignored.
    pub fn current_holder(&self) -> Result<Option<LockHolder>> {
        Ok(self.read_identity()?.filter(LockHolder::is_alive))
    }
}

fn write_identity(file: &mut File, identity: &LockHolder) -> Result<()> {
    let json = serde_json::to_string(identity)?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(json.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn held(existing: &LockHolder) -> KioskError {
    KioskError::LockHeld {
        pid: existing.pid,
        holder: existing.holder.clone(),
        acquired_at: existing.acquired_at.to_rfc3339(),
    }
}

/// Held lock; released on drop
pub struct LockGuard {
    file: Flock<File>,
    identity: LockHolder,
}

impl LockGuard {
    pub fn holder(&self) -> &LockHolder {
        &self.identity
    }

    /// Identity as currently recorded on disk
    pub fn recorded(&mut self) -> Option<LockHolder> {
        let mut contents = String::new();
        self.file.seek(SeekFrom::Start(0)).ok()?;
        self.file.read_to_string(&mut contents).ok()?;
        serde_json::from_str(&contents).ok()
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Clear the identity while still holding the flock; the flock itself
        // is released when the descriptor closes.
        if let Err(e) = self.file.set_len(0) {
            warn!("Failed to clear supervisor lock identity: {}", e);
        }
        debug!(holder = %self.identity.holder, "Supervisor lock released");
    }
}
