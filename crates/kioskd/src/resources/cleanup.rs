//! Filesystem reclamation used by disk sweeps and the cache-clear action

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Suffixes of rotated or compressed log files
const ROTATED_SUFFIXES: &[&str] = &["gz", "xz", "zst", "bz2", "old"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub files: usize,
    pub bytes: u64,
}

impl CleanupStats {
    fn add(&mut self, bytes: u64) {
        self.files += 1;
        self.bytes += bytes;
    }

    pub fn merge(&mut self, other: CleanupStats) {
        self.files += other.files;
        self.bytes += other.bytes;
    }
}

/// Remove everything inside `dir`, keeping the directory. A missing
/// directory counts as already clean.
pub fn clear_dir_contents(dir: &Path) -> io::Result<CleanupStats> {
    let mut stats = CleanupStats::default();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(stats),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            let size = tree_size(&path);
            fs::remove_dir_all(&path)?;
            stats.add(size);
        } else {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            fs::remove_file(&path)?;
            stats.add(size);
        }
    }
    debug!("Cleared {} ({} bytes)", dir.display(), stats.bytes);
    Ok(stats)
}

/// Delete regular files under `dir` not modified within `max_age`
pub fn remove_stale_files(dir: &Path, max_age: Duration) -> CleanupStats {
    let mut stats = CleanupStats::default();
    let now = SystemTime::now();
    for entry in WalkDir::new(dir).min_depth(1).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if !is_older_than(&meta, now, max_age) {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => stats.add(meta.len()),
            Err(e) => warn!("Cannot remove {}: {}", entry.path().display(), e),
        }
    }
    stats
}

/// Keep only the last `tail_bytes` of `path`, starting at a line boundary.
/// Returns the bytes released.
pub fn truncate_to_tail(path: &Path, tail_bytes: u64) -> io::Result<u64> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let len = file.metadata()?.len();
    if len <= tail_bytes {
        return Ok(0);
    }

    file.seek(SeekFrom::Start(len - tail_bytes))?;
    let mut tail = Vec::with_capacity(tail_bytes as usize);
    file.read_to_end(&mut tail)?;
    if let Some(newline) = tail.iter().position(|&b| b == b'\n') {
        tail.drain(..=newline);
    }

    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&tail)?;
    file.sync_all()?;
    Ok(len - tail.len() as u64)
}

/// Truncate live logs larger than `max_bytes` down to their tail
pub fn truncate_oversized_logs(dirs: &[impl AsRef<Path>], max_bytes: u64, tail_bytes: u64) -> CleanupStats {
    let mut stats = CleanupStats::default();
    for path in live_logs(dirs) {
        let Ok(meta) = fs::metadata(&path) else { continue };
        if meta.len() <= max_bytes {
            continue;
        }
        match truncate_to_tail(&path, tail_bytes) {
            Ok(freed) => stats.add(freed),
            Err(e) => warn!("Cannot truncate {}: {}", path.display(), e),
        }
    }
    stats
}

/// Delete rotated and compressed logs
pub fn remove_rotated_logs(dirs: &[impl AsRef<Path>]) -> CleanupStats {
    let mut stats = CleanupStats::default();
    for dir in dirs {
        for entry in WalkDir::new(dir).min_depth(1).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() || !is_rotated_log(entry.path()) {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            match fs::remove_file(entry.path()) {
                Ok(()) => stats.add(size),
                Err(e) => warn!("Cannot remove {}: {}", entry.path().display(), e),
            }
        }
    }
    stats
}

/// Empty live logs not written to within `max_age`
pub fn empty_stale_logs(dirs: &[impl AsRef<Path>], max_age: Duration) -> CleanupStats {
    let mut stats = CleanupStats::default();
    let now = SystemTime::now();
    for path in live_logs(dirs) {
        let Ok(meta) = fs::metadata(&path) else { continue };
        if meta.len() == 0 || !is_older_than(&meta, now, max_age) {
            continue;
        }
        match OpenOptions::new().write(true).open(&path).and_then(|f| f.set_len(0)) {
            Ok(()) => stats.add(meta.len()),
            Err(e) => warn!("Cannot empty {}: {}", path.display(), e),
        }
    }
    stats
}

/// `app.log.1`, `app.log.2.gz`, `syslog.old`
pub fn is_rotated_log(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => {
            ROTATED_SUFFIXES.contains(&ext) || (!ext.is_empty() && ext.bytes().all(|b| b.is_ascii_digit()))
        }
        None => false,
    }
}

/// Regular, non-rotated files that are safe to truncate in place.
/// Binary journald files are never touched.
fn live_logs(dirs: &[impl AsRef<Path>]) -> Vec<std::path::PathBuf> {
    dirs.iter()
        .flat_map(|dir| WalkDir::new(dir).min_depth(1).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| !is_rotated_log(p))
        .filter(|p| {
            !matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("journal") | Some("journal~")
            )
        })
        .collect()
}

fn is_older_than(meta: &fs::Metadata, now: SystemTime, max_age: Duration) -> bool {
    meta.modified()
        .ok()
        .and_then(|modified| now.duration_since(modified).ok())
        .map(|age| age > max_age)
        .unwrap_or(false)
}

fn tree_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}
