//! Decision log
//!
//! Append-only JSONL stream of every supervisor decision (probe verdicts,
//! actions, escalations, sweeps, resets) for post-hoc diagnosis. Each append
//! is fsynced; the file rotates by entry count, keeping the newest 75%.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// No serialized record is shorter than this; below `max_entries` times it
/// the log cannot need rotating.
const MIN_RECORD_BYTES: u64 = 64;

/// What was decided
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Decision {
    ProbeResult {
        healthy: bool,
        failed_checks: Vec<String>,
        endpoint: String,
    },
    LockContended {
        holder: String,
        pid: u32,
    },
    /// The lock file could not be opened or locked; the cycle ran unguarded
    LockUnavailable {
        error: String,
    },
    TriggerAccepted {
        reason: String,
        level: u8,
        failure_count: u64,
    },
    QuiescenceReset {
        previous_level: u8,
        previous_failures: u64,
    },
    ActionStarted {
        severity: u8,
        action: String,
    },
    ActionFinished {
        severity: u8,
        action: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        errors: Vec<String>,
    },
    Recovered {
        from_level: u8,
    },
    Escalated {
        from_level: u8,
        to_level: u8,
        failed_checks: Vec<String>,
    },
    RebootIssued {
        failure_count: u64,
        diagnostics: serde_json::Value,
    },
    ResourceSweep {
        memory_pct: f64,
        disk_pct: f64,
        actions: Vec<String>,
        escalate: bool,
    },
    Reset {
        previous_level: u8,
        previous_failures: u64,
    },
}

/// Single line of the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub timestamp: DateTime<Utc>,
    /// Groups every record written by one cycle
    pub cycle_id: Uuid,
    /// Which entry point ran the cycle
    pub source: String,
    #[serde(flatten)]
    pub decision: Decision,
}

/// Decision log store with rotation
#[derive(Debug, Clone)]
pub struct DecisionLog {
    path: PathBuf,
    max_entries: usize,
}

impl DecisionLog {
    pub fn new(path: impl AsRef<Path>, max_entries: usize) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_entries: max_entries.max(4),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start recording a new cycle.
    pub fn cycle(&self, source: &str) -> CycleRecorder {
        CycleRecorder {
            log: self.clone(),
            cycle_id: Uuid::new_v4(),
            source: source.to_string(),
        }
    }

    /// Append a record and flush it to disk
    pub fn append(&self, record: &DecisionRecord) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        let line = serde_json::to_string(record)?;
        writeln!(file, "{}", line)?;
        file.sync_all()?;

        self.maybe_rotate()?;

        Ok(())
    }

    /// Read all records, skipping lines that do not parse
    pub fn read_all(&self) -> std::io::Result<Vec<DecisionRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(record) = serde_json::from_str::<DecisionRecord>(&line) {
                records.push(record);
            }
        }

        Ok(records)
    }

    /// The newest `n` records, oldest first
    pub fn read_tail(&self, n: usize) -> std::io::Result<Vec<DecisionRecord>> {
        let mut all = self.read_all()?;
        let skip = all.len().saturating_sub(n);
        Ok(all.split_off(skip))
    }

    /// Rotate once the line count passes `max_entries`, keeping the newest
    /// 75%. Lines are counted and copied without being parsed.
    fn maybe_rotate(&self) -> std::io::Result<()> {
        let size = fs::metadata(&self.path)?.len();
        if size < self.max_entries as u64 * MIN_RECORD_BYTES {
            return Ok(());
        }
        let lines = count_lines(&self.path)?;
        if lines <= self.max_entries {
            return Ok(());
        }

        let skip = lines - self.max_entries * 3 / 4;
        let reader = BufReader::new(File::open(&self.path)?);
        let temp_path = self.path.with_extension("jsonl.tmp");
        {
            let mut file = BufWriter::new(File::create(&temp_path)?);
            for line in reader.lines().skip(skip) {
                writeln!(file, "{}", line?)?;
            }
            file.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;
        debug!(kept = lines - skip, "Rotated decision log");

        Ok(())
    }
}

fn count_lines(path: &Path) -> std::io::Result<usize> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut count = 0;
    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            return Ok(count);
        }
        count += buf.iter().filter(|&&b| b == b'\n').count();
        let len = buf.len();
        reader.consume(len);
    }
}

/// Writes records for one cycle. Write failures are logged, never raised.
#[derive(Debug, Clone)]
pub struct CycleRecorder {
    log: DecisionLog,
    cycle_id: Uuid,
    source: String,
}

impl CycleRecorder {
    pub fn cycle_id(&self) -> Uuid {
        self.cycle_id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn record(&self, decision: Decision) {
        let record = DecisionRecord {
            timestamp: Utc::now(),
            cycle_id: self.cycle_id,
            source: self.source.clone(),
            decision,
        };
        if let Err(e) = self.log.append(&record) {
            warn!(
                "Failed to append decision to {}: {}",
                self.log.path().display(),
                e
            );
        }
    }
}
