//! Resource monitor
//!
//! A sweep samples the host and reclaims what is over threshold: memory,
//! disk, zombie and runaway processes, and noisy network peers. Each phase
//! escalates to a more destructive step only if the cheap one did not help.
//! A sweep holds the supervisor lock so it never overlaps a recovery.

pub mod cleanup;
pub mod sampler;

pub use sampler::{ResourceSampler, ResourceSnapshot, SysinfoSampler};

use crate::ports::{OsControl, ServiceControl};
use anyhow::Result;
use kiosk_shared::config::{Config, ResourcesConfig};
use kiosk_shared::{Decision, DecisionLog, KioskError, SupervisorLock};
use sampler::{PeerConnections, ProcessSample};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub const SWEEP_HOLDER: &str = "sweep";

/// One reclamation step taken by a sweep
#[derive(Debug, Clone, PartialEq)]
pub enum SweepAction {
    DroppedPageCache,
    SignalledZombieParents { zombies: usize, parents: usize },
    /// Renderer and application restart attempt; `errors` is empty on success
    RestartedServices { errors: Vec<String> },
    CleanedPackageCache,
    RemovedTempFiles { files: usize, bytes: u64 },
    ClearedRendererCache { bytes: u64 },
    TruncatedLogs { files: usize, bytes: u64 },
    RemovedArtifacts { files: usize, bytes: u64 },
    EmptiedStaleLogs { files: usize },
    VacuumedJournal,
    KilledRunaway {
        pid: u32,
        name: String,
        cpu_pct: f32,
        avg_cpu_pct: f32,
        run_secs: u64,
    },
    ClosedPeer { addr: IpAddr, connections: usize },
}

impl fmt::Display for SweepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepAction::DroppedPageCache => write!(f, "dropped page cache"),
            SweepAction::SignalledZombieParents { zombies, parents } => {
                write!(f, "signalled {} parents of {} zombies", parents, zombies)
            }
            SweepAction::RestartedServices { errors } if errors.is_empty() => {
                write!(f, "restarted renderer and application")
            }
            SweepAction::RestartedServices { errors } => {
                write!(f, "restart of renderer and application failed: {}", errors.join("; "))
            }
            SweepAction::CleanedPackageCache => write!(f, "cleaned package cache"),
            SweepAction::RemovedTempFiles { files, bytes } => {
                write!(f, "removed {} temp files ({} bytes)", files, bytes)
            }
            SweepAction::ClearedRendererCache { bytes } => {
                write!(f, "cleared renderer cache ({} bytes)", bytes)
            }
            SweepAction::TruncatedLogs { files, bytes } => {
                write!(f, "truncated {} logs ({} bytes)", files, bytes)
            }
            SweepAction::RemovedArtifacts { files, bytes } => {
                write!(f, "removed {} artifacts ({} bytes)", files, bytes)
            }
            SweepAction::EmptiedStaleLogs { files } => write!(f, "emptied {} stale logs", files),
            SweepAction::VacuumedJournal => write!(f, "vacuumed journal"),
            SweepAction::KilledRunaway {
                pid,
                name,
                cpu_pct,
                avg_cpu_pct,
                run_secs,
            } => write!(
                f,
                "killed {} (pid {}, {:.0}% cpu, {:.0}% over {}s)",
                name, pid, cpu_pct, avg_cpu_pct, run_secs
            ),
            SweepAction::ClosedPeer { addr, connections } => {
                write!(f, "closed {} connections to {}", connections, addr)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepReport {
    pub memory_pct: f64,
    pub disk_pct: f64,
    pub actions: Vec<SweepAction>,
    /// Disk is still critical after every reclamation step
    pub escalate: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SweepOutcome {
    Completed(SweepReport),
    Contended { holder: String, pid: u32 },
}

pub struct ResourceMonitor {
    config: ResourcesConfig,
    application: String,
    renderer: String,
    renderer_cache_dirs: Vec<PathBuf>,
    sampler: Arc<dyn ResourceSampler>,
    services: Arc<dyn ServiceControl>,
    os: Arc<dyn OsControl>,
    lock: SupervisorLock,
    log: DecisionLog,
}

impl ResourceMonitor {
    pub fn new(
        config: &Config,
        sampler: Arc<dyn ResourceSampler>,
        services: Arc<dyn ServiceControl>,
        os: Arc<dyn OsControl>,
    ) -> Self {
        Self {
            config: config.resources.clone(),
            application: config.services.application.clone(),
            renderer: config.services.renderer.clone(),
            renderer_cache_dirs: config.recovery.renderer_cache_dirs.clone(),
            sampler,
            services,
            os,
            lock: SupervisorLock::new(config.paths.lock_file(), config.recovery.lock_stale_after()),
            log: DecisionLog::new(config.paths.decision_log(), config.paths.decision_log_max_entries),
        }
    }

    /// Run one sweep under the supervisor lock
    pub async fn sweep(&self) -> Result<SweepOutcome> {
        let cycle = self.log.cycle(SWEEP_HOLDER);
        // Disk cleanup must still run when the lock file itself is unusable.
        let _guard = match self.lock.try_acquire(SWEEP_HOLDER) {
            Ok(guard) => Some(guard),
            Err(KioskError::LockHeld { pid, holder, .. }) => {
                info!("Skipping sweep: lock held by {} (pid {})", holder, pid);
                cycle.record(Decision::LockContended {
                    holder: holder.clone(),
                    pid,
                });
                return Ok(SweepOutcome::Contended { holder, pid });
            }
            Err(e) => {
                error!("Supervisor lock unavailable ({}), sweeping without it", e);
                cycle.record(Decision::LockUnavailable { error: e.to_string() });
                None
            }
        };

        let snapshot = self.sampler.sample().await?;
        info!(
            "Sweep: memory {:.1}%, disk {:.1}%, {} zombies, {} connections",
            snapshot.memory_pct,
            snapshot.disk_pct,
            snapshot.zombies.len(),
            snapshot.established_connections
        );

        let mut actions = Vec::new();
        let mut zombies_handled = false;

        if snapshot.memory_pct > self.config.memory_cleanup_pct {
            self.reclaim_memory(&snapshot, &mut actions).await;
            zombies_handled = true;
        }

        let mut escalate = false;
        if snapshot.disk_pct > self.config.disk_cleanup_pct {
            escalate = self.reclaim_disk(&mut actions).await;
        }

        if !zombies_handled {
            self.reap_zombies(&snapshot, &mut actions).await;
        }
        self.kill_runaways(&snapshot.processes, &mut actions).await;
        if snapshot.established_connections > self.config.max_connections {
            self.close_noisy_peers(&snapshot.peers, &mut actions).await;
        }

        let report = SweepReport {
            memory_pct: snapshot.memory_pct,
            disk_pct: snapshot.disk_pct,
            actions,
            escalate,
        };
        cycle.record(Decision::ResourceSweep {
            memory_pct: report.memory_pct,
            disk_pct: report.disk_pct,
            actions: report.actions.iter().map(ToString::to_string).collect(),
            escalate: report.escalate,
        });
        Ok(SweepOutcome::Completed(report))
    }

    async fn reclaim_memory(&self, snapshot: &ResourceSnapshot, actions: &mut Vec<SweepAction>) {
        warn!("Memory at {:.1}%, reclaiming", snapshot.memory_pct);
        match self.os.drop_page_cache().await {
            Ok(()) => actions.push(SweepAction::DroppedPageCache),
            Err(e) => warn!("Page cache drop failed: {:#}", e),
        }
        self.reap_zombies(snapshot, actions).await;

        let after = match self.sampler.memory_pct().await {
            Ok(pct) => pct,
            Err(e) => {
                warn!("Memory re-sample failed: {:#}", e);
                return;
            }
        };
        if after > self.config.memory_restart_pct {
            warn!("Memory still at {:.1}%, restarting renderer and application", after);
            let mut errors = Vec::new();
            for service in [&self.renderer, &self.application] {
                if let Err(e) = self.services.restart(service).await {
                    warn!("Restart of {} failed: {:#}", service, e);
                    errors.push(format!("{}: {:#}", service, e));
                }
            }
            actions.push(SweepAction::RestartedServices { errors });
        }
    }

    /// Returns true when the disk is still critical afterwards
    async fn reclaim_disk(&self, actions: &mut Vec<SweepAction>) -> bool {
        let cfg = &self.config;
        warn!("Disk over {:.0}%, cleaning", cfg.disk_cleanup_pct);

        if !cfg.package_cache_command.is_empty() {
            match self.os.run_maintenance(&cfg.package_cache_command).await {
                Ok(()) => actions.push(SweepAction::CleanedPackageCache),
                Err(e) => warn!("Package cache cleanup failed: {:#}", e),
            }
        }

        let max_age = Duration::from_secs(cfg.temp_max_age_hours * 3600);
        let mut temp = cleanup::CleanupStats::default();
        for dir in &cfg.temp_dirs {
            temp.merge(cleanup::remove_stale_files(dir, max_age));
        }
        if temp.files > 0 {
            actions.push(SweepAction::RemovedTempFiles {
                files: temp.files,
                bytes: temp.bytes,
            });
        }

        let mut cache_bytes = 0;
        for dir in &self.renderer_cache_dirs {
            match cleanup::clear_dir_contents(dir) {
                Ok(stats) => cache_bytes += stats.bytes,
                Err(e) => warn!("Cannot clear {}: {}", dir.display(), e),
            }
        }
        if cache_bytes > 0 {
            actions.push(SweepAction::ClearedRendererCache { bytes: cache_bytes });
        }

        let logs = cleanup::truncate_oversized_logs(&cfg.log_dirs, cfg.log_max_bytes, cfg.log_tail_bytes);
        if logs.files > 0 {
            actions.push(SweepAction::TruncatedLogs {
                files: logs.files,
                bytes: logs.bytes,
            });
        }

        let after = match self.sampler.disk_pct().await {
            Ok(pct) => pct,
            Err(e) => {
                warn!("Disk re-sample failed: {:#}", e);
                return false;
            }
        };
        if after <= cfg.disk_critical_pct {
            return false;
        }

        warn!("Disk still at {:.1}%, removing artifacts and stale logs", after);
        let mut artifacts = cleanup::remove_rotated_logs(&cfg.log_dirs);
        for dir in &cfg.artifact_dirs {
            match cleanup::clear_dir_contents(dir) {
                Ok(stats) => artifacts.merge(stats),
                Err(e) => warn!("Cannot clear {}: {}", dir.display(), e),
            }
        }
        actions.push(SweepAction::RemovedArtifacts {
            files: artifacts.files,
            bytes: artifacts.bytes,
        });

        let stale = cleanup::empty_stale_logs(&cfg.log_dirs, Duration::from_secs(cfg.log_stale_days * 86400));
        actions.push(SweepAction::EmptiedStaleLogs { files: stale.files });

        if !cfg.journal_vacuum_command.is_empty() {
            match self.os.run_maintenance(&cfg.journal_vacuum_command).await {
                Ok(()) => actions.push(SweepAction::VacuumedJournal),
                Err(e) => warn!("Journal vacuum failed: {:#}", e),
            }
        }

        match self.sampler.disk_pct().await {
            Ok(pct) if pct > cfg.disk_critical_pct => {
                warn!("Disk still critical at {:.1}% after destructive cleanup", pct);
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!("Disk re-sample failed: {:#}", e);
                false
            }
        }
    }

    async fn reap_zombies(&self, snapshot: &ResourceSnapshot, actions: &mut Vec<SweepAction>) {
        if snapshot.zombies.is_empty() {
            return;
        }
        let parents: BTreeSet<u32> = snapshot
            .zombies
            .iter()
            .filter_map(|z| z.parent_pid)
            .filter(|&ppid| ppid > 1)
            .collect();
        let mut signalled = 0;
        for parent in &parents {
            match self.os.signal_parent(*parent).await {
                Ok(()) => signalled += 1,
                Err(e) => warn!("Cannot signal pid {}: {:#}", parent, e),
            }
        }
        info!("Signalled {} parents of {} zombies", signalled, snapshot.zombies.len());
        actions.push(SweepAction::SignalledZombieParents {
            zombies: snapshot.zombies.len(),
            parents: signalled,
        });
    }

    async fn kill_runaways(&self, processes: &[ProcessSample], actions: &mut Vec<SweepAction>) {
        let own_pid = std::process::id();
        for process in processes {
            // A single pinned sample is not enough: the lifetime average must
            // be pinned too.
            let pin = self.config.cpu_pin_pct;
            if process.cpu_pct <= pin || process.avg_cpu_pct <= pin || process.run_secs <= self.config.cpu_pin_secs {
                continue;
            }
            if process.pid <= 1
                || process.pid == own_pid
                || self.config.protected_processes.iter().any(|p| p == &process.name)
            {
                continue;
            }
            warn!(
                "Runaway process {} (pid {}) at {:.0}% cpu, {:.0}% over {}s",
                process.name, process.pid, process.cpu_pct, process.avg_cpu_pct, process.run_secs
            );
            match self.os.kill_process(process.pid).await {
                Ok(()) => actions.push(SweepAction::KilledRunaway {
                    pid: process.pid,
                    name: process.name.clone(),
                    cpu_pct: process.cpu_pct,
                    avg_cpu_pct: process.avg_cpu_pct,
                    run_secs: process.run_secs,
                }),
                Err(e) => warn!("Cannot kill pid {}: {:#}", process.pid, e),
            }
        }
    }

    async fn close_noisy_peers(&self, peers: &[PeerConnections], actions: &mut Vec<SweepAction>) {
        warn!("Connection count over {}, closing noisiest peers", self.config.max_connections);
        let noisy = peers
            .iter()
            .filter(|p| !p.addr.is_loopback() && !p.addr.is_unspecified())
            .take(self.config.noisy_peers_to_close);
        for peer in noisy {
            match self.os.close_peer(peer.addr).await {
                Ok(()) => actions.push(SweepAction::ClosedPeer {
                    addr: peer.addr,
                    connections: peer.count,
                }),
                Err(e) => warn!("Cannot close connections to {}: {:#}", peer.addr, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_display() {
        let action = SweepAction::KilledRunaway {
            pid: 4242,
            name: "miner".to_string(),
            cpu_pct: 99.4,
            avg_cpu_pct: 97.2,
            run_secs: 360,
        };
        assert_eq!(action.to_string(), "killed miner (pid 4242, 99% cpu, 97% over 360s)");
        assert_eq!(
            SweepAction::RestartedServices {
                errors: vec!["renderer: exit 1".to_string()]
            }
            .to_string(),
            "restart of renderer and application failed: renderer: exit 1"
        );
        assert_eq!(
            SweepAction::ClosedPeer {
                addr: "10.0.0.9".parse().unwrap(),
                connections: 40
            }
            .to_string(),
            "closed 40 connections to 10.0.0.9"
        );
    }
}
