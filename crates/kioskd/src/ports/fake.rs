//! In-memory port implementations for tests
//!
//! Each fake records the calls it receives so tests can assert on ordering.

use super::{DisplayIntrospection, HttpLiveness, OsControl, ServiceControl};
use crate::health::{CheckName, CheckResult, HealthCheck, HealthReport};
use crate::resources::sampler::{
    PeerConnections, ProcessSample, ResourceSampler, ResourceSnapshot, ZombieProcess,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Service manager that tracks running units and records every call
#[derive(Default)]
pub struct FakeServices {
    running: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
}

impl FakeServices {
    pub fn running<S: AsRef<str>>(names: &[S]) -> Self {
        let fake = Self::default();
        lock(&fake.running).extend(names.iter().map(|n| n.as_ref().to_string()));
        fake
    }

    /// Make every restart of `name` fail
    pub fn fail_restarts_of(&self, name: &str) {
        lock(&self.failing).insert(name.to_string());
    }

    /// Calls as `verb:unit`, in order
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn restarts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| c.strip_prefix("restart:").map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl ServiceControl for FakeServices {
    async fn is_running(&self, name: &str) -> bool {
        lock(&self.running).contains(name)
    }

    async fn restart(&self, name: &str) -> Result<()> {
        lock(&self.calls).push(format!("restart:{}", name));
        if lock(&self.failing).contains(name) {
            return Err(anyhow!("unit {} failed to start", name));
        }
        lock(&self.running).insert(name.to_string());
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        lock(&self.calls).push(format!("stop:{}", name));
        lock(&self.running).remove(name);
        Ok(())
    }
}

pub struct FakeDisplay {
    connected: AtomicBool,
    visible: AtomicBool,
}

impl FakeDisplay {
    pub fn healthy() -> Self {
        Self {
            connected: AtomicBool::new(true),
            visible: AtomicBool::new(true),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_window_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::SeqCst);
    }
}

#[async_trait]
impl DisplayIntrospection for FakeDisplay {
    async fn is_display_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn is_window_visible(&self, _title: &str) -> bool {
        self.visible.load(Ordering::SeqCst)
    }
}

pub struct FakeHttp {
    response: Mutex<std::result::Result<u16, String>>,
    requests: Mutex<Vec<String>>,
}

impl FakeHttp {
    pub fn status(status: u16) -> Self {
        Self {
            response: Mutex::new(Ok(status)),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn unreachable(reason: &str) -> Self {
        Self {
            response: Mutex::new(Err(reason.to_string())),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn set_status(&self, status: u16) {
        *lock(&self.response) = Ok(status);
    }

    pub fn requests(&self) -> Vec<String> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl HttpLiveness for FakeHttp {
    async fn get_status(&self, url: &str) -> Result<u16> {
        lock(&self.requests).push(url.to_string());
        lock(&self.response).clone().map_err(|e| anyhow!(e))
    }
}

/// Records OS calls instead of touching the host
#[derive(Default)]
pub struct FakeOs {
    calls: Mutex<Vec<String>>,
}

impl FakeOs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn reboots(&self) -> usize {
        self.calls().iter().filter(|c| c.as_str() == "reboot").count()
    }

    fn record(&self, call: String) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl OsControl for FakeOs {
    async fn drop_page_cache(&self) -> Result<()> {
        self.record("drop_page_cache".to_string());
        Ok(())
    }

    async fn signal_parent(&self, parent_pid: u32) -> Result<()> {
        self.record(format!("signal_parent:{}", parent_pid));
        Ok(())
    }

    async fn kill_process(&self, pid: u32) -> Result<()> {
        self.record(format!("kill:{}", pid));
        Ok(())
    }

    async fn close_peer(&self, peer: IpAddr) -> Result<()> {
        self.record(format!("close_peer:{}", peer));
        Ok(())
    }

    async fn run_maintenance(&self, argv: &[String]) -> Result<()> {
        self.record(format!("run:{}", argv.join(" ")));
        Ok(())
    }

    async fn reboot(&self) -> Result<()> {
        self.record("reboot".to_string());
        Ok(())
    }
}

/// Health check that replays scripted verdicts and repeats the last one
pub struct ScriptedHealth {
    verdicts: Mutex<VecDeque<bool>>,
    last: Mutex<bool>,
    checks: Mutex<usize>,
}

impl ScriptedHealth {
    pub fn new(verdicts: &[bool]) -> Self {
        Self {
            verdicts: Mutex::new(verdicts.iter().copied().collect()),
            last: Mutex::new(false),
            checks: Mutex::new(0),
        }
    }

    pub fn always(healthy: bool) -> Self {
        Self::new(&[healthy])
    }

    pub fn push(&self, healthy: bool) {
        lock(&self.verdicts).push_back(healthy);
    }

    /// Number of times `check` has run
    pub fn checks(&self) -> usize {
        *lock(&self.checks)
    }

    pub fn report(healthy: bool) -> HealthReport {
        let checks = CheckName::ALL
            .iter()
            .map(|&name| CheckResult {
                name,
                // an unhealthy verdict fails the last check only
                passed: healthy || name != CheckName::WindowVisible,
                detail: String::new(),
                duration_ms: 0,
            })
            .collect();
        HealthReport {
            timestamp: Utc::now(),
            endpoint: "http://127.0.0.1/health".to_string(),
            checks,
        }
    }
}

#[async_trait]
impl HealthCheck for ScriptedHealth {
    async fn check(&self) -> HealthReport {
        *lock(&self.checks) += 1;
        let healthy = match lock(&self.verdicts).pop_front() {
            Some(verdict) => {
                *lock(&self.last) = verdict;
                verdict
            }
            None => *lock(&self.last),
        };
        Self::report(healthy)
    }
}

/// Sampler returning scripted memory and disk readings. Each queue repeats
/// its last value once drained.
#[derive(Default)]
pub struct FakeSampler {
    memory: Mutex<VecDeque<f64>>,
    disk: Mutex<VecDeque<f64>>,
    processes: Mutex<Vec<ProcessSample>>,
    zombies: Mutex<Vec<ZombieProcess>>,
    peers: Mutex<Vec<PeerConnections>>,
}

impl FakeSampler {
    pub fn new(memory: &[f64], disk: &[f64]) -> Self {
        let fake = Self::default();
        lock(&fake.memory).extend(memory.iter().copied());
        lock(&fake.disk).extend(disk.iter().copied());
        fake
    }

    pub fn with_processes(self, processes: Vec<ProcessSample>) -> Self {
        *lock(&self.processes) = processes;
        self
    }

    pub fn with_zombies(self, zombies: Vec<ZombieProcess>) -> Self {
        *lock(&self.zombies) = zombies;
        self
    }

    pub fn with_peers(self, peers: Vec<PeerConnections>) -> Self {
        *lock(&self.peers) = peers;
        self
    }

    fn next(queue: &Mutex<VecDeque<f64>>) -> f64 {
        let mut queue = lock(queue);
        if queue.len() > 1 {
            queue.pop_front().unwrap_or_default()
        } else {
            queue.front().copied().unwrap_or_default()
        }
    }
}

#[async_trait]
impl ResourceSampler for FakeSampler {
    async fn sample(&self) -> Result<ResourceSnapshot> {
        let peers = lock(&self.peers).clone();
        Ok(ResourceSnapshot {
            memory_pct: Self::next(&self.memory),
            disk_pct: Self::next(&self.disk),
            processes: lock(&self.processes).clone(),
            zombies: lock(&self.zombies).clone(),
            established_connections: peers.iter().map(|p| p.count).sum(),
            peers,
        })
    }

    async fn memory_pct(&self) -> Result<f64> {
        Ok(Self::next(&self.memory))
    }

    async fn disk_pct(&self) -> Result<f64> {
        Ok(Self::next(&self.disk))
    }
}
