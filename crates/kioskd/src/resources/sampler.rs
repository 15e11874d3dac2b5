//! Resource sampling
//!
//! Memory, CPU, process and disk figures come from sysinfo. Established TCP
//! connections are read from /proc/net/tcp and /proc/net/tcp6.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use sysinfo::{Disks, ProcessStatus, System};
use tracing::debug;

/// TCP state code for ESTABLISHED in /proc/net/tcp
const TCP_ESTABLISHED: &str = "01";

/// USER_HZ, the unit of the CPU times in /proc/<pid>/stat
const CLOCK_TICKS_PER_SEC: f64 = 100.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSample {
    pub pid: u32,
    pub name: String,
    /// Usage over the sampling interval
    pub cpu_pct: f32,
    /// Usage averaged over the whole lifetime; 0 when unknown
    pub avg_cpu_pct: f32,
    /// Seconds since the process started
    pub run_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZombieProcess {
    pub pid: u32,
    pub parent_pid: Option<u32>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerConnections {
    pub addr: IpAddr,
    pub count: usize,
}

/// Point-in-time view of the host
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub memory_pct: f64,
    pub disk_pct: f64,
    /// Processes above zero CPU, highest first
    pub processes: Vec<ProcessSample>,
    pub zombies: Vec<ZombieProcess>,
    pub established_connections: usize,
    /// Remote peers by established connection count, highest first
    pub peers: Vec<PeerConnections>,
}

#[async_trait]
pub trait ResourceSampler: Send + Sync {
    async fn sample(&self) -> Result<ResourceSnapshot>;

    async fn memory_pct(&self) -> Result<f64>;

    async fn disk_pct(&self) -> Result<f64>;
}

pub struct SysinfoSampler {
    disk_mount: PathBuf,
    proc_root: PathBuf,
}

impl SysinfoSampler {
    pub fn new(disk_mount: impl Into<PathBuf>) -> Self {
        Self {
            disk_mount: disk_mount.into(),
            proc_root: PathBuf::from("/proc"),
        }
    }

    fn read_memory_pct() -> f64 {
        let mut sys = System::new();
        sys.refresh_memory();
        percent(sys.used_memory(), sys.total_memory())
    }

    fn read_disk_pct(mount: &Path) -> Result<f64> {
        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .list()
            .iter()
            .filter(|d| mount.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .with_context(|| format!("No filesystem mounted at {}", mount.display()))?;
        let total = disk.total_space();
        Ok(percent(total.saturating_sub(disk.available_space()), total))
    }

    fn read_connections(&self) -> Vec<IpAddr> {
        let mut peers = Vec::new();
        for table in ["tcp", "tcp6"] {
            let path = self.proc_root.join("net").join(table);
            match std::fs::read_to_string(&path) {
                Ok(content) => peers.extend(parse_established_peers(&content)),
                Err(e) => debug!("Cannot read {}: {}", path.display(), e),
            }
        }
        peers
    }

    fn lifetime_cpu_pct(&self, pid: u32, run_secs: u64) -> f32 {
        let path = self.proc_root.join(pid.to_string()).join("stat");
        match std::fs::read_to_string(&path) {
            Ok(stat) => parse_cpu_ticks(&stat)
                .map(|ticks| average_cpu_pct(ticks, run_secs))
                .unwrap_or(0.0),
            Err(e) => {
                debug!("Cannot read {}: {}", path.display(), e);
                0.0
            }
        }
    }
}

#[async_trait]
impl ResourceSampler for SysinfoSampler {
    async fn sample(&self) -> Result<ResourceSnapshot> {
        let mut sys = System::new();
        sys.refresh_memory();
        // CPU usage is a delta between two refreshes
        sys.refresh_processes();
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
        sys.refresh_processes();

        let mut processes = Vec::new();
        let mut zombies = Vec::new();
        for (pid, process) in sys.processes() {
            if process.status() == ProcessStatus::Zombie {
                zombies.push(ZombieProcess {
                    pid: pid.as_u32(),
                    parent_pid: process.parent().map(|p| p.as_u32()),
                    name: process.name().to_string(),
                });
            } else if process.cpu_usage() > 0.0 {
                processes.push(ProcessSample {
                    pid: pid.as_u32(),
                    name: process.name().to_string(),
                    cpu_pct: process.cpu_usage(),
                    avg_cpu_pct: self.lifetime_cpu_pct(pid.as_u32(), process.run_time()),
                    run_secs: process.run_time(),
                });
            }
        }
        processes.sort_by(|a, b| b.cpu_pct.total_cmp(&a.cpu_pct));

        let remote = self.read_connections();
        let established_connections = remote.len();

        Ok(ResourceSnapshot {
            memory_pct: percent(sys.used_memory(), sys.total_memory()),
            disk_pct: Self::read_disk_pct(&self.disk_mount)?,
            processes,
            zombies,
            established_connections,
            peers: rank_peers(remote),
        })
    }

    async fn memory_pct(&self) -> Result<f64> {
        Ok(Self::read_memory_pct())
    }

    async fn disk_pct(&self) -> Result<f64> {
        Self::read_disk_pct(&self.disk_mount)
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 * 100.0 / total as f64
    }
}

/// utime + stime from a /proc/<pid>/stat line
pub fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    // comm may contain spaces and parentheses; fields resume after the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is state (field 3); utime and stime are fields 14 and 15
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

/// Per-core percentage, comparable with sysinfo's `cpu_usage`
fn average_cpu_pct(ticks: u64, run_secs: u64) -> f32 {
    if run_secs == 0 {
        return 0.0;
    }
    (ticks as f64 / CLOCK_TICKS_PER_SEC * 100.0 / run_secs as f64) as f32
}

/// Count connections per remote address, highest first
pub fn rank_peers(remote: Vec<IpAddr>) -> Vec<PeerConnections> {
    let mut counts: HashMap<IpAddr, usize> = HashMap::new();
    for addr in remote {
        *counts.entry(addr).or_default() += 1;
    }
    let mut peers: Vec<PeerConnections> = counts
        .into_iter()
        .map(|(addr, count)| PeerConnections { addr, count })
        .collect();
    peers.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.addr.cmp(&b.addr)));
    peers
}

/// Remote addresses of ESTABLISHED sockets in a /proc/net/tcp{,6} table
pub fn parse_established_peers(table: &str) -> Vec<IpAddr> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            // sl local_address rem_address st ...
            if fields.len() < 4 || fields[3] != TCP_ESTABLISHED {
                return None;
            }
            let (addr, _port) = fields[2].split_once(':')?;
            decode_proc_addr(addr)
        })
        .collect()
}

/// Addresses are printed as native-endian 32-bit words
fn decode_proc_addr(hex: &str) -> Option<IpAddr> {
    match hex.len() {
        8 => {
            let word = u32::from_str_radix(hex, 16).ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(word.to_ne_bytes())))
        }
        32 => {
            let mut bytes = [0u8; 16];
            for (i, chunk) in bytes.chunks_mut(4).enumerate() {
                let word = u32::from_str_radix(&hex[i * 8..i * 8 + 8], 16).ok()?;
                chunk.copy_from_slice(&word.to_ne_bytes());
            }
            let v6 = Ipv6Addr::from(bytes);
            Some(match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => IpAddr::V6(v6),
            })
        }
        _ => None,
    }
}

#[cfg(all(test, target_endian = "little"))]
mod tests {
    use super::*;

    const TCP: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 12345 1 0000000000000000 100 0 0 10 0
   1: 0100007F:1F90 0100007F:D2A4 01 00000000:00000000 00:00000000 00000000  1000        0 12346 1 0000000000000000 20 4 30 10 -1
   2: 0F02000A:C350 6401A8C0:01BB 01 00000000:00000000 00:00000000 00000000  1000        0 12347 1 0000000000000000 20 4 30 10 -1
   3: 0F02000A:C352 6401A8C0:01BB 01 00000000:00000000 00:00000000 00000000  1000        0 12348 1 0000000000000000 20 4 30 10 -1
   4: 0F02000A:C354 6501A8C0:01BB 06 00000000:00000000 00:00000000 00000000  1000        0 12349 1 0000000000000000 20 4 30 10 -1
";

    const TCP6: &str = "\
  sl  local_address                         remote_address                        st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000000000000000000001000000:1F90 00000000000000000000000001000000:A1B2 01 00000000:00000000 00:00000000 00000000  1000        0 1 1 0000000000000000 20 4 30 10 -1
   1: 0000000000000000FFFF00000F02000A:1F90 0000000000000000FFFF00006401A8C0:A1B4 01 00000000:00000000 00:00000000 00000000  1000        0 2 1 0000000000000000 20 4 30 10 -1
";

    #[test]
    fn test_parse_ipv4_established_only() {
        let peers = parse_established_peers(TCP);
        assert_eq!(
            peers,
            vec![
                "127.0.0.1".parse::<IpAddr>().unwrap(),
                "192.168.1.100".parse().unwrap(),
                "192.168.1.100".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn test_parse_ipv6_and_mapped() {
        let peers = parse_established_peers(TCP6);
        assert_eq!(
            peers,
            vec!["::1".parse::<IpAddr>().unwrap(), "192.168.1.100".parse().unwrap()]
        );
    }

    #[test]
    fn test_rank_peers() {
        let mut remote = parse_established_peers(TCP);
        remote.extend(parse_established_peers(TCP6));
        let ranked = rank_peers(remote);
        assert_eq!(ranked[0].addr, "192.168.1.100".parse::<IpAddr>().unwrap());
        assert_eq!(ranked[0].count, 3);
        assert_eq!(ranked.len(), 3);
    }

    #[test]
    fn test_garbage_lines_are_skipped() {
        let table = "header\nnot a socket line\n   0: ZZZZ:0000 XXXX:0000 01\n";
        assert!(parse_established_peers(table).is_empty());
    }

    #[test]
    fn test_parse_cpu_ticks_with_parenthesised_name() {
        let stat = "1234 (my (odd) app) S 1 1234 1234 0 -1 4194560 1000 0 0 0 27000 3000 0 0 20 0 1 0 500 0 0";
        assert_eq!(parse_cpu_ticks(stat), Some(30000));
        assert_eq!(parse_cpu_ticks("1234 (short) S 1"), None);
        assert_eq!(parse_cpu_ticks("garbage"), None);
    }

    #[test]
    fn test_average_cpu_pct() {
        // 300 cpu-seconds over 360 seconds of life
        assert!((average_cpu_pct(30000, 360) - 83.33).abs() < 0.01);
        assert_eq!(average_cpu_pct(30000, 0), 0.0);
    }
}
