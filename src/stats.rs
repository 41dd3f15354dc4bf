use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use anyhow::Context;
use serde::Serialize;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::warn;

const KB: f64 = 1024.0;
const MB: f64 = 1024.0 * KB;
const GB: f64 = 1024.0 * MB;

fn mem_h(v: f64) -> String {
    if v < KB {
        format!("{v:.0} B")
    } else if v < MB {
        format!("{:.1} KB", v / KB)
    } else if v < GB {
        format!("{:.1} MB", v / MB)
    } else {
        format!("{:.1} GB", v / GB)
    }
}

/// Immutable snapshot of one unit's runtime metrics. Numeric fields are only
/// meaningful while `started` holds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsDescriptor {
    pub name: String,
    pub enabled: bool,
    pub started: bool,
    pub pid: i32,
    pub rss: u64,
    pub vm: u64,
    pub cpu_perc: f64,
    pub mem_perc: f64,
    pub rlimit_soft_fd: u64,
    pub rlimit_hard_fd: u64,
    pub num_fd: u64,
}

impl StatsDescriptor {
    pub fn rss_human(&self) -> String {
        mem_h(self.rss as f64)
    }

    pub fn vm_human(&self) -> String {
        mem_h(self.vm as f64)
    }
}

impl fmt::Display for StatsDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}: enabled={}, started={}, pid={}, rss={}, vm={}, cpu={:.1}, mem={:.1} sl={}, hl={}, fds={}",
            self.name,
            self.enabled,
            self.started,
            self.pid,
            self.rss_human(),
            self.vm_human(),
            self.cpu_perc,
            self.mem_perc,
            self.rlimit_soft_fd,
            self.rlimit_hard_fd,
            self.num_fd,
        )
    }
}

#[derive(Debug)]
struct UnitStats {
    name: String,
    enabled: bool,
    pid: i32,
    /// Whether a process handle is attached. The handle is realized lazily at
    /// the next collect tick; it is never carried across a restart.
    live: bool,
    rss: u64,
    vm: u64,
    cpu_perc: f64,
    mem_perc: f64,
    rlimit_soft_fd: u64,
    rlimit_hard_fd: u64,
    num_fd: u64,
    last_cpu_perc: f64,
}

impl UnitStats {
    fn new(name: String, enabled: bool) -> Self {
        Self {
            name,
            enabled,
            pid: -1,
            live: false,
            rss: 0,
            vm: 0,
            cpu_perc: 0.0,
            mem_perc: 0.0,
            rlimit_soft_fd: 0,
            rlimit_hard_fd: 0,
            num_fd: 0,
            last_cpu_perc: 0.0,
        }
    }

    fn descriptor(&self) -> StatsDescriptor {
        StatsDescriptor {
            name: self.name.clone(),
            enabled: self.enabled,
            started: self.pid > 0,
            pid: self.pid,
            rss: self.rss,
            vm: self.vm,
            cpu_perc: self.cpu_perc,
            mem_perc: self.mem_perc,
            rlimit_soft_fd: self.rlimit_soft_fd,
            rlimit_hard_fd: self.rlimit_hard_fd,
            num_fd: self.num_fd,
        }
    }
}

struct Inner {
    system: System,
    units: HashMap<String, UnitStats>,
}

/// Thread-safe cache of observed per-unit runtime metrics, refreshed by the
/// controller's collect tick and updated on guard transitions.
pub struct UnitStatsCache {
    inner: RwLock<Inner>,
}

impl Default for UnitStatsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl UnitStatsCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                system: System::new(),
                units: HashMap::new(),
            }),
        }
    }

    pub fn add(&self, name: &str, enabled: bool) {
        let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        inner
            .units
            .insert(name.to_string(), UnitStats::new(name.to_string(), enabled));
    }

    /// Attaches a fresh handle for `pid`. Called on the RunningStarted
    /// transition; must stay constant-time.
    pub fn started(&self, name: &str, pid: i32) {
        let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        if let Some(us) = inner.units.get_mut(name) {
            us.pid = pid;
            us.live = true;
            us.last_cpu_perc = 0.0;
        }
    }

    /// Drops the handle. A handle is invalid once its child exited; reusing it
    /// across a restart would report the wrong process.
    pub fn stopped(&self, name: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        if let Some(us) = inner.units.get_mut(name) {
            us.pid = -1;
            us.live = false;
        }
    }

    pub fn enabled(&self, name: &str) {
        self.set_enabled(name, true);
    }

    pub fn disabled(&self, name: &str) {
        self.set_enabled(name, false);
    }

    fn set_enabled(&self, name: &str, enabled: bool) {
        let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        if let Some(us) = inner.units.get_mut(name) {
            us.enabled = enabled;
        }
    }

    /// Refreshes metrics for every live entry. Errors on a single entry are
    /// logged and skipped.
    pub fn collect(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        let Inner { system, units } = &mut *inner;

        let pids: Vec<Pid> = units
            .values()
            .filter(|us| us.live && us.pid > 0)
            .map(|us| Pid::from_u32(us.pid as u32))
            .collect();
        if pids.is_empty() {
            return;
        }

        system.refresh_memory();
        system.refresh_processes(ProcessesToUpdate::Some(&pids), true);
        let total = system.total_memory();

        for us in units.values_mut() {
            if !us.live || us.pid <= 0 {
                continue;
            }
            let Some(proc_) = system.process(Pid::from_u32(us.pid as u32)) else {
                warn!(unit = %us.name, pid = us.pid, "stats: no such process");
                continue;
            };

            us.rss = proc_.memory();
            us.vm = total;
            us.mem_perc = if total > 0 {
                us.rss as f64 / total as f64 * 100.0
            } else {
                0.0
            };

            let sample = proc_.cpu_usage() as f64;
            us.cpu_perc = (sample + us.last_cpu_perc) / 2.0;
            us.last_cpu_perc = sample;

            match read_fd_count(us.pid) {
                Ok(n) => us.num_fd = n,
                Err(e) => {
                    warn!(unit = %us.name, pid = us.pid, "stats: fd count: {e:#}");
                    continue;
                }
            }
            match read_nofile_rlimits(us.pid) {
                Ok((soft, hard)) => {
                    us.rlimit_soft_fd = soft;
                    us.rlimit_hard_fd = hard;
                }
                Err(e) => warn!(unit = %us.name, pid = us.pid, "stats: rlimits: {e:#}"),
            }
        }
    }

    pub fn stats_descriptor(&self, name: &str) -> anyhow::Result<StatsDescriptor> {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
        inner
            .units
            .get(name)
            .map(UnitStats::descriptor)
            .ok_or_else(|| anyhow::anyhow!("no such unit {name:?}"))
    }

    /// All snapshots, sorted by unit name.
    pub fn all_stats_descriptors(&self) -> Vec<StatsDescriptor> {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
        let mut sds: Vec<StatsDescriptor> =
            inner.units.values().map(UnitStats::descriptor).collect();
        sds.sort_by(|a, b| a.name.cmp(&b.name));
        sds
    }
}

fn read_fd_count(pid: i32) -> anyhow::Result<u64> {
    let entries = std::fs::read_dir(format!("/proc/{pid}/fd"))
        .with_context(|| format!("read /proc/{pid}/fd"))?;
    Ok(entries.count() as u64)
}

/// Parses the NOFILE line of `/proc/<pid>/limits`.
fn read_nofile_rlimits(pid: i32) -> anyhow::Result<(u64, u64)> {
    let raw = std::fs::read_to_string(format!("/proc/{pid}/limits"))
        .with_context(|| format!("read /proc/{pid}/limits"))?;
    for line in raw.lines() {
        if !line.starts_with("Max open files") {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        // "Max open files <soft> <hard> files"
        if fields.len() < 5 {
            anyhow::bail!("unexpected limits line {line:?}");
        }
        let parse = |s: &str| -> u64 {
            if s == "unlimited" {
                u64::MAX
            } else {
                s.parse().unwrap_or(0)
            }
        };
        return Ok((parse(fields[3]), parse(fields[4])));
    }
    anyhow::bail!("no NOFILE line in /proc/{pid}/limits")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_tracks_transitions() {
        let cache = UnitStatsCache::new();
        cache.add("unit_01", true);

        let sd = cache.stats_descriptor("unit_01").unwrap();
        assert!(!sd.started);
        assert_eq!(sd.pid, -1);
        assert!(sd.enabled);

        cache.started("unit_01", 4711);
        let sd = cache.stats_descriptor("unit_01").unwrap();
        assert!(sd.started);
        assert_eq!(sd.pid, 4711);

        cache.stopped("unit_01");
        let sd = cache.stats_descriptor("unit_01").unwrap();
        assert!(!sd.started);
        assert_eq!(sd.pid, -1);

        cache.disabled("unit_01");
        assert!(!cache.stats_descriptor("unit_01").unwrap().enabled);
        cache.enabled("unit_01");
        assert!(cache.stats_descriptor("unit_01").unwrap().enabled);
    }

    #[test]
    fn unknown_unit_is_an_error() {
        let cache = UnitStatsCache::new();
        assert!(cache.stats_descriptor("nope").is_err());
    }

    #[test]
    fn all_descriptors_sorted_by_name() {
        let cache = UnitStatsCache::new();
        cache.add("unit_02", true);
        cache.add("unit_01", false);
        cache.add("unit_03", true);

        let names: Vec<_> = cache
            .all_stats_descriptors()
            .into_iter()
            .map(|sd| sd.name)
            .collect();
        assert_eq!(names, vec!["unit_01", "unit_02", "unit_03"]);
    }

    #[test]
    fn collect_reads_own_process() {
        let cache = UnitStatsCache::new();
        let pid = std::process::id() as i32;
        cache.add("self", true);
        cache.started("self", pid);

        cache.collect();

        let sd = cache.stats_descriptor("self").unwrap();
        assert!(sd.started);
        assert!(sd.rss > 0, "rss should be non-zero for a live process");
        assert!(sd.vm > 0);
        assert!(sd.num_fd > 0);
        assert!(sd.rlimit_soft_fd > 0);
        assert!(sd.rlimit_hard_fd >= sd.rlimit_soft_fd);
    }

    #[test]
    fn memory_is_humanized() {
        assert_eq!(mem_h(512.0), "512 B");
        assert_eq!(mem_h(2048.0), "2.0 KB");
        assert_eq!(mem_h(3.5 * 1024.0 * 1024.0), "3.5 MB");
        assert_eq!(mem_h(2.0 * 1024.0 * 1024.0 * 1024.0), "2.0 GB");
    }
}
