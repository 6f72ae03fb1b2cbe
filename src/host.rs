//! Host stats and process/resource knobs (spec §3 `HostStats`, Component L).
//!
//! `/proc` parsing and the KSM/cgroup toggles are collaborators the
//! scheduler and handlers consume through [`HostIntrospection`]; production
//! code reads `/proc` for real, tests substitute [`StaticHostIntrospection`].

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// spec §3 `HostStats`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostStats {
    pub name: String,
    pub cpus: u32,
    pub mem_total_mb: u64,
    pub mem_used_mb: u64,
    /// 1/5/15-minute load averages.
    pub load: (f64, f64, f64),
    pub uptime_secs: u64,
    pub vms: u32,
    /// Current smallest coschedule cap seen, `-1` = none.
    pub limit: i64,
    pub cpu_commit: f64,
    pub mem_commit: f64,
    pub network_commit: f64,
    pub rx_bps: u64,
    pub tx_bps: u64,
}

impl HostStats {
    /// spec §4.6: "a fully-loaded host (`vms >= limit` when `limit != -1`)
    /// always sorts last."
    pub fn is_full(&self) -> bool {
        self.limit != -1 && self.vms as i64 >= self.limit
    }
}

#[async_trait]
pub trait HostIntrospection: Send + Sync {
    async fn stats(&self, name: &str, vms: u32, limit: i64) -> Result<HostStats>;
    async fn set_ksm(&self, enabled: bool) -> Result<()>;
}

/// Reads live `/proc` files on Linux.
pub struct ProcHostIntrospection;

#[async_trait]
impl HostIntrospection for ProcHostIntrospection {
    async fn stats(&self, name: &str, vms: u32, limit: i64) -> Result<HostStats> {
        let loadavg = tokio::fs::read_to_string("/proc/loadavg").await.unwrap_or_default();
        let load = parse_loadavg(&loadavg);

        let meminfo = tokio::fs::read_to_string("/proc/meminfo").await.unwrap_or_default();
        let (mem_total_mb, mem_free_mb) = parse_meminfo(&meminfo);

        let cpuinfo = tokio::fs::read_to_string("/proc/cpuinfo").await.unwrap_or_default();
        let cpus = count_processors(&cpuinfo);

        let uptime = tokio::fs::read_to_string("/proc/uptime").await.unwrap_or_default();
        let uptime_secs = uptime.split_whitespace().next().and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0) as u64;

        Ok(HostStats {
            name: name.to_string(),
            cpus,
            mem_total_mb,
            mem_used_mb: mem_total_mb.saturating_sub(mem_free_mb),
            load,
            uptime_secs,
            vms,
            limit,
            cpu_commit: 0.0,
            mem_commit: 0.0,
            network_commit: 0.0,
            rx_bps: 0,
            tx_bps: 0,
        })
    }

    async fn set_ksm(&self, enabled: bool) -> Result<()> {
        let value = if enabled { "1" } else { "0" };
        tokio::fs::write("/sys/kernel/mm/ksm/run", value)
            .await
            .map_err(|e| Error::Host(format!("cannot toggle KSM: {e}")))
    }
}

fn parse_loadavg(contents: &str) -> (f64, f64, f64) {
    let mut fields = contents.split_whitespace();
    let one = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0.0);
    let five = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0.0);
    let fifteen = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0.0);
    (one, five, fifteen)
}

fn parse_meminfo(contents: &str) -> (u64, u64) {
    let mut values: HashMap<&str, u64> = HashMap::new();
    for line in contents.lines() {
        if let Some((key, rest)) = line.split_once(':') {
            let kb = rest.trim().trim_end_matches(" kB").parse::<u64>().unwrap_or(0);
            values.insert(key, kb);
        }
    }
    let total = values.get("MemTotal").copied().unwrap_or(0) / 1024;
    let free = values.get("MemAvailable").or_else(|| values.get("MemFree")).copied().unwrap_or(0) / 1024;
    (total, free)
}

fn count_processors(cpuinfo: &str) -> u32 {
    cpuinfo.lines().filter(|l| l.starts_with("processor")).count() as u32
}

/// Fixed stats for tests and the single-host demo path.
pub struct StaticHostIntrospection {
    pub stats: HostStats,
}

#[async_trait]
impl HostIntrospection for StaticHostIntrospection {
    async fn stats(&self, _name: &str, vms: u32, limit: i64) -> Result<HostStats> {
        Ok(HostStats { vms, limit, ..self.stats.clone() })
    }

    async fn set_ksm(&self, _enabled: bool) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_host_sorts_last_when_limit_reached() {
        let stats = HostStats { vms: 4, limit: 4, ..Default::default() };
        assert!(stats.is_full());
        let stats = HostStats { vms: 3, limit: 4, ..Default::default() };
        assert!(!stats.is_full());
        let stats = HostStats { vms: 100, limit: -1, ..Default::default() };
        assert!(!stats.is_full());
    }

    #[test]
    fn parses_loadavg_line() {
        let load = parse_loadavg("0.10 0.20 0.30 1/200 1234");
        assert_eq!(load, (0.10, 0.20, 0.30));
    }

    #[test]
    fn parses_meminfo_totals() {
        let (total, free) = parse_meminfo("MemTotal:       16384000 kB\nMemAvailable:    8192000 kB\n");
        assert_eq!(total, 16000);
        assert_eq!(free, 8000);
    }
}
