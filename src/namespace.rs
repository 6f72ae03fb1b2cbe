//! Per-namespace VM table, host set, and VLAN alias allocator (spec §3
//! `Namespace`, §4.8, Component E).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use tokio::fs;

use crate::error::{Error, Result};
use crate::vm::actor::VmHandle;
use crate::vm::config::VmConfig;

/// spec §3 `QueuedVMs`: a batch to launch on one host.
#[derive(Debug, Clone)]
pub struct QueuedVms {
    pub names: Vec<String>,
    pub vm_type: String,
    pub vm_config: VmConfig,
    /// Target host, or empty for a floating batch.
    pub schedule: String,
    /// Name of another queued VM to colocate with.
    pub colocate: Option<String>,
    /// `-1` = no limit.
    pub coschedule: i64,
}

#[derive(Debug, Clone, Default)]
pub struct Optimizations {
    pub hugepages_path: Option<String>,
    pub affinity_enabled: bool,
    pub affinity_filter: Vec<String>,
    pub cpu_set: HashMap<String, Vec<u32>>,
}

const DEFAULT_VLAN_MIN: i32 = 101;
const DEFAULT_VLAN_MAX: i32 = 4096;

/// Deterministic per-namespace VLAN allocator (spec §4.8).
#[derive(Debug, Clone)]
pub struct VlanAllocator {
    pub min: i32,
    pub max: i32,
    next: i32,
    pub blacklist: HashSet<i32>,
    pub aliases: HashMap<String, i32>,
}

impl Default for VlanAllocator {
    fn default() -> Self {
        Self { min: DEFAULT_VLAN_MIN, max: DEFAULT_VLAN_MAX, next: DEFAULT_VLAN_MIN, blacklist: HashSet::new(), aliases: HashMap::new() }
    }
}

impl VlanAllocator {
    /// Returns the existing vlan for `alias`, or allocates the next unused
    /// one skipping the blacklist, wrapping to `min` on exhaustion. A fresh
    /// allocation is reported back to the caller so it can be broadcast
    /// (spec §4.8: "first allocation triggers a best-effort broadcast").
    pub fn lookup(&mut self, alias: &str) -> Result<(i32, bool)> {
        if let Some(&vlan) = self.aliases.get(alias) {
            return Ok((vlan, false));
        }

        let taken: HashSet<i32> = self.aliases.values().copied().collect();
        let span = (self.max - self.min + 1).max(1);
        for step in 0..span {
            let candidate = self.min + (self.next - self.min + step).rem_euclid(span);
            if self.blacklist.contains(&candidate) || taken.contains(&candidate) {
                continue;
            }
            self.aliases.insert(alias.to_string(), candidate);
            self.next = if candidate + 1 > self.max { self.min } else { candidate + 1 };
            return Ok((candidate, true));
        }
        Err(Error::Host(format!("no unused VLAN remains in range {}-{}", self.min, self.max)))
    }

    pub async fn persist(&self, base: &Path) -> Result<()> {
        let mut buf = String::new();
        for (alias, vlan) in &self.aliases {
            buf.push_str(&format!("{alias}\t{vlan}\n"));
        }
        let tmp = base.join("vlans.tmp");
        fs::write(&tmp, &buf).await?;
        fs::rename(&tmp, base.join("vlans")).await?;
        Ok(())
    }

    pub async fn recover(base: &Path) -> Result<Self> {
        let mut allocator = Self::default();
        let path = base.join("vlans");
        if let Ok(contents) = fs::read_to_string(&path).await {
            for line in contents.lines() {
                if let Some((alias, vlan)) = line.split_once('\t') {
                    if let Ok(vlan) = vlan.trim().parse::<i32>() {
                        allocator.aliases.insert(alias.to_string(), vlan);
                    }
                }
            }
        }
        Ok(allocator)
    }
}

/// The default namespace name; deleting it is forbidden (spec §3).
pub const DEFAULT_NAMESPACE: &str = "minimega";

/// spec §3 `Namespace`.
pub struct Namespace {
    pub name: String,
    pub hosts: HashSet<String>,
    pub vms: HashMap<u64, VmHandle>,
    pub queue: Vec<QueuedVms>,
    pub saved_configs: HashMap<String, VmConfig>,
    pub vlans: VlanAllocator,
    pub optimizations: Optimizations,
    pub queueing: bool,
    next_vm_id: u64,
    base_dir: PathBuf,
}

impl Namespace {
    pub fn new(name: impl Into<String>, base_dir: PathBuf) -> Self {
        Self {
            name: name.into(),
            hosts: HashSet::new(),
            vms: HashMap::new(),
            queue: Vec::new(),
            saved_configs: HashMap::new(),
            vlans: VlanAllocator::default(),
            optimizations: Optimizations::default(),
            queueing: false,
            next_vm_id: 0,
            base_dir,
        }
    }

    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_NAMESPACE
    }

    pub fn next_id(&mut self) -> u64 {
        let id = self.next_vm_id;
        self.next_vm_id += 1;
        id
    }
}

/// A resolved `Apply` target selector (spec §4.5 "Apply"): `"all"`, a
/// comma-separated range (`foo[1-3],bar`), a name, an id, or a uuid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSelector {
    All,
    Names(Vec<String>),
}

pub fn parse_target_selector(raw: &str) -> TargetSelector {
    if raw == "all" {
        return TargetSelector::All;
    }
    let mut names = Vec::new();
    for part in raw.split(',') {
        if let Some((prefix, range)) = part.split_once('[') {
            let range = range.trim_end_matches(']');
            for piece in range.split(',') {
                if let Some((lo, hi)) = piece.split_once('-') {
                    if let (Ok(lo), Ok(hi)) = (lo.parse::<i64>(), hi.parse::<i64>()) {
                        for n in lo..=hi {
                            names.push(format!("{prefix}{n}"));
                        }
                        continue;
                    }
                }
                names.push(format!("{prefix}{piece}"));
            }
        } else {
            names.push(part.to_string());
        }
    }
    TargetSelector::Names(names)
}

/// spec §4.5 "Apply": runs `f` against every VM the selector resolves to.
/// Non-applicable VMs are silently skipped; a single non-wildcard target
/// that matched no VM returns `"vm not found"`; one that matched but
/// wasn't applicable returns `"VM state error"`.
pub async fn apply<F, Fut>(names_and_handles: &[(String, VmHandle)], selector: &TargetSelector, f: F) -> Result<Vec<(String, Result<()>)>>
where
    F: Fn(VmHandle) -> Fut,
    Fut: std::future::Future<Output = Result<bool>>,
{
    let targets: Vec<&(String, VmHandle)> = match selector {
        TargetSelector::All => names_and_handles.iter().collect(),
        TargetSelector::Names(names) => names_and_handles.iter().filter(|(n, _)| names.contains(n)).collect(),
    };

    if let TargetSelector::Names(names) = selector {
        if names.len() == 1 && targets.is_empty() {
            return Err(Error::vm_not_found());
        }
    }

    let mut results = Vec::new();
    let mut any_applicable = false;
    for (name, handle) in &targets {
        match f(handle.clone()).await {
            Ok(true) => {
                any_applicable = true;
                results.push((name.clone(), Ok(())));
            }
            Ok(false) => {}
            Err(e) => {
                any_applicable = true;
                results.push((name.clone(), Err(e)));
            }
        }
    }

    if let TargetSelector::Names(names) = selector {
        if names.len() == 1 && !targets.is_empty() && !any_applicable {
            return Err(Error::VmStateError);
        }
    }

    Ok(results)
}
