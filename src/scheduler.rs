//! Min-heap scheduler (spec §4.6, Component G).

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use tracing::error;

use crate::error::{Error, Result};
use crate::host::HostStats;
use crate::namespace::QueuedVms;

/// Which commit ratio `less` sorts hosts by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LessKey {
    CpuCommit,
    MemCommit,
    NetCommit,
}

fn commit_value(h: &HostStats, key: LessKey) -> f64 {
    match key {
        LessKey::CpuCommit => h.cpu_commit,
        LessKey::MemCommit => h.mem_commit,
        LessKey::NetCommit => h.network_commit,
    }
}

/// spec §4.6: "a fully-loaded host ... always sorts last."
fn host_cmp(a: &HostStats, b: &HostStats, key: LessKey) -> Ordering {
    match (a.is_full(), b.is_full()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => commit_value(a, key).partial_cmp(&commit_value(b, key)).unwrap_or(Ordering::Equal),
    }
}

/// One VM name assigned to a host by the scheduler.
#[derive(Debug, Clone)]
pub struct ScheduledVm {
    pub name: String,
    pub batch_index: usize,
}

fn sort_key(batch: &QueuedVms, anchor_index: &HashMap<String, Vec<usize>>) -> (bool, String, i64, usize, usize) {
    let pinned = !batch.schedule.is_empty();
    let colocated_count: usize = batch.names.iter().map(|n| anchor_index.get(n).map(|v| v.len()).unwrap_or(0)).sum();
    // Lower coschedule sorts first; map -1 (unlimited) to i64::MAX so it sorts last among unpinned.
    let coschedule_key = if batch.coschedule == -1 { i64::MAX } else { batch.coschedule };
    (
        !pinned,                  // pinned (false) sorts before unpinned (true)
        batch.schedule.clone(),   // smaller schedule string first, among pinned
        coschedule_key,           // lower cap first, among unpinned
        usize::MAX - colocated_count, // higher colocatedCount first -> invert for ascending sort
        usize::MAX - batch.names.len(), // larger batch size first -> invert
    )
}

/// Run the scheduler over `queue` against `hosts`. `localhost` resolves a
/// batch's `"localhost"` schedule field to the real hostname. Returns the
/// per-host assignment (spec §4.6 step 6 output). Aborts (partial
/// assignment logged) on coschedule-cap overflow or an unreachable
/// colocate anchor.
pub fn schedule(queue: &[QueuedVms], hosts: &mut [HostStats], localhost: &str, less: LessKey) -> Result<HashMap<String, Vec<ScheduledVm>>> {
    let known_hosts: HashSet<&str> = hosts.iter().map(|h| h.name.as_str()).collect();

    let resolved_schedule: Vec<String> = queue
        .iter()
        .map(|b| if b.schedule == "localhost" { localhost.to_string() } else { b.schedule.clone() })
        .collect();

    for (i, batch) in queue.iter().enumerate() {
        let target = &resolved_schedule[i];
        if !target.is_empty() && !known_hosts.contains(target.as_str()) {
            return Err(Error::Host(format!("pinned host does not exist: {target}")));
        }
        let _ = batch;
    }

    let mut anchor_index: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, batch) in queue.iter().enumerate() {
        if batch.colocate.is_some() && resolved_schedule[i].is_empty() {
            anchor_index.entry(batch.colocate.clone().unwrap()).or_default().push(i);
        }
    }

    let mut top_level: Vec<usize> = (0..queue.len())
        .filter(|&i| !(queue[i].colocate.is_some() && resolved_schedule[i].is_empty()))
        .collect();
    top_level.sort_by(|&a, &b| sort_key(&queue[a], &anchor_index).cmp(&sort_key(&queue[b], &anchor_index)));

    let mut assignment: HashMap<String, Vec<ScheduledVm>> = HashMap::new();
    for h in hosts.iter() {
        assignment.insert(h.name.clone(), Vec::new());
    }
    let mut visited_floaters: HashSet<usize> = HashSet::new();

    for &batch_idx in &top_level {
        let pinned_host = &resolved_schedule[batch_idx];
        let host_idx = if !pinned_host.is_empty() {
            hosts.iter().position(|h| &h.name == pinned_host).expect("validated above")
        } else {
            min_host_index(hosts, less)
        };

        for name in queue[batch_idx].names.clone() {
            place(hosts, host_idx, &queue[batch_idx], batch_idx, &name, &mut assignment)?;
            attach_floaters(&name, &anchor_index, queue, hosts, host_idx, &mut assignment, &mut visited_floaters)?;
        }
    }

    for (&anchor_idx_group, indices) in anchor_index_inverse(&anchor_index).iter() {
        let _ = anchor_idx_group;
        for &idx in indices {
            if !visited_floaters.contains(&idx) {
                error!(assignment = ?assignment, "scheduler: floating batch anchor never scheduled");
                return Err(Error::NonexistentColocateVms);
            }
        }
    }

    Ok(assignment)
}

fn anchor_index_inverse(anchor_index: &HashMap<String, Vec<usize>>) -> HashMap<usize, Vec<usize>> {
    // Single bucket (key 0) since callers only need the full list of
    // floating batch indices to check visitation.
    let mut all = Vec::new();
    for v in anchor_index.values() {
        all.extend(v.iter().copied());
    }
    HashMap::from([(0usize, all)])
}

fn min_host_index(hosts: &[HostStats], less: LessKey) -> usize {
    let mut best = 0;
    for i in 1..hosts.len() {
        if host_cmp(&hosts[i], &hosts[best], less) == Ordering::Less {
            best = i;
        }
    }
    best
}

fn place(
    hosts: &mut [HostStats],
    host_idx: usize,
    batch: &QueuedVms,
    batch_idx: usize,
    name: &str,
    assignment: &mut HashMap<String, Vec<ScheduledVm>>,
) -> Result<()> {
    let host = &mut hosts[host_idx];
    host.vms += 1;
    if batch.coschedule != -1 && (host.limit == -1 || batch.coschedule < host.limit) {
        host.limit = batch.coschedule;
    }
    if host.limit != -1 && host.vms as i64 > host.limit {
        error!(host = %host.name, vms = host.vms, limit = host.limit, "scheduler: coschedule cap overflow");
        return Err(Error::NonexistentColocateVms);
    }
    assignment.get_mut(&host.name).unwrap().push(ScheduledVm { name: name.to_string(), batch_index: batch_idx });
    Ok(())
}

fn attach_floaters(
    anchor_name: &str,
    anchor_index: &HashMap<String, Vec<usize>>,
    queue: &[QueuedVms],
    hosts: &mut [HostStats],
    host_idx: usize,
    assignment: &mut HashMap<String, Vec<ScheduledVm>>,
    visited: &mut HashSet<usize>,
) -> Result<()> {
    let Some(floater_indices) = anchor_index.get(anchor_name) else { return Ok(()) };
    for &floater_idx in floater_indices {
        if !visited.insert(floater_idx) {
            continue;
        }
        for name in queue[floater_idx].names.clone() {
            place(hosts, host_idx, &queue[floater_idx], floater_idx, &name, assignment)?;
            attach_floaters(&name, anchor_index, queue, hosts, host_idx, assignment, visited)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::config::{KvmConfig, VariantConfig, VmConfig};

    fn batch(names: &[&str], schedule: &str, colocate: Option<&str>, coschedule: i64) -> QueuedVms {
        QueuedVms {
            names: names.iter().map(|s| s.to_string()).collect(),
            vm_type: "kvm".to_string(),
            vm_config: VmConfig::new(VariantConfig::Kvm(KvmConfig::default())),
            schedule: schedule.to_string(),
            colocate: colocate.map(str::to_string),
            coschedule,
        }
    }

    fn host(name: &str) -> HostStats {
        HostStats { name: name.to_string(), limit: -1, ..Default::default() }
    }

    #[test]
    fn single_host_takes_every_batch() {
        let queue = vec![batch(&["a1", "a2"], "", None, -1)];
        let mut hosts = vec![host("h0")];
        let assignment = schedule(&queue, &mut hosts, "h0", LessKey::CpuCommit).unwrap();
        assert_eq!(assignment["h0"].len(), 2);
    }

    #[test]
    fn coschedule_cap_spreads_across_hosts() {
        let queue = vec![
            batch(&["a1", "a2"], "", None, 1),
            batch(&["b1", "b2", "b3", "b4"], "", None, -1),
        ];
        let mut hosts = vec![host("h0"), host("h1")];
        let assignment = schedule(&queue, &mut hosts, "h0", LessKey::CpuCommit).unwrap();
        let a_hosts: HashSet<&str> =
            assignment.iter().filter(|(_, vms)| vms.iter().any(|v| v.name == "a1" || v.name == "a2")).map(|(h, _)| h.as_str()).collect();
        assert_eq!(a_hosts.len(), 2, "a1/a2 must land on separate hosts under a cap of 1");
        let total: usize = assignment.values().map(|v| v.len()).sum();
        assert_eq!(total, 6);
    }

    #[test]
    fn floating_batch_colocates_with_anchor() {
        let queue = vec![batch(&["anchor"], "", None, -1), batch(&["buddy"], "", Some("anchor"), -1)];
        let mut hosts = vec![host("h0"), host("h1")];
        let assignment = schedule(&queue, &mut hosts, "h0", LessKey::CpuCommit).unwrap();
        let host_with_anchor = assignment.iter().find(|(_, vms)| vms.iter().any(|v| v.name == "anchor")).unwrap().0.clone();
        assert!(assignment[&host_with_anchor].iter().any(|v| v.name == "buddy"));
    }

    #[test]
    fn unreachable_anchor_is_an_error() {
        let queue = vec![batch(&["buddy"], "", Some("ghost"), -1)];
        let mut hosts = vec![host("h0")];
        let err = schedule(&queue, &mut hosts, "h0", LessKey::CpuCommit).unwrap_err();
        assert!(matches!(err, Error::NonexistentColocateVms));
    }

    #[test]
    fn pinned_host_must_exist() {
        let queue = vec![batch(&["a1"], "ghost-host", None, -1)];
        let mut hosts = vec![host("h0")];
        assert!(schedule(&queue, &mut hosts, "h0", LessKey::CpuCommit).is_err());
    }

    #[test]
    fn localhost_resolves_to_real_hostname() {
        let queue = vec![batch(&["a1"], "localhost", None, -1)];
        let mut hosts = vec![host("h0"), host("h1")];
        let assignment = schedule(&queue, &mut hosts, "h0", LessKey::CpuCommit).unwrap();
        assert!(assignment["h0"].iter().any(|v| v.name == "a1"));
    }
}
