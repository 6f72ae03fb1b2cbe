//! Startup recovery: reattach to VMs left running by a previous process
//! instance (spec §4.9, Component J).

use std::path::Path;
use std::sync::Arc;

use tokio::fs;
use tracing::{info, warn};

use crate::bridge::Bridge;
use crate::error::Result;
use crate::handlers::state::AppState;
use crate::vm::actor::VmHandle;
use crate::vm::config::{KvmConfig, VariantConfig, VmConfig};
use crate::vm::{State, Vm};

#[derive(Debug, Default)]
pub struct RecoverySummary {
    pub namespaces_scanned: usize,
    pub vms_recovered: usize,
    pub vms_skipped: usize,
}

/// Walk `<base>/namespaces/*/<uuid>` symlinks left by a previous run,
/// reattaching each VM that's still alive and re-registering its taps and
/// bonds without reshaping packets (spec §4.9: "no packet reshaping").
pub async fn recover(state: &Arc<AppState>, bridge: &Arc<dyn Bridge>) -> Result<RecoverySummary> {
    let mut summary = RecoverySummary::default();
    let namespaces_dir = state.base_dir.join("namespaces");
    let Ok(mut ns_entries) = fs::read_dir(&namespaces_dir).await else {
        return Ok(summary);
    };

    while let Some(ns_entry) = ns_entries.next_entry().await? {
        if !ns_entry.file_type().await?.is_dir() {
            continue;
        }
        let ns_name = ns_entry.file_name().to_string_lossy().into_owned();
        summary.namespaces_scanned += 1;
        state.ensure_namespace(&ns_name).await;

        let Ok(mut vm_entries) = fs::read_dir(ns_entry.path()).await else { continue };
        while let Some(vm_entry) = vm_entries.next_entry().await? {
            let instance_path = fs::canonicalize(vm_entry.path()).await.unwrap_or_else(|_| vm_entry.path());
            match recover_one(&instance_path, &ns_name, state, bridge).await {
                Ok(Some(handle)) => {
                    let mut namespaces = state.namespaces.lock().await;
                    if let Some(namespace) = namespaces.get_mut(&ns_name) {
                        let id = namespace.next_id();
                        namespace.vms.insert(id, handle);
                    }
                    summary.vms_recovered += 1;
                }
                Ok(None) => summary.vms_skipped += 1,
                Err(e) => {
                    warn!(path = %instance_path.display(), error = %e, "recovery: skipping VM");
                    summary.vms_skipped += 1;
                }
            }
        }
    }

    info!(?summary, "recovery: finished scanning persisted state");
    Ok(summary)
}

/// Reconstruct one VM from its instance directory, returning `None` for a
/// VM that's no longer alive. Anything left behind here survived a crash
/// rather than a clean shutdown (spec §5 teardown removes instance state
/// on a clean exit).
async fn recover_one(instance_path: &Path, namespace: &str, state: &Arc<AppState>, bridge: &Arc<dyn Bridge>) -> Result<Option<VmHandle>> {
    let state_text = fs::read_to_string(instance_path.join("state")).await?;
    let vm_state = match state_text.trim() {
        "RUNNING" => State::Running,
        "PAUSED" => State::Paused,
        _ => return Ok(None),
    };

    let pid: Option<u32> = fs::read_to_string(instance_path.join("pid")).await.ok().and_then(|s| s.trim().parse().ok());
    let Some(pid) = pid else { return Ok(None) };

    let name = match fs::read_to_string(instance_path.join("name")).await {
        Ok(n) => n.trim().to_string(),
        Err(_) => instance_path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
    };

    let config: VmConfig = match fs::read_to_string(instance_path.join("config")).await {
        Ok(json) => serde_json::from_str(&json)?,
        Err(_) => VmConfig::new(VariantConfig::Kvm(KvmConfig::default())),
    };

    let driver = state.driver_for(&config.variant);
    if !driver.is_alive(pid).await {
        return Ok(None);
    }

    for net in &config.base.networks {
        if !net.tap.is_empty() {
            let _ = bridge.recover_tap(&net.bridge, &net.tap, net.vlan).await;
        }
    }
    for bond in &config.base.bonds {
        let interfaces: Vec<String> = bond.interfaces.iter().filter_map(|&idx| config.base.networks.get(idx).map(|n| n.tap.clone())).collect();
        let _ = bridge.recover_bond(&bond.bridge, &bond.name, &interfaces).await;
    }

    let id: u64 = instance_path.file_name().and_then(|n| n.to_str()).and_then(|n| n.parse().ok()).unwrap_or(0);
    let mut vm = Vm::new(id, Some(name), namespace, &state.hostname, &state.base_dir, config);
    vm.pid = Some(pid);
    vm.instance_path = instance_path.to_path_buf();
    vm.set_state(vm_state);

    Ok(Some(VmHandle::spawn(vm, driver, bridge.clone())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::MockBridge;
    use crate::host::StaticHostIntrospection;
    use crate::vm::driver::{LaunchedProcess, VmDriver};
    use async_trait::async_trait;

    struct AliveDriver;
    #[async_trait]
    impl VmDriver for AliveDriver {
        async fn start(&self, _: &Path, _: &VmConfig) -> Result<LaunchedProcess> {
            unreachable!()
        }
        async fn stop(&self, _: u32) -> Result<()> {
            Ok(())
        }
        async fn pause(&self, _: u32) -> Result<()> {
            Ok(())
        }
        async fn resume(&self, _: u32) -> Result<()> {
            Ok(())
        }
        async fn kill(&self, _: u32) -> Result<()> {
            Ok(())
        }
        async fn is_alive(&self, pid: u32) -> bool {
            pid == 111
        }
    }

    fn make_state(tmp: &Path) -> Arc<AppState> {
        Arc::new(AppState::new(
            "h0",
            tmp.to_path_buf(),
            Arc::new(AliveDriver),
            Arc::new(AliveDriver),
            Arc::new(MockBridge::default()),
            Arc::new(StaticHostIntrospection { stats: Default::default() }),
        ))
    }

    #[tokio::test]
    async fn recovers_a_running_vm_left_behind_by_a_crash() {
        let tmp = tempfile::tempdir().unwrap();
        let state = make_state(tmp.path());
        let bridge: Arc<dyn Bridge> = Arc::new(MockBridge::default());

        let instance = tmp.path().join("1");
        tokio::fs::create_dir_all(&instance).await.unwrap();
        tokio::fs::write(instance.join("state"), "RUNNING").await.unwrap();
        tokio::fs::write(instance.join("pid"), "111").await.unwrap();
        tokio::fs::write(instance.join("name"), "box1").await.unwrap();

        let ns_dir = tmp.path().join("namespaces").join("minimega");
        tokio::fs::create_dir_all(&ns_dir).await.unwrap();
        #[cfg(unix)]
        tokio::fs::symlink(&instance, ns_dir.join("some-uuid")).await.unwrap();

        let summary = recover(&state, &bridge).await.unwrap();
        assert_eq!(summary.vms_recovered, 1);
        let namespaces = state.namespaces.lock().await;
        assert_eq!(namespaces.get("minimega").unwrap().vms.len(), 1);
    }

    #[tokio::test]
    async fn skips_a_vm_whose_process_is_gone() {
        let tmp = tempfile::tempdir().unwrap();
        let state = make_state(tmp.path());
        let bridge: Arc<dyn Bridge> = Arc::new(MockBridge::default());

        let instance = tmp.path().join("2");
        tokio::fs::create_dir_all(&instance).await.unwrap();
        tokio::fs::write(instance.join("state"), "RUNNING").await.unwrap();
        tokio::fs::write(instance.join("pid"), "999").await.unwrap();

        let ns_dir = tmp.path().join("namespaces").join("minimega");
        tokio::fs::create_dir_all(&ns_dir).await.unwrap();
        #[cfg(unix)]
        tokio::fs::symlink(&instance, ns_dir.join("some-uuid")).await.unwrap();

        let summary = recover(&state, &bridge).await.unwrap();
        assert_eq!(summary.vms_recovered, 0);
        assert_eq!(summary.vms_skipped, 1);
    }
}
