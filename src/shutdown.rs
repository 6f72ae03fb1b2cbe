//! Full shutdown teardown (spec §5: "destroy every namespace, disable
//! KSM, tear down containers, destroy bridges, remove the Unix socket,
//! unlink the PID file").

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use tracing::warn;

use crate::control_socket;
use crate::handlers::AppState;

/// Kill every VM in every namespace, destroy the bridges they used,
/// disable KSM, drop every namespace, then remove the control socket and
/// PID file. Best-effort throughout: one VM or bridge failing to tear
/// down does not stop the rest of the sequence.
pub async fn teardown(state: &Arc<AppState>, socket_path: &Path, pid_path: &Path) {
    let mut bridges = HashSet::new();
    {
        let mut namespaces = state.namespaces.lock().await;
        for namespace in namespaces.values() {
            for handle in namespace.vms.values() {
                if let Ok(vm) = handle.info().await {
                    for net in &vm.config.base.networks {
                        bridges.insert(net.bridge.clone());
                    }
                }
                if let Err(e) = handle.kill().await {
                    warn!(error = %e, "shutdown: failed to kill a vm");
                }
            }
        }
        namespaces.clear();
    }

    for bridge in &bridges {
        if let Err(e) = state.bridge.destroy(bridge).await {
            warn!(%bridge, error = %e, "shutdown: failed to destroy bridge");
        }
    }

    if let Err(e) = state.host_introspection.set_ksm(false).await {
        warn!(error = %e, "shutdown: failed to disable KSM");
    }

    control_socket::remove(socket_path).await;
    if let Err(e) = tokio::fs::remove_file(pid_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(error = %e, path = %pid_path.display(), "shutdown: failed to remove pid file");
        }
    }
}
