//! Shared in-process state the built-in handlers operate against: the
//! namespace table, the pending (not-yet-frozen) VM config, and the
//! collaborators launch/recovery need (spec §3 `Namespace`, §4.5
//! "Freezing happens by copy at the moment `vm launch` succeeds").

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;

use crate::bridge::Bridge;
use crate::host::HostIntrospection;
use crate::namespace::{Namespace, DEFAULT_NAMESPACE};
use crate::vm::config::{ContainerConfig, KvmConfig, VariantConfig, VmConfig};
use crate::vm::driver::VmDriver;

/// Host-wide state every built-in handler is constructed against. One
/// instance is shared (via `Arc`) across every registered handler and the
/// mesh's inbound dispatch path. `namespaces` is the only field ever held
/// across an `.await` (VM actor calls), so it alone uses the async mutex.
pub struct AppState {
    pub hostname: String,
    pub base_dir: PathBuf,
    pub namespaces: AsyncMutex<HashMap<String, Namespace>>,
    pub active_namespace: Mutex<String>,
    pub pending_config: Mutex<VmConfig>,
    pub kvm_driver: Arc<dyn VmDriver>,
    pub container_driver: Arc<dyn VmDriver>,
    pub bridge: Arc<dyn Bridge>,
    pub host_introspection: Arc<dyn HostIntrospection>,
    pub known_hosts: Mutex<Vec<String>>,
}

impl AppState {
    pub fn new(
        hostname: impl Into<String>,
        base_dir: PathBuf,
        kvm_driver: Arc<dyn VmDriver>,
        container_driver: Arc<dyn VmDriver>,
        bridge: Arc<dyn Bridge>,
        host_introspection: Arc<dyn HostIntrospection>,
    ) -> Self {
        let hostname = hostname.into();
        let mut namespaces = HashMap::new();
        namespaces.insert(DEFAULT_NAMESPACE.to_string(), Namespace::new(DEFAULT_NAMESPACE, base_dir.clone()));
        Self {
            hostname: hostname.clone(),
            base_dir,
            namespaces: AsyncMutex::new(namespaces),
            active_namespace: Mutex::new(DEFAULT_NAMESPACE.to_string()),
            pending_config: Mutex::new(VmConfig::new(VariantConfig::Kvm(KvmConfig::default()))),
            kvm_driver,
            container_driver,
            bridge,
            host_introspection,
            known_hosts: Mutex::new(vec![hostname]),
        }
    }

    pub fn active_namespace_name(&self) -> String {
        self.active_namespace.lock().unwrap().clone()
    }

    /// Ensure `name` exists (spec §3: "Namespace created lazily on first
    /// reference").
    pub async fn ensure_namespace(&self, name: &str) {
        let mut namespaces = self.namespaces.lock().await;
        namespaces.entry(name.to_string()).or_insert_with(|| Namespace::new(name, self.base_dir.clone()));
    }

    pub fn driver_for(&self, variant: &VariantConfig) -> Arc<dyn VmDriver> {
        match variant {
            VariantConfig::Kvm(_) => self.kvm_driver.clone(),
            VariantConfig::Container(_) => self.container_driver.clone(),
        }
    }

    /// Reset the pending config to the variant's defaults (`vm config
    /// clear`).
    pub fn clear_pending_config(&self, variant: VariantConfig) {
        *self.pending_config.lock().unwrap() = VmConfig::new(variant);
    }
}

/// Parse a `vm config <variant>` choice token into an empty variant config.
pub fn default_variant(kind: &str) -> VariantConfig {
    match kind {
        "container" => VariantConfig::Container(ContainerConfig::default()),
        _ => VariantConfig::Kvm(KvmConfig::default()),
    }
}
