//! VM config mutation and lifecycle handlers (spec §4.5).
//!
//! Config mutation (`vm config ...`) only ever touches `pending_config`, so
//! it's expressed as plain sync closures through [`SimpleHandler`]; launch
//! and the state transitions need the VM actor's async mailbox, so those are
//! full [`Handler`] impls.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::command::Command;
use crate::dispatcher::{Handler, MeshFanout, SimpleHandler};
use crate::error::{Error, Result};
use crate::handlers::state::{default_variant, AppState};
use crate::namespace::{apply, parse_target_selector, Namespace};
use crate::response::{Response, ResponseSet};
use crate::vm::actor::VmHandle;
use crate::vm::config::{NetConfig, VariantConfig};
use crate::vm::{validate_vm_name, Vm};

/// `vm config kvm` / `vm config container`: switch the pending variant,
/// keeping the shared `base` settings (memory, vcpus, networks, tags).
pub fn config_variant(state: Arc<AppState>) -> SimpleHandler<impl Fn(&Command) -> Result<Response> + Send + Sync> {
    SimpleHandler {
        hostname: state.hostname.clone(),
        f: move |cmd: &Command| {
            let kind = if cmd.bool_args.contains_key("container") { "container" } else { "kvm" };
            let mut pending = state.pending_config.lock().unwrap();
            pending.variant = default_variant(kind);
            Ok(Response::ok("", ""))
        },
    }
}

pub fn config_memory(state: Arc<AppState>) -> SimpleHandler<impl Fn(&Command) -> Result<Response> + Send + Sync> {
    SimpleHandler {
        hostname: state.hostname.clone(),
        f: move |cmd: &Command| {
            let mb: u64 = cmd
                .string_args
                .get("mb")
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::Grammar("memory must be a positive integer".to_string()))?;
            state.pending_config.lock().unwrap().base.memory_mb = mb;
            Ok(Response::ok("", ""))
        },
    }
}

pub fn config_vcpus(state: Arc<AppState>) -> SimpleHandler<impl Fn(&Command) -> Result<Response> + Send + Sync> {
    SimpleHandler {
        hostname: state.hostname.clone(),
        f: move |cmd: &Command| {
            let vcpus: u32 = cmd
                .string_args
                .get("n")
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::Grammar("vcpus must be a positive integer".to_string()))?;
            state.pending_config.lock().unwrap().base.vcpus = vcpus;
            Ok(Response::ok("", ""))
        },
    }
}

pub fn config_networks(state: Arc<AppState>) -> SimpleHandler<impl Fn(&Command) -> Result<Response> + Send + Sync> {
    SimpleHandler {
        hostname: state.hostname.clone(),
        f: move |cmd: &Command| {
            let specs = cmd.list_args.get("specs").cloned().unwrap_or_default();
            let networks = specs.into_iter().map(parse_net_spec).collect();
            state.pending_config.lock().unwrap().base.networks = networks;
            Ok(Response::ok("", ""))
        },
    }
}

/// Parse one `vm config networks` spec (`bridge,vlan` or a bare alias) into
/// a `NetConfig`. VLAN allocation from an alias happens at launch time, once
/// the owning namespace is known.
fn parse_net_spec(spec: String) -> NetConfig {
    let mut net = NetConfig { raw: spec.clone(), ..Default::default() };
    let mut parts = spec.split(',');
    if let Some(first) = parts.next() {
        if let Ok(vlan) = first.parse::<i32>() {
            net.vlan = vlan;
        } else {
            net.alias = first.to_string();
        }
    }
    if let Some(bridge) = parts.next() {
        net.bridge = bridge.to_string();
    }
    net
}

pub fn config_disks(state: Arc<AppState>) -> SimpleHandler<impl Fn(&Command) -> Result<Response> + Send + Sync> {
    SimpleHandler {
        hostname: state.hostname.clone(),
        f: move |cmd: &Command| {
            let disks = cmd.list_args.get("paths").cloned().unwrap_or_default();
            let mut pending = state.pending_config.lock().unwrap();
            match &mut pending.variant {
                VariantConfig::Kvm(k) => k.disks = disks,
                VariantConfig::Container(_) => return Err(Error::Grammar("disks only apply to kvm VMs".to_string())),
            }
            Ok(Response::ok("", ""))
        },
    }
}

pub fn config_kernel(state: Arc<AppState>) -> SimpleHandler<impl Fn(&Command) -> Result<Response> + Send + Sync> {
    SimpleHandler {
        hostname: state.hostname.clone(),
        f: move |cmd: &Command| {
            let path = cmd.string_args.get("path").cloned().unwrap_or_default();
            let mut pending = state.pending_config.lock().unwrap();
            match &mut pending.variant {
                VariantConfig::Kvm(k) => k.kernel = Some(path),
                VariantConfig::Container(_) => return Err(Error::Grammar("kernel only applies to kvm VMs".to_string())),
            }
            Ok(Response::ok("", ""))
        },
    }
}

pub fn config_initrd(state: Arc<AppState>) -> SimpleHandler<impl Fn(&Command) -> Result<Response> + Send + Sync> {
    SimpleHandler {
        hostname: state.hostname.clone(),
        f: move |cmd: &Command| {
            let path = cmd.string_args.get("path").cloned().unwrap_or_default();
            let mut pending = state.pending_config.lock().unwrap();
            match &mut pending.variant {
                VariantConfig::Kvm(k) => k.initrd = Some(path),
                VariantConfig::Container(_) => return Err(Error::Grammar("initrd only applies to kvm VMs".to_string())),
            }
            Ok(Response::ok("", ""))
        },
    }
}

pub fn config_append(state: Arc<AppState>) -> SimpleHandler<impl Fn(&Command) -> Result<Response> + Send + Sync> {
    SimpleHandler {
        hostname: state.hostname.clone(),
        f: move |cmd: &Command| {
            let args = cmd.list_args.get("args").cloned().unwrap_or_default().join(" ");
            let mut pending = state.pending_config.lock().unwrap();
            match &mut pending.variant {
                VariantConfig::Kvm(k) => k.append = Some(args),
                VariantConfig::Container(_) => return Err(Error::Grammar("append only applies to kvm VMs".to_string())),
            }
            Ok(Response::ok("", ""))
        },
    }
}

pub fn config_filesystem(state: Arc<AppState>) -> SimpleHandler<impl Fn(&Command) -> Result<Response> + Send + Sync> {
    SimpleHandler {
        hostname: state.hostname.clone(),
        f: move |cmd: &Command| {
            let path = cmd.string_args.get("path").cloned().unwrap_or_default();
            let mut pending = state.pending_config.lock().unwrap();
            match &mut pending.variant {
                VariantConfig::Container(c) => c.filesystem = path,
                VariantConfig::Kvm(_) => return Err(Error::Grammar("filesystem only applies to container VMs".to_string())),
            }
            Ok(Response::ok("", ""))
        },
    }
}

pub fn config_init(state: Arc<AppState>) -> SimpleHandler<impl Fn(&Command) -> Result<Response> + Send + Sync> {
    SimpleHandler {
        hostname: state.hostname.clone(),
        f: move |cmd: &Command| {
            let args = cmd.list_args.get("args").cloned().unwrap_or_default();
            let mut pending = state.pending_config.lock().unwrap();
            match &mut pending.variant {
                VariantConfig::Container(c) => c.init = args,
                VariantConfig::Kvm(_) => return Err(Error::Grammar("init only applies to container VMs".to_string())),
            }
            Ok(Response::ok("", ""))
        },
    }
}

pub fn config_tag(state: Arc<AppState>) -> SimpleHandler<impl Fn(&Command) -> Result<Response> + Send + Sync> {
    SimpleHandler {
        hostname: state.hostname.clone(),
        f: move |cmd: &Command| {
            let key = cmd.string_args.get("key").cloned().unwrap_or_default();
            let value = cmd.string_args.get("value").cloned().unwrap_or_default();
            state.pending_config.lock().unwrap().base.tags.insert(key, value);
            Ok(Response::ok("", ""))
        },
    }
}

pub fn config_coschedule(state: Arc<AppState>) -> SimpleHandler<impl Fn(&Command) -> Result<Response> + Send + Sync> {
    SimpleHandler {
        hostname: state.hostname.clone(),
        f: move |cmd: &Command| {
            let n: i64 = cmd.string_args.get("n").and_then(|s| s.parse().ok()).ok_or_else(|| Error::Grammar("coschedule must be an integer".to_string()))?;
            state.pending_config.lock().unwrap().base.coschedule = n;
            Ok(Response::ok("", ""))
        },
    }
}

pub fn config_clear(state: Arc<AppState>) -> SimpleHandler<impl Fn(&Command) -> Result<Response> + Send + Sync> {
    SimpleHandler {
        hostname: state.hostname.clone(),
        f: move |_cmd: &Command| {
            let variant = state.pending_config.lock().unwrap().variant.clone();
            state.clear_pending_config(variant);
            Ok(Response::ok("", ""))
        },
    }
}

/// `vm launch <kvm,container> <names>...` (spec §4.5 steps 1-5): freeze the
/// pending config by copy, validate names and cross-VM conflicts, then
/// launch every named VM in the active namespace.
pub struct LaunchHandler {
    pub state: Arc<AppState>,
    pub mesh: Arc<dyn MeshFanout>,
}

#[async_trait]
impl Handler for LaunchHandler {
    async fn call(&self, cmd: Command, sink: mpsc::Sender<ResponseSet>) -> Result<()> {
        let names = cmd.list_args.get("names").cloned().unwrap_or_default();
        let mut config = self.state.pending_config.lock().unwrap().clone();
        let known_hosts = self.state.known_hosts.lock().unwrap().clone();
        let ns_name = self.state.active_namespace_name();
        self.state.ensure_namespace(&ns_name).await;

        let mut responses = ResponseSet::new();
        let mut namespaces = self.state.namespaces.lock().await;
        let namespace = namespaces.get_mut(&ns_name).expect("namespace just ensured");

        // Resolve each NIC's alias into a concrete vlan before the VMs that
        // share this launch are built (spec §4.8: "first allocation
        // triggers a best-effort broadcast").
        let mut fresh_allocations: Vec<(String, i32)> = Vec::new();
        for net in config.base.networks.iter_mut() {
            if !net.alias.is_empty() {
                let (vlan, fresh) = namespace.vlans.lookup(&net.alias)?;
                net.vlan = vlan;
                if fresh {
                    fresh_allocations.push((net.alias.clone(), vlan));
                }
            }
        }
        if !fresh_allocations.is_empty() {
            let _ = namespace.vlans.persist(&self.state.base_dir.join("namespaces").join(&ns_name)).await;
        }
        drop(namespaces);

        // Announce every freshly-allocated alias so peers adopt the same
        // vlan number instead of allocating their own on next reference
        // (spec §4.8): `namespace <ns> vlans add <alias> <vlan>`.
        if cmd.is_broadcastable() {
            for (alias, vlan) in &fresh_allocations {
                let announce = Command {
                    original: format!("namespace \"{ns_name}\" vlans add {alias} {vlan}"),
                    source: ns_name.clone(),
                    ..Default::default()
                };
                for peer in self.mesh.peers() {
                    let _ = self.mesh.send_command(&peer, &announce).await;
                }
            }
        }

        let mut namespaces = self.state.namespaces.lock().await;
        let namespace = namespaces.get_mut(&ns_name).expect("namespace just ensured");

        for name in names {
            if let Err(e) = validate_vm_name(&name, &known_hosts) {
                responses.push(Response::error(self.state.hostname.clone(), e.user_message()));
                continue;
            }

            let id = namespace.next_id();
            let vm = Vm::new(id, Some(name.clone()), &ns_name, &self.state.hostname, &self.state.base_dir, config.clone());

            let mut conflict = None;
            for existing_handle in namespace.vms.values() {
                if let Ok(existing) = existing_handle.info().await {
                    if let Some(kind) = crate::vm::lifecycle::conflicts(&vm, &existing) {
                        conflict = Some(kind);
                        break;
                    }
                }
            }
            match conflict {
                Some(crate::vm::lifecycle::ConflictKind::Fatal(msg)) => {
                    responses.push(Response::error(self.state.hostname.clone(), msg));
                    continue;
                }
                Some(crate::vm::lifecycle::ConflictKind::Warning(msg)) => {
                    responses.push(Response::ok(self.state.hostname.clone(), format!("warning: {msg}")));
                }
                None => {}
            }

            let driver = self.state.driver_for(&vm.config.variant);
            let handle = VmHandle::spawn(vm, driver, self.state.bridge.clone());
            match handle.launch().await {
                Ok(()) => {
                    namespace.vms.insert(id, handle);
                    responses.push(Response::ok(self.state.hostname.clone(), format!("{name} launched")));
                }
                Err(e) => {
                    namespace.vms.insert(id, handle);
                    responses.push(Response::error(self.state.hostname.clone(), e.user_message()));
                }
            }
        }

        let _ = sink.send(responses).await;
        Ok(())
    }
}

/// Collects `(name, handle)` pairs for every VM in `namespace`, resolving
/// names through the actor's mailbox since the namespace table is keyed by
/// id rather than name.
async fn named_handles(namespace: &Namespace) -> Vec<(String, VmHandle)> {
    let mut out = Vec::with_capacity(namespace.vms.len());
    for handle in namespace.vms.values() {
        if let Ok(vm) = handle.info().await {
            out.push((vm.name, handle.clone()));
        }
    }
    out
}

fn target(cmd: &Command) -> crate::namespace::TargetSelector {
    parse_target_selector(cmd.string_args.get("target").map(|s| s.as_str()).unwrap_or("all"))
}

/// Shared shape for `vm start|stop|kill|flush <target>`: resolve the
/// selector against the active namespace and apply `op` to every match
/// (spec §4.5 "Apply").
async fn apply_to_target<F, Fut>(state: &Arc<AppState>, cmd: &Command, op: F) -> Result<ResponseSet>
where
    F: Fn(VmHandle) -> Fut,
    Fut: std::future::Future<Output = Result<bool>>,
{
    let ns_name = state.active_namespace_name();
    let namespaces = state.namespaces.lock().await;
    let namespace = namespaces.get(&ns_name).ok_or_else(Error::vm_not_found)?;
    let handles = named_handles(namespace).await;
    let selector = target(cmd);
    let results = apply(&handles, &selector, op).await?;

    let mut responses = ResponseSet::new();
    for (name, result) in results {
        match result {
            Ok(()) => responses.push(Response::ok(state.hostname.clone(), name)),
            Err(e) => responses.push(Response::error(state.hostname.clone(), e.user_message())),
        }
    }
    Ok(responses)
}

macro_rules! vm_target_handler {
    ($name:ident, $op:expr) => {
        pub struct $name {
            pub state: Arc<AppState>,
        }

        #[async_trait]
        impl Handler for $name {
            async fn call(&self, cmd: Command, sink: mpsc::Sender<ResponseSet>) -> Result<()> {
                let responses = apply_to_target(&self.state, &cmd, $op).await?;
                let _ = sink.send(responses).await;
                Ok(())
            }
        }
    };
}

vm_target_handler!(StartHandler, |h: VmHandle| async move { h.start().await.map(|_| true) });
vm_target_handler!(StopHandler, |h: VmHandle| async move { h.stop().await.map(|_| true) });
vm_target_handler!(KillHandler, |h: VmHandle| async move { h.kill().await.map(|_| true) });
vm_target_handler!(FlushHandler, |h: VmHandle| async move { h.flush().await.map(|_| true) });

/// `vm info`: tabular listing of every VM in the active namespace.
pub struct InfoHandler {
    pub state: Arc<AppState>,
}

#[async_trait]
impl Handler for InfoHandler {
    async fn call(&self, _cmd: Command, sink: mpsc::Sender<ResponseSet>) -> Result<()> {
        let ns_name = self.state.active_namespace_name();
        let namespaces = self.state.namespaces.lock().await;
        let mut rows = Vec::new();
        if let Some(namespace) = namespaces.get(&ns_name) {
            for handle in namespace.vms.values() {
                if let Ok(vm) = handle.info().await {
                    rows.push(vec![
                        vm.id.to_string(),
                        vm.name,
                        vm.state.as_str().to_string(),
                        vm.config.variant.type_name().to_string(),
                        vm.pid.map(|p| p.to_string()).unwrap_or_default(),
                    ]);
                }
            }
        }

        let response = Response {
            host: self.state.hostname.clone(),
            header: vec!["id".to_string(), "name".to_string(), "state".to_string(), "type".to_string(), "pid".to_string()],
            tabular: rows,
            ..Default::default()
        };
        let _ = sink.send(vec![response]).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::MockBridge;
    use crate::host::StaticHostIntrospection;
    use crate::vm::config::{KvmConfig, VariantConfig};
    use crate::vm::driver::{LaunchedProcess, VmDriver};

    struct NoPeers;
    #[async_trait]
    impl MeshFanout for NoPeers {
        fn peers(&self) -> Vec<String> {
            Vec::new()
        }
        async fn send_command(&self, _host: &str, _cmd: &Command) -> Result<ResponseSet> {
            Ok(Vec::new())
        }
    }

    struct FakeDriver;
    #[async_trait]
    impl VmDriver for FakeDriver {
        async fn start(&self, _: &std::path::Path, _: &crate::vm::config::VmConfig) -> Result<LaunchedProcess> {
            Ok(LaunchedProcess { pid: 42 })
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
        async fn is_alive(&self, _: u32) -> bool {
            true
        }
    }

    fn make_state(tmp: &std::path::Path) -> Arc<AppState> {
        Arc::new(AppState::new(
            "h0",
            tmp.to_path_buf(),
            Arc::new(FakeDriver),
            Arc::new(FakeDriver),
            Arc::new(MockBridge::default()),
            Arc::new(StaticHostIntrospection { stats: Default::default() }),
        ))
    }

    #[test]
    fn parse_net_spec_reads_vlan_or_alias() {
        let net = parse_net_spec("DMZ,ovsbr0".to_string());
        assert_eq!(net.alias, "DMZ");
        assert_eq!(net.bridge, "ovsbr0");

        let net = parse_net_spec("200".to_string());
        assert_eq!(net.vlan, 200);
    }

    #[tokio::test]
    async fn launch_then_info_reports_the_new_vm() {
        let tmp = tempfile::tempdir().unwrap();
        let state = make_state(tmp.path());
        state.pending_config.lock().unwrap().variant = VariantConfig::Kvm(KvmConfig { disks: vec!["d.img".into()], ..Default::default() });

        let launch = LaunchHandler { state: state.clone(), mesh: Arc::new(NoPeers) };
        let (tx, mut rx) = mpsc::channel(8);
        let cmd = Command { list_args: std::collections::HashMap::from([("names".to_string(), vec!["box1".to_string()])]), ..Default::default() };
        launch.call(cmd, tx).await.unwrap();
        let rs = rx.recv().await.unwrap();
        assert!(rs[0].is_ok());

        let info = InfoHandler { state: state.clone() };
        let (tx, mut rx) = mpsc::channel(8);
        info.call(Command::default(), tx).await.unwrap();
        let rs = rx.recv().await.unwrap();
        assert_eq!(rs[0].tabular.len(), 1);
        assert_eq!(rs[0].tabular[0][1], "box1");
    }

    #[tokio::test]
    async fn launch_resolves_network_alias_to_a_vlan() {
        let tmp = tempfile::tempdir().unwrap();
        let state = make_state(tmp.path());
        state.pending_config.lock().unwrap().variant = VariantConfig::Kvm(KvmConfig { disks: vec!["d.img".into()], ..Default::default() });
        state.pending_config.lock().unwrap().base.networks = vec![crate::vm::config::NetConfig { alias: "DMZ".to_string(), ..Default::default() }];

        let launch = LaunchHandler { state: state.clone(), mesh: Arc::new(NoPeers) };
        let (tx, mut rx) = mpsc::channel(8);
        let cmd = Command { list_args: std::collections::HashMap::from([("names".to_string(), vec!["box1".to_string()])]), ..Default::default() };
        launch.call(cmd, tx).await.unwrap();
        let rs = rx.recv().await.unwrap();
        assert!(rs[0].is_ok());

        let namespaces = state.namespaces.lock().await;
        let namespace = namespaces.get(&crate::namespace::DEFAULT_NAMESPACE.to_string()).unwrap();
        assert_eq!(namespace.vlans.aliases.get("DMZ"), Some(&101));
    }

    #[tokio::test]
    async fn kill_unknown_target_reports_vm_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let state = make_state(tmp.path());
        let kill = KillHandler { state: state.clone() };
        let (tx, mut rx) = mpsc::channel(8);
        let cmd = Command { string_args: std::collections::HashMap::from([("target".to_string(), "ghost".to_string())]), ..Default::default() };
        let err = kill.call(cmd, tx).await.unwrap_err();
        assert!(err.is_vm_not_found());
        drop(rx);
    }
}
