//! Built-in command handlers and the state they share (spec §4.2, §4.5,
//! §4.6, §4.8).

pub mod host;
pub mod namespace;
pub mod state;
pub mod vm;

use std::sync::Arc;

pub use state::AppState;

use crate::dispatcher::{BroadcastHandler, Handler, HandlerTable, MeshFanout, VmTargetHandler};
use crate::pattern::Pattern;

/// Register every built-in pattern against its handler. VM-target ops fan
/// out and swallow per-host "vm not found" noise (spec §4.2 policy 2);
/// namespace-wide listings fan out and merge every leg's reply (policy 1);
/// pure config-mutation handlers stay local since they only touch
/// `pending_config`, which has no meaning on another host.
pub fn register_all(table: &mut HandlerTable, state: Arc<AppState>, mesh: Arc<dyn MeshFanout>) {
    let namespace = state.active_namespace_name();

    let broadcast = |inner: Arc<dyn Handler>| -> Arc<dyn Handler> {
        Arc::new(BroadcastHandler { inner, mesh: mesh.clone(), namespace: namespace.clone() })
    };
    let vm_target = |inner: Arc<dyn Handler>| -> Arc<dyn Handler> {
        Arc::new(VmTargetHandler { inner, mesh: mesh.clone(), namespace: namespace.clone() })
    };

    table.register(pat("vm config <kvm,container>"), Arc::new(vm::config_variant(state.clone())));
    table.register(pat("vm config memory <mb>"), Arc::new(vm::config_memory(state.clone())));
    table.register(pat("vm config vcpus <n>"), Arc::new(vm::config_vcpus(state.clone())));
    table.register(pat("vm config networks <specs>..."), Arc::new(vm::config_networks(state.clone())));
    table.register(pat("vm config disks <paths>..."), Arc::new(vm::config_disks(state.clone())));
    table.register(pat("vm config kernel <path>"), Arc::new(vm::config_kernel(state.clone())));
    table.register(pat("vm config initrd <path>"), Arc::new(vm::config_initrd(state.clone())));
    table.register(pat("vm config append <args>..."), Arc::new(vm::config_append(state.clone())));
    table.register(pat("vm config filesystem <path>"), Arc::new(vm::config_filesystem(state.clone())));
    table.register(pat("vm config init <args>..."), Arc::new(vm::config_init(state.clone())));
    table.register(pat("vm config tag <key> <value>"), Arc::new(vm::config_tag(state.clone())));
    table.register(pat("vm config coschedule <n>"), Arc::new(vm::config_coschedule(state.clone())));
    table.register(pat("vm config clear"), Arc::new(vm::config_clear(state.clone())));

    table.register(
        pat("vm launch <kvm,container> <names>..."),
        broadcast(Arc::new(vm::LaunchHandler { state: state.clone(), mesh: mesh.clone() })),
    );
    table.register(pat("vm start <target>"), vm_target(Arc::new(vm::StartHandler { state: state.clone() })));
    table.register(pat("vm stop <target>"), vm_target(Arc::new(vm::StopHandler { state: state.clone() })));
    table.register(pat("vm kill <target>"), vm_target(Arc::new(vm::KillHandler { state: state.clone() })));
    table.register(pat("vm flush <target>"), vm_target(Arc::new(vm::FlushHandler { state: state.clone() })));
    table.register(pat("vm info"), broadcast(Arc::new(vm::InfoHandler { state: state.clone() })));

    table.register(pat("namespace"), Arc::new(namespace::ShowHandler { state: state.clone() }));
    table.register(pat("namespace <name>"), Arc::new(namespace::SwitchHandler { state: state.clone() }));
    table.register(pat("namespace <name> vlans add <alias> <vlan>"), Arc::new(namespace::VlansAddHandler { state: state.clone() }));
    table.register(pat("clear namespace <name>"), Arc::new(namespace::ClearHandler { state: state.clone() }));

    table.register(pat("host"), broadcast(Arc::new(host::HostHandler { state })));
}

fn pat(spec: &str) -> Pattern {
    Pattern::parse(spec).unwrap_or_else(|e| panic!("invalid built-in pattern {spec:?}: {e}"))
}
