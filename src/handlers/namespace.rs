//! Namespace switch/list/clear handlers (spec §3 `Namespace`, §4.8).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::command::Command;
use crate::dispatcher::Handler;
use crate::error::Result;
use crate::handlers::state::AppState;
use crate::namespace::{Namespace, DEFAULT_NAMESPACE};
use crate::response::{Response, ResponseSet};

/// `namespace <name>`: switch the active namespace, creating it lazily if
/// it doesn't exist yet.
pub struct SwitchHandler {
    pub state: Arc<AppState>,
}

#[async_trait]
impl Handler for SwitchHandler {
    async fn call(&self, cmd: Command, sink: mpsc::Sender<ResponseSet>) -> Result<()> {
        let name = cmd.string_args.get("name").cloned().unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        self.state.ensure_namespace(&name).await;
        *self.state.active_namespace.lock().unwrap() = name.clone();
        let _ = sink.send(vec![Response::ok(self.state.hostname.clone(), name)]).await;
        Ok(())
    }
}

/// Bare `namespace`: report the active namespace's name.
pub struct ShowHandler {
    pub state: Arc<AppState>,
}

#[async_trait]
impl Handler for ShowHandler {
    async fn call(&self, _cmd: Command, sink: mpsc::Sender<ResponseSet>) -> Result<()> {
        let name = self.state.active_namespace_name();
        let _ = sink.send(vec![Response::ok(self.state.hostname.clone(), name)]).await;
        Ok(())
    }
}

/// `clear namespace <name>`: kill and flush every VM in `name`. The default
/// namespace is never removed from the table, only emptied; any other
/// namespace is dropped outright, falling back the active namespace to
/// default if it was the one cleared.
pub struct ClearHandler {
    pub state: Arc<AppState>,
}

#[async_trait]
impl Handler for ClearHandler {
    async fn call(&self, cmd: Command, sink: mpsc::Sender<ResponseSet>) -> Result<()> {
        let name = cmd.string_args.get("name").cloned().unwrap_or_else(|| self.state.active_namespace_name());

        let mut namespaces = self.state.namespaces.lock().await;
        if let Some(namespace) = namespaces.get(&name) {
            for handle in namespace.vms.values() {
                let _ = handle.kill().await;
                let _ = handle.flush().await;
            }
        }

        if name == DEFAULT_NAMESPACE {
            namespaces.insert(name.clone(), Namespace::new(DEFAULT_NAMESPACE, self.state.base_dir.clone()));
        } else {
            namespaces.remove(&name);
        }
        drop(namespaces);

        let mut active = self.state.active_namespace.lock().unwrap();
        if *active == name && name != DEFAULT_NAMESPACE {
            *active = DEFAULT_NAMESPACE.to_string();
        }
        drop(active);

        let _ = sink.send(vec![Response::ok(self.state.hostname.clone(), "")]).await;
        Ok(())
    }
}

/// `namespace <name> vlans add <alias> <vlan>`: adopt a vlan number a peer
/// already allocated for `alias`, rather than allocating independently
/// (spec §4.8: "first allocation triggers a best-effort broadcast" so every
/// host converges on the same vlan for a given alias).
pub struct VlansAddHandler {
    pub state: Arc<AppState>,
}

#[async_trait]
impl Handler for VlansAddHandler {
    async fn call(&self, cmd: Command, sink: mpsc::Sender<ResponseSet>) -> Result<()> {
        let name = cmd.string_args.get("name").cloned().unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        let alias = cmd.string_args.get("alias").cloned().unwrap_or_default();
        let vlan: i32 = cmd.string_args.get("vlan").and_then(|s| s.parse().ok()).unwrap_or_default();

        self.state.ensure_namespace(&name).await;
        let mut namespaces = self.state.namespaces.lock().await;
        let namespace = namespaces.get_mut(&name).expect("namespace just ensured");
        namespace.vlans.aliases.insert(alias, vlan);
        let _ = namespace.vlans.persist(&self.state.base_dir.join("namespaces").join(&name)).await;
        drop(namespaces);

        let _ = sink.send(vec![Response::ok(self.state.hostname.clone(), "")]).await;
        Ok(())
    }
}
