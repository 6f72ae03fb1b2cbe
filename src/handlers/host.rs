//! `host`: render local host stats (spec §3 `HostStats`, Component L).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::command::Command;
use crate::dispatcher::Handler;
use crate::error::Result;
use crate::handlers::state::AppState;
use crate::response::{Response, ResponseSet};

pub struct HostHandler {
    pub state: Arc<AppState>,
}

#[async_trait]
impl Handler for HostHandler {
    async fn call(&self, _cmd: Command, sink: mpsc::Sender<ResponseSet>) -> Result<()> {
        let ns_name = self.state.active_namespace_name();
        let vm_count = {
            let namespaces = self.state.namespaces.lock().await;
            namespaces.get(&ns_name).map(|ns| ns.vms.len() as u32).unwrap_or(0)
        };

        let stats = self.state.host_introspection.stats(&self.state.hostname, vm_count, -1).await?;
        let row = vec![
            stats.name,
            stats.cpus.to_string(),
            stats.mem_total_mb.to_string(),
            stats.mem_used_mb.to_string(),
            format!("{:.2} {:.2} {:.2}", stats.load.0, stats.load.1, stats.load.2),
            stats.uptime_secs.to_string(),
            stats.vms.to_string(),
        ];
        let response = Response {
            host: self.state.hostname.clone(),
            header: vec![
                "host".to_string(),
                "cpus".to_string(),
                "memTotalMB".to_string(),
                "memUsedMB".to_string(),
                "load".to_string(),
                "uptime".to_string(),
                "vms".to_string(),
            ],
            tabular: vec![row],
            ..Default::default()
        };
        let _ = sink.send(vec![response]).await;
        Ok(())
    }
}
