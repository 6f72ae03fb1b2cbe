//! Process-wide cooperative dispatcher (spec §4.2, Component D).
//!
//! A single consumer task owns the only slot: at most one `{commands, out}`
//! request is ever in flight. Within a request, commands run one after
//! another in order; each handler is free to push any number of
//! ResponseSets onto its sink before the dispatcher moves to the next
//! command.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::command::Command;
use crate::error::{Error, Result};
use crate::lexer::lex;
use crate::registry::Registry;
use crate::response::{Response, ResponseSet};

/// A handler invoked by the dispatcher for one compiled command. Must close
/// `sink` (by dropping it) before returning.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, cmd: Command, sink: mpsc::Sender<ResponseSet>) -> Result<()>;
}

/// Adapts a handler that computes a single `Result<Response>` synchronously
/// into the sink protocol, attaching the local hostname (spec §4.2: "a
/// simple wrapper... attaching the local hostname").
pub struct SimpleHandler<F> {
    pub hostname: String,
    pub f: F,
}

#[async_trait]
impl<F> Handler for SimpleHandler<F>
where
    F: Fn(&Command) -> Result<Response> + Send + Sync,
{
    async fn call(&self, cmd: Command, sink: mpsc::Sender<ResponseSet>) -> Result<()> {
        let response = match (self.f)(&cmd) {
            Ok(mut r) => {
                if r.host.is_empty() {
                    r.host = self.hostname.clone();
                }
                r
            }
            Err(e) => Response::error(self.hostname.clone(), e.user_message()),
        };
        let _ = sink.send(vec![response]).await;
        Ok(())
    }
}

/// Sends a forged command to a peer and collects its reply, and reports the
/// other hosts presently in the active namespace. Implemented by
/// `mesh::transport` against the live peer-to-peer connection; tests use a
/// stub.
#[async_trait]
pub trait MeshFanout: Send + Sync {
    fn peers(&self) -> Vec<String>;
    async fn send_command(&self, host: &str, cmd: &Command) -> Result<ResponseSet>;
}

/// Fans a broadcast-eligible command out to every other host in the active
/// namespace, running the local leg in parallel (spec §4.2 policy 1).
pub struct BroadcastHandler {
    pub inner: Arc<dyn Handler>,
    pub mesh: Arc<dyn MeshFanout>,
    pub namespace: String,
}

#[async_trait]
impl Handler for BroadcastHandler {
    async fn call(&self, cmd: Command, sink: mpsc::Sender<ResponseSet>) -> Result<()> {
        if !cmd.is_broadcastable() {
            return self.inner.call(cmd, sink).await;
        }

        let merged = fan_out(&self.inner, &self.mesh, &self.namespace, &cmd).await?;
        let _ = sink.send(merged).await;
        Ok(())
    }
}

/// Same fan-out as [`BroadcastHandler`], but swallows successful-empty and
/// "vm not found" legs from hosts that don't own the target VM (spec §4.2
/// policy 2).
pub struct VmTargetHandler {
    pub inner: Arc<dyn Handler>,
    pub mesh: Arc<dyn MeshFanout>,
    pub namespace: String,
}

#[async_trait]
impl Handler for VmTargetHandler {
    async fn call(&self, cmd: Command, sink: mpsc::Sender<ResponseSet>) -> Result<()> {
        if !cmd.is_broadcastable() {
            return self.inner.call(cmd, sink).await;
        }

        let merged = fan_out(&self.inner, &self.mesh, &self.namespace, &cmd).await?;
        let filtered = swallow_vm_target_noise(merged);
        let _ = sink.send(filtered).await;
        Ok(())
    }
}

async fn fan_out(
    inner: &Arc<dyn Handler>,
    mesh: &Arc<dyn MeshFanout>,
    namespace: &str,
    cmd: &Command,
) -> Result<ResponseSet> {
    let (local_tx, mut local_rx) = mpsc::channel(8);
    let local_cmd = cmd.clone();
    let inner = inner.clone();
    let local_task = tokio::spawn(async move { inner.call(local_cmd, local_tx).await });

    let mut remote: ResponseSet = Vec::new();
    for peer in mesh.peers() {
        let mut forged = cmd.clone();
        forged.original = format!("namespace \"{namespace}\" {}", cmd.original);
        forged.source = namespace.to_string();
        forged.record = false;
        match mesh.send_command(&peer, &forged).await {
            Ok(rs) => remote.extend(rs),
            Err(e) => remote.push(Response::error(peer, e.user_message())),
        }
    }

    let mut merged: ResponseSet = Vec::new();
    while let Some(rs) = local_rx.recv().await {
        merged.extend(rs);
    }
    local_task.await.map_err(|e| Error::Fatal(format!("local dispatch leg panicked: {e}")))??;
    merged.extend(remote);
    Ok(merged)
}

fn swallow_vm_target_noise(responses: ResponseSet) -> ResponseSet {
    let total = responses.len();
    let mut not_found = Vec::new();
    let mut real_errors = Vec::new();
    let mut kept = Vec::new();

    for r in responses {
        if !r.error.is_empty() {
            if r.error == "vm not found" {
                not_found.push(r);
            } else {
                real_errors.push(r);
            }
        } else if !r.response.is_empty() || !r.tabular.is_empty() {
            kept.push(r);
        }
        // else: a successful-but-empty response is swallowed.
    }

    if !real_errors.is_empty() {
        let mut out = kept;
        out.extend(real_errors);
        return out;
    }

    if !not_found.is_empty() && not_found.len() == total {
        return vec![not_found.into_iter().next().unwrap()];
    }

    kept
}

/// Maps compiled commands back to the handler that should run them, by
/// recompiling `original` against the trie (spec §4.4: the mesh receiver
/// "compiles original again").
#[derive(Default)]
pub struct HandlerTable {
    registry: Registry,
    handlers: Vec<Arc<dyn Handler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pattern: crate::pattern::Pattern, handler: Arc<dyn Handler>) {
        let id = self.registry.register(pattern);
        debug_assert_eq!(id, self.handlers.len());
        self.handlers.push(handler);
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn resolve(&self, cmd: &Command) -> Result<Arc<dyn Handler>> {
        let tokens = lex(&cmd.original)?;
        let matched = self.registry.resolve(&tokens)?;
        Ok(self.handlers[matched.id].clone())
    }
}

/// One unit of work submitted to the dispatcher: a batch of already
/// compiled commands and the channel their ResponseSets stream into.
pub struct DispatchRequest {
    pub commands: Vec<Command>,
    pub out: mpsc::Sender<ResponseSet>,
}

/// The single-consumer serializer. Only one request is processed at a
/// time; additional `submit` calls queue behind it via the bounded channel.
pub struct Dispatcher {
    tx: mpsc::Sender<DispatchRequest>,
}

impl Dispatcher {
    pub fn spawn(handlers: Arc<HandlerTable>) -> Self {
        let (tx, mut rx) = mpsc::channel::<DispatchRequest>(1);
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                process_request(&handlers, request).await;
            }
        });
        Self { tx }
    }

    pub async fn submit(&self, request: DispatchRequest) -> Result<()> {
        self.tx.send(request).await.map_err(|_| Error::Fatal("dispatcher loop stopped".to_string()))
    }
}

async fn process_request(handlers: &HandlerTable, request: DispatchRequest) {
    for cmd in request.commands {
        if cmd.nop {
            continue;
        }
        match handlers.resolve(&cmd) {
            Ok(handler) => {
                if let Err(e) = handler.call(cmd, request.out.clone()).await {
                    let _ = request.out.send(vec![Response::error("", e.user_message())]).await;
                }
            }
            Err(e) => {
                let _ = request.out.send(vec![Response::error("", e.user_message())]).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::Pattern;

    struct EchoHandler;
    #[async_trait]
    impl Handler for EchoHandler {
        async fn call(&self, cmd: Command, sink: mpsc::Sender<ResponseSet>) -> Result<()> {
            let _ = sink.send(vec![Response::ok("local", cmd.original.clone())]).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatcher_runs_a_simple_handler() {
        let mut table = HandlerTable::new();
        table.register(Pattern::parse("vm info").unwrap(), Arc::new(EchoHandler));
        let dispatcher = Dispatcher::spawn(Arc::new(table));

        let (out_tx, mut out_rx) = mpsc::channel(8);
        let cmd = Command { original: "vm info".to_string(), record: true, ..Default::default() };
        dispatcher.submit(DispatchRequest { commands: vec![cmd], out: out_tx }).await.unwrap();

        let rs = out_rx.recv().await.unwrap();
        assert_eq!(rs[0].response, "vm info");
    }

    struct StubMesh {
        peers: Vec<String>,
        replies: HashMap<String, ResponseSet>,
    }

    #[async_trait]
    impl MeshFanout for StubMesh {
        fn peers(&self) -> Vec<String> {
            self.peers.clone()
        }
        async fn send_command(&self, host: &str, _cmd: &Command) -> Result<ResponseSet> {
            Ok(self.replies.get(host).cloned().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn broadcast_handler_merges_local_and_remote_legs() {
        let mesh = Arc::new(StubMesh {
            peers: vec!["h2".to_string()],
            replies: HashMap::from([("h2".to_string(), vec![Response::ok("h2", "remote")])]),
        });
        let handler = BroadcastHandler { inner: Arc::new(EchoHandler), mesh, namespace: "minimega".to_string() };

        let (tx, mut rx) = mpsc::channel(8);
        let cmd = Command { original: "vm info".to_string(), ..Default::default() };
        handler.call(cmd, tx).await.unwrap();
        let rs = rx.recv().await.unwrap();
        assert_eq!(rs.len(), 2);
        assert!(rs.iter().any(|r| r.host == "local"));
        assert!(rs.iter().any(|r| r.host == "h2"));
    }

    #[tokio::test]
    async fn sourced_command_does_not_rebroadcast() {
        let mesh = Arc::new(StubMesh { peers: vec!["h2".to_string()], replies: HashMap::new() });
        let handler = BroadcastHandler { inner: Arc::new(EchoHandler), mesh, namespace: "minimega".to_string() };

        let (tx, mut rx) = mpsc::channel(8);
        let cmd = Command { original: "vm info".to_string(), source: "minimega".to_string(), ..Default::default() };
        handler.call(cmd, tx).await.unwrap();
        let rs = rx.recv().await.unwrap();
        assert_eq!(rs.len(), 1);
        assert_eq!(rs[0].host, "local");
    }

    #[test]
    fn swallow_drops_empty_success_and_not_found() {
        let responses = vec![
            Response::ok("h1", ""),
            Response::error("h2", "vm not found"),
            Response::ok("h3", "box1 RUNNING"),
        ];
        let out = swallow_vm_target_noise(responses);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].host, "h3");
    }

    #[test]
    fn swallow_surfaces_not_found_when_every_leg_misses() {
        let responses = vec![Response::error("h1", "vm not found"), Response::error("h2", "vm not found")];
        let out = swallow_vm_target_noise(responses);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].error, "vm not found");
    }

    #[test]
    fn swallow_surfaces_real_errors() {
        let responses = vec![Response::error("h1", "vm not found"), Response::error("h2", "disk full")];
        let out = swallow_vm_target_noise(responses);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].error, "disk full");
    }
}
