//! End-to-end scenarios driving the real command pipeline: lex -> compile
//! -> dispatch -> handler -> response, against an in-process single host.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use vmesh::bridge::MockBridge;
use vmesh::command::{compile, Command, NoopPreprocessor};
use vmesh::dispatcher::{DispatchRequest, Dispatcher, HandlerTable, MeshFanout};
use vmesh::error::Result;
use vmesh::handlers::{self, AppState};
use vmesh::host::StaticHostIntrospection;
use vmesh::response::ResponseSet;
use vmesh::vm::config::VmConfig;
use vmesh::vm::driver::{LaunchedProcess, VmDriver};

struct FakeDriver;

#[async_trait]
impl VmDriver for FakeDriver {
    async fn start(&self, _: &std::path::Path, _: &VmConfig) -> Result<LaunchedProcess> {
        Ok(LaunchedProcess { pid: 4242 })
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

fn single_host() -> (Arc<AppState>, Arc<HandlerTable>) {
    let tmp = tempfile::tempdir().unwrap();
    let state = Arc::new(AppState::new(
        "h0",
        tmp.path().to_path_buf(),
        Arc::new(FakeDriver),
        Arc::new(FakeDriver),
        Arc::new(MockBridge::default()),
        Arc::new(StaticHostIntrospection { stats: Default::default() }),
    ));
    let mut table = HandlerTable::new();
    handlers::register_all(&mut table, state.clone(), Arc::new(NoPeers));
    (state, Arc::new(table))
}

async fn run(dispatcher: &Dispatcher, table: &HandlerTable, preprocessor: &dyn vmesh::command::Preprocessor, line: &str) -> ResponseSet {
    let cmd = compile(table.registry(), line, false, preprocessor).await.unwrap();
    let (tx, mut rx) = mpsc::channel(8);
    dispatcher.submit(DispatchRequest { commands: vec![cmd], out: tx }).await.unwrap();
    let mut merged = ResponseSet::new();
    while let Some(rs) = rx.recv().await {
        merged.extend(rs);
    }
    merged
}

/// Scenario 1: launch and inspect.
#[tokio::test]
async fn launch_and_inspect_reports_the_new_vm() {
    let (_state, table) = single_host();
    let dispatcher = Dispatcher::spawn(table.clone());
    let pre = NoopPreprocessor;

    run(&dispatcher, &table, &pre, "vm config memory 512").await;
    run(&dispatcher, &table, &pre, "vm config disks d.img").await;
    run(&dispatcher, &table, &pre, "vm config networks 100").await;
    run(&dispatcher, &table, &pre, "vm launch kvm foo").await;

    let info = run(&dispatcher, &table, &pre, "vm info").await;
    assert_eq!(info[0].tabular.len(), 1);
    assert_eq!(info[0].tabular[0][1], "foo");
    assert_eq!(info[0].tabular[0][0], "0");
}

/// Scenario 3: alias allocation is idempotent and starts at the bottom of
/// the default range.
#[tokio::test]
async fn network_alias_allocates_from_the_bottom_of_the_range_once() {
    let (state, table) = single_host();
    let dispatcher = Dispatcher::spawn(table.clone());
    let pre = NoopPreprocessor;

    run(&dispatcher, &table, &pre, "vm config disks d.img").await;
    run(&dispatcher, &table, &pre, "vm config networks DMZ").await;
    run(&dispatcher, &table, &pre, "vm launch kvm v1").await;

    let namespaces = state.namespaces.lock().await;
    let namespace = namespaces.get(vmesh::namespace::DEFAULT_NAMESPACE).unwrap();
    assert_eq!(namespace.vlans.aliases.get("DMZ"), Some(&101));
    drop(namespaces);

    // Re-running "vm config networks DMZ" plus another launch must not move
    // the already-allocated alias.
    run(&dispatcher, &table, &pre, "vm config networks DMZ").await;
    run(&dispatcher, &table, &pre, "vm launch kvm v2").await;
    let namespaces = state.namespaces.lock().await;
    let namespace = namespaces.get(vmesh::namespace::DEFAULT_NAMESPACE).unwrap();
    assert_eq!(namespace.vlans.aliases.get("DMZ"), Some(&101));
    assert_eq!(namespace.vlans.aliases.len(), 1);
}

/// Scenario 6: ambiguity. Two overlapping patterns; the shorter input that
/// can only ever be a prefix match is ambiguous, the exact literal wins.
#[tokio::test]
async fn ambiguous_prefix_fails_exact_literal_succeeds() {
    let mut table = HandlerTable::new();
    table.register(vmesh::pattern::Pattern::parse("vm info").unwrap(), Arc::new(EchoHandler));
    table.register(vmesh::pattern::Pattern::parse("vm info search <q>").unwrap(), Arc::new(EchoHandler));
    let pre = NoopPreprocessor;

    let err = compile(&table.registry(), "vm info search", false, &pre).await.unwrap_err();
    assert!(matches!(err, vmesh::error::Error::NoMatch) || matches!(err, vmesh::error::Error::Ambiguous(_)));

    let cmd = compile(&table.registry(), "vm info", false, &pre).await.unwrap();
    assert_eq!(cmd.original, "vm info");
}

struct EchoHandler;

#[async_trait]
impl vmesh::dispatcher::Handler for EchoHandler {
    async fn call(&self, cmd: Command, sink: mpsc::Sender<ResponseSet>) -> Result<()> {
        let _ = sink.send(vec![vmesh::response::Response::ok("h0", cmd.original.clone())]).await;
        Ok(())
    }
}
