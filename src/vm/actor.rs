//! Per-VM actor: a mailbox serialising `{launch, kill, stop, start, flush,
//! info, net-connect, net-disconnect}` requests, replacing the
//! mutex+condvar pair named in spec §9 without exposing them to callers.
//! `Kill` becomes "send kill, await reply".

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::bridge::Bridge;
use crate::error::Result;
use crate::vm::driver::VmDriver;
use crate::vm::{lifecycle, Vm};

enum Request {
    Launch(oneshot::Sender<Result<()>>),
    Start(oneshot::Sender<Result<()>>),
    Stop(oneshot::Sender<Result<()>>),
    Kill(oneshot::Sender<Result<()>>),
    Flush(oneshot::Sender<Result<()>>),
    Info(oneshot::Sender<Vm>),
    NetConnect(usize, i32, oneshot::Sender<Result<()>>),
    NetDisconnect(usize, oneshot::Sender<Result<()>>),
}

/// A handle to a running VM actor. Cloning shares the same mailbox, so
/// multiple handlers may hold a reference to one VM.
#[derive(Clone)]
pub struct VmHandle {
    tx: mpsc::Sender<Request>,
}

impl VmHandle {
    pub fn spawn(vm: Vm, driver: Arc<dyn VmDriver>, bridge: Arc<dyn Bridge>) -> Self {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(run(vm, driver, bridge, rx));
        Self { tx }
    }

    pub async fn launch(&self) -> Result<()> {
        self.call(Request::Launch).await
    }

    pub async fn start(&self) -> Result<()> {
        self.call(Request::Start).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.call(Request::Stop).await
    }

    pub async fn kill(&self) -> Result<()> {
        self.call(Request::Kill).await
    }

    pub async fn flush(&self) -> Result<()> {
        self.call(Request::Flush).await
    }

    pub async fn net_connect(&self, index: usize, vlan: i32) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(Request::NetConnect(index, vlan, reply_tx)).await;
        reply_rx.await.map_err(|_| crate::error::Error::Fatal("VM actor gone".to_string()))?
    }

    pub async fn net_disconnect(&self, index: usize) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(Request::NetDisconnect(index, reply_tx)).await;
        reply_rx.await.map_err(|_| crate::error::Error::Fatal("VM actor gone".to_string()))?
    }

    pub async fn info(&self) -> Result<Vm> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(Request::Info(reply_tx)).await;
        reply_rx.await.map_err(|_| crate::error::Error::Fatal("VM actor gone".to_string()))
    }

    async fn call(&self, make: impl FnOnce(oneshot::Sender<Result<()>>) -> Request) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(make(reply_tx)).await;
        reply_rx.await.map_err(|_| crate::error::Error::Fatal("VM actor gone".to_string()))?
    }
}

async fn run(mut vm: Vm, driver: Arc<dyn VmDriver>, bridge: Arc<dyn Bridge>, mut rx: mpsc::Receiver<Request>) {
    while let Some(req) = rx.recv().await {
        match req {
            Request::Launch(reply) => {
                let _ = reply.send(lifecycle::launch(&mut vm, &driver, &bridge).await);
            }
            Request::Start(reply) => {
                let _ = reply.send(lifecycle::start(&mut vm, &driver, &bridge).await);
            }
            Request::Stop(reply) => {
                let _ = reply.send(lifecycle::stop(&mut vm, &driver).await);
            }
            Request::Kill(reply) => {
                let _ = reply.send(lifecycle::kill(&mut vm, &driver, &bridge).await);
            }
            Request::Flush(reply) => {
                let _ = reply.send(lifecycle::flush(&vm).await);
            }
            Request::Info(reply) => {
                let _ = reply.send(vm.clone());
            }
            Request::NetConnect(index, vlan, reply) => {
                let _ = reply.send(lifecycle::net_connect(&mut vm, &bridge, index, vlan).await);
            }
            Request::NetDisconnect(index, reply) => {
                let _ = reply.send(lifecycle::net_disconnect(&mut vm, &bridge, index).await);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::MockBridge;
    use crate::vm::config::{KvmConfig, VariantConfig, VmConfig};
    use crate::vm::driver::{LaunchedProcess, VmDriver};
    use async_trait::async_trait;

    struct FakeDriver;
    #[async_trait]
    impl VmDriver for FakeDriver {
        async fn start(&self, _: &std::path::Path, _: &VmConfig) -> Result<LaunchedProcess> {
            Ok(LaunchedProcess { pid: 99 })
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

    #[tokio::test]
    async fn launch_then_info_reflects_running_state() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = VmConfig::new(VariantConfig::Kvm(KvmConfig { disks: vec!["d.img".into()], ..Default::default() }));
        let vm = Vm::new(1, Some("foo".to_string()), "default", "h0", tmp.path(), cfg);
        let handle = VmHandle::spawn(vm, Arc::new(FakeDriver), Arc::new(MockBridge::default()));

        handle.launch().await.unwrap();
        let info = handle.info().await.unwrap();
        assert_eq!(info.state, crate::vm::State::Running);
        assert_eq!(info.pid, Some(99));
    }

    #[tokio::test]
    async fn kill_transitions_to_quit() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = VmConfig::new(VariantConfig::Kvm(KvmConfig { disks: vec!["d.img".into()], ..Default::default() }));
        let vm = Vm::new(2, Some("bar".to_string()), "default", "h0", tmp.path(), cfg);
        let handle = VmHandle::spawn(vm, Arc::new(FakeDriver), Arc::new(MockBridge::default()));

        handle.launch().await.unwrap();
        handle.kill().await.unwrap();
        let info = handle.info().await.unwrap();
        assert_eq!(info.state, crate::vm::State::Quit);
    }
}
