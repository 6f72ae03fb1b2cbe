//! Bridge/tap/VLAN capability (spec §1 "Explicitly OUT OF SCOPE": Open
//! vSwitch kernel plumbing is a collaborator, not something this crate
//! implements). Component K narrows that collaborator to the handful of
//! operations the VM lifecycle and recovery actually call.

use async_trait::async_trait;

use crate::error::Result;

/// Capability the core consumes from the networking layer. A production
/// deployment wires `ProcessBridge` (shelling out to `ovs-vsctl`/`ip`);
/// tests use `MockBridge`.
#[async_trait]
pub trait Bridge: Send + Sync {
    async fn add_tap(&self, bridge: &str, tap: &str, vlan: i32) -> Result<()>;
    async fn remove_tap(&self, bridge: &str, tap: &str) -> Result<()>;
    async fn set_vlan(&self, bridge: &str, tap: &str, vlan: i32) -> Result<()>;
    async fn create_bond(&self, bridge: &str, bond_name: &str, interfaces: &[String]) -> Result<()>;
    /// Tear the bridge itself down (spec §5 shutdown: "destroy bridges").
    async fn destroy(&self, bridge: &str) -> Result<()>;
    /// Re-register a tap discovered during recovery without reshaping
    /// packets (spec §4.9: "no packet reshaping").
    async fn recover_tap(&self, bridge: &str, tap: &str, vlan: i32) -> Result<()> {
        self.add_tap(bridge, tap, vlan).await
    }
    async fn recover_bond(&self, bridge: &str, bond_name: &str, interfaces: &[String]) -> Result<()> {
        self.create_bond(bridge, bond_name, interfaces).await
    }
}

/// Shells out to `ovs-vsctl`/`ip` for the real networking layer.
pub struct ProcessBridge {
    pub ovs_vsctl: String,
}

impl Default for ProcessBridge {
    fn default() -> Self {
        Self { ovs_vsctl: "ovs-vsctl".to_string() }
    }
}

#[async_trait]
impl Bridge for ProcessBridge {
    async fn add_tap(&self, bridge: &str, tap: &str, vlan: i32) -> Result<()> {
        run(&self.ovs_vsctl, &["add-port", bridge, tap, "tag", &vlan.to_string()]).await
    }

    async fn remove_tap(&self, bridge: &str, tap: &str) -> Result<()> {
        run(&self.ovs_vsctl, &["del-port", bridge, tap]).await
    }

    async fn set_vlan(&self, bridge: &str, tap: &str, vlan: i32) -> Result<()> {
        run(&self.ovs_vsctl, &["set", "port", tap, &format!("tag={vlan}")]).await
    }

    async fn create_bond(&self, bridge: &str, bond_name: &str, interfaces: &[String]) -> Result<()> {
        let mut args: Vec<&str> = vec!["add-bond", bridge, bond_name];
        for iface in interfaces {
            args.push(iface);
        }
        run(&self.ovs_vsctl, &args).await
    }

    async fn destroy(&self, bridge: &str) -> Result<()> {
        run(&self.ovs_vsctl, &["del-br", bridge]).await
    }
}

async fn run(program: &str, args: &[&str]) -> Result<()> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| crate::error::Error::Bridge(format!("{program} failed to start: {e}")))?;
    if !output.status.success() {
        return Err(crate::error::Error::Bridge(format!(
            "{program} {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

/// In-memory bridge for tests and the single-host demo path.
#[derive(Default)]
pub struct MockBridge {
    pub calls: std::sync::Mutex<Vec<String>>,
}

#[async_trait]
impl Bridge for MockBridge {
    async fn add_tap(&self, bridge: &str, tap: &str, vlan: i32) -> Result<()> {
        self.calls.lock().unwrap().push(format!("add_tap {bridge} {tap} {vlan}"));
        Ok(())
    }

    async fn remove_tap(&self, bridge: &str, tap: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("remove_tap {bridge} {tap}"));
        Ok(())
    }

    async fn set_vlan(&self, bridge: &str, tap: &str, vlan: i32) -> Result<()> {
        self.calls.lock().unwrap().push(format!("set_vlan {bridge} {tap} {vlan}"));
        Ok(())
    }

    async fn create_bond(&self, bridge: &str, bond_name: &str, interfaces: &[String]) -> Result<()> {
        self.calls.lock().unwrap().push(format!("create_bond {bridge} {bond_name} {interfaces:?}"));
        Ok(())
    }

    async fn destroy(&self, bridge: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("destroy {bridge}"));
        Ok(())
    }
}
