//! Per-VM lifecycle operations (spec §4.5). These are plain functions over
//! `&mut Vm` plus the driver/bridge capabilities; `vm::actor` serialises
//! calls into them through the per-VM mailbox.

use std::sync::Arc;

use crate::bridge::Bridge;
use crate::error::{Error, Result};
use crate::vm::driver::VmDriver;
use crate::vm::{State, Vm};

/// Two VMs conflict if they can't coexist on the same host (spec §4.5 step 3).
pub fn conflicts(candidate: &Vm, existing: &Vm) -> Option<ConflictKind> {
    if candidate.name == existing.name || candidate.uuid == existing.uuid {
        return Some(ConflictKind::Fatal(format!("VM {} conflicts with existing VM {}", candidate.name, existing.name)));
    }
    if let (crate::vm::config::VariantConfig::Container(a), crate::vm::config::VariantConfig::Container(b)) =
        (&candidate.config.variant, &existing.config.variant)
    {
        if a.filesystem == b.filesystem && !candidate.config.base.snapshot && !existing.config.base.snapshot {
            return Some(ConflictKind::Fatal(format!(
                "filesystem path {} already in use by VM {} (neither is a snapshot)",
                a.filesystem, existing.name
            )));
        }
    }
    for net_a in &candidate.config.base.networks {
        for net_b in &existing.config.base.networks {
            if net_a.vlan != -1 && net_a.vlan == net_b.vlan && net_a.mac.is_some() && net_a.mac == net_b.mac {
                return Some(ConflictKind::Warning(format!(
                    "duplicate MAC {:?} on vlan {} shared with VM {}",
                    net_a.mac, net_a.vlan, existing.name
                )));
            }
        }
    }
    None
}

pub enum ConflictKind {
    Fatal(String),
    Warning(String),
}

/// Validate a config well-formedness check before launch (spec §4.5 step 1).
pub fn validate_config(vm: &Vm) -> Result<()> {
    match &vm.config.variant {
        crate::vm::config::VariantConfig::Container(c) => {
            if c.filesystem.is_empty() {
                return Err(Error::Conflict("container VM requires a filesystem path".to_string()));
            }
        }
        crate::vm::config::VariantConfig::Kvm(k) => {
            if k.disks.is_empty() && k.kernel.is_none() {
                return Err(Error::Conflict("kvm VM requires at least one disk or a kernel".to_string()));
            }
        }
    }
    for bond in &vm.config.base.bonds {
        bond.validate().map_err(Error::Conflict)?;
    }
    Ok(())
}

/// spec §4.5 step 5: create taps, start the guest process, record state.
pub async fn launch(vm: &mut Vm, driver: &Arc<dyn VmDriver>, bridge: &Arc<dyn Bridge>) -> Result<()> {
    validate_config(vm)?;

    tokio::fs::create_dir_all(&vm.instance_path).await?;

    for (i, net) in vm.config.base.networks.iter_mut().enumerate() {
        if net.vlan == -1 {
            continue;
        }
        let tap = format!("mega_tap{}-{}", vm.id, i);
        bridge.add_tap(&net.bridge, &tap, net.vlan).await?;
        net.tap = tap;
    }

    match driver.start(&vm.instance_path, &vm.config).await {
        Ok(proc) => {
            vm.pid = Some(proc.pid);
            vm.launch_time = Some(chrono::Utc::now());
            vm.set_state(State::Running);
            vm.persist_state().await?;
            Ok(())
        }
        Err(e) => {
            vm.tags.insert("error".to_string(), e.user_message());
            vm.set_state(State::Error);
            for net in &vm.config.base.networks {
                if !net.tap.is_empty() {
                    let _ = bridge.remove_tap(&net.bridge, &net.tap).await;
                }
            }
            vm.persist_state().await?;
            Err(e)
        }
    }
}

/// `Start`: RUNNING is a no-op; QUIT/ERROR re-launches; otherwise resume
/// from PAUSED (spec §4.5).
pub async fn start(vm: &mut Vm, driver: &Arc<dyn VmDriver>, bridge: &Arc<dyn Bridge>) -> Result<()> {
    match vm.state {
        State::Running => Ok(()),
        State::Quit | State::Error => launch(vm, driver, bridge).await,
        State::Paused => {
            let pid = vm.pid.ok_or_else(|| Error::VmStateError)?;
            driver.resume(pid).await?;
            vm.set_state(State::Running);
            vm.persist_state().await
        }
        State::Building => Err(Error::VmStateError),
    }
}

/// `Stop`: RUNNING -> PAUSED (spec §4.5).
pub async fn stop(vm: &mut Vm, driver: &Arc<dyn VmDriver>) -> Result<()> {
    if vm.state != State::Running {
        return Err(Error::VmStateError);
    }
    let pid = vm.pid.ok_or(Error::VmStateError)?;
    driver.stop(pid).await?;
    vm.set_state(State::Paused);
    vm.persist_state().await
}

/// `Kill`: permitted from BUILDING|RUNNING|PAUSED (spec §4.5).
pub async fn kill(vm: &mut Vm, driver: &Arc<dyn VmDriver>, bridge: &Arc<dyn Bridge>) -> Result<()> {
    if !vm.state.is_killable() {
        return Ok(());
    }
    if let Some(pid) = vm.pid {
        driver.kill(pid).await?;
    }
    for net in &vm.config.base.networks {
        if !net.tap.is_empty() {
            bridge.remove_tap(&net.bridge, &net.tap).await?;
        }
    }
    vm.set_state(State::Quit);
    vm.persist_state().await
}

/// `Flush`: only from QUIT|ERROR (spec §4.5). Removes the instance
/// directory; the namespace symlink removal is the caller's responsibility
/// since it doesn't live under this VM's exclusive directory.
pub async fn flush(vm: &Vm) -> Result<()> {
    if !vm.state.is_flush_eligible() {
        return Err(Error::VmStateError);
    }
    if tokio::fs::metadata(&vm.instance_path).await.is_ok() {
        tokio::fs::remove_dir_all(&vm.instance_path).await?;
    }
    Ok(())
}

pub async fn net_connect(vm: &mut Vm, bridge: &Arc<dyn Bridge>, index: usize, vlan: i32) -> Result<()> {
    let net = vm.config.base.networks.get_mut(index).ok_or_else(|| Error::NotFound("no such NIC".to_string()))?;
    if net.tap.is_empty() {
        return Err(Error::VmStateError);
    }
    bridge.set_vlan(&net.bridge, &net.tap, vlan).await?;
    net.vlan = vlan;
    Ok(())
}

pub async fn net_disconnect(vm: &mut Vm, bridge: &Arc<dyn Bridge>, index: usize) -> Result<()> {
    let net = vm.config.base.networks.get_mut(index).ok_or_else(|| Error::NotFound("no such NIC".to_string()))?;
    if !net.tap.is_empty() {
        bridge.set_vlan(&net.bridge, &net.tap, -1).await?;
    }
    net.vlan = -1;
    Ok(())
}
