//! External process supervision (SPEC_FULL.md supplement: the hypervisor
//! and container drivers are out of scope per spec §1, so the lifecycle
//! manager only needs a thin capability for starting/stopping/probing the
//! external process rather than an embedded VMM).

use async_trait::async_trait;
use std::path::Path;

use crate::error::{Error, Result};
use crate::vm::config::VmConfig;

/// What the lifecycle manager needs from the external supervisor for one
/// launched instance.
pub struct LaunchedProcess {
    pub pid: u32,
}

/// Supervises the external process backing a VM (`qemu-system-*` for kvm,
/// a container-namespace wrapper for container). The core never links
/// against KVM or namespace APIs directly; it shells out and tracks the
/// resulting PID, matching spec §1's "treated as opaque" scoping.
#[async_trait]
pub trait VmDriver: Send + Sync {
    async fn start(&self, instance_path: &Path, config: &VmConfig) -> Result<LaunchedProcess>;
    async fn stop(&self, pid: u32) -> Result<()>;
    async fn pause(&self, pid: u32) -> Result<()>;
    async fn resume(&self, pid: u32) -> Result<()>;
    async fn kill(&self, pid: u32) -> Result<()>;
    /// True if the process table still holds this pid (spec §4.9 recovery
    /// probe: "match `qemu-system-*` argv for `-name` and `-uuid`").
    async fn is_alive(&self, pid: u32) -> bool;
}

/// Shells out to `qemu-system-x86_64`.
pub struct QemuDriver {
    pub binary: String,
}

impl Default for QemuDriver {
    fn default() -> Self {
        Self { binary: "qemu-system-x86_64".to_string() }
    }
}

#[async_trait]
impl VmDriver for QemuDriver {
    async fn start(&self, instance_path: &Path, config: &VmConfig) -> Result<LaunchedProcess> {
        let crate::vm::config::VariantConfig::Kvm(kvm) = &config.variant else {
            return Err(Error::Grammar("QemuDriver requires a kvm variant config".to_string()));
        };

        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.arg("-m").arg(config.base.memory_mb.to_string());
        cmd.arg("-smp").arg(config.base.vcpus.to_string());
        cmd.arg("-pidfile").arg(instance_path.join("qemu.pid"));
        for disk in &kvm.disks {
            cmd.arg("-drive").arg(format!("file={disk}"));
        }
        if let Some(kernel) = &kvm.kernel {
            cmd.arg("-kernel").arg(kernel);
        }

        let child = cmd.spawn().map_err(|e| Error::NoSuchProcess(format!("{}: {e}", self.binary)))?;
        let pid = child.id().ok_or_else(|| Error::Host("process exited immediately".to_string()))?;
        Ok(LaunchedProcess { pid })
    }

    async fn stop(&self, pid: u32) -> Result<()> {
        send_signal(pid, "STOP")
    }

    async fn pause(&self, pid: u32) -> Result<()> {
        send_signal(pid, "STOP")
    }

    async fn resume(&self, pid: u32) -> Result<()> {
        send_signal(pid, "CONT")
    }

    async fn kill(&self, pid: u32) -> Result<()> {
        send_signal(pid, "TERM")
    }

    async fn is_alive(&self, pid: u32) -> bool {
        #[cfg(target_os = "linux")]
        {
            nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = pid;
            false
        }
    }
}

#[cfg(target_os = "linux")]
fn send_signal(pid: u32, which: &str) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let signal = match which {
        "STOP" => Signal::SIGSTOP,
        "CONT" => Signal::SIGCONT,
        "TERM" => Signal::SIGTERM,
        _ => unreachable!(),
    };
    kill(Pid::from_raw(pid as i32), signal).map_err(|e| Error::NoSuchProcess(format!("pid {pid}: {e}")))
}

#[cfg(not(target_os = "linux"))]
fn send_signal(_pid: u32, _which: &str) -> Result<()> {
    Err(Error::Host("process signalling only supported on linux".to_string()))
}

/// Shells a container runtime entry point (namespace/cgroup setup happens
/// in the external helper, not here).
pub struct ContainerDriver {
    pub helper_binary: String,
}

impl Default for ContainerDriver {
    fn default() -> Self {
        Self { helper_binary: "vmesh-container-init".to_string() }
    }
}

#[async_trait]
impl VmDriver for ContainerDriver {
    async fn start(&self, instance_path: &Path, config: &VmConfig) -> Result<LaunchedProcess> {
        let crate::vm::config::VariantConfig::Container(c) = &config.variant else {
            return Err(Error::Grammar("ContainerDriver requires a container variant config".to_string()));
        };

        let mut cmd = tokio::process::Command::new(&self.helper_binary);
        cmd.arg("--root").arg(&c.filesystem);
        cmd.arg("--pidfile").arg(instance_path.join("container.pid"));
        if !c.init.is_empty() {
            cmd.arg("--").args(&c.init);
        }

        let child = cmd.spawn().map_err(|e| Error::NoSuchProcess(format!("{}: {e}", self.helper_binary)))?;
        let pid = child.id().ok_or_else(|| Error::Host("process exited immediately".to_string()))?;
        Ok(LaunchedProcess { pid })
    }

    async fn stop(&self, pid: u32) -> Result<()> {
        send_signal(pid, "STOP")
    }

    async fn pause(&self, pid: u32) -> Result<()> {
        send_signal(pid, "STOP")
    }

    async fn resume(&self, pid: u32) -> Result<()> {
        send_signal(pid, "CONT")
    }

    async fn kill(&self, pid: u32) -> Result<()> {
        send_signal(pid, "TERM")
    }

    async fn is_alive(&self, pid: u32) -> bool {
        #[cfg(target_os = "linux")]
        {
            nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = pid;
            false
        }
    }
}
