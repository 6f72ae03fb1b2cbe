//! VM lifecycle manager (spec §3 `VM`, §4.5, Component F).

pub mod actor;
pub mod config;
pub mod driver;
pub mod lifecycle;

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};
use config::VmConfig;

/// spec §3: `state ∈ {BUILDING, RUNNING, PAUSED, QUIT, ERROR}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Building,
    Running,
    Paused,
    Quit,
    Error,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Building => "BUILDING",
            State::Running => "RUNNING",
            State::Paused => "PAUSED",
            State::Quit => "QUIT",
            State::Error => "ERROR",
        }
    }

    /// A VM in this state has never run (spec §3 invariant).
    pub fn never_run(&self) -> bool {
        matches!(self, State::Building)
    }

    /// Killable-no-more but flush-eligible (spec §3 invariant).
    pub fn is_killable(&self) -> bool {
        matches!(self, State::Building | State::Running | State::Paused)
    }

    pub fn is_flush_eligible(&self) -> bool {
        matches!(self, State::Quit | State::Error)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Words no VM may be named (spec §6: "Reserved words include `\"all\"` and
/// host names").
pub fn is_reserved_word(name: &str, known_hosts: &[String]) -> bool {
    name == "all" || known_hosts.iter().any(|h| h == name)
}

/// VM names must match `[A-Za-z0-9._-]+` and not be a reserved word or a
/// bare integer (spec §3, §6).
pub fn validate_vm_name(name: &str, known_hosts: &[String]) -> Result<()> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) {
        return Err(Error::Grammar(format!("invalid VM name: {name}")));
    }
    if name.parse::<i64>().is_ok() {
        return Err(Error::Grammar(format!("VM name must not be an integer: {name}")));
    }
    if is_reserved_word(name, known_hosts) {
        return Err(Error::Grammar(format!("VM name is a reserved word: {name}")));
    }
    Ok(())
}

/// A VM, polymorphic over the `kvm`/`container` variant via `config`
/// (spec §9: "re-architect as a sum type whose arms own their variant
/// config, with a shared interface").
#[derive(Debug, Clone)]
pub struct Vm {
    pub id: u64,
    pub name: String,
    pub uuid: Uuid,
    pub namespace: String,
    pub host: String,
    pub state: State,
    pub launch_time: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
    pub active_cc: bool,
    pub instance_path: PathBuf,
    pub tags: HashMap<String, String>,
    pub config: VmConfig,
}

impl Vm {
    pub fn new(id: u64, name: Option<String>, namespace: &str, host: &str, base_dir: &std::path::Path, config: VmConfig) -> Self {
        Self {
            id,
            name: name.unwrap_or_else(|| format!("vm-{id}")),
            uuid: Uuid::new_v4(),
            namespace: namespace.to_string(),
            host: host.to_string(),
            state: State::Building,
            launch_time: None,
            pid: None,
            active_cc: false,
            instance_path: base_dir.join(id.to_string()),
            tags: HashMap::new(),
            config,
        }
    }

    pub fn vlans(&self) -> Vec<i32> {
        self.config.base.networks.iter().map(|n| n.vlan).collect()
    }

    /// Write the current state to `<instancePath>/state` (spec §3
    /// invariant: "`state` persisted ... on every transition").
    pub async fn persist_state(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.instance_path).await?;
        tokio::fs::write(self.instance_path.join("state"), self.state.as_str()).await?;
        Ok(())
    }

    pub fn set_state(&mut self, state: State) {
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{KvmConfig, VariantConfig};

    fn make_vm(id: u64, dir: &std::path::Path) -> Vm {
        Vm::new(id, None, "default", "h0", dir, VmConfig::new(VariantConfig::Kvm(KvmConfig::default())))
    }

    #[test]
    fn default_name_uses_id() {
        let tmp = tempfile::tempdir().unwrap();
        let vm = make_vm(3, tmp.path());
        assert_eq!(vm.name, "vm-3");
    }

    #[test]
    fn validate_rejects_reserved_and_integer_names() {
        let hosts = vec!["h0".to_string()];
        assert!(validate_vm_name("all", &hosts).is_err());
        assert!(validate_vm_name("h0", &hosts).is_err());
        assert!(validate_vm_name("42", &hosts).is_err());
        assert!(validate_vm_name("box-1.a", &hosts).is_ok());
    }

    #[test]
    fn state_classification_matches_invariants() {
        assert!(State::Building.never_run());
        assert!(State::Quit.is_flush_eligible());
        assert!(!State::Quit.is_killable());
        assert!(State::Running.is_killable());
    }

    #[tokio::test]
    async fn persist_state_writes_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mut vm = make_vm(1, tmp.path());
        vm.set_state(State::Running);
        vm.persist_state().await.unwrap();
        let contents = tokio::fs::read_to_string(vm.instance_path.join("state")).await.unwrap();
        assert_eq!(contents, "RUNNING");
    }
}
