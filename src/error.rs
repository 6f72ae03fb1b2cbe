//! Error taxonomy for vmesh (spec §7).
//!
//! The five classes from spec §7 — User, Peer, Vm, Host, Fatal — aren't
//! represented as a five-way enum; they're a classification of *how an
//! error is allowed to propagate*, layered on top of the concrete causes
//! below. `Error::user_message()` renders the text a `Response.error`
//! field should carry; everything else bubbles through `?` like any other
//! Rust error.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur anywhere in vmesh.
#[derive(Error, Debug)]
pub enum Error {
    /// Pattern registration or compilation failure (spec §4.1).
    #[error("{0}")]
    Grammar(String),

    /// Input could not be resolved to exactly one handler (spec §4.1/§4.2).
    #[error("ambiguous command, {0} possibilities")]
    Ambiguous(usize),

    /// No handler matched the input at all.
    #[error("unknown command")]
    NoMatch,

    /// A named VM/namespace/alias lookup failed.
    #[error("{0}")]
    NotFound(String),

    /// A VM operation was attempted from a state that doesn't allow it
    /// (spec §4.5 Apply: "VM state error").
    #[error("VM state error")]
    VmStateError,

    /// A VM-to-VM conflict on launch (spec §4.5 step 3).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The scheduler could not place every queued batch (spec §4.6 step 6).
    #[error("nonexistent colocate VMs")]
    NonexistentColocateVms,

    /// A bridge/tap/VLAN operation failed (Component K).
    #[error("bridge error: {0}")]
    Bridge(String),

    /// The file distribution layer reported an error (spec §4.7, §9).
    #[error(transparent)]
    Files(#[from] vmesh_files::FilesError),

    /// A mesh protocol framing/parsing error.
    #[error(transparent)]
    Protocol(#[from] vmesh_protocol::ProtocolError),

    /// Mesh send/receive failure not covered by a timeout (Component H).
    #[error("mesh error: {0}")]
    Mesh(String),

    /// A rendering invariant was violated (spec §4.3: mismatched tabular headers).
    #[error("cannot render: {0}")]
    Render(String),

    /// An external process the core supervises exited unexpectedly or
    /// could not be spawned (spec §9: promotes "no such process" out of
    /// string matching into a named variant).
    #[error("no such process: {0}")]
    NoSuchProcess(String),

    /// A write to a caller channel found the receiver gone (spec §9:
    /// promotes "write: broken pipe" out of string matching).
    #[error("broken pipe")]
    BrokenPipe,

    /// Serialization/deserialization failure.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other host-level failure (Component K/L: bridge add failed,
    /// external process missing, /proc parse failure, ...).
    #[error("{0}")]
    Host(String),

    /// Unrecoverable startup failure (spec §7 "Fatal errors"): the caller
    /// should log this and exit(1).
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// Render the text that belongs in `Response.error` for this failure
    /// (spec §7: "each leg's error becomes one response line").
    pub fn user_message(&self) -> String {
        self.to_string()
    }

    /// True for the `"vm not found"` sentinel the VM-target broadcast
    /// wrapper treats specially (spec §4.2 policy 2).
    pub fn is_vm_not_found(&self) -> bool {
        matches!(self, Error::NotFound(msg) if msg == "vm not found")
    }

    pub fn vm_not_found() -> Self {
        Error::NotFound("vm not found".to_string())
    }
}
