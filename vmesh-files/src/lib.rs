//! Content-addressed file distribution primitives for the vmesh file layer
//! (spec §4.7).
//!
//! This crate holds the host-local building blocks — hashing, part
//! splitting, the in-flight transfer table, status reporting, and the
//! backing-file chase boundary. The actual peer-to-peer fetch protocol
//! (broadcasting `find`, pulling parts from a chosen responder, the MITM
//! snoop hook) lives in the core crate's `distributor` module, which drives
//! these primitives over the mesh transport.

pub mod backing;
pub mod content;
pub mod error;
pub mod status;
pub mod store;
pub mod transfer;

pub use backing::{resolve_backing_chain, BackingFileProbe, NoBackingFileProbe};
pub use content::{content_hash, split_into_parts, FileDescriptor, DEFAULT_PART_SIZE};
pub use error::{FilesError, Result};
pub use status::{StatusThrottle, TransferStatus, DEFAULT_STATUS_PERIOD};
pub use store::FileStore;
pub use transfer::{Claim, Transfer, TransferTable};
