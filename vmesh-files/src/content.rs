//! Content addressing: hashing and part-splitting for the mesh file protocol.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Default part size used when chunking a file for peer-to-peer transfer.
pub const DEFAULT_PART_SIZE: u64 = 1024 * 1024;

/// SHA-256 hex digest of `data`.
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Descriptor a peer advertises in response to a `find(relPath)` request
/// (spec §4.7 step 1): enough information for the initiator to pull parts
/// without re-querying metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileDescriptor {
    pub rel_path: String,
    pub size: u64,
    pub part_size: u64,
    pub num_parts: u64,
    pub sha256: String,
}

impl FileDescriptor {
    pub fn new(rel_path: impl Into<String>, data: &[u8], part_size: u64) -> Self {
        let size = data.len() as u64;
        let num_parts = size.div_ceil(part_size).max(1);
        Self {
            rel_path: rel_path.into(),
            size,
            part_size,
            num_parts,
            sha256: content_hash(data),
        }
    }
}

/// Split `data` into `part_size`-sized chunks, the last one possibly shorter.
pub fn split_into_parts(data: &[u8], part_size: u64) -> Vec<&[u8]> {
    if data.is_empty() {
        return vec![&data[..0]];
    }
    data.chunks(part_size.max(1) as usize).collect()
}
