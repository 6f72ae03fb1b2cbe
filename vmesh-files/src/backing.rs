//! Backing-image chasing (spec §4.7 step 4).
//!
//! Querying a disk image's backing file is a job for the disk-image tool
//! wrapper (`qemu-img`), which spec §1 explicitly places out of scope:
//! "disk-image tool wrappers (qemu-img, nbd)". This module defines only the
//! capability boundary the file distributor consumes, the same way
//! `Bridge` is the boundary for networking (§4 Component K) — the actual
//! image-format parsing lives behind whatever external tool a deployment
//! wires up.

use std::path::{Path, PathBuf};

/// Abstracts "does this disk image have a backing file, and if so, what is
/// its path" — answered by shelling out to a disk tool in a real
/// deployment.
pub trait BackingFileProbe: Send + Sync {
    /// Returns the backing file path recorded in `path`'s header, if any.
    fn backing_file(&self, path: &Path) -> Option<PathBuf>;
}

/// Default probe for hosts with no disk-image tool wired up: reports no
/// backing files so the distributor always stops at the first file it
/// fetched, without imposing an `unimplemented!()` panic.
pub struct NoBackingFileProbe;

impl BackingFileProbe for NoBackingFileProbe {
    fn backing_file(&self, _path: &Path) -> Option<PathBuf> {
        None
    }
}

/// Resolve the chain of backing files for `path`, using `probe` to query
/// one hop at a time. Stops at the first file with no backing file, or
/// when a backing file is recorded but points outside `files_dir` — in
/// which case spec §4.7 treats it as a fatal fetch error, so this returns
/// the partial chain plus the offending path separately for the caller to
/// turn into an error.
pub fn resolve_backing_chain(
    probe: &dyn BackingFileProbe,
    files_dir: &Path,
    path: &Path,
) -> Result<Vec<PathBuf>, PathBuf> {
    let mut chain = Vec::new();
    let mut current = path.to_path_buf();
    loop {
        match probe.backing_file(&current) {
            None => break,
            Some(backing) => {
                if !backing.starts_with(files_dir) {
                    return Err(backing);
                }
                chain.push(backing.clone());
                current = backing;
            }
        }
    }
    Ok(chain)
}
