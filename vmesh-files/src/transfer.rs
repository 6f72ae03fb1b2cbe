//! In-flight transfer tracking: dedupes concurrent fetches of the same
//! relative path (spec §4.7: "guarantees at-most-one concurrent transfer per
//! relative path").

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::content::FileDescriptor;
use crate::error::{FilesError, Result};

/// State of one in-progress (or queued) fetch.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub rel_path: String,
    /// Directory holding received parts before they are concatenated.
    pub parts_dir: PathBuf,
    pub descriptor: Option<FileDescriptor>,
    /// Part indexes received so far (spec: `parts: seen set`).
    pub parts_seen: HashSet<u64>,
    /// True until the descriptor is known and the pull has actually begun;
    /// mirrors `queued: bool` in the `Status()` shape from spec §4.7.
    pub queued: bool,
}

impl Transfer {
    fn new(rel_path: String, parts_dir: PathBuf) -> Self {
        Self { rel_path, parts_dir, descriptor: None, parts_seen: HashSet::new(), queued: true }
    }

    pub fn num_parts(&self) -> u64 {
        self.descriptor.as_ref().map(|d| d.num_parts).unwrap_or(0)
    }

    pub fn is_complete(&self) -> bool {
        let n = self.num_parts();
        n > 0 && self.parts_seen.len() as u64 == n
    }

    /// Record that `part_index` arrived; also handles the snoop case where a
    /// peer pre-populates `num_parts` from watching mesh traffic without
    /// having any parts yet (spec §4.7 step 3).
    pub fn record_part(&mut self, part_index: u64) {
        self.queued = false;
        self.parts_seen.insert(part_index);
    }

    pub fn adopt_descriptor(&mut self, descriptor: FileDescriptor) {
        self.descriptor = Some(descriptor);
        self.queued = false;
    }
}

/// Table of in-flight transfers keyed by relative path. One row can have
/// multiple subscribers; `join` lets a second `Get` for the same path ride
/// the existing transfer instead of starting a duplicate one (spec §9:
/// "serve `Get` calls by joining the existing transfer if present").
#[derive(Clone, Default)]
pub struct TransferTable {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<Transfer>>>>>,
}

/// Outcome of asking the table to start a fetch.
pub enum Claim {
    /// No one else is fetching this path; caller owns the fetch.
    Started(Arc<Mutex<Transfer>>),
    /// Someone else is already fetching; caller should await completion
    /// instead of starting its own fetch.
    Joined(Arc<Mutex<Transfer>>),
}

impl TransferTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fetch for `rel_path`, or join an existing one.
    pub async fn claim(&self, rel_path: &str, parts_dir: PathBuf) -> Claim {
        let mut table = self.inner.lock().await;
        if let Some(existing) = table.get(rel_path) {
            return Claim::Joined(existing.clone());
        }
        let transfer = Arc::new(Mutex::new(Transfer::new(rel_path.to_string(), parts_dir)));
        table.insert(rel_path.to_string(), transfer.clone());
        Claim::Started(transfer)
    }

    /// Explicit "already in flight" check without claiming, useful for
    /// callers that want the named-error variant rather than the `Claim` enum.
    pub async fn try_claim_exclusive(&self, rel_path: &str, parts_dir: PathBuf) -> Result<Arc<Mutex<Transfer>>> {
        match self.claim(rel_path, parts_dir).await {
            Claim::Started(t) => Ok(t),
            Claim::Joined(_) => Err(FilesError::AlreadyInFlight(rel_path.to_string())),
        }
    }

    /// Drop a completed (or abandoned) transfer from the table.
    pub async fn release(&self, rel_path: &str) {
        self.inner.lock().await.remove(rel_path);
    }

    pub async fn get(&self, rel_path: &str) -> Option<Arc<Mutex<Transfer>>> {
        self.inner.lock().await.get(rel_path).cloned()
    }

    pub async fn active_paths(&self) -> Vec<String> {
        self.inner.lock().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_claim_joins_first() {
        let table = TransferTable::new();
        let a = table.claim("images/base.qcow2", PathBuf::from("/tmp/a")).await;
        assert!(matches!(a, Claim::Started(_)));
        let b = table.claim("images/base.qcow2", PathBuf::from("/tmp/a")).await;
        assert!(matches!(b, Claim::Joined(_)));
    }

    #[tokio::test]
    async fn release_allows_restart() {
        let table = TransferTable::new();
        let _ = table.claim("x", PathBuf::from("/tmp/x")).await;
        table.release("x").await;
        let c = table.claim("x", PathBuf::from("/tmp/x")).await;
        assert!(matches!(c, Claim::Started(_)));
    }

    #[tokio::test]
    async fn try_claim_exclusive_surfaces_named_error() {
        let table = TransferTable::new();
        let _ = table.claim("y", PathBuf::from("/tmp/y")).await;
        let err = table.try_claim_exclusive("y", PathBuf::from("/tmp/y")).await.unwrap_err();
        assert!(err.is_already_in_flight());
    }

    #[test]
    fn completion_tracks_parts_seen() {
        let mut t = Transfer::new("f".into(), PathBuf::from("/tmp"));
        t.adopt_descriptor(FileDescriptor {
            rel_path: "f".into(),
            size: 10,
            part_size: 5,
            num_parts: 2,
            sha256: "abc".into(),
        });
        assert!(!t.is_complete());
        t.record_part(0);
        assert!(!t.is_complete());
        t.record_part(1);
        assert!(t.is_complete());
    }
}
