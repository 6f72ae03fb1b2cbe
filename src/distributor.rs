//! Peer-to-peer file fetch protocol (spec §4.7), driving `vmesh_files`
//! primitives over the mesh transport: broadcast `find`, pull parts from
//! whichever peer answers first, chase the backing-file chain, and feed a
//! throttled status stream.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::warn;

use vmesh_files::{
    content_hash, resolve_backing_chain, split_into_parts, BackingFileProbe, Claim, FileDescriptor, FileStore, TransferTable,
    DEFAULT_PART_SIZE,
};
use vmesh_protocol::{new_tid, Envelope, MessageBody};

use crate::error::{Error, Result};
use crate::mesh::MeshTransport;

const FIND_TIMEOUT: Duration = Duration::from_secs(5);
const PART_TIMEOUT: Duration = Duration::from_secs(20);

/// Wire shape for `MessageBody::File` payloads (spec §4.7 steps 1-3). Each
/// request carries its own `tid` since `File` isn't one of the protocol
/// crate's tid-bearing variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum FileOp {
    Find { tid: u32, rel_path: String },
    Descriptor { tid: u32, descriptor: Option<FileDescriptor> },
    PullPart { tid: u32, rel_path: String, part_index: u64 },
    Part { tid: u32, rel_path: String, part_index: u64, data: Vec<u8> },
}

impl FileOp {
    fn tid(&self) -> u32 {
        match self {
            FileOp::Find { tid, .. } | FileOp::Descriptor { tid, .. } | FileOp::PullPart { tid, .. } | FileOp::Part { tid, .. } => *tid,
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<u32, oneshot::Sender<FileOp>>>>;

/// Drives file fetches over the mesh and answers other hosts' requests
/// against the local store.
pub struct Distributor {
    store: FileStore,
    transfers: TransferTable,
    mesh: Arc<MeshTransport>,
    probe: Arc<dyn BackingFileProbe>,
    pending: PendingMap,
}

impl Distributor {
    pub fn new(store: FileStore, mesh: Arc<MeshTransport>, probe: Arc<dyn BackingFileProbe>) -> Self {
        Self { store, transfers: TransferTable::new(), mesh, probe, pending: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Ensure `rel_path` exists locally, fetching it (and its backing-file
    /// chain) from the mesh if not, then return its local path (spec §4.7
    /// `Get`).
    pub async fn fetch(&self, rel_path: &str) -> Result<PathBuf> {
        if self.store.exists(rel_path).await {
            return Ok(self.store.local_path(rel_path));
        }

        let parts_dir = self.store.root().join(".parts").join(rel_path);
        match self.transfers.claim(rel_path, parts_dir.clone()).await {
            Claim::Joined(transfer) => {
                self.wait_for_completion(&transfer).await;
            }
            Claim::Started(transfer) => {
                let result = self.drive_fetch(rel_path, &parts_dir, &transfer).await;
                self.transfers.release(rel_path).await;
                result?;
            }
        }

        let published = self.store.local_path(rel_path);
        self.chase_backing_chain(&published).await?;
        Ok(published)
    }

    async fn wait_for_completion(&self, transfer: &Arc<Mutex<vmesh_files::Transfer>>) {
        loop {
            if transfer.lock().await.is_complete() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn drive_fetch(&self, rel_path: &str, parts_dir: &std::path::Path, transfer: &Arc<Mutex<vmesh_files::Transfer>>) -> Result<()> {
        let Some((responder, descriptor)) = self.find_descriptor(rel_path).await else {
            return Err(Error::Files(vmesh_files::FilesError::NotFoundOnMesh(rel_path.to_string())));
        };
        transfer.lock().await.adopt_descriptor(descriptor.clone());

        tokio::fs::create_dir_all(parts_dir).await?;
        for part_index in 0..descriptor.num_parts {
            let data = self.pull_part(&responder, rel_path, part_index).await?;
            tokio::fs::write(parts_dir.join(part_index.to_string()), &data).await?;
            transfer.lock().await.record_part(part_index);
        }

        self.store.concat_parts(rel_path, parts_dir, descriptor.num_parts).await?;
        let published = self.store.read(rel_path).await?;
        if content_hash(&published) != descriptor.sha256 {
            return Err(Error::Files(vmesh_files::FilesError::HashMismatch(rel_path.to_string())));
        }
        Ok(())
    }

    async fn find_descriptor(&self, rel_path: &str) -> Option<(String, FileDescriptor)> {
        let peers = self.mesh.peers();
        if peers.is_empty() {
            return None;
        }
        let (tx, mut rx) = mpsc::channel(peers.len());
        for peer in peers {
            let tx = tx.clone();
            let rel_path = rel_path.to_string();
            let mesh = self.mesh.clone();
            let pending = self.pending.clone();
            tokio::spawn(async move {
                let tid = new_tid();
                let op = FileOp::Find { tid, rel_path };
                if let Ok(FileOp::Descriptor { descriptor: Some(d), .. }) = send_request(&mesh, &pending, &peer, tid, op, FIND_TIMEOUT).await {
                    let _ = tx.send((peer, d)).await;
                }
            });
        }
        drop(tx);
        rx.recv().await
    }

    async fn pull_part(&self, responder: &str, rel_path: &str, part_index: u64) -> Result<Vec<u8>> {
        let tid = new_tid();
        let op = FileOp::PullPart { tid, rel_path: rel_path.to_string(), part_index };
        match send_request(&self.mesh, &self.pending, responder, tid, op, PART_TIMEOUT).await? {
            FileOp::Part { data, .. } => Ok(data),
            other => Err(Error::Mesh(format!("unexpected reply to PullPart: {other:?}"))),
        }
    }

    /// spec §4.7 step 4: chase a fetched disk image's backing file chain,
    /// fetching each hop that isn't already local. A backing file recorded
    /// outside the files directory is a fatal fetch error.
    async fn chase_backing_chain(&self, path: &std::path::Path) -> Result<()> {
        let chain = match resolve_backing_chain(self.probe.as_ref(), self.store.root(), path) {
            Ok(chain) => chain,
            Err(outside) => return Err(Error::Files(vmesh_files::FilesError::BackingFileEscapes(outside.display().to_string()))),
        };
        for backing in chain {
            let Ok(rel) = backing.strip_prefix(self.store.root()) else { continue };
            let rel_path = rel.display().to_string();
            if !self.store.exists(&rel_path).await {
                Box::pin(self.fetch(&rel_path)).await?;
            }
        }
        Ok(())
    }

    /// Answer a request from a peer, or complete a pending reply on this
    /// side — called by the mesh accept loop for every inbound `File`
    /// envelope (spec §4.4).
    pub async fn handle_envelope(&self, envelope: Envelope) {
        let MessageBody::File { payload } = envelope.body else { return };
        let op: FileOp = match serde_json::from_value(payload) {
            Ok(op) => op,
            Err(e) => {
                warn!(error = %e, "distributor: malformed file payload");
                return;
            }
        };

        match op {
            FileOp::Find { tid, rel_path } => {
                if self.store.exists(&rel_path).await {
                    if let Ok(data) = self.store.read(&rel_path).await {
                        let descriptor = FileDescriptor::new(rel_path, &data, DEFAULT_PART_SIZE);
                        let reply = FileOp::Descriptor { tid, descriptor: Some(descriptor) };
                        self.reply(&envelope.from, reply).await;
                    }
                }
                // Silence otherwise: let whichever peer actually has the
                // file be the one to answer.
            }
            FileOp::PullPart { tid, rel_path, part_index } => {
                if let Ok(data) = self.store.read(&rel_path).await {
                    let parts = split_into_parts(&data, DEFAULT_PART_SIZE);
                    if let Some(chunk) = parts.get(part_index as usize) {
                        let reply = FileOp::Part { tid, rel_path, part_index, data: chunk.to_vec() };
                        self.reply(&envelope.from, reply).await;
                    }
                }
            }
            reply @ (FileOp::Descriptor { .. } | FileOp::Part { .. }) => {
                let tid = reply.tid();
                if let Some(waiter) = self.pending.lock().await.remove(&tid) {
                    let _ = waiter.send(reply);
                }
            }
        }
    }

    async fn reply(&self, to: &str, op: FileOp) {
        let Ok(payload) = serde_json::to_value(&op) else { return };
        let envelope = Envelope::new(self.mesh.local_host(), vec![to.to_string()], MessageBody::File { payload });
        if let Err(e) = self.mesh.send_envelope(to, envelope).await {
            warn!(peer = %to, error = %e, "distributor: failed to send reply");
        }
    }
}

async fn send_request(mesh: &Arc<MeshTransport>, pending: &PendingMap, peer: &str, tid: u32, op: FileOp, timeout: Duration) -> Result<FileOp> {
    let (reply_tx, reply_rx) = oneshot::channel();
    pending.lock().await.insert(tid, reply_tx);

    let Ok(payload) = serde_json::to_value(&op) else {
        pending.lock().await.remove(&tid);
        return Err(Error::Mesh("failed to encode file request".to_string()));
    };
    let envelope = Envelope::new(mesh.local_host(), vec![peer.to_string()], MessageBody::File { payload });
    if let Err(e) = mesh.send_envelope(peer, envelope).await {
        pending.lock().await.remove(&tid);
        return Err(e);
    }

    match tokio::time::timeout(timeout, reply_rx).await {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(_)) => Err(Error::Mesh(format!("peer {peer} dropped the file request"))),
        Err(_) => {
            pending.lock().await.remove(&tid);
            Err(Error::Mesh(format!("peer {peer} timed out on {:?}", op.tid())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};
    use vmesh_files::NoBackingFileProbe;

    #[tokio::test]
    async fn fetch_returns_immediately_when_already_local() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileStore::new(tmp.path());
        store.atomic_write("a.img", b"hello").await.unwrap();

        let (mesh, _incoming) = MeshTransport::new("h0");
        let distributor = Distributor::new(store, mesh, Arc::new(NoBackingFileProbe));
        let path = distributor.fetch("a.img").await.unwrap();
        assert!(tokio::fs::metadata(path).await.is_ok());
    }

    #[tokio::test]
    async fn fetches_from_a_peer_over_a_real_socket() {
        let server_root = tempfile::tempdir().unwrap();
        let server_store = FileStore::new(server_root.path());
        server_store.atomic_write("disk.img", b"qemu-disk-bytes").await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (mesh_client, _incoming_client) = MeshTransport::new("client");
        let (mesh_server, mut incoming_server) = MeshTransport::new("server");

        let accept_task = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let client_sock = TcpStream::connect(addr).await.unwrap();
        let server_sock = accept_task.await.unwrap();

        mesh_client.add_peer("server", client_sock).await;
        mesh_server.add_peer("client", server_sock).await;

        let server_distributor = Arc::new(Distributor::new(server_store, mesh_server, Arc::new(NoBackingFileProbe)));
        let responder = server_distributor.clone();
        tokio::spawn(async move {
            while let Some(envelope) = incoming_server.recv().await {
                responder.handle_envelope(envelope).await;
            }
        });

        let client_root = tempfile::tempdir().unwrap();
        let client_store = FileStore::new(client_root.path());
        let client_distributor = Distributor::new(client_store, mesh_client, Arc::new(NoBackingFileProbe));

        let path = client_distributor.fetch("disk.img").await.unwrap();
        let data = tokio::fs::read(path).await.unwrap();
        assert_eq!(data, b"qemu-disk-bytes");
    }
}
