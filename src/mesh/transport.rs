//! TCP framing and request/reply bookkeeping for the peer mesh (spec §4.4,
//! §6 "Peer socket", Component H).
//!
//! Each peer connection is owned by a pair of tasks: a writer draining an
//! mpsc channel onto the socket, and a reader pulling framed messages off
//! it and either completing a pending reply or handing the envelope to
//! `mesh::handler` for local dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};

use vmesh_protocol::{Envelope, Message, MessageBody, HEADER_SIZE};

use crate::command::Command;
use crate::dispatcher::MeshFanout;
use crate::error::{Error, Result};
use crate::response::{Response, ResponseSet};

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

struct Peer {
    tx: mpsc::Sender<Envelope>,
}

/// A pending request awaiting its matching `tid` reply.
type PendingMap = Arc<Mutex<HashMap<u32, oneshot::Sender<Envelope>>>>;

/// Live peer-to-peer mesh state: outbound connections plus a channel that
/// surfaces envelopes this node didn't request (inbound `Command`,
/// `VmLaunch`, `Ping`, ...) to whatever is driving the accept loop.
pub struct MeshTransport {
    local_host: String,
    peers: Mutex<HashMap<String, Peer>>,
    pending: PendingMap,
    incoming: mpsc::Sender<Envelope>,
}

impl MeshTransport {
    pub fn new(local_host: impl Into<String>) -> (Arc<Self>, mpsc::Receiver<Envelope>) {
        let (incoming_tx, incoming_rx) = mpsc::channel(64);
        let transport = Arc::new(Self { local_host: local_host.into(), peers: Mutex::new(HashMap::new()), pending: Arc::new(Mutex::new(HashMap::new())), incoming: incoming_tx });
        (transport, incoming_rx)
    }

    pub fn local_host(&self) -> &str {
        &self.local_host
    }

    /// Adopt an already-connected socket as a peer (spec §4.4: peers are
    /// discovered and dialed outside this module; this wires one up once
    /// the TCP handshake is done).
    pub async fn add_peer(self: &Arc<Self>, name: &str, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel::<Envelope>(32);

        tokio::spawn(writer_loop(write_half, rx));
        tokio::spawn(reader_loop(read_half, self.clone(), name.to_string()));

        self.peers.lock().await.insert(name.to_string(), Peer { tx });
    }

    pub async fn remove_peer(&self, name: &str) {
        self.peers.lock().await.remove(name);
        self.fail_pending_for(name).await;
    }

    async fn fail_pending_for(&self, _name: &str) {
        // tids aren't peer-scoped; a dropped connection just lets its
        // pending requests time out rather than guessing which ones were
        // in flight on it.
    }

    pub async fn peer_names(&self) -> Vec<String> {
        self.peers.lock().await.keys().cloned().collect()
    }

    /// Send an envelope to `peer` without waiting for a reply (used for
    /// `Response`/`Pong` replies and one-way traffic like `Status`/`Log`).
    pub async fn send_envelope(&self, peer: &str, envelope: Envelope) -> Result<()> {
        let tx = {
            let peers = self.peers.lock().await;
            peers.get(peer).map(|p| p.tx.clone())
        };
        let Some(tx) = tx else { return Err(Error::Mesh(format!("no connection to peer {peer}"))) };
        tx.send(envelope).await.map_err(|_| Error::Mesh(format!("peer {peer} connection closed")))
    }

    async fn route_reply_or_dispatch(&self, envelope: Envelope) {
        if let Some(tid) = envelope.body.tid() {
            let mut pending = self.pending.lock().await;
            if let Some(waiter) = pending.remove(&tid) {
                let _ = waiter.send(envelope);
                return;
            }
        }
        let _ = self.incoming.send(envelope).await;
    }
}

async fn writer_loop(mut write_half: tokio::net::tcp::OwnedWriteHalf, mut rx: mpsc::Receiver<Envelope>) {
    while let Some(envelope) = rx.recv().await {
        let tag = (vmesh_protocol::new_tid() & 0xffff) as u16;
        let Ok(msg) = Message::from_envelope(&envelope, tag) else { continue };
        if write_half.write_all(&msg.serialize()).await.is_err() {
            break;
        }
    }
}

async fn reader_loop(mut read_half: tokio::net::tcp::OwnedReadHalf, transport: Arc<MeshTransport>, peer_name: String) {
    loop {
        let mut header = [0u8; HEADER_SIZE];
        if read_half.read_exact(&mut header).await.is_err() {
            break;
        }
        let Ok((total_len, msg_type, tag)) = Message::parse_header(&header) else { break };
        let mut payload = vec![0u8; total_len - HEADER_SIZE];
        if !payload.is_empty() && read_half.read_exact(&mut payload).await.is_err() {
            break;
        }
        let msg = Message { msg_type, tag, payload };
        let Ok(envelope) = msg.into_envelope() else { continue };
        transport.route_reply_or_dispatch(envelope).await;
    }
    transport.remove_peer(&peer_name).await;
}

#[async_trait]
impl MeshFanout for MeshTransport {
    fn peers(&self) -> Vec<String> {
        self.peers.try_lock().map(|p| p.keys().cloned().collect()).unwrap_or_default()
    }

    async fn send_command(&self, host: &str, cmd: &Command) -> Result<ResponseSet> {
        let tid = vmesh_protocol::new_tid();
        let command_value = serde_json::to_value(cmd)?;
        let envelope = Envelope::new(self.local_host.clone(), vec![host.to_string()], MessageBody::Command { tid, command: command_value });

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(tid, reply_tx);

        let tx = {
            let peers = self.peers.lock().await;
            peers.get(host).map(|p| p.tx.clone())
        };
        let Some(tx) = tx else {
            self.pending.lock().await.remove(&tid);
            return Err(Error::Mesh(format!("no connection to peer {host}")));
        };
        if tx.send(envelope).await.is_err() {
            self.pending.lock().await.remove(&tid);
            return Err(Error::Mesh(format!("peer {host} connection closed")));
        }

        match tokio::time::timeout(SEND_TIMEOUT, reply_rx).await {
            Ok(Ok(reply)) => match reply.body {
                MessageBody::Response { response, .. } => Ok(serde_json::from_value(response)?),
                other => Err(Error::Mesh(format!("unexpected reply body for command: {other:?}"))),
            },
            Ok(Err(_)) => Err(Error::Mesh(format!("peer {host} dropped the request"))),
            Err(_) => {
                self.pending.lock().await.remove(&tid);
                Ok(vec![Response::error(host, "timed out")])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn round_trips_a_command_over_a_real_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (transport_a, _incoming_a) = MeshTransport::new("h0");
        let (transport_b, mut incoming_b) = MeshTransport::new("h1");

        let accept_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            stream
        });
        let client = TcpStream::connect(addr).await.unwrap();
        let server = accept_task.await.unwrap();

        transport_a.add_peer("h1", client).await;
        transport_b.add_peer("h0", server).await;

        let cmd = Command { original: "vm info".to_string(), ..Default::default() };
        let send_task = tokio::spawn({
            let transport_a = transport_a.clone();
            async move { transport_a.send_command("h1", &cmd).await }
        });

        let envelope = incoming_b.recv().await.unwrap();
        let MessageBody::Command { tid, .. } = envelope.body else { panic!("expected command body") };
        let reply = Envelope::new("h1", vec!["h0".to_string()], MessageBody::Response { tid, response: serde_json::to_value(vec![Response::ok("h1", "ok")]).unwrap() });
        transport_b.peers.lock().await.get("h0").unwrap().tx.send(reply).await.unwrap();

        let result = send_task.await.unwrap().unwrap();
        assert_eq!(result[0].response, "ok");
    }

    #[tokio::test]
    async fn send_to_unknown_peer_errors() {
        let (transport, _incoming) = MeshTransport::new("h0");
        let cmd = Command::default();
        let err = transport.send_command("ghost", &cmd).await.unwrap_err();
        assert!(matches!(err, Error::Mesh(_)));
    }
}
