//! Peer mesh: framed TCP transport plus the accept loop that drives
//! inbound traffic into local dispatch (spec §4.4, §6 "Peer socket",
//! Component H).

pub mod handler;
pub mod transport;

pub use transport::MeshTransport;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};
use vmesh_protocol::MessageBody;

use crate::dispatcher::HandlerTable;
use crate::distributor::Distributor;
use crate::error::Result;

/// Bind `addr` and accept peer connections onto `transport` forever.
/// Returns once the listener itself fails to bind; individual connection
/// errors are logged and don't bring the mesh down.
pub async fn accept_loop(addr: SocketAddr, transport: Arc<MeshTransport>) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "mesh: listening for peer connections");
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let name = peer_addr.to_string();
                info!(%name, "mesh: accepted peer connection");
                transport.add_peer(&name, stream).await;
            }
            Err(e) => warn!(error = %e, "mesh: accept failed"),
        }
    }
}

/// Drain every envelope that arrives on `incoming` (anything that wasn't a
/// pending reply): `File` bodies go to the distributor, everything else
/// through `mesh::handler` for local dispatch. Runs until `incoming` closes.
pub async fn drive_incoming(
    mut incoming: tokio::sync::mpsc::Receiver<vmesh_protocol::Envelope>,
    transport: Arc<MeshTransport>,
    handlers: Arc<HandlerTable>,
    distributor: Arc<Distributor>,
    local_host: String,
) {
    while let Some(envelope) = incoming.recv().await {
        if matches!(envelope.body, MessageBody::File { .. }) {
            let distributor = distributor.clone();
            tokio::spawn(async move { distributor.handle_envelope(envelope).await });
            continue;
        }

        let from = envelope.from.clone();
        let handlers = handlers.clone();
        let transport = transport.clone();
        let local_host = local_host.clone();
        tokio::spawn(async move {
            if let Some(reply) = handler::handle_incoming(envelope, &handlers, &local_host).await {
                if let Err(e) = transport.send_envelope(&from, reply).await {
                    warn!(peer = %from, error = %e, "mesh: failed to send reply");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmesh_files::{FileStore, NoBackingFileProbe};

    #[tokio::test]
    async fn accept_loop_binds_without_panicking() {
        let (transport, incoming) = MeshTransport::new("h0");
        let handlers = Arc::new(HandlerTable::new());
        let tmp = tempfile::tempdir().unwrap();
        let distributor = Arc::new(Distributor::new(FileStore::new(tmp.path()), transport.clone(), Arc::new(NoBackingFileProbe)));

        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let accept_task = tokio::spawn(accept_loop(addr, transport.clone()));
        let drive_task = tokio::spawn(drive_incoming(incoming, transport, handlers, distributor, "h0".to_string()));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        accept_task.abort();
        drive_task.abort();
    }
}
