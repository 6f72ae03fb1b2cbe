//! Agent entrypoint: wires the command engine, mesh transport, file
//! distributor and control socket together and runs until shutdown
//! (spec §5, §6).

use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::{info, warn};

use vmesh::bridge::ProcessBridge;
use vmesh::command::Preprocessor;
use vmesh::control_socket;
use vmesh::dispatcher::{Dispatcher, HandlerTable, MeshFanout};
use vmesh::distributor::Distributor;
use vmesh::handlers::{self, AppState};
use vmesh::host::ProcHostIntrospection;
use vmesh::logging;
use vmesh::mesh::{self, MeshTransport};
use vmesh::preprocess::MeshPreprocessor;
use vmesh::recovery;
use vmesh::settings::Settings;
use vmesh::shutdown;
use vmesh::vm::driver::{ContainerDriver, QemuDriver};

use vmesh_files::{FileStore, NoBackingFileProbe};

#[tokio::main]
async fn main() {
    let settings = Settings::parse_args();
    logging::init(&settings.log_level, settings.log_json);

    let hostname = settings.resolved_host();
    let base_dir = settings.base_dir.clone();
    info!(%hostname, base_dir = %base_dir.display(), "vmesh: starting");

    if let Err(e) = tokio::fs::create_dir_all(&base_dir).await {
        warn!(error = %e, base_dir = %base_dir.display(), "vmesh: failed to create base directory");
    }
    let pid_path = base_dir.join("minimega.pid");
    if let Err(e) = tokio::fs::write(&pid_path, std::process::id().to_string()).await {
        warn!(error = %e, path = %pid_path.display(), "vmesh: failed to write pid file");
    }

    let state = Arc::new(AppState::new(
        hostname.clone(),
        base_dir.clone(),
        Arc::new(QemuDriver::default()),
        Arc::new(ContainerDriver::default()),
        Arc::new(ProcessBridge::default()),
        Arc::new(ProcHostIntrospection),
    ));

    let (transport, incoming) = MeshTransport::new(hostname.clone());
    let files_dir = base_dir.join("files");
    let distributor = Arc::new(Distributor::new(FileStore::new(&files_dir), transport.clone(), Arc::new(NoBackingFileProbe)));
    let preprocessor: Arc<dyn Preprocessor> = Arc::new(MeshPreprocessor::new(distributor.clone(), FileStore::new(&files_dir)));

    for peer in &settings.peers {
        let Some((peer_host, addr)) = peer.split_once('=') else {
            warn!(%peer, "vmesh: ignoring malformed --peer value, expected host=addr");
            continue;
        };
        match TcpStream::connect(addr).await {
            Ok(stream) => transport.add_peer(peer_host, stream).await,
            Err(e) => warn!(%peer_host, %addr, error = %e, "vmesh: failed to dial peer at startup"),
        }
    }

    if let Err(e) = recovery::recover(&state, &state.bridge).await {
        warn!(error = %e, "vmesh: recovery pass failed");
    }

    let mut table = HandlerTable::new();
    let mesh_fanout: Arc<dyn MeshFanout> = transport.clone();
    handlers::register_all(&mut table, state.clone(), mesh_fanout);
    let table = Arc::new(table);

    let dispatcher = Arc::new(Dispatcher::spawn(table.clone()));

    tokio::spawn(mesh::accept_loop(settings.mesh_addr, transport.clone()));
    tokio::spawn(mesh::drive_incoming(incoming, transport.clone(), table.clone(), distributor.clone(), hostname.clone()));

    let socket_path = base_dir.join("minimega");
    let control_task = tokio::spawn(control_socket::serve(socket_path.clone(), dispatcher.clone(), table.clone(), preprocessor, hostname.clone()));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("vmesh: received shutdown signal"),
        Err(e) => warn!(error = %e, "vmesh: failed to listen for shutdown signal"),
    }

    control_task.abort();
    shutdown::teardown(&state, &socket_path, &pid_path).await;
    info!("vmesh: shut down");
}
