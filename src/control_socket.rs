//! Local control socket (spec §6 "Local control socket"): a Unix stream
//! socket at `<base>/minimega` carrying length-delimited JSON frames. Each
//! frame is a 4-byte little-endian length prefix followed by that many
//! bytes of JSON, mirroring the 7-byte-header framing `mesh::transport`
//! uses for the peer socket.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{info, warn};

use crate::command::{compile, Preprocessor};
use crate::dispatcher::{DispatchRequest, Dispatcher, HandlerTable};
use crate::error::{Error, Result};
use crate::response::{render, RenderStyle, Response, ResponseSet};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ControlRequest {
    Command { command: String },
    Suggest { suggest: String },
}

#[derive(Debug, Serialize)]
struct CommandFrame {
    resp: ResponseSet,
    rendered: String,
    more: bool,
}

#[derive(Debug, Serialize)]
struct SuggestFrame {
    suggest: Vec<String>,
}

/// Bind the control socket at `path`, removing any stale socket file left
/// behind by an unclean shutdown first, and serve connections until the
/// process shuts down.
pub async fn serve(
    path: PathBuf,
    dispatcher: Arc<Dispatcher>,
    handlers: Arc<HandlerTable>,
    preprocessor: Arc<dyn Preprocessor>,
    hostname: String,
) -> Result<()> {
    if tokio::fs::metadata(&path).await.is_ok() {
        tokio::fs::remove_file(&path).await?;
    }
    let listener = UnixListener::bind(&path).map_err(|e| Error::Fatal(format!("cannot bind control socket {}: {e}", path.display())))?;
    info!(path = %path.display(), "control socket: listening");

    loop {
        let (stream, _addr) = listener.accept().await?;
        let dispatcher = dispatcher.clone();
        let handlers = handlers.clone();
        let preprocessor = preprocessor.clone();
        let hostname = hostname.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, dispatcher, handlers, preprocessor, hostname).await {
                warn!(error = %e, "control socket: connection ended with an error");
            }
        });
    }
}

/// Remove the socket file during shutdown (spec §5 teardown: "removes the
/// Unix socket").
pub async fn remove(path: &Path) {
    let _ = tokio::fs::remove_file(path).await;
}

async fn handle_connection(
    mut stream: UnixStream,
    dispatcher: Arc<Dispatcher>,
    handlers: Arc<HandlerTable>,
    preprocessor: Arc<dyn Preprocessor>,
    hostname: String,
) -> Result<()> {
    loop {
        let Some(frame) = read_frame(&mut stream).await? else { return Ok(()) };
        let request: ControlRequest = match serde_json::from_slice(&frame) {
            Ok(r) => r,
            Err(e) => {
                let resp = vec![Response::error(hostname.clone(), format!("malformed request: {e}"))];
                write_frame(&mut stream, &CommandFrame { resp, rendered: String::new(), more: false }).await?;
                continue;
            }
        };

        match request {
            ControlRequest::Command { command } => {
                let resp = match compile(handlers.registry(), &command, true, preprocessor.as_ref()).await {
                    Ok(cmd) => run_one(&dispatcher, cmd).await,
                    Err(e) => vec![Response::error(hostname.clone(), e.user_message())],
                };
                let rendered = render(&resp, &RenderStyle::default()).unwrap_or_else(|e| format!("Error: {e}\n"));
                write_frame(&mut stream, &CommandFrame { resp, rendered, more: false }).await?;
            }
            ControlRequest::Suggest { suggest } => {
                let suggestions = suggest_patterns(handlers.registry(), &suggest);
                write_frame(&mut stream, &SuggestFrame { suggest: suggestions }).await?;
            }
        }
    }
}

/// Render every registered pattern whose textual form starts with `prefix`
/// (spec §6 `{suggest: string}` → `{suggest: string[]}`).
fn suggest_patterns(registry: &crate::registry::Registry, prefix: &str) -> Vec<String> {
    registry
        .patterns()
        .map(|p| p.items.iter().map(|item| item.render()).collect::<Vec<_>>().join(" "))
        .filter(|rendered| rendered.starts_with(prefix))
        .collect()
}

async fn run_one(dispatcher: &Dispatcher, cmd: crate::command::Command) -> ResponseSet {
    let (tx, mut rx) = tokio::sync::mpsc::channel(8);
    if dispatcher.submit(DispatchRequest { commands: vec![cmd], out: tx }).await.is_err() {
        return vec![Response::error("", "dispatcher unavailable")];
    }
    let mut merged = ResponseSet::new();
    while let Some(rs) = rx.recv().await {
        merged.extend(rs);
    }
    merged
}

async fn read_frame(stream: &mut UnixStream) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    if let Err(e) = stream.read_exact(&mut len_buf).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(e.into());
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Some(body))
}

async fn write_frame<T: Serialize>(stream: &mut UnixStream, frame: &T) -> Result<()> {
    let body = serde_json::to_vec(frame)?;
    stream.write_all(&(body.len() as u32).to_le_bytes()).await?;
    stream.write_all(&body).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::NoopPreprocessor;
    use crate::pattern::Pattern;
    use crate::response::Response as Resp;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct EchoHandler;
    #[async_trait]
    impl crate::dispatcher::Handler for EchoHandler {
        async fn call(&self, cmd: crate::command::Command, sink: mpsc::Sender<ResponseSet>) -> Result<()> {
            let _ = sink.send(vec![Resp::ok("h0", cmd.original.clone())]).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn command_round_trip_over_the_socket() {
        let tmp = tempfile::tempdir().unwrap();
        let socket_path = tmp.path().join("minimega");

        let mut table = HandlerTable::new();
        table.register(Pattern::parse("vm info").unwrap(), Arc::new(EchoHandler));
        let handlers = Arc::new(table);
        let dispatcher = Arc::new(Dispatcher::spawn(handlers.clone()));
        let preprocessor: Arc<dyn Preprocessor> = Arc::new(NoopPreprocessor);

        let serve_path = socket_path.clone();
        tokio::spawn(serve(serve_path, dispatcher, handlers, preprocessor, "h0".to_string()));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let mut client = UnixStream::connect(&socket_path).await.unwrap();
        let request = serde_json::to_vec(&serde_json::json!({ "command": "vm info" })).unwrap();
        client.write_all(&(request.len() as u32).to_le_bytes()).await.unwrap();
        client.write_all(&request).await.unwrap();

        let mut len_buf = [0u8; 4];
        client.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        client.read_exact(&mut body).await.unwrap();
        let frame: CommandFrame = serde_json::from_slice(&body).unwrap();
        assert_eq!(frame.resp[0].response, "vm info");
        assert!(!frame.more);
    }
}
