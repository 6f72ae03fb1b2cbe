//! Dispatches envelopes received from a peer connection (spec §4.4: "the
//! mesh receiver compiles `original` again and dispatches locally").

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;
use vmesh_protocol::{Envelope, MessageBody};

use crate::dispatcher::HandlerTable;
use crate::response::{Response, ResponseSet};

/// Handle one inbound envelope, returning the reply envelope to send back
/// over the same connection (`None` for bodies that don't get a reply,
/// e.g. `Ping`/`Log`/`Status`).
pub async fn handle_incoming(envelope: Envelope, handlers: &Arc<HandlerTable>, local_host: &str) -> Option<Envelope> {
    match envelope.body {
        MessageBody::Command { tid, command } => {
            let cmd: crate::command::Command = match serde_json::from_value(command) {
                Ok(c) => c,
                Err(e) => {
                    let rs: ResponseSet = vec![Response::error(local_host, format!("malformed command: {e}"))];
                    return Some(Envelope::new(local_host, vec![envelope.from], MessageBody::Response { tid, response: serde_json::to_value(rs).ok()? }));
                }
            };
            let response = dispatch_one(handlers, cmd, local_host).await;
            Some(Envelope::new(local_host, vec![envelope.from], MessageBody::Response { tid, response: serde_json::to_value(response).ok()? }))
        }
        MessageBody::Ping => Some(Envelope::new(local_host, vec![envelope.from], MessageBody::Pong)),
        MessageBody::Pong | MessageBody::Log { .. } | MessageBody::Status { .. } => None,
        other => {
            warn!(?other, "mesh: no local handling for this message kind yet");
            None
        }
    }
}

/// Runs exactly one command through the handler table and collects only
/// the first ResponseSet a handler emits; a handler that streams more than
/// one chunk over the mesh has the extras logged and dropped, since a
/// mesh reply carries a single response per command (spec §4.4).
async fn dispatch_one(handlers: &Arc<HandlerTable>, cmd: crate::command::Command, local_host: &str) -> ResponseSet {
    let handler = match handlers.resolve(&cmd) {
        Ok(h) => h,
        Err(e) => return vec![Response::error(local_host, e.user_message())],
    };

    let (tx, mut rx) = mpsc::channel(4);
    let call_result = handler.call(cmd, tx).await;

    let first = rx.recv().await;
    if rx.try_recv().is_ok() {
        warn!("mesh: handler emitted more than one response set, dropping the rest");
    }

    match (first, call_result) {
        (Some(rs), _) => rs,
        (None, Err(e)) => vec![Response::error(local_host, e.user_message())],
        (None, Ok(())) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::Pattern;
    use async_trait::async_trait;

    struct EchoHandler;
    #[async_trait]
    impl crate::dispatcher::Handler for EchoHandler {
        async fn call(&self, cmd: crate::command::Command, sink: mpsc::Sender<ResponseSet>) -> crate::error::Result<()> {
            let _ = sink.send(vec![Response::ok("h1", cmd.original.clone())]).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn command_envelope_gets_a_response_reply() {
        let mut table = HandlerTable::new();
        table.register(Pattern::parse("vm info").unwrap(), Arc::new(EchoHandler));
        let handlers = Arc::new(table);

        let cmd = crate::command::Command { original: "vm info".to_string(), ..Default::default() };
        let envelope = Envelope::new("h0", vec!["h1".to_string()], MessageBody::Command { tid: 7, command: serde_json::to_value(&cmd).unwrap() });

        let reply = handle_incoming(envelope, &handlers, "h1").await.unwrap();
        let MessageBody::Response { tid, response } = reply.body else { panic!("expected response body") };
        assert_eq!(tid, 7);
        let rs: ResponseSet = serde_json::from_value(response).unwrap();
        assert_eq!(rs[0].response, "vm info");
    }

    #[tokio::test]
    async fn ping_gets_a_pong() {
        let handlers = Arc::new(HandlerTable::new());
        let envelope = Envelope::new("h0", vec!["h1".to_string()], MessageBody::Ping);
        let reply = handle_incoming(envelope, &handlers, "h1").await.unwrap();
        assert!(matches!(reply.body, MessageBody::Pong));
    }
}
