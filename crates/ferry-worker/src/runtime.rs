//! Worker-side runtime loader.
//!
//! Sends the lifecycle acknowledgment, waits for the single initialization
//! frame, loads the named handler module, and drives each inbound message
//! through handler dispatch, replying on the same channel.

use std::sync::Arc;
use std::time::Duration;

use ferry_core::channel::{self, Endpoint};
use ferry_core::dispatch::{self, HandlerKind};
use ferry_core::module::Module;
use ferry_core::protocol::{read_frame, write_frame, Frame, Message};
use ferry_core::{Error, Result};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::loader;

/// Drive the worker over its stdio transport until the host disconnects or
/// requests shutdown.
pub async fn run<R, W>(reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = reader;
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();

    // Writer task: everything the worker emits funnels through one queue.
    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                error!("stdout write failed: {e}");
                break;
            }
        }
    });

    // Lifecycle acknowledgment goes out before anything else.
    outbound_tx
        .send(Frame::Started)
        .map_err(|_| Error::ChannelClosed)?;

    // The module holds one side of the pair; the other side bridges stdio.
    let (module_ep, wire_ep) = channel::pair();

    // Outbound bridge: messages the module sends become frames.
    if let Some(mut wire_rx) = wire_ep.take_inbox() {
        let outbound = outbound_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = wire_rx.recv().await {
                if outbound.send(message.into()).is_err() {
                    break;
                }
            }
        });
    }

    // Exactly one initialization frame precedes application traffic.
    let module_path = loop {
        match read_frame(&mut reader).await? {
            Some(Frame::Init { module_path }) => break module_path,
            Some(Frame::Shutdown) => {
                let _ = outbound_tx.send(Frame::ShuttingDown);
                drop(module_ep);
                drop(wire_ep);
                finish_writer(outbound_tx, writer_task).await;
                return Ok(());
            }
            Some(frame) => warn!(?frame, "frame before initialization ignored"),
            None => {
                info!("host closed stream before initialization");
                return Ok(());
            }
        }
    };

    match module_path.as_deref() {
        // A worker may be reserved without a module; it stays resident.
        None | Some("") => info!("no module configured, worker idle"),
        Some(path) => match loader::load(path) {
            Ok(module) => install(module, module_ep.clone(), outbound_tx.clone()).await,
            Err(e) => error!("{e}; worker idle"),
        },
    }

    // Main loop: feed application traffic to the module endpoint.
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(Frame::Message { data, token })) => {
                if wire_ep.send(Message { data, token }).is_err() {
                    warn!("module endpoint gone, dropping message");
                }
            }
            Ok(Some(Frame::Shutdown)) => {
                debug!("shutdown requested");
                let _ = outbound_tx.send(Frame::ShuttingDown);
                break;
            }
            Ok(Some(Frame::Init { .. })) => warn!("duplicate initialization frame ignored"),
            Ok(Some(frame)) => warn!(?frame, "unexpected frame"),
            Ok(None) => {
                debug!("host closed stream");
                break;
            }
            Err(e) => {
                error!("frame read failed: {e}");
                break;
            }
        }
    }

    drop(module_ep);
    drop(wire_ep);
    finish_writer(outbound_tx, writer_task).await;
    Ok(())
}

/// Give the writer a moment to flush anything still queued.
async fn finish_writer(
    outbound_tx: mpsc::UnboundedSender<Frame>,
    writer_task: tokio::task::JoinHandle<()>,
) {
    drop(outbound_tx);
    let _ = tokio::time::timeout(Duration::from_millis(500), writer_task).await;
}

/// Bind message dispatch for a loaded module and start the endpoint.
///
/// The optional port hook runs first, exactly once, with the module's
/// endpoint; its failure is logged and does not abort startup. Messages the
/// host queued before this point are delivered as soon as the endpoint
/// starts.
async fn install(module: Module, endpoint: Endpoint, outbound: mpsc::UnboundedSender<Frame>) {
    let Module { main, port } = module;

    if let Some(hook) = port {
        if let Err(e) = hook.invoke(endpoint.clone()).await {
            error!("{e}");
        }
    }

    let main = Arc::new(main);
    let mut inbound = endpoint.subscribe();
    let reply_ep = endpoint.clone();
    tokio::spawn(async move {
        loop {
            match inbound.recv().await {
                Ok(message) => {
                    let token = message.token;
                    match main.kind() {
                        // Sync handlers run on the dispatch turn, uninterrupted.
                        HandlerKind::Sync => {
                            let outcome = dispatch::dispatch(&main, message.data).await;
                            finish(outcome, token, &reply_ep, &outbound);
                        }
                        // Async handlers run concurrently: dispatch follows
                        // arrival order, completion order is unconstrained.
                        HandlerKind::Async | HandlerKind::PromiseFactory => {
                            let main = main.clone();
                            let reply_ep = reply_ep.clone();
                            let outbound = outbound.clone();
                            tokio::spawn(async move {
                                let outcome = dispatch::dispatch(&main, message.data).await;
                                finish(outcome, token, &reply_ep, &outbound);
                            });
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "dispatch fell behind, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    endpoint.start();
}

/// Reply with the handler result, or surface the failure to the host.
fn finish(
    outcome: Result<Value>,
    token: Option<u64>,
    endpoint: &Endpoint,
    outbound: &mpsc::UnboundedSender<Frame>,
) {
    match outcome {
        Ok(data) => {
            if endpoint.send(Message { data, token }).is_err() {
                warn!("reply channel closed");
            }
        }
        Err(e) => {
            error!("handler dispatch failed: {e}");
            let _ = outbound.send(Frame::Error {
                token,
                message: e.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::dispatch::Handler;
    use ferry_core::module::PortHook;
    use serde_json::json;

    #[tokio::test]
    async fn reserved_worker_sends_only_the_lifecycle_ack() {
        let (host_io, worker_io) = tokio::io::duplex(64 * 1024);
        let (mut host_r, mut host_w) = tokio::io::split(host_io);
        let (worker_r, worker_w) = tokio::io::split(worker_io);
        let worker = tokio::spawn(run(worker_r, worker_w));

        write_frame(&mut host_w, &Frame::Init { module_path: None })
            .await
            .unwrap();
        write_frame(
            &mut host_w,
            &Frame::Message {
                data: json!("anyone there"),
                token: None,
            },
        )
        .await
        .unwrap();

        let first = read_frame(&mut host_r).await.unwrap().unwrap();
        assert!(matches!(first, Frame::Started));

        // No unsolicited frames follow.
        let quiet =
            tokio::time::timeout(Duration::from_millis(200), read_frame(&mut host_r)).await;
        assert!(quiet.is_err());

        write_frame(&mut host_w, &Frame::Shutdown).await.unwrap();
        let ack = read_frame(&mut host_r).await.unwrap().unwrap();
        assert!(matches!(ack, Frame::ShuttingDown));

        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn empty_module_path_leaves_worker_idle() {
        let (host_io, worker_io) = tokio::io::duplex(64 * 1024);
        let (mut host_r, mut host_w) = tokio::io::split(host_io);
        let (worker_r, worker_w) = tokio::io::split(worker_io);
        let _worker = tokio::spawn(run(worker_r, worker_w));

        write_frame(
            &mut host_w,
            &Frame::Init {
                module_path: Some(String::new()),
            },
        )
        .await
        .unwrap();

        let first = read_frame(&mut host_r).await.unwrap().unwrap();
        assert!(matches!(first, Frame::Started));

        write_frame(
            &mut host_w,
            &Frame::Message {
                data: json!(1),
                token: Some(1),
            },
        )
        .await
        .unwrap();

        let quiet =
            tokio::time::timeout(Duration::from_millis(200), read_frame(&mut host_r)).await;
        assert!(quiet.is_err());
    }

    #[tokio::test]
    async fn sync_handler_reply_echoes_the_token() {
        let (module_ep, wire_ep) = channel::pair();
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();

        let module = Module {
            main: Handler::sync_fn(|data| Ok(json!({ "echo": data }))),
            port: None,
        };
        install(module, module_ep, outbound_tx).await;

        let mut replies = wire_ep.take_inbox().unwrap();
        wire_ep.send(Message::with_token(json!("ping"), 9)).unwrap();

        let reply = replies.recv().await.unwrap();
        assert_eq!(reply.data, json!({ "echo": "ping" }));
        assert_eq!(reply.token, Some(9));
    }

    #[tokio::test]
    async fn async_handlers_complete_out_of_dispatch_order() {
        let (module_ep, wire_ep) = channel::pair();
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();

        let module = Module {
            main: Handler::async_fn(|data| async move {
                let delay = data["delay_ms"].as_u64().unwrap();
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(data["id"].clone())
            }),
            port: None,
        };
        install(module, module_ep, outbound_tx).await;

        let mut replies = wire_ep.take_inbox().unwrap();
        wire_ep
            .send(Message::new(json!({"id": "slow", "delay_ms": 200})))
            .unwrap();
        wire_ep
            .send(Message::new(json!({"id": "fast", "delay_ms": 10})))
            .unwrap();

        assert_eq!(replies.recv().await.unwrap().data, json!("fast"));
        assert_eq!(replies.recv().await.unwrap().data, json!("slow"));
    }

    #[tokio::test]
    async fn failed_dispatch_reports_a_structured_error() {
        let (module_ep, wire_ep) = channel::pair();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();

        let module = Module {
            main: Handler::sync_fn(|_| Err("refused".into())),
            port: None,
        };
        install(module, module_ep, outbound_tx).await;

        let mut replies = wire_ep.take_inbox().unwrap();
        wire_ep.send(Message::with_token(json!("boom"), 3)).unwrap();

        match outbound_rx.recv().await.unwrap() {
            Frame::Error { token, message } => {
                assert_eq!(token, Some(3));
                assert!(message.contains("refused"));
            }
            other => panic!("wrong frame: {other:?}"),
        }
        // No reply message accompanies the failure.
        let quiet = tokio::time::timeout(Duration::from_millis(100), replies.recv()).await;
        assert!(quiet.is_err());
    }

    #[tokio::test]
    async fn port_hook_runs_before_dispatch_binds() {
        let (module_ep, wire_ep) = channel::pair();
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();

        let module = Module {
            main: Handler::sync_fn(|data| Ok(data)),
            port: Some(PortHook::sync_fn(|endpoint| {
                endpoint.send(Message::new(json!("port-hello")))?;
                Ok(())
            })),
        };
        install(module, module_ep, outbound_tx).await;

        let mut outgoing = wire_ep.take_inbox().unwrap();
        assert_eq!(outgoing.recv().await.unwrap().data, json!("port-hello"));
    }

    #[tokio::test]
    async fn failing_port_hook_does_not_abort_startup() {
        let (module_ep, wire_ep) = channel::pair();
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();

        let module = Module {
            main: Handler::sync_fn(|data| Ok(data)),
            port: Some(PortHook::async_fn(|_| async { Err("port down".into()) })),
        };
        install(module, module_ep, outbound_tx).await;

        let mut replies = wire_ep.take_inbox().unwrap();
        wire_ep.send(Message::new(json!("still alive"))).unwrap();
        assert_eq!(replies.recv().await.unwrap().data, json!("still alive"));
    }
}
