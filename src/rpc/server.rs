use crate::errors::{NodeError, Result};
use crate::rpc::{RequestHandler, RpcConfig};
use crate::wire::{
    read_frame, state_from_wire, write_frame, RequestBody, RequestFrame, ResponseBody,
    ResponseFrame, WireError,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bounded worker pool for inbound handlers.
const MAX_CONCURRENT_HANDLERS: usize = 32;

/// Longest accepted request id, in bytes.
const MAX_REQUEST_ID_BYTES: usize = 256;

/// Inbound RPC server hosting the six service methods.
///
/// Accepts concurrent calls; independent calls on one connection are
/// handled in parallel and may complete in any order.
pub struct RpcServer {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcServer {
    /// Bind and start accepting. Port 0 binds an ephemeral port,
    /// reported by [`local_addr`](RpcServer::local_addr).
    pub async fn bind(
        addr: SocketAddr,
        handler: Arc<dyn RequestHandler>,
        config: RpcConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();

        let task = tokio::spawn(accept_loop(listener, handler, config, cancel.clone()));

        info!(addr = %local_addr, "RPC server listening");

        Ok(Self {
            local_addr,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and tear down open connections. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
    config: RpcConfig,
    cancel: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_HANDLERS));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let _ = stream.set_nodelay(true);
                    tokio::spawn(connection_loop(
                        stream,
                        remote,
                        handler.clone(),
                        config.clone(),
                        semaphore.clone(),
                        cancel.child_token(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            }
        }
    }
}

async fn connection_loop(
    stream: TcpStream,
    remote: SocketAddr,
    handler: Arc<dyn RequestHandler>,
    config: RpcConfig,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    let (mut rd, wr) = stream.into_split();
    let max = config.max_message_bytes;

    // single writer keeps response frames whole under concurrent handlers
    let (resp_tx, mut resp_rx) = mpsc::channel::<ResponseFrame>(64);
    let writer = tokio::spawn(async move {
        let mut wr = wr;
        while let Some(frame) = resp_rx.recv().await {
            if let Err(e) = write_frame(&mut wr, &frame, max).await {
                debug!(error = %e, "response write failed");
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame::<_, RequestFrame>(&mut rd, max) => {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(remote = %remote, error = %e, "connection closed");
                        break;
                    }
                };
                let seq = frame.seq;

                // keep-alives bypass the worker pool
                if matches!(frame.body, RequestBody::Ping) {
                    let body = ResponseBody::Pong {
                        healthy: handler.is_healthy(),
                    };
                    if resp_tx.send(ResponseFrame { seq, body }).await.is_err() {
                        break;
                    }
                    continue;
                }

                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let handler = handler.clone();
                let resp_tx = resp_tx.clone();
                tokio::spawn(async move {
                    let body = dispatch(handler.as_ref(), frame.body).await;
                    let _ = resp_tx.send(ResponseFrame { seq, body }).await;
                    drop(permit);
                });
            }
        }
    }

    // writer drains once every in-flight handler drops its sender
    drop(resp_tx);
    let _ = writer.await;
}

async fn dispatch(handler: &dyn RequestHandler, body: RequestBody) -> ResponseBody {
    match route(handler, body).await {
        Ok(response) => response,
        Err(e) => {
            debug!(error = %e, "handler returned error");
            ResponseBody::Error(WireError::from(&e))
        }
    }
}

async fn route(handler: &dyn RequestHandler, body: RequestBody) -> Result<ResponseBody> {
    match body {
        RequestBody::Prompt {
            shard,
            prompt,
            request_id,
            state,
        } => {
            let request_id = normalize_request_id(request_id)?;
            let tensor = handler
                .handle_prompt(shard, prompt, request_id, state_from_wire(state))
                .await?;
            Ok(ResponseBody::Tensor(tensor))
        }
        RequestBody::Tensor {
            shard,
            tensor,
            request_id,
            state,
        } => {
            let request_id = normalize_request_id(request_id)?;
            let tensor = handler
                .handle_tensor(shard, tensor, request_id, state_from_wire(state))
                .await?;
            Ok(ResponseBody::Tensor(tensor))
        }
        RequestBody::Topology { visited, max_depth } => {
            let topology = handler.handle_topology(visited, max_depth).await?;
            Ok(ResponseBody::Topology(topology))
        }
        RequestBody::Result {
            request_id,
            token_ids,
            is_finished,
        } => {
            let request_id = normalize_request_id(request_id)?;
            handler
                .handle_result(request_id, token_ids, is_finished)
                .await?;
            Ok(ResponseBody::Ack)
        }
        RequestBody::OpaqueStatus { request_id, status } => {
            let request_id = normalize_request_id(request_id)?;
            handler.handle_opaque_status(request_id, status).await?;
            Ok(ResponseBody::Ack)
        }
        RequestBody::Ping => Ok(ResponseBody::Pong {
            healthy: handler.is_healthy(),
        }),
    }
}

/// Reject oversized request ids; synthesize one when the caller sent none.
fn normalize_request_id(request_id: String) -> Result<String> {
    if request_id.len() > MAX_REQUEST_ID_BYTES {
        return Err(NodeError::MalformedRequest(format!(
            "request id of {} bytes exceeds {}",
            request_id.len(),
            MAX_REQUEST_ID_BYTES
        )));
    }
    if request_id.is_empty() {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        return Ok(format!(
            "node_{}_{:06x}",
            ts,
            rand::random::<u32>() & 0xff_ffff
        ));
    }
    Ok(request_id)
}
