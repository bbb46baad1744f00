use crate::errors::{NodeError, Result};
use crate::inference::InferenceState;
use crate::model::{Shard, Tensor};
use crate::rpc::RpcConfig;
use crate::topology::Topology;
use crate::wire::{
    read_frame, state_to_wire, write_frame, RequestBody, RequestFrame, ResponseBody, ResponseFrame,
};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, trace};

enum ConnCommand {
    Call {
        body: RequestBody,
        reply: oneshot::Sender<Result<ResponseBody>>,
    },
    Shutdown,
}

/// Outbound RPC client addressed to one remote peer.
///
/// A dedicated connection task owns the socket and multiplexes concurrent
/// calls by frame sequence number. Keep-alive pings detect dead peers
/// between calls. After [`close`](PeerHandle::close) every operation
/// fails with `PeerClosed`.
pub struct PeerHandle {
    peer_id: String,
    addr: SocketAddr,
    cmd_tx: mpsc::Sender<ConnCommand>,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
    config: RpcConfig,
}

impl PeerHandle {
    /// Dial a peer and start its connection task.
    pub async fn connect(
        peer_id: impl Into<String>,
        addr: SocketAddr,
        config: RpcConfig,
    ) -> Result<Self> {
        let peer_id = peer_id.into();
        let stream = timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NodeError::peer(&peer_id, "connect timed out"))?
            .map_err(|e| NodeError::peer(&peer_id, e))?;
        let _ = stream.set_nodelay(true);

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let task = tokio::spawn(connection_loop(
            stream,
            cmd_rx,
            config.clone(),
            peer_id.clone(),
        ));

        debug!(peer_id = %peer_id, addr = %addr, "peer handle connected");

        Ok(Self {
            peer_id,
            addr,
            cmd_tx,
            closed: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
            config,
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn transport_dead(&self) -> NodeError {
        if self.closed.load(Ordering::Acquire) {
            NodeError::PeerClosed
        } else {
            NodeError::peer(&self.peer_id, "connection closed")
        }
    }

    async fn call(&self, body: RequestBody) -> Result<ResponseBody> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NodeError::PeerClosed);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ConnCommand::Call {
                body,
                reply: reply_tx,
            })
            .await
            .map_err(|_| self.transport_dead())?;

        match timeout(self.config.call_deadline, reply_rx).await {
            Err(_) => Err(NodeError::Timeout),
            Ok(Err(_)) => Err(self.transport_dead()),
            Ok(Ok(result)) => result,
        }
    }

    fn expect_tensor(&self, body: ResponseBody) -> Result<Tensor> {
        match body {
            ResponseBody::Tensor(tensor) => {
                tensor.validate()?;
                Ok(tensor)
            }
            ResponseBody::Error(e) => Err(e.into_node_error()),
            other => Err(NodeError::peer(
                &self.peer_id,
                format!("unexpected response {:?}", other),
            )),
        }
    }

    /// Remote inference from text input.
    pub async fn send_prompt(
        &self,
        shard: Shard,
        prompt: String,
        request_id: String,
        state: Option<InferenceState>,
    ) -> Result<Tensor> {
        let body = RequestBody::Prompt {
            shard,
            prompt,
            request_id,
            state: state_to_wire(state),
        };
        let response = self.call(body).await?;
        self.expect_tensor(response)
    }

    /// Remote inference from tensor input.
    pub async fn send_tensor(
        &self,
        shard: Shard,
        tensor: Tensor,
        request_id: String,
        state: Option<InferenceState>,
    ) -> Result<Tensor> {
        let body = RequestBody::Tensor {
            shard,
            tensor,
            request_id,
            state: state_to_wire(state),
        };
        let response = self.call(body).await?;
        self.expect_tensor(response)
    }

    /// Recursive topology collection, excluding `visited` node ids.
    pub async fn collect_topology(
        &self,
        visited: HashSet<String>,
        max_depth: i32,
    ) -> Result<Topology> {
        let response = self
            .call(RequestBody::Topology { visited, max_depth })
            .await?;
        match response {
            ResponseBody::Topology(topology) => Ok(topology),
            ResponseBody::Error(e) => Err(e.into_node_error()),
            other => Err(NodeError::peer(
                &self.peer_id,
                format!("unexpected response {:?}", other),
            )),
        }
    }

    /// Deliver generated tokens upstream. Returns once the remote acks.
    pub async fn send_result(
        &self,
        request_id: String,
        token_ids: Vec<i32>,
        is_finished: bool,
    ) -> Result<()> {
        let response = self
            .call(RequestBody::Result {
                request_id,
                token_ids,
                is_finished,
            })
            .await?;
        match response {
            ResponseBody::Ack => Ok(()),
            ResponseBody::Error(e) => Err(e.into_node_error()),
            other => Err(NodeError::peer(
                &self.peer_id,
                format!("unexpected response {:?}", other),
            )),
        }
    }

    /// Never errors; false on any transport failure.
    pub async fn health_check(&self) -> bool {
        matches!(
            self.call(RequestBody::Ping).await,
            Ok(ResponseBody::Pong { healthy: true })
        )
    }

    /// Idempotent. Waits up to the close grace period for in-flight
    /// calls, then tears the connection down.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let _ = self.cmd_tx.try_send(ConnCommand::Shutdown);

        if let Some(task) = self.task.lock().await.take() {
            let abort = task.abort_handle();
            if timeout(self.config.close_grace, task).await.is_err() {
                abort.abort();
            }
        }

        debug!(peer_id = %self.peer_id, "peer handle closed");
    }
}

fn fail_pending(
    pending: &mut HashMap<u64, oneshot::Sender<Result<ResponseBody>>>,
    make_error: impl Fn() -> NodeError,
) {
    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(make_error()));
    }
}

async fn connection_loop(
    stream: TcpStream,
    mut cmd_rx: mpsc::Receiver<ConnCommand>,
    config: RpcConfig,
    peer_id: String,
) {
    let (rd, mut wr) = stream.into_split();
    let max = config.max_message_bytes;

    // dedicated reader so partially-read frames never race the select
    let (frame_tx, mut frame_rx) = mpsc::channel::<std::io::Result<ResponseFrame>>(64);
    let reader = tokio::spawn(async move {
        let mut rd = rd;
        loop {
            match read_frame::<_, ResponseFrame>(&mut rd, max).await {
                Ok(frame) => {
                    if frame_tx.send(Ok(frame)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = frame_tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });

    let mut pending: HashMap<u64, oneshot::Sender<Result<ResponseBody>>> = HashMap::new();
    let mut next_seq: u64 = 0;
    let mut keepalive_seq: Option<u64> = None;
    let mut last_pong = Instant::now();
    let mut ticker = interval(config.keepalive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut draining = false;

    loop {
        if draining && pending.is_empty() {
            break;
        }

        tokio::select! {
            cmd = cmd_rx.recv(), if !draining => match cmd {
                None | Some(ConnCommand::Shutdown) => {
                    draining = true;
                }
                Some(ConnCommand::Call { body, reply }) => {
                    next_seq += 1;
                    let frame = RequestFrame { seq: next_seq, body };
                    match write_frame(&mut wr, &frame, max).await {
                        Ok(()) => {
                            pending.insert(next_seq, reply);
                        }
                        Err(e) => {
                            let _ = reply.send(Err(NodeError::peer(&peer_id, &e)));
                            fail_pending(&mut pending, || {
                                NodeError::peer(&peer_id, "connection write failed")
                            });
                            reader.abort();
                            return;
                        }
                    }
                }
            },

            frame = frame_rx.recv() => match frame {
                Some(Ok(frame)) => {
                    if keepalive_seq == Some(frame.seq) {
                        keepalive_seq = None;
                        last_pong = Instant::now();
                    } else if let Some(reply) = pending.remove(&frame.seq) {
                        let _ = reply.send(Ok(frame.body));
                    } else {
                        trace!(peer_id = %peer_id, seq = frame.seq, "stray response frame");
                    }
                }
                Some(Err(e)) => {
                    debug!(peer_id = %peer_id, error = %e, "connection read failed");
                    fail_pending(&mut pending, || NodeError::peer(&peer_id, "connection read failed"));
                    break;
                }
                None => {
                    fail_pending(&mut pending, || NodeError::peer(&peer_id, "connection closed"));
                    break;
                }
            },

            _ = ticker.tick() => {
                if last_pong.elapsed() > config.keepalive + config.keepalive_timeout {
                    debug!(peer_id = %peer_id, "keep-alive timed out");
                    fail_pending(&mut pending, || NodeError::peer(&peer_id, "keep-alive timed out"));
                    break;
                }
                if keepalive_seq.is_none() {
                    next_seq += 1;
                    let frame = RequestFrame { seq: next_seq, body: RequestBody::Ping };
                    if let Err(e) = write_frame(&mut wr, &frame, max).await {
                        debug!(peer_id = %peer_id, error = %e, "keep-alive write failed");
                        fail_pending(&mut pending, || NodeError::peer(&peer_id, "connection write failed"));
                        break;
                    }
                    keepalive_seq = Some(next_seq);
                }
            }
        }
    }

    reader.abort();
    fail_pending(&mut pending, || NodeError::PeerClosed);
}
