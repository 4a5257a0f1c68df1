use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};

use super::{CallError, Handler, ReplyEnvelope, Transport, TransportError, Worker};

/// In-process transport backend built on tokio channels.
///
/// Each method and job queue is a single mpsc channel whose receiver is
/// shared by all registered pool members, which gives competing-consumer
/// delivery without a broker. Used by tests and single-process deployments.
#[derive(Debug, Default, Clone)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    methods: Mutex<HashMap<String, RpcChannel>>,
    queues: Mutex<HashMap<String, JobChannel>>,
}

#[derive(Debug, Clone)]
struct RpcChannel {
    tx: mpsc::UnboundedSender<RpcRequest>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<RpcRequest>>>,
}

#[derive(Debug)]
struct RpcRequest {
    args: Value,
    reply: oneshot::Sender<ReplyEnvelope>,
}

#[derive(Debug, Clone)]
struct JobChannel {
    tx: mpsc::UnboundedSender<Value>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Value>>>,
}

impl MemoryTransport {
    async fn rpc_channel(&self, method: &str) -> RpcChannel {
        let mut methods = self.inner.methods.lock().await;
        methods
            .entry(method.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                RpcChannel {
                    tx,
                    rx: Arc::new(Mutex::new(rx)),
                }
            })
            .clone()
    }

    async fn job_channel(&self, queue: &str) -> JobChannel {
        let mut queues = self.inner.queues.lock().await;
        queues
            .entry(queue.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                JobChannel {
                    tx,
                    rx: Arc::new(Mutex::new(rx)),
                }
            })
            .clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn call(&self, method: &str, args: Value, timeout: Duration) -> Result<Value, CallError> {
        let channel = self.rpc_channel(method).await;
        let (reply_tx, reply_rx) = oneshot::channel();

        channel
            .tx
            .send(RpcRequest {
                args,
                reply: reply_tx,
            })
            .map_err(|_| CallError::Transport("request channel closed".to_string()))?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Err(_) => Err(CallError::Timeout(timeout)),
            Ok(Err(_)) => Err(CallError::Transport("reply channel closed".to_string())),
            Ok(Ok(envelope)) => envelope.into_result(),
        }
    }

    async fn register_handler(
        &self,
        method: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<(), TransportError> {
        let channel = self.rpc_channel(method).await;
        let rx = channel.rx.clone();

        tokio::spawn(async move {
            loop {
                // Hold the receiver lock only while waiting for the next
                // request, so pool members process in parallel.
                let request = { rx.lock().await.recv().await };
                let Some(request) = request else { break };

                let result = handler.handle(request.args).await;
                let _ = request.reply.send(ReplyEnvelope::from_result(result));
            }
        });

        Ok(())
    }

    async fn enqueue_job(&self, queue: &str, payload: Value) -> Result<(), TransportError> {
        let channel = self.job_channel(queue).await;
        channel
            .tx
            .send(payload)
            .map_err(|e| TransportError::PublishError(e.to_string()))
    }

    async fn register_worker(
        &self,
        queue: &str,
        worker: Arc<dyn Worker>,
    ) -> Result<(), TransportError> {
        let channel = self.job_channel(queue).await;
        let rx = channel.rx.clone();
        let tx = channel.tx.clone();
        let queue = queue.to_string();

        tokio::spawn(async move {
            loop {
                let payload = { rx.lock().await.recv().await };
                let Some(payload) = payload else { break };

                if let Err(e) = worker.process(payload.clone()).await {
                    tracing::warn!(queue = %queue, "job failed, re-enqueueing: {e}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    let _ = tx.send(payload);
                }
            }
        });

        Ok(())
    }
}
