use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::QueueConfig;
use crate::error::Fault;

pub mod memory;
pub mod nats;

pub use memory::MemoryTransport;
pub use nats::NatsTransport;

/// Error types that can occur in the transport plumbing itself,
/// as opposed to domain faults travelling inside replies.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect to broker: {0}")]
    ConnectionError(String),

    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("failed to subscribe: {0}")]
    SubscribeError(String),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Outcome of a request/reply call.
///
/// `Timeout` means the outcome is unknown: the request may have been applied
/// by a worker whose reply never arrived. Callers must not treat it as a
/// failed operation.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error(transparent)]
    Fault(#[from] Fault),

    #[error("call timed out after {0:?}; outcome unknown")]
    Timeout(Duration),

    #[error("transport failure: {0}")]
    Transport(String),
}

/// Wire envelope for replies. Exactly one of `ok` / `fault` is set.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<Fault>,
}

impl ReplyEnvelope {
    pub fn from_result(result: Result<Value, Fault>) -> Self {
        match result {
            Ok(value) => Self {
                ok: Some(value),
                fault: None,
            },
            Err(fault) => Self {
                ok: None,
                fault: Some(fault),
            },
        }
    }

    pub fn into_result(self) -> Result<Value, CallError> {
        match (self.ok, self.fault) {
            (_, Some(fault)) => Err(CallError::Fault(fault)),
            (Some(value), None) => Ok(value),
            (None, None) => Ok(Value::Null),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Request/reply handler. Domain errors are returned as [`Fault`]s and reach
/// the caller as structured replies.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, args: Value) -> Result<Value, Fault>;
}

/// Fire-and-forget job worker. A returned error leaves the job unacknowledged
/// so the broker redelivers it; workers must therefore be idempotent.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    async fn process(&self, payload: Value) -> anyhow::Result<()>;
}

/// Trait that must be implemented by all transport backends.
///
/// Both call shapes use competing consumers: each request or job is handled
/// by exactly one member of the registered pool, so coordinators and workers
/// scale horizontally.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Publish a request and await the matching reply or a timeout.
    async fn call(&self, method: &str, args: Value, timeout: Duration) -> Result<Value, CallError>;

    /// Join the competing-consumer pool for a method.
    async fn register_handler(
        &self,
        method: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<(), TransportError>;

    /// Publish a job with no reply expected; delivered at least once.
    async fn enqueue_job(&self, queue: &str, payload: Value) -> Result<(), TransportError>;

    /// Join the competing worker pool for a job queue.
    async fn register_worker(
        &self,
        queue: &str,
        worker: Arc<dyn Worker>,
    ) -> Result<(), TransportError>;
}

/// Typed wrapper around [`Transport::call`].
pub async fn request<Req, Resp>(
    transport: &dyn Transport,
    method: &str,
    request: &Req,
    timeout: Duration,
) -> Result<Resp, CallError>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let args = serde_json::to_value(request).map_err(|e| CallError::Transport(e.to_string()))?;
    let reply = transport.call(method, args, timeout).await?;
    serde_json::from_value(reply).map_err(|e| CallError::Transport(format!("malformed reply: {e}")))
}

/// Typed wrapper around [`Transport::enqueue_job`].
pub async fn enqueue<T>(
    transport: &dyn Transport,
    queue: &str,
    job: &T,
) -> Result<(), TransportError>
where
    T: Serialize,
{
    let payload = serde_json::to_value(job)?;
    transport.enqueue_job(queue, payload).await
}

/// Create a transport backend from queue configuration.
pub async fn create_transport(config: &QueueConfig) -> Result<Arc<dyn Transport>, TransportError> {
    match config.queue_type.as_str() {
        "memory" => Ok(Arc::new(MemoryTransport::default())),
        "nats" => Ok(Arc::new(NatsTransport::connect(&config.url).await?)),
        other => Err(TransportError::ConnectionError(format!(
            "unsupported queue type: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        async fn handle(&self, args: Value) -> Result<Value, Fault> {
            Ok(json!({ "echo": args }))
        }
    }

    struct RejectingHandler;

    #[async_trait]
    impl Handler for RejectingHandler {
        async fn handle(&self, _args: Value) -> Result<Value, Fault> {
            Err(Fault::Unauthorized)
        }
    }

    struct CountingWorker {
        seen: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Worker for CountingWorker {
        async fn process(&self, _payload: Value) -> anyhow::Result<()> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let transport = MemoryTransport::default();
        transport
            .register_handler("echo", Arc::new(EchoHandler))
            .await
            .unwrap();

        let reply = transport
            .call("echo", json!({"n": 1}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, json!({"echo": {"n": 1}}));
    }

    #[tokio::test]
    async fn test_domain_fault_propagates_as_structured_reply() {
        let transport = MemoryTransport::default();
        transport
            .register_handler("guarded", Arc::new(RejectingHandler))
            .await
            .unwrap();

        let err = transport
            .call("guarded", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            CallError::Fault(Fault::Unauthorized) => {}
            other => panic!("expected unauthorized fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_call_times_out_when_no_worker_replies() {
        let transport = MemoryTransport::default();

        let err = transport
            .call("nobody-home", json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_jobs_reach_exactly_one_worker() {
        let transport = MemoryTransport::default();
        let seen = Arc::new(AtomicUsize::new(0));

        // Two competing workers on the same queue
        for _ in 0..2 {
            transport
                .register_worker(
                    "cleanup",
                    Arc::new(CountingWorker { seen: seen.clone() }),
                )
                .await
                .unwrap();
        }

        for i in 0..4 {
            transport
                .enqueue_job("cleanup", json!({ "job": i }))
                .await
                .unwrap();
        }

        // Jobs are processed asynchronously; poll until they all land.
        for _ in 0..50 {
            if seen.load(Ordering::SeqCst) == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_failed_job_is_redelivered() {
        struct FlakyWorker {
            attempts: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl Worker for FlakyWorker {
            async fn process(&self, _payload: Value) -> anyhow::Result<()> {
                if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("transient failure");
                }
                Ok(())
            }
        }

        let transport = MemoryTransport::default();
        let attempts = Arc::new(AtomicUsize::new(0));
        transport
            .register_worker(
                "flaky",
                Arc::new(FlakyWorker {
                    attempts: attempts.clone(),
                }),
            )
            .await
            .unwrap();

        transport.enqueue_job("flaky", json!({})).await.unwrap();

        for _ in 0..100 {
            if attempts.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(attempts.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_competing_handlers_each_serve_requests() {
        struct TaggedHandler {
            tag: &'static str,
            served: Arc<Mutex<Vec<&'static str>>>,
        }

        #[async_trait]
        impl Handler for TaggedHandler {
            async fn handle(&self, _args: Value) -> Result<Value, Fault> {
                self.served.lock().await.push(self.tag);
                Ok(Value::Null)
            }
        }

        let transport = MemoryTransport::default();
        let served = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b"] {
            transport
                .register_handler(
                    "shared",
                    Arc::new(TaggedHandler {
                        tag,
                        served: served.clone(),
                    }),
                )
                .await
                .unwrap();
        }

        for _ in 0..6 {
            transport
                .call("shared", json!({}), Duration::from_secs(1))
                .await
                .unwrap();
        }

        // Every request was served exactly once, by one of the pool members.
        assert_eq!(served.lock().await.len(), 6);
    }

    #[test]
    fn test_reply_envelope_round_trip() {
        let ok = ReplyEnvelope::from_result(Ok(json!({"id": "x"})));
        let decoded = ReplyEnvelope::from_bytes(&ok.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.into_result().unwrap(), json!({"id": "x"}));

        let fault = ReplyEnvelope::from_result(Err(Fault::NotFound));
        let decoded = ReplyEnvelope::from_bytes(&fault.to_bytes().unwrap()).unwrap();
        match decoded.into_result().unwrap_err() {
            CallError::Fault(Fault::NotFound) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}
