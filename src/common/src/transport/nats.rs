use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, consumer, stream};
use async_nats::Client;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;

use super::{CallError, Handler, ReplyEnvelope, Transport, TransportError, Worker};
use crate::error::Fault;

const JOB_STREAM: &str = "picstream-jobs";

/// NATS transport backend.
///
/// Request/reply uses core NATS with queue groups, so each request is served
/// by exactly one member of the handler pool. Jobs go through a JetStream
/// stream with durable pull consumers and are acknowledged only after the
/// worker succeeds, which yields at-least-once delivery with redelivery of
/// failed jobs.
#[derive(Debug, Clone)]
pub struct NatsTransport {
    client: Client,
    jetstream: jetstream::Context,
}

impl NatsTransport {
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        let jetstream = jetstream::new(client.clone());
        jetstream
            .get_or_create_stream(stream::Config {
                name: JOB_STREAM.to_string(),
                subjects: vec!["jobs.>".to_string()],
                ..Default::default()
            })
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        Ok(Self { client, jetstream })
    }

    fn rpc_subject(method: &str) -> String {
        format!("rpc.{method}")
    }

    fn job_subject(queue: &str) -> String {
        format!("jobs.{queue}")
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn call(&self, method: &str, args: Value, timeout: Duration) -> Result<Value, CallError> {
        let payload =
            serde_json::to_vec(&args).map_err(|e| CallError::Transport(e.to_string()))?;

        let request = self
            .client
            .request(Self::rpc_subject(method), payload.into());

        match tokio::time::timeout(timeout, request).await {
            Err(_) => Err(CallError::Timeout(timeout)),
            Ok(Err(e)) => Err(CallError::Transport(e.to_string())),
            Ok(Ok(message)) => ReplyEnvelope::from_bytes(&message.payload)
                .map_err(|e| CallError::Transport(format!("malformed reply envelope: {e}")))?
                .into_result(),
        }
    }

    async fn register_handler(
        &self,
        method: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<(), TransportError> {
        let mut subscriber = self
            .client
            .queue_subscribe(Self::rpc_subject(method), format!("{method}-pool"))
            .await
            .map_err(|e| TransportError::SubscribeError(e.to_string()))?;

        let client = self.client.clone();
        let method = method.to_string();

        tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                let envelope = match serde_json::from_slice::<Value>(&message.payload) {
                    Ok(args) => ReplyEnvelope::from_result(handler.handle(args).await),
                    Err(e) => ReplyEnvelope::from_result(Err(Fault::validation(format!(
                        "malformed request: {e}"
                    )))),
                };

                let Some(reply) = message.reply else {
                    tracing::warn!(method = %method, "request without reply subject dropped");
                    continue;
                };
                match envelope.to_bytes() {
                    Ok(bytes) => {
                        if let Err(e) = client.publish(reply, bytes.into()).await {
                            tracing::warn!(method = %method, "failed to publish reply: {e}");
                        }
                    }
                    Err(e) => tracing::error!(method = %method, "failed to encode reply: {e}"),
                }
            }
        });

        Ok(())
    }

    async fn enqueue_job(&self, queue: &str, payload: Value) -> Result<(), TransportError> {
        let bytes = serde_json::to_vec(&payload)?;

        // Await the JetStream ack so the job is durably stored before the
        // caller proceeds.
        self.jetstream
            .publish(Self::job_subject(queue), bytes.into())
            .await
            .map_err(|e| TransportError::PublishError(e.to_string()))?
            .await
            .map_err(|e| TransportError::PublishError(e.to_string()))?;

        Ok(())
    }

    async fn register_worker(
        &self,
        queue: &str,
        worker: Arc<dyn Worker>,
    ) -> Result<(), TransportError> {
        let consumer: consumer::PullConsumer = self
            .jetstream
            .create_consumer_on_stream(
                consumer::pull::Config {
                    durable_name: Some(queue.to_string()),
                    filter_subject: Self::job_subject(queue),
                    ..Default::default()
                },
                JOB_STREAM,
            )
            .await
            .map_err(|e| TransportError::SubscribeError(e.to_string()))?;

        let queue = queue.to_string();

        tokio::spawn(async move {
            loop {
                let mut messages = match consumer.messages().await {
                    Ok(messages) => messages,
                    Err(e) => {
                        tracing::warn!(queue = %queue, "failed to pull jobs, retrying: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };

                while let Some(Ok(message)) = messages.next().await {
                    match serde_json::from_slice::<Value>(&message.payload) {
                        Ok(payload) => match worker.process(payload).await {
                            Ok(()) => {
                                if let Err(e) = message.ack().await {
                                    tracing::warn!(queue = %queue, "failed to ack job: {e}");
                                }
                            }
                            // Leave the job unacked; the broker redelivers it
                            // after the ack deadline.
                            Err(e) => tracing::warn!(queue = %queue, "job failed: {e}"),
                        },
                        Err(e) => {
                            tracing::error!(queue = %queue, "dropping malformed job: {e}");
                            let _ = message.ack().await;
                        }
                    }
                }
            }
        });

        Ok(())
    }
}
