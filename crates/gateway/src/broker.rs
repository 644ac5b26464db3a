//! The broker adapter: a thin capability surface over AMQP.
//!
//! Commands are published to durable queues named after the command (plus the
//! configured prefix); each in-flight call consumes replies from its own
//! exclusive temporary queue. The pipeline only sees the [`Broker`] trait so
//! it can run against an in-memory implementation in tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::{mpsc, RwLock};

#[derive(Debug, Clone)]
pub struct BrokerError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for BrokerError {}

/// One message consumed from a queue.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub correlation_id: String,
    pub body: Vec<u8>,
    pub reply_to: String,
    pub routing_key: String,
}

/// An exclusive temporary queue for one call's worker replies. Dropping it
/// closes the backing channel, which deletes the queue broker-side.
pub struct ReplyQueue {
    pub name: String,
    deliveries: mpsc::Receiver<Delivery>,
    closer: Option<Box<dyn FnOnce() + Send>>,
}

impl ReplyQueue {
    pub fn new(
        name: String,
        deliveries: mpsc::Receiver<Delivery>,
        closer: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        Self {
            name,
            deliveries,
            closer,
        }
    }

    pub async fn next(&mut self) -> Option<Delivery> {
        self.deliveries.recv().await
    }
}

impl Drop for ReplyQueue {
    fn drop(&mut self) {
        if let Some(closer) = self.closer.take() {
            closer();
        }
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Publishes a persistent JSON message to `routing_key`, correlated by
    /// the request id and answered on `reply_to`.
    async fn publish(
        &self,
        routing_key: &str,
        body: &[u8],
        correlation_id: &str,
        reply_to: &str,
    ) -> Result<(), BrokerError>;

    /// Opens an exclusive temporary reply queue on a fresh channel.
    async fn open_reply_queue(&self) -> Result<ReplyQueue, BrokerError>;

    fn is_connected(&self) -> bool;
}

struct AmqpHandles {
    connection: Connection,
    channel: Channel,
}

/// Broker adapter over a shared AMQP connection. Each call gets its own
/// channel where possible; publishing uses the shared channel.
pub struct AmqpBroker {
    url: String,
    state: RwLock<AmqpHandles>,
    connected: AtomicBool,
    close_tx: mpsc::Sender<()>,
    close_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl AmqpBroker {
    /// Connects to the broker URL (TLS when the scheme is `amqps`).
    pub async fn connect(url: &str) -> Result<Arc<Self>, BrokerError> {
        let (close_tx, close_rx) = mpsc::channel(1);
        let handles = Self::dial(url, &close_tx).await?;
        Ok(Arc::new(Self {
            url: url.to_string(),
            state: RwLock::new(handles),
            connected: AtomicBool::new(true),
            close_tx,
            close_rx: tokio::sync::Mutex::new(close_rx),
        }))
    }

    async fn dial(url: &str, close_tx: &mpsc::Sender<()>) -> Result<AmqpHandles, BrokerError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|err| BrokerError {
                code: "ERR_MQ_CONNECT",
                message: err.to_string(),
            })?;

        let close_tx = close_tx.clone();
        connection.on_error(move |err| {
            tracing::warn!(error = %err, "mq_error");
            let _ = close_tx.try_send(());
        });

        let channel = connection.create_channel().await.map_err(|err| BrokerError {
            code: "ERR_MQ_CHANNEL",
            message: err.to_string(),
        })?;

        Ok(AmqpHandles { connection, channel })
    }

    /// Watches for connection loss and retries every second until the broker
    /// is back, then signals long-lived consumers to re-subscribe. In-flight
    /// calls keep their abandoned reply queues and resolve by timeout or
    /// zombie on the engine side.
    pub fn spawn_reconnect(
        self: &Arc<Self>,
        resubscribe: mpsc::Sender<()>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let broker = self.clone();
        tokio::spawn(async move {
            loop {
                {
                    let mut close_rx = broker.close_rx.lock().await;
                    tokio::select! {
                        closed = close_rx.recv() => {
                            if closed.is_none() {
                                return;
                            }
                        }
                        _ = shutdown.changed() => return,
                    }
                }

                broker.connected.store(false, Ordering::SeqCst);
                tracing::warn!("mq_disconnect");

                loop {
                    match Self::dial(&broker.url, &broker.close_tx).await {
                        Ok(handles) => {
                            *broker.state.write().await = handles;
                            broker.connected.store(true, Ordering::SeqCst);
                            tracing::info!("mq_reconnect");
                            let _ = resubscribe.send(()).await;
                            break;
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "mq_reconnect_failed");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        });
    }

    /// Consumes the durable worker error queue with manual acks, logging each
    /// message at warn level. Re-subscribes whenever `resubscribe` fires.
    pub fn spawn_error_queue_consumer(
        self: &Arc<Self>,
        queue_name: String,
        mut resubscribe: mpsc::Receiver<()>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let broker = self.clone();
        tokio::spawn(async move {
            loop {
                match broker.consume_named_queue(&queue_name).await {
                    Ok(mut consumer) => {
                        let reconnected = loop {
                            tokio::select! {
                                delivery = consumer.next() => {
                                    match delivery {
                                        Some(Ok(delivery)) => {
                                            if !delivery.routing_key.as_str().is_empty() {
                                                tracing::warn!(
                                                    data = %String::from_utf8_lossy(&delivery.data),
                                                    "worker_log",
                                                );
                                            }
                                            let _ = delivery.ack(BasicAckOptions::default()).await;
                                        }
                                        Some(Err(err)) => {
                                            tracing::warn!(error = %err, "worker_log_consume_error");
                                        }
                                        None => break false,
                                    }
                                }
                                _ = resubscribe.recv() => break true,
                                _ = shutdown.changed() => return,
                            }
                        };
                        if reconnected {
                            continue;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "worker_error_queue_unavailable");
                    }
                }

                // The stream died or the consume failed: wait for a
                // reconnect before resubscribing so a dead broker doesn't
                // spin this task.
                tokio::select! {
                    signal = resubscribe.recv() => {
                        if signal.is_none() {
                            return;
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    async fn consume_named_queue(
        &self,
        name: &str,
    ) -> Result<lapin::Consumer, BrokerError> {
        let channel = self.state.read().await.channel.clone();
        channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| BrokerError {
                code: "ERR_MQ_QUEUE",
                message: err.to_string(),
            })?;

        channel
            .basic_consume(
                name,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| BrokerError {
                code: "ERR_MQ_CONSUME",
                message: err.to_string(),
            })
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn publish(
        &self,
        routing_key: &str,
        body: &[u8],
        correlation_id: &str,
        reply_to: &str,
    ) -> Result<(), BrokerError> {
        let channel = self.state.read().await.channel.clone();

        let mut properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_content_type("application/json".into())
            .with_correlation_id(correlation_id.into());
        if !reply_to.is_empty() {
            properties = properties.with_reply_to(reply_to.into());
        }

        channel
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(|err| BrokerError {
                code: "ERR_MQ_PUBLISH",
                message: err.to_string(),
            })?
            .await
            .map_err(|err| BrokerError {
                code: "ERR_MQ_PUBLISH",
                message: err.to_string(),
            })?;
        Ok(())
    }

    async fn open_reply_queue(&self) -> Result<ReplyQueue, BrokerError> {
        let state = self.state.read().await;

        // A dedicated channel isolates this call's consumer; fall back to the
        // shared channel when one can't be created.
        let (channel, dedicated) = match state.connection.create_channel().await {
            Ok(channel) => {
                let _ = channel.basic_qos(1, BasicQosOptions::default()).await;
                (channel, true)
            }
            Err(err) => {
                tracing::error!(error = %err, "mq_channel_error");
                (state.channel.clone(), false)
            }
        };
        drop(state);

        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| BrokerError {
                code: "ERR_MQ_QUEUE",
                message: err.to_string(),
            })?;
        let name = queue.name().as_str().to_string();

        let mut consumer = channel
            .basic_consume(
                &name,
                &name,
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| BrokerError {
                code: "ERR_MQ_CONSUME",
                message: err.to_string(),
            })?;

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        let mapped = Delivery {
                            correlation_id: delivery
                                .properties
                                .correlation_id()
                                .as_ref()
                                .map(|v| v.as_str().to_string())
                                .unwrap_or_default(),
                            reply_to: delivery
                                .properties
                                .reply_to()
                                .as_ref()
                                .map(|v| v.as_str().to_string())
                                .unwrap_or_default(),
                            routing_key: delivery.routing_key.as_str().to_string(),
                            body: delivery.data,
                        };
                        if tx.send(mapped).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "mq_consume_error");
                        return;
                    }
                }
            }
        });

        // Closing the channel deletes the exclusive queue. On the shared
        // channel the queue is left to auto-delete instead.
        let closer: Option<Box<dyn FnOnce() + Send>> = dedicated.then(|| {
            let close_channel = channel.clone();
            Box::new(move || {
                tokio::spawn(async move {
                    let _ = close_channel.close(200, "call complete").await;
                });
            }) as Box<dyn FnOnce() + Send>
        });

        Ok(ReplyQueue::new(name, rx, closer))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
