// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Self-Healing AMQP Channel
//!
//! This module provides [`ChannelSupervisor`], the owner of one channel on the
//! shared broker connection. A background task watches the channel and, when
//! the broker or the network closes it, re-establishes a fresh one with a
//! fixed backoff, re-dialing the shared connection first when needed.
//!
//! Every channel-scoped operation (declare, bind, publish, consume, cancel)
//! acts on whatever channel is current at call time, so a reconnection is
//! transparent to callers that simply re-issue their call after a failure.
//! The supervisor is the sole writer of the channel slot; at most one channel
//! is open per supervisor at any instant, and the superseded channel is closed
//! explicitly to keep the transport's channel budget bounded (the server caps
//! concurrently open channels at around 2047).

use crate::{
    connection::SharedConnection, errors::AmqpError, exchange::ExchangeKind, queue::QueueInfo,
};
use lapin::{
    options::{
        BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{FieldTable, ShortString},
    BasicProperties, Channel, Consumer,
};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::{sync::RwLock, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Content type stamped on plain publishes
pub const TEXT_CONTENT_TYPE: &str = "text/plain";
/// Content type stamped on JSON publishes
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Fixed wait between channel re-acquisition attempts
pub const REDIAL_BACKOFF: Duration = Duration::from_secs(10);

/// How often the monitor probes the current channel for closure
const CLOSE_PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// AMQP reply code for a deliberate, successful close
const REPLY_SUCCESS: u16 = 200;

/// Owns one channel on the shared connection and keeps it alive.
///
/// Constructed with [`ChannelSupervisor::new`], which dials the connection if
/// needed, opens the channel and spawns the monitoring task. Dropped channels
/// are replaced in the background; [`ChannelSupervisor::close`] stops the
/// monitor and closes the current channel for good.
pub struct ChannelSupervisor {
    connection: SharedConnection,
    channel: RwLock<Arc<Channel>>,
    stop: CancellationToken,
}

impl ChannelSupervisor {
    /// Opens a channel on the shared connection and starts monitoring it.
    ///
    /// # Returns
    /// * `Result<Arc<ChannelSupervisor>, AmqpError>` - The supervisor on
    ///   success, `AmqpError::ConnectionError` when the broker cannot be
    ///   reached, or `AmqpError::ChannelError` when the channel open fails.
    pub async fn new(connection: SharedConnection) -> Result<Arc<ChannelSupervisor>, AmqpError> {
        let channel = connection.open_channel().await?;

        let supervisor = Arc::new(ChannelSupervisor {
            connection,
            channel: RwLock::new(Arc::new(channel)),
            stop: CancellationToken::new(),
        });

        tokio::spawn(supervisor.clone().redial());

        Ok(supervisor)
    }

    /// Returns the channel that is current right now.
    ///
    /// The monitor may replace it at any moment; callers hold a snapshot and
    /// must treat operation failures on it as transient.
    pub async fn current(&self) -> Arc<Channel> {
        self.channel.read().await.clone()
    }

    /// Monitors the current channel and re-establishes it when it closes.
    ///
    /// Runs until [`ChannelSupervisor::close`] cancels the stop token. When a
    /// closure is observed, the task enters a retry loop that re-checks the
    /// stop token on every iteration, so shutdown interrupts reconnection.
    /// Re-acquisition failures are logged and retried forever with a fixed
    /// backoff; no error ever escapes this task.
    async fn redial(self: Arc<ChannelSupervisor>) {
        loop {
            let current = self.current().await;

            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = wait_closed(&current) => {
                    warn!(state = ?current.status().state(), "channel closed");

                    loop {
                        if self.stop.is_cancelled() {
                            return;
                        }

                        info!("reconnecting...");
                        match self.reacquire().await {
                            Ok(()) => {
                                info!("channel re-established");
                                break;
                            }
                            Err(err) => {
                                error!(error = err.to_string(), "reconnect error");

                                tokio::select! {
                                    _ = self.stop.cancelled() => return,
                                    _ = time::sleep(REDIAL_BACKOFF) => {}
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Swaps a fresh channel into the slot, then closes the superseded one.
    ///
    /// The fresh channel is opened first so concurrent operations never
    /// observe an empty slot. Opening re-verifies the shared connection and
    /// re-dials it when it is gone.
    async fn reacquire(&self) -> Result<(), AmqpError> {
        let fresh = self.connection.open_channel().await?;

        let stale = {
            let mut slot = self.channel.write().await;
            std::mem::replace(&mut *slot, Arc::new(fresh))
        };

        if stale.status().connected() {
            if let Err(err) = stale.close(REPLY_SUCCESS, "superseded").await {
                warn!(error = err.to_string(), "failure to close superseded channel");
            }
        }

        Ok(())
    }

    /// Declares a durable exchange of the given kind.
    ///
    /// The declaration is idempotent on the broker side: re-declaring with
    /// identical arguments is a no-op.
    pub async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", name);

        let channel = self.current().await;
        match channel
            .exchange_declare(
                name,
                kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: true,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(name.to_owned()))
            }
            _ => Ok(()),
        }
    }

    /// Declares a durable queue and returns its broker-reported metadata.
    pub async fn declare_queue(&self, name: &str) -> Result<QueueInfo, AmqpError> {
        debug!("creating queue: {}", name);

        let channel = self.current().await;
        match channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: false,
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(queue) => Ok(QueueInfo::from(queue)),
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = name,
                    "error to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
        }
    }

    /// Binds a queue to an exchange with a routing key.
    pub async fn bind_queue(
        &self,
        queue: &str,
        routing_key: &str,
        exchange: &str,
    ) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue, exchange, routing_key
        );

        let channel = self.current().await;
        match channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindQueueError(
                    queue.to_owned(),
                    exchange.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }

    /// Publishes a plain-text message to an exchange.
    ///
    /// Non-mandatory, non-immediate, stamped with a fresh message id.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), AmqpError> {
        self.publish_with(exchange, routing_key, body, TEXT_CONTENT_TYPE)
            .await
    }

    /// Serializes a payload as JSON and publishes it to an exchange.
    pub async fn publish_json<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + Sync,
    {
        let body = match serde_json::to_vec(payload) {
            Ok(body) => Ok(body),
            Err(err) => {
                error!(error = err.to_string(), "failure to serialize payload");
                Err(AmqpError::SerializePayloadError)
            }
        }?;

        self.publish_with(exchange, routing_key, &body, JSON_CONTENT_TYPE)
            .await
    }

    async fn publish_with(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        content_type: &str,
    ) -> Result<(), AmqpError> {
        let channel = self.current().await;
        match channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: false,
                    immediate: false,
                },
                body,
                BasicProperties::default()
                    .with_content_type(ShortString::from(content_type))
                    .with_message_id(ShortString::from(Uuid::new_v4().to_string())),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    /// Starts a delivery stream on a queue for the given consumer tag.
    ///
    /// The stream requires explicit acknowledgement and ends when the channel
    /// closes or the consumer is cancelled; callers re-attach by calling
    /// `consume` again, which picks up whatever channel is current by then.
    pub async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Consumer, AmqpError> {
        let channel = self.current().await;
        match channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => Ok(consumer),
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerBindError(consumer_tag.to_owned()))
            }
        }
    }

    /// Stops deliveries to the consumer identified by the tag.
    pub async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let channel = self.current().await;
        match channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to cancel the consumer");
                Err(AmqpError::CancelConsumerError(consumer_tag.to_owned()))
            }
            _ => Ok(()),
        }
    }

    /// Stops the monitoring task and closes the current channel.
    ///
    /// The stop token is a broadcast signal, so calling `close` again is
    /// harmless; a second call finds the channel already closed and returns
    /// `Ok`. The supervisor must not be used afterwards.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.stop.cancel();

        let channel = self.current().await;
        if !channel.status().connected() {
            return Ok(());
        }

        match channel.close(REPLY_SUCCESS, "closing").await {
            Err(err) => {
                error!(error = err.to_string(), "error to close the channel");
                Err(AmqpError::CloseChannelError)
            }
            _ => Ok(()),
        }
    }
}

/// Resolves once the channel is no longer connected.
async fn wait_closed(channel: &Channel) {
    while channel.status().connected() {
        time::sleep(CLOSE_PROBE_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AmqpConfig;

    #[tokio::test]
    async fn new_surfaces_connection_error_for_unreachable_broker() {
        let connection = SharedConnection::new(AmqpConfig {
            host: "127.0.0.1".to_owned(),
            port: 1,
            ..AmqpConfig::default()
        });

        let result = ChannelSupervisor::new(connection).await;

        assert!(matches!(result.err(), Some(AmqpError::ConnectionError)));
    }
}
