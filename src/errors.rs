// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Client Layer
//!
//! This module provides the error types for connection, channel, topology,
//! publishing and consuming operations. Errors raised from setup-time calls are
//! returned to the immediate caller; errors arising inside the background
//! re-dial task or the consumption loops are logged and drive a retry policy
//! instead of being surfaced.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// This enum covers the error scenarios of the client layer: establishing the
/// shared connection, opening channels, declaring topology, publishing and the
/// per-message acknowledgement calls. Each variant provides specific context
/// about what operation failed.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error opening a channel on an established connection
    #[error("failure to open a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{0}` to exchange `{1}`")]
    BindQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error serializing a payload before publishing
    #[error("failure to serialize payload")]
    SerializePayloadError,

    /// Error starting a delivery stream for a consumer
    #[error("failure to start consumer `{0}`")]
    ConsumerBindError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error rejecting a message back to its queue
    #[error("failure to reject message")]
    RejectMessageError,

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error closing the channel
    #[error("failure to close the channel")]
    CloseChannelError,
}
