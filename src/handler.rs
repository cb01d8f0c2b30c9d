// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! This module defines the contract between the consumer supervisor and the
//! application's message handlers. A handler receives the raw payload of one
//! delivery and decides its disposition: `Ok` acknowledges the message, any
//! `Err` rejects it back to the queue for redelivery.
//!
//! Handlers are arbitrary business logic; the supervisor wraps every
//! invocation in a panic recovery boundary, so a crashing handler is reported
//! as [`HandlerError::Panicked`] instead of taking down its consumption loop.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;

/// Outcome of a failed handler invocation.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler returned a business-logic failure
    #[error("{0}")]
    Failed(String),

    /// The handler panicked and was recovered by the consumption loop
    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// Processes deliveries consumed from one queue.
///
/// Implementations must be safe to share across the supervisor's tasks; one
/// handler instance only ever sees one delivery at a time, in stream order.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]) -> Result<(), HandlerError>;
}
