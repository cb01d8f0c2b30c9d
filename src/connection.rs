// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Shared AMQP Connection
//!
//! This module provides [`SharedConnection`], a cloneable handle to one
//! process-wide connection to the RabbitMQ server. The handle is passed to
//! every supervisor at construction; supervisors open their own channels on
//! it but never close the connection itself.
//!
//! The connection is dialed lazily and re-dialed transparently whenever the
//! cached handle is found dead, so holders can treat the connection as a
//! possibly-stale resource that [`SharedConnection::get`] always refreshes.

use crate::{config::AmqpConfig, errors::AmqpError};
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error};

/// Cloneable handle to the shared broker connection.
///
/// Every clone points at the same underlying connection slot. The slot is
/// guarded by an async mutex so concurrent re-dial attempts collapse into a
/// single `connect` call.
#[derive(Clone)]
pub struct SharedConnection {
    config: AmqpConfig,
    inner: Arc<Mutex<Option<Arc<Connection>>>>,
}

impl SharedConnection {
    /// Creates a handle without dialing the broker yet.
    pub fn new(config: AmqpConfig) -> SharedConnection {
        SharedConnection {
            config,
            inner: Arc::new(Mutex::new(None)),
        }
    }

    /// Returns a live connection, dialing the broker if the cached one is
    /// absent or no longer connected.
    ///
    /// # Returns
    /// * `Result<Arc<Connection>, AmqpError>` - A connected handle on success,
    ///   or `AmqpError::ConnectionError` when the broker cannot be reached.
    pub async fn get(&self) -> Result<Arc<Connection>, AmqpError> {
        let mut slot = self.inner.lock().await;

        if let Some(conn) = slot.as_ref() {
            if conn.status().connected() {
                return Ok(conn.clone());
            }
        }

        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.config.app_name.clone()));

        let conn = match Connection::connect(&self.config.uri(), options).await {
            Ok(c) => Ok(Arc::new(c)),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError)
            }
        }?;
        debug!("amqp connected");

        *slot = Some(conn.clone());

        Ok(conn)
    }

    /// Opens a fresh channel on the shared connection.
    ///
    /// The connection is re-verified first, so this call succeeds even right
    /// after a broker restart, as long as the broker is reachable again.
    pub async fn open_channel(&self) -> Result<Channel, AmqpError> {
        let conn = self.get().await?;

        debug!("creating amqp channel...");
        match conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(channel)
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_surfaces_connection_error_for_unreachable_broker() {
        let conn = SharedConnection::new(AmqpConfig {
            host: "127.0.0.1".to_owned(),
            port: 1,
            ..AmqpConfig::default()
        });

        let result = conn.get().await;

        assert_eq!(result.err(), Some(AmqpError::ConnectionError));
    }

    #[tokio::test]
    async fn open_channel_propagates_connection_error() {
        let conn = SharedConnection::new(AmqpConfig {
            host: "127.0.0.1".to_owned(),
            port: 1,
            ..AmqpConfig::default()
        });

        let result = conn.open_channel().await;

        assert_eq!(result.err(), Some(AmqpError::ConnectionError));
    }
}
