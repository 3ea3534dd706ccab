// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! Opens the broker connection and the single consumer channel a worker
//! runs on. Asynchronous failures of either are reported through the
//! `on_error` callbacks so the lifecycle driver can react to them.

use crate::{errors::AmqpError, registry::ConsumerBinding};
use lapin::{
    options::{BasicCancelOptions, BasicConsumeOptions, BasicQosOptions},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    Channel, Connection, ConnectionProperties, Consumer,
};
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, Ordering},
};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Consumer argument carrying the bound target.
const CONSUMER_ARG_TARGET: &str = "target";
/// Consumer argument carrying the bound handler.
const CONSUMER_ARG_HANDLER: &str = "handler";

/// A broker connection with an idempotent close.
pub struct BrokerConnection {
    conn: Connection,
    closing: AtomicBool,
}

impl BrokerConnection {
    /// Connects to `url`, naming the connection after the application.
    pub async fn open(url: &str, app_name: &str) -> Result<BrokerConnection, AmqpError> {
        debug!("creating amqp connection...");
        let options =
            ConnectionProperties::default().with_connection_name(LongString::from(app_name));

        let conn = Connection::connect(url, options).await.map_err(|err| {
            error!(error = err.to_string(), "failure to connect");
            AmqpError::ConnectionError(err.to_string())
        })?;
        debug!("amqp connected");

        Ok(BrokerConnection {
            conn,
            closing: AtomicBool::new(false),
        })
    }

    /// Registers a callback for asynchronous connection failures.
    pub fn on_error<F>(&self, mut callback: F)
    where
        F: FnMut(String) + Send + 'static,
    {
        self.conn.on_error(move |err| callback(err.to_string()));
    }

    pub fn is_connected(&self) -> bool {
        self.conn.status().connected()
    }

    pub fn inner(&self) -> &Connection {
        &self.conn
    }

    /// Closes the connection. Closing twice, or closing a connection the
    /// broker already dropped, is a logged no-op.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.closing.swap(true, Ordering::SeqCst) || !self.is_connected() {
            info!("connection is closing or already closed");
            return Ok(());
        }

        info!("closing connection");
        self.conn
            .close(200, "worker stopping")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close the connection");
                AmqpError::ConnectionError(err.to_string())
            })
    }

    /// Opens a channel with `prefetch` unacknowledged deliveries in flight.
    pub async fn open_channel<F>(&self, prefetch: u16, mut on_close: F) -> Result<Channel, AmqpError>
    where
        F: FnMut(String) + Send + 'static,
    {
        debug!("creating amqp channel...");
        let channel = self.conn.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            AmqpError::ChannelError(err.to_string())
        })?;

        channel.on_error(move |err| on_close(err.to_string()));

        channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), prefetch, "failure to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })?;

        debug!(channel_id = channel.id(), prefetch, "channel created");
        Ok(channel)
    }
}

/// Declares one consumer per binding and returns them with their tags.
pub async fn declare_consumers(
    channel: &Channel,
    bindings: &[ConsumerBinding],
) -> Result<Vec<(String, Consumer)>, AmqpError> {
    let mut consumers = Vec::with_capacity(bindings.len());

    for binding in bindings {
        let tag = format!("{}-{}", binding.queue(), Uuid::new_v4());

        let mut args = BTreeMap::new();
        args.insert(
            ShortString::from(CONSUMER_ARG_TARGET),
            AMQPValue::LongString(LongString::from(binding.target())),
        );
        args.insert(
            ShortString::from(CONSUMER_ARG_HANDLER),
            AMQPValue::LongString(LongString::from(binding.handler())),
        );

        let consumer = channel
            .basic_consume(
                binding.queue(),
                &tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::from(args),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue = binding.queue(), "failure to declare consumer");
                AmqpError::BindingConsumerError(binding.queue().to_owned())
            })?;

        info!(binding = %binding, consumer_tag = tag, "consumer declared");
        consumers.push((tag, consumer));
    }

    Ok(consumers)
}

pub async fn cancel_consumer(channel: &Channel, tag: &str) -> Result<(), AmqpError> {
    debug!(consumer_tag = tag, "cancelling consumer");
    channel
        .basic_cancel(tag, BasicCancelOptions { nowait: false })
        .await
        .map_err(|err| {
            error!(error = err.to_string(), consumer_tag = tag, "failure to cancel consumer");
            AmqpError::CancelConsumerError(tag.to_owned())
        })
}

/// Closes the channel unless the broker already did.
pub async fn close_channel(channel: &Channel) -> Result<(), AmqpError> {
    if !channel.status().connected() {
        debug!(channel_id = channel.id(), "channel already closed");
        return Ok(());
    }

    info!(channel_id = channel.id(), "closing channel");
    channel.close(200, "worker stopping").await.map_err(|err| {
        error!(error = err.to_string(), "failure to close the channel");
        AmqpError::ChannelError(err.to_string())
    })
}
