// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Topology
//!
//! The exchanges, queues and bindings a worker declares on its channel
//! before registering consumers, and a passive check reporting which queues
//! the broker does not know.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel, Connection,
};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl Topology {
    pub fn new() -> Self {
        Topology::default()
    }

    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Adds a queue; a later definition with the same name replaces it.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.retain(|q| q.name != def.name);
        self.queues.push(def);
        self
    }

    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.queues.is_empty() && self.queues_binding.is_empty()
    }

    /// Declares exchanges, then queues, then bindings.
    pub async fn install(&self, channel: &Channel) -> Result<(), AmqpError> {
        self.install_exchange(channel).await?;
        self.install_queue(channel).await?;
        self.binding_queues(channel).await
    }

    async fn install_exchange(&self, channel: &Channel) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);

            channel
                .exchange_declare(
                    &exch.name,
                    lapin::ExchangeKind::from(&exch.kind),
                    ExchangeDeclareOptions {
                        passive: false,
                        durable: exch.durable,
                        auto_delete: exch.auto_delete,
                        internal: false,
                        nowait: false,
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), name = exch.name, "error to declare the exchange");
                    AmqpError::DeclareExchangeError(exch.name.clone())
                })?;

            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queue(&self, channel: &Channel) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);

            channel
                .queue_declare(
                    &def.name,
                    QueueDeclareOptions {
                        passive: false,
                        durable: def.durable,
                        exclusive: def.exclusive,
                        auto_delete: def.auto_delete,
                        nowait: false,
                    },
                    FieldTable::from(def.arguments()),
                )
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), name = def.name, "error to declare the queue");
                    AmqpError::DeclareQueueError(def.name.clone())
                })?;

            debug!("queue: {} was created", def.name);
        }

        Ok(())
    }

    async fn binding_queues(&self, channel: &Channel) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            channel
                .queue_bind(
                    &binding.queue_name,
                    &binding.exchange_name,
                    &binding.routing_key,
                    QueueBindOptions { nowait: false },
                    FieldTable::default(),
                )
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error to bind queue to exchange");
                    AmqpError::BindingExchangeToQueueError(
                        binding.exchange_name.clone(),
                        binding.queue_name.clone(),
                    )
                })?;
        }

        Ok(())
    }
}

/// Returns the names in `queues` the broker does not know.
///
/// A passive declare of an unknown queue closes the channel it ran on, so
/// every check runs on a throwaway channel.
pub async fn missing_queues(conn: &Connection, queues: &[String]) -> Result<Vec<String>, AmqpError> {
    let mut missing = vec![];

    for queue in queues {
        let channel = conn.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            AmqpError::ChannelError(err.to_string())
        })?;

        let declared = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await;

        match declared {
            Ok(_) => {
                debug!(queue, "queue exists");
                if let Err(err) = channel.close(200, "queue check done").await {
                    debug!(error = err.to_string(), "failure to close check channel");
                }
            }
            Err(err) => {
                warn!(queue, error = err.to_string(), "queue not found");
                missing.push(queue.clone());
            }
        }
    }

    Ok(missing)
}
