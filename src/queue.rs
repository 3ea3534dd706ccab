// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Queues and queue-to-exchange bindings a worker can declare at startup.
//! Consumers attach to queues by name, so queues a worker consumes from must
//! exist on the broker, either declared here or provisioned out of band.

use lapin::types::{AMQPValue, LongInt, ShortString};
use std::collections::BTreeMap;

/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
}

impl QueueDefinition {
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Survives broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Message time to live, in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    pub(crate) fn arguments(&self) -> BTreeMap<ShortString, AMQPValue> {
        let mut args = BTreeMap::new();

        if let Some(ttl) = self.ttl {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        if let Some(max) = self.max_length {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH),
                AMQPValue::LongInt(LongInt::from(max)),
            );
        }

        args
    }
}

/// Routes messages from an exchange to a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            ..QueueBinding::default()
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}
