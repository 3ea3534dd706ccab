// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # amqp-bus
//!
//! A resilient AMQP consumer worker. A [`Worker`] binds queues to handlers
//! from a [`Registry`], settles every delivery with an ack, nack or reject,
//! and captures failed messages as dead letters that can be replayed in
//! sequence order later on.

mod otel;

pub mod channel;
pub mod configs;
pub mod consumer;
pub mod deadletter;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod lifecycle;
pub mod logging;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod status;
pub mod store;
pub mod topology;
pub mod worker;

pub use configs::WorkerConfigs;
pub use deadletter::{DeadLetter, DeadLetterRecord, DeadLetters, ReplayOutcome, ReplayReport};
pub use errors::{AmqpError, ConfigError, HandlerError, StoreError};
pub use handler::{ConsumerHandler, ConsumerMessage, Decoder, JsonDecoder, PayloadHandler, SchemaConsumer};
pub use lifecycle::ConnectionState;
pub use publisher::BusPublisher;
pub use registry::{ConsumerBinding, ConsumerDescription, HandlerRegistry, Registry};
pub use status::{MessageOutcome, ProfileStatus};
pub use store::{MemoryStore, Store};
pub use worker::{Worker, WorkerHandle};
