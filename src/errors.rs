// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Bus Worker
//!
//! Faults are split by the scope they are contained in. `AmqpError` covers
//! transport and protocol faults around the broker, `ConfigError` covers
//! misconfiguration detected at registration time, `StoreError` covers the
//! persistence collaborator and `HandlerError` covers faults raised while a
//! handler processes one message.

use thiserror::Error;

/// Represents errors that can occur while talking to the broker.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating or using a channel
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    #[error("failure to ack message")]
    AckMessageError,

    #[error("failure to nack message")]
    NackMessageError,

    #[error("failure to reject message")]
    RejectMessageError,

    /// Error cancelling a consumer during shutdown
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// The broker answered the publish with a negative confirm
    #[error("publish was not confirmed by the broker")]
    PublishNotConfirmed,

    /// A failed message could not be captured durably
    #[error("failure to store dead letter: {0}")]
    DeadLetterError(String),

    /// The worker runtime could not be built or joined
    #[error("worker runtime error: {0}")]
    RuntimeError(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Misconfiguration detected before any message is consumed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no queue name for consumer `{target}.{handler}`")]
    NoQueueName { target: String, handler: String },

    #[error("no schema for consumer `{target}.{handler}`")]
    NoSchema { target: String, handler: String },

    #[error("queue `{queue}` is bound by `{first}` and `{second}`")]
    DuplicateQueue {
        queue: String,
        first: String,
        second: String,
    },

    /// A worker binding names a consumer the registry does not hold
    #[error("no consumer registered for `{target}.{handler}`")]
    UnknownConsumer { target: String, handler: String },

    #[error("unknown profile `{0}`")]
    UnknownProfile(String),

    #[error("invalid value `{value}` for `{key}`")]
    InvalidValue { key: String, value: String },
}

/// Faults reported by the persistence collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("record not found `{0}`")]
    NotFound(String),

    #[error("storage failure: {0}")]
    Backend(String),
}

/// Faults raised while a handler processes a single message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The payload did not satisfy the consumer schema
    #[error("failure to decode payload: {0}")]
    Decode(String),

    #[error("{0}")]
    Failed(String),

    /// No handler is registered for the recorded target
    #[error("no handler registered for `{target}.{handler}`")]
    Unresolved { target: String, handler: String },

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Decode(err.to_string())
    }
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        HandlerError::Failed(err.to_string())
    }
}
