// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Dispatch
//!
//! The per-message decision procedure. For each delivery it:
//! 1. Rolls back any lingering transactional state
//! 2. Resolves the bound handler and invokes it with the raw body
//! 3. Turns a fault (error or panic) into an `Error`/`Undetermined` outcome
//! 4. Maps the outcome to a broker primitive, capturing failures as dead letters
//! 5. Commits when the worker runs in autocommit mode
//!
//! Every delivery ends acked, nacked or rejected. A failed one is first
//! stored as a dead letter and then acked, so the broker never redelivers a
//! message that is already captured.

use crate::{
    deadletter::DeadLetter,
    errors::{AmqpError, HandlerError, StoreError},
    handler::ConsumerMessage,
    otel,
    registry::{ConsumerBinding, HandlerRegistry},
    status::MessageOutcome,
    store::{DeadLetterStore, Transactional},
};
use async_trait::async_trait;
use futures_util::FutureExt;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions, BasicRejectOptions},
    types::{AMQPValue, ShortString},
    Channel,
};
use opentelemetry::{
    global,
    trace::{Span, Status},
    Context,
};
use std::{any::Any, borrow::Cow, collections::BTreeMap, panic::AssertUnwindSafe};
use tracing::{error, info};
use uuid::Uuid;

pub const UNDETERMINED_OUTCOME: &str = "undetermined handler outcome";

/// Broker acknowledgment primitives, addressed by delivery tag.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Negative acknowledgment, the broker requeues the message.
    async fn nack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Rejection, the broker does not requeue the message.
    async fn reject(&self, delivery_tag: u64) -> Result<(), AmqpError>;
}

#[async_trait]
impl DeliveryAcker for Channel {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.basic_nack(
            delivery_tag,
            BasicNackOptions {
                multiple: false,
                requeue: true,
            },
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), delivery_tag, "error whiling nack msg");
            AmqpError::NackMessageError
        })
    }

    async fn reject(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.basic_reject(delivery_tag, BasicRejectOptions { requeue: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling reject msg");
                AmqpError::RejectMessageError
            })
    }
}

/// The parts of a broker delivery dispatch relies on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub content_type: String,
    pub data: Vec<u8>,
    pub headers: BTreeMap<ShortString, AMQPValue>,
}

impl From<Delivery> for InboundDelivery {
    fn from(delivery: Delivery) -> Self {
        InboundDelivery {
            delivery_tag: delivery.delivery_tag,
            content_type: delivery
                .properties
                .content_type()
                .as_ref()
                .map(|c| c.to_string())
                .unwrap_or_default(),
            headers: delivery
                .properties
                .headers()
                .as_ref()
                .map(|h| h.inner().clone())
                .unwrap_or_default(),
            data: delivery.data,
        }
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    Nacked,
    Rejected,
    DeadLettered(Uuid),
}

pub(crate) struct Invocation {
    pub(crate) outcome: MessageOutcome,
    pub(crate) error: String,
}

/// Resolves and runs the handler; never fails, faults become outcomes.
///
/// With `rollback_on_fault` a handler fault discards the working state of
/// the store. Callers owning the commit boundaries pass `false` so that
/// earlier uncommitted work survives.
pub(crate) async fn invoke<R, T>(
    registry: &R,
    store: &T,
    ctx: &Context,
    msg: &ConsumerMessage<'_>,
    rollback_on_fault: bool,
) -> Invocation
where
    R: HandlerRegistry + ?Sized,
    T: Transactional + ?Sized,
{
    let Some(handler) = registry.resolve(msg.target, msg.handler) else {
        let err = HandlerError::Unresolved {
            target: msg.target.to_owned(),
            handler: msg.handler.to_owned(),
        };
        error!(queue = msg.queue, error = err.to_string(), "no handler to consume msg");
        return Invocation {
            outcome: MessageOutcome::Error,
            error: err.to_string(),
        };
    };

    match AssertUnwindSafe(handler.exec(ctx, msg)).catch_unwind().await {
        Ok(Ok(MessageOutcome::Undetermined)) => Invocation {
            outcome: MessageOutcome::Undetermined,
            error: UNDETERMINED_OUTCOME.to_owned(),
        },
        Ok(Ok(outcome)) => Invocation {
            outcome,
            error: String::new(),
        },
        Ok(Err(err)) => {
            error!(queue = msg.queue, error = err.to_string(), "error during consumation of queue");
            if rollback_on_fault {
                rollback(store).await;
            }
            Invocation {
                outcome: MessageOutcome::Error,
                error: err.to_string(),
            }
        }
        Err(panic) => {
            let err = HandlerError::Panicked(panic_message(panic.as_ref()));
            error!(queue = msg.queue, error = err.to_string(), "handler panicked");
            if rollback_on_fault {
                rollback(store).await;
            }
            Invocation {
                outcome: MessageOutcome::Undetermined,
                error: err.to_string(),
            }
        }
    }
}

/// Dispatches one delivery received on `binding`'s queue.
pub(crate) async fn consume<R, S, A>(
    binding: &ConsumerBinding,
    delivery: &InboundDelivery,
    registry: &R,
    store: &S,
    acker: &A,
    autocommit: bool,
) -> Result<Disposition, AmqpError>
where
    R: HandlerRegistry + ?Sized,
    S: DeadLetterStore + ?Sized,
    A: DeliveryAcker + ?Sized,
{
    let queue = binding.queue();
    let tag = delivery.delivery_tag;
    info!(queue, delivery_tag = tag, "received msg");

    let tracer = global::tracer("amqp consumer");
    let (ctx, mut span) = otel::new_span(&delivery.headers, &tracer, queue);

    rollback(store).await;

    let msg = ConsumerMessage::new(queue, binding.target(), binding.handler(), &delivery.data);
    let invocation = invoke(registry, store, &ctx, &msg, true).await;

    let disposition = match invocation.outcome {
        MessageOutcome::Acknowledge
        | MessageOutcome::NegativeAcknowledge
        | MessageOutcome::Reject => {
            if let Err(err) = commit(store, autocommit).await {
                error!(queue, delivery_tag = tag, error = err.to_string(), "failure to commit, requeuing");
                span.record_error(&err);
                rollback(store).await;
                acker.nack(tag).await?;
                return Err(AmqpError::Store(err));
            }

            match invocation.outcome {
                MessageOutcome::Acknowledge => {
                    acker.ack(tag).await?;
                    info!(queue, delivery_tag = tag, "ack queue");
                    Disposition::Acked
                }
                MessageOutcome::NegativeAcknowledge => {
                    acker.nack(tag).await?;
                    info!(queue, delivery_tag = tag, "nack queue");
                    Disposition::Nacked
                }
                _ => {
                    acker.reject(tag).await?;
                    info!(queue, delivery_tag = tag, "reject queue");
                    Disposition::Rejected
                }
            }
        }
        MessageOutcome::Error | MessageOutcome::Undetermined => {
            span.set_status(Status::Error {
                description: Cow::from(invocation.error.clone()),
            });

            let letter = DeadLetter::new(queue, binding.target(), binding.handler(), delivery.data.clone())
                .content_type(&delivery.content_type)
                .error(&invocation.error)
                .sequence(tag);

            let captured = match store.insert(letter).await {
                Ok(record) if autocommit => store.commit().await.map(|_| record),
                other => other,
            };

            match captured {
                Ok(record) => {
                    acker.ack(tag).await?;
                    info!(queue, delivery_tag = tag, "save message of the queue");
                    Disposition::DeadLettered(record.id)
                }
                Err(err) => {
                    error!(queue, delivery_tag = tag, error = err.to_string(), "failure to store dead letter, requeuing");
                    span.record_error(&err);
                    rollback(store).await;
                    acker.nack(tag).await?;
                    return Err(AmqpError::DeadLetterError(err.to_string()));
                }
            }
        }
    };

    if invocation.outcome.is_definitive() {
        span.set_status(Status::Ok);
    }

    Ok(disposition)
}

async fn rollback<T: Transactional + ?Sized>(store: &T) {
    if let Err(err) = store.rollback().await {
        error!(error = err.to_string(), "failure to rollback");
    }
}

async fn commit<T: Transactional + ?Sized>(store: &T, autocommit: bool) -> Result<(), StoreError> {
    if autocommit {
        store.commit().await
    } else {
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
