// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! A consumer is a business routine bound to a queue. It is declared with a
//! [`Decoder`], the capability that turns the raw body into a typed payload
//! and rejects bodies that do not satisfy the schema, and a
//! [`PayloadHandler`] that receives the decoded payload.
//!
//! [`SchemaConsumer`] joins both into the type-erased [`ConsumerHandler`]
//! that dispatch invokes with the raw message.

use crate::{errors::HandlerError, status::MessageOutcome};
use async_trait::async_trait;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;

/// A delivered (or replayed) message as seen by a handler.
#[derive(Debug, Clone, Copy)]
pub struct ConsumerMessage<'m> {
    pub queue: &'m str,
    pub target: &'m str,
    pub handler: &'m str,
    pub data: &'m [u8],
}

impl<'m> ConsumerMessage<'m> {
    pub fn new(queue: &'m str, target: &'m str, handler: &'m str, data: &'m [u8]) -> Self {
        ConsumerMessage {
            queue,
            target,
            handler,
            data,
        }
    }
}

/// Invocable bound to a queue, receiving the raw body.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(
        &self,
        ctx: &Context,
        msg: &ConsumerMessage<'_>,
    ) -> Result<MessageOutcome, HandlerError>;
}

/// Payload validation capability required by every consumer.
pub trait Decoder: Send + Sync {
    type Output: Send + 'static;

    fn decode(&self, body: &[u8]) -> Result<Self::Output, HandlerError>;
}

/// Decodes JSON bodies into `T`; a missing required field is a decode fault.
pub struct JsonDecoder<T> {
    _payload: PhantomData<fn() -> T>,
}

impl<T> JsonDecoder<T> {
    pub fn new() -> Self {
        JsonDecoder {
            _payload: PhantomData,
        }
    }
}

impl<T> Default for JsonDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Decoder for JsonDecoder<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Output = T;

    fn decode(&self, body: &[u8]) -> Result<T, HandlerError> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Business routine receiving an already decoded payload.
#[async_trait]
pub trait PayloadHandler<T>: Send + Sync
where
    T: Send + 'static,
{
    async fn handle(&self, ctx: &Context, payload: T) -> Result<MessageOutcome, HandlerError>;
}

/// Decodes the body with `D` and hands the payload over to `H`.
pub struct SchemaConsumer<D, H> {
    decoder: D,
    handler: H,
}

impl<D, H> SchemaConsumer<D, H> {
    pub fn new(decoder: D, handler: H) -> Self {
        SchemaConsumer { decoder, handler }
    }
}

#[async_trait]
impl<D, H> ConsumerHandler for SchemaConsumer<D, H>
where
    D: Decoder,
    H: PayloadHandler<D::Output>,
{
    async fn exec(
        &self,
        ctx: &Context,
        msg: &ConsumerMessage<'_>,
    ) -> Result<MessageOutcome, HandlerError> {
        let payload = self.decoder.decode(msg.data)?;
        self.handler.handle(ctx, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Row {
        label: String,
        number: i64,
    }

    struct Echo;

    #[async_trait]
    impl PayloadHandler<Row> for Echo {
        async fn handle(&self, _ctx: &Context, row: Row) -> Result<MessageOutcome, HandlerError> {
            if row.number < 0 {
                return Ok(MessageOutcome::Reject);
            }
            Ok(MessageOutcome::Acknowledge)
        }
    }

    #[test]
    fn test_json_decoder_requires_fields() {
        let decoder = JsonDecoder::<Row>::new();

        let row = decoder.decode(br#"{"label": "x", "number": 1}"#).unwrap();
        assert_eq!(
            row,
            Row {
                label: "x".to_owned(),
                number: 1
            }
        );

        let err = decoder.decode(br#"{"label": "x"}"#).unwrap_err();
        assert!(matches!(err, HandlerError::Decode(ref m) if m.contains("number")));
    }

    #[tokio::test]
    async fn test_schema_consumer_decodes_before_handling() {
        let consumer = SchemaConsumer::new(JsonDecoder::<Row>::new(), Echo);
        let ctx = Context::new();

        let ok = ConsumerMessage::new("q", "Model.Test", "insert", br#"{"label":"a","number":3}"#);
        assert_eq!(consumer.exec(&ctx, &ok).await, Ok(MessageOutcome::Acknowledge));

        let rejected =
            ConsumerMessage::new("q", "Model.Test", "insert", br#"{"label":"a","number":-1}"#);
        assert_eq!(consumer.exec(&ctx, &rejected).await, Ok(MessageOutcome::Reject));

        let invalid = ConsumerMessage::new("q", "Model.Test", "insert", b"not json");
        assert!(matches!(
            consumer.exec(&ctx, &invalid).await,
            Err(HandlerError::Decode(_))
        ));
    }
}
