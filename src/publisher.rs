// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Best-effort publish over a short-lived connection. Each call resolves the
//! profile URL, opens a connection and a confirming channel, publishes one
//! persistent message and waits for the broker confirm, so broker faults
//! reach the caller as an error instead of a silent drop.

use crate::{
    channel::BrokerConnection,
    errors::AmqpError,
    otel,
    store::{resolve_profile, ProfileStore},
};
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions},
    types::{FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Delivery mode asking the broker to persist the message.
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Publishes messages through the broker of a named profile.
pub struct BusPublisher<S: ?Sized> {
    store: Arc<S>,
    profile: String,
    app_name: String,
}

impl<S> BusPublisher<S>
where
    S: ProfileStore + ?Sized,
{
    /// Creates a publisher.
    ///
    /// # Parameters
    /// * `store` - Store resolving `profile` to a broker URL on each publish
    /// * `profile` - Name of the bus profile
    /// * `app_name` - Connection name shown by the broker
    pub fn new(store: Arc<S>, profile: &str, app_name: &str) -> Self {
        BusPublisher {
            store,
            profile: profile.to_owned(),
            app_name: app_name.to_owned(),
        }
    }

    /// Publishes `data` and waits for the broker to confirm it.
    ///
    /// # Returns
    /// An error when the profile is unknown, the broker cannot be reached,
    /// or the broker refuses the message
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), AmqpError> {
        let url = resolve_profile(&*self.store, &self.profile).await?;
        let conn = BrokerConnection::open(&url, &self.app_name).await?;

        let published = self.publish_on(&conn, exchange, routing_key, data, content_type).await;

        if let Err(err) = conn.close().await {
            debug!(error = err.to_string(), "failure to close publisher connection");
        }

        published
    }

    async fn publish_on(
        &self,
        conn: &BrokerConnection,
        exchange: &str,
        routing_key: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<(), AmqpError> {
        let channel = conn.inner().create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            AmqpError::ChannelError(err.to_string())
        })?;

        channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to enable publisher confirms");
                AmqpError::ChannelError(err.to_string())
            })?;

        let headers = otel::inject(&Context::current());
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(content_type))
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(headers));

        let confirmation = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                data,
                properties,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), exchange, routing_key, "error publishing message");
                AmqpError::PublishingError(err.to_string())
            })?
            .await
            .map_err(|err| {
                error!(error = err.to_string(), exchange, routing_key, "error publishing message");
                AmqpError::PublishingError(err.to_string())
            })?;

        if confirmation.is_nack() {
            error!(exchange, routing_key, "broker refused the message");
            return Err(AmqpError::PublishNotConfirmed);
        }

        info!(exchange, routing_key, "message published");
        Ok(())
    }
}
