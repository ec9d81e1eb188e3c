// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! A publisher owns its own connection and channel. Nothing is shared with the
//! supervisor, so publishing and consuming never contend and closing one side
//! leaves the other untouched.

use crate::{
    broker::{BrokerChannel, BrokerClient, BrokerConnection, MessageProperties, PublishOptions},
    config::ConnectionParameters,
    errors::{AmqpError, ShutdownReport, ShutdownStep},
    otel,
};
use opentelemetry::Context;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Publishes messages over a connection of its own, independent from the
/// supervisor's consuming connection.
pub struct Publisher {
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
}

impl Publisher {
    /// Opens a dedicated connection and channel for publishing.
    ///
    /// When the channel cannot be opened the fresh connection is closed again.
    ///
    /// # Parameters
    /// * `client` - Broker client used to dial the connection
    /// * `params` - Address and credentials of the broker
    ///
    /// # Returns
    /// A ready publisher, or the connection or channel error
    pub async fn connect(
        client: &dyn BrokerClient,
        params: &ConnectionParameters,
    ) -> Result<Publisher, AmqpError> {
        let connection = client.connect(params).await?;

        match connection.open_channel().await {
            Ok(channel) => {
                debug!("publisher ready");
                Ok(Publisher {
                    connection,
                    channel,
                })
            }
            Err(err) => {
                if let Err(close_err) = connection.close().await {
                    warn!(
                        error = close_err.to_string(),
                        "failure to close publisher connection"
                    );
                }
                Err(err)
            }
        }
    }

    /// Publishes `body` straight to the broker. No buffering and no retry: a
    /// failure is returned to the caller as is.
    ///
    /// The trace context of `ctx` is injected into the headers and a random
    /// `message_id` is assigned when `properties` carries none.
    pub async fn publish(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        mut properties: MessageProperties,
        options: PublishOptions,
    ) -> Result<(), AmqpError> {
        otel::inject_context(ctx, &mut properties.headers);
        if properties.message_id.is_none() {
            properties.message_id = Some(Uuid::new_v4().to_string());
        }

        self.channel
            .publish(exchange, routing_key, body, &properties, options)
            .await
            .inspect_err(|err| {
                error!(
                    error = err.to_string(),
                    exchange, routing_key, "error publishing message"
                )
            })
    }

    /// Serializes `payload` as JSON and publishes it with default options.
    pub async fn publish_json<T: Serialize>(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<(), AmqpError> {
        let body = serde_json::to_vec(payload).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::SerializePayloadError
        })?;

        let properties = MessageProperties {
            content_type: Some(JSON_CONTENT_TYPE.to_owned()),
            ..Default::default()
        };

        self.publish(
            ctx,
            exchange,
            routing_key,
            &body,
            properties,
            PublishOptions::default(),
        )
        .await
    }

    /// Closes the channel, then the connection. Failures are reported, not returned.
    pub async fn close(self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        report.record(ShutdownStep::CloseChannel, self.channel.close().await);
        report.record(ShutdownStep::CloseConnection, self.connection.close().await);
        report
    }
}
