// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Client Seams
//!
//! The supervisor never talks AMQP directly. It drives these three traits, which
//! mirror the connection, channel and consume primitives of a broker client.
//! [`crate::channel`] implements them on top of `lapin`; tests implement them
//! with mocks and a scripted fake.

use crate::{
    config::ConnectionParameters, consumer::Consumer, errors::AmqpError, queue::QueueDefinition,
};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::{collections::BTreeMap, sync::Arc};

/// Message metadata carried alongside a body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    /// The message type, sent as the AMQP `type` property.
    pub kind: Option<String>,
    pub message_id: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// A message delivered to a consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// Flags forwarded with `basic.publish`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub mandatory: bool,
    pub immediate: bool,
}

/// Establishes connections to the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn connect(
        &self,
        params: &ConnectionParameters,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// A live connection to the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens a new channel multiplexed over this connection.
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;

    /// Reports whether the underlying socket is still usable.
    fn is_open(&self) -> bool;
}

/// A channel carrying consume and publish operations.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Limits unacknowledged deliveries across the whole channel.
    async fn set_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    /// Registers `consumer` for deliveries from `queue` under the consumer `tag`.
    /// Deliveries flow once [`BrokerChannel::start_consuming`] runs.
    async fn register_consumer(
        &self,
        queue: &str,
        tag: &str,
        consumer: Arc<dyn Consumer>,
    ) -> Result<(), AmqpError>;

    /// Dispatches deliveries to registered consumers until `stop_consuming` is
    /// called (`Ok`) or the channel fails (`Err`).
    async fn start_consuming(&self) -> Result<(), AmqpError>;

    async fn stop_consuming(&self) -> Result<(), AmqpError>;

    /// Cancels the consumer registered under `tag`.
    async fn cancel(&self, tag: &str) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
        options: PublishOptions,
    ) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;

    fn is_open(&self) -> bool;
}
