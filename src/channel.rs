// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin Broker Client
//!
//! `lapin`-backed implementations of the broker seams in [`crate::broker`].
//! [`LapinBroker`] dials the server, [`LapinConnection`] opens channels and
//! [`LapinChannel`] runs consumer registration, the consume loop and publishing.

use crate::{
    broker::{BrokerChannel, BrokerClient, BrokerConnection, MessageProperties, PublishOptions},
    config::ConnectionParameters,
    consumer::Consumer,
    dispatcher::{consume_blocking, to_amqp_properties, Registration},
    errors::AmqpError,
    queue::{
        QueueDefinition, AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
        AMQP_HEADERS_MAX_LENGTH, AMQP_HEADERS_MAX_LENGTH_BYTES, AMQP_HEADERS_MESSAGE_TTL,
    },
};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    Channel, Connection, ConnectionProperties,
};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::Notify;
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

/// Connects to RabbitMQ with `lapin`.
#[derive(Debug, Clone, Default)]
pub struct LapinBroker;

#[async_trait]
impl BrokerClient for LapinBroker {
    async fn connect(
        &self,
        params: &ConnectionParameters,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(params.connection_name.clone()));

        match Connection::connect_uri(params.amqp_uri(), options).await {
            Ok(conn) => {
                debug!("amqp connected");
                Ok(Arc::new(LapinConnection { conn }))
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError)
            }
        }
    }
}

/// A `lapin` connection handing out [`LapinChannel`]s.
pub struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel::new(channel)))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| AmqpError::ShutdownError(err.to_string()))
    }

    fn is_open(&self) -> bool {
        self.conn.status().connected()
    }
}

/// A `lapin` channel plus the consumers registered on it and not yet running.
pub struct LapinChannel {
    channel: Channel,
    pending: Mutex<Vec<Registration>>,
    stop: Notify,
}

impl LapinChannel {
    pub fn new(channel: Channel) -> Self {
        LapinChannel {
            channel,
            pending: Mutex::new(vec![]),
            stop: Notify::new(),
        }
    }

    fn take_pending(&self) -> Vec<Registration> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *pending)
    }

    async fn declare(
        &self,
        def: &QueueDefinition,
        name: &str,
        args: BTreeMap<ShortString, AMQPValue>,
    ) -> Result<(), AmqpError> {
        debug!("creating queue: {}", name);
        match self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                FieldTable::from(args),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue = name, "failure to declare queue");
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
            _ => {
                debug!("queue: {} was created", name);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn set_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: true })
            .await
            .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut args = BTreeMap::new();

        if let Some(dlq_name) = &def.dlq_name {
            self.declare(def, dlq_name, BTreeMap::new()).await?;
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from("")),
            );
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(dlq_name.clone())),
            );
        }

        let limits = [
            (AMQP_HEADERS_MESSAGE_TTL, def.ttl),
            (AMQP_HEADERS_MAX_LENGTH, def.max_length),
            (AMQP_HEADERS_MAX_LENGTH_BYTES, def.max_length_bytes),
        ];
        for (key, value) in limits {
            if let Some(value) = value {
                args.insert(
                    ShortString::from(key),
                    AMQPValue::LongInt(LongInt::from(value)),
                );
            }
        }

        self.declare(def, &def.name, args).await
    }

    async fn register_consumer(
        &self,
        queue: &str,
        tag: &str,
        consumer: Arc<dyn Consumer>,
    ) -> Result<(), AmqpError> {
        let stream = match self
            .channel
            .basic_consume(
                queue,
                tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration {
                tag: tag.to_owned(),
                consumer,
                stream,
            });
        Ok(())
    }

    async fn start_consuming(&self) -> Result<(), AmqpError> {
        consume_blocking(self.take_pending(), &self.stop).await
    }

    async fn stop_consuming(&self) -> Result<(), AmqpError> {
        self.stop.notify_one();
        Ok(())
    }

    async fn cancel(&self, tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), tag, "failure to cancel consumer");
                AmqpError::CancelConsumerError(tag.to_owned())
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
        options: PublishOptions,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: options.mandatory,
                    immediate: options.immediate,
                },
                body,
                to_amqp_properties(properties),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| AmqpError::ShutdownError(err.to_string()))
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }
}
