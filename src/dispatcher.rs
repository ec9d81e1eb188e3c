// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin Delivery Dispatch
//!
//! The blocking consume loop behind [`crate::channel::LapinChannel`]. Every
//! registered `lapin::Consumer` stream is merged into one, each delivery is handed
//! to its consumer through [`crate::consumer::dispatch`] and the returned
//! acknowledgement is applied on the broker.

use crate::{
    broker::{Delivery, MessageProperties},
    consumer::{dispatch, Acknowledgement, Consumer},
    errors::AmqpError,
};
use futures_util::{stream::select_all, StreamExt};
use lapin::{
    options::{BasicAckOptions, BasicNackOptions},
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::Notify;
use tracing::{debug, error};

/// A consumer stream opened with `basic.consume` and the handler it feeds.
pub(crate) struct Registration {
    pub(crate) tag: String,
    pub(crate) consumer: Arc<dyn Consumer>,
    pub(crate) stream: lapin::Consumer,
}

/// Dispatches deliveries until `stop` is notified or a stream fails.
///
/// Streams that end because their consumer was cancelled are dropped from the
/// merge. Once none are left the loop parks until `stop`.
pub(crate) async fn consume_blocking(
    registrations: Vec<Registration>,
    stop: &Notify,
) -> Result<(), AmqpError> {
    let tags: Vec<String> = registrations.iter().map(|r| r.tag.clone()).collect();
    debug!(consumers = ?tags, "starting consume loop");

    let mut merged = select_all(registrations.into_iter().map(|r| {
        let consumer = r.consumer;
        r.stream.map(move |result| (consumer.clone(), result)).boxed()
    }));

    loop {
        tokio::select! {
            _ = stop.notified() => {
                debug!("consume loop stopped");
                return Ok(());
            }
            next = merged.next() => {
                match next {
                    Some((consumer, Ok(delivery))) => {
                        handle_delivery(consumer.as_ref(), delivery).await
                    }
                    Some((consumer, Err(err))) => {
                        error!(
                            error = err.to_string(),
                            queue = consumer.queue_name(),
                            "errors consume msg"
                        );
                        return Err(AmqpError::ConsumeLoopError(err.to_string()));
                    }
                    None => {
                        debug!("no active consumers, waiting for stop");
                        stop.notified().await;
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn handle_delivery(consumer: &dyn Consumer, delivery: lapin::message::Delivery) {
    let ack = dispatch(consumer, &to_delivery(&delivery)).await;

    let result = match ack {
        Acknowledgement::Ack => delivery
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| (err, AmqpError::AckMessageError)),
        Acknowledgement::Nack { requeue } => delivery
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| (err, AmqpError::NackMessageError)),
    };

    if let Err((err, kind)) = result {
        error!(
            error = err.to_string(),
            queue = consumer.queue_name(),
            delivery_tag = delivery.delivery_tag,
            "{kind}"
        );
    }
}

pub(crate) fn to_delivery(delivery: &lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_owned(),
        routing_key: delivery.routing_key.as_str().to_owned(),
        redelivered: delivery.redelivered,
        properties: from_amqp_properties(&delivery.properties),
        body: delivery.data.clone(),
    }
}

/// Keeps string-valued headers; other AMQP header types are not exposed.
pub(crate) fn from_amqp_properties(props: &AMQPProperties) -> MessageProperties {
    let mut headers = BTreeMap::new();
    if let Some(table) = props.headers() {
        for (key, value) in table.inner() {
            let value = match value {
                AMQPValue::LongString(v) => String::from_utf8_lossy(v.as_bytes()).into_owned(),
                AMQPValue::ShortString(v) => v.as_str().to_owned(),
                _ => continue,
            };
            headers.insert(key.as_str().to_owned(), value);
        }
    }

    MessageProperties {
        content_type: props.content_type().as_ref().map(|v| v.as_str().to_owned()),
        kind: props.kind().as_ref().map(|v| v.as_str().to_owned()),
        message_id: props.message_id().as_ref().map(|v| v.as_str().to_owned()),
        headers,
    }
}

pub(crate) fn to_amqp_properties(props: &MessageProperties) -> BasicProperties {
    let mut amqp = BasicProperties::default();

    if let Some(content_type) = &props.content_type {
        amqp = amqp.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(kind) = &props.kind {
        amqp = amqp.with_type(ShortString::from(kind.clone()));
    }
    if let Some(message_id) = &props.message_id {
        amqp = amqp.with_message_id(ShortString::from(message_id.clone()));
    }

    let headers: BTreeMap<ShortString, AMQPValue> = props
        .headers
        .iter()
        .map(|(key, value)| {
            (
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            )
        })
        .collect();

    amqp.with_headers(FieldTable::from(headers))
}
