// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Consumers
//!
//! A [`Consumer`] owns the handling logic of one named queue. The supervisor calls
//! [`Consumer::on_channel_ready`] on every (re)connect and the channel calls
//! [`Consumer::handle`] once per delivery through [`dispatch`].

use crate::{
    broker::{BrokerChannel, Delivery},
    errors::AmqpError,
    otel,
};
use async_trait::async_trait;
use opentelemetry::{
    global,
    trace::{Status, TraceContextExt},
    Context,
};
use std::{borrow::Cow, sync::Arc};
use tracing::{debug, warn};

/// What the channel should do with a delivery once its handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    Ack,
    Nack { requeue: bool },
}

/// Handling logic bound to a single queue.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// The queue this consumer reads from. Also used as its consumer tag.
    fn queue_name(&self) -> &str;

    /// Called with every new channel before the consumer is registered on it,
    /// e.g. to declare the queue. An error here stops the supervisor.
    async fn on_channel_ready(&self, _channel: Arc<dyn BrokerChannel>) -> Result<(), AmqpError> {
        Ok(())
    }

    /// Handles one delivery. `ctx` carries the consumer span of the delivery, so
    /// spans started from it are nested under that span.
    ///
    /// # Returns
    /// The acknowledgement the channel applies to the delivery
    async fn handle(&self, ctx: &Context, delivery: &Delivery) -> Acknowledgement;
}

/// Runs `consumer` on `delivery` inside a consumer span and returns the
/// acknowledgement the channel has to apply.
pub async fn dispatch(consumer: &dyn Consumer, delivery: &Delivery) -> Acknowledgement {
    let name = delivery
        .properties
        .kind
        .clone()
        .unwrap_or_else(|| consumer.queue_name().to_owned());

    let ctx = {
        let tracer = global::tracer("amqp consumer");
        otel::new_span(&delivery.properties, &tracer, &name)
    };

    debug!(
        queue = consumer.queue_name(),
        delivery_tag = delivery.delivery_tag,
        "received: {} - exchange: {}",
        name,
        delivery.exchange
    );

    let ack = consumer.handle(&ctx, delivery).await;
    match ack {
        Acknowledgement::Ack => {
            debug!("message successfully processed");
            ctx.span().set_status(Status::Ok);
        }
        Acknowledgement::Nack { requeue } => {
            warn!(
                queue = consumer.queue_name(),
                delivery_tag = delivery.delivery_tag,
                requeue,
                "message rejected by handler"
            );
            ctx.span().set_status(Status::Error {
                description: Cow::from("message rejected by handler"),
            });
        }
    }

    ack
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingConsumer;

    struct Rejecting;

    #[async_trait]
    impl Consumer for Rejecting {
        fn queue_name(&self) -> &str {
            "poison"
        }

        async fn handle(&self, _ctx: &Context, _delivery: &Delivery) -> Acknowledgement {
            Acknowledgement::Nack { requeue: false }
        }
    }

    #[tokio::test]
    async fn dispatch_returns_the_handler_decision() {
        let consumer = RecordingConsumer::new("jobs");
        let delivery = Delivery {
            delivery_tag: 7,
            body: b"payload".to_vec(),
            ..Default::default()
        };

        assert_eq!(dispatch(&consumer, &delivery).await, Acknowledgement::Ack);
        assert_eq!(consumer.bodies(), vec![b"payload".to_vec()]);

        assert_eq!(
            dispatch(&Rejecting, &delivery).await,
            Acknowledgement::Nack { requeue: false }
        );
    }

    #[tokio::test]
    async fn default_channel_hook_accepts_any_channel() {
        let consumer = Rejecting;
        let channel = crate::broker::MockBrokerChannel::new();
        assert!(consumer.on_channel_ready(Arc::new(channel)).await.is_ok());
    }
}
