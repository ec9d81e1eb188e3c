// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Scripted in-memory broker and consumers shared by the unit tests.

use crate::{
    broker::{
        BrokerChannel, BrokerClient, BrokerConnection, Delivery, MessageProperties, PublishOptions,
    },
    config::ConnectionParameters,
    consumer::{dispatch, Acknowledgement, Consumer},
    errors::AmqpError,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    sync::Notify,
    time::{sleep, timeout, Instant},
};

/// Consumer that records every body it handles and acks it.
pub(crate) struct RecordingConsumer {
    queue: String,
    fail_setup: bool,
    ready_calls: AtomicUsize,
    bodies: Mutex<Vec<Vec<u8>>>,
}

impl RecordingConsumer {
    pub(crate) fn new(queue: &str) -> Self {
        RecordingConsumer {
            queue: queue.to_owned(),
            fail_setup: false,
            ready_calls: AtomicUsize::new(0),
            bodies: Mutex::new(vec![]),
        }
    }

    /// A consumer whose queue declaration always fails.
    pub(crate) fn failing_setup(queue: &str) -> Self {
        RecordingConsumer {
            fail_setup: true,
            ..RecordingConsumer::new(queue)
        }
    }

    pub(crate) fn bodies(&self) -> Vec<Vec<u8>> {
        self.bodies.lock().unwrap().clone()
    }

    pub(crate) fn ready_calls(&self) -> usize {
        self.ready_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Consumer for RecordingConsumer {
    fn queue_name(&self) -> &str {
        &self.queue
    }

    async fn on_channel_ready(&self, channel: Arc<dyn BrokerChannel>) -> Result<(), AmqpError> {
        self.ready_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_setup {
            return Err(AmqpError::DeclareQueueError(self.queue.clone()));
        }
        channel.declare_queue(&QueueDefinition::new(&self.queue)).await
    }

    async fn handle(&self, _ctx: &Context, delivery: &Delivery) -> Acknowledgement {
        self.bodies.lock().unwrap().push(delivery.body.clone());
        Acknowledgement::Ack
    }
}

/// Consumer whose channel hook parks until the test opens its gate.
pub(crate) struct GatedConsumer {
    queue: String,
    entered: Notify,
    gate: Notify,
}

impl GatedConsumer {
    pub(crate) fn new(queue: &str) -> Self {
        GatedConsumer {
            queue: queue.to_owned(),
            entered: Notify::new(),
            gate: Notify::new(),
        }
    }

    /// Resolves once the hook is parked at the gate.
    pub(crate) async fn entered(&self) {
        self.entered.notified().await
    }

    pub(crate) fn open(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl Consumer for GatedConsumer {
    fn queue_name(&self) -> &str {
        &self.queue
    }

    async fn on_channel_ready(&self, _channel: Arc<dyn BrokerChannel>) -> Result<(), AmqpError> {
        self.entered.notify_one();
        self.gate.notified().await;
        Ok(())
    }

    async fn handle(&self, _ctx: &Context, _delivery: &Delivery) -> Acknowledgement {
        Acknowledgement::Ack
    }
}

/// Failure budget and call log of the fake broker.
#[derive(Default)]
pub(crate) struct BrokerScript {
    pub(crate) connect_failures: AtomicUsize,
    pub(crate) channel_failures: AtomicUsize,
    pub(crate) qos_failures: AtomicUsize,
    pub(crate) registration_failures: AtomicUsize,
    pub(crate) consume_failures: AtomicUsize,
    generation: AtomicUsize,
    lost: Notify,
    connect_attempts: Mutex<Vec<Instant>>,
    connections: AtomicUsize,
    channels: AtomicUsize,
    registrations: Mutex<Vec<String>>,
    live: Mutex<Vec<String>>,
    cancelled: Mutex<Vec<String>>,
    qos: Mutex<Vec<u16>>,
    deliveries: Mutex<VecDeque<(String, Delivery)>>,
    acks: Mutex<Vec<(u64, Acknowledgement)>>,
}

impl BrokerScript {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(BrokerScript::default())
    }

    /// Queues a message for `queue`; it is dispatched once consumption starts.
    pub(crate) fn deliver(&self, queue: &str, body: &[u8]) {
        let mut deliveries = self.deliveries.lock().unwrap();
        let delivery = Delivery {
            delivery_tag: deliveries.len() as u64 + 1,
            routing_key: queue.to_owned(),
            body: body.to_vec(),
            ..Default::default()
        };
        deliveries.push_back((queue.to_owned(), delivery));
    }

    /// Drops every open connection: they report closed and their consume
    /// loops fail. Connections opened afterwards are healthy.
    pub(crate) fn lose_connections(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.lost.notify_waiters();
    }

    pub(crate) fn connect_attempts(&self) -> Vec<Instant> {
        self.connect_attempts.lock().unwrap().clone()
    }

    pub(crate) fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub(crate) fn channels(&self) -> usize {
        self.channels.load(Ordering::SeqCst)
    }

    pub(crate) fn registrations(&self) -> Vec<String> {
        self.registrations.lock().unwrap().clone()
    }

    /// Tags registered on the latest channel and not cancelled since.
    pub(crate) fn live(&self) -> Vec<String> {
        self.live.lock().unwrap().clone()
    }

    pub(crate) fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }

    pub(crate) fn qos(&self) -> Vec<u16> {
        self.qos.lock().unwrap().clone()
    }

    pub(crate) fn acks(&self) -> Vec<(u64, Acknowledgement)> {
        self.acks.lock().unwrap().clone()
    }
}

fn take_one(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

pub(crate) struct FakeBroker {
    script: Arc<BrokerScript>,
}

impl FakeBroker {
    pub(crate) fn new(script: &Arc<BrokerScript>) -> Arc<dyn BrokerClient> {
        Arc::new(FakeBroker {
            script: script.clone(),
        })
    }
}

#[async_trait]
impl BrokerClient for FakeBroker {
    async fn connect(
        &self,
        _params: &ConnectionParameters,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        self.script.connect_attempts.lock().unwrap().push(Instant::now());
        if take_one(&self.script.connect_failures) {
            return Err(AmqpError::ConnectionError);
        }

        self.script.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeConnection {
            script: self.script.clone(),
            generation: self.script.generation.load(Ordering::SeqCst),
            open: AtomicBool::new(true),
        }))
    }
}

struct FakeConnection {
    script: Arc<BrokerScript>,
    generation: usize,
    open: AtomicBool,
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if take_one(&self.script.channel_failures) {
            return Err(AmqpError::ChannelError);
        }

        self.script.channels.fetch_add(1, Ordering::SeqCst);
        self.script.live.lock().unwrap().clear();
        Ok(Arc::new(FakeChannel {
            script: self.script.clone(),
            generation: self.generation,
            consumers: Mutex::new(vec![]),
            stop: Notify::new(),
            open: AtomicBool::new(true),
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
            && self.generation == self.script.generation.load(Ordering::SeqCst)
    }
}

struct FakeChannel {
    script: Arc<BrokerScript>,
    generation: usize,
    consumers: Mutex<Vec<(String, Arc<dyn Consumer>)>>,
    stop: Notify,
    open: AtomicBool,
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn set_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        if take_one(&self.script.qos_failures) {
            return Err(AmqpError::QoSDeclarationError(prefetch_count.to_string()));
        }
        self.script.qos.lock().unwrap().push(prefetch_count);
        Ok(())
    }

    async fn declare_queue(&self, _def: &QueueDefinition) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn register_consumer(
        &self,
        queue: &str,
        tag: &str,
        consumer: Arc<dyn Consumer>,
    ) -> Result<(), AmqpError> {
        if take_one(&self.script.registration_failures) {
            return Err(AmqpError::BindingConsumerError(tag.to_owned()));
        }
        self.script.registrations.lock().unwrap().push(tag.to_owned());
        self.script.live.lock().unwrap().push(tag.to_owned());
        self.consumers.lock().unwrap().push((queue.to_owned(), consumer));
        Ok(())
    }

    async fn start_consuming(&self) -> Result<(), AmqpError> {
        if take_one(&self.script.consume_failures) {
            return Err(AmqpError::ConsumeLoopError("connection reset by peer".to_owned()));
        }

        loop {
            let next = self.script.deliveries.lock().unwrap().pop_front();
            let Some((queue, delivery)) = next else {
                break;
            };
            let consumer = self
                .consumers
                .lock()
                .unwrap()
                .iter()
                .find(|(q, _)| *q == queue)
                .map(|(_, c)| c.clone());

            if let Some(consumer) = consumer {
                let ack = dispatch(consumer.as_ref(), &delivery).await;
                self.script
                    .acks
                    .lock()
                    .unwrap()
                    .push((delivery.delivery_tag, ack));
            }
        }

        loop {
            let lost = self.script.lost.notified();
            if self.generation != self.script.generation.load(Ordering::SeqCst) {
                return Err(AmqpError::ConsumeLoopError("connection lost".to_owned()));
            }
            tokio::select! {
                _ = self.stop.notified() => return Ok(()),
                _ = lost => {}
            }
        }
    }

    async fn stop_consuming(&self) -> Result<(), AmqpError> {
        self.stop.notify_one();
        Ok(())
    }

    async fn cancel(&self, tag: &str) -> Result<(), AmqpError> {
        self.script.cancelled.lock().unwrap().push(tag.to_owned());
        self.script.live.lock().unwrap().retain(|t| t != tag);
        Ok(())
    }

    async fn publish(
        &self,
        _exchange: &str,
        _routing_key: &str,
        _body: &[u8],
        _properties: &MessageProperties,
        _options: PublishOptions,
    ) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Polls `check` until it holds, failing the test after a generous deadline.
pub(crate) async fn eventually(check: impl Fn() -> bool) {
    timeout(Duration::from_secs(60), async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition was not reached in time");
}
