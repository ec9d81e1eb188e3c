// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Supervisor
//!
//! The supervisor keeps one connection and one shared channel alive on a
//! dedicated tokio task and multiplexes every registered [`Consumer`] over that
//! channel. Each pass of the run loop walks
//! `Connecting -> ChannelOpen -> ConsumersRegistered -> Consuming`:
//!
//! - connection failures are retried after `retry_interval` with a fresh connection;
//! - channel failures are retried after `retry_interval` on the same connection;
//! - a consumer whose setup fails stops the supervisor with
//!   [`AmqpError::ConsumerRegistrationError`];
//! - a consume loop failure restarts the pass and keeps the connection;
//! - a consume loop that returns cleanly ends supervision.
//!
//! Every wait of the run loop also watches the shutdown signal raised by
//! [`Supervisor::stop`], so a stop never waits on a stuck broker call.

use crate::{
    broker::{BrokerChannel, BrokerClient, BrokerConnection},
    channel::LapinBroker,
    config::{ConnectionParameters, SupervisorConfig},
    consumer::Consumer,
    errors::{AmqpError, ShutdownReport, ShutdownStep},
    publisher::Publisher,
    registry::ConsumerRegistry,
};
use std::{
    future::Future,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
    },
};
use tokio::{
    runtime::Handle,
    sync::{watch, Mutex as AsyncMutex, Notify},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, error, info, warn};

/// Whether the run loop is allowed to continue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunState {
    #[default]
    Stopped,
    Running,
    ShuttingDown,
}

/// Where the run loop currently is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LifecycleState {
    #[default]
    Stopped,
    Connecting,
    ChannelOpen,
    ConsumersRegistered,
    Consuming,
}

/// The broker handles currently in use. Replaced wholesale, never patched.
#[derive(Default)]
struct Session {
    run: RunState,
    connection: Option<Arc<dyn BrokerConnection>>,
    channel: Option<Arc<dyn BrokerChannel>>,
}

struct Shared {
    client: Arc<dyn BrokerClient>,
    params: ConnectionParameters,
    config: SupervisorConfig,
    session: Mutex<Session>,
    registry: RwLock<ConsumerRegistry>,
    /// Held while a consumer is bound to a channel or cancelled and forgotten,
    /// so a removal never interleaves with the registration of the same queue.
    binding: AsyncMutex<()>,
    lifecycle: watch::Sender<LifecycleState>,
    shutdown: watch::Sender<bool>,
    drained: Notify,
}

/// Supervises a broker connection and the consumers multiplexed over it.
pub struct Supervisor {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<Result<(), AmqpError>>>>,
}

/// Non-owning reference to a [`Supervisor`], handed to consumers built with
/// [`Supervisor::add_consumer_with`].
#[derive(Clone)]
pub struct SupervisorHandle {
    shared: Weak<Shared>,
}

impl Supervisor {
    /// Creates a stopped supervisor with an empty consumer registry.
    ///
    /// Nothing is dialed until [`Supervisor::start`] is called.
    ///
    /// # Parameters
    /// * `client` - Broker client used for the consuming connection and for publishers
    /// * `params` - Address and credentials of the broker
    /// * `config` - Retry, idle poll and prefetch policy
    ///
    /// # Returns
    /// A new supervisor in the `Stopped` state
    pub fn new(
        client: Arc<dyn BrokerClient>,
        params: ConnectionParameters,
        config: SupervisorConfig,
    ) -> Supervisor {
        let (lifecycle, _) = watch::channel(LifecycleState::Stopped);
        let (shutdown, _) = watch::channel(false);

        Supervisor {
            shared: Arc::new(Shared {
                client,
                params,
                config,
                session: Mutex::new(Session::default()),
                registry: RwLock::new(ConsumerRegistry::default()),
                binding: AsyncMutex::new(()),
                lifecycle,
                shutdown,
                drained: Notify::new(),
            }),
            task: Mutex::new(None),
        }
    }

    /// A supervisor backed by `lapin` with the default timing policy.
    pub fn with_lapin(params: ConnectionParameters) -> Supervisor {
        Supervisor::new(Arc::new(LapinBroker), params, SupervisorConfig::default())
    }

    /// The connection parameters the supervisor was created with.
    pub fn params(&self) -> &ConnectionParameters {
        &self.shared.params
    }

    /// Whether the run loop is running, draining after a stop, or stopped.
    pub fn run_state(&self) -> RunState {
        self.shared.session().run
    }

    /// The step of the run loop the supervisor is currently at.
    pub fn lifecycle(&self) -> LifecycleState {
        *self.shared.lifecycle.borrow()
    }

    /// Follows lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.shared.lifecycle.subscribe()
    }

    /// A non-owning handle; it does not keep the supervisor alive.
    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Queue names of the registered consumers, in registration order.
    pub fn consumers(&self) -> Vec<String> {
        self.shared.registry().queue_names()
    }

    /// Registers `consumer` under its queue name.
    ///
    /// While consuming, the new consumer is only bound to the broker on the next
    /// reconnect; the live channel is left untouched.
    ///
    /// # Parameters
    /// * `consumer` - The consumer to register
    ///
    /// # Returns
    /// `DuplicateQueueNameError` if the queue already has a consumer, in which
    /// case the registry is unchanged
    pub fn add_consumer(&self, consumer: Arc<dyn Consumer>) -> Result<(), AmqpError> {
        self.shared.add_consumer(consumer)
    }

    /// Builds a consumer with a handle back to this supervisor and registers it.
    pub fn add_consumer_with<C, F>(&self, build: F) -> Result<(), AmqpError>
    where
        C: Consumer + 'static,
        F: FnOnce(SupervisorHandle) -> C,
    {
        self.add_consumer(Arc::new(build(self.handle())))
    }

    /// Cancels the consumer of `queue` on the live channel, if any, and forgets it.
    /// Unknown queues are ignored. If the run loop is binding that consumer right
    /// now, the removal waits for the binding to finish and then cancels it.
    pub async fn remove_consumer(&self, queue: &str) {
        self.shared.remove_consumer(queue).await
    }

    /// Resolves once no consumer is registered.
    pub async fn wait_until_idle(&self) {
        loop {
            let drained = self.shared.drained.notified();
            let idle = self.shared.registry().is_empty();
            if idle {
                return;
            }

            tokio::select! {
                _ = drained => {}
                _ = sleep(self.shared.config.idle_poll_interval) => {}
            }
        }
    }

    /// Opens a publisher with its own connection to the same broker.
    pub async fn new_publisher(&self) -> Result<Publisher, AmqpError> {
        self.shared.new_publisher().await
    }

    /// Spawns the run loop on the current tokio runtime and returns immediately.
    /// Calling it while already running does nothing.
    ///
    /// # Returns
    /// `InternalError` outside a tokio runtime, `ShuttingDown` while the previous
    /// run loop is still draining
    pub fn start(&self) -> Result<(), AmqpError> {
        let runtime = Handle::try_current().map_err(|err| {
            error!(error = err.to_string(), "supervisor started outside a tokio runtime");
            AmqpError::InternalError
        })?;

        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut session = self.shared.session();
            match session.run {
                RunState::Running => {
                    debug!("supervisor is already running");
                    return Ok(());
                }
                RunState::ShuttingDown => return Err(AmqpError::ShuttingDown),
                RunState::Stopped => {}
            }
            if task.as_ref().is_some_and(|t| !t.is_finished()) {
                return Err(AmqpError::ShuttingDown);
            }
            session.run = RunState::Running;
        }

        self.shared.shutdown.send_replace(false);
        let shutdown = self.shared.shutdown.subscribe();
        *task = Some(runtime.spawn(self.shared.clone().run(shutdown)));
        Ok(())
    }

    /// Waits for the run loop to end and returns its outcome. A fatal consumer
    /// registration error surfaces here.
    pub async fn join(&self) -> Result<(), AmqpError> {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match task {
            None => Ok(()),
            Some(task) => task.await.unwrap_or_else(|err| {
                error!(error = err.to_string(), "supervisor task failed");
                Err(AmqpError::InternalError)
            }),
        }
    }

    /// Stops consuming, clears the running flag, then closes the channel and the
    /// connection. Every step runs even if an earlier one failed; failures are
    /// logged and reported, never returned. Registered consumers are kept.
    pub async fn stop(&self) -> ShutdownReport {
        let mut report = ShutdownReport::default();

        let (channel, connection) = {
            let mut session = self.shared.session();
            if session.run == RunState::Running {
                session.run = RunState::ShuttingDown;
            }
            (session.channel.take(), session.connection.take())
        };

        self.shared.shutdown.send_replace(true);
        if let Some(channel) = &channel {
            report.record(ShutdownStep::StopConsuming, channel.stop_consuming().await);
        }

        self.shared.session().run = RunState::Stopped;

        if let Some(channel) = channel {
            report.record(ShutdownStep::CloseChannel, channel.close().await);
        }
        if let Some(connection) = connection {
            report.record(ShutdownStep::CloseConnection, connection.close().await);
        }

        info!(clean = report.is_clean(), "supervisor stopped");
        report
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        {
            let mut session = self.shared.session();
            if session.run == RunState::Running {
                session.run = RunState::ShuttingDown;
            }
        }
        self.shared.shutdown.send_replace(true);
    }
}

impl SupervisorHandle {
    fn upgrade(&self) -> Result<Arc<Shared>, AmqpError> {
        self.shared.upgrade().ok_or(AmqpError::SupervisorGone)
    }

    /// Opens a publisher with its own connection to the supervisor's broker.
    pub async fn new_publisher(&self) -> Result<Publisher, AmqpError> {
        self.upgrade()?.new_publisher().await
    }

    /// Cancels and forgets the consumer of `queue`.
    ///
    /// # Returns
    /// `SupervisorGone` once the supervisor has been dropped
    pub async fn remove_consumer(&self, queue: &str) -> Result<(), AmqpError> {
        self.upgrade()?.remove_consumer(queue).await;
        Ok(())
    }

    /// Run state of the supervisor; `Stopped` once it has been dropped.
    pub fn run_state(&self) -> RunState {
        match self.shared.upgrade() {
            Some(shared) => {
                let run = shared.session().run;
                run
            }
            None => RunState::Stopped,
        }
    }
}

/// Runs `fut` unless shutdown is requested first, in which case `None` is returned.
async fn interruptible<F: Future>(
    shutdown: &mut watch::Receiver<bool>,
    fut: F,
) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = shutdown.wait_for(|stop| *stop) => None,
        out = fut => Some(out),
    }
}

impl Shared {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry(&self) -> RwLockReadGuard<'_, ConsumerRegistry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_mut(&self) -> RwLockWriteGuard<'_, ConsumerRegistry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_running(&self) -> bool {
        self.session().run == RunState::Running
    }

    fn transition(&self, state: LifecycleState) {
        let previous = self.lifecycle.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "lifecycle transition");
        }
    }

    fn add_consumer(&self, consumer: Arc<dyn Consumer>) -> Result<(), AmqpError> {
        let queue = consumer.queue_name().to_owned();
        self.registry_mut().insert(consumer).inspect_err(|err| {
            warn!(queue = queue.as_str(), error = err.to_string(), "consumer rejected")
        })?;

        info!(queue = queue.as_str(), "consumer is added");
        if *self.lifecycle.borrow() == LifecycleState::Consuming {
            info!(
                queue = queue.as_str(),
                "consumer will be bound on the next reconnect"
            );
        }
        Ok(())
    }

    async fn remove_consumer(&self, queue: &str) {
        let _binding = self.binding.lock().await;
        let known = self.registry().contains(queue);
        if !known {
            debug!(queue, "no consumer for queue, nothing to remove");
            return;
        }

        let channel = self.session().channel.clone();
        if let Some(channel) = channel {
            match channel.cancel(queue).await {
                Ok(()) => info!(queue, "cancel consumer for queue"),
                Err(err) => warn!(queue, error = err.to_string(), "failure to cancel consumer"),
            }
        }

        let idle = {
            let mut registry = self.registry_mut();
            registry.remove(queue);
            registry.is_empty()
        };
        info!(queue, "consumer is removed");

        if idle {
            self.drained.notify_waiters();
        }
    }

    async fn new_publisher(&self) -> Result<Publisher, AmqpError> {
        Publisher::connect(self.client.as_ref(), &self.params).await
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), AmqpError> {
        info!("supervisor is started");

        let result = self.supervise(&mut shutdown).await;
        if let Err(err) = &result {
            error!(error = err.to_string(), "supervisor stopped on a fatal error");
        }

        {
            let mut session = self.session();
            if session.run == RunState::Running {
                session.run = RunState::Stopped;
            }
        }
        self.transition(LifecycleState::Stopped);
        info!("supervisor is shutdown");

        result
    }

    async fn supervise(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), AmqpError> {
        while self.is_running() {
            self.transition(LifecycleState::Connecting);

            let connection = match self.current_connection() {
                Some(connection) => connection,
                None => match interruptible(shutdown, self.client.connect(&self.params)).await {
                    None => break,
                    Some(Ok(connection)) => {
                        if !self.install_connection(connection.clone()) {
                            close_discarded(connection.close()).await;
                            break;
                        }
                        info!(params = ?self.params, "connected to the broker");
                        connection
                    }
                    Some(Err(err)) => {
                        warn!(
                            error = err.to_string(),
                            retry_in = ?self.config.retry_interval,
                            "connection failed"
                        );
                        self.session().connection = None;
                        if !self.backoff(shutdown).await {
                            break;
                        }
                        continue;
                    }
                },
            };

            let stale = self.session().channel.take();
            if let Some(stale) = stale {
                if interruptible(shutdown, close_discarded(stale.close()))
                    .await
                    .is_none()
                {
                    break;
                }
            }

            let channel = match interruptible(shutdown, connection.open_channel()).await {
                None => break,
                Some(Ok(channel)) => {
                    if !self.install_channel(channel.clone()) {
                        close_discarded(channel.close()).await;
                        break;
                    }
                    info!("channel opened");
                    channel
                }
                Some(Err(err)) => {
                    warn!(
                        error = err.to_string(),
                        retry_in = ?self.config.retry_interval,
                        "create channel failed"
                    );
                    if !self.backoff(shutdown).await {
                        break;
                    }
                    continue;
                }
            };
            self.transition(LifecycleState::ChannelOpen);

            match interruptible(shutdown, self.register_consumers(&channel)).await {
                None => break,
                Some(result) => result?,
            }
            self.transition(LifecycleState::ConsumersRegistered);

            let prefetch_count = self.config.prefetch_count;
            match interruptible(shutdown, channel.set_qos(prefetch_count)).await {
                None => break,
                Some(Ok(())) => debug!(prefetch_count, "qos applied"),
                Some(Err(err)) => warn!(error = err.to_string(), prefetch_count, "set qos failed"),
            }

            self.transition(LifecycleState::Consuming);
            match interruptible(shutdown, channel.start_consuming()).await {
                None => break,
                Some(Ok(())) => {
                    info!("consume loop finished");
                    break;
                }
                Some(Err(err)) => {
                    warn!(error = err.to_string(), "unexpected exit when consuming")
                }
            }
        }

        Ok(())
    }

    /// The retained connection, unless the broker closed it underneath us.
    fn current_connection(&self) -> Option<Arc<dyn BrokerConnection>> {
        let mut session = self.session();
        match &session.connection {
            Some(connection) if connection.is_open() => Some(connection.clone()),
            Some(_) => {
                warn!("connection lost, reconnecting");
                session.connection = None;
                None
            }
            None => None,
        }
    }

    fn install_connection(&self, connection: Arc<dyn BrokerConnection>) -> bool {
        let mut session = self.session();
        if session.run != RunState::Running {
            return false;
        }
        session.connection = Some(connection);
        true
    }

    fn install_channel(&self, channel: Arc<dyn BrokerChannel>) -> bool {
        let mut session = self.session();
        if session.run != RunState::Running {
            return false;
        }
        session.channel = Some(channel);
        true
    }

    /// Sleeps for the retry interval. Returns false when shutdown cut it short.
    async fn backoff(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        interruptible(shutdown, sleep(self.config.retry_interval))
            .await
            .is_some()
    }

    async fn register_consumers(&self, channel: &Arc<dyn BrokerChannel>) -> Result<(), AmqpError> {
        info!("initializing consumers");
        let queues = self.registry().queue_names();

        for queue in queues {
            let _binding = self.binding.lock().await;
            let current = self.registry().get(&queue);
            let Some(consumer) = current else {
                debug!(queue = queue.as_str(), "consumer removed before registration");
                continue;
            };

            let registration = async {
                consumer.on_channel_ready(channel.clone()).await?;
                channel
                    .register_consumer(&queue, &queue, consumer.clone())
                    .await
            };

            if let Err(err) = registration.await {
                error!(
                    queue = queue.as_str(),
                    error = err.to_string(),
                    "errors in initial consumer"
                );
                return Err(AmqpError::ConsumerRegistrationError(queue, err.to_string()));
            }
            info!(queue = queue.as_str(), "set consumer for queue");
        }

        info!("init consumers succeeded");
        Ok(())
    }
}

async fn close_discarded(close: impl Future<Output = Result<(), AmqpError>>) {
    if let Err(err) = close.await {
        debug!(error = err.to_string(), "failure to close discarded broker handle");
    }
}
