// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Worker
//!
//! Drives the [`Lifecycle`] machine against a real broker. Every broker
//! callback, connect result and reconnect timer is posted as a [`Signal`]
//! on one channel and turned into a [`LifecycleEvent`]; the machine answers
//! with [`Command`]s which this loop executes. Deliveries are dispatched
//! inline, so a worker handles one message at a time.
//!
//! Signals carry the epoch of the connection attempt they belong to. Each
//! new attempt and each deliberate close bumps the epoch, so late callbacks
//! from a connection the worker already gave up on are dropped.

use crate::{
    channel::{self, BrokerConnection},
    configs::WorkerConfigs,
    consumer::{self, InboundDelivery},
    deadletter::DeadLetters,
    errors::{AmqpError, ConfigError},
    lifecycle::{Backoff, Command, ConnectionState, Lifecycle, LifecycleEvent},
    registry::{ConsumerBinding, HandlerRegistry},
    status::ProfileStatus,
    store::{resolve_profile, Store},
    topology::Topology,
};
use futures_util::{
    stream::{BoxStream, SelectAll},
    StreamExt,
};
use lapin::{message::Delivery, Channel};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

enum Signal {
    Stop,
    Opened { epoch: u64, connection: BrokerConnection },
    OpenFailed { epoch: u64, reason: String },
    ConnectionLost { epoch: u64, reason: String },
    ChannelLost { epoch: u64, reason: String },
    ReconnectDue { epoch: u64 },
}

impl Signal {
    fn epoch(&self) -> Option<u64> {
        match self {
            Signal::Stop => None,
            Signal::Opened { epoch, .. }
            | Signal::OpenFailed { epoch, .. }
            | Signal::ConnectionLost { epoch, .. }
            | Signal::ChannelLost { epoch, .. }
            | Signal::ReconnectDue { epoch } => Some(*epoch),
        }
    }
}

type Deliveries = SelectAll<BoxStream<'static, (usize, Result<Delivery, lapin::Error>)>>;

/// Broker resources owned by one run of the loop.
#[derive(Default)]
struct Session {
    epoch: u64,
    connection: Option<Arc<BrokerConnection>>,
    channel: Option<Channel>,
    deliveries: Deliveries,
    connect_task: Option<JoinHandle<()>>,
}

impl Session {
    fn drop_channel(&mut self) {
        self.channel = None;
        self.deliveries = SelectAll::new();
    }

    fn shutdown(&mut self) {
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        self.drop_channel();
        self.connection = None;
    }
}

/// Control surface of a worker, usable from any thread.
#[derive(Clone)]
pub struct WorkerHandle {
    signals: mpsc::UnboundedSender<Signal>,
    stop_requested: Arc<AtomicBool>,
    state: watch::Receiver<ConnectionState>,
}

impl WorkerHandle {
    /// Requests a graceful shutdown. Further calls have no effect.
    pub fn stop(&self) {
        if self.stop_requested.swap(true, Ordering::SeqCst) {
            info!("worker is already stopping");
            return;
        }

        info!("stop requested");
        if self.signals.send(Signal::Stop).is_err() {
            debug!("worker loop is gone");
        }
    }

    /// True only while consumers are declared and deliveries flow.
    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Consuming
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

/// Consumes a set of bindings over one broker connection, reconnecting on
/// loss until stopped.
pub struct Worker<R: ?Sized, S: ?Sized> {
    registry: Arc<R>,
    store: Arc<S>,
    configs: WorkerConfigs,
    bindings: Vec<ConsumerBinding>,
    topology: Option<Topology>,
    signals: mpsc::UnboundedSender<Signal>,
    inbox: mpsc::UnboundedReceiver<Signal>,
    stop_requested: Arc<AtomicBool>,
    state: watch::Sender<ConnectionState>,
}

impl<R, S> Worker<R, S>
where
    R: HandlerRegistry + ?Sized,
    S: Store + ?Sized,
{
    /// Builds a worker consuming `bindings`. Every binding must resolve in
    /// `registry` and no queue may be bound twice.
    pub fn new(
        registry: Arc<R>,
        store: Arc<S>,
        configs: WorkerConfigs,
        bindings: Vec<ConsumerBinding>,
    ) -> Result<Self, ConfigError> {
        let mut queues: HashMap<&str, &ConsumerBinding> = HashMap::new();
        for binding in &bindings {
            if let Some(first) = queues.insert(binding.queue(), binding) {
                return Err(ConfigError::DuplicateQueue {
                    queue: binding.queue().to_owned(),
                    first: format!("{}.{}", first.target(), first.handler()),
                    second: format!("{}.{}", binding.target(), binding.handler()),
                });
            }

            if registry.resolve(binding.target(), binding.handler()).is_none() {
                return Err(ConfigError::UnknownConsumer {
                    target: binding.target().to_owned(),
                    handler: binding.handler().to_owned(),
                });
            }
        }

        let (signals, inbox) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Ok(Worker {
            registry,
            store,
            configs,
            bindings,
            topology: None,
            signals,
            inbox,
            stop_requested: Arc::new(AtomicBool::new(false)),
            state,
        })
    }

    /// Declares `topology` on every channel before consumers attach.
    pub fn topology(mut self, topology: Topology) -> Self {
        self.topology = Some(topology);
        self
    }

    /// A handle to stop and observe the worker once `start` owns it.
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            signals: self.signals.clone(),
            stop_requested: self.stop_requested.clone(),
            state: self.state.subscribe(),
        }
    }

    /// See [`WorkerHandle::stop`].
    pub fn stop(&self) {
        self.handle().stop()
    }

    pub fn is_ready(&self) -> bool {
        *self.state.borrow() == ConnectionState::Consuming
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// The bindings this worker consumes.
    pub fn bindings(&self) -> &[ConsumerBinding] {
        &self.bindings
    }

    /// Replay access to the dead letters of this worker's store.
    pub fn dead_letters(&self) -> DeadLetters<R, S> {
        DeadLetters::new(self.registry.clone(), self.store.clone())
            .autocommit(self.configs.autocommit)
    }

    /// Runs the worker until it is stopped.
    ///
    /// Broker faults never end the loop: they are logged and followed by a
    /// reconnect with backoff.
    ///
    /// # Returns
    /// `Ok(())` once a stop request has closed the connection
    pub async fn start(&mut self) -> Result<(), AmqpError> {
        info!(
            app = self.configs.app_name,
            profile = self.configs.profile,
            consumers = self.bindings.len(),
            "starting worker"
        );

        let mut lifecycle = Lifecycle::new(Backoff::new(
            self.configs.reconnect_delay,
            self.configs.max_reconnect_delay,
        ));
        let mut session = Session::default();
        let mut pending = VecDeque::new();

        if self.stop_requested.load(Ordering::SeqCst) {
            pending.push_back(LifecycleEvent::StopRequested);
        }
        pending.push_back(LifecycleEvent::Start);

        loop {
            while let Some(event) = pending.pop_front() {
                for command in lifecycle.on_event(event) {
                    if let Some(next) = self.execute(&mut session, command).await {
                        pending.push_back(next);
                    }
                }
                self.state.send_replace(lifecycle.state());

                if lifecycle.state() == ConnectionState::Closed {
                    session.shutdown();
                    info!("worker stopped");
                    return Ok(());
                }
            }

            tokio::select! {
                Some(signal) = self.inbox.recv() => {
                    if let Some(event) = self.on_signal(&mut session, signal) {
                        pending.push_back(event);
                    }
                }
                Some((index, delivery)) = session.deliveries.next(), if !session.deliveries.is_empty() => {
                    self.dispatch(&session, index, delivery).await;
                }
            }
        }
    }

    fn on_signal(&self, session: &mut Session, signal: Signal) -> Option<LifecycleEvent> {
        if let Some(epoch) = signal.epoch() {
            if epoch != session.epoch {
                debug!(epoch, current = session.epoch, "stale signal dropped");
                if let Signal::Opened { connection, .. } = signal {
                    tokio::spawn(async move { connection.close().await });
                }
                return None;
            }
        }

        let event = match signal {
            Signal::Stop => LifecycleEvent::StopRequested,
            Signal::Opened { connection, .. } => {
                session.connect_task = None;
                session.connection = Some(Arc::new(connection));
                LifecycleEvent::ConnectionOpened
            }
            Signal::OpenFailed { reason, .. } => {
                session.connect_task = None;
                LifecycleEvent::ConnectionOpenFailed(reason)
            }
            Signal::ConnectionLost { reason, .. } => {
                session.drop_channel();
                session.connection = None;
                session.epoch += 1;
                LifecycleEvent::ConnectionClosed(reason)
            }
            Signal::ChannelLost { reason, .. } => {
                session.drop_channel();
                LifecycleEvent::ChannelClosed(reason)
            }
            Signal::ReconnectDue { .. } => LifecycleEvent::ReconnectDue,
        };

        Some(event)
    }

    async fn execute(&self, session: &mut Session, command: Command) -> Option<LifecycleEvent> {
        debug!(command = ?command, "executing");

        match command {
            Command::Connect => self.connect(session).await,
            Command::AbortConnect => {
                if let Some(task) = session.connect_task.take() {
                    task.abort();
                    info!("pending connection attempt aborted");
                }
                session.epoch += 1;
                None
            }
            Command::OpenChannel => Some(self.open_channel(session).await),
            Command::DeclareConsumers => Some(self.declare_consumers(session).await),
            Command::CancelConsumer(tag) => {
                let Some(ch) = session.channel.as_ref() else {
                    return Some(LifecycleEvent::ChannelClosed("no open channel".to_owned()));
                };
                match channel::cancel_consumer(ch, &tag).await {
                    Ok(()) => Some(LifecycleEvent::CancelOk(tag)),
                    Err(err) => Some(LifecycleEvent::ChannelClosed(err.to_string())),
                }
            }
            Command::CloseChannel => {
                if let Some(ch) = session.channel.take() {
                    if let Err(err) = channel::close_channel(&ch).await {
                        warn!(error = err.to_string(), "channel did not close cleanly");
                    }
                }
                session.drop_channel();
                None
            }
            Command::CloseConnection => {
                session.drop_channel();
                session.epoch += 1;
                if let Some(conn) = session.connection.take() {
                    if let Err(err) = conn.close().await {
                        warn!(error = err.to_string(), "connection did not close cleanly");
                    }
                }
                Some(LifecycleEvent::ConnectionClosed(
                    "connection closed by the worker".to_owned(),
                ))
            }
            Command::ScheduleReconnect(delay) => {
                let epoch = session.epoch;
                let signals = self.signals.clone();
                info!(delay_ms = delay.as_millis() as u64, "reconnect scheduled");
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = signals.send(Signal::ReconnectDue { epoch });
                });
                None
            }
            Command::PersistStatus(status) => {
                self.persist_status(status).await;
                None
            }
            Command::StopLoop => None,
        }
    }

    async fn connect(&self, session: &mut Session) -> Option<LifecycleEvent> {
        session.epoch += 1;
        let epoch = session.epoch;

        let url = match resolve_profile(&*self.store, &self.configs.profile).await {
            Ok(url) => url,
            Err(err) => {
                error!(
                    profile = self.configs.profile,
                    error = err.to_string(),
                    "failure to resolve the connection profile"
                );
                return Some(LifecycleEvent::ConnectionOpenFailed(err.to_string()));
            }
        };

        info!(profile = self.configs.profile, epoch, "connecting");
        let signals = self.signals.clone();
        let app_name = self.configs.app_name.clone();

        session.connect_task = Some(tokio::spawn(async move {
            let signal = match BrokerConnection::open(&url, &app_name).await {
                Ok(connection) => {
                    let lost = signals.clone();
                    connection.on_error(move |reason| {
                        let _ = lost.send(Signal::ConnectionLost { epoch, reason });
                    });
                    Signal::Opened { epoch, connection }
                }
                Err(err) => Signal::OpenFailed {
                    epoch,
                    reason: err.to_string(),
                },
            };
            let _ = signals.send(signal);
        }));

        None
    }

    async fn open_channel(&self, session: &mut Session) -> LifecycleEvent {
        let Some(conn) = session.connection.clone() else {
            return LifecycleEvent::ChannelClosed("no open connection".to_owned());
        };

        let epoch = session.epoch;
        let signals = self.signals.clone();
        let opened = conn
            .open_channel(self.configs.prefetch_count, move |reason| {
                let _ = signals.send(Signal::ChannelLost { epoch, reason });
            })
            .await;

        let channel = match opened {
            Ok(channel) => channel,
            Err(err) => return LifecycleEvent::ChannelClosed(err.to_string()),
        };

        if let Some(topology) = &self.topology {
            if let Err(err) = topology.install(&channel).await {
                return LifecycleEvent::ChannelClosed(err.to_string());
            }
        }

        session.channel = Some(channel);
        LifecycleEvent::ChannelOpened
    }

    async fn declare_consumers(&self, session: &mut Session) -> LifecycleEvent {
        let Some(ch) = session.channel.as_ref() else {
            return LifecycleEvent::ChannelClosed("no open channel".to_owned());
        };

        match channel::declare_consumers(ch, &self.bindings).await {
            Ok(consumers) => {
                let mut tags = Vec::with_capacity(consumers.len());
                for (index, (tag, consumer)) in consumers.into_iter().enumerate() {
                    session
                        .deliveries
                        .push(consumer.map(move |delivery| (index, delivery)).boxed());
                    tags.push(tag);
                }
                LifecycleEvent::ConsumersDeclared(tags)
            }
            Err(err) => LifecycleEvent::ChannelClosed(err.to_string()),
        }
    }

    async fn dispatch(
        &self,
        session: &Session,
        index: usize,
        delivery: Result<Delivery, lapin::Error>,
    ) {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(err) => {
                error!(error = err.to_string(), "consumer stream failed");
                return;
            }
        };

        let (Some(binding), Some(channel)) = (self.bindings.get(index), session.channel.as_ref())
        else {
            warn!(delivery_tag = delivery.delivery_tag, "delivery without an open channel dropped");
            return;
        };

        let inbound = InboundDelivery::from(delivery);
        if let Err(err) = consumer::consume(
            binding,
            &inbound,
            &*self.registry,
            &*self.store,
            channel,
            self.configs.autocommit,
        )
        .await
        {
            error!(
                queue = binding.queue(),
                delivery_tag = inbound.delivery_tag,
                error = err.to_string(),
                "failure to settle delivery"
            );
        }
    }

    async fn persist_status(&self, status: ProfileStatus) {
        let persisted = match self.store.set_status(&self.configs.profile, status).await {
            Ok(()) if self.configs.autocommit => self.store.commit().await,
            other => other,
        };

        match persisted {
            Ok(()) => debug!(profile = self.configs.profile, status = status.as_str(), "profile status saved"),
            Err(err) => {
                warn!(
                    profile = self.configs.profile,
                    status = status.as_str(),
                    error = err.to_string(),
                    "failure to persist profile status"
                );
                if let Err(err) = self.store.rollback().await {
                    warn!(error = err.to_string(), "failure to rollback");
                }
            }
        }
    }
}

impl<R, S> Worker<R, S>
where
    R: HandlerRegistry + ?Sized + 'static,
    S: Store + ?Sized + 'static,
{
    /// Runs the worker on its own thread with a current-thread runtime.
    ///
    /// # Returns
    /// The thread join handle, yielding the result of [`start`](Self::start),
    /// and a handle to stop the worker
    pub fn spawn_thread(
        mut self,
    ) -> Result<(thread::JoinHandle<Result<(), AmqpError>>, WorkerHandle), AmqpError> {
        let handle = self.handle();

        let join = thread::Builder::new()
            .name(format!("{}-worker", self.configs.app_name))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|err| AmqpError::RuntimeError(err.to_string()))?;
                runtime.block_on(self.start())
            })
            .map_err(|err| AmqpError::RuntimeError(err.to_string()))?;

        Ok((join, handle))
    }
}
