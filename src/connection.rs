// Copyright (c) 2025 - Cowboy AI, Inc.
//! Connection Manager
//!
//! Owns the single logical connection and channel to the broker for the
//! process. Publisher, consumer and dead-letter handler share one instance
//! through an `Arc`, handed out by the composition root ([`crate::EventBus`]).
//!
//! # State Machine
//!
//! ```text
//!                 connect()                    success
//!  Disconnected ────────────▶ Connecting ─────────────────▶ Connected
//!       ▲                         │                             │
//!       │         failure         │        error / close event  │
//!       └─────────────────────────┴─────────────────────────────┘
//!                          (reconnect loop scheduled)
//! ```
//!
//! Only the caller that moves the state from `Disconnected` to `Connecting`
//! opens a connection. Concurrent `connect()` calls coalesce onto that attempt
//! and wait for it to settle.
//!
//! # Reconnection
//!
//! A lost connection starts one supervised loop: wait the configured fixed
//! delay, try again, up to `max_reconnect_attempts`. Once the cap is hit the
//! loop stops and only an explicit `connect()` resumes.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, BrokerResult, ConnectionEvent,
    ExchangeOptions,
};
use crate::config::MessagingConfig;
use crate::errors::{MessagingError, MessagingResult};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

struct Link {
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
}

/// Shared broker connection with bounded reconnection
pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    config: MessagingConfig,
    state: watch::Sender<ConnectionState>,
    link: Mutex<Option<Link>>,
    attempts: AtomicU32,
    generation: AtomicU64,
    closed: AtomicBool,
    reconnecting: AtomicBool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    weak_self: Weak<ConnectionManager>,
}

impl ConnectionManager {
    /// Create a manager; nothing is opened until [`connect`](Self::connect)
    pub fn new(broker: Arc<dyn Broker>, config: MessagingConfig) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new_cyclic(|weak_self| Self {
            broker,
            config,
            state,
            link: Mutex::new(None),
            attempts: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            supervisor: Mutex::new(None),
            reconnect_task: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    /// Open the connection and channel, set prefetch and declare the exchange
    ///
    /// On failure the error is returned and a background reconnect is scheduled.
    pub async fn connect(&self) -> MessagingResult<()> {
        self.closed.store(false, Ordering::SeqCst);
        self.attempts.store(0, Ordering::SeqCst);

        if !self.begin_attempt() {
            debug!("Connection attempt already in progress or established");
            return self.await_settled().await;
        }
        self.establish().await
    }

    /// Move `Disconnected` to `Connecting`; false if another caller owns the attempt
    fn begin_attempt(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        })
    }

    /// Wait for an in-flight attempt to finish
    async fn await_settled(&self) -> MessagingResult<()> {
        let mut state = self.state.subscribe();
        let settled = *state
            .wait_for(|state| *state != ConnectionState::Connecting)
            .await
            .map_err(|_| MessagingError::NotConnected)?;
        match settled {
            ConnectionState::Connected => Ok(()),
            _ => Err(MessagingError::NotConnected),
        }
    }

    /// Run one attempt; the caller must have won [`begin_attempt`](Self::begin_attempt)
    async fn establish(&self) -> MessagingResult<()> {
        let url = &self.config.broker_url;
        match self.open_link().await {
            Ok((link, events)) => {
                if self.closed.load(Ordering::SeqCst) {
                    close_link(link).await;
                    self.state.send_replace(ConnectionState::Disconnected);
                    return Err(MessagingError::NotConnected);
                }

                *self.link.lock() = Some(link);
                self.attempts.store(0, Ordering::SeqCst);
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                self.spawn_supervisor(events, generation);
                self.state.send_replace(ConnectionState::Connected);

                info!(
                    url = %url,
                    exchange = %self.config.exchange,
                    prefetch = self.config.prefetch_count,
                    generation = generation,
                    "Connected to message broker"
                );
                Ok(())
            }
            Err(err) => {
                self.state.send_replace(ConnectionState::Disconnected);
                error!(url = %url, error = %err, "Failed to connect to message broker");
                self.schedule_reconnect();
                Err(err.into())
            }
        }
    }

    async fn open_link(&self) -> BrokerResult<(Link, broadcast::Receiver<ConnectionEvent>)> {
        let connection = self.broker.connect(&self.config.broker_url).await?;
        let events = connection.events();

        let setup = async {
            let channel = connection.open_channel().await?;
            channel.basic_qos(self.config.prefetch_count).await?;
            channel
                .exchange_declare(
                    &self.config.exchange,
                    self.config.exchange_kind,
                    ExchangeOptions::default(),
                )
                .await?;
            Ok::<_, BrokerError>(channel)
        };

        match setup.await {
            Ok(channel) => Ok((Link { connection, channel }, events)),
            Err(err) => {
                if let Err(close_err) = connection.close().await {
                    debug!(error = %close_err, "Error closing half-open connection");
                }
                Err(err)
            }
        }
    }

    /// Watch the connection for error/close events
    fn spawn_supervisor(&self, mut events: broadcast::Receiver<ConnectionEvent>, generation: u64) {
        let weak = self.weak_self.clone();
        let handle = tokio::spawn(async move {
            let reason = loop {
                match events.recv().await {
                    Ok(ConnectionEvent::Error(reason)) => {
                        warn!(reason = %reason, "Broker connection error");
                        break reason;
                    }
                    Ok(ConnectionEvent::Closed(reason)) => break reason,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        break "connection event stream ended".to_string()
                    }
                }
            };
            if let Some(manager) = weak.upgrade() {
                manager.connection_lost(generation, &reason).await;
            }
        });

        if let Some(previous) = self.supervisor.lock().replace(handle) {
            previous.abort();
        }
    }

    async fn connection_lost(&self, generation: u64, reason: &str) {
        if self.closed.load(Ordering::SeqCst) || self.generation.load(Ordering::SeqCst) != generation
        {
            return;
        }

        let link = self.link.lock().take();
        self.state.send_replace(ConnectionState::Disconnected);
        warn!(reason = %reason, generation = generation, "Connection to message broker lost");

        if let Some(link) = link {
            close_link(link).await;
        }
        self.schedule_reconnect();
    }

    /// Start the reconnect loop unless one is already running
    fn schedule_reconnect(&self) {
        if self.closed.load(Ordering::SeqCst) || self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = self.weak_self.clone();
        let handle = tokio::spawn(reconnect_loop(weak));
        *self.reconnect_task.lock() = Some(handle);
    }

    /// Channel of the current connection
    pub fn channel(&self) -> MessagingResult<Arc<dyn BrokerChannel>> {
        self.link
            .lock()
            .as_ref()
            .map(|link| Arc::clone(&link.channel))
            .ok_or(MessagingError::NotConnected)
    }

    /// Current connection
    pub fn connection(&self) -> MessagingResult<Arc<dyn BrokerConnection>> {
        self.link
            .lock()
            .as_ref()
            .map(|link| Arc::clone(&link.connection))
            .ok_or(MessagingError::NotConnected)
    }

    /// True only while both connection and channel are held
    pub fn is_connected(&self) -> bool {
        self.link.lock().is_some()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receive every state transition
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Incremented on every successful connect
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Close channel then connection; safe to call repeatedly
    pub async fn close(&self) -> MessagingResult<()> {
        self.closed.store(true, Ordering::SeqCst);

        if let Some(task) = self.reconnect_task.lock().take() {
            task.abort();
        }
        self.reconnecting.store(false, Ordering::SeqCst);
        if let Some(task) = self.supervisor.lock().take() {
            task.abort();
        }

        let link = self.link.lock().take();
        self.state.send_replace(ConnectionState::Disconnected);

        if let Some(link) = link {
            close_link(link).await;
            info!("Closed connection to message broker");
        }
        Ok(())
    }
}

async fn close_link(link: Link) {
    if let Err(err) = link.channel.close().await {
        warn!(error = %err, "Error closing broker channel");
    }
    if let Err(err) = link.connection.close().await {
        warn!(error = %err, "Error closing broker connection");
    }
}

/// Fixed-delay, bounded reconnect loop
async fn reconnect_loop(weak: Weak<ConnectionManager>) {
    let reconnected = loop {
        let Some(manager) = weak.upgrade() else {
            return;
        };
        if manager.closed.load(Ordering::SeqCst) {
            break false;
        }

        let max = manager.config.max_reconnect_attempts;
        let attempt = manager.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > max {
            error!(
                max_attempts = max,
                "Giving up on the message broker, call connect() to resume"
            );
            break false;
        }

        let delay = manager.config.reconnect_delay;
        drop(manager);
        tokio::time::sleep(delay).await;

        let Some(manager) = weak.upgrade() else {
            return;
        };
        if manager.closed.load(Ordering::SeqCst) {
            break false;
        }
        if !manager.begin_attempt() {
            // someone else connected in the meantime
            if manager.await_settled().await.is_ok() {
                break true;
            }
            continue;
        }

        info!(attempt = attempt, max_attempts = max, "Reconnecting to message broker");
        if manager.establish().await.is_ok() {
            break true;
        }
    };

    if let Some(manager) = weak.upgrade() {
        manager.reconnecting.store(false, Ordering::SeqCst);
        // lost again before the flag was cleared
        if reconnected && manager.state() == ConnectionState::Disconnected {
            manager.schedule_reconnect();
        }
    }
}
