//! Connection lifecycle: initial connect, automatic reconnection with
//! exponential backoff, network awareness and a silent-failure heartbeat.
//!
//! The supervisor runs as a single task that owns every piece of mutable
//! lifecycle state. Public methods only send it commands, so there is never
//! more than one connect attempt in flight. The latest status is kept on a
//! `watch` channel; listeners registered with `on_connection_change` get every
//! transition in order, including short-lived `Error` states.

use carelink_core::config::RealtimeConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::backoff::ReconnectBackoff;
use crate::error::{Error, Result};
use crate::registry::ChannelRegistry;
use crate::transport::{Transport, TransportEvent};

const TRANSITION_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not started, shut down, or the very first connect is still pending
    Disconnected,
    Connected,
    /// Connection lost while the network is up; retries are scheduled (or
    /// exhausted, see [`ConnectionStatus::retries_exhausted`])
    Reconnecting,
    /// The host reported the network as down; retries are suspended
    Offline,
    /// The last attempt failed; reported briefly before the next retry
    Error,
}

impl ConnectionState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Offline => "offline",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Consecutive failed attempts since the last successful connect
    pub reconnect_attempts: u32,
    /// Automatic retries stopped; only `force_reconnect` or a network
    /// online transition restarts them
    pub retries_exhausted: bool,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            retries_exhausted: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub heartbeat_interval: Duration,
    pub command_buffer: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from(&RealtimeConfig::default())
    }
}

impl From<&RealtimeConfig> for SupervisorConfig {
    fn from(config: &RealtimeConfig) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            command_buffer: config.event_buffer.max(1),
        }
    }
}

#[derive(Debug)]
enum Command {
    ForceReconnect,
    Network { online: bool },
}

/// Stops delivery to a connection-change listener when dropped
#[must_use = "dropping the handle unsubscribes the listener"]
pub struct ListenerHandle {
    _guard: DropGuard,
}

impl ListenerHandle {
    pub fn unsubscribe(self) {}
}

pub struct ConnectionSupervisor {
    transport: Arc<dyn Transport>,
    registry: Arc<ChannelRegistry>,
    config: SupervisorConfig,
    status: watch::Sender<ConnectionStatus>,
    transitions: broadcast::Sender<ConnectionStatus>,
    commands: mpsc::Sender<Command>,
    command_rx: Mutex<Option<mpsc::Receiver<Command>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionSupervisor {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<ChannelRegistry>,
        config: SupervisorConfig,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::default());
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        let (commands, command_rx) = mpsc::channel(config.command_buffer);
        Self {
            transport,
            registry,
            config,
            status,
            transitions,
            commands,
            command_rx: Mutex::new(Some(command_rx)),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Spawn the supervisor task; it attempts the initial connection
    /// immediately. Calling it again is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Shutdown);
        }
        let Some(commands) = self.command_rx.lock().take() else {
            debug!("Connection supervisor already started");
            return Ok(());
        };

        let worker = Worker {
            transport: self.transport.clone(),
            registry: self.registry.clone(),
            status: self.status.clone(),
            transitions: self.transitions.clone(),
            backoff: ReconnectBackoff::new(self.config.initial_backoff, self.config.max_backoff),
            config: self.config.clone(),
            attempts: 0,
            exhausted: false,
            online: true,
            retry_at: None,
        };
        let events = self.transport.events();
        let handle = tokio::spawn(worker.run(commands, events, self.cancel.clone()));
        *self.task.lock() = Some(handle);
        info!("Connection supervisor started");
        Ok(())
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// Receiver that observes every status change
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Call `listener` on every status transition, in order, until the
    /// handle is dropped
    pub fn on_connection_change<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        let mut rx = self.transitions.subscribe();
        let latest = self.status.subscribe();
        let token = CancellationToken::new();
        let stop = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(status) => listener(status),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Connection listener fell behind");
                            listener(latest.borrow().clone());
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });
        ListenerHandle {
            _guard: token.drop_guard(),
        }
    }

    /// Tear down and reconnect now, resetting the retry budget
    pub async fn force_reconnect(&self) -> Result<()> {
        self.send(Command::ForceReconnect).await
    }

    /// Report the host's network reachability
    pub async fn set_network_online(&self, online: bool) -> Result<()> {
        self.send(Command::Network { online }).await
    }

    async fn send(&self, command: Command) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Shutdown);
        }
        self.commands.send(command).await.map_err(|_| Error::Shutdown)
    }

    /// Stop the supervisor, drop every live channel and disconnect
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Connection supervisor task failed");
            }
        }
        info!("Connection supervisor stopped");
    }
}

struct Worker {
    transport: Arc<dyn Transport>,
    registry: Arc<ChannelRegistry>,
    status: watch::Sender<ConnectionStatus>,
    transitions: broadcast::Sender<ConnectionStatus>,
    config: SupervisorConfig,
    backoff: ReconnectBackoff,
    attempts: u32,
    exhausted: bool,
    online: bool,
    retry_at: Option<Instant>,
}

impl Worker {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: broadcast::Receiver<TransportEvent>,
        cancel: CancellationToken,
    ) {
        self.attempt().await;

        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                () = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = events.recv() => match event {
                    Ok(event) => self.handle_transport_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed transport events");
                    }
                    Err(RecvError::Closed) => {
                        error!("Transport event stream closed");
                        break;
                    }
                },
                () = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_at = None;
                    self.attempt().await;
                }
                _ = heartbeat.tick() => self.check_heartbeat().await,
            }
        }

        self.registry.suspend_all().await;
        self.transport.disconnect().await;
        self.retry_at = None;
        self.publish(ConnectionState::Disconnected);
    }

    fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    fn publish(&self, state: ConnectionState) {
        let status = ConnectionStatus {
            state,
            reconnect_attempts: self.attempts,
            retries_exhausted: self.exhausted,
        };
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                debug!(from = %current.state, to = %status.state, attempts = status.reconnect_attempts, "Connection state changed");
                *current = status.clone();
                true
            }
        });
        if changed {
            let _ = self.transitions.send(status);
        }
    }

    /// One connect attempt; on success rebuild every channel before
    /// announcing `Connected`.
    async fn attempt(&mut self) {
        match self.transport.connect().await {
            Ok(()) => {
                let recovered = self.attempts > 0 || self.state() != ConnectionState::Disconnected;
                self.attempts = 0;
                self.exhausted = false;
                self.backoff.reset();
                self.retry_at = None;

                let report = self.registry.recreate_all().await;
                if !report.is_complete() {
                    warn!(failed = report.failed.len(), "Some channels could not be recreated");
                }
                if recovered {
                    info!(channels = report.recreated.len(), "Reconnected");
                } else {
                    info!(channels = report.recreated.len(), "Connected");
                }
                self.publish(ConnectionState::Connected);
            }
            Err(e) => {
                self.attempts += 1;
                warn!(attempt = self.attempts, max = self.config.max_attempts, error = %e, "Connect attempt failed");
                self.publish(ConnectionState::Error);
                self.schedule_retry();
            }
        }
    }

    fn schedule_retry(&mut self) {
        if !self.online {
            self.publish(ConnectionState::Offline);
            return;
        }
        if self.attempts >= self.config.max_attempts {
            self.exhausted = true;
            self.retry_at = None;
            let e = Error::MaxRetriesExceeded {
                attempts: self.attempts,
            };
            error!(error = %e, "Giving up on automatic reconnection");
            self.publish(ConnectionState::Reconnecting);
            return;
        }
        let delay = self.backoff.next_delay();
        self.retry_at = Some(Instant::now() + delay);
        debug!(delay_ms = delay.as_millis() as u64, attempt = self.attempts + 1, "Reconnect scheduled");
        self.publish(ConnectionState::Reconnecting);
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        let (reason, failed) = match event {
            TransportEvent::Closed { reason } => (reason, false),
            TransportEvent::Error { message } => (message, true),
        };
        match self.state() {
            ConnectionState::Connected => {
                warn!(reason = %reason, "Connection lost");
                if failed {
                    self.publish(ConnectionState::Error);
                }
                self.connection_lost().await;
            }
            ConnectionState::Offline => {
                debug!(reason = %reason, "Transport event while offline");
                self.registry.suspend_all().await;
            }
            state => {
                debug!(reason = %reason, state = %state, "Ignoring transport event");
            }
        }
    }

    async fn connection_lost(&mut self) {
        self.registry.suspend_all().await;
        self.transport.disconnect().await;
        self.schedule_retry();
    }

    async fn check_heartbeat(&mut self) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        let logical = self.registry.subscription_count().await;
        let live = self.transport.active_channel_count();
        if logical > 0 && live == 0 {
            warn!(subscriptions = logical, "Transport lost every channel silently");
            self.connection_lost().await;
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::ForceReconnect => {
                info!("Forced reconnect");
                self.restart().await;
            }
            Command::Network { online: false } => {
                if !self.online {
                    return;
                }
                info!("Network offline, suspending reconnection");
                self.online = false;
                self.retry_at = None;
                self.publish(ConnectionState::Offline);
            }
            Command::Network { online: true } => {
                let was_offline = !self.online;
                self.online = true;
                if was_offline || self.state() != ConnectionState::Connected {
                    info!("Network online, reconnecting");
                    self.restart().await;
                }
            }
        }
    }

    /// Reset the retry budget and try again immediately
    async fn restart(&mut self) {
        self.registry.suspend_all().await;
        self.transport.disconnect().await;
        self.attempts = 0;
        self.exhausted = false;
        self.backoff.reset();
        self.retry_at = None;
        self.publish(ConnectionState::Reconnecting);
        self.attempt().await;
    }
}
