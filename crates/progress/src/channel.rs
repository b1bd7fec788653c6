//! The progress channel state machine.
//!
//! One background task owns the connection. It idles in `Disconnected`
//! until asked to connect, then cycles
//! `Connecting -> Connected -> (error) -> Backoff(n) -> Connecting` with
//! bounded exponential backoff. When retries run out it publishes
//! [`ChannelEvent::ConnectionFailed`] and idles again until
//! [`ProgressChannel::reconnect`] (or a new endpoint) wakes it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reelctl_core::auth::Authenticator;
use reelctl_core::validation::validate_port;
use reelctl_events::EventBus;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{ChannelConfig, TransportKind};
use crate::error::ChannelError;
use crate::events::ChannelEvent;
use crate::messages::{parse_frame, ChannelMessage};
use crate::port::PortDiscovery;
use crate::reconnect::{ConnectionState, ReconnectPolicy};
use crate::socket::SocketTransport;
use crate::stream::EventStreamTransport;
use crate::transport::{Endpoint, Transport};

/// How long [`ProgressChannel::shutdown`] waits for the task to exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// What the job orchestrator needs from a progress source.
#[async_trait]
pub trait ProgressFeed: Send + Sync {
    /// Receive every event published from now on.
    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent>;

    /// Reserve a loopback endpoint for the next engine run and start
    /// listening on it. Returns the URL the engine should report to.
    async fn prepare_endpoint(&self) -> Result<String, ChannelError>;
}

pub struct ProgressChannel {
    config: ChannelConfig,
    auth: Arc<Authenticator>,
    transport: Arc<dyn Transport>,
    discovery: PortDiscovery,
    events: EventBus<ChannelEvent>,
    state: watch::Sender<ConnectionState>,
    /// Explicit port; `None` means discover.
    target: Mutex<Option<u16>>,
    wake: Notify,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProgressChannel {
    /// Build the channel with the transport named in `config` and start
    /// its background task. Must be called within a Tokio runtime.
    pub fn spawn(config: ChannelConfig, auth: Arc<Authenticator>) -> Arc<Self> {
        let transport: Arc<dyn Transport> = match config.transport {
            TransportKind::Stream => Arc::new(EventStreamTransport::new()),
            TransportKind::Socket => Arc::new(SocketTransport::default()),
        };
        Self::spawn_with_transport(config, auth, transport)
    }

    pub fn spawn_with_transport(
        config: ChannelConfig,
        auth: Arc<Authenticator>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let channel = Arc::new(Self {
            discovery: PortDiscovery::from_config(&config),
            config,
            auth,
            transport,
            events: EventBus::default(),
            state,
            target: Mutex::new(None),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        });

        let runner = Arc::clone(&channel);
        let handle = tokio::spawn(async move {
            tracing::debug!(transport = runner.transport.name(), "Progress channel task started");
            runner.run().await;
            tracing::debug!("Progress channel task exited");
        });
        *channel.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        channel
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus<ChannelEvent> {
        &self.events
    }

    pub fn discovery(&self) -> &PortDiscovery {
        &self.discovery
    }

    /// Connect, discovering the engine's port by probing.
    pub fn connect(&self) {
        *self.target.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.wake.notify_one();
    }

    /// Connect to a known port without discovery.
    pub fn connect_to(&self, port: u16) -> Result<(), ChannelError> {
        let port = validate_port(i64::from(port))?;
        *self.target.lock().unwrap_or_else(|e| e.into_inner()) = Some(port);
        self.wake.notify_one();
        Ok(())
    }

    /// Drop the current session (if any) and start over with a fresh
    /// retry budget.
    pub fn reconnect(&self) {
        self.wake.notify_one();
    }

    /// Stop the background task and wait briefly for it to exit.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down progress channel");
        self.cancel.cancel();
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, handle).await;
        }
    }

    async fn run(&self) {
        let mut policy = ReconnectPolicy::new(self.config.reconnect_base, self.config.max_attempts);
        loop {
            self.set_state(ConnectionState::Disconnected);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.wake.notified() => {}
            }
            policy.reset();
            if !self.drive(&mut policy).await {
                break;
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Connect and keep reconnecting. Returns `false` on shutdown, `true`
    /// once retries are exhausted.
    async fn drive(&self, policy: &mut ReconnectPolicy) -> bool {
        loop {
            self.set_state(ConnectionState::Connecting);
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return false,
                result = self.session(policy) => result,
            };

            let error = match result {
                Ok(()) => {
                    policy.reset();
                    continue;
                }
                Err(e) => e,
            };

            if matches!(error, ChannelError::AuthRequired) {
                self.rotate_credentials();
            }

            match policy.next_backoff() {
                Some((attempt, delay)) => {
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Progress channel retrying",
                    );
                    self.set_state(ConnectionState::Backoff(attempt));
                    tokio::select! {
                        _ = self.cancel.cancelled() => return false,
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.wake.notified() => policy.reset(),
                    }
                }
                None => {
                    let attempts = policy.attempt();
                    tracing::error!(attempts, error = %error, "Progress channel giving up");
                    self.events.publish(ChannelEvent::ConnectionFailed { attempts });
                    return true;
                }
            }
        }
    }

    /// One connection lifetime. `Ok(())` means a reconnect was requested.
    async fn session(&self, policy: &mut ReconnectPolicy) -> Result<(), ChannelError> {
        let explicit = *self.target.lock().unwrap_or_else(|e| e.into_inner());
        let port = match explicit {
            Some(port) => port,
            None => self
                .discovery
                .find_reachable()
                .await
                .ok_or(ChannelError::NoPortAvailable)?,
        };
        let endpoint = Endpoint::new(self.discovery.host(), port);

        self.auth.ensure_token();
        let mut stream = self.transport.connect(&endpoint, &self.auth).await?;

        policy.reset();
        self.set_state(ConnectionState::Connected);
        tracing::info!(port, transport = self.transport.name(), "Progress channel connected");

        let idle_timeout = self.config.idle_timeout;
        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);

        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.wake.notified() => {
                    tracing::info!(port, "Progress channel reconnect requested");
                    return Ok(());
                }
                _ = &mut idle => return Err(ChannelError::IdleTimeout(idle_timeout)),
                _ = heartbeat.tick() => match stream.heartbeat(&self.auth).await {
                    Ok(()) => {}
                    Err(ChannelError::AuthRequired) => return Err(ChannelError::AuthRequired),
                    Err(e) => tracing::warn!(port, error = %e, "Heartbeat failed"),
                },
                frame = stream.next_frame() => {
                    let Some(frame) = frame? else {
                        return Err(ChannelError::Closed);
                    };
                    match parse_frame(&frame) {
                        Ok(ChannelMessage::Progress(update)) => {
                            idle.as_mut().reset(Instant::now() + idle_timeout);
                            tracing::trace!(frame = update.frame, total = update.total_frames, "Progress");
                            self.events.publish(ChannelEvent::Progress(update));
                        }
                        Ok(ChannelMessage::Heartbeat) => {
                            idle.as_mut().reset(Instant::now() + idle_timeout);
                        }
                        Ok(ChannelMessage::AuthRequired) => return Err(ChannelError::AuthRequired),
                        Err(e) => tracing::warn!(error = %e, "Dropping malformed progress payload"),
                    }
                }
            }
        }
    }

    /// Swap the live token after the engine rejected it: use the refresh
    /// token when there is one, otherwise issue a new token.
    fn rotate_credentials(&self) {
        let refreshed = self
            .auth
            .current_token()
            .and_then(|token| token.refresh_token)
            .and_then(|refresh| self.auth.refresh_token(&refresh));
        if refreshed.is_none() {
            self.auth.create_token();
        }
        tracing::info!("Progress channel credentials rotated");
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            tracing::debug!(state = %next, "Progress channel state");
            self.events.publish(ChannelEvent::StateChanged(next));
        }
    }
}

#[async_trait]
impl ProgressFeed for ProgressChannel {
    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    async fn prepare_endpoint(&self) -> Result<String, ChannelError> {
        let port = self
            .discovery
            .find_free()
            .await
            .ok_or(ChannelError::NoPortAvailable)?;
        self.connect_to(port)?;
        Ok(Endpoint::new(self.discovery.host(), port).http_base())
    }
}
