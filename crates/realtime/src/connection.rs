use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use exchange_core::config::Config;
use exchange_core::event::{Event, EventBus, EventName, EventSource, Handler};
use exchange_core::session::{CredentialStore, UserId};
use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, sleep};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::error::ConnectionError;
use crate::frame::{InboundEvent, LifecycleEvent, OutboundFrame, decode_frame};
use crate::transport::{Connector, PushTransport};

#[cfg(not(feature = "native"))]
compile_error!("exchange-realtime requires the `native` feature.");

#[cfg(feature = "native")]
type DefaultConnector = crate::transport::WebSocketConnector;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting {
        attempt: u32,
    },
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Push endpoint without credentials; `userId` and `token` are appended.
    pub endpoint: String,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
    /// 0 retries until `disconnect`.
    pub max_reconnect_attempts: u32,
    /// Fraction of `reconnect_delay` randomised per attempt, in `[0, 1]`.
    pub reconnect_jitter: f64,
}

impl ClientConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            endpoint: config.server.ws_url.clone(),
            heartbeat_interval: Duration::from_secs(config.realtime.heartbeat_interval_seconds),
            reconnect_delay: Duration::from_secs(config.realtime.reconnect_delay_seconds),
            max_reconnect_attempts: config.realtime.max_reconnect_attempts,
            reconnect_jitter: config.realtime.reconnect_jitter,
        }
    }

    fn should_retry(&self, attempt: u32) -> bool {
        self.max_reconnect_attempts == 0 || attempt <= self.max_reconnect_attempts
    }

    fn next_reconnect_delay(&self) -> Duration {
        let jitter = self.reconnect_jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return self.reconnect_delay;
        }
        let spread = self.reconnect_delay.mul_f64(jitter);
        let offset = spread.mul_f64(rand::rng().random_range(0.0..2.0));
        self.reconnect_delay - spread + offset
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Which timers the client currently owns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActiveTimers {
    pub heartbeat: bool,
    pub reconnect: bool,
}

impl ActiveTimers {
    pub fn count(&self) -> usize {
        usize::from(self.heartbeat) + usize::from(self.reconnect)
    }
}

#[derive(Clone)]
struct SessionParams {
    user_id: UserId,
    credentials: Arc<dyn CredentialStore>,
}

enum Outbound {
    Frame(String),
    Close,
}

enum LinkEnd {
    Dropped(ConnectionError),
    Released,
}

#[derive(Default)]
struct Lifecycle {
    state: ConnectionState,
    intentional_close: bool,
    /// Bumped on every attempt and on disconnect; callbacks carrying an older
    /// value are stale and must not touch state.
    generation: u64,
    attempts: u32,
    session: Option<SessionParams>,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    link: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl Lifecycle {
    fn stop_heartbeat(&mut self) {
        if let Some(timer) = self.heartbeat.take() {
            timer.abort();
        }
    }

    fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.reconnect.take() {
            timer.abort();
        }
    }
}

struct Shared<C: Connector> {
    connector: C,
    config: ClientConfig,
    bus: Arc<dyn EventBus>,
    lifecycle: Mutex<Lifecycle>,
}

/// One push connection per session. Cloning shares the same connection.
pub struct ConnectionClient<C: Connector = DefaultConnector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for ConnectionClient<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

#[cfg(feature = "native")]
impl ConnectionClient<DefaultConnector> {
    pub fn new(config: ClientConfig, bus: Arc<dyn EventBus>) -> Self {
        Self::with_connector(DefaultConnector::default(), config, bus)
    }
}

impl<C: Connector> ConnectionClient<C> {
    pub fn with_connector(connector: C, config: ClientConfig, bus: Arc<dyn EventBus>) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector,
                config,
                bus,
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        }
    }

    /// Starts opening the connection and returns immediately. Ignored while
    /// Connecting or Connected. The token is read from `credentials` on this
    /// and every subsequent reconnect attempt.
    pub fn connect(&self, user_id: UserId, credentials: Arc<dyn CredentialStore>) {
        let mut lifecycle = self.shared.lock();
        if matches!(
            lifecycle.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            debug!(state = ?lifecycle.state, "connect ignored; connection already active");
            return;
        }

        lifecycle.intentional_close = false;
        lifecycle.attempts = 0;
        lifecycle.session = Some(SessionParams {
            user_id,
            credentials,
        });
        lifecycle.cancel_reconnect();
        let event = self.shared.begin_attempt(&mut lifecycle);
        drop(lifecycle);

        if let Some(event) = event {
            self.shared.emit(InboundEvent::Lifecycle(event));
        }
    }

    /// Serializes and transmits `payload` if Connected. Returns whether the
    /// frame was queued; otherwise it is dropped.
    pub fn send<P: Serialize>(&self, payload: &P) -> bool {
        match serde_json::to_string(payload) {
            Ok(text) => self.shared.queue_frame(None, text),
            Err(error) => {
                warn!(error = %error, "outbound payload could not be serialized");
                false
            }
        }
    }

    /// Closes the connection and suppresses any reconnect until the next
    /// `connect`.
    pub fn disconnect(&self) {
        let mut lifecycle = self.shared.lock();
        lifecycle.intentional_close = true;
        lifecycle.generation += 1;
        lifecycle.attempts = 0;
        lifecycle.session = None;
        lifecycle.stop_heartbeat();
        lifecycle.cancel_reconnect();

        let was_connected = lifecycle.state == ConnectionState::Connected;
        let outbound = lifecycle.outbound.take();
        let link = lifecycle.link.take();
        if was_connected {
            // The link task sends the close frame and exits on its own.
            if let Some(outbound) = outbound {
                let _ = outbound.send(Outbound::Close);
            }
        } else if let Some(link) = link {
            link.abort();
        }
        lifecycle.state = ConnectionState::Disconnected;
        drop(lifecycle);

        info!("push connection closed by client");
        if was_connected {
            self.shared
                .emit(InboundEvent::Lifecycle(LifecycleEvent::Closed {
                    will_retry: false,
                }));
        }
    }

    pub fn on(&self, name: EventName, handler: Handler) {
        self.shared.bus.on(name, handler);
    }

    pub fn off(&self, name: EventName, handler: &Handler) {
        self.shared.bus.off(name, handler);
    }

    pub fn event_bus(&self) -> &Arc<dyn EventBus> {
        &self.shared.bus
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn timers(&self) -> ActiveTimers {
        let lifecycle = self.shared.lock();
        let live = |timer: &Option<JoinHandle<()>>| {
            timer.as_ref().is_some_and(|t| !t.is_finished())
        };
        ActiveTimers {
            heartbeat: live(&lifecycle.heartbeat),
            reconnect: live(&lifecycle.reconnect),
        }
    }
}

impl<C: Connector> Shared<C> {
    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: InboundEvent) {
        if let Some(payload) = event.into_payload() {
            self.bus.emit(&Event::new(EventSource::Realtime, payload));
        }
    }

    /// Spawns a link task for the stored session. Returns a lifecycle event
    /// for the caller to emit once the lock is released.
    fn begin_attempt(self: &Arc<Self>, lifecycle: &mut Lifecycle) -> Option<LifecycleEvent> {
        let session = lifecycle.session.clone()?;

        let Some(token) = session.credentials.token() else {
            let error = ConnectionError::MissingCredentials;
            warn!(user_id = %session.user_id, error = %error, "staying disconnected");
            return Self::give_up(lifecycle);
        };
        let url = match build_endpoint(&self.config.endpoint, session.user_id, &token) {
            Ok(url) => url,
            Err(error) => {
                error!(error = %error, "cannot build push endpoint");
                return Self::give_up(lifecycle);
            }
        };

        lifecycle.generation += 1;
        let generation = lifecycle.generation;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        lifecycle.outbound = Some(outbound_tx);
        lifecycle.state = ConnectionState::Connecting;

        let shared = Arc::clone(self);
        let me = session.user_id;
        lifecycle.link = Some(tokio::spawn(async move {
            shared.run_link(generation, me, url, outbound_rx).await;
        }));
        debug!(user_id = %session.user_id, generation, "push connection attempt started");
        None
    }

    fn give_up(lifecycle: &mut Lifecycle) -> Option<LifecycleEvent> {
        let was_active = lifecycle.state != ConnectionState::Disconnected;
        lifecycle.state = ConnectionState::Disconnected;
        lifecycle.outbound = None;
        lifecycle.attempts = 0;
        lifecycle.stop_heartbeat();
        lifecycle.cancel_reconnect();
        was_active.then_some(LifecycleEvent::Closed { will_retry: false })
    }

    async fn run_link(
        self: Arc<Self>,
        generation: u64,
        me: UserId,
        url: Url,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
    ) {
        let mut transport = match self.connector.connect(&url).await {
            Ok(transport) => transport,
            Err(error) => {
                warn!(error = %error, "push connection could not be established");
                self.on_closed(generation, error, false);
                return;
            }
        };

        if !self.on_opened(generation) {
            let _ = transport.close().await;
            return;
        }

        match self.pump(me, &mut transport, &mut outbound).await {
            LinkEnd::Dropped(error) => self.on_closed(generation, error, true),
            LinkEnd::Released => trace!(generation, "link released"),
        }
    }

    async fn pump(
        &self,
        me: UserId,
        transport: &mut C::Transport,
        outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    ) -> LinkEnd {
        loop {
            tokio::select! {
                inbound = transport.recv() => match inbound {
                    Ok(Some(text)) => self.handle_frame(me, &text),
                    Ok(None) => return LinkEnd::Dropped(ConnectionError::Closed),
                    Err(error) => return LinkEnd::Dropped(error),
                },
                command = outbound.recv() => match command {
                    Some(Outbound::Frame(text)) => {
                        if let Err(error) = transport.send(text).await {
                            return LinkEnd::Dropped(error);
                        }
                    }
                    Some(Outbound::Close) | None => {
                        if let Err(error) = transport.close().await {
                            debug!(error = %error, "close handshake failed");
                        }
                        return LinkEnd::Released;
                    }
                },
            }
        }
    }

    fn handle_frame(&self, me: UserId, text: &str) {
        match decode_frame(text, me) {
            Ok(InboundEvent::HeartbeatAck) => trace!("heartbeat acknowledged"),
            Ok(InboundEvent::Ignored { tag }) => debug!(tag = %tag, "ignoring frame"),
            Ok(event) => self.emit(event),
            Err(error) => warn!(error = %error, "dropping undecodable frame"),
        }
    }

    fn on_opened(self: &Arc<Self>, generation: u64) -> bool {
        let mut lifecycle = self.lock();
        if lifecycle.generation != generation || lifecycle.state != ConnectionState::Connecting {
            return false;
        }
        lifecycle.state = ConnectionState::Connected;
        lifecycle.attempts = 0;
        lifecycle.stop_heartbeat();
        lifecycle.heartbeat = Some(self.spawn_heartbeat(generation));
        drop(lifecycle);

        info!("push connection established");
        self.emit(InboundEvent::Lifecycle(LifecycleEvent::Opened));
        true
    }

    fn on_closed(self: &Arc<Self>, generation: u64, error: ConnectionError, was_open: bool) {
        let mut lifecycle = self.lock();
        if lifecycle.generation != generation {
            trace!(generation, "ignoring close from superseded connection");
            return;
        }
        lifecycle.stop_heartbeat();
        lifecycle.outbound = None;
        lifecycle.link = None;

        if lifecycle.intentional_close {
            lifecycle.state = ConnectionState::Disconnected;
            return;
        }

        let attempt = lifecycle.attempts.saturating_add(1);
        let event = if error.is_retryable() && self.config.should_retry(attempt) {
            let delay = self.config.next_reconnect_delay();
            lifecycle.attempts = attempt;
            lifecycle.state = ConnectionState::Reconnecting { attempt };
            lifecycle.cancel_reconnect();
            lifecycle.reconnect = Some(self.spawn_reconnect(generation, delay));
            info!(
                attempt,
                delay_ms = whole_millis(delay),
                reason = %error,
                "push connection lost; reconnect scheduled"
            );
            was_open.then_some(LifecycleEvent::Closed { will_retry: true })
        } else {
            warn!(attempt, reason = %error, "push connection lost; giving up");
            lifecycle.state = ConnectionState::Reconnecting { attempt };
            Self::give_up(&mut lifecycle)
        };
        drop(lifecycle);

        if let Some(event) = event {
            self.emit(InboundEvent::Lifecycle(event));
        }
    }

    fn spawn_heartbeat(self: &Arc<Self>, generation: u64) -> JoinHandle<()> {
        let shared = Arc::clone(self);
        let period = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Ok(frame) = OutboundFrame::Heartbeat.encode() else {
                    break;
                };
                if !shared.queue_frame(Some(generation), frame) {
                    break;
                }
            }
        })
    }

    fn spawn_reconnect(self: &Arc<Self>, generation: u64, delay: Duration) -> JoinHandle<()> {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            sleep(delay).await;
            shared.fire_reconnect(generation);
        })
    }

    fn fire_reconnect(self: &Arc<Self>, generation: u64) {
        let mut lifecycle = self.lock();
        if lifecycle.generation != generation
            || lifecycle.intentional_close
            || !matches!(lifecycle.state, ConnectionState::Reconnecting { .. })
        {
            return;
        }
        // This task is the timer; release the handle rather than abort ourselves.
        lifecycle.reconnect = None;
        debug!(attempt = lifecycle.attempts, "reconnecting push connection");
        let event = self.begin_attempt(&mut lifecycle);
        drop(lifecycle);

        if let Some(event) = event {
            self.emit(InboundEvent::Lifecycle(event));
        }
    }

    /// Queues a frame on the live link. `generation` pins the frame to one
    /// connection; `None` accepts whichever connection is current.
    fn queue_frame(&self, generation: Option<u64>, text: String) -> bool {
        let lifecycle = self.lock();
        if lifecycle.state != ConnectionState::Connected
            || generation.is_some_and(|g| g != lifecycle.generation)
        {
            trace!("not connected; dropping outbound frame");
            return false;
        }
        lifecycle
            .outbound
            .as_ref()
            .is_some_and(|outbound| outbound.send(Outbound::Frame(text)).is_ok())
    }
}

fn whole_millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

pub(crate) fn build_endpoint(
    base: &str,
    user_id: UserId,
    token: &str,
) -> Result<Url, ConnectionError> {
    let mut url = Url::parse(base).map_err(|e| ConnectionError::InvalidEndpoint(e.to_string()))?;
    url.query_pairs_mut()
        .append_pair("userId", &user_id.to_string())
        .append_pair("token", token);
    Ok(url)
}
