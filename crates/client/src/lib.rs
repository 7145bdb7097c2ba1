//! Session wiring for the Campus Exchange messaging client.
//!
//! A [`Session`] is built once per login. It owns the push connection, the
//! conversation synchronizer and the notification dispatcher, subscribes them
//! to one event bus, and tears everything down again on [`Session::shutdown`].

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use exchange_core::config::Config;
use exchange_core::event::{EventBus, EventName, Handler, handler};
use exchange_core::session::{CredentialStore, SessionIdentity, UserId};
use exchange_messaging::{ChatThread, ConversationSynchronizer, MessageApi, MessagingError};
use exchange_notifications::NotificationDispatcher;
use exchange_realtime::{ConnectionClient, Connector};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[cfg(feature = "native")]
use exchange_core::event::SyncEventBus;
#[cfg(feature = "native")]
use exchange_messaging::{ApiError, HttpMessageApi};
#[cfg(feature = "native")]
use exchange_notifications::Navigator;
#[cfg(feature = "native")]
use exchange_realtime::{ClientConfig, WebSocketConnector};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("no signed-in user")]
    NotSignedIn,

    #[cfg(feature = "native")]
    #[error("message API setup failed: {0}")]
    Api(#[from] ApiError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),
}

#[cfg(feature = "native")]
pub type NativeSession = Session<WebSocketConnector, HttpMessageApi>;

struct OpenThread<A: MessageApi> {
    thread: Arc<ChatThread<A>>,
    handler: Handler,
}

pub struct Session<C: Connector, A: MessageApi> {
    resync_period: Duration,
    bus: Arc<dyn EventBus>,
    connection: ConnectionClient<C>,
    api: Arc<A>,
    dispatcher: Arc<NotificationDispatcher>,
    credentials: Arc<dyn CredentialStore>,
    identity: Option<SessionIdentity>,
    synchronizer: Option<Arc<ConversationSynchronizer<A>>>,
    subscriptions: Vec<(EventName, Handler)>,
    thread: Option<OpenThread<A>>,
    resync: Option<JoinHandle<()>>,
}

#[cfg(feature = "native")]
impl NativeSession {
    /// Builds a session on the WebSocket transport and the HTTP message API.
    pub fn native(
        config: &Config,
        credentials: Arc<dyn CredentialStore>,
        navigator: Arc<dyn Navigator>,
    ) -> Result<Self, ClientError> {
        let bus: Arc<dyn EventBus> = Arc::new(SyncEventBus::new());
        let connection = ConnectionClient::new(ClientConfig::from_config(config), Arc::clone(&bus));
        let api = Arc::new(HttpMessageApi::from_config(config, Arc::clone(&credentials))?);
        let dispatcher = Arc::new(NotificationDispatcher::new(&config.ui, navigator));
        Ok(Self::with_parts(
            config,
            bus,
            connection,
            api,
            dispatcher,
            credentials,
        ))
    }
}

impl<C: Connector, A: MessageApi> Session<C, A> {
    pub fn with_parts(
        config: &Config,
        bus: Arc<dyn EventBus>,
        connection: ConnectionClient<C>,
        api: Arc<A>,
        dispatcher: Arc<NotificationDispatcher>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            resync_period: Duration::from_secs(config.sync.unread_refresh_seconds),
            bus,
            connection,
            api,
            dispatcher,
            credentials,
            identity: None,
            synchronizer: None,
            subscriptions: Vec::new(),
            thread: None,
            resync: None,
        }
    }

    /// Resolves the signed-in user and brings the session up. Returns `None`
    /// and stays inert when the credential store yields no identity.
    pub async fn start(&mut self) -> Option<SessionIdentity> {
        if let Some(identity) = self.identity {
            debug!(user = %identity.user_id, "session already started");
            return Some(identity);
        }

        let Some(identity) = SessionIdentity::resolve(self.credentials.as_ref()) else {
            info!("no stored credentials; messaging stays offline");
            return None;
        };
        let user = identity.user_id;

        let synchronizer = Arc::new(ConversationSynchronizer::new(Arc::clone(&self.api), user));
        if let Err(error) = synchronizer.refresh().await {
            warn!(error = %error, "initial conversation refresh failed");
        }

        self.subscribe(EventName::Message, synchronizer.handler());
        self.subscribe(EventName::Message, self.dispatcher.handler());
        self.subscribe(EventName::Connect, refresh_on_reconnect(&synchronizer));

        self.connection.connect(user, Arc::clone(&self.credentials));

        let resync = tokio::spawn(Arc::clone(&synchronizer).run_periodic_resync(self.resync_period));
        self.resync = Some(resync);
        self.synchronizer = Some(synchronizer);
        self.identity = Some(identity);

        info!(user = %user, "messaging session started");
        Some(identity)
    }

    fn subscribe(&mut self, name: EventName, handler: Handler) {
        self.bus.on(name, Arc::clone(&handler));
        self.subscriptions.push((name, handler));
    }

    /// Opens the chat thread with `partner`, replacing any thread already open.
    pub async fn open_thread(&mut self, partner: UserId) -> Result<Arc<ChatThread<A>>, ClientError> {
        let synchronizer = self.synchronizer.clone().ok_or(ClientError::NotSignedIn)?;
        self.close_thread();

        let thread = Arc::new(ChatThread::open(synchronizer, partner).await?);
        let handler = thread.handler();
        self.bus.on(EventName::Message, Arc::clone(&handler));
        self.thread = Some(OpenThread {
            thread: Arc::clone(&thread),
            handler,
        });
        Ok(thread)
    }

    pub fn close_thread(&mut self) {
        if let Some(open) = self.thread.take() {
            self.bus.off(EventName::Message, &open.handler);
            open.thread.close();
        }
    }

    pub fn current_thread(&self) -> Option<Arc<ChatThread<A>>> {
        self.thread.as_ref().map(|open| Arc::clone(&open.thread))
    }

    /// Logout: closes the connection, unsubscribes every handler and stops
    /// the periodic re-sync. The session can be started again afterwards.
    pub fn shutdown(&mut self) {
        self.close_thread();
        self.connection.disconnect();
        for (name, handler) in self.subscriptions.drain(..) {
            self.bus.off(name, &handler);
        }
        if let Some(resync) = self.resync.take() {
            resync.abort();
        }
        self.synchronizer = None;
        if let Some(identity) = self.identity.take() {
            info!(user = %identity.user_id, "messaging session closed");
        }
    }

    pub fn identity(&self) -> Option<SessionIdentity> {
        self.identity
    }

    pub fn synchronizer(&self) -> Option<&Arc<ConversationSynchronizer<A>>> {
        self.synchronizer.as_ref()
    }

    pub fn connection(&self) -> &ConnectionClient<C> {
        &self.connection
    }

    pub fn event_bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    pub fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
        &self.dispatcher
    }

    pub fn api(&self) -> &Arc<A> {
        &self.api
    }

    pub fn is_resyncing(&self) -> bool {
        self.resync.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl<C: Connector, A: MessageApi> Drop for Session<C, A> {
    fn drop(&mut self) {
        if let Some(resync) = self.resync.take() {
            resync.abort();
        }
    }
}

/// Pushes may have been missed while the link was down, so every `connect`
/// after the first triggers an authoritative refresh.
fn refresh_on_reconnect<A: MessageApi>(
    synchronizer: &Arc<ConversationSynchronizer<A>>,
) -> Handler {
    let synchronizer = Arc::clone(synchronizer);
    let seen_first = AtomicBool::new(false);
    handler(move |_event| {
        if !seen_first.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return Ok(());
        };
        let synchronizer = Arc::clone(&synchronizer);
        runtime.spawn(async move {
            if let Err(error) = synchronizer.refresh().await {
                warn!(error = %error, "refresh after reconnect failed");
            }
        });
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use exchange_core::config::UiConfig;
    use exchange_core::event::SyncEventBus;
    use exchange_core::session::MemoryCredentialStore;
    use exchange_messaging::testing::{FakeMessageApi, conversation};
    use exchange_notifications::{Alert, AlertSink, NotificationError, SilentCue};
    use exchange_realtime::{ClientConfig, ConnectionState};
    use exchange_realtime::testing::ScriptedConnector;

    const ME: UserId = UserId(42);
    // {"alg":"HS256"}.{"userId":42}.sig
    const TOKEN: &str = "eyJhbGciOiJIUzI1NiJ9.eyJ1c2VySWQiOjQyfQ.sig";

    struct NoAlerts;

    impl AlertSink for NoAlerts {
        fn show(&self, _alert: &Alert) -> Result<(), NotificationError> {
            Ok(())
        }
    }

    struct NoNavigation;

    impl exchange_notifications::Navigator for NoNavigation {
        fn open_chat(&self, _partner: UserId) {}
    }

    struct Fixture {
        session: Session<ScriptedConnector, FakeMessageApi>,
        connector: ScriptedConnector,
        api: Arc<FakeMessageApi>,
        bus: Arc<dyn EventBus>,
    }

    fn fixture(token: Option<&str>) -> Fixture {
        let config = Config::default();
        let bus: Arc<dyn EventBus> = Arc::new(SyncEventBus::new());
        let connector = ScriptedConnector::new();
        let connection = ConnectionClient::with_connector(
            connector.clone(),
            ClientConfig::from_config(&config),
            Arc::clone(&bus),
        );
        let api = Arc::new(FakeMessageApi::with_identity(ME));
        api.set_unread(2);
        api.set_conversations(vec![conversation(7, 2)]);
        let dispatcher = Arc::new(NotificationDispatcher::with_backends(
            &UiConfig::default(),
            Arc::new(NoAlerts),
            Arc::new(SilentCue),
            Arc::new(NoNavigation),
        ));
        let credentials = Arc::new(MemoryCredentialStore::new(token.map(str::to_string)));
        let session = Session::with_parts(
            &config,
            Arc::clone(&bus),
            connection,
            Arc::clone(&api),
            dispatcher,
            credentials,
        );
        Fixture {
            session,
            connector,
            api,
            bus,
        }
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn missing_credentials_leave_session_inert() {
        let mut f = fixture(None);

        assert!(f.session.start().await.is_none());
        settle().await;

        assert_eq!(f.connector.attempt_count(), 0);
        assert_eq!(f.bus.handler_count(EventName::Message), 0);
        assert!(!f.session.is_resyncing());
        assert_matches::assert_matches!(
            f.session.open_thread(UserId(7)).await.err(),
            Some(ClientError::NotSignedIn)
        );
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn start_refreshes_subscribes_and_connects() {
        let mut f = fixture(Some(TOKEN));

        let identity = f.session.start().await;
        settle().await;

        assert_eq!(identity.map(|i| i.user_id), Some(ME));
        assert_eq!(f.session.synchronizer().map(|s| s.unread_count()), Some(2));
        assert_eq!(f.bus.handler_count(EventName::Message), 2);
        assert_eq!(f.bus.handler_count(EventName::Connect), 1);
        assert_eq!(f.connector.attempt_count(), 1);
        assert_eq!(f.session.connection().state(), ConnectionState::Connected);
        assert!(f.session.is_resyncing());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn shutdown_unsubscribes_and_stops_everything() {
        let mut f = fixture(Some(TOKEN));
        f.session.start().await;
        settle().await;
        f.session.open_thread(UserId(7)).await.unwrap();

        f.session.shutdown();
        settle().await;

        for name in EventName::ALL {
            assert_eq!(f.bus.handler_count(name), 0, "{name} handlers remain");
        }
        assert_eq!(f.session.connection().state(), ConnectionState::Disconnected);
        assert_eq!(f.session.connection().timers().count(), 0);
        assert!(!f.session.is_resyncing());
        assert!(f.session.identity().is_none());
        assert_eq!(f.api.mark_read_calls(), vec![UserId(7)]);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn reopening_a_thread_replaces_the_previous_one() {
        let mut f = fixture(Some(TOKEN));
        f.session.start().await;
        settle().await;

        f.session.open_thread(UserId(7)).await.unwrap();
        f.session.open_thread(UserId(8)).await.unwrap();

        assert_eq!(f.bus.handler_count(EventName::Message), 3);
        assert_eq!(
            f.session.current_thread().map(|t| t.partner()),
            Some(UserId(8))
        );
        assert_eq!(
            f.session.synchronizer().and_then(|s| s.active_thread()),
            Some(UserId(8))
        );
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn periodic_resync_replaces_unread_total() {
        let mut f = fixture(Some(TOKEN));
        f.session.start().await;
        settle().await;

        f.api.set_unread(9);
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;

        assert_eq!(f.session.synchronizer().map(|s| s.unread_count()), Some(9));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn start_twice_keeps_a_single_set_of_subscriptions() {
        let mut f = fixture(Some(TOKEN));
        f.session.start().await;
        f.session.start().await;
        settle().await;

        assert_eq!(f.bus.handler_count(EventName::Message), 2);
        assert_eq!(f.connector.attempt_count(), 1);
    }
}
