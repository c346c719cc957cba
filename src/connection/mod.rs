//! Broker connection lifecycle.
//!
//! A [`Connection`] owns the NATS client and its JetStream context. It is
//! created from validated [`ConnectOptions`], connected once, and shared by
//! the reconciler, publisher and delivery pump. Transport events are fanned
//! out to registered hooks; [`Connection::close`] drains every subscription
//! before dropping the transport.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream;
use async_nats::Event;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, NatsBroker};
use crate::delivery::Subscription;
use crate::error::{BusError, Result};

/// Default number of reconnect attempts before giving up.
pub const DEFAULT_MAX_RECONNECT: usize = 60;

/// Default wait between reconnect attempts.
pub const DEFAULT_RECONNECT_WAIT: Duration = Duration::from_secs(2);

/// Connection parameters.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub url: String,
    pub user: String,
    pub password: String,
    pub max_reconnect: usize,
    pub reconnect_wait: Duration,
    /// Single-node development deployment: one replica, short ack waits.
    pub is_local: bool,
    /// Client name reported to the server; also labels connection metrics.
    pub name: String,
}

impl ConnectOptions {
    pub fn new(
        url: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            user: user.into(),
            password: password.into(),
            max_reconnect: DEFAULT_MAX_RECONNECT,
            reconnect_wait: DEFAULT_RECONNECT_WAIT,
            is_local: false,
            name: String::new(),
        }
    }

    pub fn with_local(mut self, is_local: bool) -> Self {
        self.is_local = is_local;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_reconnect(mut self, max_reconnect: usize, reconnect_wait: Duration) -> Self {
        self.max_reconnect = max_reconnect;
        self.reconnect_wait = reconnect_wait;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(BusError::Config("broker url is required".to_string()));
        }
        if self.user.is_empty() {
            return Err(BusError::Config("broker user is required".to_string()));
        }
        if self.password.is_empty() {
            return Err(BusError::Config("broker password is required".to_string()));
        }
        Ok(())
    }
}

/// Callback run on a transport event.
pub type ConnectionHook = Arc<dyn Fn() + Send + Sync>;

/// Transport events forwarded to hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Disconnected,
    Reconnected,
}

#[derive(Default)]
struct Hooks {
    disconnect: Vec<ConnectionHook>,
    reconnect: Vec<ConnectionHook>,
}

impl Hooks {
    fn run(&self, event: ConnectionEvent) {
        let hooks = match event {
            ConnectionEvent::Disconnected => &self.disconnect,
            ConnectionEvent::Reconnected => &self.reconnect,
        };
        for hook in hooks {
            hook();
        }
    }
}

#[derive(Clone)]
struct NatsSession {
    client: async_nats::Client,
    context: jetstream::Context,
}

struct Connected {
    broker: Arc<dyn Broker>,
    session: Option<NatsSession>,
}

/// Shared broker connection.
pub struct Connection {
    options: ConnectOptions,
    state: RwLock<Option<Connected>>,
    hooks: Arc<RwLock<Hooks>>,
    subscriptions: RwLock<Vec<Subscription>>,
}

impl Connection {
    /// Validate `options` without connecting.
    pub fn new(options: ConnectOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            state: RwLock::new(None),
            hooks: Arc::new(RwLock::new(Hooks::default())),
            subscriptions: RwLock::new(Vec::new()),
        })
    }

    /// Connection that is already established over `broker`.
    pub fn with_broker(options: ConnectOptions, broker: Arc<dyn Broker>) -> Result<Self> {
        let mut connection = Self::new(options)?;
        connection.state = RwLock::new(Some(Connected {
            broker,
            session: None,
        }));
        Ok(connection)
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    pub fn is_local(&self) -> bool {
        self.options.is_local
    }

    /// Establish the NATS connection and JetStream context.
    ///
    /// Calling it on a connected instance is a no-op.
    pub async fn connect(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.is_some() {
            return Ok(());
        }

        let hooks = Arc::clone(&self.hooks);
        let reconnect_wait = self.options.reconnect_wait;
        let mut nats_options = async_nats::ConnectOptions::with_user_and_password(
            self.options.user.clone(),
            self.options.password.clone(),
        )
        .max_reconnects(Some(self.options.max_reconnect))
        .reconnect_delay_callback(move |_attempts| reconnect_wait)
        .event_callback(move |event| {
            let hooks = Arc::clone(&hooks);
            async move {
                match event {
                    Event::Disconnected => {
                        warn!("NATS connection lost");
                        hooks.read().await.run(ConnectionEvent::Disconnected);
                    }
                    Event::Connected => {
                        info!("NATS connection established");
                        hooks.read().await.run(ConnectionEvent::Reconnected);
                    }
                    other => debug!(event = ?other, "NATS connection event"),
                }
            }
        });
        if !self.options.name.is_empty() {
            nats_options = nats_options.name(&self.options.name);
        }

        let client = nats_options
            .connect(self.options.url.as_str())
            .await
            .map_err(|e| BusError::Connection(format!("{}: {}", self.options.url, e)))?;
        let context = jetstream::new(client.clone());

        info!(url = %self.options.url, name = %self.options.name, "Connected to NATS JetStream");

        *state = Some(Connected {
            broker: Arc::new(NatsBroker::from_context(context.clone())),
            session: Some(NatsSession { client, context }),
        });
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.state.read().await.is_some()
    }

    /// Broker operations of the live connection.
    pub async fn broker(&self) -> Result<Arc<dyn Broker>> {
        self.state
            .read()
            .await
            .as_ref()
            .map(|connected| Arc::clone(&connected.broker))
            .ok_or(BusError::NotConnected)
    }

    /// Raw JetStream context, for operations the bus does not wrap.
    pub async fn jetstream_context(&self) -> Result<jetstream::Context> {
        self.state
            .read()
            .await
            .as_ref()
            .and_then(|connected| connected.session.as_ref())
            .map(|session| session.context.clone())
            .ok_or(BusError::NotConnected)
    }

    /// Underlying NATS client.
    pub async fn client(&self) -> Result<async_nats::Client> {
        self.state
            .read()
            .await
            .as_ref()
            .and_then(|connected| connected.session.as_ref())
            .map(|session| session.client.clone())
            .ok_or(BusError::NotConnected)
    }

    /// Register a hook run on every disconnect, after previously registered ones.
    pub async fn on_disconnect<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.hooks.write().await.disconnect.push(Arc::new(hook));
    }

    /// Register a hook run on every reconnect, after previously registered ones.
    pub async fn on_reconnect<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.hooks.write().await.reconnect.push(Arc::new(hook));
    }

    /// Run the hooks registered for `event`.
    pub async fn notify(&self, event: ConnectionEvent) {
        self.hooks.read().await.run(event);
    }

    pub(crate) async fn track(&self, subscription: Subscription) {
        self.subscriptions.write().await.push(subscription);
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    /// Drain every tracked subscription, then drain and close the transport.
    ///
    /// Every clone of the client shares the transport, so publishers built
    /// from this connection fail afterwards.
    ///
    /// Failures are logged; closing always runs to completion.
    pub async fn close(&self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.write().await);
        for subscription in subscriptions {
            info!(consumer = %subscription.consumer(), "Draining subscription");
            if let Err(e) = subscription.drain().await {
                error!(
                    consumer = %subscription.consumer(),
                    error = %e,
                    "Failed to drain subscription"
                );
            }
        }

        let connected = self.state.write().await.take();
        if let Some(session) = connected.and_then(|c| c.session) {
            if let Err(e) = session.client.drain().await {
                error!(error = %e, "Failed to drain NATS connection");
            }
        }
        info!("Connection closed");
    }
}
