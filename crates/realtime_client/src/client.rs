use std::sync::Arc;

use futures::{stream::FuturesOrdered, StreamExt};
use serde_json::{Map, Value};
use shared::{
    domain::{ChannelTarget, ThreadId, UserId},
    protocol::PusherFrame,
};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    auth::{AuthorizationClient, TokenProvider},
    config::RealtimeSettings,
    dispatch::{ConnectionEvent, ThreadCallbacks, ThreadEventStream},
    error::{AuthorizationError, ConfigError},
    registry::{JoinRequest, JoinState, SubscriptionRegistry},
    state::ConnectionState,
    transport::{BrokerTransport, TungsteniteTransport},
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Started,
    AlreadyConnected,
    /// The token provider had no token; no transport was opened.
    NoCredential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// Connected: the authorization handshake is under way.
    Joining,
    /// Not connected yet: held until the next successful handshake.
    Queued,
    AlreadySubscribed,
}

pub(crate) enum Outbound {
    /// Only written if the live socket still carries `socket_id`.
    Frame {
        socket_id: String,
        frame: PusherFrame,
    },
    Close,
}

pub(crate) struct ActiveConnection {
    pub(crate) epoch: u64,
    pub(crate) socket_id: Option<String>,
    pub(crate) outbound: mpsc::UnboundedSender<Outbound>,
}

pub(crate) struct ClientState {
    pub(crate) connection_state: ConnectionState,
    pub(crate) user_id: Option<UserId>,
    pub(crate) connection: Option<ActiveConnection>,
    pub(crate) registry: SubscriptionRegistry,
    next_epoch: u64,
}

impl ClientState {
    fn new() -> Self {
        Self {
            connection_state: ConnectionState::Disconnected,
            user_id: None,
            connection: None,
            registry: SubscriptionRegistry::new(),
            next_epoch: 0,
        }
    }

    pub(crate) fn current_mut(&mut self, epoch: u64) -> Option<&mut ActiveConnection> {
        self.connection
            .as_mut()
            .filter(|connection| connection.epoch == epoch)
    }

    pub(crate) fn is_current(&self, epoch: u64) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|connection| connection.epoch == epoch)
    }

    /// Epoch and socket id of a connection that completed its handshake.
    pub(crate) fn live_socket(&self) -> Option<(u64, String)> {
        if self.connection_state != ConnectionState::Connected {
            return None;
        }
        let connection = self.connection.as_ref()?;
        Some((connection.epoch, connection.socket_id.clone()?))
    }

    pub(crate) fn send_frame(&self, socket_id: &str, frame: PusherFrame) {
        if let Some(connection) = &self.connection {
            let _ = connection.outbound.send(Outbound::Frame {
                socket_id: socket_id.to_string(),
                frame,
            });
        }
    }
}

/// Session-scoped realtime client: one broker connection, the private user
/// channel, and any number of thread channels.
pub struct RealtimeClient {
    pub(crate) settings: RealtimeSettings,
    pub(crate) socket_url: Url,
    auth: AuthorizationClient,
    pub(crate) token_provider: Arc<dyn TokenProvider>,
    pub(crate) transport: Arc<dyn BrokerTransport>,
    pub(crate) inner: Mutex<ClientState>,
    pub(crate) events: broadcast::Sender<ConnectionEvent>,
}

impl RealtimeClient {
    pub fn new(
        settings: RealtimeSettings,
        token_provider: Arc<dyn TokenProvider>,
    ) -> Result<Arc<Self>, ConfigError> {
        Self::new_with_transport(settings, token_provider, Arc::new(TungsteniteTransport))
    }

    pub fn new_with_transport(
        settings: RealtimeSettings,
        token_provider: Arc<dyn TokenProvider>,
        transport: Arc<dyn BrokerTransport>,
    ) -> Result<Arc<Self>, ConfigError> {
        let socket_url = settings.socket_url()?;
        let auth = AuthorizationClient::new(settings.auth_url()?, settings.auth_timeout());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Arc::new(Self {
            settings,
            socket_url,
            auth,
            token_provider,
            transport,
            inner: Mutex::new(ClientState::new()),
            events,
        }))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Starts the session connection. Does not wait for the broker handshake;
    /// watch [`ConnectionEvent::Connected`] or poll [`Self::is_connected`].
    pub async fn connect(self: &Arc<Self>, user_id: impl Into<UserId>) -> ConnectOutcome {
        let user_id = user_id.into();
        let mut state = self.inner.lock().await;
        if state.connection.is_some() {
            info!(%user_id, "realtime: connection already active, ignoring connect");
            return ConnectOutcome::AlreadyConnected;
        }
        if self.token_provider.auth_token().is_none() {
            warn!(%user_id, "realtime: no auth token available, not connecting");
            return ConnectOutcome::NoCredential;
        }

        state.next_epoch += 1;
        let epoch = state.next_epoch;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        state.connection = Some(ActiveConnection {
            epoch,
            socket_id: None,
            outbound,
        });
        state.user_id = Some(user_id.clone());
        self.transition(&mut state, ConnectionState::Connecting);
        drop(state);

        info!(%user_id, url = %self.socket_url, epoch, "realtime: connecting");
        let client = Arc::clone(self);
        tokio::spawn(async move {
            client.run_connection(epoch, outbound_rx).await;
        });
        ConnectOutcome::Started
    }

    /// Closes the socket and forgets every subscription and the user. Safe to
    /// call at any time.
    pub async fn disconnect(&self) {
        let mut state = self.inner.lock().await;
        let connection = state.connection.take();
        state.registry.clear();
        let user_id = state.user_id.take();
        self.transition(&mut state, ConnectionState::Disconnected);
        drop(state);

        if let Some(connection) = connection {
            let _ = connection.outbound.send(Outbound::Close);
            info!(user_id = ?user_id, epoch = connection.epoch, "realtime: disconnected");
            let _ = self.events.send(ConnectionEvent::Disconnected);
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.connection_state == ConnectionState::Connected
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.lock().await.connection_state
    }

    pub async fn socket_id(&self) -> Option<String> {
        self.inner
            .lock()
            .await
            .live_socket()
            .map(|(_, socket_id)| socket_id)
    }

    pub async fn subscribe_to_thread(
        self: &Arc<Self>,
        thread_id: impl Into<ThreadId>,
        callbacks: ThreadCallbacks,
    ) -> SubscribeOutcome {
        let thread_id = thread_id.into();
        let mut state = self.inner.lock().await;
        let Some((epoch, socket_id)) = state.live_socket() else {
            return if state.registry.queue(thread_id.clone(), callbacks) {
                debug!(%thread_id, "realtime: not connected, subscription queued");
                SubscribeOutcome::Queued
            } else {
                SubscribeOutcome::AlreadySubscribed
            };
        };

        let request = match state.registry.thread_channel(&thread_id).map(|sub| sub.state) {
            Some(JoinState::Failed) => state.registry.retry_failed(&thread_id, callbacks),
            Some(_) => None,
            None => state
                .registry
                .activate(ChannelTarget::Thread(thread_id.clone()), callbacks),
        };
        drop(state);

        match request {
            Some(request) => {
                self.spawn_joins(epoch, socket_id, vec![request]);
                SubscribeOutcome::Joining
            }
            None => {
                debug!(%thread_id, "realtime: thread already subscribed");
                SubscribeOutcome::AlreadySubscribed
            }
        }
    }

    /// Like [`Self::subscribe_to_thread`] but delivers every event kind on a
    /// stream. If the thread was already subscribed the stream ends at once.
    pub async fn subscribe_thread_stream(
        self: &Arc<Self>,
        thread_id: impl Into<ThreadId>,
    ) -> (SubscribeOutcome, ThreadEventStream) {
        let (callbacks, stream) = ThreadCallbacks::channel();
        let outcome = self.subscribe_to_thread(thread_id, callbacks).await;
        (outcome, stream)
    }

    /// Returns whether the thread was known (pending or active).
    pub async fn unsubscribe_from_thread(&self, thread_id: impl Into<ThreadId>) -> bool {
        let thread_id = thread_id.into();
        let mut state = self.inner.lock().await;
        let removal = state.registry.remove_thread(&thread_id);
        if let Some((channel, subscription)) = &removal.channel {
            if subscription.subscribe_sent() {
                if let Some((_, socket_id)) = state.live_socket() {
                    state.send_frame(&socket_id, PusherFrame::unsubscribe(channel));
                }
            }
            debug!(%thread_id, channel = %channel, "realtime: left thread channel");
        } else if removal.cancelled_pending {
            debug!(%thread_id, "realtime: cancelled queued subscription");
        }
        removal.removed_anything()
    }

    pub async fn pending_threads(&self) -> Vec<ThreadId> {
        self.inner.lock().await.registry.pending_threads()
    }

    pub async fn active_channels(&self) -> Vec<String> {
        self.inner.lock().await.registry.active_channels()
    }

    pub async fn thread_join_state(&self, thread_id: &ThreadId) -> Option<JoinState> {
        self.inner
            .lock()
            .await
            .registry
            .thread_channel(thread_id)
            .map(|subscription| subscription.state)
    }

    pub(crate) fn transition(&self, state: &mut ClientState, next: ConnectionState) -> bool {
        let previous = state.connection_state;
        if previous == next {
            return false;
        }
        if !previous.can_transition_to(next) {
            warn!(%previous, %next, "realtime: rejected invalid connection state transition");
            return false;
        }
        state.connection_state = next;
        debug!(%previous, %next, "realtime: connection state changed");
        let _ = self.events.send(ConnectionEvent::StateChange {
            previous,
            current: next,
        });
        true
    }

    pub(crate) fn spawn_joins(
        self: &Arc<Self>,
        epoch: u64,
        socket_id: String,
        requests: Vec<JoinRequest>,
    ) {
        if requests.is_empty() {
            return;
        }
        let client = Arc::clone(self);
        tokio::spawn(async move {
            client.join_channels(epoch, socket_id, requests).await;
        });
    }

    /// Authorizes the batch concurrently and sends each subscribe frame as soon
    /// as it and every earlier request in the batch have resolved. Results for
    /// a replaced socket, a torn-down session, or a channel that was
    /// unsubscribed meanwhile are dropped.
    async fn join_channels(&self, epoch: u64, socket_id: String, requests: Vec<JoinRequest>) {
        let token = self.token_provider.auth_token();
        let socket = socket_id.as_str();
        let mut authorizations: FuturesOrdered<_> = requests
            .into_iter()
            .map(|request| {
                let token = token.clone();
                async move {
                    let result = match token {
                        Some(token) => self.auth.authorize(&token, socket, &request.channel).await,
                        None => Err(AuthorizationError::NoCredential {
                            channel: request.channel.clone(),
                        }),
                    };
                    (request, result)
                }
            })
            .collect();

        while let Some((request, result)) = authorizations.next().await {
            let mut state = self.inner.lock().await;
            let still_live = state
                .live_socket()
                .is_some_and(|(live_epoch, live_socket)| live_epoch == epoch && live_socket == socket_id);
            if !still_live {
                debug!(epoch, %socket_id, remaining = authorizations.len(), "realtime: discarding authorizations for a stale socket");
                return;
            }
            self.apply_authorization(&mut state, &socket_id, request, result);
        }
    }

    fn apply_authorization(
        &self,
        state: &mut ClientState,
        socket_id: &str,
        request: JoinRequest,
        result: Result<Map<String, Value>, AuthorizationError>,
    ) {
        match result {
            Ok(auth) => {
                if state.registry.begin_subscribe(&request.channel, request.seq) {
                    state.send_frame(socket_id, PusherFrame::subscribe(&request.channel, auth));
                } else {
                    debug!(channel = %request.channel, "realtime: channel no longer requested, dropping authorization");
                }
            }
            Err(error) => {
                if state.registry.fail_authorization(&request.channel, request.seq) {
                    warn!(channel = %request.channel, %error, "realtime: channel authorization failed");
                    let _ = self.events.send(ConnectionEvent::ChannelFailed {
                        channel: request.channel,
                        reason: error.to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/client_tests.rs"]
mod tests;
