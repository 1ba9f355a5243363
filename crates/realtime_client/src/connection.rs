use std::{sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use shared::{
    domain::ChannelTarget,
    protocol::{events, ConnectionEstablished, FrameData, PusherErrorData, PusherFrame},
};
use tokio::{
    sync::mpsc::UnboundedReceiver,
    time::{sleep, sleep_until, Instant},
};
use tracing::{debug, info, trace, warn};

use crate::{
    client::{Outbound, RealtimeClient},
    dispatch::{decode_thread_event, ConnectionEvent, ThreadCallbacks},
    state::ConnectionState,
    transport::{FrameSink, FrameStream, TransportMessage},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReconnectHint {
    Never,
    Backoff,
    Immediately,
}

/// Pusher close/error code ranges: 4000-4099 fatal, 4100-4199 back off,
/// 4200-4299 reconnect right away.
pub(crate) fn reconnect_hint(code: Option<u16>) -> ReconnectHint {
    match code {
        Some(4000..=4099) => ReconnectHint::Never,
        Some(4200..=4299) => ReconnectHint::Immediately,
        _ => ReconnectHint::Backoff,
    }
}

enum SessionEnd {
    Closed,
    Lost {
        reason: Option<String>,
        hint: ReconnectHint,
        established: bool,
    },
}

enum KeepaliveAction {
    Ping,
    Expired,
}

struct Keepalive {
    activity_timeout: Duration,
    pong_timeout: Duration,
    deadline: Instant,
    awaiting_pong: bool,
}

impl Keepalive {
    fn new(activity_timeout: Duration, pong_timeout: Duration) -> Self {
        Self {
            activity_timeout,
            pong_timeout,
            deadline: Instant::now() + activity_timeout,
            awaiting_pong: false,
        }
    }

    fn record_activity(&mut self) {
        self.awaiting_pong = false;
        self.deadline = Instant::now() + self.activity_timeout;
    }

    fn set_activity_timeout(&mut self, activity_timeout: Duration) {
        self.activity_timeout = activity_timeout;
        self.record_activity();
    }

    fn on_deadline(&mut self) -> KeepaliveAction {
        if self.awaiting_pong {
            return KeepaliveAction::Expired;
        }
        self.awaiting_pong = true;
        self.deadline = Instant::now() + self.pong_timeout;
        KeepaliveAction::Ping
    }
}

/// One open transport plus what the broker has told us about it.
struct Session {
    sink: FrameSink,
    socket_id: Option<String>,
    error_hint: ReconnectHint,
    keepalive: Keepalive,
}

impl Session {
    fn lost(&self, reason: Option<String>, hint: ReconnectHint) -> SessionEnd {
        SessionEnd::Lost {
            reason,
            hint,
            established: self.socket_id.is_some(),
        }
    }

    fn failed(&self, error: &anyhow::Error) -> SessionEnd {
        self.lost(Some(format!("{error:#}")), self.error_hint)
    }

    async fn send(&mut self, frame: PusherFrame) -> Result<(), SessionEnd> {
        let sent = self.sink.send(frame.to_text()).await;
        sent.map_err(|error| self.failed(&error))
    }
}

impl RealtimeClient {
    /// Owns the transport for one session epoch, reconnecting per the
    /// configured policy until the session is closed or given up.
    pub(crate) async fn run_connection(
        self: Arc<Self>,
        epoch: u64,
        mut outbound: UnboundedReceiver<Outbound>,
    ) {
        let mut attempt: u32 = 0;
        loop {
            let opened = {
                let open = self.transport.open(&self.socket_url);
                tokio::pin!(open);
                loop {
                    tokio::select! {
                        result = &mut open => break Some(result),
                        command = outbound.recv() => match command {
                            Some(Outbound::Frame { .. }) => continue,
                            Some(Outbound::Close) | None => break None,
                        },
                    }
                }
            };
            let Some(opened) = opened else {
                debug!(epoch, "realtime: session closed while opening transport");
                return;
            };

            let (hint, established) = match opened {
                Ok((sink, stream)) => match self.pump(epoch, sink, stream, &mut outbound).await {
                    SessionEnd::Closed => return,
                    SessionEnd::Lost {
                        reason,
                        hint,
                        established,
                    } => {
                        self.connection_lost(epoch, reason).await;
                        (hint, established)
                    }
                },
                Err(error) => {
                    warn!(epoch, attempt, error = %format!("{error:#}"), "realtime: failed to open broker connection");
                    self.connection_lost(epoch, Some(format!("{error:#}"))).await;
                    (ReconnectHint::Backoff, false)
                }
            };
            if established {
                attempt = 0;
            }

            let policy = &self.settings.reconnect;
            let delay = match hint {
                ReconnectHint::Never => Err("broker asked not to reconnect"),
                _ if !policy.allows(attempt) => Err("reconnect disabled or attempts exhausted"),
                ReconnectHint::Immediately => Ok(Duration::ZERO),
                ReconnectHint::Backoff => Ok(policy.delay_for(attempt)),
            };
            let delay = match delay {
                Ok(delay) => delay,
                Err(reason) => {
                    self.release_connection(epoch, reason).await;
                    return;
                }
            };
            if self.token_provider.auth_token().is_none() {
                self.release_connection(epoch, "no auth token available to reconnect")
                    .await;
                return;
            }

            attempt += 1;
            let delay_ms = delay.as_millis() as u64;
            info!(epoch, attempt, delay_ms, "realtime: reconnecting");
            if !wait_for_retry(delay, &mut outbound).await || !self.begin_reconnect(epoch).await {
                return;
            }
        }
    }

    async fn pump(
        self: &Arc<Self>,
        epoch: u64,
        sink: FrameSink,
        mut stream: FrameStream,
        outbound: &mut UnboundedReceiver<Outbound>,
    ) -> SessionEnd {
        let mut session = Session {
            sink,
            socket_id: None,
            error_hint: ReconnectHint::Backoff,
            keepalive: Keepalive::new(
                self.settings.activity_timeout(None),
                self.settings.pong_timeout(),
            ),
        };
        loop {
            if let Err(end) = self.pump_once(epoch, &mut session, &mut stream, outbound).await {
                return end;
            }
        }
    }

    async fn pump_once(
        self: &Arc<Self>,
        epoch: u64,
        session: &mut Session,
        stream: &mut FrameStream,
        outbound: &mut UnboundedReceiver<Outbound>,
    ) -> Result<(), SessionEnd> {
        tokio::select! {
            message = stream.next() => {
                session.keepalive.record_activity();
                match message {
                    Some(Ok(TransportMessage::Text(text))) => self.handle_frame(epoch, &text, session).await,
                    Some(Ok(TransportMessage::Closed { code, reason })) => {
                        let hint = match code {
                            Some(code) if code >= 4000 => reconnect_hint(Some(code)),
                            _ => session.error_hint,
                        };
                        Err(session.lost((!reason.is_empty()).then_some(reason), hint))
                    }
                    Some(Err(error)) => Err(session.failed(&error)),
                    None => Err(session.lost(None, session.error_hint)),
                }
            }
            command = outbound.recv() => match command {
                Some(Outbound::Frame { socket_id: target, frame }) => {
                    if session.socket_id.as_deref() != Some(target.as_str()) {
                        debug!(event = %frame.event, "realtime: dropping frame addressed to a previous socket");
                        return Ok(());
                    }
                    session.send(frame).await
                }
                Some(Outbound::Close) | None => {
                    let _ = session.sink.close().await;
                    Err(SessionEnd::Closed)
                }
            },
            _ = sleep_until(session.keepalive.deadline) => match session.keepalive.on_deadline() {
                KeepaliveAction::Ping => {
                    trace!(epoch, "realtime: idle, sending ping");
                    session.send(PusherFrame::ping()).await
                }
                KeepaliveAction::Expired => Err(session.lost(
                    Some("broker did not answer ping".to_string()),
                    ReconnectHint::Backoff,
                )),
            },
        }
    }

    async fn handle_frame(
        self: &Arc<Self>,
        epoch: u64,
        text: &str,
        session: &mut Session,
    ) -> Result<(), SessionEnd> {
        let frame = match PusherFrame::parse(text) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, "realtime: ignoring malformed broker frame");
                return Ok(());
            }
        };
        trace!(event = %frame.event, channel = ?frame.channel, "realtime: broker frame");

        match frame.event.as_str() {
            events::CONNECTION_ESTABLISHED => match frame.data_as::<ConnectionEstablished>() {
                Ok(established) => {
                    let activity_timeout = self.settings.activity_timeout(established.activity_timeout);
                    let socket_id = self
                        .on_established(epoch, established.socket_id)
                        .await
                        .ok_or(SessionEnd::Closed)?;
                    session.keepalive.set_activity_timeout(activity_timeout);
                    session.socket_id = Some(socket_id);
                }
                Err(error) => warn!(%error, "realtime: unreadable connection_established frame"),
            },
            events::PING => session.send(PusherFrame::pong()).await?,
            events::PONG => {}
            events::ERROR => {
                let data: PusherErrorData = frame.data_as().unwrap_or_default();
                let message = data
                    .message
                    .unwrap_or_else(|| "unspecified broker error".to_string());
                warn!(code = ?data.code, %message, "realtime: broker reported an error");
                let _ = self.events.send(ConnectionEvent::Error { message });
                session.error_hint = reconnect_hint(data.code);
            }
            events::SUBSCRIPTION_SUCCEEDED | events::SUBSCRIPTION_SUCCEEDED_PUBLIC => {
                if let Some(channel) = frame.channel {
                    self.on_subscription_succeeded(epoch, channel).await;
                }
            }
            events::SUBSCRIPTION_ERROR => {
                if let Some(channel) = frame.channel.clone() {
                    let reason = frame
                        .data
                        .as_ref()
                        .map(|data| data.to_value().to_string())
                        .unwrap_or_else(|| "subscription rejected".to_string());
                    self.on_subscription_error(epoch, channel, reason).await;
                }
            }
            _ => {
                if let Some(channel) = frame.channel.as_deref() {
                    self.dispatch_channel_event(epoch, channel, &frame).await;
                }
            }
        }
        Ok(())
    }

    /// Connecting → Connected, then joins the user channel followed by every
    /// queued thread in registration order. `None` when the session is stale.
    async fn on_established(self: &Arc<Self>, epoch: u64, socket_id: String) -> Option<String> {
        let mut state = self.inner.lock().await;
        let connection = state.current_mut(epoch)?;
        connection.socket_id = Some(socket_id.clone());
        self.transition(&mut state, ConnectionState::Connected);

        let mut requests = Vec::new();
        if let Some(user_id) = state.user_id.clone() {
            requests.extend(
                state
                    .registry
                    .activate(ChannelTarget::User(user_id), ThreadCallbacks::default()),
            );
        }
        requests.extend(state.registry.flush_pending());
        drop(state);

        info!(epoch, %socket_id, channels = requests.len(), "realtime: connected");
        let _ = self.events.send(ConnectionEvent::Connected {
            socket_id: socket_id.clone(),
        });
        self.spawn_joins(epoch, socket_id.clone(), requests);
        Some(socket_id)
    }

    async fn on_subscription_succeeded(&self, epoch: u64, channel: String) {
        let mut state = self.inner.lock().await;
        if !state.is_current(epoch) || !state.registry.mark_joined(&channel) {
            return;
        }
        drop(state);
        debug!(%channel, "realtime: channel joined");
        let _ = self.events.send(ConnectionEvent::ChannelJoined { channel });
    }

    async fn on_subscription_error(&self, epoch: u64, channel: String, reason: String) {
        let mut state = self.inner.lock().await;
        if !state.is_current(epoch) || !state.registry.mark_rejected(&channel) {
            return;
        }
        drop(state);
        warn!(%channel, %reason, "realtime: broker rejected channel subscription");
        let _ = self
            .events
            .send(ConnectionEvent::ChannelFailed { channel, reason });
    }

    /// Handlers run after the state lock is released.
    async fn dispatch_channel_event(&self, epoch: u64, channel: &str, frame: &PusherFrame) {
        let target = {
            let state = self.inner.lock().await;
            if !state.is_current(epoch) {
                return;
            }
            state.registry.dispatch_target(channel)
        };
        let Some((target, callbacks)) = target else {
            debug!(%channel, event = %frame.event, "realtime: event for a channel that is not joined");
            return;
        };

        match target {
            ChannelTarget::User(user_id) => {
                let data = frame
                    .data
                    .as_ref()
                    .map(FrameData::to_value)
                    .unwrap_or(Value::Null);
                let _ = self.events.send(ConnectionEvent::UserNotification {
                    user_id,
                    event: frame.event.clone(),
                    data,
                });
            }
            ChannelTarget::Thread(thread_id) => {
                match decode_thread_event(&frame.event, frame.data.as_ref()) {
                    Ok(Some(event)) => {
                        if !callbacks.dispatch(event) {
                            trace!(%thread_id, event = %frame.event, "realtime: no handler bound, event dropped");
                        }
                    }
                    Ok(None) => trace!(%thread_id, event = %frame.event, "realtime: ignoring unknown thread event"),
                    Err(error) => {
                        warn!(%thread_id, event = %frame.event, %error, "realtime: undecodable thread event")
                    }
                }
            }
        }
    }

    /// Connected → (Errored →) Disconnected. Active thread channels go back to
    /// the pending queue so the next handshake re-joins them.
    async fn connection_lost(&self, epoch: u64, reason: Option<String>) {
        let mut state = self.inner.lock().await;
        let Some(connection) = state.current_mut(epoch) else {
            return;
        };
        connection.socket_id = None;
        let previous = state.connection_state;

        if let Some(message) = &reason {
            warn!(epoch, %message, "realtime: broker connection error");
            let _ = self.events.send(ConnectionEvent::Error {
                message: message.clone(),
            });
            if previous == ConnectionState::Connected {
                self.transition(&mut state, ConnectionState::Errored);
            }
        }
        self.transition(&mut state, ConnectionState::Disconnected);
        let requeued = state.registry.requeue_active();
        drop(state);

        if previous == ConnectionState::Connected {
            info!(epoch, requeued, "realtime: connection lost");
            let _ = self.events.send(ConnectionEvent::Disconnected);
        }
    }

    async fn begin_reconnect(&self, epoch: u64) -> bool {
        let mut state = self.inner.lock().await;
        if !state.is_current(epoch) {
            return false;
        }
        self.transition(&mut state, ConnectionState::Connecting);
        true
    }

    /// Drops the connection slot so a later `connect()` starts a fresh
    /// session; queued subscriptions are kept for it.
    async fn release_connection(&self, epoch: u64, reason: &str) {
        let mut state = self.inner.lock().await;
        if !state.is_current(epoch) {
            return;
        }
        state.connection = None;
        drop(state);
        warn!(epoch, reason, "realtime: giving up on broker connection");
        let _ = self.events.send(ConnectionEvent::Error {
            message: reason.to_string(),
        });
    }
}

async fn wait_for_retry(delay: Duration, outbound: &mut UnboundedReceiver<Outbound>) -> bool {
    let pause = sleep(delay);
    tokio::pin!(pause);
    loop {
        tokio::select! {
            _ = &mut pause => return true,
            command = outbound.recv() => match command {
                Some(Outbound::Frame { .. }) => continue,
                Some(Outbound::Close) | None => return false,
            },
        }
    }
}
