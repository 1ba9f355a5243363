use std::{
    fmt,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use serde_json::Value;
use shared::{
    domain::UserId,
    error::ProtocolError,
    protocol::{
        events, FrameData, MessageRead, NewMessagePayload, ThreadMessage, TypingIndicator,
    },
};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::UnboundedReceiverStream, Stream, StreamExt};

use crate::state::ConnectionState;

type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Optional per-thread handlers. Events without a handler are dropped.
#[derive(Clone, Default)]
pub struct ThreadCallbacks {
    on_new_message: Option<Handler<ThreadMessage>>,
    on_message_read: Option<Handler<MessageRead>>,
    on_typing: Option<Handler<TypingIndicator>>,
}

impl ThreadCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_new_message(mut self, handler: impl Fn(ThreadMessage) + Send + Sync + 'static) -> Self {
        self.on_new_message = Some(Arc::new(handler));
        self
    }

    pub fn on_message_read(mut self, handler: impl Fn(MessageRead) + Send + Sync + 'static) -> Self {
        self.on_message_read = Some(Arc::new(handler));
        self
    }

    pub fn on_typing(mut self, handler: impl Fn(TypingIndicator) + Send + Sync + 'static) -> Self {
        self.on_typing = Some(Arc::new(handler));
        self
    }

    /// Handlers that forward every event kind into a [`ThreadEventStream`].
    pub fn channel() -> (Self, ThreadEventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let messages = tx.clone();
        let reads = tx.clone();
        let callbacks = Self::new()
            .on_new_message(move |message| {
                let _ = messages.send(ThreadEvent::NewMessage(message));
            })
            .on_message_read(move |read| {
                let _ = reads.send(ThreadEvent::MessageRead(read));
            })
            .on_typing(move |typing| {
                let _ = tx.send(ThreadEvent::Typing(typing));
            });
        (
            callbacks,
            ThreadEventStream {
                inner: UnboundedReceiverStream::new(rx),
            },
        )
    }

    /// Returns whether a handler consumed the event.
    pub fn dispatch(&self, event: ThreadEvent) -> bool {
        match event {
            ThreadEvent::NewMessage(message) => invoke(&self.on_new_message, message),
            ThreadEvent::MessageRead(read) => invoke(&self.on_message_read, read),
            ThreadEvent::Typing(typing) => invoke(&self.on_typing, typing),
        }
    }
}

fn invoke<T>(handler: &Option<Handler<T>>, value: T) -> bool {
    match handler {
        Some(handler) => {
            handler(value);
            true
        }
        None => false,
    }
}

impl fmt::Debug for ThreadCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadCallbacks")
            .field("on_new_message", &self.on_new_message.is_some())
            .field("on_message_read", &self.on_message_read.is_some())
            .field("on_typing", &self.on_typing.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ThreadEvent {
    NewMessage(ThreadMessage),
    MessageRead(MessageRead),
    Typing(TypingIndicator),
}

/// Maps a thread-channel event to its typed form. Unknown event names yield
/// `Ok(None)`. A leading `.` (Laravel `broadcastAs` style) is ignored.
pub fn decode_thread_event(
    event: &str,
    data: Option<&FrameData>,
) -> Result<Option<ThreadEvent>, ProtocolError> {
    let name = event.strip_prefix('.').unwrap_or(event);
    if !matches!(
        name,
        events::NEW_MESSAGE | events::MESSAGE_READ | events::USER_TYPING
    ) {
        return Ok(None);
    }
    let data = data.ok_or_else(|| ProtocolError::MissingData {
        event: event.to_string(),
    })?;
    let decoded = match name {
        events::NEW_MESSAGE => {
            ThreadEvent::NewMessage(data.decode::<NewMessagePayload>()?.message)
        }
        events::MESSAGE_READ => ThreadEvent::MessageRead(data.decode()?),
        _ => ThreadEvent::Typing(data.decode()?),
    };
    Ok(Some(decoded))
}

/// Typed event stream for one thread subscription.
pub struct ThreadEventStream {
    inner: UnboundedReceiverStream<ThreadEvent>,
}

impl ThreadEventStream {
    pub async fn recv(&mut self) -> Option<ThreadEvent> {
        self.inner.next().await
    }
}

impl Stream for ThreadEventStream {
    type Item = ThreadEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Connection-level notifications published to every
/// [`RealtimeClient::subscribe_events`](crate::RealtimeClient::subscribe_events) receiver.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected {
        socket_id: String,
    },
    Error {
        message: String,
    },
    Disconnected,
    StateChange {
        previous: ConnectionState,
        current: ConnectionState,
    },
    ChannelJoined {
        channel: String,
    },
    ChannelFailed {
        channel: String,
        reason: String,
    },
    UserNotification {
        user_id: UserId,
        event: String,
        data: Value,
    },
}

#[cfg(test)]
#[path = "tests/dispatch_tests.rs"]
mod tests;
