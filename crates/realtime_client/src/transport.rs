use std::pin::Pin;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMessage {
    Text(String),
    Closed { code: Option<u16>, reason: String },
}

pub type FrameSink = Pin<Box<dyn Sink<String, Error = anyhow::Error> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<TransportMessage>> + Send>>;

/// Opens one text-frame connection to the broker.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn open(&self, url: &Url) -> Result<(FrameSink, FrameStream)>;
}

pub struct TungsteniteTransport;

#[async_trait]
impl BrokerTransport for TungsteniteTransport {
    async fn open(&self, url: &Url) -> Result<(FrameSink, FrameStream)> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {url}"))?;
        let (ws_writer, ws_reader) = ws_stream.split();

        let sink = ws_writer
            .sink_map_err(anyhow::Error::from)
            .with(|text: String| future::ready(Ok::<_, anyhow::Error>(Message::Text(text))));
        let stream = ws_reader.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(TransportMessage::Text(text))),
                Ok(Message::Close(frame)) => Some(Ok(TransportMessage::Closed {
                    code: frame.as_ref().map(|frame| u16::from(frame.code)),
                    reason: frame
                        .map(|frame| frame.reason.into_owned())
                        .unwrap_or_default(),
                })),
                Ok(_) => None,
                Err(err) => Some(Err(anyhow::Error::from(err).context("websocket receive failed"))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}
