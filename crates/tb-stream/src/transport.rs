use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures_util::future::BoxFuture;
use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_ABNORMAL: u16 = 1006;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Text(String),
    Closed { code: Option<u16>, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("transport read failed: {0}")]
    Read(String),
}

/// An open connection yielding text frames until it closes.
pub trait Transport: Stream<Item = Result<TransportEvent, TransportError>> + Send + Unpin {
    /// Caller-initiated close.
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

pub type BoxTransport = Box<dyn Transport>;

pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<BoxTransport, TransportError>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<BoxTransport, TransportError>> {
        Box::pin(async move {
            let (ws, _) = connect_async(url)
                .await
                .map_err(|err| TransportError::Connect(err.to_string()))?;
            Ok(Box::new(WsTransport { inner: ws }) as BoxTransport)
        })
    }
}

struct WsTransport {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Stream for WsTransport {
    type Item = Result<TransportEvent, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let item = match ready!(self.inner.poll_next_unpin(cx)) {
                None => return Poll::Ready(None),
                Some(item) => item,
            };
            let event = match item {
                Ok(Message::Text(text)) => TransportEvent::Text(text),
                Ok(Message::Close(frame)) => TransportEvent::Closed {
                    code: frame.as_ref().map(|frame| u16::from(frame.code)),
                    reason: frame
                        .map(|frame| frame.reason.into_owned())
                        .unwrap_or_default(),
                },
                Ok(_) => continue,
                Err(err) => return Poll::Ready(Some(Err(TransportError::Read(err.to_string())))),
            };
            return Poll::Ready(Some(Ok(event)));
        }
    }
}

impl Transport for WsTransport {
    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let _ = self.inner.close(None).await;
        })
    }
}
