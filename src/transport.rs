//! The seam between the connection manager and the wire.
//!
//! A [`Transport`] turns an endpoint into a [`Link`]: a sink of outgoing text frames and
//! a stream of incoming ones. The stream ending or yielding an error means the link is
//! gone, except for [`TransportError::InvalidUtf8`], which only spoils that one frame.
//! [`WsTransport`] (feature `ws`) implements it on top of `tokio-tungstenite`.

use std::error::Error as StdError;
use std::fmt;
use std::pin::Pin;
use std::string::FromUtf8Error;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Sink, Stream, StreamExt as _};
use url::Url;

use crate::Result;

pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
pub type FrameStream = BoxStream<'static, std::result::Result<String, TransportError>>;

/// One established connection. Dropping it releases the underlying handle.
#[non_exhaustive]
pub struct Link {
    /// Outgoing text frames
    pub sink: FrameSink,
    /// Incoming text frames
    pub stream: FrameStream,
}

impl Link {
    pub fn new<Si, St>(sink: Si, stream: St) -> Self
    where
        Si: Sink<String, Error = TransportError> + Send + 'static,
        St: Stream<Item = std::result::Result<String, TransportError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: stream.boxed(),
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

/// Creates links to an endpoint.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Rejects endpoints this transport can never reach. Called synchronously by `open`.
    fn validate(&self, endpoint: &Url) -> Result<()> {
        let _ = endpoint;
        Ok(())
    }

    /// Establish a new link. Called once per connect attempt.
    async fn connect(&self, endpoint: &Url) -> std::result::Result<Link, TransportError>;
}

/// Failures reported by a transport while connecting or while a link is up.
#[non_exhaustive]
#[derive(Debug)]
pub enum TransportError {
    /// Error connecting to or communicating with the WebSocket server
    #[cfg(feature = "ws")]
    WebSocket(tokio_tungstenite::tungstenite::Error),
    /// I/O failure below the message layer
    Io(std::io::Error),
    /// A connect attempt did not finish within the configured timeout
    ConnectTimeout(Duration),
    /// A binary frame was not valid UTF-8. The link stays up.
    InvalidUtf8(FromUtf8Error),
    /// The peer closed the link or the frame stream ended
    Closed {
        /// Close code sent by the peer, if any
        code: Option<u16>,
        /// Close reason sent by the peer, empty if none
        reason: String,
    },
}

impl TransportError {
    pub(crate) fn stream_ended() -> Self {
        Self::Closed {
            code: None,
            reason: String::new(),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(feature = "ws")]
            Self::WebSocket(e) => write!(f, "WebSocket error: {e}"),
            Self::Io(e) => write!(f, "transport I/O error: {e}"),
            Self::ConnectTimeout(after) => write!(f, "connect timed out after {after:?}"),
            Self::InvalidUtf8(e) => write!(f, "binary frame is not valid UTF-8: {e}"),
            Self::Closed { code: Some(code), reason } => {
                write!(f, "connection closed by peer ({code}): {reason}")
            }
            Self::Closed { code: None, .. } => write!(f, "connection closed"),
        }
    }
}

impl StdError for TransportError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            #[cfg(feature = "ws")]
            Self::WebSocket(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::InvalidUtf8(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(feature = "ws")]
pub use ws::WsTransport;

#[cfg(feature = "ws")]
mod ws {
    use async_trait::async_trait;
    use futures::{SinkExt as _, StreamExt as _, future};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::{Error as WsError, Message};
    use url::Url;

    use super::{Link, Transport, TransportError};
    use crate::error::Error;

    /// WebSocket transport for `ws://` and `wss://` endpoints.
    #[non_exhaustive]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct WsTransport;

    #[async_trait]
    impl Transport for WsTransport {
        fn validate(&self, endpoint: &Url) -> crate::Result<()> {
            match endpoint.scheme() {
                "ws" | "wss" => Ok(()),
                other => Err(Error::configuration(format!(
                    "unsupported scheme `{other}`, expected `ws` or `wss`"
                ))),
            }
        }

        async fn connect(&self, endpoint: &Url) -> Result<Link, TransportError> {
            let (ws_stream, _) = connect_async(endpoint.as_str()).await?;
            let (write, read) = ws_stream.split();

            let sink = write
                .sink_map_err(TransportError::WebSocket)
                .with(|text: String| {
                    future::ready(Ok::<_, TransportError>(Message::Text(text.into())))
                });
            let stream = read.filter_map(|frame| future::ready(inbound_frame(frame)));

            Ok(Link::new(sink, stream))
        }
    }

    /// Maps a raw WebSocket frame to a text frame. Control frames are answered by
    /// tungstenite itself and skipped here.
    fn inbound_frame(
        frame: Result<Message, WsError>,
    ) -> Option<Result<String, TransportError>> {
        match frame {
            Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
            Ok(Message::Binary(bytes)) => {
                Some(String::from_utf8(bytes.to_vec()).map_err(TransportError::InvalidUtf8))
            }
            Ok(Message::Close(frame)) => Some(Err(match frame {
                Some(frame) => TransportError::Closed {
                    code: Some(u16::from(frame.code)),
                    reason: frame.reason.as_str().to_owned(),
                },
                None => TransportError::stream_ended(),
            })),
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
            Err(e) => Some(Err(TransportError::WebSocket(e))),
        }
    }

    impl From<WsError> for TransportError {
        fn from(e: WsError) -> Self {
            Self::WebSocket(e)
        }
    }

}
