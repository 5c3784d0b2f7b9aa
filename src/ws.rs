//! Typed JSON helpers over a tungstenite WebSocket stream.
//!
//! Both control planes spoken by this crate (Asterisk ARI events and the
//! OpenAI Realtime API) are JSON-over-text-frame protocols, so the same
//! send/receive machinery serves each of them.

use async_trait::async_trait;
use async_tungstenite::{
    self as tungstenite,
    tokio::ConnectStream,
    tungstenite::{
        client::IntoClientRequest,
        error::Error as TungsteniteError,
        http::{header::HeaderName, HeaderValue},
        Message,
    },
    WebSocketStream,
};
use futures::{stream::SplitSink, SinkExt, StreamExt, TryStreamExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Error as JsonError;
use tokio::time::{timeout, Duration};
use tracing::{debug, instrument};

pub type WsStream = WebSocketStream<ConnectStream>;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// A header value handed to [`connect`] was not representable.
    BadHeader,

    Json(JsonError),

    /// Neither peer speaks a binary subprotocol; only text messages are
    /// expected.
    UnexpectedBinaryMessage(Vec<u8>),

    Ws(TungsteniteError),

    WsClosed(Option<String>),
}

impl From<JsonError> for Error {
    fn from(e: JsonError) -> Error {
        Error::Json(e)
    }
}

impl From<TungsteniteError> for Error {
    fn from(e: TungsteniteError) -> Error {
        Error::Ws(e)
    }
}

#[async_trait]
pub trait ReceiverExt {
    async fn recv_json<T: DeserializeOwned>(&mut self) -> Result<Option<T>>;
    async fn recv_json_no_timeout<T: DeserializeOwned>(&mut self) -> Result<Option<T>>;
}

#[async_trait]
pub trait SenderExt {
    async fn send_json<T: Serialize + Sync>(&mut self, value: &T) -> Result<()>;
}

#[async_trait]
impl ReceiverExt for WsStream {
    async fn recv_json<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        const TIMEOUT: Duration = Duration::from_millis(500);

        let ws_message = match timeout(TIMEOUT, self.next()).await {
            Ok(Some(Ok(v))) => Some(v),
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(None) | Err(_) => None,
        };

        convert_ws_message(ws_message)
    }

    async fn recv_json_no_timeout<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        convert_ws_message(self.try_next().await?)
    }
}

#[async_trait]
impl SenderExt for SplitSink<WsStream, Message> {
    async fn send_json<T: Serialize + Sync>(&mut self, value: &T) -> Result<()> {
        Ok(serde_json::to_string(value)
            .map(Message::text)
            .map_err(Error::from)
            .map(|m| self.send(m))?
            .await?)
    }
}

#[async_trait]
impl SenderExt for WsStream {
    async fn send_json<T: Serialize + Sync>(&mut self, value: &T) -> Result<()> {
        Ok(serde_json::to_string(value)
            .map(Message::text)
            .map_err(Error::from)
            .map(|m| self.send(m))?
            .await?)
    }
}

#[inline]
pub(crate) fn convert_ws_message<T: DeserializeOwned>(message: Option<Message>) -> Result<Option<T>> {
    Ok(match message {
        Some(Message::Text(payload)) => serde_json::from_str(payload.as_str())
            .map_err(|e| {
                debug!("Unexpected JSON {payload:?}.");
                e
            })
            .ok(),
        Some(Message::Binary(bytes)) => {
            return Err(Error::UnexpectedBinaryMessage(bytes.to_vec()));
        },
        Some(Message::Close(frame)) => {
            return Err(Error::WsClosed(frame.map(|f| f.reason.to_string())));
        },
        // Ping/Pong message behaviour is internally handled by tungstenite.
        _ => None,
    })
}

/// Opens a WebSocket connection to `url`, attaching any extra request
/// headers (bearer tokens, beta opt-ins) before the handshake.
#[instrument(skip(headers))]
pub(crate) async fn connect(
    url: &str,
    headers: &[(&'static str, String)],
) -> Result<WsStream> {
    let mut request = url.into_client_request()?;

    for (name, value) in headers {
        request.headers_mut().insert(
            HeaderName::from_static(name),
            HeaderValue::from_str(value).map_err(|_| Error::BadHeader)?,
        );
    }

    let (stream, _response) = tungstenite::tokio::connect_async(request).await?;

    Ok(stream)
}
