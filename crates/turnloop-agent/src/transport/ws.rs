//! WebSocket transport for persistent sessions.

use async_trait::async_trait;
use futures::stream::{SplitSink, StreamExt};
use futures::{SinkExt, future};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use turnloop_protocol::{ClientEvent, ServerEvent};

use crate::error::{AgentError, Result};
use crate::transport::{EventSink, ServerEventStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Beta header value the realtime endpoint requires.
const REALTIME_BETA: &str = "realtime=v1";

/// Outbound half of a realtime WebSocket.
pub struct WsSink {
    sink: Mutex<SplitSink<WsStream, Message>>,
}

impl std::fmt::Debug for WsSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsSink").finish_non_exhaustive()
    }
}

#[async_trait]
impl EventSink for WsSink {
    async fn send(&self, event: &ClientEvent) -> Result<()> {
        let text = serde_json::to_string(event)?;
        tracing::trace!(event = event.kind(), "sending client event");
        self.sink.lock().await.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut sink = self.sink.lock().await;
        match sink.close().await {
            Ok(()) => Ok(()),
            // Closing twice is not an error.
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// The session URL for `model`.
pub fn realtime_url(base: &str, model: &str) -> Result<Url> {
    let mut url = Url::parse(base).map_err(|e| AgentError::Config {
        reason: format!("invalid realtime url `{base}`: {e}"),
    })?;
    url.query_pairs_mut().append_pair("model", model);
    Ok(url)
}

/// Open a persistent session.
///
/// Returns the outbound sink and the decoded inbound stream.  The stream ends
/// when the server closes the connection.
pub async fn connect_realtime(
    base_url: &str,
    model: &str,
    api_key: &str,
) -> Result<(WsSink, ServerEventStream)> {
    let url = realtime_url(base_url, model)?;

    let mut request = url.as_str().into_client_request()?;
    let headers = request.headers_mut();
    headers.insert(
        "Authorization",
        HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(|e| AgentError::Config {
            reason: format!("invalid authorization header: {e}"),
        })?,
    );
    headers.insert("OpenAI-Beta", HeaderValue::from_static(REALTIME_BETA));

    tracing::info!(url = %url, "connecting realtime session");
    let (ws, _response) = connect_async(request).await?;
    let (sink, stream) = ws.split();

    let events = stream
        .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(decode_event(text.as_str())),
                Ok(_) => None,
                Err(e) => Some(Err(AgentError::from(e))),
            })
        })
        .boxed();

    Ok((
        WsSink {
            sink: Mutex::new(sink),
        },
        events,
    ))
}

fn decode_event(text: &str) -> Result<ServerEvent> {
    let event: ServerEvent = serde_json::from_str(text)?;
    if matches!(event, ServerEvent::Unknown) {
        tracing::trace!("ignoring unknown server event");
    }
    Ok(event)
}
