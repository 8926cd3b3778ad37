use futures::{SinkExt, StreamExt, future::BoxFuture};
use reqwest::Url;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::{
    dto::ws::{RoomClientMessage, RoomServerMessage},
    error::TransportError,
    services::room_connection::{RoomAccess, RoomLink, RoomTransport},
};

const ROOM_SOCKET_SEGMENTS: [&str; 4] = ["api", "v1", "ws", "rooms"];

/// [`RoomTransport`] speaking JSON text frames over a WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    base: Url,
}

impl WebSocketTransport {
    /// Derive the socket endpoint from the REST base URL (`http` becomes `ws`, `https` becomes `wss`).
    pub fn from_api_base(api_base_url: &str) -> Result<Self, TransportError> {
        let mut base =
            Url::parse(api_base_url).map_err(|err| TransportError::Open(err.to_string()))?;
        let scheme = match base.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(TransportError::Open(format!(
                    "unsupported URL scheme `{other}`"
                )));
            }
        };
        base.set_scheme(scheme)
            .map_err(|()| TransportError::Open(format!("cannot switch `{api_base_url}` to {scheme}")))?;
        Ok(Self { base })
    }

    /// Socket URL of a room: `<base>/api/v1/ws/rooms/<room_id>?<credential>`.
    pub fn room_url(&self, room_id: &str, access: &RoomAccess) -> Result<Url, TransportError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| TransportError::Open(format!("`{}` cannot be a base URL", self.base)))?
            .pop_if_empty()
            .extend(ROOM_SOCKET_SEGMENTS)
            .push(room_id);
        let (key, value) = access.query_pair();
        url.query_pairs_mut().clear().append_pair(key, value);
        Ok(url)
    }
}

impl RoomTransport for WebSocketTransport {
    fn open(
        &self,
        room_id: &str,
        access: &RoomAccess,
    ) -> BoxFuture<'static, Result<RoomLink, TransportError>> {
        let url = self.room_url(room_id, access);
        Box::pin(async move {
            let url = url?;
            let (socket, _response) = connect_async(url.as_str())
                .await
                .map_err(|err| TransportError::Open(err.to_string()))?;
            debug!(host = ?url.host_str(), "room socket open");

            let (mut sink, mut stream) = socket.split();
            let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<RoomClientMessage>();
            let (inbound_tx, inbound) = mpsc::unbounded_channel();

            // Dedicated writer so commands flow while the reader waits on frames.
            tokio::spawn(async move {
                while let Some(message) = outbound_rx.recv().await {
                    let closing = message == RoomClientMessage::Close;
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(error = %err, "failed to encode room message");
                            continue;
                        }
                    };
                    if sink.send(Message::text(text)).await.is_err() {
                        break;
                    }
                    if closing {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            });

            tokio::spawn(async move {
                while let Some(frame) = stream.next().await {
                    let item = match frame {
                        Ok(Message::Text(text)) => RoomServerMessage::from_json_str(text.as_str()),
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(err) => {
                            warn!(error = %err, "room socket receive error");
                            break;
                        }
                    };
                    if inbound_tx.send(item).is_err() {
                        break;
                    }
                }
            });

            Ok(RoomLink { outbound, inbound })
        })
    }
}
