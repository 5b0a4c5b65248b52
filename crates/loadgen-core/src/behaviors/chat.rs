use crate::chaos::ChaosHttpClient;
use crate::config::Config;
use crate::metrics;
use anyhow::Result;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(25);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Chat client: REST reads plus a hand-framed Socket.IO v4 WebSocket.
///
/// Only the frames the chat service actually speaks are implemented: the
/// connect packet `40`, `42["join",...]`, the ping `2`, and
/// `42["message",...]`. No polling transport, packet ids, or acks.
pub struct ChatBehavior {
    base_url: String,
    http: ChaosHttpClient,
    ws: tokio::sync::Mutex<Option<WsSink>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    message: &'a str,
    room: &'a str,
    #[serde(rename = "isPrivate")]
    is_private: bool,
}

fn websocket_url(base_url: &str) -> String {
    let ws_base = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base_url.to_string()
    };
    format!("{}/socket.io/?EIO=4&transport=websocket", ws_base.trim_end_matches('/'))
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl ChatBehavior {
    pub fn new(config: &Config, cancel: CancellationToken) -> Result<Self> {
        let service = &config.services.chat_service;
        Ok(Self {
            base_url: service.base_url.clone(),
            http: ChaosHttpClient::new(service.timeout, config.chaos.clone(), cancel)?,
            ws: tokio::sync::Mutex::new(None),
        })
    }

    /// Dial the chat WebSocket and keep it alive until cancellation.
    ///
    /// Runs the Socket.IO handshake, spawns a reader that discards
    /// everything but `42` events, and pings every 25 seconds. The
    /// connection gauge covers exactly the lifetime of the dialed socket.
    pub async fn connect(&self, cancel: CancellationToken) {
        let url = websocket_url(&self.base_url);
        let stream = match tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(url.as_str())).await {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                warn!("websocket connection failed: {e}");
                return;
            }
            Err(_) => {
                warn!("websocket handshake timed out");
                return;
            }
        };

        metrics::WEBSOCKET_CONNECTIONS.inc();
        self.run_connection(stream, &cancel).await;
        metrics::WEBSOCKET_CONNECTIONS.dec();
    }

    async fn run_connection(&self, stream: WsStream, cancel: &CancellationToken) {
        let (mut sink, mut reader) = stream.split();

        // Socket.IO handshake: connect packet, then join the public room.
        if sink.send(Message::Text("40".to_string())).await.is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        let join_name = format!("loadtest_user_{}", epoch_secs() % 1000);
        let join_frame = format!(
            "42[\"join\",{}]",
            serde_json::Value::String(join_name.clone())
        );
        if sink.send(Message::Text(join_frame)).await.is_err() {
            return;
        }
        info!(username = %join_name, "websocket connected");
        *self.ws.lock().await = Some(sink);

        let reader_cancel = cancel.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = reader.next() => match message {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(event) = text.strip_prefix("42") {
                                debug!("received chat event: {event}");
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(_)) | None => break,
                    },
                    _ = reader_cancel.cancelled() => break,
                }
            }
        });

        let mut ping = tokio::time::interval(KEEPALIVE_PERIOD);
        ping.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ping.tick() => {
                    let mut ws = self.ws.lock().await;
                    match ws.as_mut() {
                        Some(sink) => {
                            if sink.send(Message::Text("2".to_string())).await.is_err() {
                                *ws = None;
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        if let Some(mut sink) = self.ws.lock().await.take() {
            let _ = sink.close().await;
        }
        reader_task.abort();
    }

    /// Send a chat message over the live WebSocket. With no connection the
    /// send is recorded as `no_connection` and nothing is dialed.
    pub async fn send_message(&self, message: &str) {
        let _timer = metrics::REQUEST_DURATION
            .with_label_values(&["chat", "send_message"])
            .start_timer();

        let mut ws = self.ws.lock().await;
        let Some(sink) = ws.as_mut() else {
            metrics::observe_request("chat", "send_message", "no_connection");
            warn!("no websocket connection for message: {message}");
            return;
        };

        let payload = ChatMessage {
            message,
            room: "general",
            is_private: false,
        };
        let frame = match serde_json::to_string(&("message", &payload)) {
            Ok(json) => format!("42{json}"),
            Err(e) => {
                warn!("failed to encode chat message: {e}");
                return;
            }
        };

        match sink.send(Message::Text(frame)).await {
            Ok(()) => {
                metrics::observe_request("chat", "send_message", "200");
                debug!(message, "sent chat message");
            }
            Err(e) => {
                metrics::observe_request("chat", "send_message", "error");
                warn!("failed to send websocket message: {e}");
                *ws = None;
            }
        }
    }

    /// Fetch recent messages over REST.
    pub async fn get_messages(&self, token: &str) {
        let _timer = metrics::REQUEST_DURATION
            .with_label_values(&["chat", "get_messages"])
            .start_timer();
        let request = self
            .http
            .client()
            .get(format!("{}/api/messages", self.base_url))
            .bearer_auth(token);

        match self.http.execute(request).await {
            Ok(response) => {
                metrics::observe_request("chat", "get_messages", response.status().as_str());
            }
            Err(_) => metrics::observe_request("chat", "get_messages", "error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn websocket_url_swaps_scheme_and_appends_path() {
        assert_eq!(
            websocket_url("http://localhost:3001"),
            "ws://localhost:3001/socket.io/?EIO=4&transport=websocket"
        );
        assert_eq!(
            websocket_url("https://chat.example.com/"),
            "wss://chat.example.com/socket.io/?EIO=4&transport=websocket"
        );
    }

    #[test]
    fn message_frame_matches_socket_io_shape() {
        let payload = ChatMessage {
            message: "hi there",
            room: "general",
            is_private: false,
        };
        let frame = format!(
            "42{}",
            serde_json::to_string(&("message", &payload)).unwrap()
        );
        assert_eq!(
            frame,
            r#"42["message",{"message":"hi there","room":"general","isPrivate":false}]"#
        );
    }

    #[tokio::test]
    async fn send_without_connection_records_no_connection() {
        let config = Config::default();
        let chat = ChatBehavior::new(&config, CancellationToken::new()).unwrap();

        let counter = metrics::REQUESTS_TOTAL.with_label_values(&[
            "chat",
            "send_message",
            "no_connection",
        ]);
        let before = counter.get();
        chat.send_message("nobody hears this").await;
        assert!(counter.get() >= before + 1);
    }

    #[tokio::test]
    async fn get_messages_hits_rest_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = Config::default();
        config.services.chat_service.base_url = server.uri();
        config.chaos.error_rate = 0.0;
        config.chaos.delay_rate = 0.0;

        let chat = ChatBehavior::new(&config, CancellationToken::new()).unwrap();
        chat.get_messages("tok").await;
    }
}
