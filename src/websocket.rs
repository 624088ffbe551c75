//! The WebSocket transport: URL/header construction and the read/write
//! split's message loop. Frames carry BSATN-encoded [`ServerMessage`]s and
//! [`ClientMessage`]s, each prefixed with a one-byte compression
//! discriminant, rather than protobuf.

use crate::bsatn;
use crate::identity::ConnectionId;
use crate::message::{ClientMessage, Compression, ServerMessage};
use anyhow::{bail, Result};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use futures_channel::mpsc;
use http::uri::{Parts, Uri};
use std::io::Read;
use tokio::{net::TcpStream, runtime, task::JoinHandle};
use tokio_tungstenite::{
    connect_async, tungstenite::client::IntoClientRequest, tungstenite::protocol::Message as WebSocketMessage,
    MaybeTlsStream, WebSocketStream,
};

pub(crate) struct DbConnection {
    pub(crate) read: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    pub(crate) write: SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WebSocketMessage>,
}

/// Which compression, if any, the core asks the server to use for frames it
/// sends us. The server may still choose `None` for small frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressionPreference {
    None,
    Brotli,
    Gzip,
}

impl CompressionPreference {
    fn as_query_value(self) -> &'static str {
        match self {
            CompressionPreference::None => "None",
            CompressionPreference::Brotli => "Brotli",
            CompressionPreference::Gzip => "Gzip",
        }
    }
}

fn make_uri<Host>(
    host: Host,
    module_name: &str,
    connection_id: ConnectionId,
    compression: CompressionPreference,
    light: bool,
) -> Result<Uri>
where
    Host: TryInto<Uri>,
    <Host as TryInto<Uri>>::Error: std::error::Error + Send + Sync + 'static,
{
    let host: Uri = host.try_into()?;
    let mut parts = Parts::try_from(host)?;
    match &parts.scheme {
        Some(s) => match s.as_str() {
            "ws" | "wss" => (),
            unknown_scheme => bail!("Unknown URI scheme {}", unknown_scheme),
        },
        None => parts.scheme = Some("ws".parse()?),
    }
    let mut path = if let Some(path_and_query) = &parts.path_and_query {
        if path_and_query.query().is_some() {
            bail!("Unexpected query in provided host URI");
        }
        path_and_query.path().to_string()
    } else {
        "/".to_string()
    };

    if !path.ends_with('/') {
        path.push('/');
    }
    path.push_str("v1/database/");
    path.push_str(module_name);
    path.push_str("/subscribe?connection_id=");
    path.push_str(&connection_id.to_hex());
    path.push_str("&compression=");
    path.push_str(compression.as_query_value());
    if light {
        path.push_str("&light=true");
    }
    parts.path_and_query = Some(path.parse()?);
    Ok(Uri::try_from(parts)?)
}

const PROTOCOL_HEADER_KEY: &str = "Sec-WebSocket-Protocol";
const PROTOCOL_HEADER_VALUE: &str = "v1.bsatn.spacetimedb";
const AUTH_HEADER_KEY: &str = "Authorization";

fn request_add_header(req: &mut http::Request<()>, key: &'static str, val: http::header::HeaderValue) {
    let _prev = req.headers_mut().insert(key, val);
    debug_assert!(_prev.is_none(), "HttpRequest already had {:?} header", key);
}

fn request_insert_protocol_header(req: &mut http::Request<()>) {
    request_add_header(req, PROTOCOL_HEADER_KEY, http::header::HeaderValue::from_static(PROTOCOL_HEADER_VALUE));
}

fn request_insert_auth_header(req: &mut http::Request<()>, token: Option<&str>) {
    if let Some(token) = token {
        let value = format!("Bearer {token}");
        if let Ok(header_value) = http::header::HeaderValue::try_from(value) {
            request_add_header(req, AUTH_HEADER_KEY, header_value);
        } else {
            log::error!("auth token is not a valid HTTP header value");
        }
    }
}

fn make_request<Host>(
    host: Host,
    module_name: &str,
    connection_id: ConnectionId,
    compression: CompressionPreference,
    light: bool,
    token: Option<&str>,
) -> Result<http::Request<()>>
where
    Host: TryInto<Uri>,
    <Host as TryInto<Uri>>::Error: std::error::Error + Send + Sync + 'static,
{
    let uri = make_uri(host, module_name, connection_id, compression, light)?;
    let mut req = IntoClientRequest::into_client_request(uri)?;
    request_insert_protocol_header(&mut req);
    request_insert_auth_header(&mut req, token);
    Ok(req)
}

pub(crate) fn decompress(compression: Compression, bytes: &[u8]) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(bytes.to_vec()),
        Compression::Brotli => {
            let mut out = Vec::new();
            brotli::Decompressor::new(bytes, 4096).read_to_end(&mut out)?;
            Ok(out)
        }
        Compression::Gzip => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(bytes).read_to_end(&mut out)?;
            Ok(out)
        }
    }
}

/// Decode one inbound binary WebSocket frame: strip the leading compression
/// byte, decompress the remainder if needed, then parse a `ServerMessage`.
pub(crate) fn decode_frame(frame: &[u8]) -> Result<ServerMessage> {
    let (compression, rest) = crate::message::peek_compression(frame)?;
    let decompressed = decompress(compression, rest)?;
    Ok(bsatn::from_slice(&decompressed)?)
}

/// Encode one outbound `ClientMessage` as an uncompressed binary frame
/// (the core never compresses its own outgoing traffic; only the server's
/// replies are potentially compressed).
pub(crate) fn encode_frame(msg: &ClientMessage) -> Vec<u8> {
    let mut out = vec![Compression::None as u8];
    out.extend(bsatn::to_vec(msg));
    out
}

impl DbConnection {
    pub(crate) async fn connect<Host>(
        host: Host,
        module_name: &str,
        connection_id: ConnectionId,
        compression: CompressionPreference,
        light: bool,
        token: Option<&str>,
    ) -> Result<Self>
    where
        Host: TryInto<Uri>,
        <Host as TryInto<Uri>>::Error: std::error::Error + Send + Sync + 'static,
    {
        let req = make_request(host, module_name, connection_id, compression, light, token)?;
        let (stream, _): (WebSocketStream<MaybeTlsStream<TcpStream>>, _) = connect_async(req).await?;
        let (write, read) = stream.split();
        Ok(DbConnection { write, read })
    }

    fn maybe_log_error<T, U: std::fmt::Debug>(cause: &str, res: std::result::Result<T, U>) {
        if let Err(e) = res {
            log::warn!("{}: {:?}", cause, e);
        }
    }

    async fn message_loop(
        mut self,
        incoming_messages: mpsc::UnboundedSender<ServerMessage>,
        mut outgoing_messages: mpsc::UnboundedReceiver<ClientMessage>,
    ) {
        loop {
            tokio::select! {
                Some(incoming) = self.read.next() => match incoming {
                    Err(e) => Self::maybe_log_error::<(), _>(
                        "Error reading message from read WebSocket stream",
                        Err(e),
                    ),

                    Ok(WebSocketMessage::Binary(bytes)) => {
                        crate::stats::METRICS.frames_received.inc();
                        crate::stats::METRICS.bytes_received.inc_by(bytes.len() as u64);
                        match decode_frame(&bytes) {
                            Err(e) => log::warn!("Error decoding inbound frame: {:?}", e),
                            Ok(msg) => Self::maybe_log_error(
                                "Error sending decoded message to incoming_messages queue",
                                incoming_messages.unbounded_send(msg),
                            ),
                        }
                    }

                    Ok(WebSocketMessage::Ping(payload)) => Self::maybe_log_error(
                        "Error sending Pong in response to Ping",
                        self.write.send(WebSocketMessage::Pong(payload)).await,
                    ),

                    Ok(other) => log::warn!("Unexpected WebSocket message {:?}", other),
                },

                Some(outgoing) = outgoing_messages.next() => {
                    let bytes = encode_frame(&outgoing);
                    crate::stats::METRICS.frames_sent.inc();
                    crate::stats::METRICS.bytes_sent.inc_by(bytes.len() as u64);
                    Self::maybe_log_error(
                        "Error sending outgoing message",
                        self.write.send(WebSocketMessage::Binary(bytes)).await,
                    );
                },
            }
        }
    }

    pub(crate) fn spawn_message_loop(
        self,
        runtime: &runtime::Handle,
    ) -> (
        JoinHandle<()>,
        mpsc::UnboundedReceiver<ServerMessage>,
        mpsc::UnboundedSender<ClientMessage>,
    ) {
        let (outgoing_send, outgoing_recv) = mpsc::unbounded();
        let (incoming_send, incoming_recv) = mpsc::unbounded();
        let handle = runtime.spawn(self.message_loop(incoming_send, outgoing_recv));
        (handle, incoming_recv, outgoing_send)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_uri_builds_expected_path_and_query() {
        let connection_id = ConnectionId([0xab; 16]);
        let uri = make_uri("ws://localhost:3000", "my_module", connection_id, CompressionPreference::Brotli, false).unwrap();
        let path_and_query = uri.path_and_query().unwrap().as_str();
        assert!(path_and_query.starts_with("/v1/database/my_module/subscribe?"));
        assert!(path_and_query.contains("connection_id=abababababababababababababababab"));
        assert!(path_and_query.contains("compression=Brotli"));
        assert!(!path_and_query.contains("light="));
    }

    #[test]
    fn make_uri_appends_light_flag() {
        let connection_id = ConnectionId([0; 16]);
        let uri = make_uri("ws://localhost:3000", "my_module", connection_id, CompressionPreference::None, true).unwrap();
        assert!(uri.path_and_query().unwrap().as_str().contains("light=true"));
    }

    #[test]
    fn make_uri_rejects_non_websocket_scheme() {
        let connection_id = ConnectionId([0; 16]);
        assert!(make_uri("http://localhost:3000", "my_module", connection_id, CompressionPreference::None, false).is_err());
    }

    #[test]
    fn frame_round_trips_through_encode_decode() {
        let msg = ClientMessage::OneOffQuery {
            message_id: Box::from(&b"abc"[..]),
            query: "SELECT * FROM report".into(),
        };
        let frame = encode_frame(&msg);
        let (compression, rest) = crate::message::peek_compression(&frame).unwrap();
        assert_eq!(compression, Compression::None);
        let decoded: ClientMessage = bsatn::from_slice(rest).unwrap();
        assert_eq!(decoded, msg);
    }
}
