//! End-to-end conversations over in-memory transports, driving the full
//! accept path the way a real client would.

use crate::codec::FrameCodec;
use crate::config::ServerConfig;
use crate::context::ConnectionContext;
use crate::dialect::Dialect;
use crate::error::Error;
use crate::frame::{Frame, OpCode};
use crate::handshake::compute_masking_key;
use crate::mask::RepeatedXorMasker;
use crate::server::{handle_connection, ResourceHandler, Router};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

struct EchoHandler;

#[async_trait]
impl ResourceHandler for EchoHandler {
    async fn on_data(&self, context: &mut ConnectionContext) -> Result<(), Error> {
        while let Some(message) = context.stream().receive_message().await? {
            context.stream().send_message(message, true).await?;
        }
        Ok(())
    }
}

struct ChatHandler;

#[async_trait]
impl ResourceHandler for ChatHandler {
    fn on_open(&self, context: &mut ConnectionContext) -> Result<(), Error> {
        context.selected_subprotocol = context
            .requested_subprotocols
            .as_ref()
            .and_then(|offered| offered.iter().find(|p| p.as_str() == "chat").cloned());
        Ok(())
    }

    async fn on_data(&self, context: &mut ConnectionContext) -> Result<(), Error> {
        while context.stream().receive_message().await?.is_some() {}
        Ok(())
    }
}

fn test_router() -> Arc<Router> {
    let mut router = Router::new();
    router.add("/echo", EchoHandler);
    router.add("/chat", ChatHandler);
    Arc::new(router)
}

fn connect(config: ServerConfig) -> DuplexStream {
    let (client, server) = tokio::io::duplex(1 << 16);
    tokio::spawn(handle_connection(
        Box::new(server),
        "peer".to_string(),
        80,
        config,
        test_router(),
    ));
    client
}

async fn read_response_head(client: &mut DuplexStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        client.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

fn header_value(head: &str, name: &str) -> Option<String> {
    head.lines().find_map(|line| {
        line.split_once(": ")
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.to_string())
    })
}

/// Reads one unmasked server frame: (first byte, payload).
async fn read_frame(client: &mut DuplexStream) -> (u8, Vec<u8>) {
    let mut header = [0u8; 2];
    client.read_exact(&mut header).await.unwrap();
    assert_eq!(header[1] & 0x80, 0, "server frames are unmasked");
    let mut length = (header[1] & 0x7f) as usize;
    if length == 126 {
        let mut bytes = [0u8; 2];
        client.read_exact(&mut bytes).await.unwrap();
        length = u16::from_be_bytes(bytes) as usize;
    } else if length == 127 {
        let mut bytes = [0u8; 8];
        client.read_exact(&mut bytes).await.unwrap();
        length = u64::from_be_bytes(bytes) as usize;
    }
    let mut payload = vec![0u8; length];
    client.read_exact(&mut payload).await.unwrap();
    (header[0], payload)
}

fn wrap_binary(payload: Vec<u8>) -> Vec<u8> {
    FrameCodec::new(Dialect::HyBiLatest)
        .encode(&Frame::data(OpCode::Binary, payload, true))
        .unwrap()
}

const HYBI_LATEST_REQUEST: &[u8] = b"GET /echo HTTP/1.1\r\n\
Host: server.example.com\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Sec-WebSocket-Version: 13\r\n\
Origin: http://example.com\r\n\
\r\n";

#[tokio::test]
async fn hybi_latest_echo_conversation() {
    let mut client = connect(ServerConfig::default());
    client.write_all(HYBI_LATEST_REQUEST).await.unwrap();

    let head = read_response_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert_eq!(
        header_value(&head, "Sec-WebSocket-Accept").as_deref(),
        Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
    );
    assert_eq!(header_value(&head, "Upgrade").as_deref(), Some("websocket"));

    // Masked text frame "test", mask ABCD.
    client
        .write_all(&[0x81, 0x84, 0x41, 0x42, 0x43, 0x44, 0x35, 0x27, 0x30, 0x30])
        .await
        .unwrap();

    let mut echo = [0u8; 6];
    client.read_exact(&mut echo).await.unwrap();
    assert_eq!(echo, [0x81, 0x04, 0x74, 0x65, 0x73, 0x74]);

    // Closing handshake, status 1000.
    client.write_all(&[0x88, 0x02, 0x03, 0xe8]).await.unwrap();
    let (first, payload) = read_frame(&mut client).await;
    assert_eq!(first, 0x88);
    assert_eq!(payload, vec![0x03, 0xe8]);
}

#[tokio::test]
async fn hybi00_challenge_and_echo() {
    let mut client = connect(ServerConfig::default());
    let request = b"GET /echo HTTP/1.1\r\n\
Host: example.com\r\n\
Upgrade: WebSocket\r\n\
Connection: Upgrade\r\n\
Origin: http://example.com\r\n\
Sec-WebSocket-Key1: 18x 6]8vM;54 *(5:  {   U1]8  z [  8\r\n\
Sec-WebSocket-Key2: 1_ tx7X d  <  nw  334J702) 7]o}` 0\r\n\
\r\nTm[K T2u";
    client.write_all(request).await.unwrap();

    let head = read_response_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 101 Web Socket Protocol Handshake\r\n"));
    assert_eq!(
        header_value(&head, "Sec-WebSocket-Origin").as_deref(),
        Some("http://example.com")
    );
    assert_eq!(
        header_value(&head, "Sec-WebSocket-Location").as_deref(),
        Some("ws://example.com/echo")
    );

    let mut digest = [0u8; 16];
    client.read_exact(&mut digest).await.unwrap();
    assert_eq!(&digest, b"fQJ,fN/4F4!~K~MH");

    client.write_all(&[0x00, b'h', b'i', 0xff]).await.unwrap();
    let mut echo = [0u8; 4];
    client.read_exact(&mut echo).await.unwrap();
    assert_eq!(echo, [0x00, b'h', b'i', 0xff]);

    // Closing handshake is the 0xFF 0x00 pair in both directions.
    client.write_all(&[0xff, 0x00]).await.unwrap();
    let mut close = [0u8; 2];
    client.read_exact(&mut close).await.unwrap();
    assert_eq!(close, [0xff, 0x00]);
}

#[tokio::test]
async fn hybi06_masked_conversation() {
    let mut client = connect(ServerConfig::default());
    let request = b"GET /echo HTTP/1.1\r\n\
Host: example.com\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Sec-WebSocket-Version: 5\r\n\
Sec-WebSocket-Origin: http://example.com\r\n\
\r\n";
    client.write_all(request).await.unwrap();

    let head = read_response_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert_eq!(
        header_value(&head, "Sec-WebSocket-Accept").as_deref(),
        Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
    );
    let nonce = header_value(&head, "Sec-WebSocket-Nonce").expect("nonce header");
    let masking_key = compute_masking_key("dGhlIHNhbXBsZSBub25jZQ==", &nonce);

    // Client frame: 4-byte nonce, then the whole frame XORed with it.
    // Text opcode is 0x4 in this dialect.
    let frame_nonce = [0x11u8, 0x22, 0x33, 0x44];
    let mut masker = RepeatedXorMasker::new(frame_nonce.to_vec());
    let mut wire = frame_nonce.to_vec();
    wire.extend(masker.mask(&[0x84, 0x04, b't', b'e', b's', b't']));
    client.write_all(&wire).await.unwrap();

    // The echo comes back masked with the connection-scoped key.
    let mut echoed = [0u8; 6];
    client.read_exact(&mut echoed).await.unwrap();
    let mut unmasker = RepeatedXorMasker::new(masking_key);
    let clear = unmasker.mask(&echoed);
    assert_eq!(clear, [0x84, 0x04, b't', b'e', b's', b't']);
}

#[tokio::test]
async fn hixie75_disabled_by_default() {
    let mut client = connect(ServerConfig::default());
    let request = b"GET /echo HTTP/1.1\r\n\
Host: example.com\r\n\
Upgrade: WebSocket\r\n\
Connection: Upgrade\r\n\
Origin: http://example.com\r\n\
\r\n";
    client.write_all(request).await.unwrap();

    let head = read_response_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
}

#[tokio::test]
async fn hixie75_when_enabled() {
    let config = ServerConfig {
        allow_hixie75: true,
        ..Default::default()
    };
    let mut client = connect(config);
    let request = b"GET /echo HTTP/1.1\r\n\
Host: example.com\r\n\
Upgrade: WebSocket\r\n\
Connection: Upgrade\r\n\
Origin: http://example.com\r\n\
\r\n";
    client.write_all(request).await.unwrap();

    let head = read_response_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 101 Web Socket Protocol Handshake\r\n"));
    assert_eq!(
        header_value(&head, "WebSocket-Origin").as_deref(),
        Some("http://example.com")
    );
    assert_eq!(
        header_value(&head, "WebSocket-Location").as_deref(),
        Some("ws://example.com/echo")
    );

    client.write_all(&[0x00, b'y', b'o', 0xff]).await.unwrap();
    let mut echo = [0u8; 4];
    client.read_exact(&mut echo).await.unwrap();
    assert_eq!(echo, [0x00, b'y', b'o', 0xff]);
}

#[tokio::test]
async fn unknown_resource_is_rejected() {
    let mut client = connect(ServerConfig::default());
    let request = b"GET /nope HTTP/1.1\r\n\
Host: example.com\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Sec-WebSocket-Version: 13\r\n\
\r\n";
    client.write_all(request).await.unwrap();

    let head = read_response_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
}

#[tokio::test]
async fn subprotocol_selection_is_echoed() {
    let mut client = connect(ServerConfig::default());
    let request = b"GET /chat HTTP/1.1\r\n\
Host: example.com\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Sec-WebSocket-Version: 13\r\n\
Sec-WebSocket-Protocol: superchat, chat\r\n\
\r\n";
    client.write_all(request).await.unwrap();

    let head = read_response_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert_eq!(
        header_value(&head, "Sec-WebSocket-Protocol").as_deref(),
        Some("chat")
    );
}

#[tokio::test]
async fn mux_channel_add_and_echo() {
    let mut client = connect(ServerConfig::default());
    let request = b"GET /echo HTTP/1.1\r\n\
Host: server.example.com\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Sec-WebSocket-Version: 13\r\n\
Sec-WebSocket-Extensions: mux\r\n\
\r\n";
    client.write_all(request).await.unwrap();

    let head = read_response_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert_eq!(
        header_value(&head, "Sec-WebSocket-Extensions").as_deref(),
        Some("mux")
    );

    // AddChannelRequest for channel 2: control channel id, objective
    // channel id, opcode 0 with a 1-byte length field, encoded handshake.
    let embedded: &[u8] = b"GET /echo HTTP/1.1\r\n\
Host: server.example.com\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Sec-WebSocket-Version: 13\r\n\
\r\n";
    let mut payload = vec![0x00, 0x02, 0x00, embedded.len() as u8];
    payload.extend_from_slice(embedded);
    client.write_all(&wrap_binary(payload)).await.unwrap();

    // AddChannelResponse: accepted, identity encoding, echoed handshake.
    let (first, payload) = read_frame(&mut client).await;
    assert_eq!(first, 0x82);
    assert_eq!(&payload[..3], &[0x00, 0x02, 0x20]);
    let handshake_len = payload[3] as usize;
    let response_text = String::from_utf8(payload[4..4 + handshake_len].to_vec()).unwrap();
    assert!(response_text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(response_text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

    // Data on channel 2 reaches the /echo handler and comes back on the
    // same channel: channel id, then fin|text and the bytes.
    let mut data = vec![0x02, 0x81];
    data.extend_from_slice(b"test");
    client.write_all(&wrap_binary(data)).await.unwrap();

    let (first, payload) = read_frame(&mut client).await;
    assert_eq!(first, 0x82);
    assert_eq!(payload, [0x02, 0x81, b't', b'e', b's', b't']);
}
