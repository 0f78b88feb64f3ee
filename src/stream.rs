use crate::codec::FrameCodec;
use crate::dialect::Dialect;
use crate::error::Error;
use crate::extensions::FrameTransform;
use crate::frame::{Frame, OpCode};
use crate::message::Message;
use crate::transport::{TransportReader, TransportWriter};
use crate::write::FrameWriter;
use async_trait::async_trait;
use log::debug;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Close code for a normal closure.
pub const STATUS_NORMAL: u16 = 1000;
/// Close code sent when the peer violated the protocol.
pub const STATUS_PROTOCOL_ERROR: u16 = 1002;
/// Close code sent when a frame was recognisable but not acceptable.
pub const STATUS_UNSUPPORTED_DATA: u16 = 1003;

pub type PayloadHook = Box<dyn FnMut(&[u8]) + Send>;

/// The message-level interface a connection handler talks to. Implemented
/// by the physical stream and by logical multiplexed channels, so a handler
/// cannot tell whether it is running on its own socket.
#[async_trait]
pub trait MessageChannel: Send {
    /// Sends a message, or one fragment of one when `end` is false.
    async fn send_message(&mut self, message: Message, end: bool) -> Result<(), Error>;

    /// Returns the next complete message, or None once the closing
    /// handshake has finished.
    async fn receive_message(&mut self) -> Result<Option<Message>, Error>;

    async fn send_ping(&mut self, body: Vec<u8>) -> Result<(), Error>;

    async fn close_connection(&mut self) -> Result<(), Error>;

    fn client_terminated(&self) -> bool;

    fn server_terminated(&self) -> bool;

    fn close_code(&self) -> Option<u16> {
        None
    }

    fn close_reason(&self) -> Option<String> {
        None
    }

    /// Registers an application hook for peer pings. When present, the
    /// stream dispatches to it instead of answering with a pong.
    fn set_on_ping(&mut self, _hook: PayloadHook) {}

    /// Registers an application hook for matched pongs.
    fn set_on_pong(&mut self, _hook: PayloadHook) {}

    /// Puts a failure close on the wire if the dialect can express one and
    /// the closing handshake has not already started.
    async fn fail_connection(&mut self, _code: u16, _reason: &str) -> Result<(), Error> {
        Ok(())
    }

    /// The shared frame writer, for layers that add their own framing on
    /// top of the physical connection. Only the physical stream has one.
    fn writer_handle(&self) -> Option<Arc<Mutex<FrameWriter>>> {
        None
    }
}

/// Tracks which opcode opens a fragmented send so the follow-up fragments
/// are emitted as continuations.
#[derive(Debug, Default)]
pub(crate) struct FragmentBuilder {
    started: bool,
}

impl FragmentBuilder {
    pub(crate) fn build(&mut self, opcode: OpCode, payload: Vec<u8>, end: bool) -> Frame {
        let opcode = if self.started {
            OpCode::Continuation
        } else {
            opcode
        };
        self.started = !end;
        Frame::data(opcode, payload, end)
    }
}

/// One dialect's stream of messages over a transport.
///
/// Owns the read half exclusively; the write half sits behind a mutex
/// because the receive path needs it for pongs and close acknowledgements
/// while the application sends data.
pub struct MessageStream {
    dialect: Dialect,
    codec: FrameCodec,
    reader: TransportReader,
    writer: Arc<Mutex<FrameWriter>>,

    // receive state
    fragments: Vec<u8>,
    fragment_opcode: Option<OpCode>,
    ping_queue: VecDeque<Vec<u8>>,
    rsv_allowed: u8,
    transform: Option<Box<dyn FrameTransform + Send>>,

    // lifecycle
    client_terminated: bool,
    server_terminated: bool,
    close_code: Option<u16>,
    close_reason: Option<String>,

    // send state
    builder: FragmentBuilder,

    on_ping: Option<PayloadHook>,
    on_pong: Option<PayloadHook>,
}

impl MessageStream {
    pub fn new(dialect: Dialect, reader: TransportReader, writer: TransportWriter) -> Self {
        let codec = FrameCodec::new(dialect);
        let writer = Arc::new(Mutex::new(FrameWriter::new(writer, codec)));
        Self::from_shared_writer(dialect, reader, writer)
    }

    pub fn from_shared_writer(
        dialect: Dialect,
        reader: TransportReader,
        writer: Arc<Mutex<FrameWriter>>,
    ) -> Self {
        Self {
            dialect,
            codec: FrameCodec::new(dialect),
            reader,
            writer,
            fragments: Vec::new(),
            fragment_opcode: None,
            ping_queue: VecDeque::new(),
            rsv_allowed: 0,
            transform: None,
            client_terminated: false,
            server_terminated: false,
            close_code: None,
            close_reason: None,
            builder: FragmentBuilder::default(),
            on_ping: None,
            on_pong: None,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Shared handle to the write half, used by the queue facades and the
    /// multiplexing layer.
    pub fn writer_handle(&self) -> Arc<Mutex<FrameWriter>> {
        Arc::clone(&self.writer)
    }

    /// Marks reserved bits claimed by negotiated extensions so the receive
    /// path stops treating them as violations. `mask` has rsv1 as its
    /// highest of four bits.
    pub fn allow_reserved_bits(&mut self, mask: u8) {
        self.rsv_allowed = mask;
    }

    pub fn set_transform(&mut self, transform: Box<dyn FrameTransform + Send>) {
        self.transform = Some(transform);
    }

    pub fn pending_pings(&self) -> usize {
        self.ping_queue.len()
    }

    /// Adds the current receive state to a frame error so the log line
    /// tells where in the message the stream was.
    fn annotate(&self, error: Error) -> Error {
        let state = match self.fragment_opcode {
            Some(opcode) => format!("while assembling a fragmented {:?} message", opcode),
            None => return error,
        };
        match error {
            Error::InvalidFrame(msg) => Error::InvalidFrame(format!("{} ({})", msg, state)),
            Error::UnsupportedFrame(msg) => Error::UnsupportedFrame(format!("{} ({})", msg, state)),
            other => other,
        }
    }

    async fn send_close_frame(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        self.server_terminated = true;
        if self.dialect.is_legacy_framing() {
            self.writer.lock().await.write_legacy_close().await
        } else {
            self.writer
                .lock()
                .await
                .write_frame(&Frame::close(payload))
                .await
        }
    }

    fn close_payload(&self, code: u16, reason: &str) -> Vec<u8> {
        if !self.dialect.close_has_status_code() {
            return Vec::new();
        }
        let mut payload = code.to_be_bytes().to_vec();
        payload.extend_from_slice(reason.as_bytes());
        payload
    }

    /// Sends a close describing a protocol failure, if the dialect can
    /// express one and the closing handshake is not already under way.
    pub async fn fail_connection(&mut self, code: u16, reason: &str) -> Result<(), Error> {
        if self.server_terminated {
            return Ok(());
        }
        if !self.dialect.has_closing_handshake() {
            self.server_terminated = true;
            return Ok(());
        }
        let payload = self.close_payload(code, reason);
        self.send_close_frame(payload).await
    }

    async fn receive_message_hybi(&mut self) -> Result<Option<Message>, Error> {
        loop {
            let frame = match self.codec.read_frame(&mut self.reader).await {
                Ok(frame) => frame,
                Err(error) => return Err(self.annotate(error)),
            };

            if frame.reserved_bits() & !self.rsv_allowed != 0 {
                return Err(self.annotate(Error::UnsupportedFrame(format!(
                    "unsupported reserved bit is set (rsv = {:04b})",
                    frame.reserved_bits()
                ))));
            }

            let (opcode, payload) = match frame.opcode {
                OpCode::Continuation => {
                    if self.fragment_opcode.is_none() {
                        return Err(Error::InvalidFrame(if frame.fin {
                            "termination frame received but fragmentation not started".to_string()
                        } else {
                            "intermediate frame received but fragmentation not started".to_string()
                        }));
                    }
                    self.fragments.extend_from_slice(&frame.payload);
                    if !frame.fin {
                        continue;
                    }
                    let opcode = self.fragment_opcode.take().expect("checked above");
                    (opcode, std::mem::take(&mut self.fragments))
                }
                opcode => {
                    if self.fragment_opcode.is_some() {
                        return Err(self.annotate(Error::InvalidFrame(
                            "new frame received without terminating existing fragmentation"
                                .to_string(),
                        )));
                    }
                    if !frame.fin {
                        if opcode.is_control() {
                            return Err(Error::InvalidFrame(
                                "control frames must not be fragmented".to_string(),
                            ));
                        }
                        self.fragment_opcode = Some(opcode);
                        self.fragments = frame.payload;
                        continue;
                    }
                    (opcode, frame.payload)
                }
            };

            match opcode {
                OpCode::Text | OpCode::Binary => {
                    let payload = match self.transform.as_mut() {
                        Some(transform) => transform.decode(payload),
                        None => payload,
                    };
                    return Ok(Some(Message::from_payload(opcode, payload)));
                }
                OpCode::Close => {
                    self.client_terminated = true;
                    if self.dialect.close_has_status_code() {
                        match payload.len() {
                            0 => {}
                            1 => {
                                return Err(Error::InvalidFrame(
                                    "close frame with a 1-byte payload".to_string(),
                                ))
                            }
                            _ => {
                                self.close_code =
                                    Some(u16::from_be_bytes([payload[0], payload[1]]));
                                self.close_reason =
                                    Some(String::from_utf8_lossy(&payload[2..]).into_owned());
                            }
                        }
                    }
                    if self.server_terminated {
                        debug!("received ack for server-initiated closing handshake");
                        return Ok(None);
                    }
                    debug!("received client-initiated closing handshake");
                    let reply = match self.close_code {
                        Some(code) => self.close_payload(code, ""),
                        None => Vec::new(),
                    };
                    self.send_close_frame(reply).await?;
                    debug!("sent ack for client-initiated closing handshake");
                    return Ok(None);
                }
                OpCode::Ping => {
                    if let Some(hook) = self.on_ping.as_mut() {
                        hook(&payload);
                        continue;
                    }
                    let pong = Frame::pong(payload);
                    self.writer.lock().await.write_frame(&pong).await?;
                }
                OpCode::Pong => {
                    let expected = self.ping_queue.pop_front().ok_or_else(|| {
                        Error::InvalidFrame("no ping waiting for pong on our queue".to_string())
                    })?;
                    if expected != payload {
                        return Err(Error::InvalidFrame(
                            "pong contained a body different from our ping's".to_string(),
                        ));
                    }
                    if let Some(hook) = self.on_pong.as_mut() {
                        hook(&payload);
                    }
                }
                OpCode::Continuation => unreachable!("continuations are resolved above"),
            }
        }
    }

    async fn receive_message_legacy(&mut self) -> Result<Option<Message>, Error> {
        loop {
            let frame = self.codec.read_legacy_frame(&mut self.reader).await?;
            if frame.frame_type & 0x80 != 0 {
                // Hixie-75 has no closing handshake; every length-specified
                // frame is read and dropped.
                if self.dialect == Dialect::Hixie75 {
                    continue;
                }
                if frame.is_close() {
                    self.client_terminated = true;
                    if self.server_terminated {
                        debug!("received ack for server-initiated closing handshake");
                        return Ok(None);
                    }
                    debug!("received client-initiated closing handshake");
                    self.send_close_frame(Vec::new()).await?;
                    debug!("sent ack for client-initiated closing handshake");
                    return Ok(None);
                }
                continue;
            }
            // Only type 0x00 is delivered; other delimited types are
            // decoded and discarded.
            if frame.frame_type == 0x00 {
                return Ok(Some(Message::Text(
                    String::from_utf8_lossy(&frame.payload).into_owned(),
                )));
            }
        }
    }
}

#[async_trait]
impl MessageChannel for MessageStream {
    async fn send_message(&mut self, message: Message, end: bool) -> Result<(), Error> {
        if self.server_terminated {
            return Err(Error::BadOperation(
                "send_message requested after sending out a closing handshake",
            ));
        }
        if self.dialect.is_legacy_framing() {
            if !end {
                return Err(Error::BadOperation(
                    "fragmented messages are not supported by this dialect",
                ));
            }
            if matches!(message, Message::Binary(_)) {
                return Err(Error::BadOperation(
                    "binary messages are not supported by this dialect",
                ));
            }
            let payload = message.into_payload();
            return self.writer.lock().await.write_legacy_text(&payload).await;
        }

        let opcode = message.opcode();
        let mut payload = message.into_payload();
        if let Some(transform) = self.transform.as_mut() {
            payload = transform.encode(payload);
        }
        let frame = self.builder.build(opcode, payload, end);
        self.writer.lock().await.write_frame(&frame).await
    }

    async fn receive_message(&mut self) -> Result<Option<Message>, Error> {
        if self.client_terminated {
            return Err(Error::BadOperation(
                "receive_message requested after receiving a closing handshake",
            ));
        }
        if self.dialect.is_legacy_framing() {
            self.receive_message_legacy().await
        } else {
            self.receive_message_hybi().await
        }
    }

    async fn send_ping(&mut self, body: Vec<u8>) -> Result<(), Error> {
        if self.dialect.is_legacy_framing() {
            return Err(Error::BadOperation(
                "ping frames are not supported by this dialect",
            ));
        }
        self.writer
            .lock()
            .await
            .write_frame(&Frame::ping(body.clone()))
            .await?;
        self.ping_queue.push_back(body);
        Ok(())
    }

    async fn close_connection(&mut self) -> Result<(), Error> {
        if self.server_terminated {
            debug!("close_connection requested but the connection is already terminated");
            return Ok(());
        }
        if !self.dialect.has_closing_handshake() {
            self.server_terminated = true;
            debug!("connection closed");
            return Ok(());
        }

        let payload = self.close_payload(STATUS_NORMAL, "");
        self.send_close_frame(payload).await?;
        debug!("sent server-initiated closing handshake");

        // The peer is expected to acknowledge right away; anything else is
        // treated as a dead connection.
        let message = self.receive_message().await?;
        if message.is_some() {
            return Err(Error::ConnectionTerminated(
                "didn't receive valid ack for closing handshake".to_string(),
            ));
        }
        Ok(())
    }

    fn client_terminated(&self) -> bool {
        self.client_terminated
    }

    fn server_terminated(&self) -> bool {
        self.server_terminated
    }

    fn close_code(&self) -> Option<u16> {
        self.close_code
    }

    fn close_reason(&self) -> Option<String> {
        self.close_reason.clone()
    }

    fn set_on_ping(&mut self, hook: PayloadHook) {
        self.on_ping = Some(hook);
    }

    fn set_on_pong(&mut self, hook: PayloadHook) {
        self.on_pong = Some(hook);
    }

    async fn fail_connection(&mut self, code: u16, reason: &str) -> Result<(), Error> {
        MessageStream::fail_connection(self, code, reason).await
    }

    fn writer_handle(&self) -> Option<Arc<Mutex<FrameWriter>>> {
        Some(MessageStream::writer_handle(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn stream_pair(dialect: Dialect) -> (MessageStream, DuplexStream) {
        let (client, server) = tokio::io::duplex(1 << 16);
        let (reader, writer) = transport::split(Box::new(server), "test");
        (MessageStream::new(dialect, reader, writer), client)
    }

    #[tokio::test]
    async fn fragmented_message_reassembles() {
        let (mut stream, mut client) = stream_pair(Dialect::HyBiLatest);
        client
            .write_all(&[
                0x01, 0x03, b'a', b'b', b'c', 0x00, 0x02, b'd', b'e', 0x80, 0x01, b'f',
            ])
            .await
            .unwrap();

        let message = stream.receive_message().await.unwrap();
        assert_eq!(message, Some(Message::Text("abcdef".to_string())));
    }

    #[tokio::test]
    async fn continuation_without_start_is_invalid() {
        let (mut stream, mut client) = stream_pair(Dialect::HyBiLatest);
        client.write_all(&[0x80, 0x01, b'x']).await.unwrap();

        match stream.receive_message().await {
            Err(Error::InvalidFrame(_)) => {}
            other => panic!("expected InvalidFrame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn new_frame_mid_fragmentation_is_invalid() {
        let (mut stream, mut client) = stream_pair(Dialect::HyBiLatest);
        client
            .write_all(&[0x01, 0x01, b'a', 0x81, 0x01, b'b'])
            .await
            .unwrap();

        match stream.receive_message().await {
            Err(Error::InvalidFrame(msg)) => {
                assert!(msg.contains("fragmented"), "missing state annotation: {}", msg)
            }
            other => panic!("expected InvalidFrame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn fragmented_control_frame_is_invalid() {
        let (mut stream, mut client) = stream_pair(Dialect::HyBiLatest);
        client.write_all(&[0x09, 0x01, b'p']).await.unwrap();

        match stream.receive_message().await {
            Err(Error::InvalidFrame(_)) => {}
            other => panic!("expected InvalidFrame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn reserved_bit_is_unsupported_but_recoverable() {
        let (mut stream, mut client) = stream_pair(Dialect::HyBiLatest);
        client
            .write_all(&[0xc1, 0x01, b'x', 0x81, 0x02, b'o', b'k'])
            .await
            .unwrap();

        let error = stream.receive_message().await.unwrap_err();
        assert!(error.is_recoverable(), "rsv violation should be skippable");
        let message = stream.receive_message().await.unwrap();
        assert_eq!(message, Some(Message::Text("ok".to_string())));
    }

    #[tokio::test]
    async fn negotiated_rsv_bit_is_masked_out() {
        let (mut stream, mut client) = stream_pair(Dialect::HyBiLatest);
        stream.allow_reserved_bits(0b1000);
        client.write_all(&[0xc1, 0x01, b'x']).await.unwrap();

        let message = stream.receive_message().await.unwrap();
        assert_eq!(message, Some(Message::Text("x".to_string())));
    }

    #[tokio::test]
    async fn unsolicited_pong_is_invalid() {
        let (mut stream, mut client) = stream_pair(Dialect::HyBiLatest);
        client.write_all(&[0x8a, 0x01, b'A']).await.unwrap();

        match stream.receive_message().await {
            Err(Error::InvalidFrame(_)) => {}
            other => panic!("expected InvalidFrame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn pong_out_of_order_is_invalid() {
        let (mut stream, mut client) = stream_pair(Dialect::HyBiLatest);
        stream.send_ping(b"A".to_vec()).await.unwrap();
        stream.send_ping(b"B".to_vec()).await.unwrap();
        client.write_all(&[0x8a, 0x01, b'B']).await.unwrap();

        match stream.receive_message().await {
            Err(Error::InvalidFrame(_)) => {}
            other => panic!("expected InvalidFrame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn pongs_in_order_drain_the_queue() {
        let (mut stream, mut client) = stream_pair(Dialect::HyBiLatest);
        stream.send_ping(b"A".to_vec()).await.unwrap();
        stream.send_ping(b"B".to_vec()).await.unwrap();
        assert_eq!(stream.pending_pings(), 2);

        client
            .write_all(&[0x8a, 0x01, b'A', 0x8a, 0x01, b'B', 0x81, 0x01, b'm'])
            .await
            .unwrap();

        let message = stream.receive_message().await.unwrap();
        assert_eq!(message, Some(Message::Text("m".to_string())));
        assert_eq!(stream.pending_pings(), 0);
    }

    #[tokio::test]
    async fn peer_ping_gets_identical_pong() {
        let (mut stream, mut client) = stream_pair(Dialect::HyBiLatest);
        client
            .write_all(&[0x89, 0x02, b'h', b'i', 0x81, 0x01, b'm'])
            .await
            .unwrap();

        let message = stream.receive_message().await.unwrap();
        assert_eq!(message, Some(Message::Text("m".to_string())));

        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x8a, 0x02, b'h', b'i']);
    }

    #[tokio::test]
    async fn ping_hook_suppresses_auto_pong() {
        let (mut stream, mut client) = stream_pair(Dialect::HyBiLatest);
        let (tx, rx) = std::sync::mpsc::channel();
        stream.set_on_ping(Box::new(move |payload| {
            tx.send(payload.to_vec()).unwrap();
        }));
        client
            .write_all(&[0x89, 0x01, b'p', 0x81, 0x01, b'm'])
            .await
            .unwrap();

        let message = stream.receive_message().await.unwrap();
        assert_eq!(message, Some(Message::Text("m".to_string())));
        assert_eq!(rx.try_recv().unwrap(), b"p");

        // Nothing but our own frames should have been written.
        stream.send_ping(Vec::new()).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x89, 0x00]);
    }

    #[tokio::test]
    async fn server_initiated_close_handshake() {
        let (mut stream, mut client) = stream_pair(Dialect::HyBiLatest);
        client.write_all(&[0x88, 0x02, 0x03, 0xe8]).await.unwrap();

        stream.close_connection().await.unwrap();
        assert!(stream.server_terminated());
        assert!(stream.client_terminated());

        let mut sent = [0u8; 4];
        client.read_exact(&mut sent).await.unwrap();
        assert_eq!(sent, [0x88, 0x02, 0x03, 0xe8]);
    }

    #[tokio::test]
    async fn client_initiated_close_is_acknowledged() {
        let (mut stream, mut client) = stream_pair(Dialect::HyBiLatest);
        client
            .write_all(&[0x88, 0x06, 0x03, 0xe9, b'b', b'y', b'e', b'!'])
            .await
            .unwrap();

        let message = stream.receive_message().await.unwrap();
        assert_eq!(message, None);
        assert!(stream.client_terminated());
        assert!(stream.server_terminated());
        assert_eq!(stream.close_code(), Some(1001));
        assert_eq!(stream.close_reason().as_deref(), Some("bye!"));
    }

    #[tokio::test]
    async fn close_with_one_byte_body_is_invalid() {
        let (mut stream, mut client) = stream_pair(Dialect::HyBiLatest);
        client.write_all(&[0x88, 0x01, 0x03]).await.unwrap();

        match stream.receive_message().await {
            Err(Error::InvalidFrame(_)) => {}
            other => panic!("expected InvalidFrame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn close_with_empty_body_is_accepted() {
        let (mut stream, mut client) = stream_pair(Dialect::HyBiLatest);
        client.write_all(&[0x88, 0x00]).await.unwrap();

        let message = stream.receive_message().await.unwrap();
        assert_eq!(message, None);
        assert_eq!(stream.close_code(), None);
    }

    #[tokio::test]
    async fn send_after_close_is_bad_operation() {
        let (mut stream, mut client) = stream_pair(Dialect::HyBiLatest);
        client.write_all(&[0x88, 0x02, 0x03, 0xe8]).await.unwrap();
        stream.close_connection().await.unwrap();

        match stream
            .send_message(Message::Text("late".to_string()), true)
            .await
        {
            Err(Error::BadOperation(_)) => {}
            other => panic!("expected BadOperation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced() {
        let (mut stream, mut client) = stream_pair(Dialect::HyBiLatest);
        client
            .write_all(&[0x81, 0x03, 0xed, 0xa0, 0x80])
            .await
            .unwrap();

        let message = stream.receive_message().await.unwrap().unwrap();
        assert_eq!(
            message.as_text().unwrap(),
            "\u{fffd}\u{fffd}\u{fffd}"
        );
    }

    #[tokio::test]
    async fn fragmented_send_uses_continuations() {
        let (mut stream, mut client) = stream_pair(Dialect::HyBiLatest);
        stream
            .send_message(Message::Text("ab".to_string()), false)
            .await
            .unwrap();
        stream
            .send_message(Message::Text("cd".to_string()), false)
            .await
            .unwrap();
        stream
            .send_message(Message::Text("e".to_string()), true)
            .await
            .unwrap();

        let mut wire = [0u8; 11];
        client.read_exact(&mut wire).await.unwrap();
        assert_eq!(
            wire,
            [0x01, 0x02, b'a', b'b', 0x00, 0x02, b'c', b'd', 0x80, 0x01, b'e']
        );
    }

    #[tokio::test]
    async fn legacy_text_round_trip() {
        let (mut stream, mut client) = stream_pair(Dialect::HyBi00);
        client
            .write_all(&[0x00, b'h', b'i', 0xff])
            .await
            .unwrap();

        let message = stream.receive_message().await.unwrap();
        assert_eq!(message, Some(Message::Text("hi".to_string())));

        stream
            .send_message(Message::Text("yo".to_string()), true)
            .await
            .unwrap();
        let mut wire = [0u8; 4];
        client.read_exact(&mut wire).await.unwrap();
        assert_eq!(wire, [0x00, b'y', b'o', 0xff]);
    }

    #[tokio::test]
    async fn legacy_close_handshake() {
        let (mut stream, mut client) = stream_pair(Dialect::HyBi00);
        client.write_all(&[0xff, 0x00]).await.unwrap();

        let message = stream.receive_message().await.unwrap();
        assert_eq!(message, None);
        assert!(stream.client_terminated());
        assert!(stream.server_terminated());

        let mut wire = [0u8; 2];
        client.read_exact(&mut wire).await.unwrap();
        assert_eq!(wire, [0xff, 0x00]);
    }

    #[tokio::test]
    async fn legacy_rejects_fragments_pings_and_binary() {
        let (mut stream, _client) = stream_pair(Dialect::HyBi00);
        assert!(matches!(
            stream
                .send_message(Message::Text("a".to_string()), false)
                .await,
            Err(Error::BadOperation(_))
        ));
        assert!(matches!(
            stream.send_message(Message::Binary(vec![1]), true).await,
            Err(Error::BadOperation(_))
        ));
        assert!(matches!(
            stream.send_ping(Vec::new()).await,
            Err(Error::BadOperation(_))
        ));
    }

    #[tokio::test]
    async fn hixie75_close_sets_flag_without_wire_traffic() {
        let (mut stream, _client) = stream_pair(Dialect::Hixie75);
        stream.close_connection().await.unwrap();
        assert!(stream.server_terminated());
    }

    #[tokio::test]
    async fn hybi06_send_is_masked_with_connection_key() {
        let (mut stream, mut client) = stream_pair(Dialect::HyBi06);
        let key = vec![0x10, 0x20, 0x30, 0x40, 0x50];
        stream
            .writer_handle()
            .lock()
            .await
            .set_send_masker(key.clone());

        stream
            .send_message(Message::Text("ab".to_string()), true)
            .await
            .unwrap();
        stream
            .send_message(Message::Text("cd".to_string()), true)
            .await
            .unwrap();

        let mut wire = [0u8; 8];
        client.read_exact(&mut wire).await.unwrap();

        // One masker, cycle position carried across both frames.
        let mut masker = crate::mask::RepeatedXorMasker::new(key);
        let clear = masker.mask(&wire);
        assert_eq!(clear, [0x84, 0x02, b'a', b'b', 0x84, 0x02, b'c', b'd']);
    }
}
