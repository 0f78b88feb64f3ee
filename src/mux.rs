//! Multiplexing extension: many logical channels over one physical
//! connection, carried as binary frames whose payloads hold channel ids,
//! control blocks and reframed data.
//!
//! Channel 0 is the control channel. Channel 1 is created automatically at
//! handshake time for the handler of the physical resource; every other
//! channel is created by AddChannelRequest and destroyed by DropChannel.

use crate::codec::FrameCodec;
use crate::config::ServerConfig;
use crate::context::ConnectionContext;
use crate::dialect::Dialect;
use crate::error::Error;
use crate::frame::{Frame, OpCode};
use crate::handshake::{compute_accept, validate_key};
use crate::mask::xor_with_key;
use crate::message::Message;
use crate::request::HttpRequest;
use crate::server::{new_connection_id, Router, SharedHandler};
use crate::stream::{FragmentBuilder, MessageChannel, PayloadHook};
use crate::write::FrameWriter;
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};

pub const CONTROL_CHANNEL_ID: u32 = 0;
pub const DEFAULT_CHANNEL_ID: u32 = 1;
pub const MAX_CHANNEL_ID: u32 = (1 << 29) - 1;

const OPCODE_ADD_CHANNEL_REQUEST: u8 = 0;
const OPCODE_ADD_CHANNEL_RESPONSE: u8 = 1;
const OPCODE_FLOW_CONTROL: u8 = 2;
const OPCODE_DROP_CHANNEL: u8 = 3;
const OPCODE_ENCAPSULATED_CONTROL_FRAME: u8 = 4;

/// Send credit granted to a channel before the peer says anything with
/// FlowControl.
const DEFAULT_SEND_QUOTA: u64 = 1 << 16;

/// Encodes a channel id in 1 to 4 bytes: leading bits 0, 10, 110 and 111
/// select the width.
pub fn encode_channel_id(channel_id: u32) -> Result<Vec<u8>, Error> {
    if channel_id < 1 << 7 {
        Ok(vec![channel_id as u8])
    } else if channel_id < 1 << 14 {
        Ok((0x8000u16 + channel_id as u16).to_be_bytes().to_vec())
    } else if channel_id < 1 << 21 {
        let mut bytes = vec![0xc0u8 + (channel_id >> 16) as u8];
        bytes.extend_from_slice(&(channel_id as u16).to_be_bytes());
        Ok(bytes)
    } else if channel_id <= MAX_CHANNEL_ID {
        Ok((0xe000_0000u32 + channel_id).to_be_bytes().to_vec())
    } else {
        Err(Error::BadOperation("channel id out of range"))
    }
}

/// One parsed control block from the control channel.
#[derive(Debug)]
pub enum ControlBlock {
    AddChannelRequest {
        channel_id: u32,
        encoding: u8,
        encoded_handshake: Vec<u8>,
    },
    FlowControl {
        channel_id: u32,
        quota: u64,
    },
    DropChannel {
        channel_id: u32,
        mux_error: bool,
        reason: Vec<u8>,
    },
    EncapsulatedControlFrame {
        channel_id: u32,
        frame: Frame,
    },
}

/// Walks a multiplexed frame payload: a channel id, then either control
/// blocks (channel 0) or reframed channel data.
pub struct MuxPayloadParser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> MuxPayloadParser<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn remaining_data(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], Error> {
        if self.remaining() < n {
            return Err(Error::InvalidMuxFrame(format!(
                "truncated {} ({} bytes missing)",
                what,
                n - self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_channel_id(&mut self) -> Result<u32, Error> {
        if self.remaining() == 0 {
            return Err(Error::InvalidMuxFrame("no channel id found".to_string()));
        }
        let first = self.data[self.pos];
        if first & 0xe0 == 0xe0 {
            let bytes = self.take(4, "channel id")?;
            Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) & 0x1fff_ffff)
        } else if first & 0xc0 == 0xc0 {
            let bytes = self.take(3, "channel id")?;
            Ok(((bytes[0] as u32 & 0x1f) << 16)
                | u16::from_be_bytes([bytes[1], bytes[2]]) as u32)
        } else if first & 0x80 == 0x80 {
            let bytes = self.take(2, "channel id")?;
            Ok(u16::from_be_bytes([bytes[0], bytes[1]]) as u32 & 0x3fff)
        } else {
            let bytes = self.take(1, "channel id")?;
            Ok(bytes[0] as u32)
        }
    }

    /// Length field of a control block: `size_of_length` bytes, as
    /// declared in the block's first byte.
    fn read_sized_length(&mut self, size_of_length: usize) -> Result<usize, Error> {
        let bytes = self.take(size_of_length, "control block length")?;
        let mut length = 0usize;
        for byte in bytes {
            length = length << 8 | *byte as usize;
        }
        Ok(length)
    }

    fn read_length_value(&mut self, first_byte: u8) -> Result<&'a [u8], Error> {
        let size_of_length = (first_byte & 0x3) as usize + 1;
        let length = self.read_sized_length(size_of_length)?;
        self.take(length, "control block value")
    }

    /// Parses a wrapped control frame, which uses the latest-revision
    /// framing and is self-delimiting.
    fn read_encapsulated_frame(&mut self) -> Result<Frame, Error> {
        let invalid = |msg: &str| Error::InvalidMuxControlBlock(msg.to_string());

        let header = self.take(2, "encapsulated frame header")?;
        let fin = header[0] & 0x80 != 0;
        let rsv1 = header[0] & 0x40 != 0;
        let rsv2 = header[0] & 0x20 != 0;
        let rsv3 = header[0] & 0x10 != 0;
        let opcode_wire = header[0] & 0x0f;
        let masked = header[1] & 0x80 != 0;
        let mut length = (header[1] & 0x7f) as u64;
        if length == 126 {
            let bytes = self.take(2, "encapsulated frame length")?;
            length = u16::from_be_bytes([bytes[0], bytes[1]]) as u64;
        } else if length == 127 {
            let bytes = self.take(8, "encapsulated frame length")?;
            length = u64::from_be_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]);
            if length & 0x8000_0000_0000_0000 != 0 {
                return Err(invalid("encapsulated frame length >= 2^63"));
            }
        }

        let masking_key = if masked {
            let bytes = self.take(4, "encapsulated frame masking key")?;
            Some([bytes[0], bytes[1], bytes[2], bytes[3]])
        } else {
            None
        };

        let mut payload = self.take(length as usize, "encapsulated frame payload")?.to_vec();
        if let Some(key) = masking_key {
            xor_with_key(&mut payload, key);
        }

        if !fin {
            return Err(invalid("encapsulated control frames must not be fragmented"));
        }
        let opcode = Dialect::HyBiLatest
            .opcode_from_wire(opcode_wire)
            .filter(|opcode| opcode.is_control())
            .ok_or_else(|| invalid("encapsulated frame opcode is not a control opcode"))?;

        Ok(Frame {
            fin,
            rsv1,
            rsv2,
            rsv3,
            rsv4: false,
            opcode,
            masked,
            masking_key,
            payload,
        })
    }

    /// Reads control blocks until the payload is exhausted.
    pub fn read_control_blocks(&mut self) -> Result<Vec<ControlBlock>, Error> {
        let mut blocks = Vec::new();
        while self.remaining() > 0 {
            let channel_id = self.read_channel_id()?;
            let first_byte = self
                .take(1, "control block opcode")
                .map_err(|_| Error::InvalidMuxControlBlock("no control opcode found".to_string()))?
                [0];
            let opcode = (first_byte >> 5) & 0x7;
            match opcode {
                OPCODE_ADD_CHANNEL_REQUEST => {
                    let encoding = (first_byte >> 2) & 0x3;
                    let encoded_handshake = self.read_length_value(first_byte)?.to_vec();
                    blocks.push(ControlBlock::AddChannelRequest {
                        channel_id,
                        encoding,
                        encoded_handshake,
                    });
                }
                OPCODE_FLOW_CONTROL => {
                    let bytes = self.read_length_value(first_byte)?;
                    if bytes.is_empty() || bytes.len() > 8 {
                        return Err(Error::InvalidMuxControlBlock(
                            "flow control quota must be 1 to 8 bytes".to_string(),
                        ));
                    }
                    let mut quota = 0u64;
                    for byte in bytes {
                        quota = quota << 8 | *byte as u64;
                    }
                    blocks.push(ControlBlock::FlowControl { channel_id, quota });
                }
                OPCODE_DROP_CHANNEL => {
                    let mux_error = (first_byte >> 4) & 0x1 != 0;
                    let reason = self.read_length_value(first_byte)?.to_vec();
                    if !mux_error && !reason.is_empty() {
                        return Err(Error::InvalidMuxControlBlock(
                            "reason must be empty on a clean drop".to_string(),
                        ));
                    }
                    blocks.push(ControlBlock::DropChannel {
                        channel_id,
                        mux_error,
                        reason,
                    });
                }
                OPCODE_ENCAPSULATED_CONTROL_FRAME => {
                    let frame = self.read_encapsulated_frame()?;
                    blocks.push(ControlBlock::EncapsulatedControlFrame { channel_id, frame });
                }
                _ => {
                    return Err(Error::InvalidMuxControlBlock(format!(
                        "invalid opcode {}",
                        opcode
                    )))
                }
            }
        }
        Ok(blocks)
    }
}

/// Control block skeleton: objective channel id, opcode/flags byte with
/// the length-field width, minimum-width length, value.
fn create_control_block(
    channel_id: u32,
    opcode: u8,
    flags: u8,
    value: &[u8],
) -> Result<Vec<u8>, Error> {
    debug_assert!(flags <= 0x7);
    let length = value.len();
    let size_of_length = match length {
        0..=0xff => 1usize,
        0x100..=0xffff => 2,
        0x10000..=0xff_ffff => 3,
        _ => 4,
    };
    if length > u32::MAX as usize {
        return Err(Error::BadOperation("control block value too large"));
    }

    let mut block = encode_channel_id(channel_id)?;
    block.push(opcode << 5 | flags << 2 | (size_of_length as u8 - 1));
    block.extend_from_slice(&(length as u32).to_be_bytes()[4 - size_of_length..]);
    block.extend_from_slice(value);
    Ok(block)
}

fn wrap_binary(payload: Vec<u8>) -> Result<Vec<u8>, Error> {
    FrameCodec::new(Dialect::HyBiLatest).encode(&Frame::data(OpCode::Binary, payload, true))
}

/// AddChannelResponse as physical wire bytes.
pub fn create_add_channel_response(
    channel_id: u32,
    encoded_handshake: &[u8],
    encoding: u8,
    rejected: bool,
) -> Result<Vec<u8>, Error> {
    if encoding > 1 {
        return Err(Error::BadOperation("invalid handshake encoding"));
    }
    let flags = (rejected as u8) << 2 | encoding;
    let block = create_control_block(
        channel_id,
        OPCODE_ADD_CHANNEL_RESPONSE,
        flags,
        encoded_handshake,
    )?;
    let mut payload = encode_channel_id(CONTROL_CHANNEL_ID)?;
    payload.extend(block);
    wrap_binary(payload)
}

/// DropChannel as physical wire bytes. A clean drop carries no reason.
pub fn create_drop_channel(
    channel_id: u32,
    reason: &[u8],
    mux_error: bool,
) -> Result<Vec<u8>, Error> {
    if !mux_error && !reason.is_empty() {
        return Err(Error::BadOperation("reason must be empty on a clean drop"));
    }
    let flags = (mux_error as u8) << 2;
    let block = create_control_block(channel_id, OPCODE_DROP_CHANNEL, flags, reason)?;
    let mut payload = encode_channel_id(CONTROL_CHANNEL_ID)?;
    payload.extend(block);
    wrap_binary(payload)
}

/// FlowControl as physical wire bytes; `quota` is a big-endian credit
/// delta for the objective channel.
pub fn create_flow_control(channel_id: u32, quota: u64) -> Result<Vec<u8>, Error> {
    let bytes = quota.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(7);
    let block = create_control_block(channel_id, OPCODE_FLOW_CONTROL, 0, &bytes[first..])?;
    let mut payload = encode_channel_id(CONTROL_CHANNEL_ID)?;
    payload.extend(block);
    wrap_binary(payload)
}

/// EncapsulatedControlFrame as physical wire bytes: the inner control
/// frame rides behind the objective channel id, self-delimiting.
pub fn create_encapsulated_control_frame(
    objective_channel_id: u32,
    inner: &Frame,
) -> Result<Vec<u8>, Error> {
    let mut payload = encode_channel_id(CONTROL_CHANNEL_ID)?;
    payload.extend(encode_channel_id(objective_channel_id)?);
    payload.push(OPCODE_ENCAPSULATED_CONTROL_FRAME << 5);
    payload.extend(FrameCodec::new(Dialect::HyBiLatest).encode(inner)?);
    wrap_binary(payload)
}

/// Reframed channel data as physical wire bytes: channel id, then the
/// logical frame's first byte, then its payload with the length omitted.
pub fn create_channel_data(
    channel_id: u32,
    opcode: OpCode,
    fin: bool,
    data: &[u8],
) -> Result<Vec<u8>, Error> {
    let mut payload = encode_channel_id(channel_id)?;
    payload.push((fin as u8) << 7 | Dialect::HyBiLatest.opcode_to_wire(opcode));
    payload.extend_from_slice(data);
    wrap_binary(payload)
}

/// State shared between a logical channel handle and the demultiplexer.
struct ChannelShared {
    send_quota: StdMutex<u64>,
    ping_queue: StdMutex<std::collections::VecDeque<Vec<u8>>>,
    client_terminated: AtomicBool,
    server_terminated: AtomicBool,
}

impl ChannelShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            send_quota: StdMutex::new(DEFAULT_SEND_QUOTA),
            ping_queue: StdMutex::new(std::collections::VecDeque::new()),
            client_terminated: AtomicBool::new(false),
            server_terminated: AtomicBool::new(false),
        })
    }
}

/// A logical channel's stream handle. Looks and behaves like the physical
/// stream from a handler's point of view; under the hood every send is
/// wrapped into a multiplexed binary frame on the shared writer.
pub struct LogicalChannel {
    channel_id: u32,
    writer: Arc<Mutex<FrameWriter>>,
    inbound: mpsc::Receiver<Message>,
    shared: Arc<ChannelShared>,
    builder: FragmentBuilder,
}

impl LogicalChannel {
    fn consume_quota(&self, amount: u64) -> Result<(), Error> {
        let mut quota = self.shared.send_quota.lock().expect("quota lock poisoned");
        if *quota < amount {
            return Err(Error::BadOperation("flow control quota exhausted"));
        }
        *quota -= amount;
        Ok(())
    }
}

#[async_trait]
impl MessageChannel for LogicalChannel {
    async fn send_message(&mut self, message: Message, end: bool) -> Result<(), Error> {
        if self.shared.server_terminated.load(Ordering::SeqCst) {
            return Err(Error::BadOperation(
                "send_message requested after sending out a closing handshake",
            ));
        }
        let opcode = message.opcode();
        let payload = message.into_payload();
        self.consume_quota(payload.len() as u64)?;

        let frame = self.builder.build(opcode, payload, end);
        let bytes = create_channel_data(self.channel_id, frame.opcode, frame.fin, &frame.payload)?;
        self.writer.lock().await.write_raw(&bytes).await
    }

    async fn receive_message(&mut self) -> Result<Option<Message>, Error> {
        match self.inbound.recv().await {
            Some(message) => Ok(Some(message)),
            None => {
                self.shared.client_terminated.store(true, Ordering::SeqCst);
                Ok(None)
            }
        }
    }

    async fn send_ping(&mut self, body: Vec<u8>) -> Result<(), Error> {
        let bytes = create_encapsulated_control_frame(self.channel_id, &Frame::ping(body.clone()))?;
        self.writer.lock().await.write_raw(&bytes).await?;
        self.shared
            .ping_queue
            .lock()
            .expect("ping queue lock poisoned")
            .push_back(body);
        Ok(())
    }

    async fn close_connection(&mut self) -> Result<(), Error> {
        if self.shared.server_terminated.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.server_terminated.store(true, Ordering::SeqCst);
        let bytes = create_encapsulated_control_frame(self.channel_id, &Frame::close(Vec::new()))?;
        self.writer.lock().await.write_raw(&bytes).await?;

        // The demultiplexer closes our inbound queue when the peer's close
        // for this channel arrives.
        match self.inbound.recv().await {
            None => Ok(()),
            Some(_) => Err(Error::ConnectionTerminated(
                "didn't receive valid ack for closing handshake".to_string(),
            )),
        }
    }

    fn client_terminated(&self) -> bool {
        self.shared.client_terminated.load(Ordering::SeqCst)
    }

    fn server_terminated(&self) -> bool {
        self.shared.server_terminated.load(Ordering::SeqCst)
    }

    fn set_on_ping(&mut self, _hook: PayloadHook) {
        // Channel pings are answered by the demultiplexer.
    }
}

/// Per-channel bookkeeping on the demultiplexer side.
struct ChannelSlot {
    inbound: Option<mpsc::Sender<Message>>,
    shared: Arc<ChannelShared>,
    fragments: Vec<u8>,
    fragment_opcode: Option<OpCode>,
}

/// Owns the physical stream of a mux session: routes channel data,
/// processes control blocks, spawns a handler task per accepted channel.
struct MuxDemux {
    writer: Arc<Mutex<FrameWriter>>,
    router: Arc<Router>,
    channels: HashMap<u32, ChannelSlot>,
    queue_depth: usize,
}

impl MuxDemux {
    fn open_channel(&mut self, channel_id: u32, handler: SharedHandler, resource: &str) {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let shared = ChannelShared::new();
        self.channels.insert(
            channel_id,
            ChannelSlot {
                inbound: Some(tx),
                shared: Arc::clone(&shared),
                fragments: Vec::new(),
                fragment_opcode: None,
            },
        );

        let channel = LogicalChannel {
            channel_id,
            writer: Arc::clone(&self.writer),
            inbound: rx,
            shared,
            builder: FragmentBuilder::default(),
        };
        let mut context =
            ConnectionContext::new(new_connection_id(), Dialect::HyBiLatest, Box::new(channel));
        context.resource = resource.to_string();

        debug!("mux: channel {} open for {}", channel_id, resource);
        tokio::spawn(async move {
            if let Err(error) = handler.on_data(&mut context).await {
                warn!(
                    "mux: channel handler for {} failed: {}",
                    context.resource, error
                );
            }
        });
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), Error> {
        self.writer.lock().await.write_raw(bytes).await
    }

    async fn process_payload(&mut self, payload: &[u8]) -> Result<(), Error> {
        let mut parser = MuxPayloadParser::new(payload);
        let channel_id = parser.read_channel_id()?;
        if channel_id == CONTROL_CHANNEL_ID {
            for block in parser.read_control_blocks()? {
                self.process_block(block).await?;
            }
            return Ok(());
        }
        self.process_channel_data(channel_id, parser.remaining_data())
            .await
    }

    async fn process_channel_data(&mut self, channel_id: u32, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Err(Error::InvalidMuxFrame(
                "channel data without a frame byte".to_string(),
            ));
        }
        let fin = data[0] & 0x80 != 0;
        let opcode = Dialect::HyBiLatest
            .opcode_from_wire(data[0] & 0x0f)
            .filter(|opcode| !opcode.is_control())
            .ok_or_else(|| {
                Error::InvalidMuxFrame(format!(
                    "unexpected opcode {:#x} in channel data",
                    data[0] & 0x0f
                ))
            })?;
        let body = &data[1..];

        // Per-channel fragment reassembly, same rules as the physical
        // stream applies. The slot borrow ends before anything is written.
        let (complete, inbound) = {
            let slot = self.channels.get_mut(&channel_id).ok_or_else(|| {
                Error::InvalidMuxFrame(format!("data for unknown channel {}", channel_id))
            })?;
            let complete = match opcode {
                OpCode::Continuation => {
                    if slot.fragment_opcode.is_none() {
                        return Err(Error::InvalidMuxFrame(
                            "continuation without fragmentation started".to_string(),
                        ));
                    }
                    slot.fragments.extend_from_slice(body);
                    if fin {
                        let opcode = slot.fragment_opcode.take().expect("checked above");
                        Some((opcode, std::mem::take(&mut slot.fragments)))
                    } else {
                        None
                    }
                }
                opcode => {
                    if slot.fragment_opcode.is_some() {
                        return Err(Error::InvalidMuxFrame(
                            "new frame without terminating existing fragmentation".to_string(),
                        ));
                    }
                    if fin {
                        Some((opcode, body.to_vec()))
                    } else {
                        slot.fragment_opcode = Some(opcode);
                        slot.fragments = body.to_vec();
                        None
                    }
                }
            };
            (complete, slot.inbound.clone())
        };

        if let Some((opcode, payload)) = complete {
            let message = Message::from_payload(opcode, payload);
            if let Some(tx) = inbound {
                if tx.send(message).await.is_err() {
                    debug!("mux: channel {} consumer gone, dropping", channel_id);
                    self.drop_channel(channel_id, b"handler gone", true).await?;
                }
            }
        }
        Ok(())
    }

    async fn process_block(&mut self, block: ControlBlock) -> Result<(), Error> {
        match block {
            ControlBlock::AddChannelRequest {
                channel_id,
                encoding,
                encoded_handshake,
            } => {
                self.add_channel(channel_id, encoding, &encoded_handshake)
                    .await
            }
            ControlBlock::FlowControl { channel_id, quota } => {
                if let Some(slot) = self.channels.get(&channel_id) {
                    let mut credit =
                        slot.shared.send_quota.lock().expect("quota lock poisoned");
                    *credit = credit.saturating_add(quota);
                    debug!("mux: channel {} send quota now {}", channel_id, *credit);
                }
                Ok(())
            }
            ControlBlock::DropChannel {
                channel_id,
                mux_error,
                reason,
            } => {
                if mux_error {
                    warn!(
                        "mux: peer dropped channel {}: {}",
                        channel_id,
                        String::from_utf8_lossy(&reason)
                    );
                } else {
                    debug!("mux: peer dropped channel {}", channel_id);
                }
                self.channels.remove(&channel_id);
                Ok(())
            }
            ControlBlock::EncapsulatedControlFrame { channel_id, frame } => {
                self.process_encapsulated(channel_id, frame).await
            }
        }
    }

    async fn add_channel(
        &mut self,
        channel_id: u32,
        encoding: u8,
        encoded_handshake: &[u8],
    ) -> Result<(), Error> {
        if channel_id == CONTROL_CHANNEL_ID {
            return Err(Error::InvalidMuxControlBlock(
                "cannot add the control channel".to_string(),
            ));
        }
        // Identity only; deflate-compressed handshakes are not spoken here
        // and 2 and 3 are reserved.
        if encoding != 0 {
            let response = create_add_channel_response(channel_id, &[], 0, true)?;
            return self.write(&response).await;
        }
        if self.channels.contains_key(&channel_id) {
            let response = create_add_channel_response(channel_id, &[], 0, true)?;
            return self.write(&response).await;
        }

        match self.logical_handshake(encoded_handshake) {
            Ok((handler, resource, response_text)) => {
                let response =
                    create_add_channel_response(channel_id, response_text.as_bytes(), 0, false)?;
                self.write(&response).await?;
                self.open_channel(channel_id, handler, &resource);
                Ok(())
            }
            Err(error) => {
                debug!("mux: channel {} rejected: {}", channel_id, error);
                let response = create_add_channel_response(channel_id, &[], 0, true)?;
                self.write(&response).await
            }
        }
    }

    /// Validates the encoded handshake of an AddChannelRequest and builds
    /// the encoded response. Logical channels always speak the latest
    /// revision; the physical handshake already settled everything else.
    fn logical_handshake(
        &self,
        encoded_handshake: &[u8],
    ) -> Result<(SharedHandler, String, String), Error> {
        let request = HttpRequest::parse(encoded_handshake)?;
        if request.method != "GET" {
            return Err(crate::error::HandshakeError::MethodNotGet.into());
        }
        let resource = request.resource().to_string();
        let handler = self
            .router
            .get(&resource)
            .ok_or_else(|| Error::Dispatch(resource.clone()))?;

        let key = request.headers.require_unique("Sec-WebSocket-Key")?;
        validate_key(key)?;
        let accept = compute_accept(key);

        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\
             \r\n",
            accept
        );
        Ok((handler, resource, response))
    }

    async fn process_encapsulated(&mut self, channel_id: u32, frame: Frame) -> Result<(), Error> {
        let Some(slot) = self.channels.get_mut(&channel_id) else {
            debug!("mux: control frame for unknown channel {}", channel_id);
            return Ok(());
        };
        match frame.opcode {
            OpCode::Close => {
                slot.shared.client_terminated.store(true, Ordering::SeqCst);
                let ack_needed = !slot.shared.server_terminated.load(Ordering::SeqCst);
                if ack_needed {
                    slot.shared.server_terminated.store(true, Ordering::SeqCst);
                }
                // Dropping the inbound sender delivers the close to the
                // channel as end-of-messages.
                slot.inbound = None;
                if ack_needed {
                    let ack =
                        create_encapsulated_control_frame(channel_id, &Frame::close(Vec::new()))?;
                    self.write(&ack).await?;
                }
                Ok(())
            }
            OpCode::Ping => {
                let pong =
                    create_encapsulated_control_frame(channel_id, &Frame::pong(frame.payload))?;
                self.write(&pong).await
            }
            OpCode::Pong => {
                let expected = slot
                    .shared
                    .ping_queue
                    .lock()
                    .expect("ping queue lock poisoned")
                    .pop_front();
                match expected {
                    Some(expected) if expected == frame.payload => Ok(()),
                    _ => {
                        // A bad pong is fatal for the channel, not for the
                        // physical connection.
                        warn!("mux: channel {} pong mismatch, dropping", channel_id);
                        self.drop_channel(channel_id, b"pong mismatch", true).await
                    }
                }
            }
            _ => Err(Error::InvalidMuxControlBlock(
                "encapsulated frame opcode is not a control opcode".to_string(),
            )),
        }
    }

    async fn drop_channel(
        &mut self,
        channel_id: u32,
        reason: &[u8],
        mux_error: bool,
    ) -> Result<(), Error> {
        self.channels.remove(&channel_id);
        let bytes = create_drop_channel(channel_id, reason, mux_error)?;
        self.write(&bytes).await
    }
}

/// Runs a multiplexed session over an established physical connection.
/// Returns when the physical closing handshake completes or the transport
/// dies; logical channels all end with it.
pub async fn run_mux(
    mut context: ConnectionContext,
    default_handler: SharedHandler,
    router: Arc<Router>,
    config: &ServerConfig,
) -> Result<(), Error> {
    let writer = context
        .stream()
        .writer_handle()
        .ok_or(Error::BadOperation("multiplexing requires a physical stream"))?;

    let mut demux = MuxDemux {
        writer,
        router,
        channels: HashMap::new(),
        queue_depth: config.queue_depth,
    };
    let resource = context.resource.clone();
    demux.open_channel(DEFAULT_CHANNEL_ID, default_handler, &resource);

    loop {
        match context.stream().receive_message().await {
            Ok(Some(message)) => {
                let payload = message.into_payload();
                demux.process_payload(&payload).await?;
            }
            Ok(None) => {
                debug!("mux: physical connection closed");
                return Ok(());
            }
            Err(error) if error.is_recoverable() => {
                debug!("mux: skipping unsupported physical frame: {}", error);
            }
            Err(error) => return Err(error),
        }
    }
}
