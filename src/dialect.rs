use crate::frame::OpCode;

/// Protocol revision negotiated during the opening handshake. Immutable for
/// the lifetime of a connection.
///
/// The revisions disagree about almost everything below the handshake:
/// opcode numbering, the meaning of the high bit of the length byte, which
/// direction masks, and how a close is spelled on the wire. All of those
/// differences are answered here so the codec and the stream can stay
/// table-driven instead of special-casing revisions inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// The original Hixie-75 protocol. Byte-delimited frames, no closing
    /// handshake, no challenge in the opening handshake.
    Hixie75,
    /// HyBi-00, also known as draft-76. Same framing as Hixie-75 plus the
    /// MD5 key challenge and the 0xFF 0x00 closing handshake.
    HyBi00,
    /// HyBi-04/06 era. Length-prefixed frames where the second-byte high bit
    /// is RSV4, client frames carry a per-frame masking nonce, and server
    /// frames are masked with a connection-scoped key.
    HyBi06,
    /// The RFC-6455-style revision. Client-to-server masking only, close
    /// frames carry a status code.
    HyBiLatest,
}

/// What the high bit of the second header byte means for a dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthMsb {
    Rsv4,
    Mask,
}

impl Dialect {
    /// Byte-delimited framing instead of length-prefixed framing.
    pub fn is_legacy_framing(self) -> bool {
        matches!(self, Dialect::Hixie75 | Dialect::HyBi00)
    }

    /// Maps a wire opcode to its meaning. Returns None for values the
    /// dialect never assigned; the caller reports those as unsupported.
    pub fn opcode_from_wire(self, value: u8) -> Option<OpCode> {
        match self {
            Dialect::Hixie75 | Dialect::HyBi00 => None,
            Dialect::HyBi06 => match value {
                0x0 => Some(OpCode::Continuation),
                0x1 => Some(OpCode::Close),
                0x2 => Some(OpCode::Ping),
                0x3 => Some(OpCode::Pong),
                0x4 => Some(OpCode::Text),
                0x5 => Some(OpCode::Binary),
                _ => None,
            },
            Dialect::HyBiLatest => match value {
                0x0 => Some(OpCode::Continuation),
                0x1 => Some(OpCode::Text),
                0x2 => Some(OpCode::Binary),
                0x8 => Some(OpCode::Close),
                0x9 => Some(OpCode::Ping),
                0xA => Some(OpCode::Pong),
                _ => None,
            },
        }
    }

    pub fn opcode_to_wire(self, opcode: OpCode) -> u8 {
        match self {
            Dialect::Hixie75 | Dialect::HyBi00 => 0,
            Dialect::HyBi06 => match opcode {
                OpCode::Continuation => 0x0,
                OpCode::Close => 0x1,
                OpCode::Ping => 0x2,
                OpCode::Pong => 0x3,
                OpCode::Text => 0x4,
                OpCode::Binary => 0x5,
            },
            Dialect::HyBiLatest => match opcode {
                OpCode::Continuation => 0x0,
                OpCode::Text => 0x1,
                OpCode::Binary => 0x2,
                OpCode::Close => 0x8,
                OpCode::Ping => 0x9,
                OpCode::Pong => 0xA,
            },
        }
    }

    pub fn length_msb(self) -> LengthMsb {
        match self {
            Dialect::HyBi06 => LengthMsb::Rsv4,
            _ => LengthMsb::Mask,
        }
    }

    /// Client frames are preceded by a 4-byte masking nonce and the whole
    /// frame, header included, is XORed with it.
    pub fn per_frame_receive_nonce(self) -> bool {
        self == Dialect::HyBi06
    }

    /// Server-to-client frames are masked with the connection-scoped key
    /// derived during the handshake.
    pub fn masks_server_to_client(self) -> bool {
        self == Dialect::HyBi06
    }

    /// Close frames carry a 2-byte status code plus UTF-8 reason.
    pub fn close_has_status_code(self) -> bool {
        self == Dialect::HyBiLatest
    }

    /// The closing handshake exists at all. Hixie-75 connections just stop.
    pub fn has_closing_handshake(self) -> bool {
        self != Dialect::Hixie75
    }

    /// Expected value of the Upgrade header. The capitalisation changed
    /// when the Sec- headers arrived.
    pub fn upgrade_token(self) -> &'static str {
        match self {
            Dialect::Hixie75 | Dialect::HyBi00 => "WebSocket",
            _ => "websocket",
        }
    }

    /// Token matching in the Connection header became case-insensitive in
    /// the latest revision only.
    pub fn connection_token_case_insensitive(self) -> bool {
        self == Dialect::HyBiLatest
    }

    pub fn status_line(self) -> &'static str {
        match self {
            Dialect::Hixie75 | Dialect::HyBi00 => {
                "HTTP/1.1 101 Web Socket Protocol Handshake\r\n"
            }
            _ => "HTTP/1.1 101 Switching Protocols\r\n",
        }
    }
}
