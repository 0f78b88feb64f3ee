use crate::dialect::{Dialect, LengthMsb};
use crate::error::Error;
use crate::frame::{Frame, OpCode};
use crate::mask::{xor_with_key, RepeatedXorMasker};
use crate::transport::TransportReader;
use log::warn;

/// Encodes and decodes one frame at a time for a single dialect. Holds no
/// multi-frame state; fragmentation and control dispatch live in the
/// message stream.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    dialect: Dialect,
}

/// Fixed header fields of a length-prefixed frame, before the masking key
/// and payload are consumed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameHeader {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub rsv4: bool,
    pub opcode_wire: u8,
    pub masked: bool,
    pub length: u64,
}

/// A frame in the byte-delimited format used by Hixie-75 and HyBi-00.
/// Frames with the high type bit set have their payload read and discarded;
/// only the discarded length is reported.
#[derive(Debug, Clone)]
pub struct LegacyFrame {
    pub frame_type: u8,
    pub payload: Vec<u8>,
    pub discarded_length: usize,
}

impl LegacyFrame {
    pub fn is_close(&self) -> bool {
        self.frame_type == 0xff && self.discarded_length == 0
    }
}

impl FrameCodec {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub(crate) async fn read_header(
        &self,
        reader: &mut TransportReader,
        masker: Option<&mut RepeatedXorMasker>,
    ) -> Result<FrameHeader, Error> {
        let unmask = |bytes: &mut [u8], masker: &mut Option<&mut RepeatedXorMasker>| {
            if let Some(m) = masker.as_deref_mut() {
                m.mask_in_place(bytes);
            }
        };
        let mut masker = masker;

        let mut header = self.read_n(reader, 2).await?;
        unmask(&mut header, &mut masker);

        let first_byte = header[0];
        let fin = first_byte & 0x80 != 0;
        let rsv1 = first_byte & 0x40 != 0;
        let rsv2 = first_byte & 0x20 != 0;
        let rsv3 = first_byte & 0x10 != 0;
        let opcode_wire = first_byte & 0x0f;

        let second_byte = header[1];
        let msb = second_byte & 0x80 != 0;
        let (masked, rsv4) = match self.dialect.length_msb() {
            LengthMsb::Mask => (msb, false),
            LengthMsb::Rsv4 => (false, msb),
        };

        let mut length = (second_byte & 0x7f) as u64;
        if length == 126 {
            let mut bytes = self.read_n(reader, 2).await?;
            unmask(&mut bytes, &mut masker);
            length = u16::from_be_bytes([bytes[0], bytes[1]]) as u64;
            if length < 126 {
                warn!("non-minimal 16-bit length encoding for {} bytes", length);
            }
        } else if length == 127 {
            let mut bytes = self.read_n(reader, 8).await?;
            unmask(&mut bytes, &mut masker);
            length = u64::from_be_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]);
            if length & 0x8000_0000_0000_0000 != 0 {
                return Err(Error::InvalidFrame(
                    "extended payload length >= 2^63".to_string(),
                ));
            }
            if length < 1 << 16 {
                warn!("non-minimal 64-bit length encoding for {} bytes", length);
            }
        }

        Ok(FrameHeader {
            fin,
            rsv1,
            rsv2,
            rsv3,
            rsv4,
            opcode_wire,
            masked,
            length,
        })
    }

    /// Reads one length-prefixed frame. Unknown opcodes are reported as
    /// unsupported only after the whole frame has been consumed, so the
    /// caller can skip the frame and stay in sync with the stream.
    pub async fn read_frame(&self, reader: &mut TransportReader) -> Result<Frame, Error> {
        let mut masker = if self.dialect.per_frame_receive_nonce() {
            let nonce = self.read_n(reader, 4).await?;
            Some(RepeatedXorMasker::new(nonce))
        } else {
            None
        };

        let header = self.read_header(reader, masker.as_mut()).await?;

        let opcode = self.dialect.opcode_from_wire(header.opcode_wire);
        if let Some(opcode) = opcode {
            if opcode.is_control() && header.length > 125 {
                return Err(Error::InvalidFrame(format!(
                    "control frame with {}-byte payload",
                    header.length
                )));
            }
        }

        let masking_key = if header.masked {
            let key = self.read_n(reader, 4).await?;
            Some([key[0], key[1], key[2], key[3]])
        } else {
            None
        };

        let mut payload = self.read_n(reader, header.length as usize).await?;
        if let Some(m) = masker.as_mut() {
            m.mask_in_place(&mut payload);
        } else if let Some(key) = masking_key {
            xor_with_key(&mut payload, key);
        }

        let opcode = match opcode {
            Some(opcode) => opcode,
            None => {
                return Err(Error::UnsupportedFrame(format!(
                    "opcode {} is not supported",
                    header.opcode_wire
                )))
            }
        };

        Ok(Frame {
            fin: header.fin,
            rsv1: header.rsv1,
            rsv2: header.rsv2,
            rsv3: header.rsv3,
            rsv4: header.rsv4,
            opcode,
            masked: header.masked,
            masking_key,
            payload,
        })
    }

    async fn read_n(&self, reader: &mut TransportReader, n: usize) -> Result<Vec<u8>, Error> {
        reader.read_exact(n).await
    }

    /// Minimum-length encoding of the length header. The high bit of the
    /// first byte is the mask flag or rsv4 depending on dialect.
    pub(crate) fn encode_length_header(&self, length: u64, msb: bool) -> Result<Vec<u8>, Error> {
        let msb_bit = (msb as u8) << 7;
        let mut header = Vec::with_capacity(9);
        if length <= 125 {
            header.push(msb_bit | length as u8);
        } else if length < 1 << 16 {
            header.push(msb_bit | 126);
            header.extend_from_slice(&(length as u16).to_be_bytes());
        } else if length < 1 << 63 {
            header.push(msb_bit | 127);
            header.extend_from_slice(&length.to_be_bytes());
        } else {
            return Err(Error::BadOperation("payload is too big for one frame"));
        }
        Ok(header)
    }

    /// Encodes a length-prefixed frame. The hybi-06 connection-scoped send
    /// masking is applied by the writer, not here.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>, Error> {
        let first_byte = (frame.fin as u8) << 7
            | (frame.rsv1 as u8) << 6
            | (frame.rsv2 as u8) << 5
            | (frame.rsv3 as u8) << 4
            | self.dialect.opcode_to_wire(frame.opcode);

        let msb = match self.dialect.length_msb() {
            LengthMsb::Mask => frame.masked,
            LengthMsb::Rsv4 => frame.rsv4,
        };

        let mut bytes = Vec::with_capacity(frame.payload.len() + 14);
        bytes.push(first_byte);
        bytes.extend(self.encode_length_header(frame.payload.len() as u64, msb)?);

        if frame.masked {
            let key = frame
                .masking_key
                .ok_or(Error::BadOperation("masked frame without a masking key"))?;
            bytes.extend_from_slice(&key);
            let start = bytes.len();
            bytes.extend_from_slice(&frame.payload);
            xor_with_key(&mut bytes[start..], key);
        } else {
            bytes.extend_from_slice(&frame.payload);
        }

        Ok(bytes)
    }

    /// Reads one byte-delimited legacy frame. Delimited frames carry their
    /// payload; length-specified frames are read and discarded.
    pub async fn read_legacy_frame(
        &self,
        reader: &mut TransportReader,
    ) -> Result<LegacyFrame, Error> {
        let frame_type = reader.read_byte().await?;
        if frame_type & 0x80 != 0 {
            // 7 bits of length per byte, high bit marks continuation.
            let mut length: usize = 0;
            loop {
                let byte = reader.read_byte().await?;
                length = length * 128 + (byte & 0x7f) as usize;
                if byte & 0x80 == 0 {
                    break;
                }
            }
            if length > 0 {
                let _ = reader.read_exact(length).await?;
            }
            Ok(LegacyFrame {
                frame_type,
                payload: Vec::new(),
                discarded_length: length,
            })
        } else {
            let payload = reader.read_until(0xff).await?;
            Ok(LegacyFrame {
                frame_type,
                payload,
                discarded_length: 0,
            })
        }
    }

    pub fn encode_legacy_text(&self, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(payload.len() + 2);
        bytes.push(0x00);
        bytes.extend_from_slice(payload);
        bytes.push(0xff);
        bytes
    }

    pub fn encode_legacy_close(&self) -> Vec<u8> {
        vec![0xff, 0x00]
    }
}
