use crate::codec::FrameCodec;
use crate::error::Error;
use crate::frame::Frame;
use crate::mask::RepeatedXorMasker;
use crate::transport::TransportWriter;

/// Owns the write half of a connection. Shared behind a mutex between the
/// application send path and the receive loop, which needs it for pongs and
/// close acknowledgements. Every frame goes out in a single `write_all`, so
/// interleaving only ever happens at frame boundaries.
pub struct FrameWriter {
    transport: TransportWriter,
    codec: FrameCodec,
    send_masker: Option<RepeatedXorMasker>,
}

impl FrameWriter {
    pub fn new(transport: TransportWriter, codec: FrameCodec) -> Self {
        Self {
            transport,
            codec,
            send_masker: None,
        }
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    /// Installs the connection-scoped hybi-06 masking key. Called after the
    /// plaintext handshake response has been written; everything after that
    /// point is XORed through one masker whose cycle position runs across
    /// frame boundaries.
    pub fn set_send_masker(&mut self, key: Vec<u8>) {
        self.send_masker = Some(RepeatedXorMasker::new(key));
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        let bytes = self.codec.encode(frame)?;
        self.write_bytes(bytes).await
    }

    pub async fn write_legacy_text(&mut self, payload: &[u8]) -> Result<(), Error> {
        let bytes = self.codec.encode_legacy_text(payload);
        self.write_bytes(bytes).await
    }

    pub async fn write_legacy_close(&mut self) -> Result<(), Error> {
        let bytes = self.codec.encode_legacy_close();
        self.write_bytes(bytes).await
    }

    /// Writes bytes that are not frames, i.e. the handshake response. Never
    /// masked.
    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.transport.write_all(bytes).await
    }

    async fn write_bytes(&mut self, mut bytes: Vec<u8>) -> Result<(), Error> {
        if let Some(masker) = self.send_masker.as_mut() {
            masker.mask_in_place(&mut bytes);
        }
        self.transport.write_all(&bytes).await
    }

    pub fn peer(&self) -> &str {
        self.transport.peer()
    }
}
