use crate::error::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};

/// Any bidirectional byte stream the engine can sit on. A TcpStream in
/// production, an in-memory duplex in the tests, a TLS stream when the
/// embedding server terminates TLS in front of us.
pub trait Socket: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Socket for T {}

pub type BoxedSocket = Box<dyn Socket>;

/// Splits a socket into the two halves the engine works with. The peer
/// address only feeds error messages, so any display string will do.
pub fn split(socket: BoxedSocket, peer: &str) -> (TransportReader, TransportWriter) {
    let (read, write) = tokio::io::split(socket);
    (
        TransportReader {
            read: BufReader::new(read),
            peer: peer.to_string(),
        },
        TransportWriter {
            write,
            peer: peer.to_string(),
        },
    )
}

/// Read side. All higher layers are written in terms of exactly-sized
/// reads so frame parsing never spins on partial input and never reads
/// past a frame boundary.
pub struct TransportReader {
    read: BufReader<ReadHalf<BoxedSocket>>,
    peer: String,
}

impl TransportReader {
    /// Returns exactly `n` bytes, retrying partial reads. EOF before `n`
    /// bytes terminates the connection.
    pub async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; n];
        self.read.read_exact(&mut buf).await.map_err(|e| {
            Error::ConnectionTerminated(format!(
                "receiving {} bytes failed, peer {}: {}",
                n, self.peer, e
            ))
        })?;
        Ok(buf)
    }

    pub async fn read_byte(&mut self) -> Result<u8, Error> {
        self.read.read_u8().await.map_err(|e| {
            Error::ConnectionTerminated(format!(
                "receiving 1 byte failed, peer {}: {}",
                self.peer, e
            ))
        })
    }

    /// Reads up to but excluding `delimiter`. Only the byte-delimited
    /// legacy framer uses this.
    pub async fn read_until(&mut self, delimiter: u8) -> Result<Vec<u8>, Error> {
        let mut bytes = Vec::new();
        loop {
            let byte = self.read_byte().await?;
            if byte == delimiter {
                return Ok(bytes);
            }
            bytes.push(byte);
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

/// Write side. Failures carry the peer address so connection teardown in
/// the logs can be attributed without cross-referencing.
pub struct TransportWriter {
    write: WriteHalf<BoxedSocket>,
    peer: String,
}

impl TransportWriter {
    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.write.write_all(bytes).await.map_err(|e| {
            Error::ConnectionTerminated(format!(
                "failed to send to peer {}: {}",
                self.peer, e
            ))
        })?;
        self.write.flush().await.map_err(|e| {
            Error::ConnectionTerminated(format!(
                "failed to send to peer {}: {}",
                self.peer, e
            ))
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}
