use crate::error::{Error, HandshakeError};
use crate::transport::TransportReader;
use bytes::BytesMut;

// Limit the maximum amount of header data read to prevent a denial of
// service through an endless header section.
const MAX_REQUEST_SIZE: usize = 1024 * 16;

const DEFAULT_PORT: u16 = 80;
const DEFAULT_SECURE_PORT: u16 = 443;

/// Ordered header list with case-insensitive lookup. Order is kept because
/// repeated headers are legal in general and the handshake needs to reject
/// repeats of the singleton ones specifically.
#[derive(Debug, Default, Clone)]
pub struct HttpHeaders {
    entries: Vec<(String, String)>,
}

impl HttpHeaders {
    pub fn push(&mut self, name: &str, value: &str) {
        self.entries.push((name.to_string(), value.to_string()));
    }

    /// First value of the header, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// The header's value, rejecting duplicates. Singleton headers such as
    /// Upgrade or Sec-WebSocket-Key lose their meaning when repeated.
    pub fn unique(&self, name: &'static str) -> Result<Option<&str>, HandshakeError> {
        let values = self.get_all(name);
        match values.len() {
            0 => Ok(None),
            1 => Ok(Some(values[0])),
            _ => Err(HandshakeError::DuplicateHeader(name)),
        }
    }

    pub fn require_unique(&self, name: &'static str) -> Result<&str, HandshakeError> {
        self.unique(name)?
            .ok_or(HandshakeError::MissingHeader(name))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A parsed upgrade request: request line plus headers. The HyBi-00 key
/// bytes that follow the headers are read separately by the handshaker.
#[derive(Debug)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    /// Minor version of HTTP/1.x.
    pub version_minor: u8,
    pub headers: HttpHeaders,
}

impl HttpRequest {
    /// Reads one request head off the transport, byte by byte so nothing
    /// past the blank line is consumed. Frame data may follow immediately.
    pub async fn read(reader: &mut TransportReader) -> Result<Self, Error> {
        let mut buf = BytesMut::with_capacity(1024);
        loop {
            if buf.len() >= MAX_REQUEST_SIZE {
                return Err(HandshakeError::RequestTooLarge.into());
            }
            let byte = reader.read_byte().await?;
            buf.extend_from_slice(&[byte]);
            if buf.ends_with(b"\r\n\r\n") {
                break;
            }
        }
        Ok(Self::parse(&buf)?)
    }

    /// Parses a complete request head. Also used on the handshake text
    /// embedded in multiplexing AddChannelRequest blocks.
    pub fn parse(raw: &[u8]) -> Result<Self, HandshakeError> {
        let mut header_storage = [httparse::EMPTY_HEADER; 64];
        let mut request = httparse::Request::new(&mut header_storage);
        match request.parse(raw)? {
            httparse::Status::Complete(_) => {}
            httparse::Status::Partial => return Err(HandshakeError::IncompleteRequest),
        }

        let method = request
            .method
            .ok_or(HandshakeError::InvalidRequestLine)?
            .to_string();
        let target = request
            .path
            .ok_or(HandshakeError::InvalidRequestLine)?
            .to_string();
        let version_minor = request.version.ok_or(HandshakeError::InvalidRequestLine)?;

        let mut headers = HttpHeaders::default();
        for header in request.headers.iter() {
            let value = std::str::from_utf8(header.value)
                .map_err(|_| HandshakeError::InvalidRequestLine)?;
            headers.push(header.name, value.trim());
        }

        Ok(Self {
            method,
            target,
            version_minor,
            headers,
        })
    }

    /// Resource path without the query part, the key the dispatcher looks
    /// handlers up by.
    pub fn resource(&self) -> &str {
        match self.target.split_once('?') {
            Some((path, _)) => path,
            None => &self.target,
        }
    }
}

/// Splits a comma-separated token list, trimming optional whitespace.
/// Empty elements are rejected.
pub fn parse_token_list(value: &str) -> Result<Vec<String>, HandshakeError> {
    let mut tokens = Vec::new();
    for part in value.split(',') {
        let token = part.trim();
        if token.is_empty() {
            return Err(HandshakeError::IllegalHeaderValue {
                header: "token list",
                value: value.to_string(),
            });
        }
        tokens.push(token.to_string());
    }
    Ok(tokens)
}

/// A subprotocol token is one or more printable non-space characters.
pub fn validate_subprotocol(token: &str) -> Result<(), HandshakeError> {
    if token.is_empty() {
        return Err(HandshakeError::InvalidSubprotocol(token.to_string()));
    }
    for c in token.bytes() {
        if !(0x21..=0x7e).contains(&c) {
            return Err(HandshakeError::InvalidSubprotocol(token.to_string()));
        }
    }
    Ok(())
}

/// Builds the ws:// or wss:// location echoed by the legacy responses.
/// Default ports are elided the way browsers print them.
pub fn build_location(secure: bool, host: &str, resource: &str) -> Result<String, HandshakeError> {
    let (hostname, port) = match host.rsplit_once(':') {
        Some((hostname, port)) => {
            let port: u16 = port.parse().map_err(|_| HandshakeError::InvalidHostPort)?;
            (hostname, port)
        }
        None => (
            host,
            if secure {
                DEFAULT_SECURE_PORT
            } else {
                DEFAULT_PORT
            },
        ),
    };

    let scheme = if secure { "wss" } else { "ws" };
    let default_port = if secure {
        DEFAULT_SECURE_PORT
    } else {
        DEFAULT_PORT
    };
    if port == default_port {
        Ok(format!("{}://{}{}", scheme, hostname, resource))
    } else {
        Ok(format!("{}://{}:{}{}", scheme, hostname, port, resource))
    }
}

/// Parses a comma-delimited list of port numbers. Whitespace and empty
/// entries are ignored; unparsable entries come back as warnings.
pub fn parse_port_list(value: &str) -> (Vec<u16>, Vec<String>) {
    let mut ports = Vec::new();
    let mut warnings = Vec::new();
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.parse::<u16>() {
            Ok(port) => ports.push(port),
            Err(e) => warnings.push(format!("invalid port {:?}: {}", part, e)),
        }
    }
    (ports, warnings)
}
