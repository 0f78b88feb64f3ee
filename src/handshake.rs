use crate::config::ServerConfig;
use crate::context::ConnectionContext;
use crate::dialect::Dialect;
use crate::error::{Error, HandshakeError};
use crate::extensions::{
    self, ExtensionItem, IdentityTransform, DEFLATE_APPLICATION_DATA, DEFLATE_STREAM, MUX,
};
use crate::request::{
    build_location, parse_token_list, validate_subprotocol, HttpHeaders, HttpRequest,
};
use crate::server::{Router, SharedHandler};
use crate::stream::MessageStream;
use crate::transport::{self, BoxedSocket, TransportReader};
use base64::prelude::*;
use log::debug;
use md5::Md5;
use sha1::{Digest, Sha1};
use uuid::Uuid;

pub const WEBSOCKET_ACCEPT_UUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
pub const WEBSOCKET_MASKING_UUID: &str = "61AC5F19-FBBA-4540-B96F-6561F1AB40A8";

const VERSION_HYBI_LATEST: u32 = 13;

/// Sec-WebSocket-Accept value for a client key.
pub fn compute_accept(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WEBSOCKET_ACCEPT_UUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Connection-scoped hybi-06 masking key: SHA-1 of the client key, the
/// base64 server nonce and the masking GUID.
pub fn compute_masking_key(key: &str, nonce_b64: &str) -> Vec<u8> {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(nonce_b64.as_bytes());
    sha1.update(WEBSOCKET_MASKING_UUID.as_bytes());
    sha1.finalize().to_vec()
}

/// Base64 shape check applied before decoding. The decoder skips characters
/// it does not understand, so without this gate an illegal key could still
/// come out 16 bytes long.
fn is_strict_base64(value: &str) -> bool {
    let mut in_padding = false;
    for c in value.bytes() {
        if c == b'=' {
            in_padding = true;
            continue;
        }
        if in_padding {
            return false;
        }
        if !(c.is_ascii_alphanumeric() || c == b'+' || c == b'/') {
            return false;
        }
    }
    true
}

/// Validates a Sec-WebSocket-Key: strictly base64 and exactly 16 bytes
/// once decoded.
pub fn validate_key(key: &str) -> Result<Vec<u8>, HandshakeError> {
    let illegal = || HandshakeError::IllegalHeaderValue {
        header: "Sec-WebSocket-Key",
        value: key.to_string(),
    };
    if !is_strict_base64(key) {
        return Err(illegal());
    }
    let decoded = BASE64_STANDARD.decode(key).map_err(|_| illegal())?;
    if decoded.len() != 16 {
        return Err(illegal());
    }
    Ok(decoded)
}

/// HyBi-00 key number: all decimal digits of the header value divided by
/// the number of space characters. No spaces, or a division with a
/// remainder, marks a forged key.
pub fn hybi00_key_number(header: &'static str, value: &str) -> Result<u32, HandshakeError> {
    let illegal = || HandshakeError::IllegalHeaderValue {
        header,
        value: value.to_string(),
    };
    let digits: String = value.chars().filter(|c| c.is_ascii_digit()).collect();
    let number: u64 = digits.parse().map_err(|_| illegal())?;
    let spaces = value.chars().filter(|&c| c == ' ').count() as u64;
    if spaces == 0 || number % spaces != 0 {
        return Err(illegal());
    }
    u32::try_from(number / spaces).map_err(|_| illegal())
}

/// HyBi-00 challenge response: MD5 over both key numbers as 32-bit
/// big-endian integers followed by the 8 key bytes from the request body.
pub fn hybi00_challenge_response(key1: u32, key2: u32, body: &[u8; 8]) -> [u8; 16] {
    let mut md5 = Md5::new();
    md5.update(key1.to_be_bytes());
    md5.update(key2.to_be_bytes());
    md5.update(body);
    md5.finalize().into()
}

/// Everything the dialect-specific validation established before the
/// handler and the response get involved.
#[derive(Default)]
struct Negotiated {
    origin: Option<String>,
    location: Option<String>,
    requested_subprotocols: Option<Vec<String>>,
    requested_extensions: Vec<ExtensionItem>,
    accepted_extensions: Vec<ExtensionItem>,
    accept: Option<String>,
    nonce_b64: Option<String>,
    masking_key: Option<Vec<u8>>,
    challenge: Option<[u8; 16]>,
}

/// The result of a successful handshake: a live context and the handler
/// that will run the conversation.
pub struct HandshakeOutcome {
    pub context: ConnectionContext,
    pub handler: SharedHandler,
}

/// Performs the opening handshake on a fresh connection: parses the
/// upgrade request, picks the dialect, runs the handler's `on_open`,
/// writes the response and installs the message stream on the context.
pub struct Handshaker<'a> {
    config: &'a ServerConfig,
    router: &'a Router,
    secure: bool,
}

impl<'a> Handshaker<'a> {
    pub fn new(config: &'a ServerConfig, router: &'a Router, secure: bool) -> Self {
        Self {
            config,
            router,
            secure,
        }
    }

    pub async fn shake_hands(
        &self,
        socket: BoxedSocket,
        peer: &str,
        id: Uuid,
    ) -> Result<HandshakeOutcome, Error> {
        let (mut reader, mut writer) = transport::split(socket, peer);

        // Anything failing before the stream exists gets a plain HTTP
        // rejection; nothing of the 101 response has been written yet.
        let (request, handler, dialect, negotiated) =
            match self.validate_request(&mut reader, id).await {
                Ok(validated) => validated,
                Err(error) => {
                    let _ = writer.write_all(&build_reject_response(&error)).await;
                    return Err(error);
                }
            };

        // The stream exists before the response is written so `on_open`
        // sees the finished context; nothing goes on the wire until
        // validation and the handler both pass.
        let mut stream = MessageStream::new(dialect, reader, writer);
        if negotiated
            .accepted_extensions
            .iter()
            .any(|e| e.name == DEFLATE_STREAM)
        {
            stream.allow_reserved_bits(0b1000);
        }
        if negotiated
            .accepted_extensions
            .iter()
            .any(|e| e.name == DEFLATE_APPLICATION_DATA)
        {
            stream.set_transform(Box::new(IdentityTransform));
        }
        let writer_handle = stream.writer_handle();

        let mut context = ConnectionContext::new(id, dialect, Box::new(stream));
        context.resource = request.target.clone();
        context.origin = negotiated.origin.clone();
        context.location = negotiated.location.clone();
        context.requested_subprotocols = negotiated.requested_subprotocols.clone();
        context.requested_extensions = negotiated.requested_extensions.clone();
        context.accepted_extensions = negotiated.accepted_extensions.clone();
        context.masking_key = negotiated.masking_key.clone();

        let opened = run_on_open(&handler, &mut context).and_then(|()| {
            // The legacy responses echo the requested protocol unless the
            // handler picked otherwise.
            if dialect.is_legacy_framing() && context.selected_subprotocol.is_none() {
                context.selected_subprotocol = context
                    .requested_subprotocols
                    .as_ref()
                    .and_then(|p| p.first().cloned());
            }
            check_subprotocol_selection(&context, dialect)
        });
        if let Err(error) = opened {
            let reject = build_reject_response(&error);
            let _ = writer_handle.lock().await.write_raw(&reject).await;
            return Err(error);
        }

        let response = build_response(dialect, &negotiated, &context);
        writer_handle.lock().await.write_raw(&response).await?;

        // Everything from here on is masked with the connection key.
        if let Some(key) = &context.masking_key {
            writer_handle.lock().await.set_send_masker(key.clone());
        }

        debug!("connection {}: opening handshake response sent", id);
        Ok(HandshakeOutcome { context, handler })
    }

    async fn validate_request(
        &self,
        reader: &mut TransportReader,
        id: Uuid,
    ) -> Result<(HttpRequest, SharedHandler, Dialect, Negotiated), Error> {
        let request = HttpRequest::read(reader).await?;

        if request.method != "GET" {
            return Err(HandshakeError::MethodNotGet.into());
        }
        if request.version_minor < 1 {
            return Err(HandshakeError::VersionTooOld.into());
        }

        let resource = request.resource().to_string();
        let handler = self
            .router
            .get(&resource)
            .ok_or_else(|| Error::Dispatch(resource.clone()))?;

        let dialect = self.select_dialect(&request.headers)?;
        debug!("connection {}: dialect {:?} for {}", id, dialect, resource);

        validate_upgrade_headers(&request.headers, dialect)?;
        request.headers.require_unique("Host")?;

        let negotiated = self.negotiate(&request, dialect, reader).await?;
        Ok((request, handler, dialect, negotiated))
    }

    fn select_dialect(&self, headers: &HttpHeaders) -> Result<Dialect, Error> {
        match headers.unique("Sec-WebSocket-Version")? {
            Some(value) => match value.parse::<u32>() {
                Ok(VERSION_HYBI_LATEST) => Ok(Dialect::HyBiLatest),
                Ok(4..=6) => Ok(Dialect::HyBi06),
                _ => Err(HandshakeError::UnsupportedVersion(value.to_string()).into()),
            },
            None => {
                if headers.contains("Sec-WebSocket-Key1") && headers.contains("Sec-WebSocket-Key2")
                {
                    Ok(Dialect::HyBi00)
                } else if self.config.allow_hixie75 {
                    Ok(Dialect::Hixie75)
                } else {
                    Err(HandshakeError::Hixie75Disabled.into())
                }
            }
        }
    }

    async fn negotiate(
        &self,
        request: &HttpRequest,
        dialect: Dialect,
        reader: &mut TransportReader,
    ) -> Result<Negotiated, Error> {
        let mut negotiated = Negotiated::default();

        match dialect {
            Dialect::HyBiLatest => {
                negotiated.origin = request.headers.get("Origin").map(str::to_string);

                let key = request.headers.require_unique("Sec-WebSocket-Key")?;
                validate_key(key)?;
                negotiated.accept = Some(compute_accept(key));

                self.collect_subprotocols(request, &mut negotiated)?;
                self.collect_extensions(request, dialect, &mut negotiated)?;
            }
            Dialect::HyBi06 => {
                let origin = request.headers.require_unique("Sec-WebSocket-Origin")?;
                negotiated.origin = Some(origin.to_string());

                let key = request.headers.require_unique("Sec-WebSocket-Key")?;
                validate_key(key)?;
                negotiated.accept = Some(compute_accept(key));

                let nonce: [u8; 16] = rand::random();
                let nonce_b64 = BASE64_STANDARD.encode(nonce);
                negotiated.masking_key = Some(compute_masking_key(key, &nonce_b64));
                negotiated.nonce_b64 = Some(nonce_b64);

                self.collect_subprotocols(request, &mut negotiated)?;
                self.collect_extensions(request, dialect, &mut negotiated)?;
            }
            Dialect::HyBi00 | Dialect::Hixie75 => {
                let origin = request.headers.require_unique("Origin")?;
                negotiated.origin = Some(origin.to_string());

                let host = request.headers.require_unique("Host")?;
                negotiated.location =
                    Some(build_location(self.secure, host, &request.target)?);

                let protocol_header = if dialect == Dialect::HyBi00 {
                    "Sec-WebSocket-Protocol"
                } else {
                    "WebSocket-Protocol"
                };
                if let Some(protocol) = request.headers.get(protocol_header) {
                    validate_subprotocol(protocol)?;
                    negotiated.requested_subprotocols = Some(vec![protocol.to_string()]);
                }

                if dialect == Dialect::HyBi00 {
                    let key1 = request.headers.require_unique("Sec-WebSocket-Key1")?;
                    let key2 = request.headers.require_unique("Sec-WebSocket-Key2")?;
                    let number1 = hybi00_key_number("Sec-WebSocket-Key1", key1)?;
                    let number2 = hybi00_key_number("Sec-WebSocket-Key2", key2)?;
                    // The 8 challenge bytes trail the header section.
                    let body = reader.read_exact(8).await?;
                    let body: [u8; 8] = body.try_into().expect("read_exact returned 8 bytes");
                    negotiated.challenge =
                        Some(hybi00_challenge_response(number1, number2, &body));
                }
            }
        }

        Ok(negotiated)
    }

    fn collect_subprotocols(
        &self,
        request: &HttpRequest,
        negotiated: &mut Negotiated,
    ) -> Result<(), Error> {
        if let Some(value) = request.headers.unique("Sec-WebSocket-Protocol")? {
            let tokens = parse_token_list(value)?;
            for token in &tokens {
                validate_subprotocol(token)?;
            }
            debug!("subprotocols requested: {:?}", tokens);
            negotiated.requested_subprotocols = Some(tokens);
        }
        Ok(())
    }

    fn collect_extensions(
        &self,
        request: &HttpRequest,
        dialect: Dialect,
        negotiated: &mut Negotiated,
    ) -> Result<(), Error> {
        let Some(value) = request.headers.unique("Sec-WebSocket-Extensions")? else {
            return Ok(());
        };
        let requested = extensions::parse_extensions(value)?;
        debug!(
            "extensions requested: {:?}",
            requested.iter().map(|e| e.name.as_str()).collect::<Vec<_>>()
        );

        // Unknown extension offers, and known ones carrying parameters we
        // do not understand, are dropped from the accepted set.
        let mut accepted: Vec<ExtensionItem> = Vec::new();
        for extension in &requested {
            if extension.has_params() {
                continue;
            }
            let known = match dialect {
                Dialect::HyBi06 => extension.name == DEFLATE_STREAM,
                Dialect::HyBiLatest => {
                    extension.name == DEFLATE_STREAM
                        || extension.name == DEFLATE_APPLICATION_DATA
                        || extension.name == MUX
                }
                _ => false,
            };
            if known {
                accepted.push(extension.clone());
            }
        }
        debug!(
            "extensions accepted: {:?}",
            accepted.iter().map(|e| e.name.as_str()).collect::<Vec<_>>()
        );

        negotiated.requested_extensions = requested;
        negotiated.accepted_extensions = accepted;
        Ok(())
    }
}

/// Plain HTTP rejection written when the upgrade cannot be completed: 404
/// when no handler owns the resource, 400 for everything else.
pub fn build_reject_response(error: &Error) -> Vec<u8> {
    let status = match error {
        Error::Dispatch(_) => "404 Not Found",
        _ => "400 Bad Request",
    };
    let body = format!("{}\r\n", error);
    format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    )
    .into_bytes()
}

fn run_on_open(handler: &SharedHandler, context: &mut ConnectionContext) -> Result<(), Error> {
    handler
        .on_open(context)
        .map_err(|e| HandshakeError::Rejected(e.to_string()).into())
}

fn check_subprotocol_selection(
    context: &ConnectionContext,
    dialect: Dialect,
) -> Result<(), Error> {
    match (&context.requested_subprotocols, &context.selected_subprotocol) {
        (Some(requested), Some(selected)) => {
            validate_subprotocol(selected)?;
            if !requested.contains(selected) {
                return Err(HandshakeError::InvalidSubprotocol(selected.clone()).into());
            }
            debug!("subprotocol accepted: {:?}", selected);
            Ok(())
        }
        (Some(_), None) => {
            // Only the latest revision insists a selection is made.
            if dialect == Dialect::HyBiLatest {
                Err(HandshakeError::SubprotocolNotSelected.into())
            } else {
                Ok(())
            }
        }
        (None, Some(_)) => Err(HandshakeError::SubprotocolNotRequested.into()),
        (None, None) => Ok(()),
    }
}

fn build_response(dialect: Dialect, negotiated: &Negotiated, context: &ConnectionContext) -> Vec<u8> {
    match dialect {
        Dialect::HyBiLatest | Dialect::HyBi06 => {
            let mut response = String::from(dialect.status_line());
            response.push_str("Upgrade: websocket\r\n");
            response.push_str("Connection: Upgrade\r\n");
            if let Some(accept) = &negotiated.accept {
                response.push_str(&format!("Sec-WebSocket-Accept: {}\r\n", accept));
            }
            if let Some(nonce) = &negotiated.nonce_b64 {
                response.push_str(&format!("Sec-WebSocket-Nonce: {}\r\n", nonce));
            }
            if let Some(protocol) = &context.selected_subprotocol {
                response.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", protocol));
            }
            if !context.accepted_extensions.is_empty() {
                response.push_str(&format!(
                    "Sec-WebSocket-Extensions: {}\r\n",
                    extensions::format_extensions(&context.accepted_extensions)
                ));
            }
            response.push_str("\r\n");
            response.into_bytes()
        }
        Dialect::HyBi00 | Dialect::Hixie75 => {
            let (origin_header, location_header, protocol_header) = if dialect == Dialect::HyBi00 {
                (
                    "Sec-WebSocket-Origin",
                    "Sec-WebSocket-Location",
                    "Sec-WebSocket-Protocol",
                )
            } else {
                ("WebSocket-Origin", "WebSocket-Location", "WebSocket-Protocol")
            };

            let mut response = String::from(dialect.status_line());
            response.push_str("Upgrade: WebSocket\r\n");
            response.push_str("Connection: Upgrade\r\n");
            response.push_str(&format!(
                "{}: {}\r\n",
                origin_header,
                negotiated.origin.as_deref().unwrap_or_default()
            ));
            response.push_str(&format!(
                "{}: {}\r\n",
                location_header,
                negotiated.location.as_deref().unwrap_or_default()
            ));
            if let Some(protocol) = &context.selected_subprotocol {
                response.push_str(&format!("{}: {}\r\n", protocol_header, protocol));
            }
            response.push_str("\r\n");

            let mut bytes = response.into_bytes();
            if let Some(digest) = &negotiated.challenge {
                bytes.extend_from_slice(digest);
            }
            bytes
        }
    }
}

fn validate_upgrade_headers(headers: &HttpHeaders, dialect: Dialect) -> Result<(), HandshakeError> {
    let upgrade = headers.require_unique("Upgrade")?;
    if upgrade != dialect.upgrade_token() {
        return Err(HandshakeError::IllegalHeaderValue {
            header: "Upgrade",
            value: upgrade.to_string(),
        });
    }

    let connection = headers.require_unique("Connection")?;
    let tokens = parse_token_list(connection)?;
    let has_upgrade = tokens.iter().any(|token| {
        if dialect.connection_token_case_insensitive() {
            token.eq_ignore_ascii_case("Upgrade")
        } else {
            token == "Upgrade"
        }
    });
    if !has_upgrade {
        return Err(HandshakeError::IllegalHeaderValue {
            header: "Connection",
            value: connection.to_string(),
        });
    }
    Ok(())
}
