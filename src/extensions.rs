use crate::error::HandshakeError;

pub const DEFLATE_STREAM: &str = "deflate-stream";
pub const DEFLATE_APPLICATION_DATA: &str = "deflate-application-data";
pub const MUX: &str = "mux";

/// One extension offer from a Sec-WebSocket-Extensions header: a name and
/// its parameters in offer order.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtensionItem {
    pub name: String,
    pub params: Vec<(String, Option<String>)>,
}

impl ExtensionItem {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            params: Vec::new(),
        }
    }

    pub fn has_params(&self) -> bool {
        !self.params.is_empty()
    }
}

fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|c| {
            matches!(c,
                b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z'
                | b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+'
                | b'-' | b'.' | b'^' | b'_' | b'`' | b'|' | b'~')
        })
}

/// Parses a Sec-WebSocket-Extensions header: a comma-separated list of
/// extensions, each a name followed by semicolon-separated parameters.
/// Parameter names and values follow HTTP token rules.
pub fn parse_extensions(header: &str) -> Result<Vec<ExtensionItem>, HandshakeError> {
    let mut extensions = Vec::new();
    for element in header.split(',') {
        let element = element.trim();
        if element.is_empty() {
            return Err(HandshakeError::InvalidExtension(header.to_string()));
        }
        let mut parts = element.split(';');
        let name = parts.next().unwrap_or_default().trim();
        if !is_token(name) {
            return Err(HandshakeError::InvalidExtension(element.to_string()));
        }
        let mut extension = ExtensionItem::new(name);
        for param in parts {
            let param = param.trim();
            match param.split_once('=') {
                Some((key, value)) => {
                    let key = key.trim();
                    let value = value.trim();
                    if !is_token(key) || !is_token(value) {
                        return Err(HandshakeError::InvalidExtension(element.to_string()));
                    }
                    extension
                        .params
                        .push((key.to_string(), Some(value.to_string())));
                }
                None => {
                    if !is_token(param) {
                        return Err(HandshakeError::InvalidExtension(element.to_string()));
                    }
                    extension.params.push((param.to_string(), None));
                }
            }
        }
        extensions.push(extension);
    }
    Ok(extensions)
}

/// Formats accepted extensions for the response header.
pub fn format_extensions(extensions: &[ExtensionItem]) -> String {
    extensions
        .iter()
        .map(|extension| {
            let mut out = extension.name.clone();
            for (key, value) in &extension.params {
                out.push_str("; ");
                out.push_str(key);
                if let Some(value) = value {
                    out.push('=');
                    out.push_str(value);
                }
            }
            out
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Per-direction payload transform installed by a negotiated extension.
/// The engine only ships the identity transform; a compressing transform
/// would plug in here without the stream noticing.
pub trait FrameTransform {
    fn encode(&mut self, payload: Vec<u8>) -> Vec<u8>;
    fn decode(&mut self, payload: Vec<u8>) -> Vec<u8>;
}

/// Byte-identity fallback used when no transforming extension is active.
#[derive(Debug, Default)]
pub struct IdentityTransform;

impl FrameTransform for IdentityTransform {
    fn encode(&mut self, payload: Vec<u8>) -> Vec<u8> {
        payload
    }

    fn decode(&mut self, payload: Vec<u8>) -> Vec<u8> {
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_extension_list() {
        let parsed = parse_extensions("deflate-stream, mux").unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].name, "deflate-stream");
        assert!(!parsed[0].has_params());
        assert_eq!(parsed[1].name, "mux");
    }

    #[test]
    fn parses_parameters() {
        let parsed = parse_extensions("permessage-deflate; client_max_window_bits=10; server_no_context_takeover").unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(
            parsed[0].params,
            vec![
                (
                    "client_max_window_bits".to_string(),
                    Some("10".to_string())
                ),
                ("server_no_context_takeover".to_string(), None),
            ]
        );
    }

    #[test]
    fn rejects_non_token_names() {
        assert!(parse_extensions("bad name").is_err());
        assert!(parse_extensions("ok, ").is_err());
        assert!(parse_extensions("x; k=\u{e9}").is_err());
    }

    #[test]
    fn formats_round_trip() {
        let parsed = parse_extensions("a; k=v, b").unwrap();
        assert_eq!(format_extensions(&parsed), "a; k=v, b");
    }

    #[test]
    fn identity_transform_is_byte_identity() {
        let mut transform = IdentityTransform;
        assert_eq!(transform.encode(vec![1, 2, 3]), vec![1, 2, 3]);
        assert_eq!(transform.decode(vec![4, 5]), vec![4, 5]);
    }
}
