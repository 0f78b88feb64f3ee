use crate::dialect::Dialect;
use crate::extensions::ExtensionItem;
use crate::stream::{MessageChannel, PayloadHook};
use uuid::Uuid;

/// Everything the handshake established about one connection, plus the
/// stream that carries it. Handed to the application handler; mutated only
/// during the handshake (subprotocol selection) and by the stream itself
/// (termination flags, close code).
pub struct ConnectionContext {
    pub id: Uuid,
    dialect: Dialect,
    stream: Box<dyn MessageChannel>,

    pub resource: String,
    pub origin: Option<String>,
    /// ws:// or wss:// location echoed by the legacy dialect responses.
    pub location: Option<String>,

    pub requested_subprotocols: Option<Vec<String>>,
    /// Set by `on_open` to pick exactly one of the offered tokens.
    pub selected_subprotocol: Option<String>,

    pub requested_extensions: Vec<ExtensionItem>,
    pub accepted_extensions: Vec<ExtensionItem>,

    /// Connection-scoped server-to-client masking key (hybi-06 only).
    pub masking_key: Option<Vec<u8>>,
}

impl ConnectionContext {
    pub fn new(id: Uuid, dialect: Dialect, stream: Box<dyn MessageChannel>) -> Self {
        Self {
            id,
            dialect,
            stream,
            resource: String::new(),
            origin: None,
            location: None,
            requested_subprotocols: None,
            selected_subprotocol: None,
            requested_extensions: Vec::new(),
            accepted_extensions: Vec::new(),
            masking_key: None,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// The message stream. Exclusively owned; dropping the context tears
    /// the connection down.
    pub fn stream(&mut self) -> &mut dyn MessageChannel {
        self.stream.as_mut()
    }

    pub fn client_terminated(&self) -> bool {
        self.stream.client_terminated()
    }

    pub fn server_terminated(&self) -> bool {
        self.stream.server_terminated()
    }

    pub fn close_code(&self) -> Option<u16> {
        self.stream.close_code()
    }

    pub fn close_reason(&self) -> Option<String> {
        self.stream.close_reason()
    }

    pub fn extension_accepted(&self, name: &str) -> bool {
        self.accepted_extensions.iter().any(|e| e.name == name)
    }

    /// Registers an application hook for peer pings; presence is explicit,
    /// nothing is probed at runtime. With a hook installed the stream stops
    /// answering pings itself.
    pub fn set_on_ping(&mut self, hook: PayloadHook) {
        self.stream.set_on_ping(hook);
    }

    /// Registers an application hook for matched pongs.
    pub fn set_on_pong(&mut self, hook: PayloadHook) {
        self.stream.set_on_pong(hook);
    }
}
