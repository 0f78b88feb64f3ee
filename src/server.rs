use crate::config::ServerConfig;
use crate::context::ConnectionContext;
use crate::error::Error;
use crate::extensions::MUX;
use crate::handshake::Handshaker;
use crate::mux;
use crate::stream::{STATUS_PROTOCOL_ERROR, STATUS_UNSUPPORTED_DATA};
use crate::transport::BoxedSocket;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use uuid::Uuid;

/// A fresh id for every accepted connection, used to correlate log lines.
pub fn new_connection_id() -> Uuid {
    Uuid::new_v8(rand::random::<[u8; 16]>())
}

/// Application hooks for one resource path.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Runs after validation, before the response is written. May reject
    /// the connection by returning an error, and may pick a subprotocol by
    /// setting `context.selected_subprotocol`.
    fn on_open(&self, _context: &mut ConnectionContext) -> Result<(), Error> {
        Ok(())
    }

    /// Runs the conversation. Returning ends the connection.
    async fn on_data(&self, context: &mut ConnectionContext) -> Result<(), Error>;
}

pub type SharedHandler = Arc<dyn ResourceHandler>;

/// Resource-to-handler map, built at startup and read-only afterwards.
#[derive(Default, Clone)]
pub struct Router {
    routes: HashMap<String, SharedHandler>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<H: ResourceHandler + 'static>(&mut self, resource: &str, handler: H) {
        self.routes.insert(resource.to_string(), Arc::new(handler));
    }

    pub fn get(&self, resource: &str) -> Option<SharedHandler> {
        self.routes.get(resource).cloned()
    }
}

/// Accepts connections, hands each to the handshake and then to the
/// registered handler, one task per connection.
pub struct Server {
    config: ServerConfig,
    router: Arc<Router>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            router: Arc::new(Router::new()),
        }
    }

    /// Registers a handler for a resource path. Registration is static;
    /// there is no directory scanning at runtime.
    pub fn route<H: ResourceHandler + 'static>(mut self, resource: &str, handler: H) -> Self {
        Arc::get_mut(&mut self.router)
            .expect("routes are registered before the server starts")
            .add(resource, handler);
        self
    }

    pub async fn listen(self, addr: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("listening on {}", addr);
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (socket, peer) = listener.accept().await?;
            let local_port = socket.local_addr().map(|a| a.port()).unwrap_or_default();
            let config = self.config.clone();
            let router = Arc::clone(&self.router);
            tokio::spawn(async move {
                handle_connection(
                    Box::new(socket),
                    peer.to_string(),
                    local_port,
                    config,
                    router,
                )
                .await;
            });
        }
    }
}

/// Runs one connection from handshake to teardown. Public so embedders
/// with their own accept loop (or their own TLS termination) can feed
/// sockets in directly.
pub async fn handle_connection(
    socket: BoxedSocket,
    peer: String,
    local_port: u16,
    config: ServerConfig,
    router: Arc<Router>,
) {
    let id = new_connection_id();
    debug!("connection {} accepted from {}", id, peer);

    let secure = config.tls_enabled || config.secure_ports.contains(&local_port);
    let handshaker = Handshaker::new(&config, &router, secure);
    let outcome = match handshaker.shake_hands(socket, &peer, id).await {
        Ok(outcome) => outcome,
        Err(error) => {
            warn!("connection {}: handshake failed: {}", id, error);
            return;
        }
    };

    let mut context = outcome.context;
    let handler = outcome.handler;
    debug!("connection {}: resource {}", id, context.resource);

    // With mux negotiated the physical connection stops carrying the
    // application conversation; the handler moves onto channel 1.
    if context.extension_accepted(MUX) {
        if let Err(error) = mux::run_mux(context, handler, router, &config).await {
            warn!("connection {}: mux session failed: {}", id, error);
        } else {
            debug!("connection {}: mux session finished", id);
        }
        return;
    }

    match handler.on_data(&mut context).await {
        Ok(()) => debug!("connection {} finished", id),
        Err(error) => {
            warn!("connection {}: handler failed: {}", id, error);
            let code = match &error {
                Error::UnsupportedFrame(_) => STATUS_UNSUPPORTED_DATA,
                _ => STATUS_PROTOCOL_ERROR,
            };
            if matches!(error, Error::InvalidFrame(_) | Error::UnsupportedFrame(_)) {
                let _ = context.stream().fail_connection(code, "").await;
            }
        }
    }
}
