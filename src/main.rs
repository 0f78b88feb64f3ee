use async_trait::async_trait;
use polysock::config::{LogLevel, ServerConfig};
use polysock::context::ConnectionContext;
use polysock::error::Error;
use polysock::server::{ResourceHandler, Server};

/// Sends every received message straight back.
struct EchoHandler;

#[async_trait]
impl ResourceHandler for EchoHandler {
    async fn on_data(&self, context: &mut ConnectionContext) -> Result<(), Error> {
        while let Some(message) = context.stream().receive_message().await? {
            context.stream().send_message(message, true).await?;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let mut config = ServerConfig::default();
    config.log_level = Some(LogLevel::Debug);

    env_logger::Builder::from_default_env()
        .filter_level(config.log_level.unwrap().to_filter())
        .init();

    Server::new(config)
        .route("/echo", EchoHandler)
        .listen("127.0.0.1:9000")
        .await
}
