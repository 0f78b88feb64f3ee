use crate::dialect::Dialect;
use crate::error::Error;
use crate::frame::Frame;
use crate::message::Message;
use crate::stream::{MessageChannel, MessageStream};
use crate::write::FrameWriter;
use futures::Stream;
use log::{debug, warn};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_stream::wrappers::ReceiverStream;

/// Splits a stream into queue-polled halves, each backed by a spawned task
/// and a bounded FIFO. For handlers that would rather poll a channel than
/// drive `receive_message` themselves.
pub fn split(stream: MessageStream, depth: usize) -> (MessageReceiver, MessageSender) {
    let writer = stream.writer_handle();
    let dialect = stream.dialect();
    (
        MessageReceiver::spawn(stream, depth),
        MessageSender::spawn(writer, dialect, depth),
    )
}

/// Receive half: runs the message loop in its own task and forwards
/// complete messages into a bounded channel. Closes the channel when the
/// closing handshake finishes or a fatal error is delivered.
pub struct MessageReceiver {
    inner: ReceiverStream<Result<Message, Error>>,
}

impl MessageReceiver {
    pub fn spawn(mut stream: MessageStream, depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(depth);
        tokio::spawn(async move {
            loop {
                match stream.receive_message().await {
                    Ok(Some(message)) => {
                        if tx.send(Ok(message)).await.is_err() {
                            // Consumer is gone; finish the closing
                            // handshake on the way out.
                            let _ = stream.close_connection().await;
                            return;
                        }
                    }
                    Ok(None) => {
                        debug!("closing handshake finished, stopping receiver");
                        return;
                    }
                    Err(error) => {
                        let fatal = !error.is_recoverable();
                        let _ = tx.send(Err(error)).await;
                        if fatal {
                            return;
                        }
                    }
                }
            }
        });
        Self {
            inner: ReceiverStream::new(rx),
        }
    }

    pub async fn receive(&mut self) -> Option<Result<Message, Error>> {
        futures::StreamExt::next(self).await
    }
}

impl Stream for MessageReceiver {
    type Item = Result<Message, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_next(cx)
    }
}

/// Send half: queues whole messages and writes them from its own task
/// through the shared frame writer.
pub struct MessageSender {
    tx: mpsc::Sender<Message>,
}

impl MessageSender {
    pub fn spawn(writer: Arc<Mutex<FrameWriter>>, dialect: Dialect, depth: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Message>(depth);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let result = if dialect.is_legacy_framing() {
                    let payload = message.into_payload();
                    writer.lock().await.write_legacy_text(&payload).await
                } else {
                    let frame = Frame::data(message.opcode(), message.into_payload(), true);
                    writer.lock().await.write_frame(&frame).await
                };
                if let Err(error) = result {
                    warn!("sender stopping: {}", error);
                    return;
                }
            }
        });
        Self { tx }
    }

    pub async fn send(&self, message: Message) -> Result<(), Error> {
        self.tx
            .send(message)
            .await
            .map_err(|e| Error::SendError { source: e })
    }

    pub fn send_nowait(&self, message: Message) -> Result<(), Error> {
        self.tx
            .try_send(message)
            .map_err(|_| Error::CommunicationError)
    }
}
