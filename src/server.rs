//! JSON-RPC host for the query execution manager.
//!
//! The server reads framed requests from one byte stream (stdin) and writes
//! responses and notifications to another (stdout).
//!
//! ## Architecture
//!
//! ```text
//!   reader                                   writer
//!     |                                        ^
//!     v                                        |
//! +--------+     +------------+          +-----------+
//! | Server | --> | Dispatcher | -------> | mpsc      | <-- ChannelSender
//! +--------+     +------------+          | outbound  |     (query events)
//!                      |                 +-----------+
//!                      v
//!            +-----------------------+
//!            | QueryExecutionManager |
//!            +-----------------------+
//! ```
//!
//! ## Terminology
//!
//! - **Dispatcher**: runs one request against the manager and answers it
//! - **Outbound channel**: the single path to the writer, so a response and
//!   the notifications that follow it keep their order
//! - **ChannelSender**: event subscriber turning query events into
//!   notifications

mod dispatch;
mod error;
mod notify;

pub use dispatch::{Dispatcher, SqliteManager};
pub use error::ServerError;
pub use notify::{ChannelSender, event_notification};

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ExecutionSettings;
use crate::protocol::{Message, ProtocolError, RpcCodec, method};
use crate::source::ConnectionMap;
use crate::storage::RowStoreFactory;

/// Messages buffered for the writer before senders wait.
const OUTBOUND_CAPACITY: usize = 1024;

/// Query service bound to a pair of byte streams.
pub struct Server<F: RowStoreFactory> {
    manager: Arc<SqliteManager<F>>,
}

impl<F: RowStoreFactory> Server<F> {
    /// Creates a server with no open connections.
    pub fn new(factory: F, defaults: ExecutionSettings) -> Self {
        Self {
            manager: Arc::new(SqliteManager::new(
                Arc::new(ConnectionMap::new()),
                Arc::new(factory),
                defaults,
            )),
        }
    }

    pub fn manager(&self) -> &Arc<SqliteManager<F>> {
        &self.manager
    }

    /// Serves requests until `exit`, end of input, or a framing error.
    ///
    /// Running queries are canceled and disposed before returning, and
    /// everything queued for the writer is flushed.
    pub async fn serve<R, W>(self, reader: R, writer: W) -> Result<(), ServerError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let closing = CancellationToken::new();
        let writer_task = tokio::spawn(write_loop(
            FramedWrite::new(writer, RpcCodec::new()),
            rx,
            closing.clone(),
        ));

        let dispatcher = Dispatcher::new(self.manager.clone(), outbound);
        let mut frames = FramedRead::new(reader, RpcCodec::new());

        let result = loop {
            let message = match frames.next().await {
                Some(Ok(message)) => message,
                Some(Err(ProtocolError::Json(e))) => {
                    // The frame was consumed, the stream is still in sync
                    warn!(error = %e, "ignoring malformed message");
                    continue;
                }
                Some(Err(e)) => break Err(ServerError::Protocol(e)),
                None => {
                    info!("input closed");
                    break Ok(());
                }
            };

            match message {
                Message::Request(request) => {
                    if let Err(e) = dispatcher.handle(request).await {
                        break Err(e);
                    }
                }
                Message::Notification(notification) if notification.method == method::EXIT => {
                    info!("exit requested");
                    break Ok(());
                }
                Message::Notification(notification) => {
                    debug!(method = %notification.method, "ignoring notification");
                }
                Message::Response(response) => {
                    debug!(id = ?response.id, "ignoring response");
                }
            }
        };

        self.manager.shutdown().await;
        closing.cancel();
        match writer_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "failed to write output"),
            Err(e) => error!(error = %e, "writer task ended abnormally"),
        }
        result
    }
}

/// Writes queued messages until `closing` fires, then drains the queue.
async fn write_loop<W>(
    mut sink: FramedWrite<W, RpcCodec>,
    mut rx: mpsc::Receiver<Message>,
    closing: CancellationToken,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            message = rx.recv() => match message {
                Some(message) => sink.send(message).await?,
                None => break,
            },
            _ = closing.cancelled() => {
                while let Ok(message) = rx.try_recv() {
                    sink.send(message).await?;
                }
                break;
            }
        }
    }
    sink.flush().await?;
    Ok(())
}
