//! Write-once response delivery.
//!
//! The device runtime completes commands on its own thread; the reply
//! crosses back to the requester through a oneshot channel rather than a
//! raw context pointer. The promise side is single-use by construction:
//! delivering consumes it.

use tokio::sync::oneshot;

use crate::error::{RelayKernelError, Result};
use crate::output::Reply;

/// Create a connected promise/future pair for one request.
pub fn response_channel() -> (ResponsePromise, ResponseFuture) {
    let (tx, rx) = oneshot::channel();
    (ResponsePromise { tx }, ResponseFuture { rx })
}

/// Single-use delivery target for one command's reply.
pub struct ResponsePromise {
    tx: oneshot::Sender<Result<Reply>>,
}

impl ResponsePromise {
    /// Deliver the terminal outcome of the command. A requester that has
    /// dropped its future is not an error; the outcome is discarded.
    pub fn deliver(self, outcome: Result<Reply>) {
        if self.tx.send(outcome).is_err() {
            tracing::debug!("requester dropped before delivery; reply discarded");
        }
    }
}

impl std::fmt::Debug for ResponsePromise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ResponsePromise")
    }
}

/// Requester-side handle resolving to the command's reply.
pub struct ResponseFuture {
    rx: oneshot::Receiver<Result<Reply>>,
}

impl ResponseFuture {
    /// Wait for the reply. Resolves to [`RelayKernelError::ChannelClosed`]
    /// if the command was destroyed without delivering.
    pub async fn wait(self) -> Result<Reply> {
        self.rx.await.map_err(|_| RelayKernelError::ChannelClosed)?
    }

    /// Poll for the reply without waiting.
    pub fn try_wait(&mut self) -> Option<Result<Reply>> {
        self.rx.try_recv().ok()
    }
}

impl std::fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ResponseFuture")
    }
}
