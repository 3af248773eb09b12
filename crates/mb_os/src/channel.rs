#![forbid(unsafe_code)]

use std::future::Future;
use std::time::Duration;

use mb_kernel_contracts::message::{ContextMessage, ContextResponse};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("no context is listening on the other end")]
    Unavailable,
    #[error("counterpart went away before answering")]
    Disconnected,
    #[error("no response within {0} ms")]
    Timeout(u64),
    #[error("channel transport failed: {0}")]
    Transport(String),
}

/// Request/response link to another execution context.
pub trait MessageChannel: Send + Sync {
    fn request(
        &self,
        message: ContextMessage,
    ) -> impl Future<Output = Result<ContextResponse, ChannelError>> + Send;
}

/// Races the request against a timer. A counterpart that never answers is reported as
/// `Timeout`, never as a hang.
pub async fn request_with_timeout<C>(
    channel: &C,
    message: ContextMessage,
    timeout_ms: u64,
) -> Result<ContextResponse, ChannelError>
where
    C: MessageChannel + ?Sized,
{
    let action = message.action;
    match tokio::time::timeout(Duration::from_millis(timeout_ms), channel.request(message)).await {
        Ok(result) => result,
        Err(_) => {
            debug!(action = action.as_str(), timeout_ms, "context message timed out");
            Err(ChannelError::Timeout(timeout_ms))
        }
    }
}

/// One in-flight request as seen by the serving context.
#[derive(Debug)]
pub struct Envelope {
    pub message: ContextMessage,
    pub reply: oneshot::Sender<ContextResponse>,
}

/// Channel to a context served on the same runtime.
#[derive(Debug, Clone)]
pub struct InProcessChannel {
    tx: mpsc::Sender<Envelope>,
}

impl InProcessChannel {
    pub fn pair(buffer: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

impl MessageChannel for InProcessChannel {
    async fn request(&self, message: ContextMessage) -> Result<ContextResponse, ChannelError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Envelope { message, reply })
            .await
            .map_err(|_| ChannelError::Unavailable)?;
        response.await.map_err(|_| ChannelError::Disconnected)
    }
}

/// The extension is not installed, or the page has no route to it.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableChannel;

impl MessageChannel for UnavailableChannel {
    async fn request(&self, _message: ContextMessage) -> Result<ContextResponse, ChannelError> {
        Err(ChannelError::Unavailable)
    }
}
