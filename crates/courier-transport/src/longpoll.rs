//! One-shot long-poll transport.
//!
//! A long-poll request carries no inbound stream: its identity and optional
//! command arrive with the request itself. The writer accepts exactly one
//! message, which becomes the HTTP response body.

use async_trait::async_trait;
use courier_protocol::Message;
use tokio::sync::oneshot;

use crate::traits::{CloseCode, MessageWriter, TransportError, TransportKind};

/// Create a writer and the response slot it fills.
#[must_use]
pub fn channel() -> (LongPollWriter, LongPollResponse) {
    let (tx, rx) = oneshot::channel();
    (LongPollWriter { slot: Some(tx) }, LongPollResponse { rx })
}

/// Writer half. Accepts a single message.
#[derive(Debug)]
pub struct LongPollWriter {
    slot: Option<oneshot::Sender<Message>>,
}

#[async_trait]
impl MessageWriter for LongPollWriter {
    async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        let slot = self.slot.take().ok_or(TransportError::ConnectionClosed)?;
        slot.send(message.clone())
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self, _code: CloseCode) -> Result<(), TransportError> {
        self.slot = None;
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::LongPoll
    }
}

/// The pending response of a long-poll request.
#[derive(Debug)]
pub struct LongPollResponse {
    rx: oneshot::Receiver<Message>,
}

impl LongPollResponse {
    /// Wait for the message. `None` if the writer closed without one.
    ///
    /// Cancel safe: dropping the future leaves the slot intact.
    pub async fn recv(&mut self) -> Option<Message> {
        (&mut self.rx).await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[tokio::test]
    async fn test_single_message() {
        let (mut writer, mut response) = channel();
        writer.send(&Message::new("a", Map::new(), 1)).await.unwrap();

        let second = writer.send(&Message::new("b", Map::new(), 2)).await;
        assert!(matches!(second, Err(TransportError::ConnectionClosed)));

        assert_eq!(response.recv().await.unwrap().event, "a");
    }

    #[tokio::test]
    async fn test_close_without_message() {
        let (mut writer, mut response) = channel();
        writer.close(CloseCode::Normal).await.unwrap();
        assert!(response.recv().await.is_none());
    }
}
