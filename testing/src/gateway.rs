//! Scriptable in-memory gateway.
//!
//! [`ScriptedGateway`] stands in for the WebSocket transport. Tests script the
//! outcome of each `open`, push server frames into the current channel, drop the
//! channel to simulate network loss, and inspect every frame the client sent.

#![allow(clippy::unwrap_used)] // Test infrastructure: mutex poisoning is a test failure
#![allow(clippy::missing_panics_doc)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tikit_realtime_core::change::ChangeEnvelope;
use tikit_realtime_core::gateway::{
    BoxFuture, ChannelError, ClientFrame, FrameStream, Gateway, ServerFrame,
};
use tikit_realtime_core::topic::{ConnectionId, Credential};
use tokio::sync::mpsc;

type FrameSender = mpsc::UnboundedSender<Result<ServerFrame, ChannelError>>;
type FrameReceiver = mpsc::UnboundedReceiver<Result<ServerFrame, ChannelError>>;

/// Outcome of one scripted `open` call.
#[derive(Debug, Clone)]
pub enum OpenScript {
    /// Accept the handshake and assign a fresh connection id
    Accept,
    /// Fail the handshake with this error
    Reject(ChannelError),
    /// Never complete the handshake
    Hang,
}

#[derive(Debug, Default)]
struct GatewayInner {
    script: VecDeque<OpenScript>,
    opens: usize,
    closes: usize,
    credentials: Vec<String>,
    sent: Vec<ClientFrame>,
    sender: Option<FrameSender>,
    receiver: Option<FrameReceiver>,
    auto_pong: bool,
    fail_sends: bool,
}

/// In-memory [`Gateway`] driven by the test.
///
/// Unscripted `open` calls succeed. Cloning shares the underlying channel, so
/// a test keeps one clone and hands another to the client.
///
/// # Example
///
/// ```
/// use tikit_realtime_testing::{OpenScript, ScriptedGateway};
/// use tikit_realtime_core::gateway::{ChannelError, Gateway};
/// use tikit_realtime_core::topic::Credential;
///
/// # tokio_test::block_on(async {
/// let gateway = ScriptedGateway::new();
/// gateway.script_open(OpenScript::Reject(ChannelError::Auth("expired".into())));
///
/// let credential = Credential::bearer("token");
/// assert!(gateway.open(&credential).await.is_err());
/// assert!(gateway.open(&credential).await.is_ok());
/// assert_eq!(gateway.open_count(), 2);
/// # });
/// ```
#[derive(Debug, Clone, Default)]
pub struct ScriptedGateway {
    inner: Arc<Mutex<GatewayInner>>,
}

impl ScriptedGateway {
    /// Create a gateway that accepts every handshake.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every `ping` with a matching `pong`.
    #[must_use]
    pub fn with_auto_pong(self) -> Self {
        self.inner.lock().unwrap().auto_pong = true;
        self
    }

    /// Toggle automatic pongs.
    pub fn set_auto_pong(&self, enabled: bool) {
        self.inner.lock().unwrap().auto_pong = enabled;
    }

    /// Make every `send` fail with a transport error.
    pub fn set_fail_sends(&self, enabled: bool) {
        self.inner.lock().unwrap().fail_sends = enabled;
    }

    /// Queue the outcome of the next unscripted `open`.
    pub fn script_open(&self, outcome: OpenScript) {
        self.inner.lock().unwrap().script.push_back(outcome);
    }

    /// Queue `count` identical outcomes.
    pub fn script_opens(&self, outcome: &OpenScript, count: usize) {
        let mut inner = self.inner.lock().unwrap();
        for _ in 0..count {
            inner.script.push_back(outcome.clone());
        }
    }

    /// Deliver a frame on the open channel. Returns false if no channel is open.
    pub fn push(&self, frame: ServerFrame) -> bool {
        self.inner
            .lock()
            .unwrap()
            .sender
            .as_ref()
            .is_some_and(|tx| tx.send(Ok(frame)).is_ok())
    }

    /// Deliver a change notification on the open channel.
    pub fn push_change(&self, envelope: ChangeEnvelope) -> bool {
        self.push(ServerFrame::Change(envelope))
    }

    /// Simulate an unsolicited loss: the inbound stream ends.
    pub fn drop_channel(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.sender = None;
        inner.receiver = None;
    }

    /// Simulate a transport fault: the inbound stream yields `error`, then ends.
    pub fn fail_channel(&self, error: ChannelError) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(tx) = inner.sender.take() {
            let _ = tx.send(Err(error));
        }
    }

    /// Whether a channel is currently open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.lock().unwrap().sender.is_some()
    }

    /// Number of `open` calls so far.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.inner.lock().unwrap().opens
    }

    /// Number of `close` calls so far.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.inner.lock().unwrap().closes
    }

    /// Bearer tokens presented to `open`, in call order.
    #[must_use]
    pub fn credentials(&self) -> Vec<String> {
        self.inner.lock().unwrap().credentials.clone()
    }

    /// Every frame sent by the client, in order.
    #[must_use]
    pub fn sent_frames(&self) -> Vec<ClientFrame> {
        self.inner.lock().unwrap().sent.clone()
    }

    /// Only the `subscribe` frames sent by the client.
    #[must_use]
    pub fn subscribe_frames(&self) -> Vec<ClientFrame> {
        self.sent_frames()
            .into_iter()
            .filter(|frame| matches!(frame, ClientFrame::Subscribe { .. }))
            .collect()
    }

    /// Only the `unsubscribe` frames sent by the client.
    #[must_use]
    pub fn unsubscribe_frames(&self) -> Vec<ClientFrame> {
        self.sent_frames()
            .into_iter()
            .filter(|frame| matches!(frame, ClientFrame::Unsubscribe { .. }))
            .collect()
    }

    /// References of every `ping` sent by the client.
    #[must_use]
    pub fn pings(&self) -> Vec<u64> {
        self.sent_frames()
            .into_iter()
            .filter_map(|frame| match frame {
                ClientFrame::Ping { reference } => Some(reference),
                _ => None,
            })
            .collect()
    }

    /// Forget recorded frames.
    pub fn clear_sent(&self) {
        self.inner.lock().unwrap().sent.clear();
    }
}

impl Gateway for ScriptedGateway {
    fn open(&self, credential: &Credential) -> BoxFuture<'_, Result<ConnectionId, ChannelError>> {
        let token = credential.token().to_string();
        Box::pin(async move {
            let outcome = {
                let mut inner = self.inner.lock().unwrap();
                inner.opens += 1;
                inner.credentials.push(token);
                inner.script.pop_front().unwrap_or(OpenScript::Accept)
            };

            match outcome {
                OpenScript::Accept => {
                    let mut inner = self.inner.lock().unwrap();
                    let (tx, rx) = mpsc::unbounded_channel();
                    inner.sender = Some(tx);
                    inner.receiver = Some(rx);
                    Ok(ConnectionId::new(format!("conn-{}", inner.opens)))
                },
                OpenScript::Reject(error) => Err(error),
                OpenScript::Hang => std::future::pending().await,
            }
        })
    }

    fn inbound(&self) -> FrameStream {
        let receiver = self.inner.lock().unwrap().receiver.take();
        Box::pin(async_stream::stream! {
            if let Some(mut rx) = receiver {
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            }
        })
    }

    fn send(&self, frame: ClientFrame) -> BoxFuture<'_, Result<(), ChannelError>> {
        Box::pin(async move {
            let mut inner = self.inner.lock().unwrap();
            if inner.fail_sends {
                return Err(ChannelError::Transport("send failed".to_string()));
            }
            let Some(tx) = inner.sender.clone() else {
                return Err(ChannelError::Closed);
            };

            if inner.auto_pong {
                if let ClientFrame::Ping { reference } = &frame {
                    let _ = tx.send(Ok(ServerFrame::Pong {
                        reference: *reference,
                    }));
                }
            }
            inner.sent.push(frame);
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut inner = self.inner.lock().unwrap();
            inner.closes += 1;
            inner.sender = None;
            inner.receiver = None;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn frames_flow_until_the_channel_drops() {
        let gateway = ScriptedGateway::new();
        gateway.open(&Credential::bearer("t")).await.unwrap();
        let mut inbound = gateway.inbound();

        assert!(gateway.push(ServerFrame::Pong { reference: 1 }));
        gateway.drop_channel();

        assert!(matches!(
            inbound.next().await,
            Some(Ok(ServerFrame::Pong { reference: 1 }))
        ));
        assert!(inbound.next().await.is_none());
        assert!(!gateway.push(ServerFrame::Pong { reference: 2 }));
    }

    #[tokio::test]
    async fn auto_pong_answers_pings() {
        let gateway = ScriptedGateway::new().with_auto_pong();
        gateway.open(&Credential::bearer("t")).await.unwrap();
        let mut inbound = gateway.inbound();

        gateway.send(ClientFrame::Ping { reference: 9 }).await.unwrap();

        assert!(matches!(
            inbound.next().await,
            Some(Ok(ServerFrame::Pong { reference: 9 }))
        ));
        assert_eq!(gateway.pings(), vec![9]);
    }

    #[tokio::test]
    async fn send_without_channel_is_closed() {
        let gateway = ScriptedGateway::new();
        assert_eq!(
            gateway.send(ClientFrame::Ping { reference: 1 }).await,
            Err(ChannelError::Closed)
        );
    }

    #[tokio::test]
    async fn inbound_before_open_ends_immediately() {
        let gateway = ScriptedGateway::new();
        assert!(gateway.inbound().next().await.is_none());
    }
}
