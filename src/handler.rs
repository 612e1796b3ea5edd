use std::net::SocketAddr;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::sync::mpsc;
use tracing::debug;

use crate::sid::Sid;

/// This is the application's side of a client or server: it receives the (decompressed)
///  messages that sessions harvest from their engines, and is notified when the server
///  establishes a new session.
///
/// It is passed around as an `Arc<dyn ...>`, and calls come from the sessions' drive loops and
///  the receive loop, i.e. from several tasks concurrently.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    async fn on_message(&self, sid: Sid, from: SocketAddr, msg: Vec<u8>);

    /// Called by the server for a session created for a client's first confirmed datagram.
    ///  Clients never call this.
    async fn on_session_created(&self, _sid: Sid, _remote_addr: SocketAddr) {}
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SessionEvent {
    Message { sid: Sid, from: SocketAddr, msg: Vec<u8> },
    SessionCreated { sid: Sid, remote_addr: SocketAddr },
}

/// Adapts [SessionHandler] to a channel for applications that prefer to pull events
pub struct ChannelHandler {
    sender: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelHandler {
    pub fn new() -> (ChannelHandler, mpsc::UnboundedReceiver<SessionEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (ChannelHandler { sender }, receiver)
    }

    fn forward(&self, event: SessionEvent) {
        if self.sender.send(event).is_err() {
            debug!("event receiver was dropped - discarding event");
        }
    }
}

#[async_trait]
impl SessionHandler for ChannelHandler {
    async fn on_message(&self, sid: Sid, from: SocketAddr, msg: Vec<u8>) {
        self.forward(SessionEvent::Message { sid, from, msg });
    }

    async fn on_session_created(&self, sid: Sid, remote_addr: SocketAddr) {
        self.forward(SessionEvent::SessionCreated { sid, remote_addr });
    }
}
