use std::net::SocketAddr;

use tokio::sync::broadcast;

use crate::frame::MessageKind;

/// Domain events for whoever is watching the server (a log pane, a test).
/// Observers run on their own task; the server never waits for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Started {
        addr: SocketAddr,
    },
    UserJoined {
        username: String,
    },
    UserLeft {
        username: String,
    },
    Rejected {
        peer: Option<SocketAddr>,
        reason: &'static str,
    },
    TextRelayed {
        from: String,
        to: String,
        text: String,
        delivered: bool,
    },
    FileChunkRelayed {
        from: String,
        to: String,
        kind: MessageKind,
        bytes: usize,
        delivered: bool,
    },
    Stopped,
}

#[derive(Debug, Clone)]
pub struct EventSender {
    inner: broadcast::Sender<ServerEvent>,
}

impl EventSender {
    pub fn new(capacity: usize) -> Self {
        let (inner, _) = broadcast::channel(capacity);
        Self { inner }
    }

    pub fn emit(&self, event: ServerEvent) {
        // An error only means nobody is subscribed right now.
        let _ = self.inner.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.subscribe()
    }
}
