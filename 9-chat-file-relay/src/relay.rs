use std::{io, sync::Arc};

use tracing::{debug, trace};

use crate::{
    event::{EventSender, ServerEvent},
    frame::{self, MessageKind},
    registry::{Registry, SessionHandle},
};

/// Routes decoded frames to their destination session.
///
/// Unknown destinations are not an error: text is still echoed to the sender
/// and file chunks are dropped. Nothing tells the sender the peer is offline.
#[derive(Clone)]
pub struct Relay {
    registry: Arc<Registry>,
    events: EventSender,
}

impl Relay {
    pub fn new(registry: Arc<Registry>, events: EventSender) -> Self {
        Self { registry, events }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Sends `sender;Text;content\n` to `dest` when it is online, then echoes
    /// the same frame back to the sender.
    ///
    /// Only a failure to write the echo is returned; it means the sender's own
    /// connection is broken.
    pub async fn relay_text(&self, sender: &SessionHandle, dest: &str, content: &[u8]) -> io::Result<()> {
        let encoded = frame::encode(sender.username(), MessageKind::Text, content);

        let delivered = match self.registry.lookup(dest) {
            Some(target) => deliver(&target, &encoded).await,
            None => {
                debug!(from = sender.username(), to = dest, "text for unknown user dropped");
                false
            }
        };

        self.events.emit(ServerEvent::TextRelayed {
            from: sender.username().to_string(),
            to: dest.to_string(),
            text: String::from_utf8_lossy(content).into_owned(),
            delivered,
        });

        sender.send(&encoded).await
    }

    /// Forwards a raw file frame, exactly as it was read, to `dest`.
    pub async fn relay_file_chunk(&self, sender: &str, dest: &str, kind: MessageKind, raw: &[u8]) {
        let delivered = match self.registry.lookup(dest) {
            Some(target) => deliver(&target, raw).await,
            None => {
                debug!(from = sender, to = dest, %kind, "file chunk for unknown user dropped");
                false
            }
        };

        trace!(from = sender, to = dest, %kind, bytes = raw.len(), delivered, "file chunk relayed");
        self.events.emit(ServerEvent::FileChunkRelayed {
            from: sender.to_string(),
            to: dest.to_string(),
            kind,
            bytes: raw.len(),
            delivered,
        });
    }
}

/// A broken destination is that session's problem; its own read loop will
/// notice and clean up.
async fn deliver(target: &SessionHandle, bytes: &[u8]) -> bool {
    match target.send(bytes).await {
        Ok(()) => true,
        Err(err) => {
            debug!(to = target.username(), ?err, "failed to deliver to destination");
            false
        }
    }
}
