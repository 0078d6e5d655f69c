use tokio::sync::broadcast;

/// Events published by the streaming server's media-source bus.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    /// A source appeared (`registered = true`) or went away.
    Changed { app: String, stream: String, registered: bool },
    /// A source has no readers. Informational; transcoding keeps running for
    /// as long as the source exists.
    NoReaders { app: String, stream: String },
}

/// Broadcast fan-out for media-source events. The supervisor subscribes;
/// the webhook handler (or an embedding server) publishes.
pub struct MediaBus {
    tx: broadcast::Sender<SourceEvent>,
}

impl MediaBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SourceEvent> {
        self.tx.subscribe()
    }

    /// Delivery is best-effort: events published with no live subscriber are
    /// dropped.
    pub fn publish(&self, event: SourceEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for MediaBus {
    fn default() -> Self {
        Self::new()
    }
}
