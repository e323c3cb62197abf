use tokio::sync::mpsc;
use tracing::debug;

use crate::types::Event;

/// Live event stream towards one observer.
///
/// Sending never blocks and never fails the pipeline: once the observer is
/// gone, events are dropped.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSink {
    /// Create a sink together with the receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: Event) {
        debug!(?event, "event");
        let _ = self.tx.send(event);
    }

    pub fn log(&self, text: impl Into<String>) {
        self.emit(Event::Log { text: text.into() });
    }

    pub fn error(&self, text: impl Into<String>) {
        self.emit(Event::Error { text: text.into() });
    }
}
