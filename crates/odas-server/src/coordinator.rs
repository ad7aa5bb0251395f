use std::sync::Arc;

use odas_core::MessageKind;
use tokio_util::sync::CancellationToken;

use crate::hub::BroadcastHub;
use crate::listener::{SourceEvent, SourceListener, SourceSink};

/// Routes listener output into the hub, tagging frames with their category.
///
/// Holds nothing but the hub handle: frames become `{"type": <category>}`
/// envelopes and status transitions become `{"type": "status"}`.
pub struct RelayCoordinator {
    hub: Arc<BroadcastHub>,
}

impl RelayCoordinator {
    pub fn new(hub: Arc<BroadcastHub>) -> Self {
        Self { hub }
    }

    /// Run a listener with this coordinator as its sink.
    pub fn attach(
        self: &Arc<Self>,
        listener: SourceListener,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let sink: Arc<dyn SourceSink> = Arc::clone(self) as Arc<dyn SourceSink>;
        tokio::spawn(listener.run(sink, shutdown))
    }
}

impl SourceSink for RelayCoordinator {
    fn on_event(&self, event: SourceEvent) {
        match event {
            SourceEvent::Frame { category, frame } => {
                self.hub.publish(category.into(), &frame);
            }
            SourceEvent::Status(status) => {
                self.hub.publish(MessageKind::Status, &status.to_payload());
            }
        }
    }
}
