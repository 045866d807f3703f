use crate::types::ChainEvent;

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<ChainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: ChainEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ChainEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RunStatus;
    use crate::types::RunId;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let run_id = RunId::new();
        bus.publish(ChainEvent::RunFinished {
            run_id: run_id.clone(),
            status: RunStatus::Completed,
        });
        match rx.recv().await.unwrap() {
            ChainEvent::RunFinished { run_id: got, status } => {
                assert_eq!(got, run_id);
                assert_eq!(status, RunStatus::Completed);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let bus = EventBus::default();
        bus.publish(ChainEvent::RunFinished {
            run_id: RunId::new(),
            status: RunStatus::Failed,
        });
    }
}
