//! Event Publisher
//!
//! Best-effort fan-out of lifecycle events to observers over a broadcast
//! channel. Nobody listening is the normal case; publish failures are
//! silently dropped and never affect correctness.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::energy::EnergyRegulator;
use crate::types::Event;

/// Buffered events per subscriber before lagging ones drop messages.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<Event>,
}

impl EventPublisher {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish one event. Best-effort: a send with no receivers is fine.
    pub fn publish(&self, event: Event) {
        trace!(?event, "publishing event");
        let _ = self.tx.send(event);
    }

    /// Subscribe an observer. Each subscriber sees events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the periodic energy ticker: one `energy_update` per second until
/// the handle is aborted.
pub fn spawn_energy_ticker(
    publisher: EventPublisher,
    regulator: Arc<EnergyRegulator>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            publisher.publish(Event::EnergyUpdate {
                energy: regulator.current(),
                percentage: regulator.percentage(),
                status: regulator.status(),
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EnergyStatus;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let publisher = EventPublisher::new();
        publisher.publish(Event::SleepStart { seconds: 3.0 });
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let publisher = EventPublisher::new();
        let mut rx = publisher.subscribe();
        publisher.publish(Event::EnergyUpdate {
            energy: 75.0,
            percentage: 75,
            status: EnergyStatus::High,
        });
        match rx.recv().await.unwrap() {
            Event::EnergyUpdate { energy, percentage, status } => {
                assert_eq!(energy, 75.0);
                assert_eq!(percentage, 75);
                assert_eq!(status, EnergyStatus::High);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_event_names_on_the_wire() {
        let json = serde_json::to_value(Event::ModelSwitched {
            from: "small".to_string(),
            to: "large".to_string(),
        })
        .unwrap();
        assert_eq!(json["event"], "model_switched");
        let json = serde_json::to_value(Event::ToolInvocation {
            name: "respond".to_string(),
            request_id: None,
        })
        .unwrap();
        assert_eq!(json["event"], "tool_invocation");
    }
}
