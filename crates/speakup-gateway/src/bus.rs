use tokio::sync::broadcast;

/// Typed fan-out for one entity's change events. Consumers only ever see
/// `E`, never the transport.
#[derive(Debug)]
pub struct EventBus<E> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish to every current subscriber. Returns how many received it.
    pub fn publish(&self, event: E) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let bus: EventBus<u32> = EventBus::new(4);
        assert_eq!(bus.publish(1), 0);

        let mut rx = bus.subscribe();
        assert_eq!(bus.publish(2), 1);
        assert_eq!(rx.recv().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn each_subscriber_sees_every_event_in_order() {
        let bus: EventBus<u32> = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        for n in 0..3 {
            bus.publish(n);
        }
        for n in 0..3 {
            assert_eq!(a.recv().await.unwrap(), n);
            assert_eq!(b.recv().await.unwrap(), n);
        }
    }
}
