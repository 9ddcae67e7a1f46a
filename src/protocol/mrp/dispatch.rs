use super::message::Envelope;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 100;

/// Fans inbound envelopes out to subscribers from the single-threaded
/// event loop that owns the data-channel socket. Modeled on the
/// connection manager's `broadcast`-based event channel.
pub struct Dispatcher {
    tx: broadcast::Sender<Envelope>,
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to inbound envelopes. Each subscriber receives its own
    /// copy of every envelope dispatched after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    /// Deliver an inbound envelope to all current subscribers. Returns
    /// the number of subscribers it was delivered to; `0` is not an
    /// error, it just means nobody is listening right now.
    pub fn dispatch(&self, envelope: Envelope) -> usize {
        self.tx.send(envelope).unwrap_or(0)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mrp::message::MessageType;

    #[test]
    fn delivers_to_every_subscriber() {
        let dispatcher = Dispatcher::new();
        let mut a = dispatcher.subscribe();
        let mut b = dispatcher.subscribe();

        let envelope = Envelope::new(MessageType::SetState, Some("id".into()), vec![1]);
        let delivered = dispatcher.dispatch(envelope.clone());
        assert_eq!(delivered, 2);

        assert_eq!(a.try_recv().unwrap(), envelope);
        assert_eq!(b.try_recv().unwrap(), envelope);
    }

    #[test]
    fn dispatch_with_no_subscribers_does_not_error() {
        let dispatcher = Dispatcher::new();
        assert_eq!(dispatcher.dispatch(Envelope::default()), 0);
    }
}
