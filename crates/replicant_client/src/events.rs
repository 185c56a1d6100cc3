//! Structured client events.
//!
//! Every started/completed/failed transition for subscribe, unsubscribe and
//! subscription-update emits an event here, as does each fully processed
//! change-set. Observability tooling and UI binding layers subscribe through
//! [`EventDispatcher::listen`]; the core only calls into the listener list
//! after each atomic mutation.

use crate::connector::ConnectorState;
use replicant_protocol::ChannelAddress;

/// Aggregate counts for one processed change-set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageCounts {
    /// Channel ADD actions applied.
    pub channel_adds: usize,
    /// Channel REMOVE/DELETE actions applied.
    pub channel_removes: usize,
    /// Channel UPDATE actions applied.
    pub channel_updates: usize,
    /// Entity creates/updates applied.
    pub entity_updates: usize,
    /// Entity removes applied.
    pub entity_removes: usize,
    /// Entities linked.
    pub entity_links: usize,
}

/// An observable client event.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The connector changed state.
    ConnectorStateChanged {
        /// Prior state.
        from: ConnectorState,
        /// New state.
        to: ConnectorState,
    },
    /// A subscribe request was dispatched.
    SubscribeStarted {
        /// Target channel.
        address: ChannelAddress,
    },
    /// A subscribe request was acknowledged.
    SubscribeCompleted {
        /// Target channel.
        address: ChannelAddress,
    },
    /// A subscribe request failed.
    SubscribeFailed {
        /// Target channel.
        address: ChannelAddress,
        /// Failure description.
        error: String,
    },
    /// An unsubscribe request was dispatched.
    UnsubscribeStarted {
        /// Target channel.
        address: ChannelAddress,
    },
    /// An unsubscribe request was acknowledged.
    UnsubscribeCompleted {
        /// Target channel.
        address: ChannelAddress,
    },
    /// An unsubscribe request failed. The explicit-subscription flag is
    /// restored when this fires.
    UnsubscribeFailed {
        /// Target channel.
        address: ChannelAddress,
        /// Failure description.
        error: String,
    },
    /// A subscription-update request was dispatched.
    SubscriptionUpdateStarted {
        /// Target channel.
        address: ChannelAddress,
    },
    /// A subscription-update request was acknowledged.
    SubscriptionUpdateCompleted {
        /// Target channel.
        address: ChannelAddress,
    },
    /// A subscription-update request failed.
    SubscriptionUpdateFailed {
        /// Target channel.
        address: ChannelAddress,
        /// Failure description.
        error: String,
    },
    /// An explicit subscription no longer matches any area of interest and
    /// an unsubscribe was queued for it.
    SubscriptionOrphaned {
        /// The orphaned channel.
        address: ChannelAddress,
    },
    /// One change-set was fully applied to the world.
    MessageProcessed {
        /// Sequence of the processed change-set; `None` for out-of-band.
        sequence: Option<u64>,
        /// Aggregate change counts.
        counts: MessageCounts,
    },
}

/// Dispatches client events to registered listeners.
#[derive(Default)]
pub struct EventDispatcher {
    listeners: Vec<Box<dyn Fn(&ClientEvent)>>,
}

impl EventDispatcher {
    /// Creates an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener invoked for every emitted event.
    pub fn listen(&mut self, listener: impl Fn(&ClientEvent) + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Emits an event to every listener.
    pub fn emit(&self, event: ClientEvent) {
        for listener in &self.listeners {
            listener(&event);
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn dispatch_to_listeners() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut dispatcher = EventDispatcher::new();

        let sink = Rc::clone(&seen);
        dispatcher.listen(move |event| sink.borrow_mut().push(event.clone()));

        dispatcher.emit(ClientEvent::SubscribeStarted {
            address: ChannelAddress::new(1, 0),
        });

        assert_eq!(seen.borrow().len(), 1);
        assert!(matches!(
            seen.borrow()[0],
            ClientEvent::SubscribeStarted { .. }
        ));
    }
}
