//! The observer bus: bridge lifecycle and transfer publications.
//!
//! Publications are lossless and ordered per bridge: the bus serialises
//! `publish` under its own lock and every subscriber owns an unbounded
//! queue, so a slow observer delays nothing and drops nothing.

use crate::bridge::Cause;
use parking_lot::Mutex;
use uuid::Uuid;

/// Outcome attached to transfer publications.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum TransferResult {
    /// The transfer completed.
    Success,
    /// The transfer was refused by configuration or state.
    NotPermitted,
    /// The requested destination was invalid.
    Invalid,
    /// The transfer was attempted and failed.
    Failed,
}

/// Kinds of parked-call publication.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParkedCallKind {
    /// A call entered a parking space.
    Parked,
    /// A parked call waited out its timer.
    Timeout,
    /// A parked call hung up before retrieval.
    Giveup,
    /// A parked call was retrieved.
    Unparked,
    /// A parked call was forcibly removed.
    Forced,
    /// A park attempt failed.
    Failed,
    /// A parked call changed spaces without releasing the old one.
    Swap,
}

/// A parked-call publication.
#[derive(Clone, Debug)]
pub struct ParkedCall {
    /// Publication kind.
    pub kind: ParkedCallKind,
    /// The lot involved.
    pub lot: String,
    /// Name of the parked channel.
    pub parkee: String,
    /// Dial string of the channel that parked it, if known.
    pub parker: Option<String>,
    /// The space assigned, when one was.
    pub space: Option<u32>,
}

/// Events published to the observer bus.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum BusEvent {
    /// A bridge finished construction and was registered.
    BridgeCreated {
        /// The new bridge.
        bridge: Uuid,
    },
    /// A bridge was dissolved.
    BridgeDissolved {
        /// The dissolved bridge.
        bridge: Uuid,
        /// The recorded cause.
        cause: Cause,
    },
    /// A channel entered a bridge.
    Enter {
        /// The bridge entered.
        bridge: Uuid,
        /// The entering channel's name.
        channel: String,
        /// Name of the channel it replaced, for swaps.
        swapped: Option<String>,
    },
    /// A channel left a bridge.
    Leave {
        /// The bridge left.
        bridge: Uuid,
        /// The leaving channel's name.
        channel: String,
    },
    /// One bridge's members were merged into another.
    Merge {
        /// The surviving bridge.
        to: Uuid,
        /// The emptied bridge.
        from: Uuid,
    },
    /// A blind transfer was attempted.
    BlindTransfer {
        /// Outcome.
        result: TransferResult,
        /// Name of the transferring channel.
        transferer: String,
        /// Destination context.
        context: String,
        /// Destination extension.
        exten: String,
    },
    /// An attended transfer was attempted.
    AttendedTransfer {
        /// Outcome.
        result: TransferResult,
        /// Bridge holding the transferee, if any survived.
        surviving_bridge: Option<Uuid>,
    },
    /// An unreal-channel optimization began.
    OptimizationBegin {
        /// Process-wide run identifier.
        id: u64,
    },
    /// An unreal-channel optimization completed.
    OptimizationEnd {
        /// Process-wide run identifier.
        id: u64,
    },
    /// A parking lot publication.
    Park(ParkedCall),
}

/// The shared observer bus.
///
/// Subscribers receive every event published after they subscribe;
/// a dropped receiver is pruned on the next publish.
#[derive(Debug, Default)]
pub struct Bus {
    subscribers: Mutex<Vec<flume::Sender<BusEvent>>>,
}

impl Bus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a new subscriber.
    pub fn subscribe(&self) -> flume::Receiver<BusEvent> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Publishes one event to every live subscriber.
    pub fn publish(&self, event: BusEvent) {
        let mut subs = self.subscribers.lock();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_arrive_in_publish_order() {
        let bus = Bus::new();
        let rx = bus.subscribe();
        let id = Uuid::new_v4();

        bus.publish(BusEvent::BridgeCreated { bridge: id });
        bus.publish(BusEvent::Enter {
            bridge: id,
            channel: "SIP/alice".into(),
            swapped: None,
        });
        bus.publish(BusEvent::Leave {
            bridge: id,
            channel: "SIP/alice".into(),
        });

        assert!(matches!(rx.recv().unwrap(), BusEvent::BridgeCreated { .. }));
        assert!(matches!(rx.recv().unwrap(), BusEvent::Enter { .. }));
        assert!(matches!(rx.recv().unwrap(), BusEvent::Leave { .. }));
    }

    #[test]
    fn dead_subscribers_are_pruned() {
        let bus = Bus::new();
        let rx = bus.subscribe();
        drop(rx);

        bus.publish(BusEvent::OptimizationBegin { id: 1 });
        assert!(bus.subscribers.lock().is_empty());
    }
}
