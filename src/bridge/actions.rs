//! Deferred and synchronous action plumbing.
//!
//! Bridge-scope housekeeping is queued on the bridge and drained by
//! the shared manager thread, outside the bridge lock. Channel-scope
//! work rides the write queue; the synchronous variant blocks its
//! producer on a rendezvous with a hard ceiling so a dead consumer
//! cannot wedge it.

use super::{channel::BridgeChannel, Bridge, BridgeState, DeferredAction};
use crate::{
    constants::SYNC_ACTION_TIMEOUT,
    error::{Error, Result},
    frame::{ChannelAction, Frame, SyncAction, SyncTicket},
};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::trace;

static NEXT_SYNC_ID: AtomicU64 = AtomicU64::new(1);

/// Queues bridge-scope housekeeping and nudges the manager thread.
/// Bridge lock held.
pub(crate) fn queue_deferred(bridge: &Arc<Bridge>, state: &mut BridgeState, action: DeferredAction) {
    trace!("Bridge {} deferring {:?}.", bridge.uuid(), action);
    state.actions.push_back(action);

    if let Some(core) = bridge.core.upgrade() {
        core.request_service(bridge.clone());
    }
}

/// Drains one bridge's deferred queue. Runs on the manager thread,
/// never under the bridge lock.
pub(crate) fn service_bridge(bridge: &Arc<Bridge>) {
    loop {
        let action = bridge.lock().actions.pop_front();
        match action {
            None => break,
            Some(DeferredAction::TechDestroy { tech, pvt }) => {
                trace!(
                    "Destroying displaced technology {} for bridge {}.",
                    tech.name(),
                    bridge.uuid()
                );
                let mut carrier = BridgeState::carrier(tech.clone(), pvt);
                tech.destroy(&mut carrier);
            },
            Some(DeferredAction::Dissolving) => {
                bridge.kind().dissolving(bridge);
            },
        }
    }
}

/// Queues an action on a channel and blocks until its owner thread
/// services it.
///
/// The wait is bounded by [`SYNC_ACTION_TIMEOUT`]; if the channel
/// dies first, the dropped rendezvous unblocks the producer
/// immediately.
pub fn queue_action_sync(channel: &Arc<BridgeChannel>, action: ChannelAction) -> Result<()> {
    let (tx, rx) = flume::bounded(1);
    let id = NEXT_SYNC_ID.fetch_add(1, Ordering::Relaxed);

    channel.queue_frame(Frame::ActionSync(SyncAction {
        id,
        action,
        ticket: SyncTicket(tx),
    }))?;

    rx.recv_timeout(SYNC_ACTION_TIMEOUT)
        .map_err(|_| Error::SyncTimeout)
}
