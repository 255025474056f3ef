//! Transfer primitives, expressed over move and merge.
//!
//! A blind transfer sends the transferee (or the whole bridge,
//! through an unreal-channel tunnel) to a dialplan location. An
//! attended transfer stitches the transferer's two bridges together,
//! dropping the transferer's own legs.

use super::motion::{do_merge_locked, do_move_locked, lock_pair, pick_merge_direction};
use crate::{
    bridge::{
        self,
        channel::ChannelStatus,
        registry::Core,
        Bridge,
        BridgeFlags,
        Cause,
    },
    endpoint::Endpoint,
    error::{Error, Result},
    events::{BusEvent, TransferResult},
    frame::ChannelAction,
    ops::{impart, ImpartMode},
    features::FeatureSet,
};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

fn publish_blind(
    core: &Arc<Core>,
    result: TransferResult,
    transferer: &Arc<dyn Endpoint>,
    context: &str,
    exten: &str,
) {
    core.publish(BusEvent::BlindTransfer {
        result,
        transferer: transferer.name(),
        context: context.to_string(),
        exten: exten.to_string(),
    });
}

/// Blind-transfers out of a bridge to `exten@context`.
///
/// A two-party bridge sends the peer alone; a larger bridge (or one
/// flagged transfer-bridge-only) is tunnelled through an unreal
/// channel pair. A destination holding the parking marker diverts
/// into the parking path instead.
pub fn blind(
    core: &Arc<Core>,
    bridge: &Arc<Bridge>,
    transferer: &Arc<dyn Endpoint>,
    context: &str,
    exten: &str,
) -> Result<()> {
    if bridge
        .lock()
        .flags()
        .contains(BridgeFlags::TRANSFER_PROHIBITED)
    {
        publish_blind(core, TransferResult::NotPermitted, transferer, context, exten);
        return Err(Error::Inhibited);
    }

    let dialplan = match core.dialplan() {
        Some(d) => d,
        None => {
            publish_blind(core, TransferResult::Invalid, transferer, context, exten);
            return Err(Error::InvalidArgument);
        },
    };
    if !dialplan.exten_exists(context, exten) {
        publish_blind(core, TransferResult::Invalid, transferer, context, exten);
        return Err(Error::InvalidArgument);
    }

    // The parking marker diverts the transfer into the parking path.
    let park_app = core.config().park_app;
    if dialplan
        .exten_app(context, exten)
        .map(|app| app.eq_ignore_ascii_case(&park_app))
        .unwrap_or(false)
    {
        debug!(
            "Blind transfer by {} to {}@{} is a park.",
            transferer.name(),
            exten,
            context
        );
        let parked = crate::park::blind_transfer_park(core, bridge, transferer, exten);
        let result = match &parked {
            Ok(()) => TransferResult::Success,
            Err(_) => TransferResult::Failed,
        };
        publish_blind(core, result, transferer, context, exten);
        return parked.map_err(|_| Error::TransferFailed);
    }

    enum Plan {
        Peer(Arc<dyn Endpoint>),
        Tunnel,
    }

    let plan = {
        let state = bridge.lock();
        let member = state.member_of(transferer).ok_or(Error::NotInBridge)?;
        if member.status() != ChannelStatus::Wait {
            return Err(Error::WrongState);
        }

        if state.num_channels() == 2 && !state.flags().contains(BridgeFlags::TRANSFER_BRIDGE_ONLY)
        {
            let peer = state.peers_of(&member).into_iter().next();
            match peer {
                Some(peer) => Plan::Peer(peer.endpoint()),
                None => return Err(Error::WrongState),
            }
        } else {
            Plan::Tunnel
        }
    };

    match plan {
        Plan::Peer(peer) => {
            peer.set_variable("BLINDTRANSFER", &transferer.name());
            transferer.set_variable("BLINDTRANSFER", &peer.name());

            let state = bridge.lock();
            let transferee = state.member_of(&peer).ok_or(Error::NotInBridge)?;
            transferee.queue_action(ChannelAction::BlindTransfer {
                context: context.to_string(),
                exten: exten.to_string(),
            })?;

            let member = state.member_of(transferer).ok_or(Error::NotInBridge)?;
            member.leave_bridge(ChannelStatus::EndNoDissolve, Cause::NormalClearing);
        },
        Plan::Tunnel => {
            let factory = match core.unreal_factory() {
                Some(f) => f,
                None => {
                    warn!(
                        "No unreal factory; cannot tunnel blind transfer of bridge {}.",
                        bridge.uuid()
                    );
                    publish_blind(core, TransferResult::Failed, transferer, context, exten);
                    return Err(Error::TransferFailed);
                },
            };

            let (inside, outside) =
                factory.create(&format!("{}@{}", exten, context)).map_err(|e| {
                    publish_blind(core, TransferResult::Failed, transferer, context, exten);
                    e
                })?;

            impart(bridge, inside, FeatureSet::new(), ImpartMode::Independent)?;
            outside.async_goto(context, exten, 1)?;

            let state = bridge.lock();
            if let Some(member) = state.member_of(transferer) {
                member.leave_bridge(ChannelStatus::EndNoDissolve, Cause::NormalClearing);
            }
        },
    }

    info!(
        "Blind transfer by {} to {}@{} complete.",
        transferer.name(),
        exten,
        context
    );
    publish_blind(core, TransferResult::Success, transferer, context, exten);
    Ok(())
}

/// Completes an attended transfer.
///
/// `to_transferee` and `to_target` are the transferer's two legs: one
/// bridged with the transferee party, the other with the transfer
/// target. Both legs leave; their bridges become one conversation by
/// swap or merge.
pub fn attended(
    core: &Arc<Core>,
    to_transferee: &Arc<dyn Endpoint>,
    to_target: &Arc<dyn Endpoint>,
) -> Result<()> {
    let b1 = to_transferee
        .bridge_id()
        .and_then(|id| core.get_bridge(id));
    let b2 = to_target.bridge_id().and_then(|id| core.get_bridge(id));

    let (b1, b2) = match (b1, b2) {
        (Some(b1), Some(b2)) if !Arc::ptr_eq(&b1, &b2) => (b1, b2),
        _ => {
            core.publish(BusEvent::AttendedTransfer {
                result: TransferResult::Failed,
                surviving_bridge: None,
            });
            return Err(Error::TransferFailed);
        },
    };

    match two_bridge_attended(&b1, &b2, to_transferee, to_target) {
        Ok(uuid) => {
            core.publish(BusEvent::AttendedTransfer {
                result: TransferResult::Success,
                surviving_bridge: Some(uuid),
            });
            Ok(())
        },
        Err(e) => {
            core.publish(BusEvent::AttendedTransfer {
                result: match e {
                    Error::Inhibited => TransferResult::NotPermitted,
                    _ => TransferResult::Failed,
                },
                surviving_bridge: None,
            });
            Err(e)
        },
    }
}

fn two_bridge_attended(
    b1: &Arc<Bridge>,
    b2: &Arc<Bridge>,
    to_transferee: &Arc<dyn Endpoint>,
    to_target: &Arc<dyn Endpoint>,
) -> Result<Uuid> {
    let (mut s1, mut s2) = lock_pair(b1, b2);

    if s1.flags().contains(BridgeFlags::TRANSFER_PROHIBITED)
        || s2.flags().contains(BridgeFlags::TRANSFER_PROHIBITED)
    {
        return Err(Error::Inhibited);
    }

    let t1 = s1.member_of(to_transferee).ok_or(Error::NotInBridge)?;
    let t2 = s2.member_of(to_target).ok_or(Error::NotInBridge)?;
    if t1.status() != ChannelStatus::Wait || t2.status() != ChannelStatus::Wait {
        return Err(Error::WrongState);
    }

    let kicks: Vec<Arc<dyn Endpoint>> = vec![to_transferee.clone(), to_target.clone()];
    let p1 = b1.kind().merge_priority(&s1);
    let p2 = b2.kind().merge_priority(&s2);

    let no_bridge_only = !s1.flags().contains(BridgeFlags::TRANSFER_BRIDGE_ONLY)
        && !s2.flags().contains(BridgeFlags::TRANSFER_BRIDGE_ONLY);

    let surviving = if p1 != p2 {
        // Priorities differ: merge toward the important bridge.
        if p1 > p2 {
            do_merge_locked(b1, &mut s1, b2, &mut s2, &kicks, false)?;
            b1.uuid()
        } else {
            do_merge_locked(b2, &mut s2, b1, &mut s1, &kicks, false)?;
            b2.uuid()
        }
    } else if no_bridge_only
        && s2.num_channels() == 2
        && !s2.flags().contains(BridgeFlags::SWAP_INHIBIT_FROM)
        && !s1.flags().contains(BridgeFlags::SWAP_INHIBIT_TO)
    {
        // Swap the target party straight into the transferee bridge.
        let target_party = s2
            .peers_of(&t2)
            .into_iter()
            .next()
            .ok_or(Error::WrongState)?
            .endpoint();
        do_move_locked(
            b1,
            &mut s1,
            b2,
            &mut s2,
            &target_party,
            Some(to_transferee),
            false,
        )?;
        t2.leave_bridge(ChannelStatus::EndNoDissolve, Cause::NormalClearing);
        b1.uuid()
    } else if no_bridge_only
        && s1.num_channels() == 2
        && !s1.flags().contains(BridgeFlags::SWAP_INHIBIT_FROM)
        && !s2.flags().contains(BridgeFlags::SWAP_INHIBIT_TO)
    {
        let transferee_party = s1
            .peers_of(&t1)
            .into_iter()
            .next()
            .ok_or(Error::WrongState)?
            .endpoint();
        do_move_locked(
            b2,
            &mut s2,
            b1,
            &mut s1,
            &transferee_party,
            Some(to_target),
            false,
        )?;
        t1.leave_bridge(ChannelStatus::EndNoDissolve, Cause::NormalClearing);
        b2.uuid()
    } else {
        if pick_merge_direction(b1, &s1, b2, &s2)? {
            do_merge_locked(b1, &mut s1, b2, &mut s2, &kicks, false)?;
            b1.uuid()
        } else {
            do_merge_locked(b2, &mut s2, b1, &mut s1, &kicks, false)?;
            b2.uuid()
        }
    };

    let transferer = to_transferee.name();
    let surviving_state = if surviving == b1.uuid() { &s1 } else { &s2 };
    for member in surviving_state.channels() {
        member
            .endpoint()
            .set_variable("ATTENDEDTRANSFER", &transferer);
    }

    bridge::reconfigured_locked(b1, &mut s1, true);
    bridge::reconfigured_locked(b2, &mut s2, true);

    info!(
        "Attended transfer by {} complete; bridge {} survives.",
        transferer, surviving
    );
    Ok(surviving)
}
