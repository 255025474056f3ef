//! Structural motion between bridges: move and merge.
//!
//! Both operations take the two bridge locks in ascending address
//! order and hold them across the whole structural change, so no
//! third party ever observes a channel belonging to neither bridge.

use crate::{
    bridge::{
        self,
        channel::{self, ChannelStatus},
        Bridge,
        BridgeFlags,
        BridgeState,
        Cause,
    },
    endpoint::Endpoint,
    error::{Error, Result},
    events::BusEvent,
    tech::Capabilities,
};
use parking_lot::MutexGuard;
use std::sync::Arc;
use tracing::{debug, warn};

/// Locks two distinct bridges in ascending address order, returning
/// the guards in argument order.
pub(crate) fn lock_pair<'a>(
    a: &'a Arc<Bridge>,
    b: &'a Arc<Bridge>,
) -> (MutexGuard<'a, BridgeState>, MutexGuard<'a, BridgeState>) {
    let pa = Arc::as_ptr(a) as usize;
    let pb = Arc::as_ptr(b) as usize;

    if pa < pb {
        let ga = a.lock();
        let gb = b.lock();
        (ga, gb)
    } else {
        let gb = b.lock();
        let ga = a.lock();
        (ga, gb)
    }
}

fn motion_allowed(state: &BridgeState) -> Result<()> {
    if state.dissolved() {
        return Err(Error::Dissolved);
    }
    if state.flags().contains(BridgeFlags::MASQUERADE_ONLY) {
        return Err(Error::Inhibited);
    }
    if state.merge_inhibited() {
        return Err(Error::Inhibited);
    }
    Ok(())
}

/// Moves one member from `src` to `dst`, optionally swapping out a
/// `dst` occupant, with both locks already held.
pub(crate) fn do_move_locked(
    dst: &Arc<Bridge>,
    dst_state: &mut BridgeState,
    src: &Arc<Bridge>,
    src_state: &mut BridgeState,
    endpoint: &Arc<dyn Endpoint>,
    swap: Option<&Arc<dyn Endpoint>>,
    attempt_recovery: bool,
) -> Result<()> {
    motion_allowed(dst_state)?;
    motion_allowed(src_state)?;

    let moving = src_state.member_of(endpoint).ok_or(Error::NotInBridge)?;
    if moving.status() != ChannelStatus::Wait {
        return Err(Error::WrongState);
    }
    if moving
        .features()
        .flags
        .contains(crate::features::ChannelFeatureFlags::IMMOVABLE)
    {
        return Err(Error::Inhibited);
    }

    if let Some(swap_target) = swap {
        let occupant = dst_state.member_of(swap_target).ok_or(Error::NotInBridge)?;
        if occupant.status() != ChannelStatus::Wait {
            return Err(Error::WrongState);
        }
    }

    debug!(
        "Moving {} from bridge {} to {}.",
        endpoint.name(),
        src.uuid(),
        dst.uuid()
    );

    bridge::pull_locked(src, src_state, &moving);
    if moving.status() != ChannelStatus::Wait {
        // Died during the pull; nothing left to push.
        return Err(Error::WrongState);
    }

    moving.set_bridge(dst.clone());
    channel::run_move_hooks(&moving, src, dst);
    moving.set_swap(swap.cloned());

    match bridge::push_locked(dst, dst_state, &moving) {
        Ok(()) => {
            moving.settle_owed_locked(src_state);
            Ok(())
        },
        Err(e) => {
            if attempt_recovery {
                warn!(
                    "Move of {} failed; pushing back into bridge {}.",
                    endpoint.name(),
                    src.uuid()
                );
                moving.set_bridge(src.clone());
                channel::run_move_hooks(&moving, dst, src);
                if bridge::push_locked(src, src_state, &moving).is_ok() {
                    return Err(e);
                }
            }
            moving.leave_bridge(ChannelStatus::EndNoDissolve, Cause::NormalClearing);
            Err(e)
        },
    }
}

/// Moves a channel between bridges.
///
/// With `attempt_recovery`, a failed push into `dst` tries to restore
/// the channel to `src`; a channel that fits neither bridge is
/// kicked.
pub fn move_channel(
    dst: &Arc<Bridge>,
    src: &Arc<Bridge>,
    endpoint: &Arc<dyn Endpoint>,
    swap: Option<&Arc<dyn Endpoint>>,
    attempt_recovery: bool,
) -> Result<()> {
    if Arc::ptr_eq(dst, src) {
        return Err(Error::InvalidArgument);
    }

    let (mut dst_state, mut src_state) = lock_pair(dst, src);
    let result = do_move_locked(
        dst,
        &mut dst_state,
        src,
        &mut src_state,
        endpoint,
        swap,
        attempt_recovery,
    );

    bridge::reconfigured_locked(src, &mut src_state, true);
    bridge::reconfigured_locked(dst, &mut dst_state, true);
    result
}

/// Checks the merged membership fits the destination's technology.
fn merge_capacity_ok(
    dst_state: &BridgeState,
    src_state: &BridgeState,
    kick_count: usize,
) -> bool {
    let combined = dst_state.num_channels() + src_state.num_channels();
    let tech_multi = dst_state
        .technology()
        .capabilities()
        .contains(Capabilities::MULTIMIX);

    if tech_multi || 2 + kick_count >= combined {
        return true;
    }

    // The destination would overflow a pairwise technology: only a
    // smart bridge that may reselect into multimix can absorb it.
    dst_state.flags().contains(BridgeFlags::SMART)
        && dst_state
            .allowed_capabilities()
            .contains(Capabilities::MULTIMIX)
}

/// Empties `src` into `dst`, kicking the listed endpoints from either
/// bridge along the way. Both locks held.
pub(crate) fn do_merge_locked(
    dst: &Arc<Bridge>,
    dst_state: &mut BridgeState,
    src: &Arc<Bridge>,
    src_state: &mut BridgeState,
    kick: &[Arc<dyn Endpoint>],
    optimized: bool,
) -> Result<()> {
    motion_allowed(dst_state)?;
    motion_allowed(src_state)?;

    if src_state.num_channels() < 2 {
        return Err(Error::InvalidArgument);
    }

    let kicked_in_play = kick
        .iter()
        .filter(|e| src_state.member_of(e).is_some() || dst_state.member_of(e).is_some())
        .count();
    if !merge_capacity_ok(dst_state, src_state, kicked_in_play) {
        return Err(Error::Incompatible);
    }

    debug!(
        "Merging bridge {} into {}{}.",
        src.uuid(),
        dst.uuid(),
        if optimized { " (optimized)" } else { "" }
    );

    for target in kick {
        if let Some(member) = dst_state.member_of(target) {
            member.leave_bridge(ChannelStatus::EndNoDissolve, Cause::NormalClearing);
        }
    }

    for member in src_state.channels().to_vec() {
        let endpoint = member.endpoint();
        let kicked = kick.iter().any(|e| Arc::ptr_eq(e, &endpoint));

        if kicked || member.status() != ChannelStatus::Wait {
            member.leave_bridge(ChannelStatus::EndNoDissolve, Cause::NormalClearing);
            continue;
        }

        bridge::pull_locked(src, src_state, &member);
        if member.status() != ChannelStatus::Wait {
            continue;
        }

        member.set_bridge(dst.clone());
        channel::run_move_hooks(&member, src, dst);
        if bridge::push_locked(dst, dst_state, &member).is_err() {
            warn!(
                "Merge could not place {} into bridge {}; kicking.",
                endpoint.name(),
                dst.uuid()
            );
            member.leave_bridge(ChannelStatus::EndNoDissolve, Cause::NormalClearing);
        } else {
            member.settle_owed_locked(src_state);
        }
    }

    if let Ok(core) = dst.core() {
        core.publish(BusEvent::Merge {
            to: dst.uuid(),
            from: src.uuid(),
        });
    }
    Ok(())
}

/// Decides which direction a merge should run.
///
/// Inhibit flags force a direction outright; otherwise the higher
/// merge priority wins, and the larger bridge absorbs the smaller on
/// a tie.
pub(crate) fn pick_merge_direction(
    a: &Arc<Bridge>,
    a_state: &BridgeState,
    b: &Arc<Bridge>,
    b_state: &BridgeState,
) -> Result<bool> {
    // true: merge b into a. false: merge a into b.
    let into_a_ok = !a_state.flags().contains(BridgeFlags::MERGE_INHIBIT_TO)
        && !b_state.flags().contains(BridgeFlags::MERGE_INHIBIT_FROM);
    let into_b_ok = !b_state.flags().contains(BridgeFlags::MERGE_INHIBIT_TO)
        && !a_state.flags().contains(BridgeFlags::MERGE_INHIBIT_FROM);

    match (into_a_ok, into_b_ok) {
        (false, false) => Err(Error::Inhibited),
        (true, false) => Ok(true),
        (false, true) => Ok(false),
        (true, true) => {
            let pa = a.kind().merge_priority(a_state);
            let pb = b.kind().merge_priority(b_state);
            if pa != pb {
                Ok(pa > pb)
            } else {
                Ok(a_state.num_channels() >= b_state.num_channels())
            }
        },
    }
}

/// Merges two bridges, leaving `src` empty on success.
///
/// With `merge_best_direction`, the destination is chosen by merge
/// priority and size rather than taken from the arguments.
pub fn merge(
    dst: &Arc<Bridge>,
    src: &Arc<Bridge>,
    merge_best_direction: bool,
    kick: &[Arc<dyn Endpoint>],
) -> Result<()> {
    if Arc::ptr_eq(dst, src) {
        return Err(Error::InvalidArgument);
    }

    let (mut dst_state, mut src_state) = lock_pair(dst, src);

    let into_dst = if merge_best_direction {
        pick_merge_direction(dst, &dst_state, src, &src_state)?
    } else {
        true
    };

    let result = if into_dst {
        do_merge_locked(dst, &mut dst_state, src, &mut src_state, kick, false)
    } else {
        do_merge_locked(src, &mut src_state, dst, &mut dst_state, kick, false)
    };

    bridge::reconfigured_locked(src, &mut src_state, true);
    bridge::reconfigured_locked(dst, &mut dst_state, true);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bridge::{channel::BridgeChannel, push_locked},
        features::FeatureSet,
        test_utils::{test_core, MockEndpoint},
        Capabilities,
        Core,
    };

    fn bridge_with(
        core: &Arc<Core>,
        name: &str,
        members: &[&str],
    ) -> (Arc<Bridge>, Vec<Arc<BridgeChannel>>) {
        let bridge = core
            .builder()
            .capabilities(Capabilities::ONE_TO_ONE | Capabilities::MULTIMIX)
            .name(name)
            .build()
            .expect("bridge builds");

        let mut channels = Vec::new();
        for member in members {
            let endpoint = MockEndpoint::new(member);
            let channel = BridgeChannel::new(core, &bridge, endpoint, FeatureSet::new());
            let mut state = bridge.lock();
            push_locked(&bridge, &mut state, &channel).expect("push succeeds");
            drop(state);
            channels.push(channel);
        }
        (bridge, channels)
    }

    #[test]
    fn lock_pair_returns_guards_in_argument_order() {
        let core = test_core();
        let (a, _) = bridge_with(&core, "a", &[]);
        let (b, _) = bridge_with(&core, "b", &[]);

        let (ga, gb) = lock_pair(&a, &b);
        // Guard identity follows the arguments regardless of address
        // order: mutating through ga must land on bridge a.
        drop(gb);
        drop(ga);
        let (ga, _gb) = lock_pair(&b, &a);
        assert_eq!(ga.num_channels(), 0);

        core.shutdown();
    }

    #[test]
    fn move_between_bridges_preserves_endpoints() {
        let core = test_core();
        let (src, src_members) = bridge_with(&core, "src", &["SIP/a-1", "SIP/b-1"]);
        let (dst, _) = bridge_with(&core, "dst", &["SIP/c-1"]);

        let endpoint = src_members[1].endpoint();
        move_channel(&dst, &src, &endpoint, None, true).expect("moves");

        assert_eq!(src.lock().num_channels(), 1);
        assert_eq!(dst.lock().num_channels(), 2);
        assert!(dst.lock().member_of(&endpoint).is_some());

        core.shutdown();
    }

    #[test]
    fn merge_requires_a_real_source() {
        let core = test_core();
        let (dst, _) = bridge_with(&core, "dst", &["SIP/a-1", "SIP/b-1"]);
        let (src, _) = bridge_with(&core, "src", &["SIP/c-1"]);

        assert_eq!(
            merge(&dst, &src, false, &[]),
            Err(Error::InvalidArgument)
        );

        core.shutdown();
    }

    #[test]
    fn inhibited_bridges_refuse_motion() {
        let core = test_core();
        let (src, src_members) = bridge_with(&core, "src", &["SIP/a-1", "SIP/b-1"]);
        let (dst, _) = bridge_with(&core, "dst", &["SIP/c-1"]);

        dst.merge_inhibit(1);
        let endpoint = src_members[0].endpoint();
        assert_eq!(
            move_channel(&dst, &src, &endpoint, None, true),
            Err(Error::Inhibited)
        );

        dst.merge_inhibit(-1);
        assert!(move_channel(&dst, &src, &endpoint, None, true).is_ok());

        core.shutdown();
    }

    #[test]
    fn direction_obeys_inhibit_flags() {
        let core = test_core();

        let into_b = core
            .builder()
            .capabilities(Capabilities::ONE_TO_ONE | Capabilities::MULTIMIX)
            .flags(crate::BridgeFlags::MERGE_INHIBIT_TO)
            .name("refuses-intake")
            .build()
            .expect("bridge builds");
        let (plain, _) = bridge_with(&core, "plain", &[]);

        let sa = into_b.lock();
        let sb = plain.lock();

        // into_b refuses intake, so the only legal direction is into
        // the plain bridge.
        assert_eq!(
            pick_merge_direction(&into_b, &sa, &plain, &sb),
            Ok(false)
        );
        drop(sa);
        drop(sb);

        core.shutdown();
    }
}
