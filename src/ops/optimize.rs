//! Unreal-channel optimization: collapsing a back-to-back pair that
//! merely tunnels between two bridges.
//!
//! Everything here is opportunistic. The gate takes both stacks with
//! try-locks and backs off on any contention or activity, so a failed
//! attempt costs nothing and the driver simply retries later.

use super::motion::{do_merge_locked, do_move_locked, pick_merge_direction};
use crate::{
    bridge::{
        self,
        channel::{Activity, BridgeChannel, ChannelStatus},
        registry::Core,
        Bridge,
        BridgeFlags,
        BridgeState,
        Cause,
    },
    endpoint::Endpoint,
    error::{Error, Result},
    events::BusEvent,
};
use parking_lot::MutexGuard;
use std::sync::Arc;
use tracing::debug;

fn half_is_quiet(endpoint: &Arc<dyn Endpoint>) -> bool {
    endpoint.queued_read_frames() == 0
        && !endpoint.emulate_dtmf()
        && !endpoint.has_audiohooks()
}

fn stack_is_quiet(state: &BridgeState, channel: &Arc<BridgeChannel>) -> bool {
    matches!(channel.activity(), Activity::Idle | Activity::Simple)
        && channel.status() == ChannelStatus::Wait
        && channel.queued_frames() == 0
        && !state.dissolved()
        && !state.merge_inhibited()
        && !state.flags().contains(BridgeFlags::MASQUERADE_ONLY)
}

struct Stack<'a> {
    bridge: &'a Arc<Bridge>,
    state: MutexGuard<'a, BridgeState>,
    channel: Arc<BridgeChannel>,
}

fn take_stack<'a>(
    bridge: &'a Arc<Bridge>,
    endpoint: &Arc<dyn Endpoint>,
) -> Option<Stack<'a>> {
    let state = bridge.try_lock()?;
    let channel = state.member_of(endpoint)?;
    if !stack_is_quiet(&state, &channel) {
        return None;
    }
    Some(Stack {
        bridge,
        state,
        channel,
    })
}

/// Attempts to optimize away the unreal pair that `near` is one half
/// of.
///
/// Returns `Ok(true)` when the pair was eliminated, `Ok(false)` when
/// any gate refused (the caller may retry), and an error only on
/// misuse.
pub fn try_swap_optimize(core: &Arc<Core>, near: &Arc<dyn Endpoint>) -> Result<bool> {
    let far = near.unreal_peer().ok_or(Error::InvalidArgument)?;

    if !half_is_quiet(near) || !half_is_quiet(&far) {
        return Ok(false);
    }

    let near_bridge = match near.bridge_id().and_then(|id| core.get_bridge(id)) {
        Some(b) => b,
        None => return Ok(false),
    };
    let far_bridge = match far.bridge_id().and_then(|id| core.get_bridge(id)) {
        Some(b) => b,
        None => return Ok(false),
    };
    if Arc::ptr_eq(&near_bridge, &far_bridge) {
        return Ok(false);
    }

    let near_stack = match take_stack(&near_bridge, near) {
        Some(s) => s,
        None => return Ok(false),
    };
    let mut far_stack = match take_stack(&far_bridge, &far) {
        Some(s) => s,
        None => return Ok(false),
    };
    let mut near_stack = near_stack;

    let id = core.next_optimization_id();
    near.optimization_started(id, Some(&far));
    far.optimization_started(id, Some(near));
    core.publish(BusEvent::OptimizationBegin { id });

    let outcome = run_optimization(
        core,
        id,
        &mut near_stack,
        &mut far_stack,
        near,
        &far,
    );

    core.publish(BusEvent::OptimizationEnd { id });
    far.optimization_finished(id);
    near.optimization_finished(id);

    bridge::reconfigured_locked(near_stack.bridge, &mut near_stack.state, true);
    bridge::reconfigured_locked(far_stack.bridge, &mut far_stack.state, true);

    Ok(outcome)
}

fn swap_allowed(dst: &BridgeState, src: &BridgeState) -> bool {
    src.num_channels() == 2
        && !src.flags().contains(BridgeFlags::SWAP_INHIBIT_FROM)
        && !dst.flags().contains(BridgeFlags::SWAP_INHIBIT_TO)
        && !dst.flags().contains(BridgeFlags::TRANSFER_BRIDGE_ONLY)
        && !src.flags().contains(BridgeFlags::TRANSFER_BRIDGE_ONLY)
}

fn run_optimization(
    _core: &Arc<Core>,
    id: u64,
    near_stack: &mut Stack<'_>,
    far_stack: &mut Stack<'_>,
    near: &Arc<dyn Endpoint>,
    far: &Arc<dyn Endpoint>,
) -> bool {
    // Prefer replacing one half directly with the party behind the
    // other: cheaper than a merge, and membership elsewhere is
    // untouched.
    if swap_allowed(&near_stack.state, &far_stack.state) {
        if let Some(party) = far_stack
            .state
            .peers_of(&far_stack.channel)
            .into_iter()
            .next()
        {
            debug!("Optimization {}: swapping into the near bridge.", id);
            let moved = do_move_locked(
                near_stack.bridge,
                &mut near_stack.state,
                far_stack.bridge,
                &mut far_stack.state,
                &party.endpoint(),
                Some(near),
                false,
            );
            if moved.is_ok() {
                far_stack
                    .channel
                    .leave_bridge(ChannelStatus::EndNoDissolve, Cause::NormalClearing);
                return true;
            }
        }
    }

    if swap_allowed(&far_stack.state, &near_stack.state) {
        if let Some(party) = near_stack
            .state
            .peers_of(&near_stack.channel)
            .into_iter()
            .next()
        {
            debug!("Optimization {}: swapping into the far bridge.", id);
            let moved = do_move_locked(
                far_stack.bridge,
                &mut far_stack.state,
                near_stack.bridge,
                &mut near_stack.state,
                &party.endpoint(),
                Some(far),
                false,
            );
            if moved.is_ok() {
                near_stack
                    .channel
                    .leave_bridge(ChannelStatus::EndNoDissolve, Cause::NormalClearing);
                return true;
            }
        }
    }

    // Swaps refused: merge the bridges, dropping both halves.
    let kicks: Vec<Arc<dyn Endpoint>> = vec![near.clone(), far.clone()];
    let into_near = match pick_merge_direction(
        near_stack.bridge,
        &near_stack.state,
        far_stack.bridge,
        &far_stack.state,
    ) {
        Ok(dir) => dir,
        Err(_) => return false,
    };

    debug!("Optimization {}: merging the pair's bridges.", id);
    let merged = if into_near {
        do_merge_locked(
            near_stack.bridge,
            &mut near_stack.state,
            far_stack.bridge,
            &mut far_stack.state,
            &kicks,
            true,
        )
    } else {
        do_merge_locked(
            far_stack.bridge,
            &mut far_stack.state,
            near_stack.bridge,
            &mut near_stack.state,
            &kicks,
            true,
        )
    };

    merged.is_ok()
}
