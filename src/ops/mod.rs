//! Operator entry points: putting channels into bridges and taking
//! them out again.
//!
//! `join` runs the membership on the caller's thread; `impart` spawns
//! an owner thread and returns immediately. The remaining wrappers
//! differ only in thread-ownership semantics, as thin layers over the
//! push/pull core.

pub mod motion;
pub mod optimize;
pub mod transfer;

pub use motion::{merge, move_channel};

use crate::{
    bridge::{
        channel::{self, BridgeChannel, ChannelStatus},
        Bridge,
        Cause,
    },
    dialplan,
    endpoint::{AfterBridgeReason, Endpoint},
    error::{Error, Result},
    features::FeatureSet,
    frame::ChannelAction,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// How an imparted channel's thread is owned.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ImpartMode {
    /// Detached: the channel sees itself out.
    Independent,
    /// Joinable: the imparter must eventually call [`depart`].
    Departable,
}

/// Joins an endpoint to a bridge on the calling thread, returning
/// when the channel leaves.
///
/// With `swap`, the named occupant is pulled the moment this channel
/// lands, as one observable exchange. The caller is responsible for
/// any after-bridge continuation on its endpoint once this returns.
pub fn join(
    bridge: &Arc<Bridge>,
    endpoint: Arc<dyn Endpoint>,
    features: FeatureSet,
    swap: Option<Arc<dyn Endpoint>>,
) -> Result<()> {
    let core = bridge.core()?;
    let channel = BridgeChannel::new(&core, bridge, endpoint, features);
    channel.set_swap(swap);
    channel::join_loop(&channel)
}

/// Joins an endpoint to a bridge on a new owner thread.
///
/// Returns the bridge channel handle. With [`ImpartMode::Departable`]
/// the thread is joinable and the imparter must call [`depart`];
/// independent channels run their after-bridge continuation and
/// clean themselves up.
pub fn impart(
    bridge: &Arc<Bridge>,
    endpoint: Arc<dyn Endpoint>,
    features: FeatureSet,
    mode: ImpartMode,
) -> Result<Arc<BridgeChannel>> {
    impart_swap(bridge, endpoint, features, mode, None)
}

/// [`impart`], replacing an existing occupant on arrival.
pub fn impart_swap(
    bridge: &Arc<Bridge>,
    endpoint: Arc<dyn Endpoint>,
    features: FeatureSet,
    mode: ImpartMode,
    swap: Option<Arc<dyn Endpoint>>,
) -> Result<Arc<BridgeChannel>> {
    let core = bridge.core()?;
    let channel = BridgeChannel::new(&core, bridge, endpoint.clone(), features);
    channel.set_swap(swap);

    if mode == ImpartMode::Departable {
        channel.set_depart_wait(true);
    }

    let thread_channel = channel.clone();
    let handle = std::thread::Builder::new()
        .name(format!("bridge-channel/{}", endpoint.name()))
        .spawn(move || {
            let endpoint = thread_channel.endpoint();
            match channel::join_loop(&thread_channel) {
                Ok(()) => {
                    if !thread_channel.depart_wait() {
                        dialplan::run_after(&endpoint);
                    }
                },
                Err(e) => {
                    debug!("Impart of {} never joined: {}", endpoint.name(), e);
                    dialplan::discard_after_callback(&endpoint, AfterBridgeReason::ImpartFailed);
                },
            }
        })
        .expect("Failed to spawn a bridge channel thread.");

    match mode {
        ImpartMode::Departable => channel.set_thread(handle),
        ImpartMode::Independent => drop(handle),
    }

    Ok(channel)
}

/// Removes a departable channel from its bridge and reaps its thread.
pub fn depart(channel: &Arc<BridgeChannel>) -> Result<()> {
    if !channel.depart_wait() {
        return Err(Error::InvalidArgument);
    }

    channel.leave_bridge(ChannelStatus::EndNoDissolve, Cause::NormalClearing);

    if let Some(handle) = channel.take_thread() {
        if handle.join().is_err() {
            warn!(
                "Owner thread for {} panicked before depart.",
                channel.endpoint().name()
            );
        }
    }

    channel.set_depart_wait(false);
    dialplan::discard_after_callback(&channel.endpoint(), AfterBridgeReason::Depart);
    Ok(())
}

/// Asks a member to leave its bridge, without hangup semantics.
pub fn remove(bridge: &Arc<Bridge>, endpoint: &Arc<dyn Endpoint>) -> Result<()> {
    let channel = bridge
        .lock()
        .member_of(endpoint)
        .ok_or(Error::NotInBridge)?;
    channel.leave_bridge(ChannelStatus::EndNoDissolve, Cause::NormalClearing);
    Ok(())
}

/// Kicks a member via its own owner thread: a queued callback runs
/// the per-channel kick so ordering with other queued work holds.
pub fn kick(bridge: &Arc<Bridge>, endpoint: &Arc<dyn Endpoint>, cause: Cause) -> Result<()> {
    let channel = bridge
        .lock()
        .member_of(endpoint)
        .ok_or(Error::NotInBridge)?;

    channel.queue_action(ChannelAction::Callback {
        func: Box::new(move |ch| ch.kick(cause)),
        suspend_media: false,
    })
}
