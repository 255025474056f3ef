//! Bridges: the containers that stitch channels into conversations.
//!
//! A [`Bridge`] owns a membership list, a selected mixing
//! [`Technology`], and a queue of deferred housekeeping drained by the
//! shared manager thread. All structural mutation happens under the
//! bridge lock; cross-bridge operations lock both bridges in address
//! order (see [`crate::ops`]).

pub mod actions;
pub mod channel;
pub mod registry;

use crate::{
    constants::MAX_BRIDGEPEER_CHANS,
    endpoint::Endpoint,
    error::{Error, Result},
    events::BusEvent,
    features::ChannelFeatureFlags,
    frame::{Control, Frame},
    tech::{self, Capabilities, Technology},
};
use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};
use std::{
    any::Any,
    collections::VecDeque,
    fmt,
    sync::{Arc, Weak},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use self::{
    channel::{BridgeChannel, ChannelStatus},
    registry::Core,
};

bitflags! {
    /// Behaviour flags carried by a bridge.
    #[derive(Default)]
    pub struct BridgeFlags: u32 {
        /// A member hanging up dissolves the whole bridge.
        const DISSOLVE_HANGUP = 1 << 0;
        /// The last member leaving dissolves the bridge.
        const DISSOLVE_EMPTY = 1 << 1;
        /// Reselect the technology as membership crosses 2 and 3.
        const SMART = 1 << 2;
        /// Members may not be merged out of this bridge.
        const MERGE_INHIBIT_FROM = 1 << 3;
        /// Members may not be merged into this bridge.
        const MERGE_INHIBIT_TO = 1 << 4;
        /// Members may not be swap-optimized out of this bridge.
        const SWAP_INHIBIT_FROM = 1 << 5;
        /// Members may not be swap-optimized into this bridge.
        const SWAP_INHIBIT_TO = 1 << 6;
        /// Members enter and leave only by masquerade.
        const MASQUERADE_ONLY = 1 << 7;
        /// Channels may not be transferred out of this bridge.
        const TRANSFER_PROHIBITED = 1 << 8;
        /// Transfers must take the whole bridge, never one channel.
        const TRANSFER_BRIDGE_ONLY = 1 << 9;
        /// The bridge is hidden from management surfaces.
        const INVISIBLE = 1 << 10;
    }
}

/// Hangup/teardown cause codes, Q.850-flavoured.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Cause {
    /// No cause recorded.
    NotDefined,
    /// Ordinary clearing.
    NormalClearing,
    /// The far end was busy.
    UserBusy,
    /// Nobody answered in time.
    NoAnswer,
    /// Resources were unavailable.
    Congestion,
    /// The call was answered somewhere else.
    AnsweredElsewhere,
}

impl Default for Cause {
    fn default() -> Self {
        Cause::NotDefined
    }
}

impl Cause {
    /// The Q.850 code for this cause.
    #[must_use]
    pub fn code(self) -> u32 {
        match self {
            Cause::NotDefined => 0,
            Cause::NormalClearing => 16,
            Cause::UserBusy => 17,
            Cause::NoAnswer => 19,
            Cause::Congestion => 34,
            Cause::AnsweredElsewhere => 26,
        }
    }
}

/// How the bridge selects its video source.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum VideoMode {
    /// Video is not managed.
    None,
    /// One fixed member sources video for everyone.
    SingleSource {
        /// Name of the sourcing channel.
        src: Option<String>,
    },
    /// The loudest talker sources video.
    TalkerSource {
        /// Name of the current source.
        src: Option<String>,
        /// Energy of the current source.
        energy: u32,
        /// Previous source, told to stop via `srcupdate`.
        old_src: Option<String>,
    },
}

impl Default for VideoMode {
    fn default() -> Self {
        VideoMode::None
    }
}

/// Software-mixing parameters forwarded to the technology.
#[derive(Clone, Copy, Debug)]
pub struct SoftmixParams {
    /// Mixing interval in milliseconds.
    pub interval_ms: u32,
    /// Internal sample rate; zero follows member rates.
    pub sample_rate: u32,
    /// Whether binaural rendering is requested.
    pub binaural: bool,
}

impl Default for SoftmixParams {
    fn default() -> Self {
        Self {
            interval_ms: crate::constants::DEFAULT_MIXING_INTERVAL_MS,
            sample_rate: crate::constants::DEFAULT_SAMPLE_RATE,
            binaural: false,
        }
    }
}

/// Housekeeping deferred to the manager thread, so it runs outside
/// the bridge lock.
pub(crate) enum DeferredAction {
    /// Destroy a replaced technology's private state.
    TechDestroy {
        tech: Arc<dyn Technology>,
        pvt: Option<Box<dyn Any + Send>>,
    },
    /// Run the subclass dissolving hook.
    Dissolving,
}

impl fmt::Debug for DeferredAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferredAction::TechDestroy { tech, .. } => {
                write!(f, "DeferredAction::TechDestroy({})", tech.name())
            },
            DeferredAction::Dissolving => write!(f, "DeferredAction::Dissolving"),
        }
    }
}

/// Subclass extension points reached through the bridge's vtable.
///
/// The base behaviours (membership, counters, publication) always run;
/// a subclass adds invariants on top, as the parking bridge does.
pub trait BridgeKind: Send + Sync {
    /// Subclass name, for diagnostics.
    fn kind(&self) -> &'static str {
        "base"
    }

    /// Final teardown, run from the destructor.
    fn destroy(&self, _state: &mut BridgeState) {}

    /// The bridge has been dissolved. Runs outside the bridge lock.
    fn dissolving(&self, _bridge: &Arc<Bridge>) {}

    /// A channel is being pushed. Failure fails the push.
    fn push(
        &self,
        _bridge: &Arc<Bridge>,
        _state: &mut BridgeState,
        _channel: &Arc<BridgeChannel>,
        _swap: Option<&Arc<BridgeChannel>>,
    ) -> Result<()> {
        Ok(())
    }

    /// A channel has been pulled.
    fn pull(&self, _bridge: &Arc<Bridge>, _state: &mut BridgeState, _channel: &Arc<BridgeChannel>) {
    }

    /// A masquerade happened beneath a member.
    fn notify_masquerade(
        &self,
        _bridge: &Arc<Bridge>,
        _state: &mut BridgeState,
        _channel: &Arc<BridgeChannel>,
    ) {
    }

    /// Relative priority when choosing a merge direction.
    fn merge_priority(&self, _state: &BridgeState) -> i32 {
        0
    }
}

/// The default, extension-free bridge personality.
#[derive(Debug, Default)]
pub struct BaseBridge;

impl BridgeKind for BaseBridge {}

/// Everything about a bridge that the bridge lock protects.
pub struct BridgeState {
    pub(crate) channels: Vec<Arc<BridgeChannel>>,
    pub(crate) num_active: usize,
    pub(crate) num_lonely: usize,
    tech: Arc<dyn Technology>,
    /// Technology-private state, owned by the current technology.
    pub tech_pvt: Option<Box<dyn Any + Send>>,
    allowed: Capabilities,
    pub(crate) flags: BridgeFlags,
    pub(crate) inhibit_merge: usize,
    dissolved: bool,
    pub(crate) reconfigured: bool,
    pub(crate) construction_completed: bool,
    cause: Cause,
    /// Video source policy.
    pub video_mode: VideoMode,
    /// Software-mixing parameters.
    pub softmix: SoftmixParams,
    pub(crate) actions: VecDeque<DeferredAction>,
}

impl BridgeState {
    fn new(tech: Arc<dyn Technology>, allowed: Capabilities, flags: BridgeFlags) -> Self {
        Self {
            channels: Vec::new(),
            num_active: 0,
            num_lonely: 0,
            tech,
            tech_pvt: None,
            allowed,
            flags,
            inhibit_merge: 0,
            dissolved: false,
            reconfigured: false,
            construction_completed: false,
            cause: Cause::NotDefined,
            video_mode: VideoMode::None,
            softmix: SoftmixParams::default(),
            actions: VecDeque::new(),
        }
    }

    /// A carrier for a replaced technology's state, handed to its
    /// `stop`/`leave`/`destroy` outside the real bridge.
    pub(crate) fn carrier(tech: Arc<dyn Technology>, pvt: Option<Box<dyn Any + Send>>) -> Self {
        let mut state = Self::new(tech, Capabilities::empty(), BridgeFlags::empty());
        state.tech_pvt = pvt;
        state
    }

    /// The members, in join order.
    #[must_use]
    pub fn channels(&self) -> &[Arc<BridgeChannel>] {
        &self.channels
    }

    /// Number of members.
    #[must_use]
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Number of unsuspended members.
    #[must_use]
    pub fn num_active(&self) -> usize {
        self.num_active
    }

    /// Number of members flagged lonely.
    #[must_use]
    pub fn num_lonely(&self) -> usize {
        self.num_lonely
    }

    /// The currently selected technology.
    #[must_use]
    pub fn technology(&self) -> Arc<dyn Technology> {
        self.tech.clone()
    }

    /// Whether the bridge has been dissolved.
    #[must_use]
    pub fn dissolved(&self) -> bool {
        self.dissolved
    }

    /// The recorded teardown cause.
    #[must_use]
    pub fn cause(&self) -> Cause {
        self.cause
    }

    /// The bridge's behaviour flags.
    #[must_use]
    pub fn flags(&self) -> BridgeFlags {
        self.flags
    }

    /// The capability classes the bridge may select among.
    #[must_use]
    pub fn allowed_capabilities(&self) -> Capabilities {
        self.allowed
    }

    /// Whether merges and swaps are currently held off.
    #[must_use]
    pub fn merge_inhibited(&self) -> bool {
        self.inhibit_merge > 0
    }

    /// Finds the member wrapping the given endpoint.
    #[must_use]
    pub fn member_of(&self, endpoint: &Arc<dyn Endpoint>) -> Option<Arc<BridgeChannel>> {
        self.channels
            .iter()
            .find(|c| Arc::ptr_eq(&c.endpoint(), endpoint))
            .cloned()
    }

    /// Every member except `who`, in join order.
    #[must_use]
    pub fn peers_of(&self, who: &Arc<BridgeChannel>) -> Vec<Arc<BridgeChannel>> {
        self.channels
            .iter()
            .filter(|c| !Arc::ptr_eq(c, who))
            .cloned()
            .collect()
    }

    /// Switches video policy to a single fixed source.
    pub fn set_single_src_video(&mut self, src: Option<String>) {
        self.video_mode = VideoMode::SingleSource { src };
    }

    /// Switches video policy to talker-follows.
    pub fn set_talker_src_video(&mut self) {
        self.video_mode = VideoMode::TalkerSource {
            src: None,
            energy: 0,
            old_src: None,
        };
    }

    /// Reports talker energy; the loudest member becomes the source.
    ///
    /// Returns the displaced source's name when the source changes,
    /// so the caller can send it a `srcupdate`.
    pub fn update_talker_src(&mut self, channel: &str, energy: u32) -> Option<String> {
        if let VideoMode::TalkerSource {
            src,
            energy: cur_energy,
            old_src,
        } = &mut self.video_mode
        {
            let is_current = src.as_deref() == Some(channel);
            if is_current {
                *cur_energy = energy;
                return None;
            }
            if energy > *cur_energy {
                *old_src = src.take();
                *src = Some(channel.to_string());
                *cur_energy = energy;
                return old_src.clone();
            }
        }
        None
    }
}

impl fmt::Debug for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeState")
            .field("num_channels", &self.channels.len())
            .field("num_active", &self.num_active)
            .field("num_lonely", &self.num_lonely)
            .field("tech", &self.tech.name())
            .field("flags", &self.flags)
            .field("dissolved", &self.dissolved)
            .finish()
    }
}

/// An N-party conversation.
pub struct Bridge {
    uuid: Uuid,
    name: String,
    creator: String,
    kind: Arc<dyn BridgeKind>,
    pub(crate) core: Weak<Core>,
    state: Mutex<BridgeState>,
}

impl Bridge {
    /// The bridge's unique identifier.
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// The bridge's display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whoever created the bridge.
    #[must_use]
    pub fn creator(&self) -> &str {
        &self.creator
    }

    /// The subclass vtable.
    #[must_use]
    pub fn kind(&self) -> Arc<dyn BridgeKind> {
        self.kind.clone()
    }

    /// Takes the bridge lock.
    pub fn lock(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock()
    }

    /// Attempts the bridge lock without blocking.
    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, BridgeState>> {
        self.state.try_lock()
    }

    /// The core this bridge is registered with.
    pub fn core(&self) -> Result<Arc<Core>> {
        self.core.upgrade().ok_or(Error::Offline)
    }

    fn publish(&self, event: BusEvent) {
        if let Some(core) = self.core.upgrade() {
            core.publish(event);
        }
    }

    /// Dissolves the bridge: every member is kicked and no new member
    /// may enter.
    pub fn dissolve(self: &Arc<Self>, cause: Cause) {
        let mut state = self.lock();
        dissolve_locked(self, &mut state, cause);
    }

    /// Kicks every current member without dissolving the bridge.
    pub fn kick_all(self: &Arc<Self>) {
        let state = self.lock();
        for channel in state.channels.clone() {
            channel.leave_bridge(ChannelStatus::EndNoDissolve, Cause::NormalClearing);
        }
    }

    /// Adjusts the merge-inhibit counter by `delta`.
    ///
    /// An operator may hold the counter raised across a sequence of
    /// moves to keep optimizers away.
    pub fn merge_inhibit(&self, delta: i32) {
        let mut state = self.lock();
        if delta < 0 {
            let dec = delta.unsigned_abs() as usize;
            if state.inhibit_merge < dec {
                warn!("Merge-inhibit underflow on bridge {}.", self.uuid);
                state.inhibit_merge = 0;
            } else {
                state.inhibit_merge -= dec;
            }
        } else {
            state.inhibit_merge += delta as usize;
        }
    }

    /// Sets the softmix mixing interval.
    pub fn set_mixing_interval(&self, interval_ms: u32) {
        self.lock().softmix.interval_ms = interval_ms;
    }

    /// Sets the softmix internal sample rate.
    pub fn set_internal_sample_rate(&self, rate: u32) {
        self.lock().softmix.sample_rate = rate;
    }

    /// Requests binaural rendering from the technology.
    pub fn set_binaural_active(&self, active: bool) {
        self.lock().softmix.binaural = active;
    }

    /// The bridge has changed personality: members lose every hook
    /// installed for the previous one.
    ///
    /// Feature installers opt in with
    /// [`HookRemove::ON_PERSONALITY_CHANGE`], so hooks that belong to
    /// the member itself survive while behaviour layered on by the
    /// old personality is stripped.
    ///
    /// [`HookRemove::ON_PERSONALITY_CHANGE`]: crate::features::HookRemove::ON_PERSONALITY_CHANGE
    pub fn change_personality(&self) {
        let state = self.lock();
        debug!("Bridge {} changing personality.", self.uuid);
        for channel in &state.channels {
            channel.features().remove_on_personality_change();
        }
    }

    /// A masquerade completed beneath one of our members: revalidate
    /// and tell the subclass.
    pub fn notify_masquerade(self: &Arc<Self>, channel: &Arc<BridgeChannel>) {
        let kind = self.kind.clone();
        let mut state = self.lock();
        if state.member_of(&channel.endpoint()).is_some() {
            kind.notify_masquerade(self, &mut state, channel);
            state.reconfigured = true;
            reconfigured_locked(self, &mut state, true);
        }
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("uuid", &self.uuid)
            .field("name", &self.name)
            .field("kind", &self.kind.kind())
            .finish()
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        debug!("Destroying bridge {}.", self.uuid);

        self.kind.destroy(state);

        let tech = state.tech.clone();
        tech.stop(state);
        tech.destroy(state);

        // Anything still deferred runs here, inline: the manager can
        // no longer reach this bridge.
        while let Some(action) = state.actions.pop_front() {
            if let DeferredAction::TechDestroy { tech, pvt } = action {
                let mut carrier = BridgeState::carrier(tech.clone(), pvt);
                tech.destroy(&mut carrier);
            }
        }
    }
}

/// Builder for new bridges, obtained from [`Core::builder`].
pub struct BridgeBuilder {
    core: Arc<Core>,
    capabilities: Capabilities,
    flags: BridgeFlags,
    name: String,
    creator: String,
    id: Option<Uuid>,
    kind: Arc<dyn BridgeKind>,
}

impl BridgeBuilder {
    pub(crate) fn new(core: Arc<Core>) -> Self {
        Self {
            core,
            capabilities: Capabilities::ONE_TO_ONE,
            flags: BridgeFlags::empty(),
            name: String::new(),
            creator: String::new(),
            id: None,
            kind: Arc::new(BaseBridge),
        }
    }

    /// Sets the allowed capability classes.
    #[must_use]
    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Sets behaviour flags.
    #[must_use]
    pub fn flags(mut self, flags: BridgeFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the display name.
    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Records the creating subsystem.
    #[must_use]
    pub fn creator(mut self, creator: &str) -> Self {
        self.creator = creator.to_string();
        self
    }

    /// Supplies an externally chosen identifier.
    #[must_use]
    pub fn id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Installs a subclass vtable.
    #[must_use]
    pub fn kind(mut self, kind: Arc<dyn BridgeKind>) -> Self {
        self.kind = kind;
        self
    }

    /// Selects a technology, starts it, and registers the bridge.
    pub fn build(self) -> Result<Arc<Bridge>> {
        let tech = self
            .core
            .techs()
            .best(self.capabilities, None)
            .ok_or(Error::TechnologyUnavailable)?;

        let uuid = self.id.unwrap_or_else(Uuid::new_v4);
        let mut state = BridgeState::new(tech.clone(), self.capabilities, self.flags);

        tech.create(&mut state)?;
        tech.start(&mut state)?;
        state.construction_completed = true;

        info!(
            "Bridge {} ({}) created with technology {}.",
            uuid,
            self.name,
            tech.name()
        );

        let bridge = Arc::new(Bridge {
            uuid,
            name: self.name,
            creator: self.creator,
            kind: self.kind,
            core: Arc::downgrade(&self.core),
            state: Mutex::new(state),
        });

        self.core.register_bridge(bridge.clone());
        self.core.publish(BusEvent::BridgeCreated { bridge: uuid });
        Ok(bridge)
    }
}

// -- core membership transitions -----------------------------------

/// Adds a channel to the bridge. Bridge lock held.
pub(crate) fn push_locked(
    bridge: &Arc<Bridge>,
    state: &mut BridgeState,
    channel: &Arc<BridgeChannel>,
) -> Result<()> {
    let kind = bridge.kind.clone();

    let result = (|| {
        if state.dissolved {
            return Err(Error::Dissolved);
        }
        if channel.status() != ChannelStatus::Wait {
            return Err(Error::WrongState);
        }

        let swap = match channel.take_swap() {
            Some(target) => {
                let occupant = state.member_of(&target).ok_or(Error::NotInBridge)?;
                if occupant.status() != ChannelStatus::Wait {
                    return Err(Error::WrongState);
                }
                Some(occupant)
            },
            None => None,
        };

        kind.push(bridge, state, channel, swap.as_ref())?;
        Ok(swap)
    })();

    let swap = match result {
        Ok(swap) => swap,
        Err(e) => {
            // A failed push still consumes single-use hooks.
            channel.features().remove_on_pull();
            return Err(e);
        },
    };

    channel.mark_joined(bridge);
    state.channels.push(channel.clone());
    if !channel.is_suspended() {
        state.num_active += 1;
    }
    let lonely = channel
        .features()
        .flags
        .contains(ChannelFeatureFlags::LONELY);
    if lonely {
        state.num_lonely += 1;
    }

    let swapped_name = swap.as_ref().map(|c| c.endpoint().name());
    bridge.publish(BusEvent::Enter {
        bridge: bridge.uuid,
        channel: channel.endpoint().name(),
        swapped: swapped_name,
    });

    if let Some(old) = swap {
        debug!(
            "Bridge {}: {} swaps out {}.",
            bridge.uuid,
            channel.endpoint().name(),
            old.endpoint().name()
        );
        old.leave_bridge(ChannelStatus::EndNoDissolve, Cause::NotDefined);
        pull_locked(bridge, state, &old);
    }

    let endpoint = channel.endpoint();
    endpoint.set_variable("BLINDTRANSFER", "");
    endpoint.set_variable("ATTENDEDTRANSFER", "");

    let _ = channel.queue_frame(Frame::Null);
    state.reconfigured = true;
    Ok(())
}

/// Removes a channel from the bridge. Bridge lock held. Idempotent.
pub(crate) fn pull_locked(
    bridge: &Arc<Bridge>,
    state: &mut BridgeState,
    channel: &Arc<BridgeChannel>,
) {
    if !channel.in_bridge() {
        return;
    }

    let endpoint = channel.endpoint();
    let tech = state.tech.clone();

    if !channel.just_joined() {
        tech.leave(state, channel);
    }

    if !channel.is_suspended() {
        state.num_active = state.num_active.saturating_sub(1);
    }
    let lonely = channel
        .features()
        .flags
        .contains(ChannelFeatureFlags::LONELY);
    if lonely {
        state.num_lonely = state.num_lonely.saturating_sub(1);
    }
    state
        .channels
        .retain(|c| !Arc::ptr_eq(c, channel));

    channel.mark_left();

    dissolve_check_locked(bridge, state, channel);

    bridge.kind.clone().pull(bridge, state, channel);
    channel.features().remove_on_pull();

    if channel.status() == ChannelStatus::EndNoDissolve {
        endpoint.set_outgoing(false);
    }

    debug!(
        "Bridge {}: pulled {} ({:?}).",
        bridge.uuid,
        endpoint.name(),
        channel.status()
    );

    state.reconfigured = true;
    bridge.publish(BusEvent::Leave {
        bridge: bridge.uuid,
        channel: endpoint.name(),
    });
}

/// Dissolves the bridge. Bridge lock held. Idempotent.
pub(crate) fn dissolve_locked(bridge: &Arc<Bridge>, state: &mut BridgeState, cause: Cause) {
    if state.dissolved {
        return;
    }
    state.dissolved = true;
    state.construction_completed = false;
    state.cause = cause;

    info!("Dissolving bridge {} (cause {:?}).", bridge.uuid, cause);

    for channel in state.channels.clone() {
        channel.leave_bridge(ChannelStatus::EndNoDissolve, cause);
    }

    actions::queue_deferred(bridge, state, DeferredAction::Dissolving);

    if let Some(core) = bridge.core.upgrade() {
        core.unregister_bridge(bridge.uuid);
        core.publish(BusEvent::BridgeDissolved {
            bridge: bridge.uuid,
            cause,
        });
    }
}

/// After a member leaves, decide whether the bridge goes with it.
fn dissolve_check_locked(
    bridge: &Arc<Bridge>,
    state: &mut BridgeState,
    leaver: &Arc<BridgeChannel>,
) {
    if state.channels.is_empty() && state.flags.contains(BridgeFlags::DISSOLVE_EMPTY) {
        dissolve_locked(bridge, state, leaver.cause());
        return;
    }

    if leaver.status() == ChannelStatus::End {
        let hangup_dissolves = state.flags.contains(BridgeFlags::DISSOLVE_HANGUP)
            || leaver
                .features()
                .flags
                .contains(ChannelFeatureFlags::DISSOLVE_HANGUP);
        if hangup_dissolves {
            dissolve_locked(bridge, state, leaver.cause());
            return;
        }
    }

    // Only lonely members remain: evict the first so the rest chain
    // out behind it.
    if state.num_lonely > 0 && state.num_lonely == state.channels.len() {
        if let Some(first) = state.channels.first().cloned() {
            first.leave_bridge(ChannelStatus::EndNoDissolve, Cause::NormalClearing);
        }
    }
}

/// Applies any pending reconfiguration. Bridge lock held.
///
/// Covers the smart technology swap, completion of just-joined
/// members, and peer-variable upkeep.
pub(crate) fn reconfigured_locked(bridge: &Arc<Bridge>, state: &mut BridgeState, colp_update: bool) {
    if !state.reconfigured || state.dissolved {
        state.reconfigured = false;
        return;
    }
    state.reconfigured = false;

    if state.flags.contains(BridgeFlags::SMART) && smart_swap_locked(bridge, state).is_err() {
        error!(
            "Bridge {}: smart technology swap failed; dissolving.",
            bridge.uuid
        );
        dissolve_locked(bridge, state, Cause::Congestion);
        return;
    }

    complete_join_locked(bridge, state);

    if !state.dissolved {
        update_peer_vars_locked(state, colp_update);
    }
}

/// Reselects the technology for the current membership, swapping it
/// atomically if a different one fits better.
fn smart_swap_locked(bridge: &Arc<Bridge>, state: &mut BridgeState) -> Result<()> {
    let core = bridge.core().map_err(|_| Error::Offline)?;

    let mut wanted = if state.channels.len() > 2 {
        Capabilities::MULTIMIX
    } else {
        Capabilities::NATIVE | Capabilities::ONE_TO_ONE
    };
    wanted &= state.allowed;
    if wanted.is_empty() {
        if state.allowed.contains(Capabilities::MULTIMIX) {
            wanted = Capabilities::MULTIMIX;
        } else {
            return Err(Error::TechnologyUnavailable);
        }
    }

    let new_tech = core
        .techs()
        .best(wanted, Some(state))
        .ok_or(Error::TechnologyUnavailable)?;

    if new_tech.name() == state.tech.name() {
        return Ok(());
    }

    debug!(
        "Bridge {}: switching from {} to {}.",
        bridge.uuid,
        state.tech.name(),
        new_tech.name()
    );

    let old_tech = state.tech.clone();
    let old_pvt = state.tech_pvt.take();
    state.tech = new_tech.clone();

    if let Err(e) = new_tech.create(state) {
        state.tech = old_tech;
        state.tech_pvt = old_pvt;
        return Err(e);
    }

    let mut carrier = BridgeState::carrier(old_tech.clone(), old_pvt);
    old_tech.stop(&mut carrier);
    for channel in state.channels.clone() {
        if !channel.just_joined() {
            old_tech.leave(&mut carrier, &channel);
            channel.set_just_joined(true);
        }
    }

    new_tech.start(state)?;

    actions::queue_deferred(
        bridge,
        state,
        DeferredAction::TechDestroy {
            tech: old_tech,
            pvt: carrier.tech_pvt.take(),
        },
    );

    Ok(())
}

/// Joins every just-joined member onto the current technology,
/// renegotiating formats first. Incompatible members are kicked.
fn complete_join_locked(bridge: &Arc<Bridge>, state: &mut BridgeState) {
    let tech = state.tech.clone();

    for channel in state.channels.clone() {
        if !channel.just_joined() {
            continue;
        }

        let joined = tech::make_compatible(&tech, &channel)
            .and_then(|_| tech.join(state, &channel));
        match joined {
            Ok(()) => channel.set_just_joined(false),
            Err(_) => {
                warn!(
                    "Bridge {}: {} cannot meet {}; kicking.",
                    bridge.uuid,
                    channel.endpoint().name(),
                    tech.name()
                );
                channel.leave_bridge(ChannelStatus::End, Cause::NormalClearing);
            },
        }
    }
}

/// Refreshes BRIDGEPEER/BRIDGEPVTCALLID on every member, plus
/// connected-line updates in two-party bridges.
fn update_peer_vars_locked(state: &BridgeState, colp_update: bool) {
    let tech = state.tech.clone();
    let holding = tech.capabilities().contains(Capabilities::HOLDING);
    let pvt_id = tech.pvt_id(state);

    for channel in &state.channels {
        let endpoint = channel.endpoint();

        if holding {
            endpoint.set_variable("BRIDGEPEER", "");
        } else {
            let peers: Vec<String> = state
                .channels
                .iter()
                .filter(|c| !Arc::ptr_eq(c, channel))
                .take(MAX_BRIDGEPEER_CHANS)
                .map(|c| c.endpoint().name())
                .collect();
            endpoint.set_variable("BRIDGEPEER", &peers.join(","));
        }

        match &pvt_id {
            Some(id) => endpoint.set_variable("BRIDGEPVTCALLID", id),
            None => endpoint.set_variable("BRIDGEPVTCALLID", ""),
        }
    }

    let two_party_direct = state.channels.len() == 2
        && !(tech.capabilities() & (Capabilities::NATIVE | Capabilities::ONE_TO_ONE)).is_empty();
    if colp_update && two_party_direct {
        for (a, b) in [(0, 1), (1, 0)] {
            let target = &state.channels[a];
            let from = &state.channels[b];
            if target.inhibit_colp() {
                continue;
            }
            target
                .endpoint()
                .indicate(Control::ConnectedLine(from.endpoint().name().into_bytes()));
        }
    }
}

/// Delivers a frame to every member except the sender.
///
/// The default distribution primitive for simple mixing
/// technologies: the original goes to one receiver, duplicates to
/// the rest, and frames that cannot be duplicated fan out to the
/// first receiver only.
pub fn queue_everyone_else(
    state: &BridgeState,
    sender: &Arc<BridgeChannel>,
    frame: Frame,
) {
    let peers = state.peers_of(sender);

    match peers.split_last() {
        None => {},
        Some((last, rest)) => {
            for peer in rest {
                if let Some(copy) = frame.try_clone() {
                    let _ = peer.queue_frame(copy);
                }
            }
            let _ = last.queue_frame(frame);
        },
    }
}

/// Reports a speech start/stop detected by the mixing technology.
///
/// Queued as an action so the member's talk hooks run on its own
/// owner thread, ordered with its other queued work. Also refreshes
/// talker-follows video when energy is supplied.
pub fn notify_talking(
    state: &mut BridgeState,
    channel: &Arc<BridgeChannel>,
    talking: bool,
    energy: Option<u32>,
) {
    let action = if talking {
        crate::frame::ChannelAction::TalkingStart
    } else {
        crate::frame::ChannelAction::TalkingStop
    };
    let _ = channel.queue_frame(Frame::Action(action));

    if let (true, Some(energy)) = (talking, energy) {
        let name = channel.endpoint().name();
        if let Some(displaced) = state.update_talker_src(&name, energy) {
            for member in &state.channels {
                if member.endpoint().name() == displaced {
                    member.endpoint().indicate(Control::SrcUpdate);
                }
            }
        }
    }
}
