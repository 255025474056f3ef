//! One participant's presence in a bridge.
//!
//! A [`BridgeChannel`] wraps an endpoint for the duration of its
//! membership: it owns the write queue other members feed, the alert
//! that wakes the owner thread, and the per-participation state (DTMF
//! collection, owed events, saved formats). The owner thread runs
//! [`join_loop`] until the channel's status leaves `Wait`.

use super::{
    pull_locked,
    reconfigured_locked,
    registry::Core,
    Bridge,
    BridgeState,
    Cause,
};
use crate::{
    constants::{DEFAULT_FEATURE_DIGIT_TIMEOUT, DEFERRAL_PAUSE, DUAL_REDIRECT_POLL},
    endpoint::{Endpoint, Format},
    error::{Error, Result},
    features::{
        dtmf::{DigitVerdict, DtmfCollector},
        FeatureSet,
        HookAction,
        IntervalAction,
    },
    frame::{ChannelAction, Control, Frame, SyncAction},
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::{
    any::Any,
    collections::VecDeque,
    fmt,
    sync::{Arc, Weak},
    thread::JoinHandle,
    time::Instant,
};
use tracing::{debug, trace, warn};

/// Lifecycle status of a bridge channel.
///
/// Transitions are monotone: `Wait` may become `End` or
/// `EndNoDissolve`, and terminal states never change.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelStatus {
    /// Participating; the owner thread is in its join loop.
    Wait,
    /// Leaving because the endpoint hung up; dissolve policy applies.
    End,
    /// Leaving without implying anything about the bridge.
    EndNoDissolve,
}

/// What the owner thread is doing, inspected by the optimizer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Activity {
    Idle,
    Simple,
    Frame,
}

pub(crate) struct ChanState {
    status: ChannelStatus,
    cause: Cause,
    in_bridge: bool,
    just_joined: bool,
    suspended: bool,
    depart_wait: bool,
    activity: Activity,
    queue: VecDeque<Frame>,
    /// One token per queued frame; the alert-pipe byte invariant.
    tokens: usize,
    poked: bool,
    /// Digit written into the bridge whose end has not been.
    owed_dtmf: Option<(char, Instant)>,
    /// Digit mid-flight toward the endpoint.
    sent_dtmf: Option<char>,
    saved_read_format: Option<Format>,
    saved_write_format: Option<Format>,
    swap: Option<Arc<dyn Endpoint>>,
    binaural_dirty: bool,
    stream_to_bridge: Vec<Option<usize>>,
    stream_to_channel: Vec<Option<usize>>,
    /// Subclass-private state, owned by the bridge personality.
    pub bridge_pvt: Option<Box<dyn Any + Send>>,
    /// Technology-private state, owned by the current technology.
    pub tech_pvt: Option<Box<dyn Any + Send>>,
}

impl ChanState {
    fn new() -> Self {
        Self {
            status: ChannelStatus::Wait,
            cause: Cause::NotDefined,
            in_bridge: false,
            just_joined: false,
            suspended: false,
            depart_wait: false,
            activity: Activity::Idle,
            queue: VecDeque::new(),
            tokens: 0,
            poked: false,
            owed_dtmf: None,
            sent_dtmf: None,
            saved_read_format: None,
            saved_write_format: None,
            swap: None,
            binaural_dirty: false,
            stream_to_bridge: Vec::new(),
            stream_to_channel: Vec::new(),
            bridge_pvt: None,
            tech_pvt: None,
        }
    }
}

/// Pokes a channel's owner thread awake. Handed to the endpoint so
/// frame arrival interrupts the join loop's wait.
#[derive(Clone)]
pub struct ChannelWaker {
    channel: Weak<BridgeChannel>,
}

impl ChannelWaker {
    /// Wakes the owner thread.
    pub fn wake(&self) {
        if let Some(ch) = self.channel.upgrade() {
            let mut st = ch.st.lock();
            st.poked = true;
            drop(st);
            ch.cond.notify_all();
        }
    }
}

impl fmt::Debug for ChannelWaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelWaker")
    }
}

pub(crate) enum TakeOutcome {
    Frame(Frame),
    OnlyDeferred,
    Empty,
}

/// One endpoint's participation in one bridge.
pub struct BridgeChannel {
    endpoint: Arc<dyn Endpoint>,
    pub(crate) core: Weak<Core>,
    bridge: Mutex<Arc<Bridge>>,
    features: Mutex<FeatureSet>,
    st: Mutex<ChanState>,
    cond: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeChannel {
    /// Creates a channel bound to a bridge, ready to be pushed.
    #[must_use]
    pub fn new(
        core: &Arc<Core>,
        bridge: &Arc<Bridge>,
        endpoint: Arc<dyn Endpoint>,
        features: FeatureSet,
    ) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            core: Arc::downgrade(core),
            bridge: Mutex::new(bridge.clone()),
            features: Mutex::new(features),
            st: Mutex::new(ChanState::new()),
            cond: Condvar::new(),
            thread: Mutex::new(None),
        })
    }

    /// The wrapped endpoint.
    #[must_use]
    pub fn endpoint(&self) -> Arc<dyn Endpoint> {
        self.endpoint.clone()
    }

    /// The bridge this channel currently belongs to.
    ///
    /// Moves retarget this under both bridge locks; treat the answer
    /// as advisory unless the bridge lock is held.
    #[must_use]
    pub fn bridge(&self) -> Arc<Bridge> {
        self.bridge.lock().clone()
    }

    /// The core this channel's bridge belongs to.
    pub fn core(&self) -> Result<Arc<Core>> {
        self.core.upgrade().ok_or(Error::Offline)
    }

    /// The channel's feature set.
    pub fn features(&self) -> MutexGuard<'_, FeatureSet> {
        self.features.lock()
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        self.st.lock().status
    }

    /// The cause recorded when the channel left `Wait`.
    #[must_use]
    pub fn cause(&self) -> Cause {
        self.st.lock().cause
    }

    /// Whether the channel is currently a member of its bridge.
    #[must_use]
    pub fn in_bridge(&self) -> bool {
        self.st.lock().in_bridge
    }

    /// Whether the channel is suspended.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.st.lock().suspended
    }

    /// Whether connected-line updates are suppressed.
    #[must_use]
    pub fn inhibit_colp(&self) -> bool {
        self.features.lock().inhibit_colp
    }

    /// A waker for the owner thread.
    #[must_use]
    pub fn waker(self: &Arc<Self>) -> ChannelWaker {
        ChannelWaker {
            channel: Arc::downgrade(self),
        }
    }

    // -- lifecycle transitions -------------------------------------

    /// Moves the channel out of `Wait`, recording a cause.
    ///
    /// This is the only path out of the join loop; terminal states
    /// are never overwritten.
    pub fn leave_bridge(&self, status: ChannelStatus, cause: Cause) {
        let mut st = self.st.lock();
        if st.status != ChannelStatus::Wait || status == ChannelStatus::Wait {
            return;
        }
        debug!(
            "Channel {} leaving ({:?}, cause {:?}).",
            self.endpoint.name(),
            status,
            cause
        );
        st.status = status;
        st.cause = cause;
        st.poked = true;
        drop(st);
        self.cond.notify_all();
    }

    /// Kicks the channel out of its bridge without implying hangup.
    pub fn kick(&self, cause: Cause) {
        self.leave_bridge(ChannelStatus::EndNoDissolve, cause);
    }

    pub(crate) fn mark_joined(&self, _bridge: &Arc<Bridge>) {
        let mut st = self.st.lock();
        st.in_bridge = true;
        st.just_joined = true;
    }

    pub(crate) fn mark_left(&self) {
        let mut st = self.st.lock();
        st.in_bridge = false;
        st.just_joined = false;
    }

    pub(crate) fn just_joined(&self) -> bool {
        self.st.lock().just_joined
    }

    pub(crate) fn set_just_joined(&self, just_joined: bool) {
        self.st.lock().just_joined = just_joined;
    }

    pub(crate) fn set_depart_wait(&self, wait: bool) {
        self.st.lock().depart_wait = wait;
    }

    pub(crate) fn depart_wait(&self) -> bool {
        self.st.lock().depart_wait
    }

    /// Stashes an endpoint to swap out on first push.
    pub(crate) fn set_swap(&self, swap: Option<Arc<dyn Endpoint>>) {
        self.st.lock().swap = swap;
    }

    pub(crate) fn take_swap(&self) -> Option<Arc<dyn Endpoint>> {
        self.st.lock().swap.take()
    }

    /// Retargets the owning bridge. Both bridge locks held by caller.
    pub(crate) fn set_bridge(&self, bridge: Arc<Bridge>) {
        *self.bridge.lock() = bridge;
    }

    pub(crate) fn set_thread(&self, handle: JoinHandle<()>) {
        *self.thread.lock() = Some(handle);
    }

    pub(crate) fn take_thread(&self) -> Option<JoinHandle<()>> {
        self.thread.lock().take()
    }

    pub(crate) fn set_activity(&self, activity: Activity) {
        self.st.lock().activity = activity;
    }

    pub(crate) fn activity(&self) -> Activity {
        self.st.lock().activity
    }

    /// Installs subclass-private state on this participation.
    pub fn set_bridge_pvt(&self, pvt: Box<dyn Any + Send>) {
        self.st.lock().bridge_pvt = Some(pvt);
    }

    /// Detaches the subclass-private state.
    pub fn take_bridge_pvt(&self) -> Option<Box<dyn Any + Send>> {
        self.st.lock().bridge_pvt.take()
    }

    /// Installs technology-private state on this participation.
    pub fn set_tech_pvt(&self, pvt: Box<dyn Any + Send>) {
        self.st.lock().tech_pvt = Some(pvt);
    }

    /// Detaches the technology-private state.
    pub fn take_tech_pvt(&self) -> Option<Box<dyn Any + Send>> {
        self.st.lock().tech_pvt.take()
    }

    /// Marks the binaural position stale for the next mixing pass.
    pub fn set_binaural_dirty(&self) {
        self.st.lock().binaural_dirty = true;
    }

    /// Consumes the binaural-position dirty bit.
    pub fn take_binaural_dirty(&self) -> bool {
        std::mem::take(&mut self.st.lock().binaural_dirty)
    }

    /// Installs the channel↔bridge media stream index maps.
    pub fn set_stream_maps(
        &self,
        to_bridge: Vec<Option<usize>>,
        to_channel: Vec<Option<usize>>,
    ) {
        let mut st = self.st.lock();
        st.stream_to_bridge = to_bridge;
        st.stream_to_channel = to_channel;
    }

    /// Maps a channel stream index into bridge numbering.
    #[must_use]
    pub fn stream_to_bridge(&self, stream: usize) -> Option<usize> {
        self.st.lock().stream_to_bridge.get(stream).copied().flatten()
    }

    /// Maps a bridge stream index into channel numbering.
    #[must_use]
    pub fn stream_to_channel(&self, stream: usize) -> Option<usize> {
        self.st.lock().stream_to_channel.get(stream).copied().flatten()
    }

    // -- queueing --------------------------------------------------

    /// Queues a frame for the owner thread, raising one alert token.
    ///
    /// Media directed at a suspended channel is silently discarded;
    /// frames directed at a departing channel are dropped with an
    /// error.
    pub fn queue_frame(&self, frame: Frame) -> Result<()> {
        let mut st = self.st.lock();
        if st.status != ChannelStatus::Wait {
            trace!(
                "Dropping {:?} queued to departing {}.",
                frame,
                self.endpoint.name()
            );
            return Err(Error::WrongState);
        }
        if st.suspended && !frame.is_dtmf() && !frame.is_deferrable() {
            return Ok(());
        }

        st.queue.push_back(frame);
        st.tokens += 1;
        drop(st);
        self.cond.notify_all();
        Ok(())
    }

    /// Queues deferred work for the owner thread.
    pub fn queue_action(&self, action: ChannelAction) -> Result<()> {
        self.queue_frame(Frame::Action(action))
    }

    /// Pops one frame, honouring the DTMF-collection deferral rule:
    /// while digits are accumulating, action frames stay queued.
    pub(crate) fn take_frame(&self, collecting: bool) -> TakeOutcome {
        let mut st = self.st.lock();
        debug_assert_eq!(st.tokens, st.queue.len());

        if st.queue.is_empty() {
            return TakeOutcome::Empty;
        }

        let at = if collecting {
            match st.queue.iter().position(|f| !f.is_action()) {
                Some(at) => at,
                None => return TakeOutcome::OnlyDeferred,
            }
        } else {
            0
        };

        st.tokens -= 1;
        match st.queue.remove(at) {
            Some(frame) => TakeOutcome::Frame(frame),
            None => TakeOutcome::Empty,
        }
    }

    /// Count of queued frames, gating optimization.
    #[must_use]
    pub fn queued_frames(&self) -> usize {
        self.st.lock().queue.len()
    }

    // -- bridge access ---------------------------------------------

    /// Runs `f` with this channel's bridge locked.
    ///
    /// Locks upward safely: reads the bridge pointer, locks the
    /// bridge, then re-checks the pointer in case a move retargeted
    /// the channel in between.
    pub fn with_bridge_locked<R>(
        self: &Arc<Self>,
        f: impl FnOnce(&Arc<Bridge>, &mut BridgeState) -> R,
    ) -> R {
        loop {
            let bridge = self.bridge();
            let mut state = bridge.lock();
            if Arc::ptr_eq(&bridge, &*self.bridge.lock()) {
                return f(&bridge, &mut state);
            }
        }
    }

    /// Writes a frame into the bridge via the current technology.
    pub fn write_frame(self: &Arc<Self>, frame: Frame) -> Result<()> {
        if !self.in_bridge() {
            return Err(Error::NotInBridge);
        }

        match &frame {
            Frame::DtmfBegin(d) => {
                self.st.lock().owed_dtmf = Some((*d, Instant::now()));
            },
            Frame::DtmfEnd(_) => {
                self.st.lock().owed_dtmf = None;
            },
            _ => {},
        }

        self.set_activity(Activity::Simple);
        let result = self.with_bridge_locked(|_bridge, state| {
            if state.dissolved() {
                return Err(Error::Dissolved);
            }
            let tech = state.technology();
            tech.write(state, self, frame);
            Ok(())
        });
        self.set_activity(Activity::Idle);
        result
    }

    /// Writes deferred work into the bridge for distribution to the
    /// other members.
    pub fn write_action(self: &Arc<Self>, action: ChannelAction) -> Result<()> {
        self.write_frame(Frame::Action(action))
    }

    // -- suspension ------------------------------------------------

    /// Suspends the channel: media stops, the member leaves the
    /// active count, and the technology is told.
    pub fn suspend(self: &Arc<Self>) {
        self.with_bridge_locked(|_bridge, state| suspend_locked(state, self));
    }

    /// Resumes a suspended channel.
    pub fn unsuspend(self: &Arc<Self>) {
        self.with_bridge_locked(|_bridge, state| unsuspend_locked(state, self));
    }

    // -- waiting ---------------------------------------------------

    /// Parks the owner thread until a frame, a poke, an endpoint
    /// frame, or the deadline arrives. Suspended channels sleep
    /// through media and timers until resumed.
    fn wait(&self, deadline: Option<Instant>) {
        let mut st = self.st.lock();
        loop {
            if st.status != ChannelStatus::Wait {
                break;
            }
            if st.suspended {
                self.cond.wait(&mut st);
                continue;
            }
            if st.tokens > 0 || st.poked || self.endpoint.frames_ready() {
                break;
            }
            match deadline {
                Some(d) => {
                    if Instant::now() >= d || self.cond.wait_until(&mut st, d).timed_out() {
                        break;
                    }
                },
                None => self.cond.wait(&mut st),
            }
        }
        st.poked = false;
    }

    fn save_formats(&self) {
        let mut st = self.st.lock();
        st.saved_read_format = Some(self.endpoint.read_format());
        st.saved_write_format = Some(self.endpoint.write_format());
    }

    fn restore_formats(&self) {
        let (read, write) = {
            let mut st = self.st.lock();
            (st.saved_read_format.take(), st.saved_write_format.take())
        };
        if let Some(fmt) = read {
            if self.endpoint.set_read_format(&fmt).is_err() {
                warn!(
                    "Could not restore read format {} on {}.",
                    fmt,
                    self.endpoint.name()
                );
            }
        }
        if let Some(fmt) = write {
            if self.endpoint.set_write_format(&fmt).is_err() {
                warn!(
                    "Could not restore write format {} on {}.",
                    fmt,
                    self.endpoint.name()
                );
            }
        }
    }

    fn take_sent_dtmf(&self) -> Option<char> {
        self.st.lock().sent_dtmf.take()
    }

    fn note_written(&self, frame: &Frame) {
        match frame {
            Frame::DtmfBegin(d) => self.st.lock().sent_dtmf = Some(*d),
            Frame::DtmfEnd(_) => self.st.lock().sent_dtmf = None,
            _ => {},
        }
    }

    /// Writes the end of any digit this channel owes the bridge, so
    /// peers never hear a stuck tone.
    pub(crate) fn settle_owed_locked(self: &Arc<Self>, state: &mut BridgeState) {
        let owed = self.st.lock().owed_dtmf.take();
        if let Some((digit, started)) = owed {
            debug!(
                "Channel {} settling owed DTMF end for '{}' ({}ms in).",
                self.endpoint.name(),
                digit,
                started.elapsed().as_millis()
            );
            let tech = state.technology();
            tech.write(state, self, Frame::DtmfEnd(digit));
        }
    }
}

impl fmt::Debug for BridgeChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.st.lock();
        f.debug_struct("BridgeChannel")
            .field("endpoint", &self.endpoint.name())
            .field("status", &st.status)
            .field("in_bridge", &st.in_bridge)
            .field("suspended", &st.suspended)
            .field("queued", &st.queue.len())
            .finish()
    }
}

// -- suspension plumbing -------------------------------------------

pub(crate) fn suspend_locked(state: &mut BridgeState, channel: &Arc<BridgeChannel>) {
    let mut st = channel.st.lock();
    if st.suspended {
        return;
    }
    st.suspended = true;
    let in_bridge = st.in_bridge;
    drop(st);

    if in_bridge {
        state.num_active = state.num_active.saturating_sub(1);
        let tech = state.technology();
        tech.suspend(state, channel);
    }
}

pub(crate) fn unsuspend_locked(state: &mut BridgeState, channel: &Arc<BridgeChannel>) {
    let mut st = channel.st.lock();
    if !st.suspended {
        return;
    }
    st.suspended = false;
    let in_bridge = st.in_bridge;
    drop(st);

    if in_bridge {
        state.num_active += 1;
        let tech = state.technology();
        tech.unsuspend(state, channel);
    }
    channel.cond.notify_all();
}

/// Runs `f` with this channel's media suspended.
pub(crate) fn with_media_suspended<R>(channel: &Arc<BridgeChannel>, f: impl FnOnce() -> R) -> R {
    channel.with_bridge_locked(|_bridge, state| suspend_locked(state, channel));
    let result = f();
    channel.with_bridge_locked(|_bridge, state| unsuspend_locked(state, channel));
    result
}

// -- hook runners --------------------------------------------------

fn run_lifecycle_hooks(
    channel: &Arc<BridgeChannel>,
    take: fn(&mut FeatureSet) -> Vec<crate::features::LifecycleHook>,
    restore: fn(&mut FeatureSet, Vec<crate::features::LifecycleHook>),
    suspend: bool,
) {
    let hooks = take(&mut channel.features());
    if hooks.is_empty() {
        return;
    }

    let run = |mut hooks: Vec<crate::features::LifecycleHook>| {
        let mut kept = Vec::new();
        for mut hook in hooks.drain(..) {
            if (hook.callback)(channel) == HookAction::Keep {
                kept.push(hook);
            }
        }
        kept
    };

    let kept = if suspend {
        with_media_suspended(channel, || run(hooks))
    } else {
        run(hooks)
    };

    restore(&mut channel.features(), kept);
}

pub(crate) fn run_join_hooks(channel: &Arc<BridgeChannel>) {
    run_lifecycle_hooks(
        channel,
        FeatureSet::take_join_hooks,
        FeatureSet::restore_join_hooks,
        true,
    );
}

pub(crate) fn run_leave_hooks(channel: &Arc<BridgeChannel>) {
    run_lifecycle_hooks(
        channel,
        FeatureSet::take_leave_hooks,
        FeatureSet::restore_leave_hooks,
        true,
    );
}

fn run_hangup_hooks(channel: &Arc<BridgeChannel>) {
    run_lifecycle_hooks(
        channel,
        FeatureSet::take_hangup_hooks,
        FeatureSet::restore_hangup_hooks,
        false,
    );
}

fn run_talk_hooks(channel: &Arc<BridgeChannel>, talking: bool) {
    let hooks = channel.features().take_talk_hooks();
    if hooks.is_empty() {
        return;
    }

    let mut kept = Vec::new();
    for mut hook in hooks {
        if (hook.callback)(channel, talking) == HookAction::Keep {
            kept.push(hook);
        }
    }
    channel.features().restore_talk_hooks(kept);
}

/// Runs move hooks as the channel is retargeted between bridges.
pub(crate) fn run_move_hooks(channel: &Arc<BridgeChannel>, from: &Arc<Bridge>, to: &Arc<Bridge>) {
    let hooks = channel.features().take_move_hooks();
    if hooks.is_empty() {
        return;
    }

    let mut kept = Vec::new();
    for mut hook in hooks {
        if (hook.callback)(channel, from, to) == HookAction::Keep {
            kept.push(hook);
        }
    }
    channel.features().restore_move_hooks(kept);
}

fn run_dtmf_hook(channel: &Arc<BridgeChannel>, code: &str) {
    let hook = channel.features().take_dtmf(code);
    let mut hook = match hook {
        Some(hook) => hook,
        None => return,
    };

    debug!(
        "Channel {} dispatching DTMF hook {}.",
        channel.endpoint().name(),
        code
    );
    let action = with_media_suspended(channel, || (hook.callback)(channel));
    if action == HookAction::Keep {
        channel.features().restore_dtmf(hook);
    }
}

fn run_interval_hooks(channel: &Arc<BridgeChannel>) {
    let now = Instant::now();
    let media = channel.features().interval.due_wants_media(now);
    if media {
        channel.with_bridge_locked(|_b, state| suspend_locked(state, channel));
    }

    loop {
        let hook = channel.features().interval.pop_due(Instant::now());
        let mut hook = match hook {
            Some(hook) => hook,
            None => break,
        };

        match (hook.callback)(channel) {
            IntervalAction::Remove => {},
            IntervalAction::Keep => {
                channel.features().interval.reschedule(hook, Instant::now());
            },
            IntervalAction::Reset(interval) => {
                hook.interval = interval;
                channel.features().interval.reschedule(hook, Instant::now());
            },
        }
    }

    if media {
        channel.with_bridge_locked(|_b, state| unsuspend_locked(state, channel));
    }
}

// -- the join loop -------------------------------------------------

fn interdigit_timeout(channel: &Arc<BridgeChannel>) -> std::time::Duration {
    channel
        .core()
        .map(|c| c.config().feature_digit_timeout)
        .unwrap_or(DEFAULT_FEATURE_DIGIT_TIMEOUT)
}

fn install_limits(channel: &Arc<BridgeChannel>) {
    let limits = channel.features().limits.clone();
    let limits = match limits {
        Some(l) => l,
        None => return,
    };

    if let Some(sound) = limits.connect_sound.clone() {
        let _ = channel.queue_action(ChannelAction::PlayFile(sound));
    }

    if let (Some(warning), Some(sound)) = (limits.warning, limits.warning_sound.clone()) {
        if warning < limits.duration {
            let frequency = limits.frequency;
            channel.features().interval_hook(
                limits.duration - warning,
                true,
                crate::features::HookRemove::ON_PULL,
                Box::new(move |ch| {
                    let _ = ch.endpoint().stream_and_wait(&sound);
                    match frequency {
                        Some(f) => IntervalAction::Reset(f),
                        None => IntervalAction::Remove,
                    }
                }),
            );
        }
    }

    channel.features().interval_hook(
        limits.duration,
        false,
        crate::features::HookRemove::ON_PULL,
        Box::new(|ch| {
            ch.leave_bridge(ChannelStatus::EndNoDissolve, Cause::NormalClearing);
            IntervalAction::Remove
        }),
    );
}

/// Joins the channel to its bridge under the bridge lock.
fn internal_join(channel: &Arc<BridgeChannel>) -> Result<()> {
    let endpoint = channel.endpoint();

    channel.save_formats();

    if let Some(extra) = endpoint.features() {
        channel.features().merge(extra);
    }
    install_limits(channel);

    channel.with_bridge_locked(|bridge, state| {
        if endpoint.is_zombie() || endpoint.bridge_id().is_some() {
            return Err(Error::InvalidArgument);
        }

        super::push_locked(bridge, state, channel)?;
        endpoint.set_bridge_id(Some(bridge.uuid()));
        reconfigured_locked(bridge, state, true);
        Ok(())
    })
}

fn handle_endpoint_frame(channel: &Arc<BridgeChannel>, collector: &mut DtmfCollector, frame: Frame) {
    let endpoint = channel.endpoint();

    match frame {
        Frame::Control(Control::Hangup) => {
            run_hangup_hooks(channel);
            channel.leave_bridge(ChannelStatus::End, endpoint.hangup_cause());
        },
        Frame::DtmfBegin(digit) => {
            let verdict = collector.digit_begin(digit, |seq| channel.features().dtmf_search(seq));
            match verdict {
                DigitVerdict::Pass if channel.features().dtmf_passthrough => {
                    let _ = channel.write_frame(Frame::DtmfBegin(digit));
                },
                _ => {},
            }
        },
        Frame::DtmfEnd(digit) => {
            let verdict = collector.digit_end(
                digit,
                |seq| channel.features().dtmf_search(seq),
                interdigit_timeout(channel),
                Instant::now(),
            );
            apply_dtmf_verdict(channel, verdict, Some(digit));
        },
        Frame::Null => {},
        other => {
            let _ = channel.write_frame(other);
        },
    }
}

fn apply_dtmf_verdict(channel: &Arc<BridgeChannel>, verdict: DigitVerdict, digit: Option<char>) {
    match verdict {
        DigitVerdict::Pass => {
            if channel.features().dtmf_passthrough {
                if let Some(d) = digit {
                    let _ = channel.write_frame(Frame::DtmfEnd(d));
                }
            }
        },
        DigitVerdict::Consume => {},
        DigitVerdict::Dispatch(code) => run_dtmf_hook(channel, &code),
        DigitVerdict::Flush(digits) => {
            // Dead-end sequences stream to the peers; consumed hooks
            // never do.
            if channel.features().dtmf_passthrough {
                let _ = channel.write_action(ChannelAction::DtmfStream(digits));
            }
        },
    }
}

fn handle_queued_frame(channel: &Arc<BridgeChannel>, frame: Frame) {
    let endpoint = channel.endpoint();

    match frame {
        Frame::Null => {},
        Frame::Action(action) => dispatch_action(channel, action),
        Frame::ActionSync(sync) => {
            let SyncAction { id, action, ticket } = sync;
            trace!("Servicing sync action {} on {}.", id, endpoint.name());
            dispatch_action(channel, action);
            ticket.post();
        },
        Frame::Control(control) => endpoint.indicate(control),
        other => {
            channel.note_written(&other);
            let _ = endpoint.write(other);
        },
    }
}

fn dispatch_action(channel: &Arc<BridgeChannel>, action: ChannelAction) {
    let endpoint = channel.endpoint();

    match action {
        ChannelAction::DtmfStream(digits) => {
            with_media_suspended(channel, || endpoint.dtmf_stream(&digits));
        },
        ChannelAction::TalkingStart => run_talk_hooks(channel, true),
        ChannelAction::TalkingStop => run_talk_hooks(channel, false),
        ChannelAction::PlayFile(file) => {
            with_media_suspended(channel, || {
                if endpoint.stream_and_wait(&file).is_err() {
                    warn!("Playback of {} failed on {}.", file, endpoint.name());
                }
            });
        },
        ChannelAction::RunApp { app, args } => {
            with_media_suspended(channel, || {
                let ran = channel
                    .core()
                    .and_then(|core| core.run_app(&endpoint, &app, &args));
                if ran.is_err() {
                    warn!("Could not run {}({}) on {}.", app, args, endpoint.name());
                }
            });
        },
        ChannelAction::Callback {
            func,
            suspend_media,
        } => {
            if suspend_media {
                with_media_suspended(channel, || func(channel));
            } else {
                func(channel);
            }
        },
        ChannelAction::Park { lot } => {
            if let Err(e) = crate::park::park_from_action(channel, &lot) {
                warn!("Parking {} into {} failed: {}", endpoint.name(), lot, e);
            }
        },
        ChannelAction::BlindTransfer { context, exten } => {
            debug!(
                "Channel {} departing to {}@{} via blind transfer.",
                endpoint.name(),
                exten,
                context
            );
            if endpoint.async_goto(&context, &exten, 1).is_ok() {
                channel.leave_bridge(ChannelStatus::EndNoDissolve, Cause::NormalClearing);
            }
        },
        ChannelAction::AttendedTransfer { other_leg } => {
            let done = channel.core().and_then(|core| {
                crate::ops::transfer::attended(&core, &endpoint, &other_leg)
            });
            if let Err(e) = done {
                warn!("Attended transfer from {} failed: {}", endpoint.name(), e);
            }
        },
    }
}

/// The owner thread's main loop: service the endpoint, the write
/// queue, and the timers until the channel leaves `Wait`.
pub(crate) fn join_loop(channel: &Arc<BridgeChannel>) -> Result<()> {
    let endpoint = channel.endpoint();

    if let Err(e) = internal_join(channel) {
        channel.features().remove_on_pull();
        channel.restore_formats();
        return Err(e);
    }

    endpoint.attach_waker(channel.waker());

    let mut collector = DtmfCollector::default();
    run_join_hooks(channel);

    while channel.status() == ChannelStatus::Wait {
        if endpoint.unbridge_pending() {
            endpoint.clear_unbridge();
            channel.with_bridge_locked(|bridge, state| {
                state.reconfigured = true;
                reconfigured_locked(bridge, state, true);
            });
        }

        let interval_trip = channel.features().interval.next_trip();
        let deadline = match (interval_trip, collector.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        channel.wait(deadline);
        if channel.status() != ChannelStatus::Wait {
            break;
        }

        if endpoint.frames_ready() {
            let muted = channel.features().mute;
            let frame = if muted {
                endpoint.read_noaudio()
            } else {
                endpoint.read()
            };
            match frame {
                Some(frame) => handle_endpoint_frame(channel, &mut collector, frame),
                None => {
                    run_hangup_hooks(channel);
                    channel.leave_bridge(ChannelStatus::End, endpoint.hangup_cause());
                },
            }
        }

        loop {
            match channel.take_frame(collector.in_progress()) {
                TakeOutcome::Frame(frame) => {
                    channel.set_activity(Activity::Frame);
                    handle_queued_frame(channel, frame);
                    channel.set_activity(Activity::Idle);
                },
                TakeOutcome::OnlyDeferred => {
                    std::thread::sleep(DEFERRAL_PAUSE);
                    break;
                },
                TakeOutcome::Empty => break,
            }
        }

        let now = Instant::now();
        if channel
            .features()
            .interval
            .next_trip()
            .map(|t| t <= now)
            .unwrap_or(false)
        {
            run_interval_hooks(channel);
        }
        if collector.deadline().map(|d| d <= now).unwrap_or(false) {
            let verdict = collector.timeout(|seq| channel.features().dtmf_search(seq));
            apply_dtmf_verdict(channel, verdict, None);
        }
    }

    // Departure: leave hooks, then pull under the bridge lock.
    run_leave_hooks(channel);

    if collector.in_progress() {
        let verdict = collector.timeout(|seq| channel.features().dtmf_search(seq));
        apply_dtmf_verdict(channel, verdict, None);
    }

    channel.with_bridge_locked(|bridge, state| {
        pull_locked(bridge, state, channel);
        channel.settle_owed_locked(state);
        reconfigured_locked(bridge, state, true);
    });

    if endpoint.on_hold() {
        endpoint.indicate(Control::Unhold);
    }
    if let Some(digit) = channel.take_sent_dtmf() {
        let _ = endpoint.write(Frame::DtmfEnd(digit));
    }
    endpoint.indicate(Control::SrcChange);

    while endpoint.dual_redirect_wait() {
        std::thread::sleep(DUAL_REDIRECT_POLL);
    }

    endpoint.detach_waker();
    endpoint.set_bridge_id(None);
    channel.restore_formats();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        frame::Media,
        test_utils::{test_core, MockEndpoint},
        Capabilities,
    };

    fn detached_channel() -> (Arc<crate::Core>, Arc<BridgeChannel>) {
        let core = test_core();
        let bridge = core
            .builder()
            .capabilities(Capabilities::ONE_TO_ONE)
            .name("unit")
            .build()
            .expect("bridge builds");
        let endpoint = MockEndpoint::new("SIP/unit-1");
        let channel = BridgeChannel::new(&core, &bridge, endpoint, FeatureSet::new());
        (core, channel)
    }

    fn voice() -> Frame {
        Frame::Voice(Media::new(vec![0u8; 8]))
    }

    #[test]
    fn tokens_mirror_the_queue() {
        let (core, channel) = detached_channel();

        channel.queue_frame(voice()).expect("queues");
        channel.queue_frame(Frame::Null).expect("queues");
        {
            let st = channel.st.lock();
            assert_eq!(st.tokens, 2);
            assert_eq!(st.queue.len(), 2);
        }

        assert!(matches!(channel.take_frame(false), TakeOutcome::Frame(_)));
        {
            let st = channel.st.lock();
            assert_eq!(st.tokens, 1);
            assert_eq!(st.queue.len(), 1);
        }

        core.shutdown();
    }

    #[test]
    fn departing_channels_refuse_frames() {
        let (core, channel) = detached_channel();

        channel.leave_bridge(ChannelStatus::End, Cause::NormalClearing);
        assert_eq!(channel.queue_frame(voice()), Err(Error::WrongState));
        assert_eq!(channel.queued_frames(), 0);

        // Terminal states never change.
        channel.leave_bridge(ChannelStatus::EndNoDissolve, Cause::UserBusy);
        assert_eq!(channel.status(), ChannelStatus::End);
        assert_eq!(channel.cause(), Cause::NormalClearing);

        core.shutdown();
    }

    #[test]
    fn suspension_drops_media_but_keeps_control() {
        let (core, channel) = detached_channel();
        channel.st.lock().suspended = true;

        channel.queue_frame(voice()).expect("accepted and dropped");
        assert_eq!(channel.queued_frames(), 0);

        channel
            .queue_frame(Frame::Control(Control::Unhold))
            .expect("queues");
        channel.queue_frame(Frame::DtmfEnd('1')).expect("queues");
        assert_eq!(channel.queued_frames(), 2);

        core.shutdown();
    }

    #[test]
    fn collection_defers_actions_but_not_media() {
        let (core, channel) = detached_channel();

        channel
            .queue_frame(Frame::Action(ChannelAction::TalkingStart))
            .expect("queues");
        channel.queue_frame(voice()).expect("queues");

        // Mid-collection the action stays put and media jumps ahead.
        match channel.take_frame(true) {
            TakeOutcome::Frame(Frame::Voice(_)) => {},
            other => panic!(
                "expected the voice frame, got {:?}",
                matches!(other, TakeOutcome::OnlyDeferred)
            ),
        }
        assert!(matches!(channel.take_frame(true), TakeOutcome::OnlyDeferred));

        // Once the sequence resolves the action is deliverable.
        assert!(matches!(
            channel.take_frame(false),
            TakeOutcome::Frame(Frame::Action(_))
        ));

        core.shutdown();
    }

    #[test]
    fn waker_pokes_through_the_endpoint() {
        let (core, channel) = detached_channel();

        channel.waker().wake();
        assert!(channel.st.lock().poked);

        core.shutdown();
    }
}
