//! Per-channel feature sets: DTMF codes, timers, and lifecycle hooks.

pub(crate) mod dtmf;
mod hooks;
mod interval;

pub use self::{
    dtmf::DtmfSearch,
    hooks::{
        DtmfCallback,
        DtmfHook,
        HookAction,
        HookRemove,
        IntervalAction,
        LifecycleCallback,
        LifecycleHook,
        MoveCallback,
        MoveHook,
        TalkCallback,
        TalkHook,
    },
    interval::{IntervalCallback, IntervalHook, IntervalHooks},
};

use bitflags::bitflags;
use std::{fmt, time::Duration};

bitflags! {
    /// Per-channel behaviour flags carried in a feature set.
    #[derive(Default)]
    pub struct ChannelFeatureFlags: u32 {
        /// When this channel hangs up, dissolve the whole bridge.
        const DISSOLVE_HANGUP = 1 << 0;
        /// This channel leaves if every remaining member is lonely.
        const LONELY = 1 << 1;
        /// This channel may not be moved to another bridge.
        const IMMOVABLE = 1 << 2;
    }
}

/// Duration-limit configuration applied when the channel joins.
#[derive(Clone, Debug)]
pub struct Limits {
    /// Maximum time in the bridge before the channel is kicked.
    pub duration: Duration,
    /// Lead time before the kick at which warnings begin.
    pub warning: Option<Duration>,
    /// Gap between repeated warnings.
    pub frequency: Option<Duration>,
    /// Sound played on entering the limited bridge.
    pub connect_sound: Option<String>,
    /// Sound played at each warning.
    pub warning_sound: Option<String>,
}

impl Limits {
    /// Limits that kick after `duration` with no warnings.
    #[must_use]
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            warning: None,
            frequency: None,
            connect_sound: None,
            warning_sound: None,
        }
    }
}

/// Everything installable on one channel's participation: DTMF codes,
/// timers, lifecycle hooks, and behaviour toggles.
#[derive(Default)]
pub struct FeatureSet {
    dtmf: Vec<DtmfHook>,
    pub(crate) interval: IntervalHooks,
    join: Vec<LifecycleHook>,
    leave: Vec<LifecycleHook>,
    hangup: Vec<LifecycleHook>,
    talk: Vec<TalkHook>,
    moved: Vec<MoveHook>,
    /// Behaviour flags.
    pub flags: ChannelFeatureFlags,
    /// Drop audio read from the endpoint.
    pub mute: bool,
    /// Forward unconsumed DTMF to the bridge.
    pub dtmf_passthrough: bool,
    /// Suppress connected-line updates toward this channel.
    pub inhibit_colp: bool,
    /// Allow text messages through this channel.
    pub text_messaging: bool,
    /// Duration limits installed at join.
    pub limits: Option<Limits>,
}

impl FeatureSet {
    /// Creates an empty feature set with passthrough enabled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            dtmf_passthrough: true,
            ..Self::default()
        }
    }

    // -- installation ----------------------------------------------

    /// Installs a DTMF hook, replacing any hook with the same code.
    pub fn dtmf_hook(&mut self, code: &str, remove_flags: HookRemove, callback: DtmfCallback) {
        let code = code.to_string();
        self.dtmf
            .retain(|h| !h.code.eq_ignore_ascii_case(&code));

        let hook = DtmfHook {
            code,
            callback,
            remove_flags,
        };
        let at = self
            .dtmf
            .binary_search_by(|h| {
                h.code
                    .to_ascii_lowercase()
                    .cmp(&hook.code.to_ascii_lowercase())
            })
            .unwrap_or_else(|e| e);
        self.dtmf.insert(at, hook);
    }

    /// Installs an interval hook firing every `interval`.
    pub fn interval_hook(
        &mut self,
        interval: Duration,
        media: bool,
        remove_flags: HookRemove,
        callback: IntervalCallback,
    ) {
        self.interval.install(interval, media, remove_flags, callback);
    }

    /// Installs a hook run when the channel joins a bridge.
    pub fn join_hook(&mut self, remove_flags: HookRemove, callback: LifecycleCallback) {
        self.join.push(LifecycleHook {
            callback,
            remove_flags,
        });
    }

    /// Installs a hook run when the channel leaves a bridge.
    pub fn leave_hook(&mut self, remove_flags: HookRemove, callback: LifecycleCallback) {
        self.leave.push(LifecycleHook {
            callback,
            remove_flags,
        });
    }

    /// Installs a hook run when the channel is kicked by hangup.
    pub fn hangup_hook(&mut self, remove_flags: HookRemove, callback: LifecycleCallback) {
        self.hangup.push(LifecycleHook {
            callback,
            remove_flags,
        });
    }

    /// Installs a hook run when the technology reports speech.
    pub fn talk_hook(&mut self, remove_flags: HookRemove, callback: TalkCallback) {
        self.talk.push(TalkHook {
            callback,
            remove_flags,
        });
    }

    /// Installs a hook run when the channel moves between bridges.
    pub fn move_hook(&mut self, remove_flags: HookRemove, callback: MoveCallback) {
        self.moved.push(MoveHook {
            callback,
            remove_flags,
        });
    }

    // -- queries ---------------------------------------------------

    /// Probes the DTMF hook codes with a collected digit string.
    #[must_use]
    pub fn dtmf_search(&self, seq: &str) -> DtmfSearch {
        let seq = seq.to_ascii_lowercase();
        let mut partial = false;

        for hook in &self.dtmf {
            let code = hook.code.to_ascii_lowercase();
            if code == seq {
                return DtmfSearch::Exact;
            }
            partial |= code.starts_with(&seq);
        }

        if partial {
            DtmfSearch::Partial
        } else {
            DtmfSearch::Miss
        }
    }

    /// Number of installed DTMF hooks.
    #[must_use]
    pub fn dtmf_hook_count(&self) -> usize {
        self.dtmf.len()
    }

    /// Number of installed interval hooks.
    #[must_use]
    pub fn interval_hook_count(&self) -> usize {
        self.interval.len()
    }

    // -- hook execution plumbing -----------------------------------

    /// Detaches the DTMF hook registered under `code`.
    pub(crate) fn take_dtmf(&mut self, code: &str) -> Option<DtmfHook> {
        let at = self
            .dtmf
            .iter()
            .position(|h| h.code.eq_ignore_ascii_case(code))?;
        Some(self.dtmf.remove(at))
    }

    /// Re-attaches a DTMF hook that survived its own dispatch, unless
    /// its code was re-registered while it ran.
    pub(crate) fn restore_dtmf(&mut self, hook: DtmfHook) {
        if self.dtmf_search(&hook.code) == DtmfSearch::Exact {
            return;
        }
        let at = self
            .dtmf
            .binary_search_by(|h| {
                h.code
                    .to_ascii_lowercase()
                    .cmp(&hook.code.to_ascii_lowercase())
            })
            .unwrap_or_else(|e| e);
        self.dtmf.insert(at, hook);
    }

    pub(crate) fn take_join_hooks(&mut self) -> Vec<LifecycleHook> {
        std::mem::take(&mut self.join)
    }

    pub(crate) fn restore_join_hooks(&mut self, mut kept: Vec<LifecycleHook>) {
        kept.append(&mut self.join);
        self.join = kept;
    }

    pub(crate) fn take_leave_hooks(&mut self) -> Vec<LifecycleHook> {
        std::mem::take(&mut self.leave)
    }

    pub(crate) fn restore_leave_hooks(&mut self, mut kept: Vec<LifecycleHook>) {
        kept.append(&mut self.leave);
        self.leave = kept;
    }

    pub(crate) fn take_hangup_hooks(&mut self) -> Vec<LifecycleHook> {
        std::mem::take(&mut self.hangup)
    }

    pub(crate) fn restore_hangup_hooks(&mut self, mut kept: Vec<LifecycleHook>) {
        kept.append(&mut self.hangup);
        self.hangup = kept;
    }

    pub(crate) fn take_talk_hooks(&mut self) -> Vec<TalkHook> {
        std::mem::take(&mut self.talk)
    }

    pub(crate) fn restore_talk_hooks(&mut self, mut kept: Vec<TalkHook>) {
        kept.append(&mut self.talk);
        self.talk = kept;
    }

    pub(crate) fn take_move_hooks(&mut self) -> Vec<MoveHook> {
        std::mem::take(&mut self.moved)
    }

    pub(crate) fn restore_move_hooks(&mut self, mut kept: Vec<MoveHook>) {
        kept.append(&mut self.moved);
        self.moved = kept;
    }

    // -- bulk maintenance ------------------------------------------

    /// Unlinks every hook flagged for removal on pull.
    pub(crate) fn remove_on_pull(&mut self) {
        let on_pull = |f: HookRemove| f.contains(HookRemove::ON_PULL);

        self.dtmf.retain(|h| !on_pull(h.remove_flags));
        self.join.retain(|h| !on_pull(h.remove_flags));
        self.leave.retain(|h| !on_pull(h.remove_flags));
        self.hangup.retain(|h| !on_pull(h.remove_flags));
        self.talk.retain(|h| !on_pull(h.remove_flags));
        self.moved.retain(|h| !on_pull(h.remove_flags));
        self.interval
            .remove_where(|h| on_pull(h.remove_flags));
    }

    /// Unlinks every hook flagged for removal on personality change.
    pub(crate) fn remove_on_personality_change(&mut self) {
        let on_change = |f: HookRemove| f.contains(HookRemove::ON_PERSONALITY_CHANGE);

        self.dtmf.retain(|h| !on_change(h.remove_flags));
        self.join.retain(|h| !on_change(h.remove_flags));
        self.leave.retain(|h| !on_change(h.remove_flags));
        self.hangup.retain(|h| !on_change(h.remove_flags));
        self.talk.retain(|h| !on_change(h.remove_flags));
        self.moved.retain(|h| !on_change(h.remove_flags));
        self.interval
            .remove_where(|h| on_change(h.remove_flags));
    }

    /// Merges another feature set into this one.
    ///
    /// Hook containers concatenate (DTMF duplicates replace), interval
    /// hooks are re-wrapped with fresh sequence numbers, and flag bits
    /// are OR'ed together.
    pub fn merge(&mut self, mut other: FeatureSet) {
        for hook in other.dtmf.drain(..) {
            self.dtmf
                .retain(|h| !h.code.eq_ignore_ascii_case(&hook.code));
            let at = self
                .dtmf
                .binary_search_by(|h| {
                    h.code
                        .to_ascii_lowercase()
                        .cmp(&hook.code.to_ascii_lowercase())
                })
                .unwrap_or_else(|e| e);
            self.dtmf.insert(at, hook);
        }

        for hook in other.interval.drain() {
            self.interval.adopt(hook);
        }

        self.join.append(&mut other.join);
        self.leave.append(&mut other.leave);
        self.hangup.append(&mut other.hangup);
        self.talk.append(&mut other.talk);
        self.moved.append(&mut other.moved);

        self.flags |= other.flags;
        self.mute |= other.mute;
        self.dtmf_passthrough |= other.dtmf_passthrough;
        self.inhibit_colp |= other.inhibit_colp;
        self.text_messaging |= other.text_messaging;
        if other.limits.is_some() {
            self.limits = other.limits;
        }
    }
}

impl fmt::Debug for FeatureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureSet")
            .field("dtmf", &self.dtmf)
            .field("interval", &self.interval)
            .field("join", &self.join.len())
            .field("leave", &self.leave.len())
            .field("hangup", &self.hangup.len())
            .field("talk", &self.talk.len())
            .field("moved", &self.moved.len())
            .field("flags", &self.flags)
            .field("mute", &self.mute)
            .field("dtmf_passthrough", &self.dtmf_passthrough)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> DtmfCallback {
        Box::new(|_| HookAction::Keep)
    }

    #[test]
    fn search_is_case_insensitive_and_prefix_aware() {
        let mut f = FeatureSet::new();
        f.dtmf_hook("*2A", HookRemove::empty(), noop());

        assert_eq!(f.dtmf_search("*2a"), DtmfSearch::Exact);
        assert_eq!(f.dtmf_search("*2"), DtmfSearch::Partial);
        assert_eq!(f.dtmf_search("#"), DtmfSearch::Miss);
    }

    #[test]
    fn duplicate_code_replaces() {
        let mut f = FeatureSet::new();
        f.dtmf_hook("*2", HookRemove::empty(), noop());
        f.dtmf_hook("*2", HookRemove::ON_PULL, noop());

        assert_eq!(f.dtmf_hook_count(), 1);
        assert!(f.take_dtmf("*2").unwrap().remove_flags.contains(HookRemove::ON_PULL));
    }

    #[test]
    fn merge_ors_flags_and_adopts_hooks() {
        let mut a = FeatureSet::new();
        a.dtmf_hook("*2", HookRemove::empty(), noop());

        let mut b = FeatureSet::new();
        b.dtmf_hook("*3", HookRemove::empty(), noop());
        b.interval_hook(
            Duration::from_secs(1),
            false,
            HookRemove::empty(),
            Box::new(|_| IntervalAction::Keep),
        );
        b.flags |= ChannelFeatureFlags::LONELY;
        b.mute = true;

        a.merge(b);

        assert_eq!(a.dtmf_hook_count(), 2);
        assert_eq!(a.interval.len(), 1);
        assert!(a.flags.contains(ChannelFeatureFlags::LONELY));
        assert!(a.mute);
        assert!(a.dtmf_passthrough);
    }

    #[test]
    fn merging_empty_set_changes_nothing() {
        let mut a = FeatureSet::new();
        a.dtmf_hook("*2", HookRemove::empty(), noop());
        a.flags |= ChannelFeatureFlags::IMMOVABLE;

        a.merge(FeatureSet::new());

        assert_eq!(a.dtmf_hook_count(), 1);
        assert!(a.flags.contains(ChannelFeatureFlags::IMMOVABLE));
    }

    #[test]
    fn remove_on_pull_strips_flagged_hooks() {
        let mut f = FeatureSet::new();
        f.dtmf_hook("*2", HookRemove::ON_PULL, noop());
        f.dtmf_hook("*3", HookRemove::empty(), noop());
        f.join_hook(HookRemove::ON_PULL, Box::new(|_| HookAction::Keep));

        f.remove_on_pull();

        assert_eq!(f.dtmf_hook_count(), 1);
        assert!(f.take_join_hooks().is_empty());
    }
}
