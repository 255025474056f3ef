//! Hook variants installable on a channel's feature set.

use bitflags::bitflags;
use std::{fmt, sync::Arc};

use crate::bridge::{channel::BridgeChannel, Bridge};

bitflags! {
    /// When a hook is automatically unlinked.
    #[derive(Default)]
    pub struct HookRemove: u8 {
        /// Unlink when the channel is pulled from its bridge.
        const ON_PULL = 1 << 0;
        /// Unlink when the bridge changes personality.
        const ON_PERSONALITY_CHANGE = 1 << 1;
    }
}

/// What a fired hook wants done with itself.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HookAction {
    /// Leave the hook installed.
    Keep,
    /// Unlink the hook.
    Remove,
}

/// What a fired interval hook wants done with itself.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IntervalAction {
    /// Re-arm with the unchanged interval.
    Keep,
    /// Re-arm with a new interval.
    Reset(std::time::Duration),
    /// Unlink the hook.
    Remove,
}

/// Callback form shared by join/leave/hangup hooks.
pub type LifecycleCallback = Box<dyn FnMut(&Arc<BridgeChannel>) -> HookAction + Send>;

/// Callback form for DTMF feature hooks.
pub type DtmfCallback = Box<dyn FnMut(&Arc<BridgeChannel>) -> HookAction + Send>;

/// Callback form for talk-detection hooks. The boolean is `true` at
/// speech start and `false` at speech end.
pub type TalkCallback = Box<dyn FnMut(&Arc<BridgeChannel>, bool) -> HookAction + Send>;

/// Callback form for move hooks, receiving the old and new bridges.
pub type MoveCallback =
    Box<dyn FnMut(&Arc<BridgeChannel>, &Arc<Bridge>, &Arc<Bridge>) -> HookAction + Send>;

/// A hook dispatched when a collected digit string matches its code.
pub struct DtmfHook {
    /// The digit string which trips the hook.
    pub code: String,
    pub(crate) callback: DtmfCallback,
    /// Automatic removal conditions.
    pub remove_flags: HookRemove,
}

impl fmt::Debug for DtmfHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DtmfHook({}, {:?})", self.code, self.remove_flags)
    }
}

/// A hook dispatched at a channel lifecycle boundary.
pub struct LifecycleHook {
    pub(crate) callback: LifecycleCallback,
    /// Automatic removal conditions.
    pub remove_flags: HookRemove,
}

impl fmt::Debug for LifecycleHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LifecycleHook({:?})", self.remove_flags)
    }
}

/// A hook dispatched when the mixing technology reports speech.
pub struct TalkHook {
    pub(crate) callback: TalkCallback,
    /// Automatic removal conditions.
    pub remove_flags: HookRemove,
}

impl fmt::Debug for TalkHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TalkHook({:?})", self.remove_flags)
    }
}

/// A hook dispatched when the channel moves between bridges.
pub struct MoveHook {
    pub(crate) callback: MoveCallback,
    /// Automatic removal conditions.
    pub remove_flags: HookRemove,
}

impl fmt::Debug for MoveHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MoveHook({:?})", self.remove_flags)
    }
}
