//! Mixing technologies: the pluggable backends that move media.
//!
//! The core owns membership and lifecycle; a [`Technology`] owns the
//! actual mixing. Bridges select the best registered technology for
//! their capability mask and may hot-swap it as membership changes.

use crate::{
    bridge::{channel::BridgeChannel, BridgeState},
    endpoint::FormatCap,
    error::{Error, Result},
};
use bitflags::bitflags;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};

bitflags! {
    /// What a mixing technology (or a bridge's allowed mask) can carry.
    pub struct Capabilities: u32 {
        /// Media is exchanged directly between two channel drivers.
        const NATIVE = 1 << 0;
        /// Media is relayed in early/pre-answer state.
        const EARLY = 1 << 1;
        /// Exactly two parties, mixed in the core.
        const ONE_TO_ONE = 1 << 2;
        /// Any number of parties, software mixed.
        const MULTIMIX = 1 << 3;
        /// Participants wait without hearing each other.
        const HOLDING = 1 << 4;
    }
}

/// A pluggable mixing backend.
///
/// All methods taking `&mut BridgeState` run with the bridge lock
/// held; implementations must not reacquire bridge or channel locks.
/// Technology-private state lives in [`BridgeState::tech_pvt`].
pub trait Technology: Send + Sync {
    /// Registry name, unique among technologies.
    fn name(&self) -> &'static str;

    /// Capability classes this technology can provide.
    fn capabilities(&self) -> Capabilities;

    /// Selection preference. Higher wins; registration order breaks
    /// ties.
    fn preference(&self) -> u32;

    /// Formats the technology can accept from members.
    ///
    /// An unconstrained set means members keep their own formats.
    fn format_capabilities(&self) -> FormatCap {
        FormatCap::any()
    }

    /// Whether the technology can serve the bridge in its current
    /// shape. Consulted during selection.
    fn compatible(&self, _bridge: &BridgeState) -> bool {
        true
    }

    /// Sets up technology-private bridge state.
    fn create(&self, _bridge: &mut BridgeState) -> Result<()> {
        Ok(())
    }

    /// Tears down technology-private bridge state.
    fn destroy(&self, _bridge: &mut BridgeState) {}

    /// The bridge is going live.
    fn start(&self, _bridge: &mut BridgeState) -> Result<()> {
        Ok(())
    }

    /// The bridge is being stopped or swapped away from.
    fn stop(&self, _bridge: &mut BridgeState) {}

    /// A (format-compatible) channel is joining.
    fn join(&self, _bridge: &mut BridgeState, _channel: &Arc<BridgeChannel>) -> Result<()> {
        Ok(())
    }

    /// A joined channel is leaving.
    fn leave(&self, _bridge: &mut BridgeState, _channel: &Arc<BridgeChannel>) {}

    /// A member has been suspended.
    fn suspend(&self, _bridge: &mut BridgeState, _channel: &Arc<BridgeChannel>) {}

    /// A suspended member has resumed.
    fn unsuspend(&self, _bridge: &mut BridgeState, _channel: &Arc<BridgeChannel>) {}

    /// A technology-specific call identifier for the bridged path,
    /// surfaced to members as `BRIDGEPVTCALLID`.
    fn pvt_id(&self, _bridge: &BridgeState) -> Option<String> {
        None
    }

    /// A member wrote a frame into the bridge. The technology decides
    /// distribution (it may consume, forward, or mix).
    fn write(
        &self,
        bridge: &mut BridgeState,
        channel: &Arc<BridgeChannel>,
        frame: crate::frame::Frame,
    );
}

impl std::fmt::Debug for dyn Technology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Technology({}, caps: {:?}, pref: {})",
            self.name(),
            self.capabilities(),
            self.preference()
        )
    }
}

struct TechEntry {
    tech: Arc<dyn Technology>,
    suspended: bool,
}

/// The ordered set of registered technologies.
///
/// Readers (selection) take the read side; (un)register and
/// (un)suspend take the write side.
#[derive(Default)]
pub struct TechRegistry {
    entries: RwLock<Vec<TechEntry>>,
}

impl TechRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a technology. Names must be unique.
    pub fn register(&self, tech: Arc<dyn Technology>) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.tech.name() == tech.name()) {
            return Err(Error::InvalidArgument);
        }

        debug!("Registered bridge technology {}.", tech.name());
        entries.push(TechEntry {
            tech,
            suspended: false,
        });
        Ok(())
    }

    /// Unregisters a technology by name.
    pub fn unregister(&self, name: &str) -> Result<()> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.tech.name() != name);
        if entries.len() == before {
            return Err(Error::InvalidArgument);
        }

        debug!("Unregistered bridge technology {}.", name);
        Ok(())
    }

    /// Excludes a technology from future selection.
    pub fn suspend(&self, name: &str) {
        self.set_suspended(name, true);
    }

    /// Restores a suspended technology to selection.
    pub fn unsuspend(&self, name: &str) {
        self.set_suspended(name, false);
    }

    fn set_suspended(&self, name: &str, suspended: bool) {
        let mut entries = self.entries.write();
        match entries.iter_mut().find(|e| e.tech.name() == name) {
            Some(entry) => entry.suspended = suspended,
            None => warn!("No bridge technology named {} to (un)suspend.", name),
        }
    }

    /// Picks the best live technology intersecting the capability
    /// mask, optionally validating against the bridge's shape.
    ///
    /// Highest preference wins; registration order breaks ties.
    pub(crate) fn best(
        &self,
        capabilities: Capabilities,
        bridge: Option<&BridgeState>,
    ) -> Option<Arc<dyn Technology>> {
        let entries = self.entries.read();
        let mut best: Option<&Arc<dyn Technology>> = None;

        for entry in entries.iter() {
            if entry.suspended {
                continue;
            }
            if (entry.tech.capabilities() & capabilities).is_empty() {
                continue;
            }
            if let Some(state) = bridge {
                if !entry.tech.compatible(state) {
                    continue;
                }
            }
            match best {
                Some(b) if entry.tech.preference() <= b.preference() => {}
                _ => best = Some(&entry.tech),
            }
        }

        best.cloned()
    }
}

/// Renegotiates a channel's formats to fit a technology.
///
/// If either direction cannot be satisfied the channel is not usable
/// under this technology and the join must fail.
pub(crate) fn make_compatible(
    tech: &Arc<dyn Technology>,
    channel: &Arc<BridgeChannel>,
) -> Result<()> {
    let caps = tech.format_capabilities();
    if caps.is_any() {
        return Ok(());
    }

    let endpoint = channel.endpoint();

    let read = endpoint.read_format();
    if !caps.contains(&read) {
        let target = caps.first().ok_or(Error::Incompatible)?;
        endpoint
            .set_read_format(target)
            .map_err(|_| Error::Incompatible)?;
    }

    let write = endpoint.write_format();
    if !caps.contains(&write) {
        let target = caps.first().ok_or(Error::Incompatible)?;
        endpoint
            .set_write_format(target)
            .map_err(|_| Error::Incompatible)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fake {
        name: &'static str,
        caps: Capabilities,
        pref: u32,
    }

    impl Technology for Fake {
        fn name(&self) -> &'static str {
            self.name
        }

        fn capabilities(&self) -> Capabilities {
            self.caps
        }

        fn preference(&self) -> u32 {
            self.pref
        }

        fn write(
            &self,
            _bridge: &mut BridgeState,
            _channel: &Arc<BridgeChannel>,
            _frame: crate::frame::Frame,
        ) {
        }
    }

    fn reg() -> TechRegistry {
        let reg = TechRegistry::new();
        reg.register(Arc::new(Fake {
            name: "simple",
            caps: Capabilities::ONE_TO_ONE,
            pref: 50,
        }))
        .unwrap();
        reg.register(Arc::new(Fake {
            name: "softmix",
            caps: Capabilities::ONE_TO_ONE | Capabilities::MULTIMIX,
            pref: 10,
        }))
        .unwrap();
        reg.register(Arc::new(Fake {
            name: "hold",
            caps: Capabilities::HOLDING,
            pref: 50,
        }))
        .unwrap();
        reg
    }

    #[test]
    fn highest_preference_wins() {
        let reg = reg();
        let tech = reg.best(Capabilities::ONE_TO_ONE, None).unwrap();
        assert_eq!(tech.name(), "simple");
    }

    #[test]
    fn falls_through_to_lower_preference() {
        let reg = reg();
        let tech = reg.best(Capabilities::MULTIMIX, None).unwrap();
        assert_eq!(tech.name(), "softmix");
    }

    #[test]
    fn suspension_excludes() {
        let reg = reg();
        reg.suspend("simple");
        let tech = reg.best(Capabilities::ONE_TO_ONE, None).unwrap();
        assert_eq!(tech.name(), "softmix");

        reg.unsuspend("simple");
        let tech = reg.best(Capabilities::ONE_TO_ONE, None).unwrap();
        assert_eq!(tech.name(), "simple");
    }

    #[test]
    fn no_intersection_is_unavailable() {
        let reg = reg();
        assert!(reg.best(Capabilities::EARLY, None).is_none());
    }

    #[test]
    fn duplicate_names_rejected() {
        let reg = reg();
        let dup = reg.register(Arc::new(Fake {
            name: "simple",
            caps: Capabilities::NATIVE,
            pref: 1,
        }));
        assert_eq!(dup.unwrap_err(), Error::InvalidArgument);
    }
}
