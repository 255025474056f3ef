//! The endpoint contract: what the core requires of a channel driver.
//!
//! Endpoints are externally managed media/signalling entities. The core
//! never opens or closes media streams itself; it reads frames from,
//! and writes frames to, objects implementing [`Endpoint`], and asks
//! them to adjust formats or continue in the dialplan.

use crate::{
    bridge::{channel::ChannelWaker, Cause},
    dialplan::{AfterCallback, AfterGoto},
    error::Result,
    features::FeatureSet,
    frame::{Control, Frame},
};
use std::{any::Any, fmt, sync::Arc};
use uuid::Uuid;

/// A media format identifier.
///
/// Cheap to clone and compare; the core treats formats as opaque names
/// and only ever asks "is this format in that set?".
#[derive(Clone, Eq, Hash, PartialEq)]
pub struct Format(Arc<str>);

impl Format {
    /// Creates a format from its canonical name.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    /// The format's canonical name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Format({})", self.0)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Format {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// An ordered set of formats, most preferred first.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FormatCap(Vec<Format>);

impl FormatCap {
    /// Creates a capability set from an ordered list.
    #[must_use]
    pub fn new(formats: Vec<Format>) -> Self {
        Self(formats)
    }

    /// An empty set, meaning "anything goes".
    #[must_use]
    pub fn any() -> Self {
        Self(Vec::new())
    }

    /// Whether the set constrains nothing.
    #[must_use]
    pub fn is_any(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the given format is acceptable.
    #[must_use]
    pub fn contains(&self, fmt: &Format) -> bool {
        self.is_any() || self.0.contains(fmt)
    }

    /// The most preferred format, if the set is constrained.
    #[must_use]
    pub fn first(&self) -> Option<&Format> {
        self.0.first()
    }
}

impl<const N: usize> From<[&str; N]> for FormatCap {
    fn from(names: [&str; N]) -> Self {
        Self(names.iter().map(|n| Format::new(n)).collect())
    }
}

/// Reasons an after-bridge continuation may be discarded unrun.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum AfterBridgeReason {
    /// The channel is being destroyed.
    Destroy,
    /// The channel was masqueraded away.
    Masquerade,
    /// The channel was departed from the bridge by its imparter.
    Depart,
    /// A newer continuation replaced this one.
    Removed,
    /// The channel never made it into the bridge.
    ImpartFailed,
}

/// The contract between the core and a channel driver.
///
/// Most methods have workable defaults so simple drivers implement
/// only the media surface. Implementations must be internally
/// synchronised: the owner thread and external operators call
/// concurrently.
pub trait Endpoint: Send + Sync {
    /// The channel's display name, e.g. `SIP/alice-00000001`.
    fn name(&self) -> String;

    /// A stable unique identifier for the channel.
    fn uniqueid(&self) -> String {
        self.name()
    }

    // -- media -----------------------------------------------------

    /// Whether a frame is waiting to be read.
    fn frames_ready(&self) -> bool;

    /// Reads one frame. `None` means the endpoint has hung up.
    ///
    /// Only called after [`frames_ready`] reported `true` or the
    /// attached waker fired.
    ///
    /// [`frames_ready`]: Endpoint::frames_ready
    fn read(&self) -> Option<Frame>;

    /// Reads one frame with audio suppressed (mute).
    fn read_noaudio(&self) -> Option<Frame> {
        match self.read() {
            Some(Frame::Voice(_)) => Some(Frame::Null),
            other => other,
        }
    }

    /// Writes a frame toward the far end.
    fn write(&self, frame: Frame) -> Result<()>;

    /// Sends a control indication toward the far end.
    fn indicate(&self, control: Control);

    /// Injects a frame into the endpoint's own read stream.
    fn queue_frame(&self, frame: Frame);

    /// Registers a waker poked whenever a frame becomes readable.
    fn attach_waker(&self, waker: ChannelWaker);

    /// Drops the registered waker.
    fn detach_waker(&self);

    // -- formats ---------------------------------------------------

    /// The current read (from the wire) format.
    fn read_format(&self) -> Format;

    /// The current write (to the wire) format.
    fn write_format(&self) -> Format;

    /// The formats the endpoint can carry natively.
    fn native_formats(&self) -> FormatCap;

    /// Renegotiates the read format.
    fn set_read_format(&self, fmt: &Format) -> Result<()>;

    /// Renegotiates the write format.
    fn set_write_format(&self, fmt: &Format) -> Result<()>;

    // -- state queries ---------------------------------------------

    /// Whether the channel has hung up.
    fn is_hungup(&self) -> bool;

    /// The cause recorded at hangup.
    fn hangup_cause(&self) -> Cause {
        Cause::NormalClearing
    }

    /// Whether the channel is a dead husk awaiting destruction.
    fn is_zombie(&self) -> bool {
        false
    }

    /// Whether the channel is an outgoing (dialled) leg.
    fn is_outgoing(&self) -> bool {
        false
    }

    /// Adjusts the outgoing-leg marker.
    fn set_outgoing(&self, _outgoing: bool) {}

    /// Whether the driver is emulating DTMF in software.
    fn emulate_dtmf(&self) -> bool {
        false
    }

    /// Whether an unbridge (format change, etc.) has been requested.
    fn unbridge_pending(&self) -> bool {
        false
    }

    /// Acknowledges a pending unbridge request.
    fn clear_unbridge(&self) {}

    /// Whether the far end currently has us on hold.
    fn on_hold(&self) -> bool {
        false
    }

    /// Whether a dual-redirect is mid-flight on this channel.
    fn dual_redirect_wait(&self) -> bool {
        false
    }

    /// The bridge this endpoint currently belongs to, if any.
    fn bridge_id(&self) -> Option<Uuid>;

    /// Records or clears bridge membership.
    fn set_bridge_id(&self, id: Option<Uuid>);

    // -- variables and datastores ----------------------------------

    /// Reads a channel variable.
    fn variable(&self, key: &str) -> Option<String>;

    /// Writes a channel variable. An empty value clears it.
    fn set_variable(&self, key: &str, value: &str);

    /// Attaches an opaque payload under a key, replacing any previous.
    fn datastore_set(&self, key: &str, value: Box<dyn Any + Send>);

    /// Detaches and returns the payload under a key.
    fn datastore_take(&self, key: &str) -> Option<Box<dyn Any + Send>>;

    // -- signalling conveniences -----------------------------------

    /// Answers the channel.
    fn answer(&self) -> Result<()> {
        Ok(())
    }

    /// Starts ringback toward the channel.
    fn ring(&self) {}

    /// Streams a digit string to the far end.
    fn dtmf_stream(&self, digits: &str);

    /// Plays a file to the far end, blocking until done.
    fn stream_and_wait(&self, file: &str) -> Result<()>;

    /// Starts music-on-hold.
    fn moh_start(&self, _class: Option<&str>) {}

    /// Stops music-on-hold.
    fn moh_stop(&self) {}

    // -- dialplan --------------------------------------------------

    /// Detaches the channel to a dialplan location.
    fn async_goto(&self, context: &str, exten: &str, priority: u32) -> Result<()>;

    /// Records a dialplan location to continue at after bridging.
    fn set_after_goto(&self, dest: AfterGoto);

    /// Consumes the recorded after-bridge location.
    fn take_after_goto(&self) -> Option<AfterGoto>;

    /// Records a callback to run after bridging, discarding any
    /// previous one with [`AfterBridgeReason::Removed`].
    fn set_after_callback(&self, cb: AfterCallback);

    /// Consumes the recorded after-bridge callback.
    fn take_after_callback(&self) -> Option<AfterCallback>;

    // -- unreal channel support ------------------------------------

    /// The other half of an unreal (back-to-back) channel pair.
    fn unreal_peer(&self) -> Option<Arc<dyn Endpoint>> {
        None
    }

    /// An optimization run involving this channel has begun.
    fn optimization_started(&self, _id: u64, _peer: Option<&Arc<dyn Endpoint>>) {}

    /// The optimization run has completed.
    fn optimization_finished(&self, _id: u64) {}

    /// Frames buffered on the read side, gating optimization.
    fn queued_read_frames(&self) -> usize {
        usize::from(self.frames_ready())
    }

    /// Whether an audiohook/monitor/framehook is attached.
    fn has_audiohooks(&self) -> bool {
        false
    }

    // -- features --------------------------------------------------

    /// Features the driver wants merged into the channel's set when
    /// it joins a bridge.
    fn features(&self) -> Option<FeatureSet> {
        None
    }
}

impl fmt::Debug for dyn Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint({})", self.name())
    }
}

/// Creates unreal (back-to-back) channel pairs on demand.
///
/// Multi-party transfers tunnel a whole bridge through one such pair:
/// one half joins the bridge, the other continues in the dialplan.
pub trait UnrealChannelFactory: Send + Sync {
    /// Creates a wired-together pair of endpoints.
    ///
    /// The first half is the one to impart into a bridge; each half
    /// must report the other via [`Endpoint::unreal_peer`].
    fn create(&self, name_hint: &str) -> Result<(Arc<dyn Endpoint>, Arc<dyn Endpoint>)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconstrained_caps_accept_anything() {
        let caps = FormatCap::any();
        assert!(caps.is_any());
        assert!(caps.contains(&Format::new("ulaw")));
        assert!(caps.first().is_none());
    }

    #[test]
    fn constrained_caps_prefer_their_first_entry() {
        let caps = FormatCap::from(["g722", "ulaw"]);
        assert!(caps.contains(&Format::new("ulaw")));
        assert!(!caps.contains(&Format::new("opus")));
        assert_eq!(caps.first(), Some(&Format::new("g722")));
    }

    #[test]
    fn formats_compare_by_name() {
        assert_eq!(Format::new("ulaw"), Format::from("ulaw"));
        assert_ne!(Format::new("ulaw"), Format::new("alaw"));
        assert_eq!(Format::new("ulaw").to_string(), "ulaw");
    }
}
