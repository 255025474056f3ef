//! Frames routed between endpoints, channels, and bridges.
//!
//! A [`Frame`] is the single currency of the core: media read from an
//! endpoint, control indications, and deferred work all travel through
//! the same per-channel write queues and technology `write` path.

use crate::endpoint::Endpoint;
use std::{fmt, sync::Arc};

/// Completion side of a synchronous action rendezvous.
///
/// Dropping the ticket without posting unblocks the producer with a
/// send failure, which it reports as a dispatch failure.
pub struct SyncTicket(pub(crate) flume::Sender<()>);

impl SyncTicket {
    /// Posts completion to the blocked producer.
    pub(crate) fn post(self) {
        let _ = self.0.send(());
    }
}

/// Opaque media payload attached to voice and video frames.
///
/// The core never inspects sample data; it forwards payloads to the
/// selected mixing technology untouched.
#[derive(Clone, Debug, Default)]
pub struct Media {
    /// Encoded payload bytes.
    pub data: Vec<u8>,
    /// Origin tag, used only for tracing.
    pub src: Option<String>,
    /// Stream index on the originating endpoint.
    pub stream: usize,
}

impl Media {
    /// Creates a payload around raw bytes on the default stream.
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            src: None,
            stream: 0,
        }
    }
}

/// Control indications carried in-band between endpoints.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Control {
    /// The far end has hung up.
    Hangup,
    /// Place the peer on hold, optionally naming a music class.
    Hold(Option<String>),
    /// Resume from hold.
    Unhold,
    /// Answer supervision.
    Answer,
    /// Updated connected-line information.
    ConnectedLine(Vec<u8>),
    /// Updated redirecting information.
    Redirecting(Vec<u8>),
    /// Request a full video frame.
    VideoUpdate,
    /// The media source has refreshed.
    SrcUpdate,
    /// The media source has been replaced.
    SrcChange,
    /// A driver-specific option change.
    Option {
        /// Driver option identifier.
        option: u32,
        /// Option payload.
        data: Vec<u8>,
    },
    /// Instruct the channel driver to act on its read side.
    ReadAction(Vec<u8>),
    /// A masquerade completed somewhere beneath this channel.
    MasqueradeNotify,
}

/// Work dispatched on a bridge channel's owner thread.
///
/// Queued on the channel's own write queue, or "written into the
/// bridge" so the technology distributes it to the other members.
#[non_exhaustive]
pub enum ChannelAction {
    /// Send a digit string to the endpoint.
    DtmfStream(String),
    /// The mixing technology detected the start of speech.
    TalkingStart,
    /// The mixing technology detected the end of speech.
    TalkingStop,
    /// Play a file to the endpoint with media suspended.
    PlayFile(String),
    /// Run a dialplan application on the endpoint.
    RunApp {
        /// Application name.
        app: String,
        /// Application argument string.
        args: String,
    },
    /// Run some closure on the owner thread, with access to the
    /// channel object.
    Callback {
        /// The work to run.
        func: Box<dyn FnOnce(&Arc<crate::bridge::channel::BridgeChannel>) + Send>,
        /// Whether media should be suspended around the call.
        suspend_media: bool,
    },
    /// Move this channel into the named parking lot.
    Park {
        /// Target lot name.
        lot: String,
    },
    /// Continue at a dialplan location, leaving the bridge.
    BlindTransfer {
        /// Destination context.
        context: String,
        /// Destination extension.
        exten: String,
    },
    /// Complete an attended transfer, with this channel as one of the
    /// transferer's legs.
    AttendedTransfer {
        /// The transferer's other leg.
        other_leg: Arc<dyn Endpoint>,
    },
}

impl fmt::Debug for ChannelAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ChannelAction::*;
        write!(
            f,
            "ChannelAction::{}",
            match self {
                DtmfStream(d) => format!("DtmfStream({})", d),
                TalkingStart => "TalkingStart".to_string(),
                TalkingStop => "TalkingStop".to_string(),
                PlayFile(file) => format!("PlayFile({})", file),
                RunApp { app, .. } => format!("RunApp({})", app),
                Callback { .. } => "Callback([function])".to_string(),
                Park { lot } => format!("Park({})", lot),
                BlindTransfer { context, exten } =>
                    format!("BlindTransfer({}@{})", exten, context),
                AttendedTransfer { other_leg } =>
                    format!("AttendedTransfer({})", other_leg.name()),
            }
        )
    }
}

/// A deferred action whose producer blocks until the consumer has
/// serviced (or abandoned) the frame.
pub struct SyncAction {
    /// Process-wide identifier, used for tracing.
    pub(crate) id: u64,
    /// The work to perform.
    pub(crate) action: ChannelAction,
    /// Rendezvous posted once the action has been serviced.
    pub(crate) ticket: SyncTicket,
}

impl fmt::Debug for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SyncAction(id: {}, {:?})", self.id, self.action)
    }
}

/// The tagged union moved through write queues and technology writes.
#[derive(Debug)]
#[non_exhaustive]
pub enum Frame {
    /// Audio media.
    Voice(Media),
    /// Video media.
    Video(Media),
    /// A DTMF digit has started.
    DtmfBegin(char),
    /// A DTMF digit has ended.
    DtmfEnd(char),
    /// A control indication.
    Control(Control),
    /// Deferred work for the receiving channel's owner thread.
    Action(ChannelAction),
    /// Deferred work whose sender blocks until it is serviced.
    ActionSync(SyncAction),
    /// A wake-up. Accepted into queues and discarded at dispatch.
    Null,
}

impl Frame {
    /// Whether this frame survives enqueue onto a suspended channel.
    ///
    /// Media written to a suspended member is silently discarded;
    /// control indications and deferred work are delivered once the
    /// channel resumes.
    #[must_use]
    pub fn is_deferrable(&self) -> bool {
        matches!(
            self,
            Frame::Control(_) | Frame::Action(_) | Frame::ActionSync(_)
        )
    }

    /// Whether this frame is part of a DTMF digit exchange.
    #[must_use]
    pub fn is_dtmf(&self) -> bool {
        matches!(self, Frame::DtmfBegin(_) | Frame::DtmfEnd(_))
    }

    /// Whether this frame is a deferred-action variant, held back
    /// while a DTMF feature sequence is being collected.
    #[must_use]
    pub fn is_action(&self) -> bool {
        matches!(self, Frame::Action(_) | Frame::ActionSync(_))
    }

    /// Duplicates the frame for fan-out, where its contents allow.
    ///
    /// One-shot payloads (callbacks, synchronous actions) cannot be
    /// duplicated; fan-out delivers the original to one receiver and
    /// copies to the rest.
    #[must_use]
    pub fn try_clone(&self) -> Option<Frame> {
        Some(match self {
            Frame::Voice(m) => Frame::Voice(m.clone()),
            Frame::Video(m) => Frame::Video(m.clone()),
            Frame::DtmfBegin(d) => Frame::DtmfBegin(*d),
            Frame::DtmfEnd(d) => Frame::DtmfEnd(*d),
            Frame::Control(c) => Frame::Control(c.clone()),
            Frame::Null => Frame::Null,
            Frame::Action(a) => Frame::Action(a.try_clone()?),
            Frame::ActionSync(_) => return None,
        })
    }
}

impl ChannelAction {
    fn try_clone(&self) -> Option<ChannelAction> {
        use ChannelAction::*;
        Some(match self {
            DtmfStream(d) => DtmfStream(d.clone()),
            TalkingStart => TalkingStart,
            TalkingStop => TalkingStop,
            PlayFile(f) => PlayFile(f.clone()),
            RunApp { app, args } => RunApp {
                app: app.clone(),
                args: args.clone(),
            },
            Callback { .. } => return None,
            Park { lot } => Park { lot: lot.clone() },
            BlindTransfer { context, exten } => BlindTransfer {
                context: context.clone(),
                exten: exten.clone(),
            },
            AttendedTransfer { other_leg } => AttendedTransfer {
                other_leg: other_leg.clone(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deferrable_classes() {
        assert!(Frame::Control(Control::Unhold).is_deferrable());
        assert!(Frame::Action(ChannelAction::TalkingStart).is_deferrable());
        assert!(!Frame::Voice(Media::new(vec![0u8; 4])).is_deferrable());
        assert!(!Frame::Null.is_deferrable());
        assert!(!Frame::DtmfEnd('5').is_deferrable());
        assert!(Frame::DtmfEnd('5').is_dtmf());
    }

    #[test]
    fn action_classes_deferred_during_collection() {
        assert!(Frame::Action(ChannelAction::DtmfStream("12".into())).is_action());
        assert!(!Frame::Control(Control::Answer).is_action());
    }

    #[test]
    fn one_shot_payloads_refuse_duplication() {
        let media = Frame::Voice(Media::new(vec![1, 2, 3]));
        assert!(media.try_clone().is_some());

        let stream = Frame::Action(ChannelAction::DtmfStream("*1".into()));
        assert!(stream.try_clone().is_some());

        let callback = Frame::Action(ChannelAction::Callback {
            func: Box::new(|_| {}),
            suspend_media: false,
        });
        assert!(callback.try_clone().is_none());

        let (tx, _rx) = flume::bounded(1);
        let sync = Frame::ActionSync(SyncAction {
            id: 1,
            action: ChannelAction::TalkingStart,
            ticket: SyncTicket(tx),
        });
        assert!(sync.try_clone().is_none());
    }
}
