//! Constants affecting bridge behaviour and API handling.

use std::time::Duration;

/// Default interdigit timeout applied while a DTMF feature sequence is
/// being collected.
pub const DEFAULT_FEATURE_DIGIT_TIMEOUT: Duration = Duration::from_millis(3_000);

/// Hard ceiling on the time a producer will block waiting for a
/// synchronous action frame to be serviced.
///
/// If the consuming channel dies without dispatching the frame, this
/// timeout unblocks the producer.
pub const SYNC_ACTION_TIMEOUT: Duration = Duration::from_secs(600);

/// Longest DTMF feature code which may be registered, including every
/// collected digit.
pub const MAX_DTMF_CODE_LEN: usize = 11;

/// Maximum number of peer names written into the `BRIDGEPEER` channel
/// variable of a multi-party bridge.
pub const MAX_BRIDGEPEER_CHANS: usize = 10;

/// Sleep applied when the write queue holds only deferred action frames
/// mid-DTMF-collection, to avoid spinning on the alert.
pub const DEFERRAL_PAUSE: Duration = Duration::from_micros(1);

/// Default softmix mixing interval.
pub const DEFAULT_MIXING_INTERVAL_MS: u32 = 20;

/// Default softmix internal sample rate. Zero lets the technology follow
/// the members' native rates.
pub const DEFAULT_SAMPLE_RATE: u32 = 0;

/// Default time a parked call may wait before timing out.
pub const DEFAULT_PARKING_TIME: Duration = Duration::from_secs(45);

/// Default time allotted to a timed-out parkee's comeback dial attempt.
pub const DEFAULT_COMEBACK_DIAL_TIME: Duration = Duration::from_secs(30);

/// Poll gap while waiting for a concurrent dual-redirect to settle
/// during channel departure.
pub(crate) const DUAL_REDIRECT_POLL: Duration = Duration::from_millis(10);
