use crate::constants::{
    DEFAULT_COMEBACK_DIAL_TIME,
    DEFAULT_FEATURE_DIGIT_TIMEOUT,
    DEFAULT_PARKING_TIME,
};
use std::time::Duration;

/// Configuration for the bridging core.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Config {
    /// How long a partially collected DTMF feature sequence waits for
    /// its next digit before being flushed.
    ///
    /// Defaults to 3 seconds.
    pub feature_digit_timeout: Duration,
    /// The dialplan application name recognised as the parking
    /// marker by blind transfers.
    ///
    /// Defaults to `Park`.
    pub park_app: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            feature_digit_timeout: DEFAULT_FEATURE_DIGIT_TIMEOUT,
            park_app: "Park".to_string(),
        }
    }
}

impl Config {
    /// Sets this `Config`'s DTMF interdigit timeout.
    #[must_use]
    pub fn feature_digit_timeout(mut self, feature_digit_timeout: Duration) -> Self {
        self.feature_digit_timeout = feature_digit_timeout;
        self
    }

    /// Sets this `Config`'s parking marker application.
    #[must_use]
    pub fn park_app(mut self, park_app: &str) -> Self {
        self.park_app = park_app.to_string();
        self
    }
}

/// Configuration for one parking lot.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ParkingLotConfig {
    /// Lot name, unique within the core.
    pub name: String,
    /// Extension that parks calls into this lot.
    pub parkext: String,
    /// Dialplan context holding the lot's spaces.
    pub context: String,
    /// First parking space number.
    pub parking_start: u32,
    /// Last parking space number, inclusive.
    pub parking_stop: u32,
    /// How long a parked call waits before timing out.
    pub parking_time: Duration,
    /// Tone played to a retrieved parkee's rescuer.
    pub courtesy_tone: Option<String>,
    /// Whether a timed-out parkee dials its parker back.
    pub comeback_to_origin: bool,
    /// Context entered when a timed-out parkee does not dial back.
    pub comeback_context: String,
    /// Time allotted to the comeback dial attempt.
    pub comeback_dial_time: Duration,
}

impl ParkingLotConfig {
    /// A lot with the given name, space range, and default timing.
    #[must_use]
    pub fn new(name: &str, parking_start: u32, parking_stop: u32) -> Self {
        Self {
            name: name.to_string(),
            parkext: "700".to_string(),
            context: "parkedcalls".to_string(),
            parking_start,
            parking_stop,
            parking_time: DEFAULT_PARKING_TIME,
            courtesy_tone: None,
            comeback_to_origin: true,
            comeback_context: "parkedcallstimeout".to_string(),
            comeback_dial_time: DEFAULT_COMEBACK_DIAL_TIME,
        }
    }

    /// Sets this lot's parking extension.
    #[must_use]
    pub fn parkext(mut self, parkext: &str) -> Self {
        self.parkext = parkext.to_string();
        self
    }

    /// Sets this lot's dialplan context.
    #[must_use]
    pub fn context(mut self, context: &str) -> Self {
        self.context = context.to_string();
        self
    }

    /// Sets this lot's parking timeout.
    #[must_use]
    pub fn parking_time(mut self, parking_time: Duration) -> Self {
        self.parking_time = parking_time;
        self
    }

    /// Sets the courtesy tone played on retrieval.
    #[must_use]
    pub fn courtesy_tone(mut self, courtesy_tone: &str) -> Self {
        self.courtesy_tone = Some(courtesy_tone.to_string());
        self
    }

    /// Sets whether timed-out parkees dial their parker back.
    #[must_use]
    pub fn comeback_to_origin(mut self, comeback_to_origin: bool) -> Self {
        self.comeback_to_origin = comeback_to_origin;
        self
    }

    /// Sets the context for non-origin comebacks.
    #[must_use]
    pub fn comeback_context(mut self, comeback_context: &str) -> Self {
        self.comeback_context = comeback_context.to_string();
        self
    }

    /// Sets the comeback dial window.
    #[must_use]
    pub fn comeback_dial_time(mut self, comeback_dial_time: Duration) -> Self {
        self.comeback_dial_time = comeback_dial_time;
        self
    }
}
