//! One parked call's bookkeeping.

use crate::endpoint::Endpoint;
use parking_lot::Mutex;
use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

/// How a parked call's stay ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParkResolution {
    /// Still parked.
    Unset,
    /// The parkee hung up before anyone came for it.
    Abandoned,
    /// The parkee was retrieved.
    Answered,
    /// The parkee waited out its timer.
    Timeout,
    /// The parkee was forcibly removed.
    Forced,
}

/// A call occupying a parking space.
///
/// The resolution is written at most once, under the user's lock;
/// the pull path reads whatever won.
pub struct ParkedUser {
    parkee: Arc<dyn Endpoint>,
    /// Assigned space number.
    pub space: u32,
    /// When the call was parked.
    pub start: Instant,
    /// Timer installed on the parkee.
    pub time_limit: Duration,
    /// Where a timed-out parkee goes.
    pub comeback: String,
    /// Dial string for calling the parker back.
    pub parker_dial_string: String,
    resolution: Mutex<ParkResolution>,
}

impl ParkedUser {
    pub(crate) fn new(
        parkee: Arc<dyn Endpoint>,
        space: u32,
        time_limit: Duration,
        comeback: String,
        parker_dial_string: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            parkee,
            space,
            start: Instant::now(),
            time_limit,
            comeback,
            parker_dial_string,
            resolution: Mutex::new(ParkResolution::Unset),
        })
    }

    /// The parked endpoint.
    #[must_use]
    pub fn parkee(&self) -> Arc<dyn Endpoint> {
        self.parkee.clone()
    }

    /// The recorded resolution.
    #[must_use]
    pub fn resolution(&self) -> ParkResolution {
        *self.resolution.lock()
    }

    /// Records the resolution, once.
    ///
    /// Returns `false` when another outcome already won; callers must
    /// stand down when they lose this race.
    pub fn resolve(&self, resolution: ParkResolution) -> bool {
        let mut current = self.resolution.lock();
        if *current != ParkResolution::Unset || resolution == ParkResolution::Unset {
            return false;
        }
        *current = resolution;
        true
    }
}

impl fmt::Debug for ParkedUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParkedUser")
            .field("parkee", &self.parkee.name())
            .field("space", &self.space)
            .field("resolution", &self.resolution())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockEndpoint;

    #[test]
    fn resolution_is_write_once() {
        let user = ParkedUser::new(
            MockEndpoint::new("SIP/parked"),
            701,
            Duration::from_secs(45),
            "default".into(),
            "SIP/parker".into(),
        );

        assert_eq!(user.resolution(), ParkResolution::Unset);
        assert!(user.resolve(ParkResolution::Timeout));
        assert!(!user.resolve(ParkResolution::Answered));
        assert_eq!(user.resolution(), ParkResolution::Timeout);
    }

    #[test]
    fn unset_is_not_a_valid_target() {
        let user = ParkedUser::new(
            MockEndpoint::new("SIP/parked"),
            702,
            Duration::from_secs(45),
            "default".into(),
            "SIP/parker".into(),
        );
        assert!(!user.resolve(ParkResolution::Unset));
        assert!(user.resolve(ParkResolution::Abandoned));
    }
}
