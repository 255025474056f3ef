//! Bridge, channel, and parking error handling.

use std::{error::Error as StdError, fmt};

/// Errors returned by bridge and channel operations.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// A required parameter was missing or out of range.
    ///
    /// The operation returns without mutating any state.
    InvalidArgument,
    /// The target channel was not found in the expected bridge.
    NotInBridge,
    /// The target channel was not in the `Wait` state, or another
    /// participant was in the wrong state for the operation.
    WrongState,
    /// The bridge has been dissolved; no new channel may enter.
    Dissolved,
    /// The bridge is under a merge/swap/masquerade inhibitor.
    Inhibited,
    /// No registered technology satisfies the requested capabilities.
    TechnologyUnavailable,
    /// The channel's formats cannot be satisfied by the selected
    /// technology and could not be renegotiated.
    Incompatible,
    /// A synchronous action frame was abandoned before being serviced.
    SyncTimeout,
    /// A transfer could not be completed.
    TransferFailed,
    /// The owning core has already been shut down.
    Offline,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bridge operation failed: ")?;
        match self {
            Error::InvalidArgument => write!(f, "invalid argument."),
            Error::NotInBridge => write!(f, "channel is not in the expected bridge."),
            Error::WrongState => write!(f, "participant was in the wrong state."),
            Error::Dissolved => write!(f, "bridge has been dissolved."),
            Error::Inhibited => write!(f, "bridge is inhibited against this operation."),
            Error::TechnologyUnavailable => write!(f, "no usable mixing technology."),
            Error::Incompatible => write!(f, "could not negotiate a compatible format."),
            Error::SyncTimeout => write!(f, "synchronous action was never serviced."),
            Error::TransferFailed => write!(f, "transfer could not be completed."),
            Error::Offline => write!(f, "core has been shut down."),
        }
    }
}

impl StdError for Error {}

/// Convenience type for bridge operation error handling.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the parking subsystem.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParkError {
    /// The parkee carried no parking request payload.
    NoRequest,
    /// Every space in the lot's range is occupied.
    LotFull,
    /// The requested space is outside the lot's range or occupied.
    SpaceUnavailable,
    /// The named space holds no parked call.
    NotParked,
    /// No lot matches the requested name or extension.
    UnknownLot,
    /// The lot has been disabled.
    LotDisabled,
    /// An underlying bridge operation failed.
    Bridge(Error),
}

impl fmt::Display for ParkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Parking failed: ")?;
        match self {
            ParkError::NoRequest => write!(f, "no parking request on the parkee."),
            ParkError::LotFull => write!(f, "parking lot is full."),
            ParkError::SpaceUnavailable => write!(f, "requested space is unavailable."),
            ParkError::NotParked => write!(f, "no call parked at that space."),
            ParkError::UnknownLot => write!(f, "no such parking lot."),
            ParkError::LotDisabled => write!(f, "parking lot is disabled."),
            ParkError::Bridge(e) => write!(f, "bridge failure: {}", e),
        }
    }
}

impl StdError for ParkError {}

impl From<Error> for ParkError {
    fn from(e: Error) -> Self {
        ParkError::Bridge(e)
    }
}

/// Convenience type for parking error handling.
pub type ParkResult<T> = std::result::Result<T, ParkError>;
