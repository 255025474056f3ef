#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
//! Switchboard is a conference-bridging core for telephony systems,
//! written in Rust. The library offers:
//!  * N-way bridges with dynamic membership, built from independent
//!  bidirectional endpoints, each serviced by its own owner thread.
//!  * Pluggable mixing technologies with hot-swap: a "smart" bridge
//!  reselects its backend as membership crosses two and three
//!  parties.
//!  * Feature hooks keyed by DTMF sequences (with interdigit
//!  timeout), timers, and lifecycle events.
//!  * Safe inter-bridge moves, merges, and swaps, from which blind
//!  and attended transfers and unreal-channel optimization are
//!  built.
//!  * A call-parking subsystem: holding bridges with numbered
//!  spaces, per-parkee timeouts, and comeback handling.
//!
//! The endpoint itself (media I/O, codecs, signalling) lives outside
//! this crate behind the [`Endpoint`] trait, as does the dialplan
//! behind [`Dialplan`].
//!
//! [`Endpoint`]: crate::endpoint::Endpoint
//! [`Dialplan`]: crate::dialplan::Dialplan

#![warn(clippy::pedantic, rust_2018_idioms)]
#![allow(
    // Allowed as they are too pedantic
    clippy::module_name_repetitions,
    clippy::wildcard_imports,
    clippy::too_many_lines,
    clippy::cast_lossless,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_possible_truncation,
    // TODO: would require significant rewriting of all existing docs
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
)]

pub mod bridge;
mod config;
pub mod constants;
pub mod dialplan;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod features;
pub mod frame;
pub mod heap;
pub mod ops;
pub mod park;
pub mod tech;
pub mod test_utils;

pub use crate::{
    bridge::{
        channel::{BridgeChannel, ChannelStatus, ChannelWaker},
        registry::Core,
        Bridge,
        BridgeFlags,
        BridgeKind,
        BridgeState,
        Cause,
    },
    config::{Config, ParkingLotConfig},
    endpoint::{Endpoint, Format, FormatCap},
    error::{Error, Result},
    events::BusEvent,
    features::FeatureSet,
    frame::Frame,
    tech::{Capabilities, Technology},
};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::Arc;

static GLOBAL: Lazy<Mutex<Option<Arc<Core>>>> = Lazy::new(|| Mutex::new(None));

/// Brings up the process-wide core.
///
/// Ordinary deployments run one [`Core`] for the whole process; this
/// installs it so free functions and drivers can find it. Embedders
/// wanting several isolated cores can skip this and pass their own
/// around.
pub fn init(config: Config) -> Result<Arc<Core>> {
    let mut global = GLOBAL.lock();
    if global.is_some() {
        return Err(Error::InvalidArgument);
    }

    let core = Core::from_config(config);
    *global = Some(core.clone());
    Ok(core)
}

/// The process-wide core, if [`init`] has run.
#[must_use]
pub fn core() -> Option<Arc<Core>> {
    GLOBAL.lock().clone()
}

/// Tears down the process-wide core: dissolves remaining bridges and
/// stops the manager thread.
pub fn shutdown() {
    if let Some(core) = GLOBAL.lock().take() {
        core.shutdown();
    }
}
