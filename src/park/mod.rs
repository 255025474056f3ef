//! Call parking: holding bridges with numbered spaces and timeouts.
//!
//! A [`ParkingLot`] owns one holding bridge with the parking
//! personality installed. Calls arrive by blind transfer to the
//! lot's extension, by a queued park action, or by direct impart;
//! each gets a space, a timeout hook, and (usually) an announcement.

mod bridge;
pub mod user;

pub use self::user::{ParkResolution, ParkedUser};

use self::bridge::ParkingBridgeKind;
use crate::{
    bridge::{
        channel::{BridgeChannel, ChannelStatus},
        registry::Core,
        Bridge,
        BridgeFlags,
        Cause,
    },
    config::ParkingLotConfig,
    endpoint::Endpoint,
    error::{ParkError, ParkResult},
    events::{BusEvent, ParkedCall, ParkedCallKind},
    features::FeatureSet,
    frame::ChannelAction,
    ops::{self, ImpartMode},
    tech::Capabilities,
};
use parking_lot::Mutex;
use rand::Rng;
use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Weak},
};
use tracing::{debug, info, warn};

/// Datastore key carrying a [`ParkRequest`] to the parking bridge.
pub const PARK_REQUEST_KEY: &str = "park-request";

/// Everything the parking bridge needs to know about an arrival.
///
/// Attached to the parkee's datastore before it reaches the holding
/// bridge; a channel arriving without one is refused.
#[derive(Clone, Debug)]
pub struct ParkRequest {
    /// Unique id of the channel that parked the call.
    pub parker_uuid: String,
    /// Dial string for calling the parker back.
    pub parker_dial_string: String,
    /// Overrides the lot's comeback destination.
    pub comeback_override: Option<String>,
    /// Requests a specific space.
    pub preferred_space: Option<u32>,
    /// Overrides the lot's parking time, downward only.
    pub time_limit: Option<std::time::Duration>,
    /// Suppresses the space announcement.
    pub silence_announce: bool,
    /// Picks the space at random.
    pub randomize: bool,
    /// The parker performed a blind transfer.
    pub blind_transfer: bool,
}

impl ParkRequest {
    /// A request recording only who parked the call.
    #[must_use]
    pub fn new(parker: &Arc<dyn Endpoint>) -> Self {
        Self {
            parker_uuid: parker.uniqueid(),
            parker_dial_string: strip_tech_suffix(&parker.name()),
            comeback_override: None,
            preferred_space: None,
            time_limit: None,
            silence_announce: false,
            randomize: false,
            blind_transfer: false,
        }
    }
}

/// Trims the allocation suffix from a channel name, leaving the
/// dialable device: `SIP/alice-00000001` becomes `SIP/alice`.
fn strip_tech_suffix(name: &str) -> String {
    match name.rsplit_once('-') {
        Some((device, _)) => device.to_string(),
        None => name.to_string(),
    }
}

struct LotInner {
    users: BTreeMap<u32, Arc<ParkedUser>>,
    next_space: u32,
    enabled: bool,
}

/// A named parking lot and its holding bridge.
pub struct ParkingLot {
    config: ParkingLotConfig,
    core: Weak<Core>,
    bridge: Arc<Bridge>,
    inner: Mutex<LotInner>,
}

impl ParkingLot {
    /// Builds the lot and its holding bridge.
    pub(crate) fn create(core: &Arc<Core>, config: ParkingLotConfig) -> ParkResult<Arc<Self>> {
        if config.parking_start > config.parking_stop {
            return Err(ParkError::SpaceUnavailable);
        }

        let kind = ParkingBridgeKind::new();
        let bridge = core
            .builder()
            .capabilities(Capabilities::HOLDING)
            .flags(
                BridgeFlags::MERGE_INHIBIT_TO
                    | BridgeFlags::MERGE_INHIBIT_FROM
                    | BridgeFlags::SWAP_INHIBIT_FROM,
            )
            .name(&format!("parking/{}", config.name))
            .creator("res_parking")
            .kind(kind.clone())
            .build()
            .map_err(ParkError::Bridge)?;

        let next_space = config.parking_start;
        let lot = Arc::new(Self {
            config,
            core: Arc::downgrade(core),
            bridge,
            inner: Mutex::new(LotInner {
                users: BTreeMap::new(),
                next_space,
                enabled: true,
            }),
        });
        kind.bind(&lot);

        info!(
            "Parking lot {} online, spaces {}..{}.",
            lot.config.name, lot.config.parking_start, lot.config.parking_stop
        );
        Ok(lot)
    }

    /// The lot's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The lot's configuration.
    #[must_use]
    pub fn config(&self) -> &ParkingLotConfig {
        &self.config
    }

    /// The lot's holding bridge.
    #[must_use]
    pub fn bridge(&self) -> Arc<Bridge> {
        self.bridge.clone()
    }

    /// Whether the lot accepts new calls.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    /// Stops accepting new calls.
    pub fn disable(&self) {
        self.inner.lock().enabled = false;
    }

    /// Resumes accepting new calls.
    pub fn enable(&self) {
        self.inner.lock().enabled = true;
    }

    /// The spaces currently in use, ascending.
    #[must_use]
    pub fn occupied_spaces(&self) -> Vec<u32> {
        self.inner.lock().users.keys().copied().collect()
    }

    /// The parked user at a space, if any.
    #[must_use]
    pub fn user_at(&self, space: u32) -> Option<Arc<ParkedUser>> {
        self.inner.lock().users.get(&space).cloned()
    }

    /// Chooses a free space.
    ///
    /// Preference order: the explicit `preferred` space, a random
    /// free space when `randomize`, else the rotating cursor scanning
    /// upward with wrap-around.
    pub(crate) fn allocate_space(
        &self,
        preferred: Option<u32>,
        randomize: bool,
    ) -> ParkResult<u32> {
        let mut inner = self.inner.lock();
        if !inner.enabled {
            return Err(ParkError::LotDisabled);
        }

        let start = self.config.parking_start;
        let stop = self.config.parking_stop;
        let span = stop - start + 1;

        if let Some(space) = preferred {
            if space < start || space > stop || inner.users.contains_key(&space) {
                return Err(ParkError::SpaceUnavailable);
            }
            return Ok(space);
        }

        let from = if randomize {
            start + rand::thread_rng().gen_range(0..span)
        } else {
            inner.next_space.max(start).min(stop)
        };

        for offset in 0..span {
            let space = start + ((from - start) + offset) % span;
            if !inner.users.contains_key(&space) {
                if !randomize {
                    inner.next_space = start + ((space - start) + 1) % span;
                }
                return Ok(space);
            }
        }

        Err(ParkError::LotFull)
    }

    pub(crate) fn register_user(&self, user: Arc<ParkedUser>) {
        self.inner.lock().users.insert(user.space, user);
    }

    /// Frees a space, returning whoever held it.
    pub(crate) fn release(&self, space: u32) -> Option<Arc<ParkedUser>> {
        self.inner.lock().users.remove(&space)
    }

    pub(crate) fn publish(
        &self,
        kind: ParkedCallKind,
        parkee: &str,
        parker: Option<&str>,
        space: Option<u32>,
    ) {
        if let Some(core) = self.core.upgrade() {
            core.publish(BusEvent::Park(ParkedCall {
                kind,
                lot: self.config.name.clone(),
                parkee: parkee.to_string(),
                parker: parker.map(str::to_string),
                space,
            }));
        }
    }

    /// Parks an endpoint that is not currently bridged, on a new
    /// owner thread.
    pub fn park_endpoint(
        self: &Arc<Self>,
        endpoint: Arc<dyn Endpoint>,
        request: ParkRequest,
    ) -> ParkResult<Arc<BridgeChannel>> {
        endpoint.datastore_set(PARK_REQUEST_KEY, Box::new(request));
        ops::impart(
            &self.bridge,
            endpoint,
            FeatureSet::new(),
            ImpartMode::Independent,
        )
        .map_err(ParkError::Bridge)
    }

    /// Parks a current bridge member: its own owner thread performs
    /// the move when it services the queued action.
    pub fn park_bridge_channel(
        self: &Arc<Self>,
        channel: &Arc<BridgeChannel>,
        request: ParkRequest,
    ) -> ParkResult<()> {
        channel
            .endpoint()
            .datastore_set(PARK_REQUEST_KEY, Box::new(request));
        channel
            .queue_action(ChannelAction::Park {
                lot: self.config.name.clone(),
            })
            .map_err(ParkError::Bridge)
    }

    /// Retrieves the call at `space`, bridging it with `retriever` in
    /// a fresh two-party bridge.
    pub fn retrieve(
        self: &Arc<Self>,
        space: u32,
        retriever: Arc<dyn Endpoint>,
    ) -> ParkResult<Arc<Bridge>> {
        let user = self.user_at(space).ok_or(ParkError::NotParked)?;
        if !user.resolve(ParkResolution::Answered) {
            // Timed out or abandoned first.
            return Err(ParkError::NotParked);
        }

        let core = self.core.upgrade().ok_or(ParkError::Bridge(
            crate::error::Error::Offline,
        ))?;
        let retrieval = core
            .builder()
            .capabilities(
                Capabilities::NATIVE | Capabilities::ONE_TO_ONE | Capabilities::MULTIMIX,
            )
            .flags(BridgeFlags::DISSOLVE_HANGUP | BridgeFlags::DISSOLVE_EMPTY)
            .name(&format!("unpark/{}", space))
            .creator("res_parking")
            .build()
            .map_err(ParkError::Bridge)?;

        ops::motion::move_channel(
            &retrieval,
            &self.bridge,
            &user.parkee(),
            None,
            true,
        )
        .map_err(ParkError::Bridge)?;

        let rescuer = ops::impart(
            &retrieval,
            retriever,
            FeatureSet::new(),
            ImpartMode::Independent,
        )
        .map_err(ParkError::Bridge)?;

        if let Some(tone) = self.config.courtesy_tone.clone() {
            let _ = rescuer.queue_action(ChannelAction::PlayFile(tone));
        }

        info!("Space {} in lot {} retrieved.", space, self.config.name);
        Ok(retrieval)
    }
}

impl fmt::Debug for ParkingLot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ParkingLot")
            .field("name", &self.config.name)
            .field("occupied", &inner.users.len())
            .field("enabled", &inner.enabled)
            .finish()
    }
}

/// Services a queued park action on the parkee's own thread.
pub(crate) fn park_from_action(channel: &Arc<BridgeChannel>, lot_name: &str) -> ParkResult<()> {
    let core = channel.core().map_err(ParkError::Bridge)?;
    let lot = core.parking_lot(lot_name).ok_or(ParkError::UnknownLot)?;

    let src = channel.bridge();
    if Arc::ptr_eq(&src, &lot.bridge) {
        return Ok(());
    }

    debug!(
        "Channel {} moving itself into lot {}.",
        channel.endpoint().name(),
        lot_name
    );
    ops::motion::move_channel(&lot.bridge, &src, &channel.endpoint(), None, true)
        .map_err(ParkError::Bridge)
}

/// Diverts a blind transfer into the parking path.
///
/// A two-party bridge parks the transferer's peer alone; a larger
/// bridge is tunnelled through an unreal pair so the remaining
/// parties keep talking while the tunnel waits in the lot.
pub(crate) fn blind_transfer_park(
    core: &Arc<Core>,
    bridge: &Arc<Bridge>,
    transferer: &Arc<dyn Endpoint>,
    exten: &str,
) -> ParkResult<()> {
    let lot = core.lot_for_exten(exten).ok_or(ParkError::UnknownLot)?;
    if !lot.enabled() {
        return Err(ParkError::LotDisabled);
    }

    let mut request = ParkRequest::new(transferer);
    request.blind_transfer = true;

    let parkee = {
        let state = bridge.lock();
        let member = state
            .member_of(transferer)
            .ok_or(ParkError::Bridge(crate::error::Error::NotInBridge))?;
        if member.status() != ChannelStatus::Wait {
            return Err(ParkError::Bridge(crate::error::Error::WrongState));
        }

        if state.num_channels() == 2 {
            state.peers_of(&member).into_iter().next()
        } else {
            None
        }
    };

    match parkee {
        Some(parkee) => {
            lot.park_bridge_channel(&parkee, request)?;
        },
        None => {
            let factory = core.unreal_factory().ok_or_else(|| {
                warn!(
                    "No unreal factory; cannot park multi-party bridge {}.",
                    bridge.uuid()
                );
                ParkError::Bridge(crate::error::Error::TransferFailed)
            })?;

            let (inside, outside) = factory
                .create(&format!("park/{}", lot.name()))
                .map_err(ParkError::Bridge)?;
            ops::impart(bridge, inside, FeatureSet::new(), ImpartMode::Independent)
                .map_err(ParkError::Bridge)?;
            lot.park_endpoint(outside, request)?;
        },
    }

    let state = bridge.lock();
    if let Some(member) = state.member_of(transferer) {
        member.leave_bridge(ChannelStatus::EndNoDissolve, Cause::NormalClearing);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_core;

    fn lot(start: u32, stop: u32) -> Arc<ParkingLot> {
        let core = test_core();
        core.create_parking_lot(ParkingLotConfig::new("test", start, stop))
            .expect("lot builds")
    }

    #[test]
    fn cursor_rotates_and_wraps() {
        let lot = lot(701, 703);

        assert_eq!(lot.allocate_space(None, false).unwrap(), 701);
        assert_eq!(lot.allocate_space(None, false).unwrap(), 702);
        assert_eq!(lot.allocate_space(None, false).unwrap(), 703);
        // Nothing registered, so the cursor wraps onto free spaces.
        assert_eq!(lot.allocate_space(None, false).unwrap(), 701);
    }

    #[test]
    fn occupied_spaces_are_skipped() {
        let lot = lot(701, 703);

        let user = ParkedUser::new(
            crate::test_utils::MockEndpoint::new("SIP/held-1"),
            702,
            std::time::Duration::from_secs(45),
            "default".into(),
            "SIP/parker".into(),
        );
        lot.register_user(user);

        assert_eq!(lot.allocate_space(None, false).unwrap(), 701);
        // The cursor sits on 702; allocation slides past it.
        assert_eq!(lot.allocate_space(None, false).unwrap(), 703);
    }

    #[test]
    fn preferred_space_is_honoured_or_refused() {
        let lot = lot(701, 705);

        assert_eq!(lot.allocate_space(Some(704), false).unwrap(), 704);
        assert_eq!(
            lot.allocate_space(Some(799), false),
            Err(ParkError::SpaceUnavailable)
        );

        let user = ParkedUser::new(
            crate::test_utils::MockEndpoint::new("SIP/held-1"),
            704,
            std::time::Duration::from_secs(45),
            "default".into(),
            "SIP/parker".into(),
        );
        lot.register_user(user);
        assert_eq!(
            lot.allocate_space(Some(704), false),
            Err(ParkError::SpaceUnavailable)
        );
    }

    #[test]
    fn random_allocation_stays_in_range() {
        let lot = lot(701, 708);

        for _ in 0..32 {
            let space = lot.allocate_space(None, true).unwrap();
            assert!((701..=708).contains(&space));
        }
    }

    #[test]
    fn full_lot_reports_exhaustion() {
        let lot = lot(701, 702);
        for space in [701, 702] {
            let user = ParkedUser::new(
                crate::test_utils::MockEndpoint::new("SIP/held-1"),
                space,
                std::time::Duration::from_secs(45),
                "default".into(),
                "SIP/parker".into(),
            );
            lot.register_user(user);
        }

        assert_eq!(lot.allocate_space(None, false), Err(ParkError::LotFull));

        lot.release(701);
        assert_eq!(lot.allocate_space(None, false).unwrap(), 701);
    }

    #[test]
    fn disabled_lot_refuses_allocation() {
        let lot = lot(701, 705);
        lot.disable();
        assert_eq!(
            lot.allocate_space(None, false),
            Err(ParkError::LotDisabled)
        );
        lot.enable();
        assert!(lot.allocate_space(None, false).is_ok());
    }

    #[test]
    fn dial_strings_lose_their_allocation_suffix() {
        assert_eq!(strip_tech_suffix("SIP/alice-00000001"), "SIP/alice");
        assert_eq!(strip_tech_suffix("Local/200@default-0001;2"), "Local/200@default");
        assert_eq!(strip_tech_suffix("console"), "console");
    }
}
