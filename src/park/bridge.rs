//! The parking bridge personality: a holding bridge that assigns
//! spaces on push and resolves parked users on pull.

use super::{
    user::{ParkResolution, ParkedUser},
    ParkRequest,
    ParkingLot,
    PARK_REQUEST_KEY,
};
use crate::{
    bridge::{channel::BridgeChannel, Bridge, BridgeKind, BridgeState},
    dialplan::AfterGoto,
    error::{Error, Result},
    events::ParkedCallKind,
    features::{HookRemove, IntervalAction},
    frame::ChannelAction,
};
use once_cell::sync::OnceCell;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

pub(crate) struct ParkingBridgeKind {
    lot: OnceCell<Weak<ParkingLot>>,
}

impl ParkingBridgeKind {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            lot: OnceCell::new(),
        })
    }

    pub(crate) fn bind(&self, lot: &Arc<ParkingLot>) {
        let _ = self.lot.set(Arc::downgrade(lot));
    }

    fn lot(&self) -> Option<Arc<ParkingLot>> {
        self.lot.get().and_then(Weak::upgrade)
    }
}

impl BridgeKind for ParkingBridgeKind {
    fn kind(&self) -> &'static str {
        "parking"
    }

    fn push(
        &self,
        _bridge: &Arc<Bridge>,
        _state: &mut BridgeState,
        channel: &Arc<BridgeChannel>,
        _swap: Option<&Arc<BridgeChannel>>,
    ) -> Result<()> {
        let lot = self.lot().ok_or(Error::Offline)?;
        let endpoint = channel.endpoint();

        let request = endpoint
            .datastore_take(PARK_REQUEST_KEY)
            .and_then(|b| b.downcast::<ParkRequest>().ok());
        let request = match request {
            Some(r) => *r,
            None => {
                warn!(
                    "Channel {} arrived at lot {} with no parking request.",
                    endpoint.name(),
                    lot.name()
                );
                lot.publish(ParkedCallKind::Failed, &endpoint.name(), None, None);
                return Err(Error::InvalidArgument);
            },
        };

        if !lot.enabled() {
            lot.publish(ParkedCallKind::Failed, &endpoint.name(), None, None);
            return Err(Error::Inhibited);
        }

        // Space preference: PARKINGEXTEN wins, then the request's.
        let preferred = endpoint
            .variable("PARKINGEXTEN")
            .and_then(|v| v.parse::<u32>().ok())
            .or(request.preferred_space);

        let mut swapped = false;
        if let Some(space) = preferred {
            if let Some(existing) = lot.user_at(space) {
                if existing.parkee().name() == endpoint.name() {
                    // Same channel re-parking its own space.
                    existing.resolve(ParkResolution::Forced);
                    lot.release(space);
                    swapped = true;
                }
            }
        }

        let space = match lot.allocate_space(preferred, request.randomize) {
            Ok(space) => space,
            Err(e) => {
                lot.publish(ParkedCallKind::Failed, &endpoint.name(), None, None);
                return Err(match e {
                    crate::error::ParkError::Bridge(inner) => inner,
                    _ => Error::InvalidArgument,
                });
            },
        };

        let config = lot.config();
        let time_limit = match request.time_limit {
            Some(limit) => limit.min(config.parking_time),
            None => config.parking_time,
        };
        let comeback = request.comeback_override.clone().unwrap_or_else(|| {
            if config.comeback_to_origin {
                "park-dial".to_string()
            } else {
                config.comeback_context.clone()
            }
        });

        let user = ParkedUser::new(
            endpoint.clone(),
            space,
            time_limit,
            comeback,
            request.parker_dial_string.clone(),
        );
        lot.register_user(user.clone());
        channel.set_bridge_pvt(Box::new(user.clone()));

        endpoint.set_variable("PARKING_SPACE", &space.to_string());
        endpoint.set_variable("PARKEDLOT", lot.name());
        endpoint.set_variable("PARKER", &request.parker_dial_string);

        let timer_user = user.clone();
        channel.features().interval_hook(
            time_limit,
            false,
            HookRemove::ON_PULL,
            Box::new(move |ch| {
                if timer_user.resolve(ParkResolution::Timeout) {
                    ch.kick(crate::bridge::Cause::NormalClearing);
                }
                IntervalAction::Remove
            }),
        );

        if !request.blind_transfer && !request.silence_announce {
            let _ = channel.queue_action(ChannelAction::PlayFile(format!("digits/{}", space)));
        }

        info!(
            "Parked {} at space {} in lot {} ({}s limit).",
            endpoint.name(),
            space,
            lot.name(),
            time_limit.as_secs()
        );
        let kind = if swapped {
            ParkedCallKind::Swap
        } else {
            ParkedCallKind::Parked
        };
        lot.publish(
            kind,
            &endpoint.name(),
            Some(&request.parker_dial_string),
            Some(space),
        );
        Ok(())
    }

    fn pull(
        &self,
        _bridge: &Arc<Bridge>,
        _state: &mut BridgeState,
        channel: &Arc<BridgeChannel>,
    ) {
        let lot = match self.lot() {
            Some(lot) => lot,
            None => return,
        };

        let user = channel
            .take_bridge_pvt()
            .and_then(|b| b.downcast::<Arc<ParkedUser>>().ok())
            .map(|b| *b);
        let user = match user {
            Some(user) => user,
            None => return,
        };

        user.resolve(ParkResolution::Abandoned);
        lot.release(user.space);

        let endpoint = channel.endpoint();
        let parker = Some(user.parker_dial_string.as_str());
        debug!(
            "Space {} in lot {} resolved {:?} after {}s.",
            user.space,
            lot.name(),
            user.resolution(),
            user.start.elapsed().as_secs()
        );

        match user.resolution() {
            ParkResolution::Abandoned => {
                lot.publish(ParkedCallKind::Giveup, &endpoint.name(), parker, Some(user.space));
                lot.publish(
                    ParkedCallKind::Unparked,
                    &endpoint.name(),
                    parker,
                    Some(user.space),
                );
            },
            ParkResolution::Timeout => {
                lot.publish(
                    ParkedCallKind::Timeout,
                    &endpoint.name(),
                    parker,
                    Some(user.space),
                );
                endpoint.set_after_goto(AfterGoto::new(
                    &user.comeback,
                    &user.parker_dial_string,
                    1,
                ));
            },
            ParkResolution::Answered => {
                lot.publish(
                    ParkedCallKind::Unparked,
                    &endpoint.name(),
                    parker,
                    Some(user.space),
                );
            },
            ParkResolution::Forced => {
                lot.publish(ParkedCallKind::Forced, &endpoint.name(), parker, Some(user.space));
            },
            ParkResolution::Unset => {},
        }
    }
}
