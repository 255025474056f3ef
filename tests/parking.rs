//! Parking lot scenarios: blind-transfer parking, timeouts, direct
//! parks, and retrieval.

mod common;

use common::{drain_events, wait_until};
use std::{sync::Arc, time::Duration};
use switchboard::{
    events::ParkedCallKind,
    features::FeatureSet,
    ops::{self, transfer, ImpartMode},
    park::ParkRequest,
    test_utils::{test_core, MockEndpoint, TestDialplan},
    BusEvent,
    Capabilities,
    Cause,
    Endpoint,
    ParkingLotConfig,
};

fn park_events(events: &[BusEvent]) -> Vec<ParkedCallKind> {
    events
        .iter()
        .filter_map(|e| match e {
            BusEvent::Park(p) => Some(p.kind),
            _ => None,
        })
        .collect()
}

#[test]
fn blind_transfer_park_times_out_into_comeback() {
    let core = test_core();
    let events = core.subscribe();

    let dialplan = TestDialplan::new();
    dialplan.add_exten("default", "700", "Park");
    core.set_dialplan(dialplan);

    let lot = core
        .create_parking_lot(
            ParkingLotConfig::new("default_lot", 701, 720)
                .parkext("700")
                .parking_time(Duration::from_millis(150)),
        )
        .expect("lot builds");

    let bridge = core
        .builder()
        .capabilities(Capabilities::ONE_TO_ONE | Capabilities::MULTIMIX)
        .name("to-park")
        .build()
        .expect("bridge builds");
    let alice = MockEndpoint::new("SIP/alice-1");
    let carol = MockEndpoint::new("SIP/carol-1");
    ops::impart(&bridge, alice.clone(), FeatureSet::new(), ImpartMode::Independent)
        .expect("impart");
    ops::impart(&bridge, carol.clone(), FeatureSet::new(), ImpartMode::Independent)
        .expect("impart");
    assert!(wait_until(|| bridge.lock().num_channels() == 2));

    let transferer: Arc<dyn Endpoint> = alice.clone();
    transfer::blind(&core, &bridge, &transferer, "default", "700").expect("park transfer");

    // Carol gets the first space, with her parker recorded.
    assert!(wait_until(|| lot.occupied_spaces() == vec![701]));
    assert_eq!(carol.variable("PARKING_SPACE").as_deref(), Some("701"));
    assert_eq!(carol.variable("PARKER").as_deref(), Some("SIP/alice"));
    assert!(wait_until(|| alice.bridge_id().is_none()));

    // Blind-transfer parks never announce the space to the parkee.
    assert!(carol.played().is_empty());

    // Nobody retrieves: the timer fires, the space frees, and Carol
    // continues at the comeback destination.
    assert!(wait_until(|| lot.occupied_spaces().is_empty()));
    assert!(wait_until(|| carol.bridge_id().is_none()));
    assert!(wait_until(|| {
        carol
            .gotos()
            .contains(&("park-dial".to_string(), "SIP/alice".to_string(), 1))
    }));

    let kinds = park_events(&drain_events(&events));
    assert!(kinds.contains(&ParkedCallKind::Parked));
    assert!(kinds.contains(&ParkedCallKind::Timeout));

    core.shutdown();
}

#[test]
fn direct_park_announces_and_retrieval_frees_the_space() {
    let core = test_core();
    let events = core.subscribe();

    let lot = core
        .create_parking_lot(
            ParkingLotConfig::new("east", 701, 705)
                .parking_time(Duration::from_secs(30))
                .courtesy_tone("beep"),
        )
        .expect("lot builds");
    let spaces_before: Vec<u32> = lot.occupied_spaces();

    let parker = MockEndpoint::new("SIP/parker-1");
    let parkee = MockEndpoint::new("SIP/parked-1");
    let parker_dyn: Arc<dyn Endpoint> = parker;

    lot.park_endpoint(parkee.clone(), ParkRequest::new(&parker_dyn))
        .expect("parks");
    assert!(wait_until(|| lot.occupied_spaces() == vec![701]));

    // Ordinary parks hear their space number.
    assert!(wait_until(|| {
        parkee.played().contains(&"digits/701".to_string())
    }));

    let rescuer = MockEndpoint::new("SIP/rescuer-1");
    let reunion = lot
        .retrieve(701, rescuer.clone())
        .expect("retrieves");

    assert!(wait_until(|| reunion.lock().num_channels() == 2));
    assert!(wait_until(|| lot.occupied_spaces() == spaces_before));
    assert!(wait_until(|| rescuer.played().contains(&"beep".to_string())));

    let kinds = park_events(&drain_events(&events));
    assert!(kinds.contains(&ParkedCallKind::Parked));
    assert!(kinds.contains(&ParkedCallKind::Unparked));
    assert!(!kinds.contains(&ParkedCallKind::Timeout));

    reunion.dissolve(Cause::NormalClearing);
    core.shutdown();
}

#[test]
fn parkingexten_picks_the_space_and_full_lots_refuse() {
    let core = test_core();
    let events = core.subscribe();

    let lot = core
        .create_parking_lot(
            ParkingLotConfig::new("tiny", 701, 702).parking_time(Duration::from_secs(30)),
        )
        .expect("lot builds");

    let parker = MockEndpoint::new("SIP/parker-1");
    let parker_dyn: Arc<dyn Endpoint> = parker;

    let first = MockEndpoint::new("SIP/one-1");
    first.set_variable("PARKINGEXTEN", "702");
    lot.park_endpoint(first, ParkRequest::new(&parker_dyn))
        .expect("parks");
    assert!(wait_until(|| lot.occupied_spaces() == vec![702]));

    let second = MockEndpoint::new("SIP/two-1");
    lot.park_endpoint(second, ParkRequest::new(&parker_dyn))
        .expect("parks");
    assert!(wait_until(|| lot.occupied_spaces() == vec![701, 702]));

    // Full: the third never lands, and the failure is published.
    let third = MockEndpoint::new("SIP/three-1");
    lot.park_endpoint(third.clone(), ParkRequest::new(&parker_dyn))
        .expect("impart itself succeeds");
    assert!(wait_until(|| {
        park_events(&drain_events(&events)).contains(&ParkedCallKind::Failed)
    }));
    assert_eq!(lot.occupied_spaces(), vec![701, 702]);
    assert!(third.bridge_id().is_none());

    core.shutdown();
}

#[test]
fn abandoned_parkee_gives_up_its_space() {
    let core = test_core();
    let events = core.subscribe();

    let lot = core
        .create_parking_lot(
            ParkingLotConfig::new("west", 711, 715).parking_time(Duration::from_secs(30)),
        )
        .expect("lot builds");

    let parker = MockEndpoint::new("SIP/parker-1");
    let parker_dyn: Arc<dyn Endpoint> = parker;
    let parkee = MockEndpoint::new("SIP/bored-1");

    lot.park_endpoint(parkee.clone(), ParkRequest::new(&parker_dyn))
        .expect("parks");
    assert!(wait_until(|| lot.occupied_spaces() == vec![711]));

    parkee.hangup();

    assert!(wait_until(|| lot.occupied_spaces().is_empty()));
    assert!(wait_until(|| {
        park_events(&drain_events(&events)).contains(&ParkedCallKind::Giveup)
    }));

    core.shutdown();
}

#[test]
fn disabled_lots_refuse_arrivals() {
    let core = test_core();

    let lot = core
        .create_parking_lot(ParkingLotConfig::new("closed", 721, 725))
        .expect("lot builds");
    lot.disable();

    let parker = MockEndpoint::new("SIP/parker-1");
    let parker_dyn: Arc<dyn Endpoint> = parker;
    let parkee = MockEndpoint::new("SIP/keen-1");

    lot.park_endpoint(parkee.clone(), ParkRequest::new(&parker_dyn))
        .expect("impart itself succeeds");

    assert!(wait_until(|| parkee.bridge_id().is_none()));
    assert!(lot.occupied_spaces().is_empty());

    core.shutdown();
}
