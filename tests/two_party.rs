//! Two-party call scenarios: basic bridging, DTMF features, and
//! blind transfer.

mod common;

use common::{drain_events, wait_until};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use switchboard::{
    events::TransferResult,
    features::{FeatureSet, HookAction, HookRemove},
    frame::{Control, Frame, Media},
    ops::{self, ImpartMode},
    test_utils::{test_core, MockEndpoint, TestDialplan},
    BridgeFlags,
    BusEvent,
    Capabilities,
    Cause,
    ChannelStatus,
    Endpoint,
};

#[test]
fn simple_two_party_call() {
    let core = test_core();
    let events = core.subscribe();

    let bridge = core
        .builder()
        .capabilities(Capabilities::NATIVE | Capabilities::ONE_TO_ONE | Capabilities::MULTIMIX)
        .flags(BridgeFlags::DISSOLVE_HANGUP)
        .name("simple-call")
        .build()
        .expect("bridge builds");

    let alice = MockEndpoint::new("SIP/alice-00000001");
    let carol = MockEndpoint::new("SIP/carol-00000001");

    ops::impart(&bridge, alice.clone(), FeatureSet::new(), ImpartMode::Independent)
        .expect("impart alice");
    let carol_member = ops::impart(
        &bridge,
        carol.clone(),
        FeatureSet::new(),
        ImpartMode::Independent,
    )
    .expect("impart carol");

    assert!(wait_until(|| bridge.lock().num_channels() == 2));

    // Native glue outranks the one-to-one mixer when formats line up.
    assert_eq!(bridge.lock().technology().name(), "native_bridge");

    assert!(wait_until(|| {
        alice.variable("BRIDGEPEER").as_deref() == Some("SIP/carol-00000001")
            && carol.variable("BRIDGEPEER").as_deref() == Some("SIP/alice-00000001")
    }));

    // Voice from Alice lands on Carol's wire.
    alice.push_frame(Frame::Voice(Media::new(vec![0x55; 160])));
    assert!(wait_until(|| {
        carol
            .take_written()
            .iter()
            .any(|f| matches!(f, Frame::Voice(_)))
    }));

    // Alice hangs up: the whole bridge dissolves and Carol is kicked
    // without hangup semantics.
    alice.hangup();
    assert!(wait_until(|| bridge.lock().dissolved()));
    assert!(wait_until(|| carol.bridge_id().is_none()));

    assert_eq!(carol_member.status(), ChannelStatus::EndNoDissolve);
    assert_eq!(carol_member.cause(), Cause::NormalClearing);
    assert_eq!(bridge.lock().cause(), Cause::NormalClearing);

    let seen = drain_events(&events);
    assert!(seen
        .iter()
        .any(|e| matches!(e, BusEvent::BridgeDissolved { .. })));

    core.shutdown();
}

#[test]
fn membership_counts_track_the_list() {
    let core = test_core();
    let bridge = core
        .builder()
        .capabilities(Capabilities::ONE_TO_ONE | Capabilities::MULTIMIX)
        .name("counts")
        .build()
        .expect("bridge builds");

    let a = MockEndpoint::new("SIP/a-1");
    let b = MockEndpoint::new("SIP/b-1");
    ops::impart(&bridge, a, FeatureSet::new(), ImpartMode::Independent).expect("impart");
    ops::impart(&bridge, b, FeatureSet::new(), ImpartMode::Independent).expect("impart");

    assert!(wait_until(|| {
        let state = bridge.lock();
        state.num_channels() == 2 && state.num_active() == 2 && state.num_lonely() == 0
    }));

    // Suspension leaves membership intact but drops the active count.
    let member = bridge.lock().channels()[0].clone();
    member.suspend();
    assert!(wait_until(|| {
        let state = bridge.lock();
        state.num_channels() == 2 && state.num_active() == 1
    }));

    member.unsuspend();
    assert!(wait_until(|| bridge.lock().num_active() == 2));

    bridge.dissolve(Cause::NormalClearing);
    core.shutdown();
}

#[test]
fn dtmf_hook_matches_and_dead_ends_stream() {
    let core = test_core();
    let bridge = core
        .builder()
        .capabilities(Capabilities::ONE_TO_ONE | Capabilities::MULTIMIX)
        .name("dtmf")
        .build()
        .expect("bridge builds");

    let alice = MockEndpoint::new("SIP/alice-1");
    let carol = MockEndpoint::new("SIP/carol-1");

    let fired = Arc::new(AtomicBool::new(false));
    let media_was_suspended = Arc::new(AtomicBool::new(false));
    let mut features = FeatureSet::new();
    {
        let fired = fired.clone();
        let media_was_suspended = media_was_suspended.clone();
        features.dtmf_hook(
            "*2",
            HookRemove::empty(),
            Box::new(move |ch| {
                fired.store(true, Ordering::SeqCst);
                media_was_suspended.store(ch.is_suspended(), Ordering::SeqCst);
                HookAction::Keep
            }),
        );
    }

    ops::impart(&bridge, alice.clone(), features, ImpartMode::Independent).expect("impart");
    ops::impart(&bridge, carol.clone(), FeatureSet::new(), ImpartMode::Independent)
        .expect("impart");
    assert!(wait_until(|| bridge.lock().num_channels() == 2));

    // "*1" is a dead end: with passthrough on, the buffered digits
    // stream to the peer rather than dispatching anything.
    alice.press_digits("*1");
    assert!(wait_until(|| carol.dtmf_streamed().contains(&"*1".to_string())));
    assert!(!fired.load(Ordering::SeqCst));

    // "*2" is an exact match: the hook runs with media suspended and
    // the peer never hears the digits.
    alice.press_digits("*2");
    assert!(wait_until(|| fired.load(Ordering::SeqCst)));
    assert!(media_was_suspended.load(Ordering::SeqCst));
    assert!(!carol.dtmf_streamed().contains(&"*2".to_string()));
    assert_eq!(carol.written_digits(), "");

    bridge.dissolve(Cause::NormalClearing);
    core.shutdown();
}

#[test]
fn blind_transfer_sends_peer_to_dialplan() {
    let core = test_core();
    let events = core.subscribe();

    let dialplan = TestDialplan::new();
    dialplan.add_exten("default", "100", "Dial");
    core.set_dialplan(dialplan);

    let bridge = core
        .builder()
        .capabilities(Capabilities::ONE_TO_ONE | Capabilities::MULTIMIX)
        .flags(BridgeFlags::DISSOLVE_EMPTY)
        .name("xfer")
        .build()
        .expect("bridge builds");

    let alice = MockEndpoint::new("SIP/alice-1");
    let carol = MockEndpoint::new("SIP/carol-1");
    let alice_member = ops::impart(
        &bridge,
        alice.clone(),
        FeatureSet::new(),
        ImpartMode::Independent,
    )
    .expect("impart");
    ops::impart(&bridge, carol.clone(), FeatureSet::new(), ImpartMode::Independent)
        .expect("impart");
    assert!(wait_until(|| bridge.lock().num_channels() == 2));

    let transferer: Arc<dyn Endpoint> = alice.clone();
    ops::transfer::blind(&core, &bridge, &transferer, "default", "100")
        .expect("blind transfer");

    // The transferer is kicked, not hung up.
    assert!(wait_until(|| alice_member.status() == ChannelStatus::EndNoDissolve));
    assert_eq!(alice_member.cause(), Cause::NormalClearing);

    // The transferee continues at the destination.
    assert!(wait_until(|| {
        carol.gotos() == vec![("default".to_string(), "100".to_string(), 1)]
    }));
    assert_eq!(
        carol.variable("BLINDTRANSFER").as_deref(),
        Some("SIP/alice-1")
    );

    assert!(wait_until(|| {
        drain_events(&events).iter().any(|e| {
            matches!(
                e,
                BusEvent::BlindTransfer {
                    result: TransferResult::Success,
                    ..
                }
            )
        })
    }));

    core.shutdown();
}

#[test]
fn blind_transfer_to_missing_exten_fails() {
    let core = test_core();
    let dialplan = TestDialplan::new();
    core.set_dialplan(dialplan);

    let bridge = core
        .builder()
        .capabilities(Capabilities::ONE_TO_ONE)
        .name("bad-xfer")
        .build()
        .expect("bridge builds");

    let alice = MockEndpoint::new("SIP/alice-1");
    let carol = MockEndpoint::new("SIP/carol-1");
    ops::impart(&bridge, alice.clone(), FeatureSet::new(), ImpartMode::Independent)
        .expect("impart");
    ops::impart(&bridge, carol, FeatureSet::new(), ImpartMode::Independent).expect("impart");
    assert!(wait_until(|| bridge.lock().num_channels() == 2));

    let transferer: Arc<dyn Endpoint> = alice;
    let err = ops::transfer::blind(&core, &bridge, &transferer, "default", "999");
    assert!(err.is_err());

    // Nobody moved.
    assert_eq!(bridge.lock().num_channels(), 2);

    bridge.dissolve(Cause::NormalClearing);
    core.shutdown();
}

#[test]
fn hold_state_is_released_on_departure() {
    let core = test_core();
    let bridge = core
        .builder()
        .capabilities(Capabilities::ONE_TO_ONE)
        .name("hold")
        .build()
        .expect("bridge builds");

    let alice = MockEndpoint::new("SIP/alice-1");
    let member = ops::impart(
        &bridge,
        alice.clone(),
        FeatureSet::new(),
        ImpartMode::Independent,
    )
    .expect("impart");
    assert!(wait_until(|| bridge.lock().num_channels() == 1));

    alice.set_on_hold(true);
    member.kick(Cause::NormalClearing);

    assert!(wait_until(|| {
        alice.indications().contains(&Control::Unhold)
    }));
    assert!(wait_until(|| alice.bridge_id().is_none()));

    bridge.dissolve(Cause::NormalClearing);
    core.shutdown();
}
