//! Smart-bridge behaviour: technology reselection as membership
//! crosses two and three parties, and format renegotiation.

mod common;

use common::wait_until;
use std::sync::Arc;
use switchboard::{
    endpoint::FormatCap,
    features::FeatureSet,
    ops::{self, ImpartMode},
    test_utils::{test_core, MockEndpoint},
    BridgeState,
    Capabilities,
    Cause,
    Endpoint,
    Format,
    Frame,
    Technology,
};

#[test]
fn smart_bridge_upgrades_and_downgrades() {
    let core = test_core();
    let bridge = core
        .builder()
        .capabilities(Capabilities::ONE_TO_ONE | Capabilities::MULTIMIX)
        .flags(switchboard::BridgeFlags::SMART)
        .name("smart")
        .build()
        .expect("bridge builds");

    let alice = MockEndpoint::new("SIP/alice-1");
    let carol = MockEndpoint::new("SIP/carol-1");
    let dave = MockEndpoint::new("SIP/dave-1");

    ops::impart(&bridge, alice.clone(), FeatureSet::new(), ImpartMode::Independent)
        .expect("impart");
    ops::impart(&bridge, carol.clone(), FeatureSet::new(), ImpartMode::Independent)
        .expect("impart");
    assert!(wait_until(|| bridge.lock().num_channels() == 2));
    assert_eq!(bridge.lock().technology().name(), "simple_bridge");

    // A third member forces multimix.
    let dave_member = ops::impart(
        &bridge,
        dave.clone(),
        FeatureSet::new(),
        ImpartMode::Independent,
    )
    .expect("impart");
    assert!(wait_until(|| bridge.lock().num_channels() == 3));
    assert!(wait_until(|| bridge.lock().technology().name() == "softmix"));

    // Formats never changed underneath the members.
    assert_eq!(alice.read_format(), Format::new("ulaw"));
    assert_eq!(carol.read_format(), Format::new("ulaw"));

    // Media still flows after the swap, to both peers.
    alice.push_frame(Frame::Voice(switchboard::frame::Media::new(vec![1, 2, 3])));
    assert!(wait_until(|| {
        carol.take_written().iter().any(|f| matches!(f, Frame::Voice(_)))
    }));

    // Dropping back to two reselects the pairwise technology.
    dave_member.kick(Cause::NormalClearing);
    assert!(wait_until(|| bridge.lock().num_channels() == 2));
    assert!(wait_until(|| {
        bridge.lock().technology().name() == "simple_bridge"
    }));

    bridge.dissolve(Cause::NormalClearing);
    core.shutdown();
}

/// A mixer that only speaks g722, to force renegotiation.
struct NarrowMix;

impl Technology for NarrowMix {
    fn name(&self) -> &'static str {
        "narrow"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::ONE_TO_ONE | Capabilities::MULTIMIX
    }

    fn preference(&self) -> u32 {
        200
    }

    fn format_capabilities(&self) -> FormatCap {
        FormatCap::from(["g722"])
    }

    fn write(
        &self,
        bridge: &mut BridgeState,
        channel: &Arc<switchboard::BridgeChannel>,
        frame: Frame,
    ) {
        switchboard::bridge::queue_everyone_else(bridge, channel, frame);
    }
}

#[test]
fn joining_renegotiates_formats_and_leaves_restore_them() {
    let core = test_core();
    core.register_technology(Arc::new(NarrowMix))
        .expect("register narrow");

    let bridge = core
        .builder()
        .capabilities(Capabilities::ONE_TO_ONE)
        .name("narrow-call")
        .build()
        .expect("bridge builds");
    assert_eq!(bridge.lock().technology().name(), "narrow");

    let alice = MockEndpoint::new("SIP/alice-1");
    let member = ops::impart(
        &bridge,
        alice.clone(),
        FeatureSet::new(),
        ImpartMode::Independent,
    )
    .expect("impart");

    assert!(wait_until(|| alice.read_format() == Format::new("g722")));
    assert!(wait_until(|| alice.write_format() == Format::new("g722")));

    member.kick(Cause::NormalClearing);
    assert!(wait_until(|| alice.bridge_id().is_none()));
    assert_eq!(alice.read_format(), Format::new("ulaw"));
    assert_eq!(alice.write_format(), Format::new("ulaw"));

    bridge.dissolve(Cause::NormalClearing);
    core.shutdown();
}

#[test]
fn dissolved_bridges_refuse_new_members() {
    let core = test_core();
    let bridge = core
        .builder()
        .capabilities(Capabilities::ONE_TO_ONE)
        .name("gone")
        .build()
        .expect("bridge builds");

    bridge.dissolve(Cause::NormalClearing);

    let late = MockEndpoint::new("SIP/late-1");
    let member = ops::impart(&bridge, late.clone(), FeatureSet::new(), ImpartMode::Independent)
        .expect("impart spawns");

    // The owner thread's push must fail; the member never lands.
    assert!(wait_until(|| {
        member.status() != switchboard::ChannelStatus::Wait || late.bridge_id().is_none()
    }));
    assert_eq!(bridge.lock().num_channels(), 0);

    core.shutdown();
}

#[test]
fn interval_hooks_fire_on_cadence() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use switchboard::features::{HookRemove, IntervalAction};

    let core = test_core();
    let bridge = core
        .builder()
        .capabilities(Capabilities::ONE_TO_ONE)
        .name("ticker")
        .build()
        .expect("bridge builds");

    let alice = MockEndpoint::new("SIP/alice-1");
    let ticks = Arc::new(AtomicUsize::new(0));
    let mut features = FeatureSet::new();
    {
        let ticks = ticks.clone();
        features.interval_hook(
            Duration::from_millis(20),
            false,
            HookRemove::empty(),
            Box::new(move |_ch| {
                // Stop after three firings.
                if ticks.fetch_add(1, Ordering::SeqCst) + 1 >= 3 {
                    IntervalAction::Remove
                } else {
                    IntervalAction::Keep
                }
            }),
        );
    }

    ops::impart(&bridge, alice, features, ImpartMode::Independent).expect("impart");

    assert!(wait_until(|| ticks.load(Ordering::SeqCst) == 3));
    // Removed: it must not keep firing.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(ticks.load(Ordering::SeqCst), 3);

    bridge.dissolve(Cause::NormalClearing);
    core.shutdown();
}

#[test]
fn sync_actions_unblock_their_producer() {
    let core = test_core();
    let bridge = core
        .builder()
        .capabilities(Capabilities::ONE_TO_ONE)
        .name("sync")
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

    // The producer blocks until Alice's owner thread plays the file.
    switchboard::bridge::actions::queue_action_sync(
        &member,
        switchboard::frame::ChannelAction::PlayFile("beep".into()),
    )
    .expect("sync action serviced");
    assert_eq!(alice.played(), vec!["beep".to_string()]);

    // Against a departed channel the producer fails fast instead of
    // waiting out the ceiling.
    member.kick(Cause::NormalClearing);
    assert!(wait_until(|| alice.bridge_id().is_none()));
    let err = switchboard::bridge::actions::queue_action_sync(
        &member,
        switchboard::frame::ChannelAction::PlayFile("late".into()),
    );
    assert!(err.is_err());

    bridge.dissolve(Cause::NormalClearing);
    core.shutdown();
}
