//! Scriptable endpoints, reference technologies, and fixtures for
//! driving the core without any real telephony stack.

use crate::{
    bridge::{channel::ChannelWaker, queue_everyone_else, BridgeState, Cause},
    dialplan::{AfterCallback, AfterGoto, Dialplan},
    endpoint::{Endpoint, Format, FormatCap, UnrealChannelFactory},
    error::{Error, Result},
    frame::{Control, Frame},
    tech::{Capabilities, Technology},
    Core,
};
use parking_lot::Mutex;
use std::{
    any::Any,
    collections::{HashMap, VecDeque},
    sync::{Arc, Weak},
};
use uuid::Uuid;

/// Registers the reference technologies on a fresh core.
#[must_use]
pub fn test_core() -> Arc<Core> {
    let core = Core::new();
    core.register_technology(Arc::new(NativeGlue))
        .expect("register native");
    core.register_technology(Arc::new(OneToOneMix))
        .expect("register simple");
    core.register_technology(Arc::new(MultiMix))
        .expect("register softmix");
    core.register_technology(Arc::new(HoldingMix))
        .expect("register holding");
    core
}

#[derive(Default)]
struct MockInner {
    read_queue: VecDeque<Frame>,
    written: Vec<Frame>,
    indicated: Vec<Control>,
    injected: Vec<Frame>,
    variables: HashMap<String, String>,
    datastores: HashMap<String, Box<dyn Any + Send>>,
    gotos: Vec<(String, String, u32)>,
    played: Vec<String>,
    dtmf_streamed: Vec<String>,
    waker: Option<ChannelWaker>,
    after_goto: Option<AfterGoto>,
    after_callback: Option<AfterCallback>,
    unreal_peer: Option<Weak<MockEndpoint>>,
    hungup: bool,
    on_hold: bool,
    zombie: bool,
    outgoing: bool,
    unbridge: bool,
    bridge_id: Option<Uuid>,
}

/// A scriptable endpoint: tests feed frames in and observe what the
/// core writes, indicates, and records on the way out.
pub struct MockEndpoint {
    name: String,
    read_format: Mutex<Format>,
    write_format: Mutex<Format>,
    native: Mutex<FormatCap>,
    inner: Mutex<MockInner>,
}

impl MockEndpoint {
    /// A mock speaking `ulaw` in both directions.
    #[must_use]
    pub fn new(name: &str) -> Arc<Self> {
        Self::with_formats(name, Format::new("ulaw"), FormatCap::from(["ulaw", "alaw"]))
    }

    /// A mock with explicit formats.
    #[must_use]
    pub fn with_formats(name: &str, format: Format, native: FormatCap) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            read_format: Mutex::new(format.clone()),
            write_format: Mutex::new(format),
            native: Mutex::new(native),
            inner: Mutex::new(MockInner::default()),
        })
    }

    /// A cross-wired unreal pair, `name;1` and `name;2`.
    #[must_use]
    pub fn unreal_pair(name: &str) -> (Arc<Self>, Arc<Self>) {
        let one = Self::new(&format!("{};1", name));
        let two = Self::new(&format!("{};2", name));
        one.inner.lock().unreal_peer = Some(Arc::downgrade(&two));
        two.inner.lock().unreal_peer = Some(Arc::downgrade(&one));
        (one, two)
    }

    fn wake(&self) {
        let waker = self.inner.lock().waker.clone();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Scripts a frame arriving from the wire.
    pub fn push_frame(&self, frame: Frame) {
        self.inner.lock().read_queue.push_back(frame);
        self.wake();
    }

    /// Scripts a sequence of DTMF digits arriving from the wire.
    pub fn press_digits(&self, digits: &str) {
        for d in digits.chars() {
            self.push_frame(Frame::DtmfBegin(d));
            self.push_frame(Frame::DtmfEnd(d));
        }
    }

    /// Scripts the far end hanging up.
    pub fn hangup(&self) {
        self.inner.lock().hungup = true;
        self.wake();
    }

    /// Scripts a hold state change.
    pub fn set_on_hold(&self, on_hold: bool) {
        self.inner.lock().on_hold = on_hold;
    }

    /// Scripts an unbridge (renegotiation) request.
    pub fn request_unbridge(&self) {
        self.inner.lock().unbridge = true;
        self.wake();
    }

    /// Drains everything written toward the wire so far.
    pub fn take_written(&self) -> Vec<Frame> {
        std::mem::take(&mut self.inner.lock().written)
    }

    /// DTMF digits written toward the wire so far, in order.
    #[must_use]
    pub fn written_digits(&self) -> String {
        self.inner
            .lock()
            .written
            .iter()
            .filter_map(|f| match f {
                Frame::DtmfEnd(d) => Some(*d),
                _ => None,
            })
            .collect()
    }

    /// Control indications sent so far.
    #[must_use]
    pub fn indications(&self) -> Vec<Control> {
        self.inner.lock().indicated.clone()
    }

    /// Recorded `async_goto` invocations.
    #[must_use]
    pub fn gotos(&self) -> Vec<(String, String, u32)> {
        self.inner.lock().gotos.clone()
    }

    /// Files played via `stream_and_wait`.
    #[must_use]
    pub fn played(&self) -> Vec<String> {
        self.inner.lock().played.clone()
    }

    /// Digit strings streamed via `dtmf_stream`.
    #[must_use]
    pub fn dtmf_streamed(&self) -> Vec<String> {
        self.inner.lock().dtmf_streamed.clone()
    }

    /// Drains frames the core injected via `queue_frame`.
    pub fn take_injected(&self) -> Vec<Frame> {
        std::mem::take(&mut self.inner.lock().injected)
    }

    /// Marks the endpoint as a dead husk; joins will be refused.
    pub fn make_zombie(&self) {
        self.inner.lock().zombie = true;
    }
}

impl Endpoint for MockEndpoint {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn frames_ready(&self) -> bool {
        let inner = self.inner.lock();
        !inner.read_queue.is_empty() || inner.hungup
    }

    fn read(&self) -> Option<Frame> {
        self.inner.lock().read_queue.pop_front()
    }

    fn write(&self, frame: Frame) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.hungup {
            return Err(Error::InvalidArgument);
        }
        inner.written.push(frame);
        Ok(())
    }

    fn indicate(&self, control: Control) {
        self.inner.lock().indicated.push(control);
    }

    fn queue_frame(&self, frame: Frame) {
        self.inner.lock().injected.push(frame);
        self.wake();
    }

    fn attach_waker(&self, waker: ChannelWaker) {
        self.inner.lock().waker = Some(waker);
    }

    fn detach_waker(&self) {
        self.inner.lock().waker = None;
    }

    fn read_format(&self) -> Format {
        self.read_format.lock().clone()
    }

    fn write_format(&self) -> Format {
        self.write_format.lock().clone()
    }

    fn native_formats(&self) -> FormatCap {
        self.native.lock().clone()
    }

    fn set_read_format(&self, fmt: &Format) -> Result<()> {
        *self.read_format.lock() = fmt.clone();
        Ok(())
    }

    fn set_write_format(&self, fmt: &Format) -> Result<()> {
        *self.write_format.lock() = fmt.clone();
        Ok(())
    }

    fn is_hungup(&self) -> bool {
        self.inner.lock().hungup
    }

    fn hangup_cause(&self) -> Cause {
        Cause::NormalClearing
    }

    fn is_zombie(&self) -> bool {
        self.inner.lock().zombie
    }

    fn is_outgoing(&self) -> bool {
        self.inner.lock().outgoing
    }

    fn set_outgoing(&self, outgoing: bool) {
        self.inner.lock().outgoing = outgoing;
    }

    fn unbridge_pending(&self) -> bool {
        self.inner.lock().unbridge
    }

    fn clear_unbridge(&self) {
        self.inner.lock().unbridge = false;
    }

    fn on_hold(&self) -> bool {
        self.inner.lock().on_hold
    }

    fn bridge_id(&self) -> Option<Uuid> {
        self.inner.lock().bridge_id
    }

    fn set_bridge_id(&self, id: Option<Uuid>) {
        self.inner.lock().bridge_id = id;
    }

    fn variable(&self, key: &str) -> Option<String> {
        self.inner.lock().variables.get(key).cloned()
    }

    fn set_variable(&self, key: &str, value: &str) {
        let mut inner = self.inner.lock();
        if value.is_empty() {
            inner.variables.remove(key);
        } else {
            inner.variables.insert(key.to_string(), value.to_string());
        }
    }

    fn datastore_set(&self, key: &str, value: Box<dyn Any + Send>) {
        self.inner.lock().datastores.insert(key.to_string(), value);
    }

    fn datastore_take(&self, key: &str) -> Option<Box<dyn Any + Send>> {
        self.inner.lock().datastores.remove(key)
    }

    fn dtmf_stream(&self, digits: &str) {
        self.inner.lock().dtmf_streamed.push(digits.to_string());
    }

    fn stream_and_wait(&self, file: &str) -> Result<()> {
        self.inner.lock().played.push(file.to_string());
        Ok(())
    }

    fn async_goto(&self, context: &str, exten: &str, priority: u32) -> Result<()> {
        self.inner
            .lock()
            .gotos
            .push((context.to_string(), exten.to_string(), priority));
        Ok(())
    }

    fn set_after_goto(&self, dest: AfterGoto) {
        self.inner.lock().after_goto = Some(dest);
    }

    fn take_after_goto(&self) -> Option<AfterGoto> {
        self.inner.lock().after_goto.take()
    }

    fn set_after_callback(&self, cb: AfterCallback) {
        self.inner.lock().after_callback = Some(cb);
    }

    fn take_after_callback(&self) -> Option<AfterCallback> {
        self.inner.lock().after_callback.take()
    }

    fn unreal_peer(&self) -> Option<Arc<dyn Endpoint>> {
        self.inner
            .lock()
            .unreal_peer
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|p| p as Arc<dyn Endpoint>)
    }
}

/// Creates cross-wired [`MockEndpoint`] pairs for tunnelled
/// transfers.
#[derive(Debug, Default)]
pub struct LoopbackFactory;

impl UnrealChannelFactory for LoopbackFactory {
    fn create(&self, name_hint: &str) -> Result<(Arc<dyn Endpoint>, Arc<dyn Endpoint>)> {
        let (one, two) = MockEndpoint::unreal_pair(&format!("Local/{}", name_hint));
        Ok((one, two))
    }
}

/// An in-memory dialplan for transfer tests.
#[derive(Default)]
pub struct TestDialplan {
    extens: Mutex<HashMap<(String, String), String>>,
    ran: Mutex<Vec<(String, String, String)>>,
}

impl TestDialplan {
    /// An empty dialplan.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Binds an application to `exten@context`.
    pub fn add_exten(&self, context: &str, exten: &str, app: &str) {
        self.extens
            .lock()
            .insert((context.to_string(), exten.to_string()), app.to_string());
    }

    /// Applications run via `run_app`, as (endpoint, app, args).
    #[must_use]
    pub fn ran(&self) -> Vec<(String, String, String)> {
        self.ran.lock().clone()
    }
}

impl Dialplan for TestDialplan {
    fn exten_exists(&self, context: &str, exten: &str) -> bool {
        self.extens
            .lock()
            .contains_key(&(context.to_string(), exten.to_string()))
    }

    fn exten_app(&self, context: &str, exten: &str) -> Option<String> {
        self.extens
            .lock()
            .get(&(context.to_string(), exten.to_string()))
            .cloned()
    }

    fn run_app(&self, endpoint: &Arc<dyn Endpoint>, app: &str, args: &str) -> Result<()> {
        self.ran
            .lock()
            .push((endpoint.name(), app.to_string(), args.to_string()));
        Ok(())
    }
}

// -- reference technologies ----------------------------------------

/// Pairwise relay: each member's media goes to the single peer.
pub struct OneToOneMix;

impl Technology for OneToOneMix {
    fn name(&self) -> &'static str {
        "simple_bridge"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::ONE_TO_ONE
    }

    fn preference(&self) -> u32 {
        50
    }

    fn compatible(&self, bridge: &BridgeState) -> bool {
        bridge.num_channels() <= 2
    }

    fn write(
        &self,
        bridge: &mut BridgeState,
        channel: &Arc<crate::BridgeChannel>,
        frame: Frame,
    ) {
        queue_everyone_else(bridge, channel, frame);
    }
}

/// Software mixing stand-in: relays to every other member.
pub struct MultiMix;

impl Technology for MultiMix {
    fn name(&self) -> &'static str {
        "softmix"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::MULTIMIX
    }

    fn preference(&self) -> u32 {
        10
    }

    fn write(
        &self,
        bridge: &mut BridgeState,
        channel: &Arc<crate::BridgeChannel>,
        frame: Frame,
    ) {
        queue_everyone_else(bridge, channel, frame);
    }
}

/// Direct channel-driver glue for matching two-party calls.
pub struct NativeGlue;

impl Technology for NativeGlue {
    fn name(&self) -> &'static str {
        "native_bridge"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::NATIVE
    }

    fn preference(&self) -> u32 {
        90
    }

    fn compatible(&self, bridge: &BridgeState) -> bool {
        if bridge.num_channels() > 2 {
            return false;
        }
        // Native glue requires identical wire formats end to end.
        let mut formats = bridge
            .channels()
            .iter()
            .map(|c| c.endpoint().read_format());
        match formats.next() {
            Some(first) => formats.all(|f| f == first),
            None => true,
        }
    }

    fn write(
        &self,
        bridge: &mut BridgeState,
        channel: &Arc<crate::BridgeChannel>,
        frame: Frame,
    ) {
        queue_everyone_else(bridge, channel, frame);
    }
}

/// Members wait alone; media from them is discarded.
pub struct HoldingMix;

impl Technology for HoldingMix {
    fn name(&self) -> &'static str {
        "holding_bridge"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::HOLDING
    }

    fn preference(&self) -> u32 {
        50
    }

    fn write(
        &self,
        _bridge: &mut BridgeState,
        _channel: &Arc<crate::BridgeChannel>,
        _frame: Frame,
    ) {
    }
}
