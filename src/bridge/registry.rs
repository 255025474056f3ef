//! The core registry: live bridges, technologies, and the shared
//! manager thread that services deferred bridge work.

use super::{actions, Bridge, BridgeBuilder};
use crate::{
    config::{Config, ParkingLotConfig},
    dialplan::Dialplan,
    endpoint::{Endpoint, UnrealChannelFactory},
    error::{Error, ParkResult, Result},
    events::{Bus, BusEvent},
    park::ParkingLot,
    tech::{TechRegistry, Technology},
};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

enum ManagerMsg {
    Service(Arc<Bridge>),
    Stop,
}

/// The bridging core: one per process in ordinary deployments.
///
/// Owns the bridge registry, the technology registry, the observer
/// bus, and the manager thread. Everything a bridge needs back from
/// the process level hangs off an `Arc<Core>`.
pub struct Core {
    bridges: DashMap<Uuid, Arc<Bridge>>,
    techs: TechRegistry,
    bus: Bus,
    dialplan: RwLock<Option<Arc<dyn Dialplan>>>,
    unreal_factory: RwLock<Option<Arc<dyn UnrealChannelFactory>>>,
    config: RwLock<Config>,
    lots: DashMap<String, Arc<ParkingLot>>,
    manager_tx: flume::Sender<ManagerMsg>,
    manager_thread: Mutex<Option<JoinHandle<()>>>,
    optimization_ids: AtomicU64,
}

impl Core {
    /// Creates a core with default configuration.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::from_config(Config::default())
    }

    /// Creates a core with the given configuration.
    #[must_use]
    pub fn from_config(config: Config) -> Arc<Self> {
        let (manager_tx, manager_rx) = flume::unbounded();

        let handle = std::thread::Builder::new()
            .name("bridge-manager".into())
            .spawn(move || manager_runner(manager_rx))
            .expect("Failed to spawn the bridge manager thread.");

        info!("Bridging core online.");

        Arc::new(Self {
            bridges: DashMap::new(),
            techs: TechRegistry::new(),
            bus: Bus::new(),
            dialplan: RwLock::new(None),
            unreal_factory: RwLock::new(None),
            config: RwLock::new(config),
            lots: DashMap::new(),
            manager_tx,
            manager_thread: Mutex::new(Some(handle)),
            optimization_ids: AtomicU64::new(1),
        })
    }

    /// Stops the manager thread after its queue drains and dissolves
    /// every remaining bridge.
    pub fn shutdown(&self) {
        // Dissolution unregisters, so never dissolve mid-iteration.
        let live: Vec<Arc<Bridge>> = self.bridges.iter().map(|b| b.clone()).collect();
        for bridge in live {
            bridge.dissolve(super::Cause::NormalClearing);
        }
        self.bridges.clear();
        self.lots.clear();

        let _ = self.manager_tx.send(ManagerMsg::Stop);
        if let Some(handle) = self.manager_thread.lock().take() {
            if handle.join().is_err() {
                warn!("Bridge manager thread panicked during shutdown.");
            }
        }
        info!("Bridging core offline.");
    }

    // -- construction ----------------------------------------------

    /// Starts building a bridge registered with this core.
    #[must_use]
    pub fn builder(self: &Arc<Self>) -> BridgeBuilder {
        BridgeBuilder::new(self.clone())
    }

    // -- configuration ---------------------------------------------

    /// A snapshot of the current configuration.
    #[must_use]
    pub fn config(&self) -> Config {
        self.config.read().clone()
    }

    /// Replaces the configuration.
    pub fn set_config(&self, config: Config) {
        *self.config.write() = config;
    }

    // -- technologies ----------------------------------------------

    /// The technology registry.
    pub fn techs(&self) -> &TechRegistry {
        &self.techs
    }

    /// Registers a mixing technology.
    pub fn register_technology(&self, tech: Arc<dyn Technology>) -> Result<()> {
        self.techs.register(tech)
    }

    /// Unregisters a mixing technology by name.
    pub fn unregister_technology(&self, name: &str) -> Result<()> {
        self.techs.unregister(name)
    }

    /// Excludes a technology from future selection.
    pub fn suspend_technology(&self, name: &str) {
        self.techs.suspend(name);
    }

    /// Restores a suspended technology to selection.
    pub fn unsuspend_technology(&self, name: &str) {
        self.techs.unsuspend(name);
    }

    // -- dialplan --------------------------------------------------

    /// Installs the dialplan used by transfer primitives.
    pub fn set_dialplan(&self, dialplan: Arc<dyn Dialplan>) {
        *self.dialplan.write() = Some(dialplan);
    }

    /// The installed dialplan, if any.
    #[must_use]
    pub fn dialplan(&self) -> Option<Arc<dyn Dialplan>> {
        self.dialplan.read().clone()
    }

    /// Runs a dialplan application on an endpoint.
    pub fn run_app(&self, endpoint: &Arc<dyn Endpoint>, app: &str, args: &str) -> Result<()> {
        match self.dialplan() {
            Some(dialplan) => dialplan.run_app(endpoint, app, args),
            None => Err(Error::InvalidArgument),
        }
    }

    /// Installs the factory used to tunnel multi-party transfers.
    pub fn set_unreal_factory(&self, factory: Arc<dyn UnrealChannelFactory>) {
        *self.unreal_factory.write() = Some(factory);
    }

    /// The installed unreal-channel factory, if any.
    #[must_use]
    pub fn unreal_factory(&self) -> Option<Arc<dyn UnrealChannelFactory>> {
        self.unreal_factory.read().clone()
    }

    // -- observer bus ----------------------------------------------

    /// Attaches an observer to the event bus.
    pub fn subscribe(&self) -> flume::Receiver<BusEvent> {
        self.bus.subscribe()
    }

    pub(crate) fn publish(&self, event: BusEvent) {
        self.bus.publish(event);
    }

    // -- bridge registry -------------------------------------------

    /// Looks up a live bridge by identifier.
    #[must_use]
    pub fn get_bridge(&self, uuid: Uuid) -> Option<Arc<Bridge>> {
        self.bridges.get(&uuid).map(|b| b.clone())
    }

    /// Every live bridge.
    #[must_use]
    pub fn bridges(&self) -> Vec<Arc<Bridge>> {
        self.bridges.iter().map(|b| b.clone()).collect()
    }

    pub(crate) fn register_bridge(&self, bridge: Arc<Bridge>) {
        self.bridges.insert(bridge.uuid(), bridge);
    }

    pub(crate) fn unregister_bridge(&self, uuid: Uuid) {
        if self.bridges.remove(&uuid).is_some() {
            debug!("Bridge {} unregistered.", uuid);
        }
    }

    // -- parking ---------------------------------------------------

    /// Creates and registers a parking lot.
    pub fn create_parking_lot(
        self: &Arc<Self>,
        config: ParkingLotConfig,
    ) -> ParkResult<Arc<ParkingLot>> {
        let lot = ParkingLot::create(self, config)?;
        self.lots.insert(lot.name().to_string(), lot.clone());
        Ok(lot)
    }

    /// Looks up a parking lot by name.
    #[must_use]
    pub fn parking_lot(&self, name: &str) -> Option<Arc<ParkingLot>> {
        self.lots.get(name).map(|l| l.clone())
    }

    /// Removes a parking lot from the registry.
    pub fn remove_parking_lot(&self, name: &str) {
        self.lots.remove(name);
    }

    /// Finds the lot whose parking extension matches `exten`.
    #[must_use]
    pub fn lot_for_exten(&self, exten: &str) -> Option<Arc<ParkingLot>> {
        self.lots
            .iter()
            .find(|l| l.config().parkext == exten)
            .map(|l| l.clone())
    }

    // -- manager ---------------------------------------------------

    pub(crate) fn request_service(&self, bridge: Arc<Bridge>) {
        if self.manager_tx.send(ManagerMsg::Service(bridge)).is_err() {
            warn!("Bridge manager is gone; servicing deferred work inline.");
        }
    }

    pub(crate) fn next_optimization_id(&self) -> u64 {
        self.optimization_ids.fetch_add(1, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("bridges", &self.bridges.len())
            .field("lots", &self.lots.len())
            .finish()
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        let _ = self.manager_tx.send(ManagerMsg::Stop);
    }
}

/// The shared manager thread: drains bridge action queues on request
/// and exits once told to stop with nothing left queued.
#[instrument(skip(rx))]
fn manager_runner(rx: flume::Receiver<ManagerMsg>) {
    loop {
        match rx.recv() {
            Ok(ManagerMsg::Service(bridge)) => actions::service_bridge(&bridge),
            Ok(ManagerMsg::Stop) | Err(_) => break,
        }
    }

    // Anything that raced the stop still gets serviced.
    for msg in rx.try_iter() {
        if let ManagerMsg::Service(bridge) = msg {
            actions::service_bridge(&bridge);
        }
    }

    debug!("Bridge manager thread exited.");
}
