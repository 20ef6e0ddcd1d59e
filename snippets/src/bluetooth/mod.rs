//! Classic Bluetooth adapter snippet

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::Unsupported;
use crate::context::ReceiverGuard;
use crate::event::Listener;
use crate::poll::{self, DISCOVERY_TIMEOUT, PAIRING_TIMEOUT, TOGGLE_TIMEOUT};
use crate::rpc::{to_value, unknown_method, RpcArgs, Snippet};
use crate::{Address, Bundle, Error, Result, SnippetContext};

pub mod gatt_client;
pub mod le_advertiser;
pub mod le_scanner;

pub const ACTION_FOUND: &str = "android.bluetooth.device.action.FOUND";
pub const ACTION_DISCOVERY_FINISHED: &str =
    "android.bluetooth.adapter.action.DISCOVERY_FINISHED";

/// Broadcast extras carried by [`ACTION_FOUND`]
pub const EXTRA_NAME: &str = "Name";
pub const EXTRA_ADDRESS: &str = "Address";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BondState {
    None,
    Bonding,
    Bonded,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanMode {
    None,
    Connectable,
    ConnectableDiscoverable,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BluetoothDevice {
    pub name: Option<String>,
    pub address: Address,
    pub bond_state: BondState,
}

impl BluetoothDevice {
    /// The extras of an [`ACTION_FOUND`] broadcast for this device
    pub fn to_found_extras(&self) -> Bundle {
        let mut extras = Bundle::new();
        extras.put(EXTRA_ADDRESS, self.address.to_string());
        if let Some(name) = &self.name {
            extras.put(EXTRA_NAME, name.as_str());
        }
        extras
    }

    fn from_found_extras(extras: &Bundle) -> Option<Self> {
        let address = extras.get_str(EXTRA_ADDRESS)?.parse().ok()?;
        Some(Self { name: extras.get_str(EXTRA_NAME).map(|s| s.to_string()),
                    address,
                    bond_state: BondState::None })
    }
}

/// Adapter methods that are hidden from the public platform SDK
pub trait BluetoothHiddenApi: Send + Sync {
    fn set_scan_mode(&self, mode: ScanMode, duration: Duration) -> Result<()>;
    fn remove_bond(&self, address: &Address) -> Result<()>;
}

impl BluetoothHiddenApi for Unsupported {
    fn set_scan_mode(&self, _mode: ScanMode, _duration: Duration) -> Result<()> {
        self.fail("BluetoothAdapter.setScanMode")
    }

    fn remove_bond(&self, _address: &Address) -> Result<()> {
        self.fail("BluetoothDevice.removeBond")
    }
}

/// The local Bluetooth adapter
///
/// Discovery results are delivered as [`ACTION_FOUND`] broadcasts followed by
/// one [`ACTION_DISCOVERY_FINISHED`].
pub trait BluetoothPlatform: Send + Sync {
    fn is_enabled(&self) -> bool;
    fn enable(&self) -> bool;
    fn disable(&self) -> bool;

    fn name(&self) -> String;
    fn set_name(&self, name: &str) -> bool;
    fn address(&self) -> Address;
    fn scan_mode(&self) -> ScanMode;

    fn start_discovery(&self) -> bool;
    fn cancel_discovery(&self) -> bool;
    fn is_discovering(&self) -> bool;

    fn bonded_devices(&self) -> Vec<BluetoothDevice>;
    fn bond_state(&self, address: &Address) -> BondState;
    fn create_bond(&self, address: &Address) -> bool;

    fn hidden(&self) -> Arc<dyn BluetoothHiddenApi>;
}

pub struct BluetoothAdapterSnippet {
    ctx: SnippetContext,
    platform: Arc<dyn BluetoothPlatform>,
    // Results of the most recent discovery; pairing only targets these
    discovered: Arc<DashMap<Address, BluetoothDevice>>,
}

impl BluetoothAdapterSnippet {
    pub fn new(ctx: &SnippetContext) -> Self {
        Self { ctx: ctx.clone(),
               platform: ctx.services().bluetooth.clone(),
               discovered: Arc::new(DashMap::new()) }
    }

    fn check_enabled(&self) -> Result<()> {
        if self.platform.is_enabled() {
            Ok(())
        } else {
            Err(Error::precondition("Bluetooth is not enabled"))
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.platform.is_enabled()
    }

    pub async fn enable(&self) -> Result<()> {
        if self.platform.is_enabled() {
            debug!("Bluetooth already enabled");
            return Ok(());
        }
        if !self.platform.enable() {
            return Err(Error::platform_refused("BluetoothAdapter.enable"));
        }
        let platform = self.platform.clone();
        poll::wait_for("Bluetooth to turn on", || Ok(platform.is_enabled()), TOGGLE_TIMEOUT).await?;
        info!("Bluetooth enabled");
        Ok(())
    }

    pub async fn disable(&self) -> Result<()> {
        if !self.platform.is_enabled() {
            debug!("Bluetooth already disabled");
            return Ok(());
        }
        if !self.platform.disable() {
            return Err(Error::platform_refused("BluetoothAdapter.disable"));
        }
        let platform = self.platform.clone();
        poll::wait_for("Bluetooth to turn off", || Ok(!platform.is_enabled()), TOGGLE_TIMEOUT)
            .await?;
        info!("Bluetooth disabled");
        Ok(())
    }

    pub fn adapter_name(&self) -> String {
        self.platform.name()
    }

    pub fn set_name(&self, name: &str) -> Result<()> {
        self.check_enabled()?;
        if !self.platform.set_name(name) {
            return Err(Error::platform_refused("BluetoothAdapter.setName"));
        }
        Ok(())
    }

    pub fn address(&self) -> Address {
        self.platform.address()
    }

    pub fn become_discoverable(&self, duration: Duration) -> Result<()> {
        self.check_enabled()?;
        self.platform.hidden().set_scan_mode(ScanMode::ConnectableDiscoverable, duration)
    }

    pub fn stop_being_discoverable(&self) -> Result<()> {
        self.platform.hidden().set_scan_mode(ScanMode::None, Duration::ZERO)
    }

    /// Runs a full discovery and returns every device found
    pub async fn discover_and_get_results(&self) -> Result<Vec<BluetoothDevice>> {
        self.check_enabled()?;
        if self.platform.is_discovering() {
            self.platform.cancel_discovery();
        }
        self.discovered.clear();

        let finished = Arc::new(AtomicBool::new(false));
        let receiver: Arc<dyn Listener> = {
            let discovered = self.discovered.clone();
            let finished = finished.clone();
            Arc::new(move |action: &str, extras: Bundle| {
                if action == ACTION_FOUND {
                    match BluetoothDevice::from_found_extras(&extras) {
                        Some(device) => {
                            discovered.insert(device.address.clone(), device);
                        }
                        None => warn!("Ignoring malformed discovery result {:?}", extras),
                    }
                } else if action == ACTION_DISCOVERY_FINISHED {
                    finished.store(true, Ordering::SeqCst);
                }
            })
        };
        let _guard = ReceiverGuard::register(&self.ctx.services().broadcasts,
                                             &[ACTION_FOUND, ACTION_DISCOVERY_FINISHED],
                                             receiver)?;
        if !self.platform.start_discovery() {
            return Err(Error::platform_refused("BluetoothAdapter.startDiscovery"));
        }

        // The adapter may only report itself as discovering a little after
        // startDiscovery returns, so not discovering only counts as done once
        // it has been seen running.
        let platform = self.platform.clone();
        let mut seen_running = false;
        let result = poll::wait_for("Bluetooth discovery to finish",
                                    || {
                                        let discovering = platform.is_discovering();
                                        seen_running |= discovering;
                                        Ok(finished.load(Ordering::SeqCst)
                                           || (seen_running && !discovering))
                                    },
                                    DISCOVERY_TIMEOUT).await;
        if result.is_err() {
            self.platform.cancel_discovery();
        }
        result?;

        let devices: Vec<BluetoothDevice> =
            self.discovered.iter().map(|d| d.value().clone()).collect();
        info!("Discovery finished, found {} devices", devices.len());
        Ok(devices)
    }

    pub fn paired_devices(&self) -> Vec<BluetoothDevice> {
        self.platform.bonded_devices()
    }

    pub async fn pair_device(&self, address: &Address) -> Result<()> {
        if !self.discovered.contains_key(address) {
            return Err(Error::precondition(format!("No device with address {} has been discovered",
                                                   address)));
        }
        if self.platform.bond_state(address) == BondState::Bonded {
            debug!("{} is already bonded", address);
            return Ok(());
        }
        if !self.platform.create_bond(address) {
            return Err(Error::platform_refused("BluetoothDevice.createBond"));
        }

        let platform = self.platform.clone();
        let mut seen_bonding = false;
        poll::wait_for(&format!("bond with {}", address),
                       || match platform.bond_state(address) {
                           BondState::Bonded => Ok(true),
                           BondState::Bonding => {
                               seen_bonding = true;
                               Ok(false)
                           }
                           // Falling back to no bond after bonding means the
                           // remote side rejected us, no point waiting.
                           BondState::None if seen_bonding => {
                               Err(Error::Platform { api: "BluetoothDevice.createBond",
                                                     detail: format!("bonding with {} failed",
                                                                     address) })
                           }
                           BondState::None => Ok(false),
                       },
                       PAIRING_TIMEOUT).await?;
        info!("Paired with {}", address);
        Ok(())
    }

    pub async fn unpair_device(&self, address: &Address) -> Result<()> {
        let bonded = self.platform
                         .bonded_devices()
                         .iter()
                         .any(|d| &d.address == address);
        if !bonded {
            return Err(Error::precondition(format!("{} is not paired", address)));
        }
        self.platform.hidden().remove_bond(address)?;
        let platform = self.platform.clone();
        poll::wait_for(&format!("{} to be unpaired", address),
                       || Ok(platform.bond_state(address) == BondState::None),
                       PAIRING_TIMEOUT).await
    }
}

#[async_trait]
impl Snippet for BluetoothAdapterSnippet {
    fn name(&self) -> &'static str {
        "bluetooth"
    }

    async fn call(&self, method: &str, args: &RpcArgs) -> Result<Value> {
        match method {
            "btIsEnabled" => to_value(self.is_enabled()),
            "btEnable" => to_value(self.enable().await?),
            "btDisable" => to_value(self.disable().await?),
            "btGetName" => to_value(self.adapter_name()),
            "btSetName" => to_value(self.set_name(&args.get::<String>(0)?)?),
            "btGetAddress" => to_value(self.address()),
            "btBecomeDiscoverable" => {
                let duration_sec: u64 = args.get(0)?;
                to_value(self.become_discoverable(Duration::from_secs(duration_sec))?)
            }
            "btStopBeingDiscoverable" => to_value(self.stop_being_discoverable()?),
            "btDiscoverAndGetResults" => to_value(self.discover_and_get_results().await?),
            "btGetPairedDevices" => to_value(self.paired_devices()),
            "btPairDevice" => to_value(self.pair_device(&args.get::<Address>(0)?).await?),
            "btUnpairDevice" => to_value(self.unpair_device(&args.get::<Address>(0)?).await?),
            _ => Err(unknown_method(self.name(), method)),
        }
    }

    fn shutdown(&self) {
        if self.platform.is_discovering() {
            self.platform.cancel_discovery();
        }
        self.ctx.bridge().unregister_owned(self.name());
    }
}

/// Groups devices by bond state, used by tests and demos for readable output
pub fn devices_by_bond_state(devices: &[BluetoothDevice]) -> HashMap<BondState, Vec<Address>> {
    let mut map: HashMap<BondState, Vec<Address>> = HashMap::new();
    for device in devices {
        map.entry(device.bond_state).or_default().push(device.address.clone());
    }
    map
}
