use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{debug, trace};
use uuid::Uuid;

use super::{Countdown, FakeBroadcasts, DEFAULT_SETTLE_POLLS};
use crate::bluetooth::gatt_client::{self, CharacteristicProperties, GattCharacteristic,
                                    GattConnectionId, GattPlatform, GattService, WriteType};
use crate::bluetooth::le_advertiser::{self, AdvertiseData, AdvertiseSettings, AdvertiseToken,
                                      LeAdvertiserPlatform};
use crate::bluetooth::le_scanner::{self, LeScannerPlatform, ScanFilter, ScanSettings, ScanToken};
use crate::bluetooth::{self, BluetoothDevice, BluetoothHiddenApi, BluetoothPlatform, BondState,
                       ScanMode};
use crate::capability::Unsupported;
use crate::event::Listener;
use crate::uuid::{parse_uuid, BluetoothUuid};
use crate::{Address, Bundle, Result};

const GATT_FAILURE: i64 = 0x101;
const GATT_CONNECTION_TIMEOUT: i64 = 8;

#[derive(Debug)]
struct AdapterState {
    enabled: bool,
    pending_enabled: Option<bool>,
    name: String,
    scan_mode: ScanMode,
    discovering: bool,
    nearby: Vec<BluetoothDevice>,
    bonding: Option<Address>,
}

impl AdapterState {
    fn device_mut(&mut self, address: &Address) -> Option<&mut BluetoothDevice> {
        self.nearby.iter_mut().find(|d| &d.address == address)
    }
}

/// Classic adapter fake
///
/// Enabling, disabling, discovery and bonding all complete after the state
/// has been queried `settle_polls` times.
pub struct FakeBluetooth {
    broadcasts: Arc<FakeBroadcasts>,
    state: Arc<StdMutex<AdapterState>>,
    toggle: Countdown,
    discovery: Countdown,
    bond: Countdown,
    settle_polls: AtomicU32,
    reject_bonds: AtomicBool,
    hidden_api_available: AtomicBool,
}

impl FakeBluetooth {
    pub fn new(broadcasts: Arc<FakeBroadcasts>) -> Self {
        let state = AdapterState { enabled: true,
                                   pending_enabled: None,
                                   name: "fake-device".to_string(),
                                   scan_mode: ScanMode::Connectable,
                                   discovering: false,
                                   nearby: vec![],
                                   bonding: None };
        Self { broadcasts,
               state: Arc::new(StdMutex::new(state)),
               toggle: Countdown::default(),
               discovery: Countdown::default(),
               bond: Countdown::default(),
               settle_polls: AtomicU32::new(DEFAULT_SETTLE_POLLS),
               reject_bonds: AtomicBool::new(false),
               hidden_api_available: AtomicBool::new(true) }
    }

    /// Flips the radio immediately, cancelling any pending toggle
    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.state.lock().unwrap();
        state.enabled = enabled;
        state.pending_enabled = None;
    }

    pub fn set_settle_polls(&self, polls: u32) {
        self.settle_polls.store(polls, Ordering::SeqCst);
    }

    pub fn add_nearby_device(&self, name: Option<&str>, address: Address) {
        let mut state = self.state.lock().unwrap();
        state.nearby.retain(|d| d.address != address);
        state.nearby.push(BluetoothDevice { name: name.map(|n| n.to_string()),
                                            address,
                                            bond_state: BondState::None });
    }

    /// Makes remote devices refuse to bond after a while
    pub fn set_reject_bonds(&self, reject: bool) {
        self.reject_bonds.store(reject, Ordering::SeqCst);
    }

    pub fn set_hidden_api_available(&self, available: bool) {
        self.hidden_api_available.store(available, Ordering::SeqCst);
    }

    fn settle_polls(&self) -> u32 {
        self.settle_polls.load(Ordering::SeqCst)
    }
}

impl BluetoothPlatform for FakeBluetooth {
    fn is_enabled(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if let Some(target) = state.pending_enabled {
            if self.toggle.tick() {
                debug!("Fake Bluetooth radio settled, enabled = {}", target);
                state.enabled = target;
                state.pending_enabled = None;
            }
        }
        state.enabled
    }

    fn enable(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.pending_enabled = Some(true);
        self.toggle.arm(self.settle_polls());
        true
    }

    fn disable(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.pending_enabled = Some(false);
        state.discovering = false;
        self.toggle.arm(self.settle_polls());
        true
    }

    fn name(&self) -> String {
        self.state.lock().unwrap().name.clone()
    }

    fn set_name(&self, name: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.enabled {
            return false;
        }
        state.name = name.to_string();
        true
    }

    fn address(&self) -> Address {
        Address::MAC(crate::MAC(0x0000_01E8_F5F4))
    }

    fn scan_mode(&self) -> ScanMode {
        self.state.lock().unwrap().scan_mode
    }

    fn start_discovery(&self) -> bool {
        let found: Vec<Bundle> = {
            let mut state = self.state.lock().unwrap();
            if !state.enabled {
                return false;
            }
            state.discovering = true;
            self.discovery.arm(self.settle_polls());
            state.nearby.iter().map(BluetoothDevice::to_found_extras).collect()
        };
        for extras in found {
            self.broadcasts.send(bluetooth::ACTION_FOUND, extras);
        }
        true
    }

    fn cancel_discovery(&self) -> bool {
        let was_discovering = {
            let mut state = self.state.lock().unwrap();
            std::mem::replace(&mut state.discovering, false)
        };
        if was_discovering {
            self.broadcasts.send(bluetooth::ACTION_DISCOVERY_FINISHED, Bundle::new());
        }
        true
    }

    fn is_discovering(&self) -> bool {
        let finished = {
            let mut state = self.state.lock().unwrap();
            if state.discovering && self.discovery.tick() {
                state.discovering = false;
                true
            } else {
                false
            }
        };
        if finished {
            self.broadcasts.send(bluetooth::ACTION_DISCOVERY_FINISHED, Bundle::new());
        }
        !finished && self.state.lock().unwrap().discovering
    }

    fn bonded_devices(&self) -> Vec<BluetoothDevice> {
        let state = self.state.lock().unwrap();
        state.nearby
             .iter()
             .filter(|d| d.bond_state == BondState::Bonded)
             .cloned()
             .collect()
    }

    fn bond_state(&self, address: &Address) -> BondState {
        let mut state = self.state.lock().unwrap();
        if state.bonding.as_ref() == Some(address) && self.bond.tick() {
            state.bonding = None;
            let outcome = if self.reject_bonds.load(Ordering::SeqCst) {
                BondState::None
            } else {
                BondState::Bonded
            };
            if let Some(device) = state.device_mut(address) {
                device.bond_state = outcome;
            }
        }
        state.nearby
             .iter()
             .find(|d| &d.address == address)
             .map(|d| d.bond_state)
             .unwrap_or(BondState::None)
    }

    fn create_bond(&self, address: &Address) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.enabled || state.bonding.is_some() {
            return false;
        }
        match state.device_mut(address) {
            Some(device) => device.bond_state = BondState::Bonding,
            None => return false,
        }
        state.bonding = Some(address.clone());
        self.bond.arm(self.settle_polls());
        true
    }

    fn hidden(&self) -> Arc<dyn BluetoothHiddenApi> {
        if !self.hidden_api_available.load(Ordering::SeqCst) {
            return Arc::new(Unsupported::new("hidden API blocked by the fake platform"));
        }
        Arc::new(FakeHiddenBluetooth { state: self.state.clone() })
    }
}

struct FakeHiddenBluetooth {
    state: Arc<StdMutex<AdapterState>>,
}

impl BluetoothHiddenApi for FakeHiddenBluetooth {
    fn set_scan_mode(&self, mode: ScanMode, duration: Duration) -> Result<()> {
        trace!("set_scan_mode({:?}, {:?})", mode, duration);
        self.state.lock().unwrap().scan_mode = mode;
        Ok(())
    }

    fn remove_bond(&self, address: &Address) -> Result<()> {
        if let Some(device) = self.state.lock().unwrap().device_mut(address) {
            device.bond_state = BondState::None;
        }
        Ok(())
    }
}

/// A BLE peripheral the fake radio can see and connect to
#[derive(Clone, Debug)]
pub struct FakePeripheral {
    pub name: String,
    pub address: Address,
    pub rssi: i16,
    pub services: Vec<GattService>,
    values: HashMap<Uuid, Vec<u8>>,
}

impl FakePeripheral {
    pub fn new(name: &str, address: &str) -> Self {
        let address = address.parse().unwrap_or_else(|never: Infallible| match never {});
        Self { name: name.to_string(),
               address,
               rssi: -60,
               services: vec![],
               values: HashMap::new() }
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn with_service(mut self, uuid: Uuid, characteristics: &[(Uuid, CharacteristicProperties)])
                        -> Self {
        let characteristics =
            characteristics.iter()
                           .map(|(uuid, properties)| GattCharacteristic { uuid: *uuid,
                                                                          properties: *properties })
                           .collect();
        self.services.push(GattService { uuid, characteristics });
        self
    }

    pub fn with_value(mut self, characteristic: Uuid, value: &[u8]) -> Self {
        self.values.insert(characteristic, value.to_vec());
        self
    }

    fn has_characteristic(&self, uuid: Uuid) -> bool {
        self.services
            .iter()
            .any(|s| s.characteristics.iter().any(|c| c.uuid == uuid))
    }

    fn matches(&self, filter: &ScanFilter) -> bool {
        if let Some(name) = &filter.device_name {
            if name != &self.name {
                return false;
            }
        }
        if let Some(address) = &filter.device_address {
            if address != &self.address {
                return false;
            }
        }
        if let Some(uuid) = &filter.service_uuid {
            match parse_uuid(uuid) {
                Ok(uuid) => {
                    if !self.services.iter().any(|s| s.uuid == uuid) {
                        return false;
                    }
                }
                Err(_) => return false,
            }
        }
        true
    }

    fn scan_result(&self) -> Bundle {
        let uuids: Vec<String> = self.services.iter().map(|s| s.uuid.to_string()).collect();
        Bundle::new().with("deviceName", self.name.as_str())
                     .with("address", self.address.to_string())
                     .with("rssi", self.rssi)
                     .with("serviceUuids", uuids)
    }
}

struct ActiveScan {
    filters: Vec<ScanFilter>,
    batched: bool,
    callback: Arc<dyn Listener>,
}

impl ActiveScan {
    fn wants(&self, peripheral: &FakePeripheral) -> bool {
        self.filters.is_empty() || self.filters.iter().any(|f| peripheral.matches(f))
    }
}

struct GattClient {
    address: Address,
    connected: bool,
    notifying: HashSet<Uuid>,
    callback: Arc<dyn Listener>,
}

#[derive(Default)]
struct LeState {
    peripherals: Vec<FakePeripheral>,
    scans: HashMap<u64, ActiveScan>,
    advertisements: HashSet<u64>,
    clients: HashMap<u64, GattClient>,
    fail_next_scan: Option<i32>,
}

impl LeState {
    fn peripheral(&self, address: &Address) -> Option<&FakePeripheral> {
        self.peripherals.iter().find(|p| &p.address == address)
    }

    fn client_peripheral(&self, connection: GattConnectionId)
                         -> Option<(&GattClient, &FakePeripheral)> {
        let client = self.clients.get(&connection.0).filter(|c| c.connected)?;
        Some((client, self.peripheral(&client.address)?))
    }
}

/// The BLE side of the fake radio: scanner, advertiser and GATT client
///
/// Callbacks are invoked synchronously from whichever thread triggered them,
/// never while the fake's own lock is held.
#[derive(Default)]
pub struct FakeLe {
    next_token: AtomicU64,
    state: StdMutex<LeState>,
}

impl FakeLe {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::SeqCst)
    }

    /// Makes `peripheral` visible, reporting it to every matching scan
    pub fn add_peripheral(&self, peripheral: FakePeripheral) {
        let deliveries: Vec<(Arc<dyn Listener>, bool)> = {
            let mut state = self.state.lock().unwrap();
            state.peripherals.retain(|p| p.address != peripheral.address);
            let deliveries = state.scans
                                  .values()
                                  .filter(|scan| scan.wants(&peripheral))
                                  .map(|scan| (scan.callback.clone(), scan.batched))
                                  .collect();
            state.peripherals.push(peripheral.clone());
            deliveries
        };
        for (callback, batched) in deliveries {
            deliver_scan_result(&*callback, batched, peripheral.scan_result());
        }
    }

    pub fn active_scans(&self) -> usize {
        self.state.lock().unwrap().scans.len()
    }

    /// The next scan start reports `onScanFailed` with `error_code`
    pub fn fail_next_scan(&self, error_code: i32) {
        self.state.lock().unwrap().fail_next_scan = Some(error_code);
    }

    pub fn active_advertisements(&self) -> usize {
        self.state.lock().unwrap().advertisements.len()
    }

    /// GATT clients that have been connected but not closed yet
    pub fn open_gatt_clients(&self) -> usize {
        self.state.lock().unwrap().clients.len()
    }

    pub fn characteristic_value(&self, address: &Address, characteristic: Uuid)
                                -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state.peripheral(address)?.values.get(&characteristic).cloned()
    }

    /// Changes a characteristic value on the peripheral side, notifying
    /// subscribed clients.
    pub fn notify_characteristic(&self, address: &Address, characteristic: Uuid, value: &[u8]) {
        let callbacks: Vec<Arc<dyn Listener>> = {
            let mut state = self.state.lock().unwrap();
            if let Some(peripheral) = state.peripherals.iter_mut().find(|p| &p.address == address)
            {
                peripheral.values.insert(characteristic, value.to_vec());
            }
            state.clients
                 .values()
                 .filter(|c| {
                     c.connected && &c.address == address && c.notifying.contains(&characteristic)
                 })
                 .map(|c| c.callback.clone())
                 .collect()
        };
        for callback in callbacks {
            callback.on_event(gatt_client::EVENT_CHARACTERISTIC_CHANGED,
                              Bundle::new().with("uuid", characteristic.to_string())
                                           .with("value", value));
        }
    }

    /// Simulates the peripheral going out of range
    pub fn drop_connection(&self, address: &Address) {
        let callbacks: Vec<Arc<dyn Listener>> = {
            let mut state = self.state.lock().unwrap();
            state.clients
                 .values_mut()
                 .filter(|c| c.connected && &c.address == address)
                 .map(|c| {
                     c.connected = false;
                     c.callback.clone()
                 })
                 .collect()
        };
        for callback in callbacks {
            callback.on_event(gatt_client::EVENT_CONNECTION_STATE_CHANGE,
                              connection_state(GATT_CONNECTION_TIMEOUT,
                                               gatt_client::STATE_DISCONNECTED));
        }
    }
}

fn deliver_scan_result(callback: &dyn Listener, batched: bool, result: Bundle) {
    if batched {
        callback.on_event(le_scanner::EVENT_BATCH_SCAN_RESULT,
                          Bundle::new().with("results", vec![result]));
    } else {
        callback.on_event(le_scanner::EVENT_SCAN_RESULT, result);
    }
}

fn connection_state(status: i64, new_state: i64) -> Bundle {
    Bundle::new().with("status", status).with("newState", new_state)
}

// Roughly what the payload costs in a legacy advertising PDU
fn advertised_size(data: &AdvertiseData) -> usize {
    let mut size = 3; // flags
    if data.include_device_name {
        size += 2 + "fake-device".len();
    }
    if data.include_tx_power_level {
        size += 3;
    }
    for uuid in &data.service_uuids {
        let short = parse_uuid(uuid).map(|u| u.as_u16().is_some()).unwrap_or(false);
        size += if short { 4 } else { 18 };
    }
    if data.manufacturer_id.is_some() {
        size += 4 + data.manufacturer_data.len();
    }
    size
}

impl LeScannerPlatform for FakeLe {
    fn start_scan(&self, filters: &[ScanFilter], settings: &ScanSettings,
                  callback: Arc<dyn Listener>)
                  -> Result<ScanToken> {
        let token = self.next_token();
        let batched = settings.report_delay_ms > 0;
        let (failure, visible) = {
            let mut state = self.state.lock().unwrap();
            match state.fail_next_scan.take() {
                Some(code) => (Some(code), vec![]),
                None => {
                    let scan = ActiveScan { filters: filters.to_vec(),
                                            batched,
                                            callback: callback.clone() };
                    let visible: Vec<Bundle> = state.peripherals
                                                    .iter()
                                                    .filter(|p| scan.wants(p))
                                                    .map(FakePeripheral::scan_result)
                                                    .collect();
                    state.scans.insert(token, scan);
                    (None, visible)
                }
            }
        };
        if let Some(code) = failure {
            callback.on_event(le_scanner::EVENT_SCAN_FAILED, Bundle::new().with("ErrorCode", code));
            return Ok(ScanToken(token));
        }
        for result in visible {
            deliver_scan_result(&*callback, batched, result);
        }
        Ok(ScanToken(token))
    }

    fn stop_scan(&self, token: ScanToken) {
        self.state.lock().unwrap().scans.remove(&token.0);
    }
}

impl LeAdvertiserPlatform for FakeLe {
    fn start_advertising(&self, settings: &AdvertiseSettings, data: &AdvertiseData,
                         scan_response: Option<&AdvertiseData>, callback: Arc<dyn Listener>)
                         -> Result<AdvertiseToken> {
        let token = self.next_token();
        let too_large = advertised_size(data) > le_advertiser::MAX_LEGACY_ADVERTISING_BYTES
                        || scan_response.map(advertised_size).unwrap_or(0)
                           > le_advertiser::MAX_LEGACY_ADVERTISING_BYTES;
        if too_large {
            callback.on_event(le_advertiser::EVENT_START_FAILURE,
                              Bundle::new().with("ErrorCode",
                                                 le_advertiser::ADVERTISE_FAILED_DATA_TOO_LARGE));
            return Ok(AdvertiseToken(token));
        }
        self.state.lock().unwrap().advertisements.insert(token);
        trace!("advertising {:?} with {:?}", data, settings);
        callback.on_event(le_advertiser::EVENT_START_SUCCESS,
                          Bundle::new().with("mode", format!("{:?}", settings.mode)));
        Ok(AdvertiseToken(token))
    }

    fn stop_advertising(&self, token: AdvertiseToken) {
        self.state.lock().unwrap().advertisements.remove(&token.0);
    }
}

impl GattPlatform for FakeLe {
    fn connect_gatt(&self, address: &Address, _auto_connect: bool, callback: Arc<dyn Listener>)
                    -> Result<GattConnectionId> {
        let token = self.next_token();
        let reachable = {
            let mut state = self.state.lock().unwrap();
            let reachable = state.peripheral(address).is_some();
            state.clients.insert(token,
                                 GattClient { address: address.clone(),
                                              connected: reachable,
                                              notifying: HashSet::new(),
                                              callback: callback.clone() });
            reachable
        };
        let event = if reachable {
            connection_state(gatt_client::GATT_SUCCESS, gatt_client::STATE_CONNECTED)
        } else {
            connection_state(gatt_client::GATT_ERROR, gatt_client::STATE_DISCONNECTED)
        };
        callback.on_event(gatt_client::EVENT_CONNECTION_STATE_CHANGE, event);
        Ok(GattConnectionId(token))
    }

    fn discover_services(&self, connection: GattConnectionId) -> bool {
        let (callback, services) = {
            let state = self.state.lock().unwrap();
            match state.client_peripheral(connection) {
                Some((client, peripheral)) => (client.callback.clone(), peripheral.services.clone()),
                None => return false,
            }
        };
        callback.on_event(gatt_client::EVENT_SERVICES_DISCOVERED,
                          gatt_client::services_discovered_data(gatt_client::GATT_SUCCESS,
                                                                &services));
        true
    }

    fn read_characteristic(&self, connection: GattConnectionId, _service: Uuid,
                           characteristic: Uuid)
                           -> bool {
        let (callback, value) = {
            let state = self.state.lock().unwrap();
            match state.client_peripheral(connection) {
                Some((client, peripheral)) if peripheral.has_characteristic(characteristic) => {
                    (client.callback.clone(), peripheral.values.get(&characteristic).cloned())
                }
                _ => return false,
            }
        };
        let mut data = Bundle::new();
        data.put("uuid", characteristic.to_string());
        match value {
            Some(value) => data.put("status", gatt_client::GATT_SUCCESS).put("value", value),
            None => data.put("status", GATT_FAILURE),
        };
        callback.on_event(gatt_client::EVENT_CHARACTERISTIC_READ, data);
        true
    }

    fn write_characteristic(&self, connection: GattConnectionId, _service: Uuid,
                            characteristic: Uuid, value: &[u8], write_type: WriteType)
                            -> bool {
        let callback = {
            let mut state = self.state.lock().unwrap();
            let address = match state.clients.get(&connection.0).filter(|c| c.connected) {
                Some(client) => client.address.clone(),
                None => return false,
            };
            let callback = state.clients[&connection.0].callback.clone();
            match state.peripherals
                       .iter_mut()
                       .find(|p| p.address == address && p.has_characteristic(characteristic))
            {
                Some(peripheral) => {
                    peripheral.values.insert(characteristic, value.to_vec());
                }
                None => return false,
            }
            callback
        };
        if write_type == WriteType::WithResponse {
            callback.on_event(gatt_client::EVENT_CHARACTERISTIC_WRITE,
                              Bundle::new().with("status", gatt_client::GATT_SUCCESS)
                                           .with("uuid", characteristic.to_string()));
        }
        true
    }

    fn set_characteristic_notification(&self, connection: GattConnectionId, _service: Uuid,
                                       characteristic: Uuid, enable: bool)
                                       -> bool {
        let mut state = self.state.lock().unwrap();
        let known = match state.client_peripheral(connection) {
            Some((_, peripheral)) => peripheral.has_characteristic(characteristic),
            None => false,
        };
        if !known {
            return false;
        }
        if let Some(client) = state.clients.get_mut(&connection.0) {
            if enable {
                client.notifying.insert(characteristic);
            } else {
                client.notifying.remove(&characteristic);
            }
        }
        true
    }

    fn disconnect(&self, connection: GattConnectionId) {
        let callback = {
            let mut state = self.state.lock().unwrap();
            match state.clients.get_mut(&connection.0) {
                Some(client) if client.connected => {
                    client.connected = false;
                    client.callback.clone()
                }
                _ => return,
            }
        };
        callback.on_event(gatt_client::EVENT_CONNECTION_STATE_CHANGE,
                          connection_state(gatt_client::GATT_SUCCESS,
                                           gatt_client::STATE_DISCONNECTED));
    }

    fn close(&self, connection: GattConnectionId) {
        self.state.lock().unwrap().clients.remove(&connection.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_finishes_after_settling() {
        let broadcasts = Arc::new(FakeBroadcasts::new());
        let adapter = FakeBluetooth::new(broadcasts);
        adapter.set_settle_polls(2);
        assert!(adapter.start_discovery());
        assert!(adapter.is_discovering());
        assert!(!adapter.is_discovering());
        assert!(!adapter.is_discovering());
    }

    #[test]
    fn oversized_advertisements_are_refused() {
        let data = AdvertiseData { include_device_name: true,
                                   service_uuids: vec!["6e400001-b5a3-f393-e0a9-e50e24dcca9e".into(),
                                                       "180D".into()],
                                   ..Default::default() };
        assert_eq!(advertised_size(&data), 3 + 13 + 18 + 4);
        assert!(advertised_size(&data) > le_advertiser::MAX_LEGACY_ADVERTISING_BYTES);
    }
}
