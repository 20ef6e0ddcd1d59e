use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use log::debug;

use super::{Countdown, FakeBroadcasts, DEFAULT_SETTLE_POLLS};
use crate::event::Listener;
use crate::wifi::aware::{self, AwareSessionId, DiscoveryKind, DiscoverySessionId,
                         WifiAwarePlatform};
use crate::wifi::p2p::{self, P2pChannel, P2pConnectionInfo, P2pDevice, WifiP2pPlatform};
use crate::wifi::{self, ConfiguredNetwork, WifiConnectionInfo, WifiLockId, WifiLockMode,
                  WifiNetworkConfig, WifiPlatform, WifiScanResult};
use crate::{Address, Bundle, Error, Result};

fn parse_address(address: &str) -> Address {
    address.parse().unwrap_or_else(|never: Infallible| match never {})
}

struct AccessPoint {
    result: WifiScanResult,
    password: Option<String>,
}

struct Association {
    network_id: i32,
    ssid: String,
    bssid: Address,
    rssi: i32,
}

#[derive(Default)]
struct WifiState {
    enabled: bool,
    pending_enabled: Option<bool>,
    access_points: Vec<AccessPoint>,
    networks: Vec<(ConfiguredNetwork, Option<String>)>,
    next_network_id: i32,
    connecting: Option<i32>,
    association: Option<Association>,
    locks: HashMap<u64, (WifiLockMode, String)>,
}

impl WifiState {
    // Whether the configured network `network_id` can associate with a
    // visible access point
    fn try_associate(&self, network_id: i32) -> Option<Association> {
        let (network, password) = self.networks.iter().find(|(n, _)| n.network_id == network_id)?;
        let ap = self.access_points.iter().find(|ap| {
                                              ap.result.ssid == network.ssid
                                              && (ap.password.is_none()
                                                  || ap.password == *password)
                                          })?;
        Some(Association { network_id,
                           ssid: network.ssid.clone(),
                           bssid: ap.result.bssid.clone(),
                           rssi: ap.result.level_dbm })
    }
}

pub struct FakeWifi {
    broadcasts: Arc<FakeBroadcasts>,
    state: StdMutex<WifiState>,
    toggle: Countdown,
    association: Countdown,
    settle_polls: AtomicU32,
    scan_stalls: AtomicBool,
    next_lock: AtomicU64,
}

impl FakeWifi {
    pub fn new(broadcasts: Arc<FakeBroadcasts>) -> Self {
        Self { broadcasts,
               state: StdMutex::new(WifiState { enabled: true,
                                                ..Default::default() }),
               toggle: Countdown::default(),
               association: Countdown::default(),
               settle_polls: AtomicU32::new(DEFAULT_SETTLE_POLLS),
               scan_stalls: AtomicBool::new(false),
               next_lock: AtomicU64::new(0) }
    }

    pub fn set_enabled_now(&self, enabled: bool) {
        let mut state = self.state.lock().unwrap();
        state.enabled = enabled;
        state.pending_enabled = None;
        if !enabled {
            state.association = None;
        }
    }

    pub fn set_settle_polls(&self, polls: u32) {
        self.settle_polls.store(polls, Ordering::SeqCst);
    }

    /// A visible access point; `password` None makes it an open network
    pub fn add_access_point(&self, ssid: &str, bssid: &str, password: Option<&str>) {
        let capabilities = if password.is_some() { "[WPA2-PSK-CCMP][ESS]" } else { "[ESS]" };
        let result = WifiScanResult { ssid: ssid.to_string(),
                                      bssid: parse_address(bssid),
                                      frequency_mhz: 2437,
                                      level_dbm: -55,
                                      capabilities: capabilities.to_string() };
        self.state.lock().unwrap().access_points.push(AccessPoint { result,
                                                                     password: password.map(|p| p.to_string()) });
    }

    /// Scans get started but never deliver their results broadcast
    pub fn set_scan_stalls(&self, stalls: bool) {
        self.scan_stalls.store(stalls, Ordering::SeqCst);
    }

    pub fn held_locks(&self) -> usize {
        self.state.lock().unwrap().locks.len()
    }
}

impl WifiPlatform for FakeWifi {
    fn is_enabled(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if let Some(target) = state.pending_enabled {
            if self.toggle.tick() {
                state.enabled = target;
                state.pending_enabled = None;
                if !target {
                    state.association = None;
                }
            }
        }
        state.enabled
    }

    fn set_enabled(&self, enabled: bool) -> bool {
        self.state.lock().unwrap().pending_enabled = Some(enabled);
        self.toggle.arm(self.settle_polls.load(Ordering::SeqCst));
        true
    }

    fn start_scan(&self) -> bool {
        if !self.state.lock().unwrap().enabled {
            return false;
        }
        if self.scan_stalls.load(Ordering::SeqCst) {
            debug!("Fake WiFi scan stalled");
            return true;
        }
        self.broadcasts.send(wifi::ACTION_SCAN_RESULTS_AVAILABLE,
                             Bundle::new().with(wifi::EXTRA_RESULTS_UPDATED, true));
        true
    }

    fn scan_results(&self) -> Vec<WifiScanResult> {
        let state = self.state.lock().unwrap();
        if !state.enabled {
            return vec![];
        }
        state.access_points.iter().map(|ap| ap.result.clone()).collect()
    }

    fn add_network(&self, config: &WifiNetworkConfig) -> Option<i32> {
        if config.ssid.is_empty() {
            return None;
        }
        let mut state = self.state.lock().unwrap();
        let network_id = state.next_network_id;
        state.next_network_id += 1;
        // Kept unquoted here, quoted on the way out like the platform does
        state.networks.push((ConfiguredNetwork { network_id,
                                                 ssid: config.ssid.clone() },
                             config.password.clone()));
        Some(network_id)
    }

    fn enable_network(&self, network_id: i32, attempt_connect: bool) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.enabled || !state.networks.iter().any(|(n, _)| n.network_id == network_id) {
            return false;
        }
        if attempt_connect {
            state.connecting = Some(network_id);
            self.association.arm(self.settle_polls.load(Ordering::SeqCst));
        }
        true
    }

    fn remove_network(&self, network_id: i32) -> bool {
        let mut state = self.state.lock().unwrap();
        let before = state.networks.len();
        state.networks.retain(|(n, _)| n.network_id != network_id);
        if state.association.as_ref().map(|a| a.network_id) == Some(network_id) {
            state.association = None;
        }
        if state.connecting == Some(network_id) {
            state.connecting = None;
        }
        state.networks.len() != before
    }

    fn configured_networks(&self) -> Vec<ConfiguredNetwork> {
        let state = self.state.lock().unwrap();
        state.networks
             .iter()
             .map(|(n, _)| ConfiguredNetwork { network_id: n.network_id,
                                               ssid: format!("\"{}\"", n.ssid) })
             .collect()
    }

    fn connection_info(&self) -> WifiConnectionInfo {
        let mut state = self.state.lock().unwrap();
        if let Some(network_id) = state.connecting {
            if self.association.tick() {
                state.connecting = None;
                match state.try_associate(network_id) {
                    Some(association) => state.association = Some(association),
                    None => debug!("Fake WiFi network {} failed to associate", network_id),
                }
            }
        }
        match &state.association {
            Some(a) => WifiConnectionInfo { ssid: Some(format!("\"{}\"", a.ssid)),
                                            bssid: Some(a.bssid.clone()),
                                            network_id: a.network_id,
                                            rssi: a.rssi,
                                            link_speed_mbps: 72 },
            None => WifiConnectionInfo::disconnected(),
        }
    }

    fn acquire_lock(&self, mode: WifiLockMode, tag: &str) -> Result<WifiLockId> {
        let id = self.next_lock.fetch_add(1, Ordering::SeqCst);
        self.state.lock().unwrap().locks.insert(id, (mode, tag.to_string()));
        Ok(WifiLockId(id))
    }

    fn release_lock(&self, lock: WifiLockId) {
        self.state.lock().unwrap().locks.remove(&lock.0);
    }
}

struct Discovery {
    session: AwareSessionId,
    kind: DiscoveryKind,
    service_name: String,
    callback: Arc<dyn Listener>,
}

#[derive(Default)]
struct AwareState {
    attachments: HashSet<u64>,
    discoveries: HashMap<u64, Discovery>,
    peer_services: Vec<(String, Vec<u8>)>,
}

pub struct FakeWifiAware {
    next_id: AtomicU64,
    available: AtomicBool,
    fail_attach: AtomicBool,
    state: StdMutex<AwareState>,
}

impl FakeWifiAware {
    pub fn new() -> Self {
        Self { next_id: AtomicU64::new(0),
               available: AtomicBool::new(true),
               fail_attach: AtomicBool::new(false),
               state: StdMutex::new(AwareState::default()) }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_fail_attach(&self, fail: bool) {
        self.fail_attach.store(fail, Ordering::SeqCst);
    }

    /// A service published by some other device in range
    pub fn add_peer_service(&self, service_name: &str, info: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .peer_services
            .push((service_name.to_string(), info.to_vec()));
    }

    /// Delivers a message from a peer to every local publisher of `service_name`
    pub fn send_message(&self, service_name: &str, message: &[u8]) {
        let callbacks: Vec<Arc<dyn Listener>> = {
            let state = self.state.lock().unwrap();
            state.discoveries
                 .values()
                 .filter(|d| d.kind == DiscoveryKind::Publish && d.service_name == service_name)
                 .map(|d| d.callback.clone())
                 .collect()
        };
        for callback in callbacks {
            callback.on_event(aware::EVENT_MESSAGE_RECEIVED,
                              Bundle::new().with("peerId", 0i64).with("message", message));
        }
    }

    /// Attach sessions plus discovery sessions still open
    pub fn open_sessions(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.attachments.len() + state.discoveries.len()
    }
}

impl Default for FakeWifiAware {
    fn default() -> Self {
        Self::new()
    }
}

impl WifiAwarePlatform for FakeWifiAware {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn attach(&self, callback: Arc<dyn Listener>) -> Result<AwareSessionId> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if self.fail_attach.load(Ordering::SeqCst) {
            callback.on_event(aware::EVENT_ATTACH_FAILED,
                              Bundle::new().with("reason", "attach refused by fake platform"));
        } else {
            self.state.lock().unwrap().attachments.insert(id);
            callback.on_event(aware::EVENT_ATTACHED, Bundle::new());
        }
        Ok(AwareSessionId(id))
    }

    fn start_discovery(&self, session: AwareSessionId, kind: DiscoveryKind, service_name: &str,
                       callback: Arc<dyn Listener>)
                       -> Result<DiscoverySessionId> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let discovered: Vec<Bundle> = {
            let mut state = self.state.lock().unwrap();
            if !state.attachments.contains(&session.0) {
                return Err(Error::platform_refused("WifiAwareSession.publish/subscribe"));
            }
            state.discoveries.insert(id,
                                     Discovery { session,
                                                 kind,
                                                 service_name: service_name.to_string(),
                                                 callback: callback.clone() });
            match kind {
                DiscoveryKind::Publish => vec![],
                DiscoveryKind::Subscribe => {
                    state.peer_services
                         .iter()
                         .enumerate()
                         .filter(|(_, (name, _))| name == service_name)
                         .map(|(peer, (name, info))| {
                             Bundle::new().with("peerId", peer as i64)
                                          .with("serviceName", name.as_str())
                                          .with("serviceSpecificInfo", info.as_slice())
                         })
                         .collect()
                }
            }
        };
        let started = match kind {
            DiscoveryKind::Publish => aware::EVENT_PUBLISH_STARTED,
            DiscoveryKind::Subscribe => aware::EVENT_SUBSCRIBE_STARTED,
        };
        callback.on_event(started, Bundle::new().with("sessionId", id as i64));
        for data in discovered {
            callback.on_event(aware::EVENT_SERVICE_DISCOVERED, data);
        }
        Ok(DiscoverySessionId(id))
    }

    fn close_discovery(&self, session: DiscoverySessionId) {
        self.state.lock().unwrap().discoveries.remove(&session.0);
    }

    fn detach(&self, session: AwareSessionId) {
        let terminated: Vec<Arc<dyn Listener>> = {
            let mut state = self.state.lock().unwrap();
            state.attachments.remove(&session.0);
            let ids: Vec<u64> = state.discoveries
                                     .iter()
                                     .filter(|(_, d)| d.session == session)
                                     .map(|(id, _)| *id)
                                     .collect();
            ids.iter()
               .filter_map(|id| state.discoveries.remove(id))
               .map(|d| d.callback)
               .collect()
        };
        for callback in terminated {
            callback.on_event(aware::EVENT_SESSION_TERMINATED, Bundle::new());
        }
    }
}

#[derive(Default)]
struct P2pState {
    channels: HashSet<u64>,
    discovering: bool,
    peers: Vec<P2pDevice>,
    connecting: Option<Address>,
    group: Option<Address>,
}

pub struct FakeWifiP2p {
    broadcasts: Arc<FakeBroadcasts>,
    next_channel: AtomicU64,
    refuse_discovery: AtomicBool,
    group_formation: Countdown,
    state: StdMutex<P2pState>,
}

impl FakeWifiP2p {
    pub fn new(broadcasts: Arc<FakeBroadcasts>) -> Self {
        Self { broadcasts,
               next_channel: AtomicU64::new(0),
               refuse_discovery: AtomicBool::new(false),
               group_formation: Countdown::default(),
               state: StdMutex::new(P2pState::default()) }
    }

    /// A peer coming into range
    pub fn add_peer(&self, name: &str, address: &str) {
        let discovering = {
            let mut state = self.state.lock().unwrap();
            state.peers.push(P2pDevice { device_name: name.to_string(),
                                         device_address: parse_address(address),
                                         is_group_owner: false });
            state.discovering
        };
        if discovering {
            self.broadcasts.send(p2p::ACTION_PEERS_CHANGED, Bundle::new());
        }
    }

    pub fn is_discovering(&self) -> bool {
        self.state.lock().unwrap().discovering
    }

    pub fn set_refuse_discovery(&self, refuse: bool) {
        self.refuse_discovery.store(refuse, Ordering::SeqCst);
    }

    pub fn open_channels(&self) -> usize {
        self.state.lock().unwrap().channels.len()
    }
}

impl WifiP2pPlatform for FakeWifiP2p {
    fn initialize(&self) -> Result<P2pChannel> {
        let id = self.next_channel.fetch_add(1, Ordering::SeqCst);
        self.state.lock().unwrap().channels.insert(id);
        Ok(P2pChannel(id))
    }

    fn close(&self, channel: P2pChannel) {
        let mut state = self.state.lock().unwrap();
        state.channels.remove(&channel.0);
        if state.channels.is_empty() {
            state.discovering = false;
        }
    }

    fn discover_peers(&self, channel: P2pChannel) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if self.refuse_discovery.load(Ordering::SeqCst) || !state.channels.contains(&channel.0)
            {
                return false;
            }
            state.discovering = true;
        }
        self.broadcasts.send(p2p::ACTION_PEERS_CHANGED, Bundle::new());
        true
    }

    fn stop_peer_discovery(&self, _channel: P2pChannel) -> bool {
        self.state.lock().unwrap().discovering = false;
        true
    }

    fn request_peers(&self, _channel: P2pChannel) -> Vec<P2pDevice> {
        self.state.lock().unwrap().peers.clone()
    }

    fn connect(&self, channel: P2pChannel, address: &Address) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.channels.contains(&channel.0)
           || !state.peers.iter().any(|p| &p.device_address == address)
        {
            return false;
        }
        state.connecting = Some(address.clone());
        self.group_formation.arm(DEFAULT_SETTLE_POLLS);
        true
    }

    fn remove_group(&self, _channel: P2pChannel) -> bool {
        self.state.lock().unwrap().group = None;
        true
    }

    fn connection_info(&self, _channel: P2pChannel) -> P2pConnectionInfo {
        let mut state = self.state.lock().unwrap();
        if state.connecting.is_some() && self.group_formation.tick() {
            state.group = state.connecting.take();
        }
        match &state.group {
            Some(_) => P2pConnectionInfo { group_formed: true,
                                           is_group_owner: false,
                                           group_owner_address: Some("192.168.49.1".to_string()) },
            None => P2pConnectionInfo::default(),
        }
    }
}
