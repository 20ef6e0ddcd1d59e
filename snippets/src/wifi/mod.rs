//! WiFi station snippet
//!
//! Radio toggles, scans and connections all follow the same pattern: ask the
//! platform to start the transition, then poll until it is visible in the
//! platform's state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::ReceiverGuard;
use crate::event::Listener;
use crate::poll::{self, CONNECTION_TIMEOUT, SCAN_TIMEOUT, TOGGLE_TIMEOUT};
use crate::rpc::{to_value, unknown_method, RpcArgs, Snippet};
use crate::{Address, Bundle, Error, Result, SnippetContext};

pub mod aware;
pub mod p2p;

pub const ACTION_SCAN_RESULTS_AVAILABLE: &str = "android.net.wifi.SCAN_RESULTS";
pub const EXTRA_RESULTS_UPDATED: &str = "resultsUpdated";

/// Network id reported while not associated
pub const INVALID_NETWORK_ID: i32 = -1;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WifiScanResult {
    pub ssid: String,
    pub bssid: Address,
    pub frequency_mhz: u32,
    pub level_dbm: i32,
    /// Security capabilities, e.g. "[WPA2-PSK-CCMP][ESS]"
    pub capabilities: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WifiNetworkConfig {
    pub ssid: String,
    pub password: Option<String>,
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfiguredNetwork {
    pub network_id: i32,
    pub ssid: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WifiConnectionInfo {
    /// As reported by the platform, which quotes UTF-8 SSIDs
    pub ssid: Option<String>,
    pub bssid: Option<Address>,
    pub network_id: i32,
    pub rssi: i32,
    pub link_speed_mbps: u32,
}

impl WifiConnectionInfo {
    pub fn disconnected() -> Self {
        Self { ssid: None,
               bssid: None,
               network_id: INVALID_NETWORK_ID,
               rssi: -127,
               link_speed_mbps: 0 }
    }

    pub fn is_connected_to(&self, ssid: &str) -> bool {
        self.network_id != INVALID_NETWORK_ID
        && self.ssid.as_deref().map(unquote_ssid) == Some(ssid)
    }
}

/// Strips the quotes the platform puts around UTF-8 SSIDs
pub fn unquote_ssid(ssid: &str) -> &str {
    if ssid.len() >= 2 && ssid.starts_with('"') && ssid.ends_with('"') {
        &ssid[1..ssid.len() - 1]
    } else {
        ssid
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WifiLockMode {
    FullHighPerf,
    FullLowLatency,
}

impl Default for WifiLockMode {
    fn default() -> Self {
        WifiLockMode::FullHighPerf
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WifiLockId(pub u64);

/// Scan completion is announced with an [`ACTION_SCAN_RESULTS_AVAILABLE`]
/// broadcast.
pub trait WifiPlatform: Send + Sync {
    fn is_enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool) -> bool;

    fn start_scan(&self) -> bool;
    fn scan_results(&self) -> Vec<WifiScanResult>;

    /// Returns the new network id, or `None` if the platform rejected the
    /// configuration.
    fn add_network(&self, config: &WifiNetworkConfig) -> Option<i32>;
    fn enable_network(&self, network_id: i32, attempt_connect: bool) -> bool;
    fn remove_network(&self, network_id: i32) -> bool;
    fn configured_networks(&self) -> Vec<ConfiguredNetwork>;
    fn connection_info(&self) -> WifiConnectionInfo;

    fn acquire_lock(&self, mode: WifiLockMode, tag: &str) -> Result<WifiLockId>;
    fn release_lock(&self, lock: WifiLockId);
}

pub struct WifiSnippet {
    ctx: SnippetContext,
    platform: Arc<dyn WifiPlatform>,
    lock: StdMutex<Option<WifiLockId>>,
}

impl WifiSnippet {
    pub fn new(ctx: &SnippetContext) -> Self {
        Self { ctx: ctx.clone(),
               platform: ctx.services().wifi.clone(),
               lock: StdMutex::new(None) }
    }

    fn check_enabled(&self) -> Result<()> {
        if self.platform.is_enabled() {
            Ok(())
        } else {
            Err(Error::precondition("WiFi is not enabled"))
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.platform.is_enabled()
    }

    async fn toggle(&self, enable: bool) -> Result<()> {
        if self.platform.is_enabled() == enable {
            debug!("WiFi already {}", if enable { "enabled" } else { "disabled" });
            return Ok(());
        }
        if !self.platform.set_enabled(enable) {
            return Err(Error::platform_refused("WifiManager.setWifiEnabled"));
        }
        let platform = self.platform.clone();
        poll::wait_for(if enable { "WiFi to turn on" } else { "WiFi to turn off" },
                       || Ok(platform.is_enabled() == enable),
                       TOGGLE_TIMEOUT).await?;
        info!("WiFi {}", if enable { "enabled" } else { "disabled" });
        Ok(())
    }

    pub async fn enable(&self) -> Result<()> {
        self.toggle(true).await
    }

    pub async fn disable(&self) -> Result<()> {
        self.toggle(false).await
    }

    pub async fn scan_and_get_results(&self) -> Result<Vec<WifiScanResult>> {
        self.check_enabled()?;
        let available = Arc::new(AtomicBool::new(false));
        let receiver: Arc<dyn Listener> = {
            let available = available.clone();
            Arc::new(move |_: &str, extras: Bundle| {
                if extras.get_bool(EXTRA_RESULTS_UPDATED) == Some(false) {
                    warn!("WiFi scan finished without fresh results");
                }
                available.store(true, Ordering::SeqCst);
            })
        };
        let _guard = ReceiverGuard::register(&self.ctx.services().broadcasts,
                                             &[ACTION_SCAN_RESULTS_AVAILABLE],
                                             receiver)?;
        if !self.platform.start_scan() {
            return Err(Error::platform_refused("WifiManager.startScan"));
        }
        poll::wait_for("WiFi scan results",
                       || Ok(available.load(Ordering::SeqCst)),
                       SCAN_TIMEOUT).await?;
        let results = self.platform.scan_results();
        info!("WiFi scan found {} networks", results.len());
        Ok(results)
    }

    /// Connects to `ssid` (open network when there's no password) and waits
    /// for the association.
    pub async fn connect_simple(&self, ssid: &str, password: Option<String>) -> Result<()> {
        self.check_enabled()?;
        if self.platform.connection_info().is_connected_to(ssid) {
            debug!("Already connected to {}", ssid);
            return Ok(());
        }
        let config = WifiNetworkConfig { ssid: ssid.to_string(),
                                         password,
                                         hidden: false };
        let network_id = self.platform
                             .add_network(&config)
                             .ok_or_else(|| Error::platform_refused("WifiManager.addNetwork"))?;
        if !self.platform.enable_network(network_id, true) {
            return Err(Error::platform_refused("WifiManager.enableNetwork"));
        }
        let platform = self.platform.clone();
        poll::wait_for(&format!("connection to {}", ssid),
                       || Ok(platform.connection_info().is_connected_to(ssid)),
                       CONNECTION_TIMEOUT).await?;
        info!("Connected to {}", ssid);
        Ok(())
    }

    pub fn connection_info(&self) -> WifiConnectionInfo {
        self.platform.connection_info()
    }

    /// Forgets every configured network named `ssid`
    pub fn remove_network(&self, ssid: &str) -> Result<()> {
        let ids: Vec<i32> = self.platform
                                .configured_networks()
                                .into_iter()
                                .filter(|n| unquote_ssid(&n.ssid) == ssid)
                                .map(|n| n.network_id)
                                .collect();
        if ids.is_empty() {
            return Err(Error::precondition(format!("No configured network named {:?}", ssid)));
        }
        for id in ids {
            if !self.platform.remove_network(id) {
                return Err(Error::platform_refused("WifiManager.removeNetwork"));
            }
        }
        Ok(())
    }

    pub fn acquire_lock(&self, mode: WifiLockMode) -> Result<()> {
        let mut lock = self.lock.lock().unwrap();
        if lock.is_some() {
            debug!("WiFi lock already held");
            return Ok(());
        }
        *lock = Some(self.platform.acquire_lock(mode, "snippets")?);
        Ok(())
    }

    pub fn release_lock(&self) {
        if let Some(id) = self.lock.lock().unwrap().take() {
            self.platform.release_lock(id);
        }
    }
}

#[async_trait]
impl Snippet for WifiSnippet {
    fn name(&self) -> &'static str {
        "wifi"
    }

    async fn call(&self, method: &str, args: &RpcArgs) -> Result<Value> {
        match method {
            "wifiIsEnabled" => to_value(self.is_enabled()),
            "wifiEnable" => to_value(self.enable().await?),
            "wifiDisable" => to_value(self.disable().await?),
            "wifiScanAndGetResults" => to_value(self.scan_and_get_results().await?),
            "wifiConnectSimple" => {
                let ssid: String = args.get(0)?;
                let password: Option<String> = args.get_opt(1)?;
                to_value(self.connect_simple(&ssid, password).await?)
            }
            "wifiGetConnectionInfo" => to_value(self.connection_info()),
            "wifiRemoveNetwork" => to_value(self.remove_network(&args.get::<String>(0)?)?),
            "wifiAcquireLock" => {
                let mode: WifiLockMode = args.get_opt(0)?.unwrap_or_default();
                to_value(self.acquire_lock(mode)?)
            }
            "wifiReleaseLock" => to_value(self.release_lock()),
            _ => Err(unknown_method(self.name(), method)),
        }
    }

    fn shutdown(&self) {
        self.release_lock();
        self.ctx.bridge().unregister_owned(self.name());
    }
}
