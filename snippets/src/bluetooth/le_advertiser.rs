use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::{Listener, ListenerHandle, Retention};
use crate::rpc::{to_value, unknown_method, RpcArgs, Snippet};
use crate::uuid::parse_uuid;
use crate::{Error, Result, SnippetContext};

pub const EVENT_START_SUCCESS: &str = "onStartSuccess";
pub const EVENT_START_FAILURE: &str = "onStartFailure";

/// Platform error code for an advertisement that doesn't fit a legacy PDU
pub const ADVERTISE_FAILED_DATA_TOO_LARGE: i32 = 1;

/// Payload budget of a legacy advertising PDU
pub const MAX_LEGACY_ADVERTISING_BYTES: usize = 31;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvertiseMode {
    LowPower,
    Balanced,
    LowLatency,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxPowerLevel {
    UltraLow,
    Low,
    Medium,
    High,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdvertiseSettings {
    pub mode: AdvertiseMode,
    pub tx_power_level: TxPowerLevel,
    pub connectable: bool,
    /// Zero advertises until stopped
    pub timeout_ms: u32,
}

impl Default for AdvertiseSettings {
    fn default() -> Self {
        Self { mode: AdvertiseMode::LowPower,
               tx_power_level: TxPowerLevel::Medium,
               connectable: true,
               timeout_ms: 0 }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdvertiseData {
    pub include_device_name: bool,
    pub include_tx_power_level: bool,
    pub service_uuids: Vec<String>,
    pub manufacturer_id: Option<u16>,
    pub manufacturer_data: Vec<u8>,
}

impl AdvertiseData {
    fn validate(&self) -> Result<()> {
        for uuid in &self.service_uuids {
            parse_uuid(uuid)?;
        }
        if !self.manufacturer_data.is_empty() && self.manufacturer_id.is_none() {
            return Err(Error::InvalidArgument("manufacturer data needs a manufacturer id"
                                                  .to_string()));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AdvertiseToken(pub u64);

/// The outcome of starting is reported to `callback` as either
/// [`EVENT_START_SUCCESS`] or [`EVENT_START_FAILURE`] (with an `ErrorCode`).
pub trait LeAdvertiserPlatform: Send + Sync {
    fn start_advertising(&self, settings: &AdvertiseSettings, data: &AdvertiseData,
                         scan_response: Option<&AdvertiseData>, callback: Arc<dyn Listener>)
                         -> Result<AdvertiseToken>;
    fn stop_advertising(&self, token: AdvertiseToken);
}

pub struct LeAdvertiserSnippet {
    ctx: SnippetContext,
    platform: Arc<dyn LeAdvertiserPlatform>,
}

impl LeAdvertiserSnippet {
    pub fn new(ctx: &SnippetContext) -> Self {
        Self { ctx: ctx.clone(),
               platform: ctx.services().le_advertiser.clone() }
    }

    pub fn start_advertising(&self, callback_id: &str, settings: AdvertiseSettings,
                             data: AdvertiseData, scan_response: Option<AdvertiseData>)
                             -> Result<()> {
        if !self.ctx.services().bluetooth.is_enabled() {
            return Err(Error::precondition("Bluetooth is not enabled"));
        }
        data.validate()?;
        if let Some(scan_response) = &scan_response {
            scan_response.validate()?;
        }
        let platform = self.platform.clone();
        self.ctx.bridge().register(callback_id, self.name(), Retention::Transient, |sink| {
                             let token = platform.start_advertising(&settings,
                                                                    &data,
                                                                    scan_response.as_ref(),
                                                                    Arc::new(sink))?;
                             Ok(ListenerHandle::new(move || platform.stop_advertising(token)))
                         })?;
        info!("Started advertising {}", callback_id);
        Ok(())
    }

    pub fn stop_advertising(&self, callback_id: &str) {
        self.ctx.bridge().unregister(callback_id);
    }
}

#[async_trait]
impl Snippet for LeAdvertiserSnippet {
    fn name(&self) -> &'static str {
        "ble_advertiser"
    }

    async fn call(&self, method: &str, args: &RpcArgs) -> Result<Value> {
        match method {
            "bleStartAdvertising" => {
                let callback_id: String = args.get(0)?;
                let settings: AdvertiseSettings = args.get_opt(1)?.unwrap_or_default();
                let data: AdvertiseData = args.get_opt(2)?.unwrap_or_default();
                let scan_response: Option<AdvertiseData> = args.get_opt(3)?;
                to_value(self.start_advertising(&callback_id, settings, data, scan_response)?)
            }
            "bleStopAdvertising" => to_value(self.stop_advertising(&args.get::<String>(0)?)),
            _ => Err(unknown_method(self.name(), method)),
        }
    }

    fn shutdown(&self) {
        self.ctx.bridge().unregister_owned(self.name());
    }
}
