//! BLE scanning, streamed back to the caller as events

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::{Listener, ListenerHandle, Retention};
use crate::rpc::{to_value, unknown_method, RpcArgs, Snippet};
use crate::uuid::parse_uuid;
use crate::{Address, Error, Result, SnippetContext};

pub const EVENT_SCAN_RESULT: &str = "onScanResult";
pub const EVENT_BATCH_SCAN_RESULT: &str = "onBatchScanResult";
pub const EVENT_SCAN_FAILED: &str = "onScanFailed";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScanFilter {
    pub device_name: Option<String>,
    pub device_address: Option<Address>,
    /// Full or short form service uuid
    pub service_uuid: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeScanMode {
    Opportunistic,
    LowPower,
    Balanced,
    LowLatency,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScanSettings {
    pub scan_mode: LeScanMode,
    /// Zero delivers results one by one, anything else batches them
    pub report_delay_ms: u64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self { scan_mode: LeScanMode::LowPower,
               report_delay_ms: 0 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScanToken(pub u64);

/// Results and failures are delivered to `callback` as [`EVENT_SCAN_RESULT`],
/// [`EVENT_BATCH_SCAN_RESULT`] and [`EVENT_SCAN_FAILED`] events.
pub trait LeScannerPlatform: Send + Sync {
    fn start_scan(&self, filters: &[ScanFilter], settings: &ScanSettings,
                  callback: Arc<dyn Listener>)
                  -> Result<ScanToken>;
    fn stop_scan(&self, token: ScanToken);
}

pub struct LeScannerSnippet {
    ctx: SnippetContext,
    platform: Arc<dyn LeScannerPlatform>,
}

impl LeScannerSnippet {
    pub fn new(ctx: &SnippetContext) -> Self {
        Self { ctx: ctx.clone(),
               platform: ctx.services().le_scanner.clone() }
    }

    pub fn start_scan(&self, callback_id: &str, filters: Vec<ScanFilter>,
                      settings: ScanSettings)
                      -> Result<()> {
        if !self.ctx.services().bluetooth.is_enabled() {
            return Err(Error::precondition("Bluetooth is not enabled"));
        }
        for filter in &filters {
            if let Some(uuid) = &filter.service_uuid {
                parse_uuid(uuid)?;
            }
        }
        let platform = self.platform.clone();
        self.ctx.bridge().register(callback_id, self.name(), Retention::Transient, |sink| {
                             let token = platform.start_scan(&filters, &settings, Arc::new(sink))?;
                             Ok(ListenerHandle::new(move || platform.stop_scan(token)))
                         })?;
        info!("Started BLE scan {}", callback_id);
        Ok(())
    }

    pub fn stop_scan(&self, callback_id: &str) {
        if !self.ctx.bridge().is_registered(callback_id) {
            debug!("No BLE scan running for {}", callback_id);
        }
        self.ctx.bridge().unregister(callback_id);
    }
}

#[async_trait]
impl Snippet for LeScannerSnippet {
    fn name(&self) -> &'static str {
        "ble_scanner"
    }

    async fn call(&self, method: &str, args: &RpcArgs) -> Result<Value> {
        match method {
            "bleStartScan" => {
                let callback_id: String = args.get(0)?;
                let filters: Vec<ScanFilter> = args.get_opt(1)?.unwrap_or_default();
                let settings: ScanSettings = args.get_opt(2)?.unwrap_or_default();
                to_value(self.start_scan(&callback_id, filters, settings)?)
            }
            "bleStopScan" => to_value(self.stop_scan(&args.get::<String>(0)?)),
            _ => Err(unknown_method(self.name(), method)),
        }
    }

    fn shutdown(&self) {
        self.ctx.bridge().unregister_owned(self.name());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::fake::bluetooth::FakePeripheral;
    use crate::fake::FakePlatform;
    use crate::{ContextConfig, Platform};

    fn setup() -> (FakePlatform, SnippetContext, LeScannerSnippet) {
        let fake = FakePlatform::new();
        let mut config = ContextConfig::new();
        config.set_platform(Platform::Fake(fake.clone()));
        let ctx = config.start().unwrap();
        let snippet = LeScannerSnippet::new(&ctx);
        (fake, ctx, snippet)
    }

    #[tokio::test]
    async fn results_stream_until_stopped() {
        let (fake, ctx, snippet) = setup();
        fake.le.add_peripheral(FakePeripheral::new("hrm", "C0:FF:EE:00:00:01").with_rssi(-50));

        let args = RpcArgs::new(vec![json!("scan1"), json!([{"deviceName": "hrm"}])]);
        snippet.call("bleStartScan", &args).await.unwrap();
        assert_eq!(fake.le.active_scans(), 1);

        let first = ctx.bridge()
                       .wait_and_get("scan1", EVENT_SCAN_RESULT, Duration::from_secs(1))
                       .await
                       .unwrap();
        assert_eq!(first.data.get_str("deviceName"), Some("hrm"));

        // Results showing up later, from another thread
        let le = fake.le.clone();
        std::thread::spawn(move || {
            le.add_peripheral(FakePeripheral::new("hrm", "C0:FF:EE:00:00:02"));
            le.add_peripheral(FakePeripheral::new("other", "C0:FF:EE:00:00:03"));
        }).join()
          .unwrap();
        let later = ctx.bridge().get_all("scan1", EVENT_SCAN_RESULT);
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].data.get_str("address"), Some("C0:FF:EE:00:00:02"));

        snippet.call("bleStopScan", &RpcArgs::new(vec![json!("scan1")])).await.unwrap();
        assert_eq!(fake.le.active_scans(), 0);
        // stopping twice is harmless
        snippet.stop_scan("scan1");
    }

    #[test]
    fn duplicate_scan_id_is_rejected() {
        let (fake, _ctx, snippet) = setup();
        snippet.start_scan("scan", vec![], ScanSettings::default()).unwrap();
        let err = snippet.start_scan("scan", vec![], ScanSettings::default()).unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered(_)));
        assert_eq!(fake.le.active_scans(), 1);
        snippet.shutdown();
        assert_eq!(fake.le.active_scans(), 0);
    }

    #[test]
    fn platform_failures_surface_as_events() {
        let (fake, ctx, snippet) = setup();
        fake.le.fail_next_scan(2);
        snippet.start_scan("scan", vec![], ScanSettings::default()).unwrap();
        let failed = ctx.bridge().get_all("scan", EVENT_SCAN_FAILED);
        assert_eq!(failed[0].data.get_int("ErrorCode"), Some(2));
    }

    #[test]
    fn preconditions() {
        let (fake, _ctx, snippet) = setup();
        let bad = ScanFilter { service_uuid: Some("nope".to_string()),
                               ..Default::default() };
        assert!(matches!(snippet.start_scan("scan", vec![bad], ScanSettings::default()),
                         Err(Error::InvalidArgument(_))));

        fake.bluetooth.set_enabled(false);
        assert!(matches!(snippet.start_scan("scan", vec![], ScanSettings::default()),
                         Err(Error::Precondition(_))));
        assert_eq!(fake.le.active_scans(), 0);
    }
}
