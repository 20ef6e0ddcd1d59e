use std::time::Duration;

use futures::StreamExt;
use log::{info, warn};
use serde_json::json;
use snippets::bluetooth::le_scanner::EVENT_SCAN_RESULT;
use snippets::fake::bluetooth::FakePeripheral;
use snippets::fake::FakePlatform;
use snippets::{ContextConfig, Platform, SnippetRegistry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::builder().filter_level(log::LevelFilter::Info) // Default Log Level
                         .parse_default_env()
                         .init();

    let fake = FakePlatform::new();
    fake.le.add_peripheral(FakePeripheral::new("hrm", "F1:E2:D3:C4:B5:A6").with_rssi(-48));
    fake.wifi.add_access_point("fake-ap", "02:11:22:33:44:55", Some("hunter2"));

    let mut config = ContextConfig::new();
    config.set_platform(Platform::Fake(fake.clone()));
    let ctx = config.start()?;
    let registry = SnippetRegistry::with_all(&ctx);
    info!("Snippets: {:?}", registry.names());

    let address = registry.call("bluetooth", "btGetAddress", vec![]).await?;
    info!("Bluetooth address: {}", address);

    registry.call("ble_scanner", "bleStartScan", vec![json!("tour-scan")]).await?;
    // Arrives while the scan is running
    fake.le.add_peripheral(FakePeripheral::new("thermometer", "F1:E2:D3:C4:B5:A7"));

    let results = ctx.bridge().events("tour-scan", EVENT_SCAN_RESULT).take(2);
    futures::pin_mut!(results);
    loop {
        match tokio::time::timeout(Duration::from_secs(1), results.next()).await {
            Ok(Some(event)) => info!("Scan result: {}", serde_json::to_string(&event.data)?),
            Ok(None) => break,
            Err(_) => {
                warn!("No more scan results");
                break;
            }
        }
    }
    registry.call("ble_scanner", "bleStopScan", vec![json!("tour-scan")]).await?;

    registry.call("wifi", "wifiConnectSimple", vec![json!("fake-ap"), json!("hunter2")]).await?;
    let info = registry.call("wifi", "wifiGetConnectionInfo", vec![]).await?;
    info!("WiFi: {}", info);

    registry.shutdown_all();
    ctx.shutdown();
    Ok(())
}
