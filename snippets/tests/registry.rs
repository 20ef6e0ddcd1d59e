use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use snippets::bluetooth::gatt_client::CharacteristicProperties;
use snippets::fake::bluetooth::FakePeripheral;
use snippets::fake::FakePlatform;
use snippets::uuid::uuid_from_u16;
use snippets::{ContextConfig, Error, Platform, SnippetContext, SnippetRegistry};

const WAIT_MS: u64 = 5000;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn start() -> (FakePlatform, SnippetContext, SnippetRegistry) {
    init_logging();
    let fake = FakePlatform::new();
    let mut config = ContextConfig::new();
    config.set_platform(Platform::Fake(fake.clone()));
    let ctx = config.start().unwrap();
    let registry = SnippetRegistry::with_all(&ctx);
    (fake, ctx, registry)
}

async fn wait_event(registry: &SnippetRegistry, callback_id: &str, name: &str) -> Value {
    registry.call("events", "eventWaitAndGet", vec![json!(callback_id), json!(name),
                                                    json!(WAIT_MS)])
            .await
            .unwrap()
}

#[tokio::test]
async fn ble_scan_results_reach_the_caller() {
    let (fake, _ctx, registry) = start();
    fake.le.add_peripheral(FakePeripheral::new("hrm", "F1:E2:D3:C4:B5:A6"));
    registry.call("ble_scanner", "bleStartScan", vec![json!("scan-1"), json!([]), json!({})])
            .await
            .unwrap();
    fake.le.add_peripheral(FakePeripheral::new("thermo", "F1:E2:D3:C4:B5:A7"));

    let first = wait_event(&registry, "scan-1", "onScanResult").await;
    let second = wait_event(&registry, "scan-1", "onScanResult").await;
    let mut names = vec![first["data"]["deviceName"].to_string(),
                         second["data"]["deviceName"].to_string()];
    names.sort();
    assert_eq!(names, vec!["\"hrm\"", "\"thermo\""]);

    registry.call("ble_scanner", "bleStopScan", vec![json!("scan-1")]).await.unwrap();
    assert_eq!(fake.le.active_scans(), 0);
}

#[tokio::test(start_paused = true)]
async fn gatt_read_through_the_registry() {
    let (fake, ctx, registry) = start();
    let service = uuid_from_u16(0x180F);
    let level = uuid_from_u16(0x2A19);
    fake.le.add_peripheral(FakePeripheral::new("battery", "0A:0B:0C:0D:0E:0F")
                               .with_service(service, &[(level, CharacteristicProperties::READ)])
                               .with_value(level, &[87]));

    registry.call("gatt_client", "bleConnectGatt", vec![json!("g"), json!("0a:0b:0c:0d:0e:0f")])
            .await
            .unwrap();
    registry.call("gatt_client", "bleReadCharacteristic",
                  vec![json!("g"), json!("180F"), json!("2A19")])
            .await
            .unwrap();
    let reads = ctx.bridge().events("g", "onCharacteristicRead");
    futures::pin_mut!(reads);
    let read = reads.next().await.unwrap();
    assert_eq!(read.data.get_bytes("value"), Some(&[87u8][..]));

    registry.call("gatt_client", "bleDisconnect", vec![json!("g")]).await.unwrap();
    assert_eq!(fake.le.open_gatt_clients(), 0);
    let err = registry.call("gatt_client", "bleReadCharacteristic",
                            vec![json!("g"), json!("180F"), json!("2A19")])
                      .await
                      .unwrap_err();
    assert!(matches!(err, Error::Precondition(_)));
}

#[tokio::test]
async fn teardown_keeps_lifetime_listeners_until_shutdown() {
    let (fake, ctx, registry) = start();
    registry.call("ble_scanner", "bleStartScan", vec![json!("scan"), json!([]), json!({})])
            .await
            .unwrap();
    registry.call("sms", "asyncWaitForSms", vec![json!("inbox")]).await.unwrap();

    registry.shutdown_all();
    assert_eq!(fake.le.active_scans(), 0);
    assert!(!ctx.bridge().is_registered("scan"));
    assert!(ctx.bridge().is_registered("inbox"));

    fake.sms.deliver("+15555550199", "still listening");
    let sms = wait_event(&registry, "inbox", "ReceivedSms").await;
    assert_eq!(sms["data"]["MessageBody"], "still listening");

    ctx.shutdown();
    assert!(!ctx.bridge().is_registered("inbox"));
    assert_eq!(fake.broadcasts.receiver_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn timeouts_are_distinct_from_failures() {
    let (fake, _ctx, registry) = start();
    let err = registry.call("events", "eventWaitAndGet", vec![json!("nobody"), json!("onX"),
                                                              json!(1000)])
                      .await
                      .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));

    fake.bluetooth.set_enabled(false);
    fake.bluetooth.set_settle_polls(u32::MAX);
    let err = registry.call("bluetooth", "btEnable", vec![]).await.unwrap_err();
    assert!(matches!(err, Error::Timeout { timeout, .. } if timeout == Duration::from_secs(30)));
    assert_eq!(err.to_string(), "Timed out after 30s waiting for Bluetooth to turn on");

    // Platform status codes make it into what the caller sees
    let err = registry.call("gatt_client", "bleConnectGatt",
                            vec![json!("nowhere"), json!("C0:FF:EE:00:00:01")])
                      .await
                      .unwrap_err();
    assert!(!matches!(err, Error::Timeout { .. }));
    assert!(err.to_string().contains("BluetoothGatt.connect failed: platform status code 133"),
            "{}", err);
}

#[tokio::test]
async fn storage_round_trip_over_rpc() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut config = ContextConfig::new();
    config.set_storage_root(dir.path());
    let ctx = config.start().unwrap();
    let registry = SnippetRegistry::with_all(&ctx);

    registry.call("storage", "fileWriteText", vec![json!("notes/a.txt"), json!("hi")])
            .await
            .unwrap();
    assert_eq!(registry.call("storage", "fileReadText", vec![json!("notes/a.txt")])
                       .await
                       .unwrap(),
               json!("hi"));
    assert_eq!(registry.call("storage", "fileList", vec![json!("notes")]).await.unwrap(),
               json!(["a.txt"]));
}
