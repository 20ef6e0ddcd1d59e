use std::fmt;
use std::hash::Hash;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, trace};

use crate::account::AccountPlatform;
use crate::bluetooth::gatt_client::GattPlatform;
use crate::bluetooth::le_advertiser::LeAdvertiserPlatform;
use crate::bluetooth::le_scanner::LeScannerPlatform;
use crate::bluetooth::BluetoothPlatform;
use crate::event::{BridgeConfig, EventBridge, Listener, ListenerHandle};
use crate::fake::FakePlatform;
use crate::media::MediaPlatform;
use crate::notification::NotificationPlatform;
use crate::sms::SmsPlatform;
use crate::telephony::TelephonyPlatform;
use crate::ui::UiDevice;
use crate::wifi::aware::WifiAwarePlatform;
use crate::wifi::p2p::WifiP2pPlatform;
use crate::wifi::WifiPlatform;
use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ReceiverId(pub u64);

/// System broadcast delivery (think `Context.registerReceiver`)
///
/// The receiver is called with the broadcast action as the event name and
/// the broadcast extras as payload, on whatever thread the platform uses.
pub trait BroadcastService: Send + Sync {
    fn register_receiver(&self, actions: &[&str], receiver: Arc<dyn Listener>)
                         -> Result<ReceiverId>;
    fn unregister_receiver(&self, id: ReceiverId);
}

/// Unregisters a broadcast receiver when dropped, whichever way the
/// operation that registered it ends.
pub struct ReceiverGuard {
    service: Arc<dyn BroadcastService>,
    id: Option<ReceiverId>,
}

impl ReceiverGuard {
    pub fn register(service: &Arc<dyn BroadcastService>, actions: &[&str],
                    receiver: Arc<dyn Listener>)
                    -> Result<Self> {
        let id = service.register_receiver(actions, receiver)?;
        trace!("Registered receiver {:?} for {:?}", id, actions);
        Ok(Self { service: service.clone(), id: Some(id) })
    }

    /// Hands the registration over to the event bridge
    pub fn into_handle(mut self) -> ListenerHandle {
        let service = self.service.clone();
        match self.id.take() {
            Some(id) => ListenerHandle::new(move || service.unregister_receiver(id)),
            None => ListenerHandle::noop(),
        }
    }
}

impl Drop for ReceiverGuard {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            trace!("Unregistering receiver {:?}", id);
            self.service.unregister_receiver(id);
        }
    }
}

/// Handles to every platform service a snippet may talk to
#[derive(Clone)]
pub struct PlatformServices {
    pub broadcasts: Arc<dyn BroadcastService>,
    pub bluetooth: Arc<dyn BluetoothPlatform>,
    pub le_scanner: Arc<dyn LeScannerPlatform>,
    pub le_advertiser: Arc<dyn LeAdvertiserPlatform>,
    pub gatt: Arc<dyn GattPlatform>,
    pub wifi: Arc<dyn WifiPlatform>,
    pub wifi_aware: Arc<dyn WifiAwarePlatform>,
    pub wifi_p2p: Arc<dyn WifiP2pPlatform>,
    pub telephony: Arc<dyn TelephonyPlatform>,
    pub sms: Arc<dyn SmsPlatform>,
    pub accounts: Arc<dyn AccountPlatform>,
    pub media: Arc<dyn MediaPlatform>,
    pub notifications: Arc<dyn NotificationPlatform>,
    pub ui: Arc<dyn UiDevice>,
}

impl fmt::Debug for PlatformServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformServices").finish_non_exhaustive()
    }
}

pub enum Platform {
    /// In-memory fakes; keep a clone of the [`FakePlatform`] to drive it
    Fake(FakePlatform),
    Custom(PlatformServices),
}

pub struct ContextConfig {
    platform: Platform,
    bridge: BridgeConfig,
    storage_root: PathBuf,
}

impl ContextConfig {
    /// Starts out with a fresh fake platform and the system temp directory
    /// as storage root.
    pub fn new() -> ContextConfig {
        ContextConfig { platform: Platform::Fake(FakePlatform::new()),
                        bridge: BridgeConfig::default(),
                        storage_root: std::env::temp_dir() }
    }

    pub fn set_platform(&mut self, platform: Platform) -> &mut Self {
        self.platform = platform;
        self
    }

    pub fn set_bridge_config(&mut self, config: BridgeConfig) -> &mut Self {
        self.bridge = config;
        self
    }

    /// Directory that file operations of the storage snippet are confined to
    pub fn set_storage_root(&mut self, root: impl Into<PathBuf>) -> &mut Self {
        self.storage_root = root.into();
        self
    }

    pub fn start(self) -> Result<SnippetContext> {
        SnippetContext::start(self)
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns everything snippets share: the event bridge and the platform
/// service handles. Cloning is cheap and all clones refer to the same
/// context.
#[derive(Clone, Debug)]
pub struct SnippetContext {
    inner: Arc<ContextInner>,
}
impl PartialEq for SnippetContext {
    fn eq(&self, other: &SnippetContext) -> bool {
        Arc::<ContextInner>::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for SnippetContext {}
impl Hash for SnippetContext {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::<ContextInner>::as_ptr(&self.inner), state);
    }
}
impl Deref for SnippetContext {
    type Target = ContextInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[derive(Debug)]
pub struct ContextInner {
    bridge: EventBridge,
    services: PlatformServices,
    storage_root: PathBuf,
}

impl SnippetContext {
    fn start(config: ContextConfig) -> Result<Self> {
        let services = match config.platform {
            Platform::Fake(fake) => fake.services(),
            Platform::Custom(services) => services,
        };
        std::fs::create_dir_all(&config.storage_root)?;
        info!("Starting snippet context, storage root {:?}", config.storage_root);
        Ok(SnippetContext { inner: Arc::new(ContextInner { bridge: EventBridge::new(config.bridge),
                                                           services,
                                                           storage_root: config.storage_root }) })
    }

    pub fn bridge(&self) -> &EventBridge {
        &self.bridge
    }

    pub fn services(&self) -> &PlatformServices {
        &self.services
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    /// Releases every outstanding registration, lifetime ones included
    pub fn shutdown(&self) {
        info!("Shutting down snippet context");
        self.bridge.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::Bundle;

    #[test]
    fn context_eq() {
        let ctx0 = ContextConfig::new().start().unwrap();
        let ctx1 = ContextConfig::new().start().unwrap();
        assert_ne!(ctx0, ctx1);
        assert_eq!(ctx0, ctx0.clone());
    }

    #[test]
    fn receiver_guard_unregisters_on_every_path() {
        let fake = FakePlatform::new();
        let broadcasts: Arc<dyn BroadcastService> = fake.broadcasts.clone();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let receiver: Arc<dyn Listener> = Arc::new(move |_: &str, _: Bundle| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        {
            let _guard = ReceiverGuard::register(&broadcasts, &["ping"], receiver.clone()).unwrap();
            fake.broadcasts.send("ping", Bundle::new());
            fake.broadcasts.send("pong", Bundle::new());
        }
        fake.broadcasts.send("ping", Bundle::new());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(fake.broadcasts.receiver_count(), 0);

        let handle = ReceiverGuard::register(&broadcasts, &["ping"], receiver).unwrap()
                                                                             .into_handle();
        assert_eq!(fake.broadcasts.receiver_count(), 1);
        drop(handle);
        assert_eq!(fake.broadcasts.receiver_count(), 0);
    }
}
