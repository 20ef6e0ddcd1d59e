//! WiFi Direct snippet

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;

use crate::context::ReceiverGuard;
use crate::event::{Listener, ListenerHandle, Retention};
use crate::poll::{self, CONNECTION_TIMEOUT};
use crate::rpc::{to_value, unknown_method, RpcArgs, Snippet};
use crate::{Address, Bundle, Error, Result, SnippetContext};

pub const ACTION_PEERS_CHANGED: &str = "android.net.wifi.p2p.PEERS_CHANGED";

pub const EVENT_PEERS_AVAILABLE: &str = "onPeersAvailable";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct P2pChannel(pub u64);

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct P2pDevice {
    pub device_name: String,
    pub device_address: Address,
    pub is_group_owner: bool,
}

impl P2pDevice {
    fn to_bundle(&self) -> Bundle {
        Bundle::new().with("deviceName", self.device_name.as_str())
                     .with("deviceAddress", self.device_address.to_string())
                     .with("isGroupOwner", self.is_group_owner)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct P2pConnectionInfo {
    pub group_formed: bool,
    pub is_group_owner: bool,
    pub group_owner_address: Option<String>,
}

/// Peer list changes are announced with an [`ACTION_PEERS_CHANGED`]
/// broadcast; the current list is then fetched with `request_peers`.
pub trait WifiP2pPlatform: Send + Sync {
    fn initialize(&self) -> Result<P2pChannel>;
    fn close(&self, channel: P2pChannel);

    fn discover_peers(&self, channel: P2pChannel) -> bool;
    fn stop_peer_discovery(&self, channel: P2pChannel) -> bool;
    fn request_peers(&self, channel: P2pChannel) -> Vec<P2pDevice>;

    fn connect(&self, channel: P2pChannel, address: &Address) -> bool;
    fn remove_group(&self, channel: P2pChannel) -> bool;
    fn connection_info(&self, channel: P2pChannel) -> P2pConnectionInfo;
}

pub struct WifiP2pSnippet {
    ctx: SnippetContext,
    platform: Arc<dyn WifiP2pPlatform>,
    channel: StdMutex<Option<P2pChannel>>,
}

impl WifiP2pSnippet {
    pub fn new(ctx: &SnippetContext) -> Self {
        Self { ctx: ctx.clone(),
               platform: ctx.services().wifi_p2p.clone(),
               channel: StdMutex::new(None) }
    }

    pub fn initialize(&self) -> Result<()> {
        let mut channel = self.channel.lock().unwrap();
        if channel.is_none() {
            *channel = Some(self.platform.initialize()?);
            info!("WiFi P2P channel initialized");
        }
        Ok(())
    }

    fn channel(&self) -> Result<P2pChannel> {
        self.channel
            .lock()
            .unwrap()
            .ok_or_else(|| Error::precondition("WiFi P2P is not initialized, call p2pInitialize"))
    }

    /// Reports every peer list change on `callback_id` until stopped
    pub fn discover_peers(&self, callback_id: &str) -> Result<()> {
        let channel = self.channel()?;
        let platform = self.platform.clone();
        let broadcasts = self.ctx.services().broadcasts.clone();
        self.ctx.bridge().register(callback_id, self.name(), Retention::Transient, |sink| {
                             let receiver: Arc<dyn Listener> = {
                                 let platform = platform.clone();
                                 Arc::new(move |_: &str, _: Bundle| {
                                     let peers: Vec<Bundle> = platform.request_peers(channel)
                                                                      .iter()
                                                                      .map(P2pDevice::to_bundle)
                                                                      .collect();
                                     sink.emit(EVENT_PEERS_AVAILABLE,
                                               Bundle::new().with("peers", peers));
                                 })
                             };
                             let guard =
                                 ReceiverGuard::register(&broadcasts, &[ACTION_PEERS_CHANGED],
                                                         receiver)?;
                             if !platform.discover_peers(channel) {
                                 return Err(Error::platform_refused("WifiP2pManager.discoverPeers"));
                             }
                             let guard = guard.into_handle();
                             Ok(ListenerHandle::new(move || {
                                 if !platform.stop_peer_discovery(channel) {
                                     warn!("WiFi P2P peer discovery didn't stop cleanly");
                                 }
                                 drop(guard);
                             }))
                         })
    }

    pub fn stop_peer_discovery(&self, callback_id: &str) {
        self.ctx.bridge().unregister(callback_id);
    }

    pub async fn connect(&self, address: &Address) -> Result<P2pConnectionInfo> {
        let channel = self.channel()?;
        if !self.platform.connect(channel, address) {
            return Err(Error::platform_refused("WifiP2pManager.connect"));
        }
        let platform = self.platform.clone();
        poll::wait_for(&format!("P2P group with {}", address),
                       || Ok(platform.connection_info(channel).group_formed),
                       CONNECTION_TIMEOUT).await?;
        let info = self.platform.connection_info(channel);
        info!("P2P group formed with {}, group owner: {}", address, info.is_group_owner);
        Ok(info)
    }

    pub async fn remove_group(&self) -> Result<()> {
        let channel = self.channel()?;
        if !self.platform.connection_info(channel).group_formed {
            debug!("No P2P group to remove");
            return Ok(());
        }
        if !self.platform.remove_group(channel) {
            return Err(Error::platform_refused("WifiP2pManager.removeGroup"));
        }
        let platform = self.platform.clone();
        poll::wait_for("P2P group removal",
                       || Ok(!platform.connection_info(channel).group_formed),
                       CONNECTION_TIMEOUT).await
    }
}

#[async_trait]
impl Snippet for WifiP2pSnippet {
    fn name(&self) -> &'static str {
        "wifi_p2p"
    }

    async fn call(&self, method: &str, args: &RpcArgs) -> Result<Value> {
        match method {
            "p2pInitialize" => to_value(self.initialize()?),
            "p2pDiscoverPeers" => to_value(self.discover_peers(&args.get::<String>(0)?)?),
            "p2pStopPeerDiscovery" => to_value(self.stop_peer_discovery(&args.get::<String>(0)?)),
            "p2pConnect" => to_value(self.connect(&args.get::<Address>(0)?).await?),
            "p2pRemoveGroup" => to_value(self.remove_group().await?),
            _ => Err(unknown_method(self.name(), method)),
        }
    }

    fn shutdown(&self) {
        self.ctx.bridge().unregister_owned(self.name());
        if let Some(channel) = self.channel.lock().unwrap().take() {
            self.platform.close(channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::fake::FakePlatform;
    use crate::{ContextConfig, Platform};

    fn setup() -> (FakePlatform, SnippetContext, WifiP2pSnippet) {
        let fake = FakePlatform::new();
        let mut config = ContextConfig::new();
        config.set_platform(Platform::Fake(fake.clone()));
        let ctx = config.start().unwrap();
        let snippet = WifiP2pSnippet::new(&ctx);
        (fake, ctx, snippet)
    }

    #[tokio::test(start_paused = true)]
    async fn everything_needs_initialize() {
        let (_fake, _ctx, snippet) = setup();
        let peer: Address = "02:00:00:00:00:01".parse().unwrap();
        assert!(matches!(snippet.discover_peers("d"), Err(Error::Precondition(_))));
        assert!(matches!(snippet.connect(&peer).await, Err(Error::Precondition(_))));
        assert!(matches!(snippet.remove_group().await, Err(Error::Precondition(_))));
    }

    #[tokio::test]
    async fn peer_changes_become_events() {
        let (fake, ctx, snippet) = setup();
        snippet.call("p2pInitialize", &RpcArgs::default()).await.unwrap();
        fake.wifi_p2p.add_peer("tv", "02:00:00:00:00:01");
        snippet.call("p2pDiscoverPeers", &RpcArgs::new(vec![json!("d")])).await.unwrap();
        fake.wifi_p2p.add_peer("phone", "02:00:00:00:00:02");

        let events = ctx.bridge().get_all("d", EVENT_PEERS_AVAILABLE);
        assert_eq!(events.len(), 2);
        let latest = serde_json::to_value(&events[1].data).unwrap();
        assert_eq!(latest["peers"].as_array().unwrap().len(), 2);

        snippet.stop_peer_discovery("d");
        assert!(!fake.wifi_p2p.is_discovering());
        assert_eq!(fake.broadcasts.receiver_count(), 0);
        fake.wifi_p2p.add_peer("watch", "02:00:00:00:00:03");
        assert!(ctx.bridge().get_all("d", EVENT_PEERS_AVAILABLE).is_empty());
    }

    #[tokio::test]
    async fn refused_discovery_leaves_nothing_behind() {
        let (fake, ctx, snippet) = setup();
        snippet.initialize().unwrap();
        fake.wifi_p2p.set_refuse_discovery(true);
        assert!(matches!(snippet.discover_peers("d"), Err(Error::Platform { .. })));
        assert!(!ctx.bridge().is_registered("d"));
        assert_eq!(fake.broadcasts.receiver_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_and_remove_group() {
        let (fake, _ctx, snippet) = setup();
        snippet.initialize().unwrap();
        fake.wifi_p2p.add_peer("tv", "02:00:00:00:00:01");
        let info = snippet.connect(&"02:00:00:00:00:01".parse().unwrap()).await.unwrap();
        assert!(info.group_formed);
        snippet.remove_group().await.unwrap();
        snippet.shutdown();
        assert_eq!(fake.wifi_p2p.open_channels(), 0);
    }
}
