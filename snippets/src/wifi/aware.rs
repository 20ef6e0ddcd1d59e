//! WiFi Aware (neighbor awareness networking) snippet
//!
//! One attach session at a time. Publish and subscribe sessions hang off it,
//! each with its own callback id, and are closed together with it on detach.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use log::{debug, info};
use serde_json::Value;

use crate::event::{Listener, ListenerHandle, Retention};
use crate::rpc::{to_value, unknown_method, RpcArgs, Snippet};
use crate::{Bundle, Error, Result, SnippetContext};

pub const EVENT_ATTACHED: &str = "onAttached";
pub const EVENT_ATTACH_FAILED: &str = "onAttachFailed";
pub const EVENT_PUBLISH_STARTED: &str = "onPublishStarted";
pub const EVENT_SUBSCRIBE_STARTED: &str = "onSubscribeStarted";
pub const EVENT_SERVICE_DISCOVERED: &str = "onServiceDiscovered";
pub const EVENT_MESSAGE_RECEIVED: &str = "onMessageReceived";
pub const EVENT_SESSION_TERMINATED: &str = "onSessionTerminated";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AwareSessionId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DiscoverySessionId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscoveryKind {
    Publish,
    Subscribe,
}

/// The attach outcome is reported to the attach callback as
/// [`EVENT_ATTACHED`] or [`EVENT_ATTACH_FAILED`]; discovery sessions report
/// to their own callback.
pub trait WifiAwarePlatform: Send + Sync {
    fn is_available(&self) -> bool;
    fn attach(&self, callback: Arc<dyn Listener>) -> Result<AwareSessionId>;
    fn start_discovery(&self, session: AwareSessionId, kind: DiscoveryKind, service_name: &str,
                       callback: Arc<dyn Listener>)
                       -> Result<DiscoverySessionId>;
    fn close_discovery(&self, session: DiscoverySessionId);
    fn detach(&self, session: AwareSessionId);
}

#[derive(Debug)]
struct Attachment {
    callback_id: String,
    session: AwareSessionId,
    attached: Arc<AtomicBool>,
    // Set once the platform reported the attach as failed
    failed: Arc<AtomicBool>,
    discovery_ids: Vec<String>,
}

pub struct WifiAwareSnippet {
    ctx: SnippetContext,
    platform: Arc<dyn WifiAwarePlatform>,
    attachment: StdMutex<Option<Attachment>>,
}

impl WifiAwareSnippet {
    pub fn new(ctx: &SnippetContext) -> Self {
        Self { ctx: ctx.clone(),
               platform: ctx.services().wifi_aware.clone(),
               attachment: StdMutex::new(None) }
    }

    pub fn is_available(&self) -> bool {
        self.platform.is_available()
    }

    pub fn attach(&self, callback_id: &str) -> Result<()> {
        if !self.platform.is_available() {
            return Err(Error::precondition("WiFi Aware is not available"));
        }
        let mut attachment = self.attachment.lock().unwrap();
        if let Some(current) = attachment.as_ref() {
            if !current.failed.load(Ordering::SeqCst) {
                return Err(Error::precondition(format!("Already attached as {:?}",
                                                       current.callback_id)));
            }
            debug!("Replacing failed attachment {:?}", current.callback_id);
            self.ctx.bridge().unregister(&current.callback_id);
            *attachment = None;
        }

        let attached = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));
        let mut session = None;
        let platform = self.platform.clone();
        self.ctx.bridge().register(callback_id, self.name(), Retention::Transient, |sink| {
                             let tracker: Arc<dyn Listener> = {
                                 let attached = attached.clone();
                                 let failed = failed.clone();
                                 Arc::new(move |name: &str, data: Bundle| {
                                     if name == EVENT_ATTACHED {
                                         attached.store(true, Ordering::SeqCst);
                                     } else if name == EVENT_ATTACH_FAILED {
                                         failed.store(true, Ordering::SeqCst);
                                     }
                                     sink.emit(name, data);
                                 })
                             };
                             let id = platform.attach(tracker)?;
                             session = Some(id);
                             Ok(ListenerHandle::new(move || platform.detach(id)))
                         })?;
        let session =
            session.ok_or_else(|| Error::platform_refused("WifiAwareManager.attach"))?;
        *attachment = Some(Attachment { callback_id: callback_id.to_string(),
                                        session,
                                        attached,
                                        failed,
                                        discovery_ids: vec![] });
        info!("WiFi Aware attach requested as {}", callback_id);
        Ok(())
    }

    fn start_discovery(&self, callback_id: &str, kind: DiscoveryKind, service_name: &str)
                       -> Result<()> {
        let mut attachment = self.attachment.lock().unwrap();
        let current = match attachment.as_mut() {
            Some(current) if current.attached.load(Ordering::SeqCst) => current,
            _ => return Err(Error::precondition("WiFi Aware is not attached")),
        };
        let platform = self.platform.clone();
        let session = current.session;
        self.ctx.bridge().register(callback_id, self.name(), Retention::Transient, |sink| {
                             let id =
                                 platform.start_discovery(session, kind, service_name,
                                                          Arc::new(sink))?;
                             Ok(ListenerHandle::new(move || platform.close_discovery(id)))
                         })?;
        current.discovery_ids.push(callback_id.to_string());
        debug!("{:?} session {:?} for {:?} started", kind, callback_id, service_name);
        Ok(())
    }

    pub fn publish(&self, callback_id: &str, service_name: &str) -> Result<()> {
        self.start_discovery(callback_id, DiscoveryKind::Publish, service_name)
    }

    pub fn subscribe(&self, callback_id: &str, service_name: &str) -> Result<()> {
        self.start_discovery(callback_id, DiscoveryKind::Subscribe, service_name)
    }

    /// Closes a single discovery session, keeping the attachment
    pub fn close_session(&self, callback_id: &str) {
        if let Some(current) = self.attachment.lock().unwrap().as_mut() {
            current.discovery_ids.retain(|id| id != callback_id);
        }
        self.ctx.bridge().unregister(callback_id);
    }

    /// Tears the attachment down along with its discovery sessions. `callback_id`
    /// must be the id the attachment was made with.
    pub fn detach(&self, callback_id: &str) -> Result<()> {
        let attachment = {
            let mut attachment = self.attachment.lock().unwrap();
            match attachment.as_ref() {
                Some(current) if current.callback_id == callback_id => attachment.take(),
                _ => None,
            }
        };
        let attachment = attachment.ok_or_else(|| {
                                       Error::precondition(format!("Not attached as {:?}",
                                                                   callback_id))
                                   })?;
        let bridge = self.ctx.bridge();
        for id in &attachment.discovery_ids {
            bridge.unregister(id);
        }
        bridge.unregister(&attachment.callback_id);
        info!("WiFi Aware detached");
        Ok(())
    }
}

#[async_trait]
impl Snippet for WifiAwareSnippet {
    fn name(&self) -> &'static str {
        "wifi_aware"
    }

    async fn call(&self, method: &str, args: &RpcArgs) -> Result<Value> {
        match method {
            "wifiAwareIsAvailable" => to_value(self.is_available()),
            "wifiAwareAttach" => to_value(self.attach(&args.get::<String>(0)?)?),
            "wifiAwarePublish" => {
                let callback_id: String = args.get(0)?;
                let service_name: String = args.get(1)?;
                to_value(self.publish(&callback_id, &service_name)?)
            }
            "wifiAwareSubscribe" => {
                let callback_id: String = args.get(0)?;
                let service_name: String = args.get(1)?;
                to_value(self.subscribe(&callback_id, &service_name)?)
            }
            "wifiAwareCloseSession" => to_value(self.close_session(&args.get::<String>(0)?)),
            "wifiAwareDetach" => to_value(self.detach(&args.get::<String>(0)?)?),
            _ => Err(unknown_method(self.name(), method)),
        }
    }

    fn shutdown(&self) {
        self.attachment.lock().unwrap().take();
        self.ctx.bridge().unregister_owned(self.name());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::fake::FakePlatform;
    use crate::{ContextConfig, Platform};

    fn setup() -> (FakePlatform, SnippetContext, WifiAwareSnippet) {
        let fake = FakePlatform::new();
        let mut config = ContextConfig::new();
        config.set_platform(Platform::Fake(fake.clone()));
        let ctx = config.start().unwrap();
        let snippet = WifiAwareSnippet::new(&ctx);
        (fake, ctx, snippet)
    }

    #[tokio::test]
    async fn subscribe_discovers_peer_services() {
        let (fake, ctx, snippet) = setup();
        fake.wifi_aware.add_peer_service("printer", b"color");

        assert!(matches!(snippet.subscribe("sub", "printer"), Err(Error::Precondition(_))));
        snippet.attach("attach").unwrap();
        ctx.bridge()
           .wait_and_get("attach", EVENT_ATTACHED, Duration::from_secs(1))
           .await
           .unwrap();

        snippet.subscribe("sub", "printer").unwrap();
        let names: Vec<String> = ctx.bridge().drain("sub").into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec![EVENT_SUBSCRIBE_STARTED, EVENT_SERVICE_DISCOVERED]);

        snippet.publish("pub", "chat").unwrap();
        fake.wifi_aware.send_message("chat", b"hi");
        let messages = ctx.bridge().get_all("pub", EVENT_MESSAGE_RECEIVED);
        assert_eq!(messages[0].data.get_bytes("message"), Some(&b"hi"[..]));

        snippet.detach("attach").unwrap();
        assert_eq!(fake.wifi_aware.open_sessions(), 0);
        assert!(!ctx.bridge().is_registered("sub"));
    }

    #[test]
    fn attach_failures() {
        let (fake, ctx, snippet) = setup();
        fake.wifi_aware.set_fail_attach(true);
        snippet.attach("a").unwrap();
        assert_eq!(ctx.bridge().get_all("a", EVENT_ATTACH_FAILED).len(), 1);
        // An attachment that never came up can't host sessions
        assert!(matches!(snippet.publish("p", "svc"), Err(Error::Precondition(_))));

        // A failed attachment doesn't block the next attempt
        fake.wifi_aware.set_fail_attach(false);
        snippet.attach("a").unwrap();
        assert_eq!(ctx.bridge().get_all("a", EVENT_ATTACHED).len(), 1);
        assert!(matches!(snippet.attach("b"), Err(Error::Precondition(_))));
        snippet.detach("a").unwrap();
        assert!(!ctx.bridge().is_registered("a"));
        assert_eq!(fake.wifi_aware.open_sessions(), 0);

        fake.wifi_aware.set_available(false);
        assert!(matches!(snippet.attach("c"), Err(Error::Precondition(_))));
        assert!(matches!(snippet.detach("c"), Err(Error::Precondition(_))));
    }
}
