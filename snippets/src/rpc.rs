//! The surface snippets present to the remote caller
//!
//! Transport and dispatch of incoming calls belong to the harness; this
//! module only defines what a snippet looks like from its side: a name, a
//! set of methods taking positional JSON arguments, and a shutdown hook.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::account::AccountSnippet;
use crate::bluetooth::gatt_client::GattClientSnippet;
use crate::bluetooth::le_advertiser::LeAdvertiserSnippet;
use crate::bluetooth::le_scanner::LeScannerSnippet;
use crate::bluetooth::BluetoothAdapterSnippet;
use crate::media::MediaSnippet;
use crate::notification::NotificationSnippet;
use crate::sms::SmsSnippet;
use crate::storage::StorageSnippet;
use crate::telephony::TelephonySnippet;
use crate::transfer::TransferSnippet;
use crate::ui::UiSnippet;
use crate::wifi::aware::WifiAwareSnippet;
use crate::wifi::p2p::WifiP2pSnippet;
use crate::wifi::WifiSnippet;
use crate::{Error, Result, SnippetContext};

#[async_trait]
pub trait Snippet: Send + Sync {
    fn name(&self) -> &'static str;

    /// Invokes `method`. Unknown methods fail with [`Error::UnknownMethod`].
    async fn call(&self, method: &str, args: &RpcArgs) -> Result<Value>;

    /// Releases listeners and platform resources held by the snippet
    fn shutdown(&self) {}
}

/// Positional JSON arguments of one call
#[derive(Clone, Debug, Default)]
pub struct RpcArgs {
    values: Vec<Value>,
}

impl RpcArgs {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        match self.get_opt(index)? {
            Some(value) => Ok(value),
            None => Err(Error::InvalidArgument(format!("missing argument #{}", index))),
        }
    }

    /// Like `get` but a missing or `null` argument is `None`
    pub fn get_opt<T: DeserializeOwned>(&self, index: usize) -> Result<Option<T>> {
        match self.values.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|err| Error::InvalidArgument(format!("argument #{}: {}", index, err))),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<Vec<Value>> for RpcArgs {
    fn from(values: Vec<Value>) -> Self {
        Self::new(values)
    }
}

pub(crate) fn to_value<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

pub(crate) fn unknown_method(snippet: &str, method: &str) -> Error {
    Error::UnknownMethod(format!("{}.{}", snippet, method))
}

/// Gives remote callers access to the event bridge
pub struct EventSnippet {
    ctx: SnippetContext,
}

impl EventSnippet {
    pub fn new(ctx: &SnippetContext) -> Self {
        Self { ctx: ctx.clone() }
    }
}

#[async_trait]
impl Snippet for EventSnippet {
    fn name(&self) -> &'static str {
        "events"
    }

    async fn call(&self, method: &str, args: &RpcArgs) -> Result<Value> {
        let bridge = self.ctx.bridge();
        match method {
            "eventWaitAndGet" => {
                let callback_id: String = args.get(0)?;
                let name: String = args.get(1)?;
                let timeout_ms: u64 = args.get(2)?;
                let event = bridge.wait_and_get(&callback_id, &name,
                                                Duration::from_millis(timeout_ms))
                                  .await?;
                to_value(event)
            }
            "eventGetAll" => {
                let callback_id: String = args.get(0)?;
                let name: String = args.get(1)?;
                to_value(bridge.get_all(&callback_id, &name))
            }
            "eventDrain" => {
                let callback_id: String = args.get(0)?;
                to_value(bridge.drain(&callback_id))
            }
            "eventClear" => {
                let callback_id: String = args.get(0)?;
                bridge.clear(&callback_id);
                Ok(Value::Null)
            }
            _ => Err(unknown_method(self.name(), method)),
        }
    }
}

/// Looks snippets up by name on behalf of the caller
#[derive(Default)]
pub struct SnippetRegistry {
    snippets: BTreeMap<&'static str, Arc<dyn Snippet>>,
}

impl SnippetRegistry {
    pub fn new() -> Self {
        Self { snippets: BTreeMap::new() }
    }

    /// A registry holding every snippet in this crate, bound to `ctx`
    pub fn with_all(ctx: &SnippetContext) -> Self {
        let mut registry = Self::new();
        registry.add(Arc::new(EventSnippet::new(ctx)))
                .add(Arc::new(BluetoothAdapterSnippet::new(ctx)))
                .add(Arc::new(LeScannerSnippet::new(ctx)))
                .add(Arc::new(LeAdvertiserSnippet::new(ctx)))
                .add(Arc::new(GattClientSnippet::new(ctx)))
                .add(Arc::new(WifiSnippet::new(ctx)))
                .add(Arc::new(WifiAwareSnippet::new(ctx)))
                .add(Arc::new(WifiP2pSnippet::new(ctx)))
                .add(Arc::new(TelephonySnippet::new(ctx)))
                .add(Arc::new(SmsSnippet::new(ctx)))
                .add(Arc::new(AccountSnippet::new(ctx)))
                .add(Arc::new(MediaSnippet::new(ctx)))
                .add(Arc::new(StorageSnippet::new(ctx)))
                .add(Arc::new(NotificationSnippet::new(ctx)))
                .add(Arc::new(UiSnippet::new(ctx)))
                .add(Arc::new(TransferSnippet::new(ctx)));
        registry
    }

    pub fn add(&mut self, snippet: Arc<dyn Snippet>) -> &mut Self {
        debug!("Adding snippet {}", snippet.name());
        self.snippets.insert(snippet.name(), snippet);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Snippet>> {
        self.snippets
            .get(name)
            .cloned()
            .ok_or_else(|| Error::precondition(format!("No snippet named {:?}", name)))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.snippets.keys().copied().collect()
    }

    pub async fn call(&self, snippet: &str, method: &str, args: Vec<Value>) -> Result<Value> {
        self.get(snippet)?.call(method, &RpcArgs::new(args)).await
    }

    pub fn shutdown_all(&self) {
        for snippet in self.snippets.values() {
            info!("Shutting down snippet {}", snippet.name());
            snippet.shutdown();
        }
    }
}
