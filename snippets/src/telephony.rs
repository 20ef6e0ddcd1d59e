use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::rpc::{to_value, unknown_method, RpcArgs, Snippet};
use crate::{Result, SnippetContext};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum NetworkType {
    Unknown,
    Gprs,
    Edge,
    Umts,
    Hspa,
    HspaPlus,
    Lte,
    Nr,
    Iwlan,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CallState {
    Idle,
    Ringing,
    Offhook,
}

/// Identifiers come back as `None` when there is no SIM, and as an error
/// when the platform doesn't let us read them.
pub trait TelephonyPlatform: Send + Sync {
    fn line1_number(&self) -> Result<Option<String>>;
    fn device_id(&self) -> Result<Option<String>>;
    fn subscriber_id(&self) -> Result<Option<String>>;
    fn data_network_type(&self) -> NetworkType;
    fn voice_network_type(&self) -> NetworkType;
    fn call_state(&self) -> CallState;
}

pub struct TelephonySnippet {
    platform: Arc<dyn TelephonyPlatform>,
}

impl TelephonySnippet {
    pub fn new(ctx: &SnippetContext) -> Self {
        Self { platform: ctx.services().telephony.clone() }
    }
}

#[async_trait]
impl Snippet for TelephonySnippet {
    fn name(&self) -> &'static str {
        "telephony"
    }

    async fn call(&self, method: &str, _args: &RpcArgs) -> Result<Value> {
        match method {
            "getLine1Number" => to_value(self.platform.line1_number()?),
            "getDeviceId" => to_value(self.platform.device_id()?),
            "getSubscriberId" => to_value(self.platform.subscriber_id()?),
            "getDataNetworkType" => to_value(self.platform.data_network_type()),
            "getVoiceNetworkType" => to_value(self.platform.voice_network_type()),
            "getCallState" => to_value(self.platform.call_state()),
            _ => Err(unknown_method(self.name(), method)),
        }
    }
}
