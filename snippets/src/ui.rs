//! UI automation on the device screen

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use serde_json::Value;

use crate::poll;
use crate::rpc::{to_value, unknown_method, RpcArgs, Snippet};
use crate::{Error, Result, SnippetContext};

/// The automation side of the device (think `UiDevice`)
pub trait UiDevice: Send + Sync {
    fn press_home(&self) -> bool;
    fn press_back(&self) -> bool;
    fn wake_up(&self) -> Result<()>;

    /// Whether an object showing exactly `text` is on screen
    fn has_text(&self, text: &str) -> bool;
    fn click_text(&self, text: &str) -> bool;

    /// The current window hierarchy as XML
    fn dump_hierarchy(&self) -> Result<String>;
}

pub struct UiSnippet {
    device: Arc<dyn UiDevice>,
}

impl UiSnippet {
    pub fn new(ctx: &SnippetContext) -> Self {
        Self { device: ctx.services().ui.clone() }
    }

    pub fn click_text(&self, text: &str) -> Result<()> {
        if !self.device.has_text(text) {
            return Err(Error::precondition(format!("No object with text {:?} on screen", text)));
        }
        if !self.device.click_text(text) {
            return Err(Error::platform_refused("UiObject.click"));
        }
        debug!("Clicked {:?}", text);
        Ok(())
    }

    /// Returns false if `text` didn't show up within `timeout`
    pub async fn wait_for_text(&self, text: &str, timeout: Duration) -> Result<bool> {
        let device = self.device.clone();
        let found = poll::wait_until(|| Ok(device.has_text(text)), timeout).await?;
        info!("Text {:?} {}", text, if found { "appeared" } else { "never appeared" });
        Ok(found)
    }
}

#[async_trait]
impl Snippet for UiSnippet {
    fn name(&self) -> &'static str {
        "ui"
    }

    async fn call(&self, method: &str, args: &RpcArgs) -> Result<Value> {
        match method {
            "uiPressHome" => to_value(self.device.press_home()),
            "uiPressBack" => to_value(self.device.press_back()),
            "uiWakeUp" => to_value(self.device.wake_up()?),
            "uiClickText" => to_value(self.click_text(&args.get::<String>(0)?)?),
            "uiWaitForText" => {
                let text: String = args.get(0)?;
                let timeout_ms: u64 = args.get(1)?;
                to_value(self.wait_for_text(&text, Duration::from_millis(timeout_ms)).await?)
            }
            "uiDumpHierarchy" => to_value(self.device.dump_hierarchy()?),
            _ => Err(unknown_method(self.name(), method)),
        }
    }
}
