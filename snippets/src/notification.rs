use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use serde_json::Value;

use crate::rpc::{to_value, unknown_method, RpcArgs, Snippet};
use crate::{Result, SnippetContext};

pub trait NotificationPlatform: Send + Sync {
    fn show_toast(&self, message: &str) -> Result<()>;
    fn post(&self, id: i32, title: &str, message: &str) -> Result<()>;
    fn cancel(&self, id: i32);
}

pub struct NotificationSnippet {
    platform: Arc<dyn NotificationPlatform>,
    next_id: AtomicI32,
}

impl NotificationSnippet {
    pub fn new(ctx: &SnippetContext) -> Self {
        Self { platform: ctx.services().notifications.clone(),
               next_id: AtomicI32::new(1) }
    }

    /// Posts a notification and returns the id to cancel it with
    pub fn notify(&self, title: &str, message: &str) -> Result<i32> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.platform.post(id, title, message)?;
        debug!("Posted notification {}: {}", id, title);
        Ok(id)
    }
}

#[async_trait]
impl Snippet for NotificationSnippet {
    fn name(&self) -> &'static str {
        "notification"
    }

    async fn call(&self, method: &str, args: &RpcArgs) -> Result<Value> {
        match method {
            "makeToast" => to_value(self.platform.show_toast(&args.get::<String>(0)?)?),
            "notify" => {
                let title: String = args.get(0)?;
                let message: String = args.get(1)?;
                to_value(self.notify(&title, &message)?)
            }
            "cancelNotification" => to_value(self.platform.cancel(args.get(0)?)),
            _ => Err(unknown_method(self.name(), method)),
        }
    }
}
