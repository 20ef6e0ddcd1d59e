//! SMS sending and receiving

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use serde_json::Value;

use crate::context::ReceiverGuard;
use crate::event::{Listener, Retention};
use crate::poll;
use crate::rpc::{to_value, unknown_method, RpcArgs, Snippet};
use crate::{Bundle, Error, Result, SnippetContext};

/// How long to wait for the platform to report that a message went out
pub const SMS_TIMEOUT: Duration = Duration::from_secs(2 * 60);

pub const ACTION_SMS_RECEIVED: &str = "android.provider.Telephony.SMS_RECEIVED";
pub const EVENT_RECEIVED_SMS: &str = "ReceivedSms";

pub const EXTRA_ORIGINATING_ADDRESS: &str = "OriginatingAddress";
pub const EXTRA_MESSAGE_BODY: &str = "MessageBody";
/// Carried by the per-part sent broadcast
pub const EXTRA_RESULT_CODE: &str = "resultCode";

/// The sent-status result code of a part that went out fine
pub const RESULT_OK: i64 = -1;

/// Incoming messages are announced with an [`ACTION_SMS_RECEIVED`] broadcast.
pub trait SmsPlatform: Send + Sync {
    /// Splits `message` into parts that each fit one SMS
    fn divide_message(&self, message: &str) -> Vec<String>;

    /// Sends `parts` as one multipart message. The platform broadcasts
    /// `sent_action` once per part, with the part's [`EXTRA_RESULT_CODE`].
    fn send_multipart(&self, destination: &str, parts: &[String], sent_action: &str)
                      -> Result<()>;
}

pub struct SmsSnippet {
    ctx: SnippetContext,
    platform: Arc<dyn SmsPlatform>,
    sent_counter: AtomicU64,
}

impl SmsSnippet {
    pub fn new(ctx: &SnippetContext) -> Self {
        Self { ctx: ctx.clone(),
               platform: ctx.services().sms.clone(),
               sent_counter: AtomicU64::new(0) }
    }

    /// Sends a message and waits until every part has been reported sent
    pub async fn send_sms(&self, destination: &str, message: &str) -> Result<()> {
        let parts = self.platform.divide_message(message);
        if parts.is_empty() {
            return Err(Error::InvalidArgument("message is empty".to_string()));
        }
        // Unique per send so that reports of an earlier, timed out send
        // can't be mistaken for ours.
        let sent_action = format!("snippets.sms.SMS_SENT.{}",
                                  self.sent_counter.fetch_add(1, Ordering::SeqCst));
        let results = Arc::new(StdMutex::new(Vec::<i64>::with_capacity(parts.len())));
        let receiver: Arc<dyn Listener> = {
            let results = results.clone();
            Arc::new(move |_: &str, extras: Bundle| {
                let code = extras.get_int(EXTRA_RESULT_CODE).unwrap_or(0);
                results.lock().unwrap().push(code);
            })
        };
        let _guard = ReceiverGuard::register(&self.ctx.services().broadcasts,
                                             &[sent_action.as_str()],
                                             receiver)?;
        self.platform.send_multipart(destination, &parts, &sent_action)?;

        let expected = parts.len();
        poll::wait_for(&format!("SMS to {} to be sent", destination),
                       || Ok(results.lock().unwrap().len() >= expected),
                       SMS_TIMEOUT).await?;
        let failed = results.lock().unwrap().iter().copied().find(|code| *code != RESULT_OK);
        if let Some(code) = failed {
            warn!("SMS to {} failed with result code {}", destination, code);
            return Err(Error::platform_code("SmsManager.sendMultipartTextMessage", code as i32));
        }
        info!("SMS sent to {} in {} parts", destination, expected);
        Ok(())
    }

    /// Reports every incoming message on `callback_id` as a [`EVENT_RECEIVED_SMS`]
    /// event. The receiver outlives individual calls, it stays registered
    /// until the context shuts down.
    pub fn async_wait_for_sms(&self, callback_id: &str) -> Result<()> {
        let broadcasts = self.ctx.services().broadcasts.clone();
        self.ctx.bridge().register(callback_id, self.name(), Retention::AdapterLifetime, |sink| {
                             let receiver: Arc<dyn Listener> =
                                 Arc::new(move |_: &str, extras: Bundle| {
                                     sink.emit(EVENT_RECEIVED_SMS, received_sms(&extras))
                                 });
                             let guard =
                                 ReceiverGuard::register(&broadcasts, &[ACTION_SMS_RECEIVED],
                                                         receiver)?;
                             Ok(guard.into_handle())
                         })
    }

    /// Waits for the next incoming message
    pub async fn wait_for_sms(&self, timeout: Duration) -> Result<Bundle> {
        let received = Arc::new(StdMutex::new(None::<Bundle>));
        let receiver: Arc<dyn Listener> = {
            let received = received.clone();
            Arc::new(move |_: &str, extras: Bundle| {
                let mut slot = received.lock().unwrap();
                if slot.is_none() {
                    *slot = Some(received_sms(&extras));
                }
            })
        };
        let _guard = ReceiverGuard::register(&self.ctx.services().broadcasts,
                                             &[ACTION_SMS_RECEIVED],
                                             receiver)?;
        poll::wait_for("an incoming SMS", || Ok(received.lock().unwrap().is_some()), timeout)
            .await?;
        let message = received.lock().unwrap().take();
        message.ok_or_else(|| Error::precondition("incoming SMS went missing"))
    }
}

fn received_sms(extras: &Bundle) -> Bundle {
    Bundle::new().with(EXTRA_ORIGINATING_ADDRESS,
                       extras.get_str(EXTRA_ORIGINATING_ADDRESS).unwrap_or_default())
                 .with(EXTRA_MESSAGE_BODY, extras.get_str(EXTRA_MESSAGE_BODY).unwrap_or_default())
}

#[async_trait]
impl Snippet for SmsSnippet {
    fn name(&self) -> &'static str {
        "sms"
    }

    async fn call(&self, method: &str, args: &RpcArgs) -> Result<Value> {
        match method {
            "sendSms" => {
                let destination: String = args.get(0)?;
                let message: String = args.get(1)?;
                to_value(self.send_sms(&destination, &message).await?)
            }
            "asyncWaitForSms" => to_value(self.async_wait_for_sms(&args.get::<String>(0)?)?),
            "waitForSms" => {
                let timeout_ms: u64 = args.get(0)?;
                to_value(self.wait_for_sms(Duration::from_millis(timeout_ms)).await?)
            }
            _ => Err(unknown_method(self.name(), method)),
        }
    }

    fn shutdown(&self) {
        self.ctx.bridge().unregister_owned(self.name());
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::fake::FakePlatform;
    use crate::{ContextConfig, Platform};

    fn setup() -> (FakePlatform, SnippetContext, SmsSnippet) {
        let fake = FakePlatform::new();
        let mut config = ContextConfig::new();
        config.set_platform(Platform::Fake(fake.clone()));
        let ctx = config.start().unwrap();
        let snippet = SmsSnippet::new(&ctx);
        (fake, ctx, snippet)
    }

    #[tokio::test(start_paused = true)]
    async fn long_messages_wait_for_every_part() {
        let (fake, _ctx, snippet) = setup();
        let message = "x".repeat(200);
        snippet.send_sms("+15555550101", &message).await.unwrap();
        let sent = fake.sms.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.len(), 2);
        assert_eq!(fake.broadcasts.receiver_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_carries_the_result_code() {
        let (fake, _ctx, snippet) = setup();
        fake.sms.set_send_result(4); // no service
        match snippet.send_sms("+15555550101", "hi").await {
            Err(Error::Platform { detail, .. }) => assert!(detail.contains('4')),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn missing_sent_report_times_out() {
        let (fake, _ctx, snippet) = setup();
        fake.sms.set_report_sent(false);
        let err = snippet.send_sms("+15555550101", "hi").await.unwrap_err();
        assert!(matches!(err, Error::Timeout { timeout, .. } if timeout == SMS_TIMEOUT));
    }

    #[tokio::test]
    async fn lifetime_receiver_outlives_snippet_teardown() {
        let (fake, ctx, snippet) = setup();
        snippet.call("asyncWaitForSms", &RpcArgs::new(vec![json!("inbox")])).await.unwrap();
        snippet.shutdown();

        fake.sms.deliver("+15555550102", "first");
        fake.sms.deliver("+15555550102", "second");
        let events = ctx.bridge().get_all("inbox", EVENT_RECEIVED_SMS);
        let bodies: Vec<&str> =
            events.iter().map(|e| e.data.get_str(EXTRA_MESSAGE_BODY).unwrap()).collect();
        assert_eq!(bodies, vec!["first", "second"]);

        ctx.shutdown();
        assert_eq!(fake.broadcasts.receiver_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_sms() {
        let (fake, _ctx, snippet) = setup();
        let err = snippet.wait_for_sms(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));

        let sms = fake.sms.clone();
        let waiting = snippet.wait_for_sms(Duration::from_secs(10));
        let deliver = async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            sms.deliver("+15555550103", "ping");
        };
        let (message, ()) = tokio::join!(waiting, deliver);
        let message = message.unwrap();
        assert_eq!(message.get_str(EXTRA_ORIGINATING_ADDRESS), Some("+15555550103"));
        assert_eq!(message.get_str(EXTRA_MESSAGE_BODY), Some("ping"));
    }
}
