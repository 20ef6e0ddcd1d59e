//! The callback/event bridge
//!
//! Asynchronous snippet operations are correlated with a caller supplied
//! callback id. The snippet installs a platform listener bound to an
//! [`EventSink`] for that id and, whenever the platform fires, the listener
//! appends a named event to the id's queue. The remote caller later drains
//! the queue (or waits on it) using the same callback id.
//!
//! Platform listeners fire on platform-managed threads while the queue is
//! drained from RPC tasks, so each queue is a short critical section behind a
//! std mutex plus a tokio `Notify` for waiters.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{self, Stream};
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::{Bundle, Error, Result};

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnippetEvent {
    pub callback_id: String,
    pub name: String,
    /// Milliseconds since the unix epoch when the event was emitted
    #[serde(rename = "time")]
    pub created_at_ms: u64,
    /// Bridge-wide emit order; strictly increasing within a callback id
    pub sequence: u64,
    pub data: Bundle,
}

/// The narrow platform-facing side of the bridge
///
/// Whatever platform API produced an event, all the bridge needs is a name
/// and a payload.
pub trait Listener: Send + Sync {
    fn on_event(&self, name: &str, data: Bundle);
}

impl<F> Listener for F where F: Fn(&str, Bundle) + Send + Sync
{
    fn on_event(&self, name: &str, data: Bundle) {
        self(name, data)
    }
}

/// Releases a platform registration (receiver, callback, socket task...)
/// when dropped.
pub struct ListenerHandle {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ListenerHandle {
    pub fn new<F>(release: F) -> Self
        where F: FnOnce() + Send + Sync + 'static
    {
        Self { release: Some(Box::new(release)) }
    }

    /// For registrations that have nothing to tear down on the platform side
    pub fn noop() -> Self {
        Self { release: None }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
         .field("released", &self.release.is_none())
         .finish()
    }
}

/// How long a registration is expected to live
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Retention {
    /// Released by the operation's stop/cancel entry point, or when the
    /// owning snippet shuts down.
    Transient,

    /// Deliberately kept registered for the whole lifetime of the context so
    /// that repeated platform events keep being delivered. Only released by
    /// an explicit `unregister` or [`EventBridge::shutdown`].
    AdapterLifetime,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Per callback id; once full the oldest event is dropped
    pub queue_capacity: usize,

    /// When false, [`Retention::AdapterLifetime`] registrations are treated
    /// as [`Retention::Transient`] and get released on snippet shutdown.
    pub retain_lifetime_listeners: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self { queue_capacity: 1024,
               retain_lifetime_listeners: true }
    }
}

#[derive(Debug)]
struct EventQueue {
    events: StdMutex<VecDeque<SnippetEvent>>,
    notify: Notify,
    capacity: usize,
}

impl EventQueue {
    fn new(capacity: usize) -> Self {
        Self { events: StdMutex::new(VecDeque::new()),
               notify: Notify::new(),
               capacity: capacity.max(1) }
    }

    fn push(&self, callback_id: &str, name: &str, data: Bundle, sequence: &AtomicU64) {
        let created_at_ms = SystemTime::now().duration_since(UNIX_EPOCH)
                                             .map(|d| d.as_millis() as u64)
                                             .unwrap_or(0);
        {
            let mut events = self.events.lock().unwrap();
            // The sequence number is taken under the queue lock so that it
            // agrees with the queue order.
            let event = SnippetEvent { callback_id: callback_id.to_string(),
                                       name: name.to_string(),
                                       created_at_ms,
                                       sequence: sequence.fetch_add(1, Ordering::Relaxed),
                                       data };
            if events.len() >= self.capacity {
                if let Some(dropped) = events.pop_front() {
                    warn!("Event queue for {:?} is full, dropping oldest {:?} event",
                          callback_id, dropped.name);
                }
            }
            events.push_back(event);
        }
        self.notify.notify_waiters();
    }

    fn take_first(&self, name: &str) -> Option<SnippetEvent> {
        let mut events = self.events.lock().unwrap();
        let position = events.iter().position(|e| e.name == name)?;
        events.remove(position)
    }

    fn take_matching(&self, name: &str) -> Vec<SnippetEvent> {
        let mut events = self.events.lock().unwrap();
        let (matching, rest): (Vec<_>, Vec<_>) = events.drain(..).partition(|e| e.name == name);
        *events = rest.into();
        matching
    }

    fn take_all(&self) -> Vec<SnippetEvent> {
        let mut events = self.events.lock().unwrap();
        events.drain(..).collect()
    }

    fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    async fn next_matching(&self, name: &str) -> SnippetEvent {
        loop {
            // Register interest before checking the queue so that an emit
            // racing with the check still wakes us.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(event) = self.take_first(name) {
                return event;
            }
            notified.await;
        }
    }
}

/// The emitting end of one callback id's queue
///
/// Cheap to clone and safe to move onto any platform thread.
#[derive(Clone)]
pub struct EventSink {
    callback_id: Arc<str>,
    queue: Arc<EventQueue>,
    sequence: Arc<AtomicU64>,
}

impl EventSink {
    pub fn callback_id(&self) -> &str {
        &self.callback_id
    }

    pub fn emit(&self, name: &str, data: Bundle) {
        trace!("emit {:?} on {:?}", name, self.callback_id);
        self.queue.push(&self.callback_id, name, data, &self.sequence);
    }
}

impl Listener for EventSink {
    fn on_event(&self, name: &str, data: Bundle) {
        self.emit(name, data)
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventSink").field(&self.callback_id).finish()
    }
}

#[derive(Debug)]
struct Registration {
    owner: String,
    retention: Retention,
    // Only held so that it gets dropped (and the platform side released)
    // together with the registration.
    _handle: ListenerHandle,
}

#[derive(Debug)]
pub struct EventBridge {
    config: BridgeConfig,
    queues: DashMap<String, Arc<EventQueue>>,
    // At most one active registration per callback id
    registrations: DashMap<String, Registration>,
    sequence: Arc<AtomicU64>,
}

impl EventBridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config,
               queues: DashMap::new(),
               registrations: DashMap::new(),
               sequence: Arc::new(AtomicU64::new(0)) }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn queue(&self, callback_id: &str) -> Arc<EventQueue> {
        if let Some(queue) = self.queues.get(callback_id) {
            return queue.clone();
        }
        self.queues
            .entry(callback_id.to_string())
            .or_insert_with(|| Arc::new(EventQueue::new(self.config.queue_capacity)))
            .clone()
    }

    /// Returns a sink for `callback_id` without registering anything
    pub fn sink(&self, callback_id: &str) -> EventSink {
        EventSink { callback_id: Arc::from(callback_id),
                    queue: self.queue(callback_id),
                    sequence: self.sequence.clone() }
    }

    /// Installs a platform listener for `callback_id`.
    ///
    /// `factory` receives the sink the listener should emit into and returns
    /// the handle that will release the platform registration. If the
    /// factory fails nothing is registered.
    ///
    /// NB: the factory runs while the registration slot for `callback_id` is
    /// locked so it must not call back into `register`/`unregister`.
    /// Emitting from within the factory is fine.
    pub fn register<F>(&self, callback_id: &str, owner: &str, retention: Retention,
                       factory: F)
                       -> Result<()>
        where F: FnOnce(EventSink) -> Result<ListenerHandle>
    {
        let retention = match retention {
            Retention::AdapterLifetime if !self.config.retain_lifetime_listeners => {
                Retention::Transient
            }
            retention => retention,
        };
        let sink = self.sink(callback_id);
        match self.registrations.entry(callback_id.to_string()) {
            Entry::Occupied(_) => Err(Error::AlreadyRegistered(callback_id.to_string())),
            Entry::Vacant(slot) => {
                let handle = factory(sink)?;
                slot.insert(Registration { owner: owner.to_string(),
                                           retention,
                                           _handle: handle });
                debug!("Registered {:?} listener for {} ({:?})", callback_id, owner, retention);
                Ok(())
            }
        }
    }

    pub fn is_registered(&self, callback_id: &str) -> bool {
        self.registrations.contains_key(callback_id)
    }

    /// Releases the registration for `callback_id`, if there is one.
    ///
    /// Events already queued for the id stay available for draining.
    pub fn unregister(&self, callback_id: &str) {
        // Dropped after the map entry is released, so platform teardown can't
        // contend with other registrations.
        let removed = self.registrations.remove(callback_id);
        if let Some((_, registration)) = removed {
            debug!("Unregistered {:?} listener for {}", callback_id, registration.owner);
        }
    }

    /// Releases every transient registration owned by `owner`, together
    /// with whatever is still queued for those ids.
    pub fn unregister_owned(&self, owner: &str) {
        let ids: Vec<String> = self.registrations
                                   .iter()
                                   .filter(|r| {
                                       r.owner == owner && r.retention == Retention::Transient
                                   })
                                   .map(|r| r.key().clone())
                                   .collect();
        for id in ids {
            self.unregister(&id);
            if let Some((_, queue)) = self.queues.remove(&id) {
                let dropped = queue.len();
                if dropped > 0 {
                    debug!("Discarding {} undrained events for {:?}", dropped, id);
                }
            }
        }
    }

    // Forgets the queue of an id nobody listens on once it has been emptied.
    // Only done when the map holds the last reference, so no sink can still
    // be emitting into it.
    fn forget_if_idle(&self, callback_id: &str) {
        if self.is_registered(callback_id) {
            return;
        }
        self.queues
            .remove_if(callback_id, |_, queue| Arc::strong_count(queue) == 1 && queue.len() == 0);
    }

    /// Releases every registration, including lifetime ones, and forgets
    /// all queued events.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.registrations.iter().map(|r| r.key().clone()).collect();
        for id in ids {
            self.unregister(&id);
        }
        self.queues.clear();
    }

    /// Appends an event for `callback_id`
    pub fn emit(&self, callback_id: &str, name: &str, data: Bundle) {
        self.sink(callback_id).emit(name, data);
    }

    /// Removes and returns all queued `name` events for `callback_id`, in
    /// emit order.
    pub fn get_all(&self, callback_id: &str, name: &str) -> Vec<SnippetEvent> {
        let events = match self.queues.get(callback_id).map(|q| q.clone()) {
            Some(queue) => queue.take_matching(name),
            None => return vec![],
        };
        self.forget_if_idle(callback_id);
        events
    }

    /// Removes and returns every queued event for `callback_id`, in emit order.
    pub fn drain(&self, callback_id: &str) -> Vec<SnippetEvent> {
        let events = match self.queues.get(callback_id).map(|q| q.clone()) {
            Some(queue) => queue.take_all(),
            None => return vec![],
        };
        self.forget_if_idle(callback_id);
        events
    }

    pub fn pending(&self, callback_id: &str) -> usize {
        self.queues.get(callback_id).map(|q| q.len()).unwrap_or(0)
    }

    /// Discards the queued events for `callback_id`. The queue itself is only
    /// forgotten when no listener is registered for the id any more.
    pub fn clear(&self, callback_id: &str) {
        if self.is_registered(callback_id) {
            if let Some(queue) = self.queues.get(callback_id).map(|q| q.clone()) {
                queue.take_all();
            }
        } else {
            self.queues.remove(callback_id);
        }
    }

    /// Removes and returns the first queued `name` event for `callback_id`,
    /// waiting up to `timeout` for one to be emitted.
    pub async fn wait_and_get(&self, callback_id: &str, name: &str, timeout: Duration)
                              -> Result<SnippetEvent> {
        let queue = self.queue(callback_id);
        let result = tokio::time::timeout(timeout, queue.next_matching(name)).await;
        drop(queue);
        self.forget_if_idle(callback_id);
        result.map_err(|_| Error::Timeout { what: format!("event {:?} on callback {:?}",
                                                          name, callback_id),
                                            timeout })
    }

    /// Every `name` event for `callback_id`, as it gets emitted. Each event is
    /// removed from the queue when yielded; the stream never ends by itself.
    pub fn events(&self, callback_id: &str, name: &str) -> impl Stream<Item = SnippetEvent> {
        let queue = self.queue(callback_id);
        stream::unfold((queue, name.to_string()), |(queue, name)| async move {
            let event = queue.next_matching(&name).await;
            Some((event, (queue, name)))
        })
    }
}

impl Default for EventBridge {
    fn default() -> Self {
        Self::new(BridgeConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::thread;

    use anyhow::anyhow;

    use super::*;

    fn names(events: &[SnippetEvent]) -> Vec<&str> {
        events.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn events_from_two_threads_drain_in_emit_order() {
        let bridge = EventBridge::default();
        bridge.register("cb1", "test", Retention::Transient, |sink| {
                  let a = sink.clone();
                  thread::spawn(move || a.emit("A", Bundle::new())).join().unwrap();
                  thread::spawn(move || sink.emit("B", Bundle::new())).join().unwrap();
                  Ok(ListenerHandle::noop())
              })
              .unwrap();
        let events = bridge.drain("cb1");
        assert_eq!(names(&events), vec!["A", "B"]);
        assert!(events[0].sequence < events[1].sequence);
        assert!(bridge.drain("cb1").is_empty());
    }

    #[test]
    fn fifo_per_id_with_interleaved_ids() {
        let bridge = EventBridge::default();
        for i in 0..50i64 {
            bridge.emit("x", "tick", Bundle::new().with("i", i));
            bridge.emit("y", "tick", Bundle::new().with("i", -i));
        }
        let xs: Vec<i64> = bridge.get_all("x", "tick")
                                 .iter()
                                 .map(|e| e.data.get_int("i").unwrap())
                                 .collect();
        assert_eq!(xs, (0..50).collect::<Vec<_>>());
        assert_eq!(bridge.pending("y"), 50);
    }

    #[test]
    fn duplicate_registration_is_rejected_until_unregistered() {
        let bridge = EventBridge::default();
        let factory = |_sink| Ok(ListenerHandle::noop());
        bridge.register("cb", "test", Retention::Transient, factory).unwrap();
        let err = bridge.register("cb", "test", Retention::Transient, factory).unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered(ref id) if id == "cb"));

        bridge.unregister("cb");
        bridge.register("cb", "test", Retention::Transient, factory).unwrap();
    }

    #[test]
    fn unregister_without_registration_is_a_noop() {
        let bridge = EventBridge::default();
        bridge.unregister("nope");
        assert!(!bridge.is_registered("nope"));
    }

    #[test]
    fn failed_factory_leaves_no_registration() {
        let bridge = EventBridge::default();
        let err = bridge.register("cb", "test", Retention::Transient, |_| {
                            Err(Error::Other(anyhow!("startScan refused")))
                        })
                        .unwrap_err();
        assert!(matches!(err, Error::Other(_)));
        assert!(!bridge.is_registered("cb"));
        bridge.register("cb", "test", Retention::Transient, |_| Ok(ListenerHandle::noop()))
              .unwrap();
    }

    #[test]
    fn unregister_releases_the_platform_side() {
        let bridge = EventBridge::default();
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();
        bridge.register("cb", "test", Retention::Transient, move |_| {
                  Ok(ListenerHandle::new(move || flag.store(true, Ordering::SeqCst)))
              })
              .unwrap();
        assert!(!released.load(Ordering::SeqCst));
        bridge.unregister("cb");
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn lifetime_registrations_survive_owner_teardown() {
        let bridge = EventBridge::default();
        let noop = |_| Ok(ListenerHandle::noop());
        bridge.register("scan", "ble", Retention::Transient, noop).unwrap();
        bridge.register("sms", "ble", Retention::AdapterLifetime, noop).unwrap();
        bridge.register("other", "wifi", Retention::Transient, noop).unwrap();

        bridge.unregister_owned("ble");
        assert!(!bridge.is_registered("scan"));
        assert!(bridge.is_registered("sms"));
        assert!(bridge.is_registered("other"));

        bridge.shutdown();
        assert!(!bridge.is_registered("sms"));
        assert!(!bridge.is_registered("other"));
    }

    #[test]
    fn owner_teardown_discards_queued_events() {
        let bridge = EventBridge::default();
        let noop = |_| Ok(ListenerHandle::noop());
        bridge.register("scan", "ble", Retention::Transient, noop).unwrap();
        bridge.register("inbox", "ble", Retention::AdapterLifetime, noop).unwrap();
        bridge.emit("scan", "onScanResult", Bundle::new());
        bridge.emit("inbox", "ReceivedSms", Bundle::new());

        bridge.unregister_owned("ble");
        assert_eq!(bridge.pending("scan"), 0);
        assert_eq!(bridge.pending("inbox"), 1);

        // A stop keeps what was already delivered
        bridge.register("scan", "ble", Retention::Transient, noop).unwrap();
        bridge.emit("scan", "onScanResult", Bundle::new());
        bridge.unregister("scan");
        assert_eq!(bridge.pending("scan"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn queues_of_unregistered_ids_are_forgotten_once_empty() {
        let bridge = EventBridge::default();
        let _ = bridge.wait_and_get("ghost", "onX", Duration::from_millis(10)).await;
        assert!(bridge.queues.is_empty());

        bridge.emit("done", "a", Bundle::new());
        bridge.emit("done", "b", Bundle::new());
        bridge.get_all("done", "a");
        assert_eq!(bridge.queues.len(), 1);
        bridge.drain("done");
        assert!(bridge.queues.is_empty());

        bridge.register("live", "test", Retention::Transient, |_| Ok(ListenerHandle::noop()))
              .unwrap();
        bridge.emit("live", "a", Bundle::new());
        bridge.drain("live");
        assert_eq!(bridge.queues.len(), 1);
    }

    #[test]
    fn lifetime_retention_can_be_disabled() {
        let bridge = EventBridge::new(BridgeConfig { retain_lifetime_listeners: false,
                                                     ..Default::default() });
        bridge.register("sms", "sms", Retention::AdapterLifetime, |_| Ok(ListenerHandle::noop()))
              .unwrap();
        bridge.unregister_owned("sms");
        assert!(!bridge.is_registered("sms"));
    }

    #[test]
    fn full_queue_drops_oldest() {
        let bridge = EventBridge::new(BridgeConfig { queue_capacity: 2,
                                                     ..Default::default() });
        for name in ["a", "b", "c"] {
            bridge.emit("cb", name, Bundle::new());
        }
        assert_eq!(names(&bridge.drain("cb")), vec!["b", "c"]);
    }

    #[test]
    fn get_all_leaves_other_names_queued() {
        let bridge = EventBridge::default();
        bridge.emit("cb", "onScanResult", Bundle::new().with("n", 1i64));
        bridge.emit("cb", "onScanFailed", Bundle::new());
        bridge.emit("cb", "onScanResult", Bundle::new().with("n", 2i64));
        let results = bridge.get_all("cb", "onScanResult");
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].data.get_int("n"), Some(2));
        assert_eq!(names(&bridge.drain("cb")), vec!["onScanFailed"]);
    }

    #[tokio::test]
    async fn wait_and_get_wakes_on_emit_from_another_thread() {
        let bridge = Arc::new(EventBridge::default());
        let emitter = bridge.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            emitter.emit("cb", "noise", Bundle::new());
            emitter.emit("cb", "onConnectionStateChange", Bundle::new().with("newState", 2i64));
        });
        let event = bridge.wait_and_get("cb", "onConnectionStateChange", Duration::from_secs(5))
                          .await
                          .unwrap();
        assert_eq!(event.data.get_int("newState"), Some(2));
        handle.join().unwrap();
        assert_eq!(names(&bridge.drain("cb")), vec!["noise"]);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_and_get_times_out_distinctly() {
        let bridge = EventBridge::default();
        let err = bridge.wait_and_get("cb", "never", Duration::from_secs(3)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn event_stream_follows_emits() {
        use futures::StreamExt;

        let bridge = Arc::new(EventBridge::default());
        bridge.emit("cb", "onScanResult", Bundle::new().with("n", 1i64));
        let emitter = bridge.clone();
        let handle = thread::spawn(move || {
            emitter.emit("cb", "onScanFailed", Bundle::new());
            emitter.emit("cb", "onScanResult", Bundle::new().with("n", 2i64));
        });
        let events: Vec<SnippetEvent> =
            bridge.events("cb", "onScanResult").take(2).collect().await;
        handle.join().unwrap();
        let ns: Vec<i64> = events.iter().map(|e| e.data.get_int("n").unwrap()).collect();
        assert_eq!(ns, vec![1, 2]);
        assert_eq!(names(&bridge.drain("cb")), vec!["onScanFailed"]);
    }

    #[test]
    fn events_serialize_for_the_remote_caller() {
        let bridge = EventBridge::default();
        bridge.emit("1-1", "onStartSuccess", Bundle::new().with("txPower", -7i64));
        let event = bridge.drain("1-1").remove(0);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["callbackId"], "1-1");
        assert_eq!(json["name"], "onStartSuccess");
        assert_eq!(json["data"]["txPower"], -7);
        assert!(json["time"].as_u64().is_some());
    }
}
