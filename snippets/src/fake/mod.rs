//! In-memory platform used by tests and demos
//!
//! Asynchronous platform transitions (a radio turning on, a bond
//! completing...) are modelled as a countdown of state queries: the state
//! flips after it has been polled a configurable number of times. That keeps
//! poll-waits deterministic without any background threads.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use log::trace;

use crate::context::{BroadcastService, PlatformServices, ReceiverId};
use crate::event::Listener;
use crate::{Bundle, Result};

pub mod bluetooth;
pub mod device;
pub mod wifi;

pub use self::bluetooth::{FakeBluetooth, FakeLe};
pub use self::device::{FakeAccounts, FakeMedia, FakeNotifications, FakeSms, FakeTelephony,
                       FakeUiDevice};
pub use self::wifi::{FakeWifi, FakeWifiAware, FakeWifiP2p};

/// The number of state queries a pending transition takes to settle
pub const DEFAULT_SETTLE_POLLS: u32 = 3;

/// A pending transition that settles after being polled a number of times
#[derive(Debug, Default)]
pub(crate) struct Countdown(AtomicU32);

impl Countdown {
    pub(crate) fn arm(&self, polls: u32) {
        self.0.store(polls, Ordering::SeqCst);
    }

    /// Returns true once the countdown has run out
    pub(crate) fn tick(&self) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map(|previous| previous <= 1)
            .unwrap_or(true)
    }
}

#[derive(Default)]
pub struct FakeBroadcasts {
    next_id: AtomicU64,
    receivers: StdMutex<Vec<(ReceiverId, Vec<String>, Arc<dyn Listener>)>>,
}

impl FakeBroadcasts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers a broadcast to every receiver registered for `action`
    pub fn send(&self, action: &str, extras: Bundle) {
        let receivers: Vec<Arc<dyn Listener>> = {
            let guard = self.receivers.lock().unwrap();
            guard.iter()
                 .filter(|(_, actions, _)| actions.iter().any(|a| a == action))
                 .map(|(_, _, receiver)| receiver.clone())
                 .collect()
        };
        trace!("broadcast {} to {} receivers", action, receivers.len());
        // Receivers are called without the lock held, they may well
        // (un)register receivers themselves.
        for receiver in receivers {
            receiver.on_event(action, extras.clone());
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.receivers.lock().unwrap().len()
    }
}

impl BroadcastService for FakeBroadcasts {
    fn register_receiver(&self, actions: &[&str], receiver: Arc<dyn Listener>)
                         -> Result<ReceiverId> {
        let id = ReceiverId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let actions = actions.iter().map(|a| a.to_string()).collect();
        self.receivers.lock().unwrap().push((id, actions, receiver));
        Ok(id)
    }

    fn unregister_receiver(&self, id: ReceiverId) {
        self.receivers.lock().unwrap().retain(|(rid, _, _)| *rid != id);
    }
}

/// A complete fake device; every field is public so tests can drive the
/// fakes directly.
#[derive(Clone)]
pub struct FakePlatform {
    pub broadcasts: Arc<FakeBroadcasts>,
    pub bluetooth: Arc<FakeBluetooth>,
    pub le: Arc<FakeLe>,
    pub wifi: Arc<FakeWifi>,
    pub wifi_aware: Arc<FakeWifiAware>,
    pub wifi_p2p: Arc<FakeWifiP2p>,
    pub telephony: Arc<FakeTelephony>,
    pub sms: Arc<FakeSms>,
    pub accounts: Arc<FakeAccounts>,
    pub media: Arc<FakeMedia>,
    pub notifications: Arc<FakeNotifications>,
    pub ui: Arc<FakeUiDevice>,
}

impl FakePlatform {
    pub fn new() -> Self {
        let broadcasts = Arc::new(FakeBroadcasts::new());
        FakePlatform { bluetooth: Arc::new(FakeBluetooth::new(broadcasts.clone())),
                       le: Arc::new(FakeLe::new()),
                       wifi: Arc::new(FakeWifi::new(broadcasts.clone())),
                       wifi_aware: Arc::new(FakeWifiAware::new()),
                       wifi_p2p: Arc::new(FakeWifiP2p::new(broadcasts.clone())),
                       telephony: Arc::new(FakeTelephony::new()),
                       sms: Arc::new(FakeSms::new(broadcasts.clone())),
                       accounts: Arc::new(FakeAccounts::new()),
                       media: Arc::new(FakeMedia::new()),
                       notifications: Arc::new(FakeNotifications::new()),
                       ui: Arc::new(FakeUiDevice::new()),
                       broadcasts }
    }

    pub fn services(&self) -> PlatformServices {
        PlatformServices { broadcasts: self.broadcasts.clone(),
                           bluetooth: self.bluetooth.clone(),
                           le_scanner: self.le.clone(),
                           le_advertiser: self.le.clone(),
                           gatt: self.le.clone(),
                           wifi: self.wifi.clone(),
                           wifi_aware: self.wifi_aware.clone(),
                           wifi_p2p: self.wifi_p2p.clone(),
                           telephony: self.telephony.clone(),
                           sms: self.sms.clone(),
                           accounts: self.accounts.clone(),
                           media: self.media.clone(),
                           notifications: self.notifications.clone(),
                           ui: self.ui.clone() }
    }
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn countdown_settles_after_armed_polls() {
        let countdown = Countdown::default();
        assert!(countdown.tick());
        countdown.arm(3);
        assert!(!countdown.tick());
        assert!(!countdown.tick());
        assert!(countdown.tick());
        assert!(countdown.tick());
    }
}
