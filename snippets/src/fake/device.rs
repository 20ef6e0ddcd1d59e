//! Fakes for the non-radio device services

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use log::debug;

use super::{Countdown, FakeBroadcasts};
use crate::account::{AccountPlatform, StatusListenerId};
use crate::capability::Unsupported;
use crate::event::Listener;
use crate::media::{MediaPlatform, PlayerId};
use crate::notification::NotificationPlatform;
use crate::sms::{self, SmsPlatform};
use crate::telephony::{CallState, NetworkType, TelephonyPlatform};
use crate::ui::UiDevice;
use crate::{Bundle, Error, Result};

pub struct FakeTelephony {
    sim_present: AtomicBool,
    state: StdMutex<(NetworkType, CallState)>,
}

impl FakeTelephony {
    pub fn new() -> Self {
        Self { sim_present: AtomicBool::new(true),
               state: StdMutex::new((NetworkType::Lte, CallState::Idle)) }
    }

    pub fn set_sim_present(&self, present: bool) {
        self.sim_present.store(present, Ordering::SeqCst);
    }

    pub fn set_data_network_type(&self, network_type: NetworkType) {
        self.state.lock().unwrap().0 = network_type;
    }

    pub fn set_call_state(&self, call_state: CallState) {
        self.state.lock().unwrap().1 = call_state;
    }

    fn with_sim(&self, value: &str) -> Option<String> {
        if self.sim_present.load(Ordering::SeqCst) {
            Some(value.to_string())
        } else {
            None
        }
    }
}

impl Default for FakeTelephony {
    fn default() -> Self {
        Self::new()
    }
}

impl TelephonyPlatform for FakeTelephony {
    fn line1_number(&self) -> Result<Option<String>> {
        Ok(self.with_sim("+15555550100"))
    }

    fn device_id(&self) -> Result<Option<String>> {
        Unsupported::new("needs READ_PRIVILEGED_PHONE_STATE").fail("TelephonyManager.getDeviceId")
    }

    fn subscriber_id(&self) -> Result<Option<String>> {
        Ok(self.with_sim("310260000000000"))
    }

    fn data_network_type(&self) -> NetworkType {
        if self.sim_present.load(Ordering::SeqCst) {
            self.state.lock().unwrap().0
        } else {
            NetworkType::Unknown
        }
    }

    fn voice_network_type(&self) -> NetworkType {
        self.data_network_type()
    }

    fn call_state(&self) -> CallState {
        self.state.lock().unwrap().1
    }
}

const SMS_PART_LENGTH: usize = 160;

pub struct FakeSms {
    broadcasts: Arc<FakeBroadcasts>,
    sent: StdMutex<Vec<(String, Vec<String>)>>,
    send_result: AtomicI64,
    report_sent: AtomicBool,
}

impl FakeSms {
    pub fn new(broadcasts: Arc<FakeBroadcasts>) -> Self {
        Self { broadcasts,
               sent: StdMutex::new(vec![]),
               send_result: AtomicI64::new(sms::RESULT_OK),
               report_sent: AtomicBool::new(true) }
    }

    /// Destination and parts of every message sent so far
    pub fn sent_messages(&self) -> Vec<(String, Vec<String>)> {
        self.sent.lock().unwrap().clone()
    }

    /// Result code reported for every part of subsequent sends
    pub fn set_send_result(&self, code: i64) {
        self.send_result.store(code, Ordering::SeqCst);
    }

    /// When false sends are accepted but never reported
    pub fn set_report_sent(&self, report: bool) {
        self.report_sent.store(report, Ordering::SeqCst);
    }

    /// Simulates an incoming message
    pub fn deliver(&self, from: &str, body: &str) {
        let extras = Bundle::new().with(sms::EXTRA_ORIGINATING_ADDRESS, from)
                                  .with(sms::EXTRA_MESSAGE_BODY, body);
        self.broadcasts.send(sms::ACTION_SMS_RECEIVED, extras);
    }
}

impl SmsPlatform for FakeSms {
    fn divide_message(&self, message: &str) -> Vec<String> {
        let chars: Vec<char> = message.chars().collect();
        chars.chunks(SMS_PART_LENGTH).map(|part| part.iter().collect()).collect()
    }

    fn send_multipart(&self, destination: &str, parts: &[String], sent_action: &str)
                      -> Result<()> {
        self.sent.lock().unwrap().push((destination.to_string(), parts.to_vec()));
        if !self.report_sent.load(Ordering::SeqCst) {
            return Ok(());
        }
        let code = self.send_result.load(Ordering::SeqCst);
        for _ in parts {
            self.broadcasts.send(sent_action, Bundle::new().with(sms::EXTRA_RESULT_CODE, code));
        }
        Ok(())
    }
}

const SYNC_AUTHORITIES: [&str; 3] =
    ["com.android.calendar", "com.android.contacts", "com.google.android.gm"];

#[derive(Default)]
struct AccountsState {
    accounts: Vec<(String, String)>,
    // Missing entries sync, like fresh accounts on a real device
    sync: HashMap<(String, String), bool>,
}

#[derive(Default)]
pub struct FakeAccounts {
    state: StdMutex<AccountsState>,
    listeners: StdMutex<Vec<(StatusListenerId, Arc<dyn Listener>)>>,
    next_listener: AtomicU64,
}

impl FakeAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Changes a sync setting the way the Settings app would, notifying
    /// status listeners afterwards.
    pub fn user_toggles_sync(&self, username: &str, authority: &str, sync: bool) {
        self.set_sync_automatically(username, authority, sync);
        let listeners: Vec<Arc<dyn Listener>> =
            self.listeners.lock().unwrap().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener.on_event("onStatusChanged", Bundle::new());
        }
    }

    pub fn status_listeners(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }
}

impl AccountPlatform for FakeAccounts {
    fn accounts(&self, account_type: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .accounts
            .iter()
            .filter(|(t, _)| t == account_type)
            .map(|(_, name)| name.clone())
            .collect()
    }

    fn add_account(&self, account_type: &str, username: &str, _password: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.accounts.iter().any(|(t, name)| t == account_type && name == username) {
            return false;
        }
        state.accounts.push((account_type.to_string(), username.to_string()));
        true
    }

    fn remove_account(&self, account_type: &str, username: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let before = state.accounts.len();
        state.accounts.retain(|(t, name)| !(t == account_type && name == username));
        state.accounts.len() != before
    }

    fn sync_authorities(&self, _account_type: &str) -> Vec<String> {
        SYNC_AUTHORITIES.iter().map(|a| a.to_string()).collect()
    }

    fn sync_automatically(&self, username: &str, authority: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.sync
             .get(&(username.to_string(), authority.to_string()))
             .copied()
             .unwrap_or(true)
    }

    fn set_sync_automatically(&self, username: &str, authority: &str, sync: bool) {
        let mut state = self.state.lock().unwrap();
        state.sync.insert((username.to_string(), authority.to_string()), sync);
    }

    fn add_status_listener(&self, listener: Arc<dyn Listener>) -> Result<StatusListenerId> {
        let id = StatusListenerId(self.next_listener.fetch_add(1, Ordering::SeqCst));
        self.listeners.lock().unwrap().push((id, listener));
        Ok(id)
    }

    fn remove_status_listener(&self, id: StatusListenerId) {
        self.listeners.lock().unwrap().retain(|(lid, _)| *lid != id);
    }
}

pub const FAKE_MAX_MUSIC_VOLUME: u32 = 15;

pub struct FakeMedia {
    files: StdMutex<HashSet<String>>,
    // player -> playing
    players: StdMutex<HashMap<u64, bool>>,
    next_player: AtomicU64,
    volume: AtomicU32,
}

impl FakeMedia {
    pub fn new() -> Self {
        Self { files: StdMutex::new(HashSet::new()),
               players: StdMutex::new(HashMap::new()),
               next_player: AtomicU64::new(0),
               volume: AtomicU32::new(FAKE_MAX_MUSIC_VOLUME / 2) }
    }

    pub fn add_audio_file(&self, path: &str) {
        self.files.lock().unwrap().insert(path.to_string());
    }

    /// Players created and not yet released
    pub fn open_players(&self) -> usize {
        self.players.lock().unwrap().len()
    }
}

impl Default for FakeMedia {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaPlatform for FakeMedia {
    fn create_player(&self, path: &str) -> Result<PlayerId> {
        if !self.files.lock().unwrap().contains(path) {
            return Err(Error::Io(io::Error::new(io::ErrorKind::NotFound, path.to_string())));
        }
        let id = self.next_player.fetch_add(1, Ordering::SeqCst);
        self.players.lock().unwrap().insert(id, false);
        Ok(PlayerId(id))
    }

    fn start(&self, player: PlayerId) {
        if let Some(playing) = self.players.lock().unwrap().get_mut(&player.0) {
            *playing = true;
        }
    }

    fn stop(&self, player: PlayerId) {
        if let Some(playing) = self.players.lock().unwrap().get_mut(&player.0) {
            *playing = false;
        }
    }

    fn is_playing(&self, player: PlayerId) -> bool {
        self.players.lock().unwrap().get(&player.0).copied().unwrap_or(false)
    }

    fn release(&self, player: PlayerId) {
        self.players.lock().unwrap().remove(&player.0);
    }

    fn music_volume(&self) -> u32 {
        self.volume.load(Ordering::SeqCst)
    }

    fn music_max_volume(&self) -> u32 {
        FAKE_MAX_MUSIC_VOLUME
    }

    fn set_music_volume(&self, volume: u32) {
        self.volume.store(volume.min(FAKE_MAX_MUSIC_VOLUME), Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeNotifications {
    toasts: StdMutex<Vec<String>>,
    active: StdMutex<Vec<(i32, String, String)>>,
}

impl FakeNotifications {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn toasts(&self) -> Vec<String> {
        self.toasts.lock().unwrap().clone()
    }

    /// Posted and not cancelled: id, title, message
    pub fn active(&self) -> Vec<(i32, String, String)> {
        self.active.lock().unwrap().clone()
    }
}

impl NotificationPlatform for FakeNotifications {
    fn show_toast(&self, message: &str) -> Result<()> {
        self.toasts.lock().unwrap().push(message.to_string());
        Ok(())
    }

    fn post(&self, id: i32, title: &str, message: &str) -> Result<()> {
        let mut active = self.active.lock().unwrap();
        active.retain(|(existing, _, _)| *existing != id);
        active.push((id, title.to_string(), message.to_string()));
        Ok(())
    }

    fn cancel(&self, id: i32) {
        self.active.lock().unwrap().retain(|(existing, _, _)| *existing != id);
    }
}

#[derive(Default)]
pub struct FakeUiDevice {
    screen: StdMutex<Vec<String>>,
    pending: StdMutex<Option<String>>,
    appear: Countdown,
    awake: AtomicBool,
    keys: StdMutex<Vec<&'static str>>,
    clicks: StdMutex<Vec<String>>,
}

impl FakeUiDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces whatever is on screen
    pub fn set_screen(&self, texts: &[&str]) {
        *self.screen.lock().unwrap() = texts.iter().map(|t| t.to_string()).collect();
    }

    /// `text` shows up once the screen has been looked at `polls` times
    pub fn show_text_after(&self, text: &str, polls: u32) {
        *self.pending.lock().unwrap() = Some(text.to_string());
        self.appear.arm(polls);
    }

    pub fn is_awake(&self) -> bool {
        self.awake.load(Ordering::SeqCst)
    }

    pub fn key_presses(&self) -> Vec<&'static str> {
        self.keys.lock().unwrap().clone()
    }

    pub fn clicks(&self) -> Vec<String> {
        self.clicks.lock().unwrap().clone()
    }

    fn press(&self, key: &'static str) -> bool {
        self.keys.lock().unwrap().push(key);
        true
    }
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

impl UiDevice for FakeUiDevice {
    fn press_home(&self) -> bool {
        self.press("home")
    }

    fn press_back(&self) -> bool {
        self.press("back")
    }

    fn wake_up(&self) -> Result<()> {
        self.awake.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn has_text(&self, text: &str) -> bool {
        let mut pending = self.pending.lock().unwrap();
        if pending.is_some() && self.appear.tick() {
            if let Some(shown) = pending.take() {
                debug!("{:?} appeared on screen", shown);
                self.screen.lock().unwrap().push(shown);
            }
        }
        self.screen.lock().unwrap().iter().any(|t| t == text)
    }

    fn click_text(&self, text: &str) -> bool {
        if !self.screen.lock().unwrap().iter().any(|t| t == text) {
            return false;
        }
        self.clicks.lock().unwrap().push(text.to_string());
        true
    }

    fn dump_hierarchy(&self) -> Result<String> {
        let screen = self.screen.lock().unwrap();
        let mut xml = String::from("<?xml version='1.0' encoding='UTF-8'?>\n");
        xml.push_str("<hierarchy rotation=\"0\">\n");
        for (index, text) in screen.iter().enumerate() {
            xml.push_str(&format!("  <node index=\"{}\" text=\"{}\" clickable=\"true\" />\n",
                                  index,
                                  xml_escape(text)));
        }
        xml.push_str("</hierarchy>\n");
        Ok(xml)
    }
}
