//! Account management with a sync allow-list
//!
//! Accounts added through this snippet start with every sync adapter
//! disabled. Only authorities explicitly allowed with `startSync` get to
//! sync, and a settings listener flips back anything that gets enabled
//! behind our back.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::Value;

use crate::event::{Listener, ListenerHandle, Retention};
use crate::rpc::{to_value, unknown_method, RpcArgs, Snippet};
use crate::{Bundle, Error, Result, SnippetContext};

pub const GOOGLE_ACCOUNT_TYPE: &str = "com.google";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StatusListenerId(pub u64);

/// Account and sync settings of the device
///
/// Sync settings changes are reported to status listeners on a platform
/// thread; the payload carries nothing useful, listeners re-read the state.
pub trait AccountPlatform: Send + Sync {
    fn accounts(&self, account_type: &str) -> Vec<String>;
    fn add_account(&self, account_type: &str, username: &str, password: &str) -> bool;
    fn remove_account(&self, account_type: &str, username: &str) -> bool;

    /// Authorities that have a sync adapter for `account_type`
    fn sync_authorities(&self, account_type: &str) -> Vec<String>;
    fn sync_automatically(&self, username: &str, authority: &str) -> bool;
    fn set_sync_automatically(&self, username: &str, authority: &str, sync: bool);

    fn add_status_listener(&self, listener: Arc<dyn Listener>) -> Result<StatusListenerId>;
    fn remove_status_listener(&self, id: StatusListenerId);
}

type AllowList = HashMap<String, BTreeSet<String>>;

pub struct AccountSnippet {
    ctx: SnippetContext,
    platform: Arc<dyn AccountPlatform>,
    // username -> authorities allowed to sync. Account checks and every
    // change to the platform's accounts or sync settings happen while holding
    // the write lock, so that the check and the toggle are seen together.
    allow_list: Arc<RwLock<AllowList>>,
}

impl AccountSnippet {
    pub fn new(ctx: &SnippetContext) -> Self {
        let snippet = Self { ctx: ctx.clone(),
                             platform: ctx.services().accounts.clone(),
                             allow_list: Arc::new(RwLock::new(HashMap::new())) };
        if let Err(err) = snippet.register_sync_listener() {
            warn!("Sync settings won't be enforced: {}", err);
        }
        snippet
    }

    // Kept for the lifetime of the context, otherwise settings changes made
    // after a call returns would go unnoticed.
    fn register_sync_listener(&self) -> Result<()> {
        let callback_id = format!("account-sync-{}", uuid::Uuid::new_v4());
        let platform = self.platform.clone();
        let allow_list = self.allow_list.clone();
        self.ctx.bridge().register(&callback_id, self.name(), Retention::AdapterLifetime, |_| {
                             let listener: Arc<dyn Listener> = {
                                 let platform = platform.clone();
                                 Arc::new(move |_: &str, _: Bundle| {
                                     enforce_allow_list(&*platform, &allow_list)
                                 })
                             };
                             let id = platform.add_status_listener(listener)?;
                             Ok(ListenerHandle::new(move || platform.remove_status_listener(id)))
                         })
    }

    fn check_account(&self, username: &str) -> Result<()> {
        if self.platform.accounts(GOOGLE_ACCOUNT_TYPE).iter().any(|a| a == username) {
            Ok(())
        } else {
            Err(Error::precondition(format!("Account {} doesn't exist", username)))
        }
    }

    pub fn add_account(&self, username: &str, password: &str) -> Result<()> {
        let mut allow_list = self.allow_list.write().unwrap();
        if self.check_account(username).is_ok() {
            return Err(Error::precondition(format!("Account {} already exists", username)));
        }
        if !self.platform.add_account(GOOGLE_ACCOUNT_TYPE, username, password) {
            return Err(Error::platform_refused("AccountManager.addAccountExplicitly"));
        }
        for authority in self.platform.sync_authorities(GOOGLE_ACCOUNT_TYPE) {
            self.platform.set_sync_automatically(username, &authority, false);
        }
        allow_list.insert(username.to_string(), BTreeSet::new());
        info!("Added account {}", username);
        Ok(())
    }

    pub fn remove_account(&self, username: &str) -> Result<()> {
        let mut allow_list = self.allow_list.write().unwrap();
        self.check_account(username)?;
        if !self.platform.remove_account(GOOGLE_ACCOUNT_TYPE, username) {
            return Err(Error::platform_refused("AccountManager.removeAccount"));
        }
        allow_list.remove(username);
        info!("Removed account {}", username);
        Ok(())
    }

    pub fn list_accounts(&self) -> Vec<String> {
        self.platform.accounts(GOOGLE_ACCOUNT_TYPE)
    }

    fn update_sync(&self, username: &str, authority: &str, sync: bool) -> Result<()> {
        let mut allow_list = self.allow_list.write().unwrap();
        self.check_account(username)?;
        if !self.platform
                .sync_authorities(GOOGLE_ACCOUNT_TYPE)
                .iter()
                .any(|a| a == authority)
        {
            return Err(Error::precondition(format!("No sync adapter for authority {}",
                                                   authority)));
        }
        let allowed = allow_list.entry(username.to_string()).or_default();
        if sync {
            allowed.insert(authority.to_string());
        } else {
            allowed.remove(authority);
        }
        if self.platform.sync_automatically(username, authority) != sync {
            self.platform.set_sync_automatically(username, authority, sync);
        }
        debug!("Sync of {} for {}: {}", authority, username, sync);
        Ok(())
    }

    pub fn start_sync(&self, username: &str, authority: &str) -> Result<()> {
        self.update_sync(username, authority, true)
    }

    pub fn stop_sync(&self, username: &str, authority: &str) -> Result<()> {
        self.update_sync(username, authority, false)
    }

    pub fn list_sync_enabled(&self, username: &str) -> Result<Vec<String>> {
        let allow_list = self.allow_list.read().unwrap();
        self.check_account(username)?;
        Ok(allow_list.get(username)
                     .map(|authorities| authorities.iter().cloned().collect())
                     .unwrap_or_default())
    }
}

// Puts the platform's sync settings back in line with the allow-list for
// every account we manage.
fn enforce_allow_list(platform: &dyn AccountPlatform, allow_list: &RwLock<AllowList>) {
    let allow_list = allow_list.read().unwrap();
    let authorities = platform.sync_authorities(GOOGLE_ACCOUNT_TYPE);
    for (username, allowed) in allow_list.iter() {
        for authority in &authorities {
            let should_sync = allowed.contains(authority);
            if platform.sync_automatically(username, authority) != should_sync {
                debug!("Resetting sync of {} for {} to {}", authority, username, should_sync);
                platform.set_sync_automatically(username, authority, should_sync);
            }
        }
    }
}

#[async_trait]
impl Snippet for AccountSnippet {
    fn name(&self) -> &'static str {
        "account"
    }

    async fn call(&self, method: &str, args: &RpcArgs) -> Result<Value> {
        match method {
            "addAccount" => {
                let username: String = args.get(0)?;
                let password: String = args.get(1)?;
                to_value(self.add_account(&username, &password)?)
            }
            "removeAccount" => to_value(self.remove_account(&args.get::<String>(0)?)?),
            "listAccounts" => to_value(self.list_accounts()),
            "startSync" => {
                let username: String = args.get(0)?;
                let authority: String = args.get(1)?;
                to_value(self.start_sync(&username, &authority)?)
            }
            "stopSync" => {
                let username: String = args.get(0)?;
                let authority: String = args.get(1)?;
                to_value(self.stop_sync(&username, &authority)?)
            }
            "listSyncEnabled" => to_value(self.list_sync_enabled(&args.get::<String>(0)?)?),
            _ => Err(unknown_method(self.name(), method)),
        }
    }

    fn shutdown(&self) {
        self.ctx.bridge().unregister_owned(self.name());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::fake::FakePlatform;
    use crate::{BridgeConfig, ContextConfig, Platform};

    const CONTACTS: &str = "com.android.contacts";
    const CALENDAR: &str = "com.android.calendar";

    fn setup() -> (FakePlatform, SnippetContext, AccountSnippet) {
        let fake = FakePlatform::new();
        let mut config = ContextConfig::new();
        config.set_platform(Platform::Fake(fake.clone()));
        let ctx = config.start().unwrap();
        let snippet = AccountSnippet::new(&ctx);
        (fake, ctx, snippet)
    }

    #[test]
    fn accounts_start_with_sync_disabled() {
        let (fake, _ctx, snippet) = setup();
        // Fresh accounts sync everything until told otherwise
        assert!(fake.accounts.sync_automatically("someone@example.com", CONTACTS));
        snippet.add_account("someone@example.com", "pw").unwrap();
        assert_eq!(snippet.list_accounts(), vec!["someone@example.com"]);
        assert!(!fake.accounts.sync_automatically("someone@example.com", CONTACTS));
        assert!(snippet.list_sync_enabled("someone@example.com").unwrap().is_empty());

        let err = snippet.add_account("someone@example.com", "pw").unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[test]
    fn sync_follows_the_allow_list() {
        let (fake, _ctx, snippet) = setup();
        snippet.add_account("a@example.com", "pw").unwrap();
        snippet.start_sync("a@example.com", CONTACTS).unwrap();
        snippet.start_sync("a@example.com", CALENDAR).unwrap();
        assert!(fake.accounts.sync_automatically("a@example.com", CONTACTS));
        assert_eq!(snippet.list_sync_enabled("a@example.com").unwrap(),
                   vec![CALENDAR.to_string(), CONTACTS.to_string()]);

        snippet.stop_sync("a@example.com", CONTACTS).unwrap();
        assert!(!fake.accounts.sync_automatically("a@example.com", CONTACTS));

        assert!(matches!(snippet.start_sync("nobody@example.com", CONTACTS),
                         Err(Error::Precondition(_))));
        assert!(matches!(snippet.start_sync("a@example.com", "com.example.nope"),
                         Err(Error::Precondition(_))));
    }

    #[test]
    fn settings_changed_elsewhere_are_reverted() {
        let (fake, _ctx, snippet) = setup();
        snippet.add_account("a@example.com", "pw").unwrap();
        snippet.start_sync("a@example.com", CALENDAR).unwrap();

        fake.accounts.user_toggles_sync("a@example.com", CONTACTS, true);
        assert!(!fake.accounts.sync_automatically("a@example.com", CONTACTS));
        fake.accounts.user_toggles_sync("a@example.com", CALENDAR, false);
        assert!(fake.accounts.sync_automatically("a@example.com", CALENDAR));
    }

    #[test]
    fn sync_listener_lives_as_long_as_the_context() {
        let (fake, ctx, snippet) = setup();
        assert_eq!(fake.accounts.status_listeners(), 1);
        snippet.shutdown();
        assert_eq!(fake.accounts.status_listeners(), 1);
        ctx.shutdown();
        assert_eq!(fake.accounts.status_listeners(), 0);

        // Unless lifetime listeners are turned off
        let fake = FakePlatform::new();
        let mut config = ContextConfig::new();
        config.set_platform(Platform::Fake(fake.clone()))
              .set_bridge_config(BridgeConfig { retain_lifetime_listeners: false,
                                                ..Default::default() });
        let ctx = config.start().unwrap();
        let snippet = AccountSnippet::new(&ctx);
        snippet.shutdown();
        assert_eq!(fake.accounts.status_listeners(), 0);
    }

    type Hook = Box<dyn FnOnce() -> thread::JoinHandle<Result<()>> + Send>;

    /// Runs a hook in the middle of the next `sync_authorities` call
    struct Interleaved {
        inner: Arc<dyn AccountPlatform>,
        hook: Mutex<Option<Hook>>,
        spawned: Mutex<Option<thread::JoinHandle<Result<()>>>>,
    }

    impl AccountPlatform for Interleaved {
        fn accounts(&self, account_type: &str) -> Vec<String> {
            self.inner.accounts(account_type)
        }
        fn add_account(&self, account_type: &str, username: &str, password: &str) -> bool {
            self.inner.add_account(account_type, username, password)
        }
        fn remove_account(&self, account_type: &str, username: &str) -> bool {
            self.inner.remove_account(account_type, username)
        }
        fn sync_authorities(&self, account_type: &str) -> Vec<String> {
            let hook = self.hook.lock().unwrap().take();
            if let Some(hook) = hook {
                let handle = hook();
                // Give the other thread every chance to get in
                thread::sleep(Duration::from_millis(50));
                *self.spawned.lock().unwrap() = Some(handle);
            }
            self.inner.sync_authorities(account_type)
        }
        fn sync_automatically(&self, username: &str, authority: &str) -> bool {
            self.inner.sync_automatically(username, authority)
        }
        fn set_sync_automatically(&self, username: &str, authority: &str, sync: bool) {
            self.inner.set_sync_automatically(username, authority, sync)
        }
        fn add_status_listener(&self, listener: Arc<dyn Listener>) -> Result<StatusListenerId> {
            self.inner.add_status_listener(listener)
        }
        fn remove_status_listener(&self, id: StatusListenerId) {
            self.inner.remove_status_listener(id)
        }
    }

    #[test]
    fn removal_racing_start_sync_is_not_undone() {
        let fake = FakePlatform::new();
        let mut services = fake.services();
        let accounts = Arc::new(Interleaved { inner: services.accounts.clone(),
                                              hook: Mutex::new(None),
                                              spawned: Mutex::new(None) });
        services.accounts = accounts.clone();
        let mut config = ContextConfig::new();
        config.set_platform(Platform::Custom(services));
        let ctx = config.start().unwrap();
        let snippet = Arc::new(AccountSnippet::new(&ctx));
        snippet.add_account("a@example.com", "pw").unwrap();

        let remover = snippet.clone();
        *accounts.hook.lock().unwrap() =
            Some(Box::new(move || thread::spawn(move || remover.remove_account("a@example.com"))));
        snippet.start_sync("a@example.com", CONTACTS).unwrap();
        let removed = accounts.spawned.lock().unwrap().take().unwrap().join().unwrap();
        removed.unwrap();

        assert!(snippet.list_accounts().is_empty());
        assert!(!snippet.allow_list.read().unwrap().contains_key("a@example.com"));
        fake.accounts.user_toggles_sync("a@example.com", CONTACTS, false);
        assert!(!fake.accounts.sync_automatically("a@example.com", CONTACTS));
    }

    #[test]
    fn remove_account_forgets_the_allow_list() {
        let (fake, _ctx, snippet) = setup();
        snippet.add_account("a@example.com", "pw").unwrap();
        snippet.start_sync("a@example.com", CONTACTS).unwrap();
        snippet.remove_account("a@example.com").unwrap();
        assert!(snippet.list_accounts().is_empty());
        assert!(matches!(snippet.remove_account("a@example.com"), Err(Error::Precondition(_))));
        // Nothing left to enforce
        fake.accounts.user_toggles_sync("a@example.com", CONTACTS, true);
        assert!(fake.accounts.sync_automatically("a@example.com", CONTACTS));
    }
}
