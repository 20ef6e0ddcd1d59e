//! Snippets exposing device APIs (Bluetooth, BLE, WiFi, telephony, SMS,
//! accounts, media, storage, notifications and UI automation) as remotely
//! invocable operations.
//!
//! Every snippet is a thin adapter over a platform service trait. The shared
//! mechanics are the bounded poll-wait in [`poll`] and the callback-id
//! correlated event bridge in [`event`], both owned by a [`SnippetContext`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use arrayvec::ArrayVec;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

pub mod uuid;

pub mod poll;

pub mod bundle;
pub use bundle::{Bundle, BundleValue};

pub mod event;
pub use event::{BridgeConfig, EventBridge, EventSink, Listener, ListenerHandle, Retention,
                SnippetEvent};

pub mod context;
pub use context::{BroadcastService, ContextConfig, Platform, PlatformServices, ReceiverGuard,
                  ReceiverId, SnippetContext};

pub mod rpc;
pub use rpc::{EventSnippet, RpcArgs, Snippet, SnippetRegistry};

pub mod capability;

pub mod account;
pub mod bluetooth;
pub mod media;
pub mod notification;
pub mod sms;
pub mod storage;
pub mod telephony;
pub mod transfer;
pub mod ui;
pub mod wifi;

pub mod fake;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MAC(u64);
impl fmt::Display for MAC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bytes = u64::to_le_bytes(self.0);
        write!(f,
               "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
               bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5])
    }
}

/// The address of a remote device (Bluetooth or WiFi peer)
///
/// Hardware MAC addresses are normalized so that two spellings of the same
/// address compare equal. Anything that doesn't parse as a 48 bit MAC is
/// kept verbatim, since some platform APIs hand out opaque identifiers.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Address {
    MAC(MAC),
    String(String),
}
impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Address::MAC(mac) => {
                write!(f, "{}", mac)
            }
            Address::String(s) => {
                write!(f, "{}", s)
            }
        }
    }
}
impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Address::MAC(mac) => {
                write!(f, "MAC:{}", mac)
            }
            Address::String(s) => {
                write!(f, "String:{}", s)
            }
        }
    }
}

// Addresses travel over RPC as plain strings, e.g. "F1:E2:D3:C4:B5:A6"
impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Address::from_str(&s).map_err(de::Error::custom)
    }
}

// Returns None rather than an error since a valid address might not be a
// MAC address at all.
fn try_u64_from_mac48_str(s: &str) -> Option<u64> {
    if !s.contains(':') {
        return None;
    }
    let mut parts = ArrayVec::<_, 6>::new();
    for part in s.split(':') {
        if parts.try_push(part).is_err() {
            return None;
        }
    }
    if parts.len() != 6 {
        return None;
    }
    let mut bytes = [0u8; 8];
    for (i, part) in parts.iter().enumerate() {
        if part.len() != 2 {
            return None;
        }
        bytes[i] = u8::from_str_radix(part, 16).ok()?;
    }
    Some(u64::from_le_bytes(bytes))
}

impl FromStr for Address {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> std::result::Result<Self, std::convert::Infallible> {
        match try_u64_from_mac48_str(s) {
            Some(val) => Ok(Address::MAC(MAC(val))),
            None => Ok(Address::String(s.to_string())),
        }
    }
}

#[test]
fn mac_two_way() {
    let addr = Address::from_str("f1:e2:d3:c4:b5:a6").unwrap();
    assert!(matches!(addr, Address::MAC(_)));
    // Android is very particular about upper case address octets
    assert_eq!(addr.to_string(), "F1:E2:D3:C4:B5:A6");
    assert_eq!(addr, Address::from_str("F1:E2:D3:C4:B5:A6").unwrap());

    let addr = Address::from_str("18c2a267-a539-4423-aecc-edeeb2784bcc").unwrap();
    assert!(matches!(addr, Address::String(_)));
    assert_eq!(addr.to_string(), "18c2a267-a539-4423-aecc-edeeb2784bcc");

    let addr = Address::from_str("F1:E2:D3:C4:B5:A6:00").unwrap();
    assert!(matches!(addr, Address::String(_)));
}

#[test]
fn address_json_is_a_plain_string() {
    let addr = Address::from_str("0a:0b:0c:0d:0e:0f").unwrap();
    let json = serde_json::to_value(&addr).unwrap();
    assert_eq!(json, serde_json::json!("0A:0B:0C:0D:0E:0F"));
    let back: Address = serde_json::from_value(json).unwrap();
    assert_eq!(back, addr);
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Callback id {0:?} already has an active registration")]
    AlreadyRegistered(String),

    #[error("{0}")]
    Precondition(String),

    #[error("{api} failed: {detail}")]
    Platform { api: &'static str, detail: String },

    #[error("Timed out after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },

    #[error("Poll predicate failed: {0}")]
    Predicate(#[source] Box<Error>),

    #[error("{api} is not supported on this platform: {reason}")]
    Unsupported { api: &'static str, reason: String },

    #[error("Unknown method {0:?}")]
    UnknownMethod(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn precondition(msg: impl Into<String>) -> Self {
        Error::Precondition(msg.into())
    }

    /// A platform API reported a non-success status code
    pub(crate) fn platform_code(api: &'static str, code: i32) -> Self {
        Error::Platform { api, detail: format!("platform status code {}", code) }
    }

    /// A platform API returned `false`
    pub(crate) fn platform_refused(api: &'static str) -> Self {
        Error::Platform { api, detail: "platform call returned false".to_string() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
