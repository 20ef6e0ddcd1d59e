//! Small ordered key/value payloads carried by events and returned by
//! snippet calls.

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

#[derive(Clone, Debug, PartialEq)]
pub enum BundleValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    StringList(Vec<String>),
    Bundle(Bundle),
    BundleList(Vec<Bundle>),
}

impl Serialize for BundleValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            BundleValue::Bool(v) => serializer.serialize_bool(*v),
            BundleValue::Int(v) => serializer.serialize_i64(*v),
            BundleValue::Float(v) => serializer.serialize_f64(*v),
            BundleValue::String(v) => serializer.serialize_str(v),
            // Bytes go out as a plain array of numbers, which is what remote
            // callers expect for byte[] values.
            BundleValue::Bytes(v) => {
                let mut seq = serializer.serialize_seq(Some(v.len()))?;
                for b in v {
                    seq.serialize_element(b)?;
                }
                seq.end()
            }
            BundleValue::StringList(v) => v.serialize(serializer),
            BundleValue::Bundle(v) => v.serialize(serializer),
            BundleValue::BundleList(v) => v.serialize(serializer),
        }
    }
}

macro_rules! bundle_value_from {
    ($variant:ident, $ty:ty) => {
        impl From<$ty> for BundleValue {
            fn from(v: $ty) -> Self {
                BundleValue::$variant(v.into())
            }
        }
    };
}
bundle_value_from!(Bool, bool);
bundle_value_from!(Int, i64);
bundle_value_from!(Int, i32);
bundle_value_from!(Int, u32);
bundle_value_from!(Int, i16);
bundle_value_from!(Int, u16);
bundle_value_from!(Int, u8);
bundle_value_from!(Float, f64);
bundle_value_from!(String, String);
bundle_value_from!(String, &str);
bundle_value_from!(Bytes, Vec<u8>);
bundle_value_from!(Bytes, &[u8]);
bundle_value_from!(StringList, Vec<String>);
bundle_value_from!(Bundle, Bundle);
bundle_value_from!(BundleList, Vec<Bundle>);

/// An insertion-ordered mapping from string keys to [`BundleValue`]s
///
/// Putting a key that already exists replaces the value but keeps the
/// key's original position.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Bundle {
    entries: Vec<(String, BundleValue)>,
}

impl Bundle {
    pub fn new() -> Self {
        Self { entries: vec![] }
    }

    pub fn put(&mut self, key: &str, value: impl Into<BundleValue>) -> &mut Self {
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| k.as_str() == key) {
            Some((_, existing)) => *existing = value,
            None => self.entries.push((key.to_string(), value)),
        }
        self
    }

    /// Builder flavour of [`put`](Self::put)
    pub fn with(mut self, key: &str, value: impl Into<BundleValue>) -> Self {
        self.put(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&BundleValue> {
        self.entries.iter().find(|(k, _)| k.as_str() == key).map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(BundleValue::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(BundleValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key) {
            Some(BundleValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        match self.get(key) {
            Some(BundleValue::Bytes(v)) => Some(v),
            _ => None,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BundleValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for Bundle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_insertion_order_and_replaces_in_place() {
        let mut bundle = Bundle::new();
        bundle.put("z", 1i64).put("a", "two").put("m", true);
        bundle.put("a", "three");
        assert_eq!(bundle.keys().collect::<Vec<_>>(), vec!["z", "a", "m"]);
        assert_eq!(bundle.get_str("a"), Some("three"));
        assert_eq!(bundle.get_int("z"), Some(1));
        assert_eq!(bundle.get_bool("m"), Some(true));
        assert_eq!(bundle.get_int("a"), None);
    }

    #[test]
    fn serializes_as_an_ordered_json_object() {
        let inner = Bundle::new().with("rssi", -40i16);
        let bundle = Bundle::new().with("name", "hrm")
                                  .with("data", vec![1u8, 2, 255])
                                  .with("result", inner.clone())
                                  .with("results", vec![inner]);
        let json = serde_json::to_string(&bundle).unwrap();
        assert_eq!(json,
                   r#"{"name":"hrm","data":[1,2,255],"result":{"rssi":-40},"results":[{"rssi":-40}]}"#);
    }
}
