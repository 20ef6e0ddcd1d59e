//! Hidden platform APIs
//!
//! Some operations need platform methods that aren't part of the public
//! SDK (and typically have to be reached reflectively). Snippets never call
//! those directly: each group of hidden methods sits behind its own trait,
//! and platforms that can't provide them plug in [`Unsupported`] so that
//! callers get a clear [`Error::Unsupported`] instead of a crash.

use crate::{Error, Result};

/// Stand-in for a hidden API group that isn't available
#[derive(Clone, Debug)]
pub struct Unsupported {
    reason: String,
}

impl Unsupported {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }

    pub fn fail<T>(&self, api: &'static str) -> Result<T> {
        Err(Error::Unsupported { api, reason: self.reason.clone() })
    }
}

impl Default for Unsupported {
    fn default() -> Self {
        Self::new("hidden API not exposed on this platform version")
    }
}
