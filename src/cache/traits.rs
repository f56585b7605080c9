//! Core types for the partition cache.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use url::Url;

use crate::http::Response;

/// Resource class of a GET request. Selects both the strategy and the partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
  Static,
  Dynamic,
  Image,
  Api,
}

impl ResourceClass {
  pub const ALL: [ResourceClass; 4] = [
    ResourceClass::Static,
    ResourceClass::Dynamic,
    ResourceClass::Image,
    ResourceClass::Api,
  ];

  /// Name segment used in partition names
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::Dynamic => "dynamic",
      Self::Image => "image",
      Self::Api => "api",
    }
  }
}

impl std::fmt::Display for ResourceClass {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A stored response and its capture time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
  pub response: Response,
  pub cached_at: DateTime<Utc>,
}

/// Partition key for a URL: absolute, fragment stripped, query kept.
///
/// Keys are method-independent; only GET responses are ever stored.
pub fn cache_key(url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);
  url.to_string()
}

/// Fixed-length row address for a key.
pub fn key_hash(key: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(key.as_bytes());
  hex::encode(hasher.finalize())
}
