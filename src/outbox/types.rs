use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::http::{Headers, Request};

/// Operation class of a queued mutation; also the name of its sync trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncTag {
  Booking,
  EmergencyAlert,
  SymptomAnalysis,
  Generic,
}

impl SyncTag {
  /// Drain order for a full sync: emergencies first.
  pub const ALL: [SyncTag; 4] = [
    SyncTag::EmergencyAlert,
    SyncTag::Booking,
    SyncTag::SymptomAnalysis,
    SyncTag::Generic,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Booking => "booking",
      Self::EmergencyAlert => "emergency-alert",
      Self::SymptomAnalysis => "symptom-analysis",
      Self::Generic => "generic",
    }
  }

  /// Priority given to new entries of this class.
  pub fn priority(&self) -> Priority {
    match self {
      Self::EmergencyAlert => Priority::High,
      _ => Priority::Normal,
    }
  }
}

impl std::fmt::Display for SyncTag {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for SyncTag {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    SyncTag::ALL
      .into_iter()
      .find(|tag| tag.as_str() == s)
      .ok_or_else(|| eyre!("Unknown sync tag: {}", s))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  #[default]
  Normal,
  High,
}

/// Everything needed to replay a mutation verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDescriptor {
  pub url: String,
  pub method: String,
  #[serde(default)]
  pub headers: Headers,
  #[serde(default)]
  pub body: Option<String>,
  #[serde(default)]
  pub priority: Priority,
}

impl RequestDescriptor {
  pub fn from_request(request: &Request, priority: Priority) -> Self {
    Self {
      url: request.url.to_string(),
      method: request.method.to_string(),
      headers: request.headers.clone(),
      body: request
        .body
        .as_ref()
        .map(|body| String::from_utf8_lossy(body).into_owned()),
      priority,
    }
  }
}

/// Store-assigned, monotonic entry id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EntryId(pub i64);

impl std::fmt::Display for EntryId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// A queued mutation. Never updated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
  pub id: EntryId,
  pub tag: SyncTag,
  pub request: RequestDescriptor,
  pub enqueued_at: DateTime<Utc>,
}

/// An entry that exhausted its replay attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
  pub id: EntryId,
  pub tag: SyncTag,
  pub request: RequestDescriptor,
  pub enqueued_at: DateTime<Utc>,
  pub attempts: u32,
  pub last_error: String,
  pub abandoned_at: DateTime<Utc>,
}
