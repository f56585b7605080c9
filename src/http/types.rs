//! Request/response values passed through the interception boundary.

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::Serialize;
use std::collections::BTreeMap;
use url::Url;

pub type Headers = BTreeMap<String, String>;

/// How the client issued the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
  /// Top-level page load
  Navigate,
  #[default]
  Other,
}

/// Declared resource type of a request, when the client knows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
  Document,
  Image,
  Script,
  Style,
  Font,
}

/// An outbound request as seen by the interceptor.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Headers,
  pub body: Option<Vec<u8>>,
  pub mode: RequestMode,
  pub destination: Option<Destination>,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      headers: Headers::new(),
      body: None,
      mode: RequestMode::Other,
      destination: None,
    }
  }

  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      destination: Some(Destination::Document),
      ..Self::get(url)
    }
  }

  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      ..Self::get(url)
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self
      .headers
      .insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = Some(destination);
    self
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }
}

/// A response, either from the network, a partition, or synthesized locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Headers,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Headers::new(),
      body: body.into(),
    }
  }

  /// JSON response with `content-type: application/json`.
  pub fn json<T: Serialize>(status: u16, value: &T) -> Self {
    // serde_json only fails for non-string map keys, which our payloads never use
    let body = serde_json::to_vec(value).unwrap_or_default();
    Self::new(status, body).with_header("content-type", "application/json")
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self
      .headers
      .insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  /// 2xx
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  /// Body parsed as JSON, falling back to the text (or null when empty).
  pub fn json_value(&self) -> serde_json::Value {
    if self.body.is_empty() {
      return serde_json::Value::Null;
    }
    serde_json::from_slice(&self.body).unwrap_or_else(|_| serde_json::Value::String(self.text()))
  }
}

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh data from network
  Network,
  /// Read from a cache partition
  Cache,
  /// Generated locally (offline payload, placeholder, optimistic ack)
  Synthetic,
  /// Not intercepted; forwarded to the network as-is
  Passthrough,
}

/// Result of handling a request, including metadata about the source.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: ResponseSource,
  /// When the response was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Served {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(response: Response, cached_at: DateTime<Utc>) -> Self {
    Self {
      response,
      source: ResponseSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  pub fn synthetic(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Synthetic,
      cached_at: None,
    }
  }

  pub fn passthrough(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Passthrough,
      cached_at: None,
    }
  }
}
