//! Test doubles shared by the unit tests.

use async_trait::async_trait;
use color_eyre::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::http::{FetchError, Network, Request, Response};
use crate::notify::WindowOpener;

/// Scripted network: URLs with a registered response answer with it, every
/// other URL (or every URL while offline) fails at the transport level.
#[derive(Default)]
pub struct FakeNetwork {
  responses: Mutex<HashMap<String, Response>>,
  offline: AtomicBool,
  requests: Mutex<Vec<Request>>,
}

impl FakeNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, url: &str, response: Response) {
    self
      .responses
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn requests(&self) -> Vec<Request> {
    self.requests.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.requests.lock().unwrap().len()
  }

  /// Wait (up to a second) for a request whose path is `path`.
  pub async fn wait_for_request(&self, path: &str) -> Request {
    for _ in 0..100 {
      if let Some(request) = self
        .requests()
        .into_iter()
        .find(|r| r.url.path() == path)
      {
        return request;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no request to {} was made", path);
  }
}

#[async_trait]
impl Network for FakeNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    self.requests.lock().unwrap().push(request.clone());
    // Let concurrent callers interleave like real I/O would
    tokio::task::yield_now().await;

    if self.offline.load(Ordering::SeqCst) {
      return Err(FetchError::Transport {
        url: request.url.to_string(),
        reason: "offline".to_string(),
      });
    }

    let response = self
      .responses
      .lock()
      .unwrap()
      .get(request.url.as_str())
      .cloned();

    response.ok_or_else(|| FetchError::Transport {
      url: request.url.to_string(),
      reason: "connection refused".to_string(),
    })
  }
}

/// Records every URL it is asked to open.
#[derive(Default)]
pub struct RecordingOpener {
  opened: Mutex<Vec<String>>,
}

impl RecordingOpener {
  pub fn opened(&self) -> Vec<String> {
    self.opened.lock().unwrap().clone()
  }
}

#[async_trait]
impl WindowOpener for RecordingOpener {
  async fn open(&self, url: &str) -> Result<()> {
    self.opened.lock().unwrap().push(url.to_string());
    Ok(())
  }
}
