use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;
use tracing::debug;

use super::types::{Headers, Request, Response};

/// Failure to get any HTTP response at all.
///
/// A non-2xx status is a response, not a `FetchError`.
#[derive(Debug, Error)]
pub enum FetchError {
  #[error("network unreachable for {url}: {reason}")]
  Transport { url: String, reason: String },

  #[error("invalid request for {url}: {reason}")]
  InvalidRequest { url: String, reason: String },
}

/// The network side of the interception boundary.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// reqwest-backed network. No timeout is set; the platform default applies.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new() -> color_eyre::Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("lifeline/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| color_eyre::eyre::eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let url = request.url.to_string();
    let headers = to_header_map(&request.headers).map_err(|reason| FetchError::InvalidRequest {
      url: url.clone(),
      reason,
    })?;

    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone())
      .headers(headers);
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await.map_err(|e| FetchError::Transport {
      url: url.clone(),
      reason: e.to_string(),
    })?;

    let status = response.status().as_u16();
    let headers: Headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response.bytes().await.map_err(|e| FetchError::Transport {
      url: url.clone(),
      reason: e.to_string(),
    })?;

    debug!(%url, status, "network response");

    Ok(Response {
      status,
      headers,
      body: body.to_vec(),
    })
  }
}

fn to_header_map(headers: &Headers) -> Result<HeaderMap, String> {
  let mut map = HeaderMap::new();
  for (name, value) in headers {
    let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| e.to_string())?;
    let value = HeaderValue::from_str(value).map_err(|e| e.to_string())?;
    map.insert(name, value);
  }
  Ok(map)
}
