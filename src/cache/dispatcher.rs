//! Strategy dispatcher: answers GET requests from a partition and/or the network.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::classify::classify;
use super::fallback;
use super::storage::PartitionStore;
use super::traits::{cache_key, ResourceClass};
use crate::config::Config;
use crate::http::{Network, Request, Response, Served};

/// Header added to responses served from a partition after a network failure.
pub const SERVED_BY_HEADER: &str = "x-served-by";
pub const SERVED_BY_CACHE: &str = "lifeline-cache";

/// Outcome of a background revalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevalidationOutcome {
  /// Partition entry overwritten with the fresh response
  Updated,
  /// Network answered with a non-2xx status; entry left alone
  Skipped(u16),
  /// Network or storage failure; entry left alone
  Failed(String),
}

#[derive(Debug, Clone)]
pub struct Revalidation {
  pub key: String,
  pub outcome: RevalidationOutcome,
}

/// Observer for detached revalidation tasks. Never affects the caller.
pub type RevalidationHook = Arc<dyn Fn(&Revalidation) + Send + Sync>;

/// Strategy dispatcher that sits between the client and the network.
///
/// | class   | strategy                                     | offline fallback          |
/// |---------|----------------------------------------------|---------------------------|
/// | image   | cache-first                                  | placeholder SVG           |
/// | static  | cache-first, stale-while-revalidate on hits  | root document (navigate)  |
/// | api     | network-first                                | 503 offline payload       |
/// | dynamic | network-first                                | root document (navigate)  |
#[derive(Clone)]
pub struct Dispatcher {
  config: Arc<Config>,
  store: Arc<dyn PartitionStore>,
  network: Arc<dyn Network>,
  revalidation_hook: Option<RevalidationHook>,
}

impl Dispatcher {
  pub fn new(config: Arc<Config>, store: Arc<dyn PartitionStore>, network: Arc<dyn Network>) -> Self {
    Self {
      config,
      store,
      network,
      revalidation_hook: None,
    }
  }

  /// Observe background revalidation outcomes.
  #[cfg(test)]
  pub fn with_revalidation_hook(mut self, hook: RevalidationHook) -> Self {
    self.revalidation_hook = Some(hook);
    self
  }

  pub fn partition_for(&self, class: ResourceClass) -> String {
    self.config.partition_name(class.as_str())
  }

  /// Handle a non-mutating request.
  ///
  /// Requests to foreign origins that are not allow-listed are passed straight
  /// to the network without touching any partition.
  pub async fn handle(&self, request: &Request) -> Result<Served> {
    if !self.config.is_allowed_origin(&request.url) {
      debug!(url = %request.url, "foreign origin, passing through");
      let response = self
        .network
        .fetch(request)
        .await
        .map_err(|e| eyre!(e))?;
      return Ok(Served::passthrough(response));
    }

    let class = classify(request);
    debug!(url = %request.url, %class, "dispatching");

    match class {
      ResourceClass::Image | ResourceClass::Static => self.cache_first(request, class).await,
      ResourceClass::Api | ResourceClass::Dynamic => self.network_first(request, class).await,
    }
  }

  /// Cache-first.
  ///
  /// 1. Partition hit - return it (static hits also revalidate in the background)
  /// 2. Miss - fetch, store 2xx, return the network response
  /// 3. Miss and network failure - class-specific fallback
  async fn cache_first(&self, request: &Request, class: ResourceClass) -> Result<Served> {
    let partition = self.partition_for(class);
    let key = cache_key(&request.url);

    if let Some(cached) = self.store.get(&partition, &key)? {
      debug!(%key, %partition, "served from cache");
      if class == ResourceClass::Static {
        self.spawn_revalidation(request.clone(), partition, key);
      }
      return Ok(Served::from_cache(cached.response, cached.cached_at));
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        self.store_if_success(&partition, &key, &response);
        Ok(Served::from_network(response))
      }
      Err(e) => {
        info!(%key, error = %e, "cache miss while offline");
        match class {
          ResourceClass::Image => Ok(Served::synthetic(fallback::placeholder_image())),
          _ if request.is_navigation() => self.navigation_fallback(),
          _ => Err(eyre!(e)),
        }
      }
    }
  }

  /// Network-first.
  ///
  /// 1. Fetch - store 2xx, return the network response (any status)
  /// 2. On network failure, return the partition entry annotated as cached
  /// 3. Otherwise the class-specific offline response
  async fn network_first(&self, request: &Request, class: ResourceClass) -> Result<Served> {
    let partition = self.partition_for(class);
    let key = cache_key(&request.url);

    let error = match self.network.fetch(request).await {
      Ok(response) => {
        self.store_if_success(&partition, &key, &response);
        return Ok(Served::from_network(response));
      }
      Err(e) => e,
    };

    info!(%key, error = %error, "network failed, trying cache");

    if let Some(cached) = self.store.get(&partition, &key)? {
      let response = cached
        .response
        .with_header(SERVED_BY_HEADER, SERVED_BY_CACHE);
      return Ok(Served::from_cache(response, cached.cached_at));
    }

    match class {
      ResourceClass::Api => Ok(Served::synthetic(fallback::offline_api_response())),
      _ if request.is_navigation() => self.navigation_fallback(),
      _ => Err(eyre!(error)),
    }
  }

  /// Cached root document, or the generated offline page.
  fn navigation_fallback(&self) -> Result<Served> {
    let partition = self.partition_for(ResourceClass::Static);
    let key = cache_key(&self.config.root_document_url()?);

    match self.store.get(&partition, &key)? {
      Some(cached) => Ok(Served::from_cache(cached.response, cached.cached_at)),
      None => Ok(Served::synthetic(fallback::offline_page())),
    }
  }

  /// Write a fresh 2xx response. A failed write is logged and does not fail
  /// the request that produced the response.
  fn store_if_success(&self, partition: &str, key: &str, response: &Response) {
    if !response.is_success() {
      return;
    }
    match self.store.put(partition, key, response) {
      Ok(()) => debug!(%key, %partition, "cache updated"),
      Err(e) => warn!(%key, %partition, error = %e, "cache write failed"),
    }
  }

  /// Detached refresh of a cached static entry; the result never reaches the caller.
  fn spawn_revalidation(&self, request: Request, partition: String, key: String) {
    let store = Arc::clone(&self.store);
    let network = Arc::clone(&self.network);
    let hook = self.revalidation_hook.clone();

    tokio::spawn(async move {
      let outcome = match network.fetch(&request).await {
        Ok(response) if response.is_success() => match store.put(&partition, &key, &response) {
          Ok(()) => RevalidationOutcome::Updated,
          Err(e) => RevalidationOutcome::Failed(e.to_string()),
        },
        Ok(response) => RevalidationOutcome::Skipped(response.status),
        Err(e) => RevalidationOutcome::Failed(e.to_string()),
      };

      match &outcome {
        RevalidationOutcome::Updated => debug!(%key, "background revalidation updated cache"),
        RevalidationOutcome::Skipped(status) => debug!(%key, status, "background revalidation skipped"),
        RevalidationOutcome::Failed(reason) => debug!(%key, %reason, "background revalidation failed"),
      }

      if let Some(hook) = hook {
        hook(&Revalidation { key, outcome });
      }
    });
  }

  /// Fetch `paths` and store every 2xx answer in the class partition.
  ///
  /// Best-effort: per-resource failures are logged and skipped. Returns the
  /// number of entries written.
  pub async fn warm(&self, class: ResourceClass, paths: &[String]) -> Result<usize> {
    let partition = self.partition_for(class);
    self.store.open(&partition)?;
    let partition = partition.as_str();

    let fetches = paths.iter().map(|path| async move {
      let url = match self.config.resolve(path) {
        Ok(url) => url,
        Err(e) => {
          warn!(%path, error = %e, "skipping unresolvable resource");
          return false;
        }
      };
      let key = cache_key(&url);
      match self.network.fetch(&Request::get(url)).await {
        Ok(response) if response.is_success() => match self.store.put(partition, &key, &response) {
          Ok(()) => true,
          Err(e) => {
            warn!(%key, error = %e, "failed to store warmed resource");
            false
          }
        },
        Ok(response) => {
          info!(%key, status = response.status, "failed to warm resource");
          false
        }
        Err(e) => {
          info!(%key, error = %e, "failed to warm resource");
          false
        }
      }
    });

    let stored = futures::future::join_all(fetches)
      .await
      .into_iter()
      .filter(|stored| *stored)
      .count();

    Ok(stored)
  }

  /// Re-fetch every configured API endpoint, overwriting the api partition
  /// on success.
  pub async fn refresh_api_cache(&self) -> Result<usize> {
    let refreshed = self
      .warm(ResourceClass::Api, &self.config.api_endpoints)
      .await?;
    info!(refreshed, total = self.config.api_endpoints.len(), "api cache refreshed");
    Ok(refreshed)
  }

  /// Fetch every path and store them only if all succeed.
  pub async fn warm_all_or_nothing(&self, class: ResourceClass, paths: &[String]) -> Result<usize> {
    let partition = self.partition_for(class);
    self.store.open(&partition)?;

    let fetches = paths.iter().map(|path| async move {
      let url = self.config.resolve(path)?;
      let response = self
        .network
        .fetch(&Request::get(url.clone()))
        .await
        .map_err(|e| eyre!(e))?;
      if !response.is_success() {
        return Err(eyre!("Essential resource {} returned HTTP {}", url, response.status));
      }
      Ok::<_, color_eyre::Report>((cache_key(&url), response))
    });

    let fetched = futures::future::try_join_all(fetches).await?;

    for (key, response) in &fetched {
      self.store.put(&partition, key, response)?;
    }

    debug!(%partition, count = fetched.len(), "essential resources cached");
    Ok(fetched.len())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqlitePartitionStore;
  use crate::db::Database;
  use crate::testing::FakeNetwork;
  use tokio::sync::mpsc;
  use url::Url;

  fn setup() -> (Dispatcher, Arc<FakeNetwork>, Arc<SqlitePartitionStore>, Arc<Config>) {
    let config = Arc::new(Config::default());
    let store = Arc::new(SqlitePartitionStore::new(Arc::new(
      Database::open_in_memory().unwrap(),
    )));
    let network = Arc::new(FakeNetwork::new());
    let dispatcher = Dispatcher::new(config.clone(), store.clone(), network.clone());
    (dispatcher, network, store, config)
  }

  fn url(config: &Config, path: &str) -> Url {
    config.resolve(path).unwrap()
  }

  #[tokio::test]
  async fn test_image_cache_hit_skips_network() {
    let (dispatcher, network, store, config) = setup();
    let logo = url(&config, "/assets/logo.png");
    store
      .put(
        &config.partition_name("image"),
        &cache_key(&logo),
        &Response::new(200, "cached-png"),
      )
      .unwrap();
    network.respond(logo.as_str(), Response::new(200, "fresh-png"));

    let served = dispatcher.handle(&Request::get(logo)).await.unwrap();

    assert_eq!(served.source, crate::http::ResponseSource::Cache);
    assert_eq!(served.response.text(), "cached-png");
    assert_eq!(network.call_count(), 0);
  }

  #[tokio::test]
  async fn test_image_miss_stores_and_offline_placeholder() {
    let (dispatcher, network, store, config) = setup();
    let photo = url(&config, "/assets/photo.jpg");
    network.respond(photo.as_str(), Response::new(200, "jpg"));

    let served = dispatcher.handle(&Request::get(photo.clone())).await.unwrap();
    assert_eq!(served.source, crate::http::ResponseSource::Network);
    assert!(store
      .get(&config.partition_name("image"), &cache_key(&photo))
      .unwrap()
      .is_some());

    let missing = url(&config, "/assets/missing.png");
    let served = dispatcher.handle(&Request::get(missing)).await.unwrap();
    assert_eq!(served.source, crate::http::ResponseSource::Synthetic);
    assert_eq!(served.response.header("content-type"), Some("image/svg+xml"));
  }

  #[tokio::test]
  async fn test_api_network_first_updates_cache() {
    let (dispatcher, network, store, config) = setup();
    let doctors = url(&config, "/api/v1/doctors");
    store
      .put(
        &config.partition_name("api"),
        &cache_key(&doctors),
        &Response::new(200, "old"),
      )
      .unwrap();
    network.respond(doctors.as_str(), Response::new(200, "new"));

    let served = dispatcher.handle(&Request::get(doctors.clone())).await.unwrap();

    assert_eq!(served.response.text(), "new");
    assert_eq!(network.call_count(), 1);
    let cached = store
      .get(&config.partition_name("api"), &cache_key(&doctors))
      .unwrap()
      .unwrap();
    assert_eq!(cached.response.text(), "new");
  }

  #[tokio::test]
  async fn test_api_error_status_is_returned_but_not_cached() {
    let (dispatcher, network, store, config) = setup();
    let doctors = url(&config, "/api/v1/doctors");
    store
      .put(
        &config.partition_name("api"),
        &cache_key(&doctors),
        &Response::new(200, "good"),
      )
      .unwrap();
    network.respond(doctors.as_str(), Response::new(500, "boom"));

    let served = dispatcher.handle(&Request::get(doctors.clone())).await.unwrap();

    assert_eq!(served.response.status, 500);
    let cached = store
      .get(&config.partition_name("api"), &cache_key(&doctors))
      .unwrap()
      .unwrap();
    assert_eq!(cached.response.text(), "good");
  }

  #[tokio::test]
  async fn test_api_offline_falls_back_to_annotated_cache() {
    let (dispatcher, _network, store, config) = setup();
    let pharmacies = url(&config, "/api/v1/pharmacies");
    store
      .put(
        &config.partition_name("api"),
        &cache_key(&pharmacies),
        &Response::new(200, "[]"),
      )
      .unwrap();

    let served = dispatcher.handle(&Request::get(pharmacies)).await.unwrap();

    assert_eq!(served.source, crate::http::ResponseSource::Cache);
    assert_eq!(served.response.header(SERVED_BY_HEADER), Some(SERVED_BY_CACHE));
    assert!(served.cached_at.is_some());
  }

  #[tokio::test]
  async fn test_api_offline_without_cache_is_503_payload() {
    let (dispatcher, _network, _store, config) = setup();

    let served = dispatcher
      .handle(&Request::get(url(&config, "/api/v1/villages")))
      .await
      .unwrap();

    assert_eq!(served.response.status, 503);
    let body = served.response.json_value();
    assert_eq!(body["error"], "offline");
    assert_eq!(body["offline"], true);
    assert!(body["timestamp"].is_i64());
  }

  #[tokio::test]
  async fn test_dynamic_offline_navigation_serves_root_document() {
    let (dispatcher, _network, store, config) = setup();
    let root = config.root_document_url().unwrap();
    store
      .put(
        &config.partition_name("static"),
        &cache_key(&root),
        &Response::new(200, "<html>shell</html>"),
      )
      .unwrap();

    let served = dispatcher
      .handle(&Request::navigate(url(&config, "/doctors/list")))
      .await
      .unwrap();
    assert_eq!(served.response.text(), "<html>shell</html>");

    // Non-navigation with nothing cached propagates the failure
    let result = dispatcher
      .handle(&Request::get(url(&config, "/doctors/list")))
      .await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_navigation_without_root_document_gets_offline_page() {
    let (dispatcher, _network, _store, config) = setup();

    let served = dispatcher
      .handle(&Request::navigate(url(&config, "/profile")))
      .await
      .unwrap();

    assert_eq!(served.source, crate::http::ResponseSource::Synthetic);
    assert_eq!(served.response.header("content-type"), Some("text/html"));
  }

  #[tokio::test]
  async fn test_static_hit_revalidates_in_background() {
    let (dispatcher, network, store, config) = setup();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let dispatcher = dispatcher.with_revalidation_hook(Arc::new(move |r: &Revalidation| {
      let _ = tx.send(r.clone());
    }));
    let app_js = url(&config, "/app.js");
    let partition = config.partition_name("static");
    store
      .put(&partition, &cache_key(&app_js), &Response::new(200, "v1"))
      .unwrap();
    network.respond(app_js.as_str(), Response::new(200, "v2"));

    let served = dispatcher.handle(&Request::get(app_js.clone())).await.unwrap();
    assert_eq!(served.response.text(), "v1");

    let revalidation = rx.recv().await.unwrap();
    assert_eq!(revalidation.outcome, RevalidationOutcome::Updated);
    let cached = store.get(&partition, &cache_key(&app_js)).unwrap().unwrap();
    assert_eq!(cached.response.text(), "v2");
  }

  #[tokio::test]
  async fn test_static_revalidation_failure_is_swallowed() {
    let (dispatcher, _network, store, config) = setup();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let dispatcher = dispatcher.with_revalidation_hook(Arc::new(move |r: &Revalidation| {
      let _ = tx.send(r.clone());
    }));
    let css = url(&config, "/main.css");
    let partition = config.partition_name("static");
    store
      .put(&partition, &cache_key(&css), &Response::new(200, "body{}"))
      .unwrap();

    let served = dispatcher.handle(&Request::get(css.clone())).await.unwrap();
    assert_eq!(served.response.text(), "body{}");

    let revalidation = rx.recv().await.unwrap();
    assert!(matches!(revalidation.outcome, RevalidationOutcome::Failed(_)));
    let cached = store.get(&partition, &cache_key(&css)).unwrap().unwrap();
    assert_eq!(cached.response.text(), "body{}");
  }

  #[tokio::test]
  async fn test_foreign_origin_passes_through_uncached() {
    let (dispatcher, network, store, config) = setup();
    network.respond("https://tracker.example/pixel.png", Response::new(200, "gif"));

    let served = dispatcher
      .handle(&Request::get(
        Url::parse("https://tracker.example/pixel.png").unwrap(),
      ))
      .await
      .unwrap();

    assert_eq!(served.source, crate::http::ResponseSource::Passthrough);
    assert!(store
      .keys(&config.partition_name("image"))
      .unwrap()
      .is_empty());
  }

  #[tokio::test]
  async fn test_allowed_origin_is_intercepted() {
    let (dispatcher, network, store, config) = setup();
    let font = "https://fonts.gstatic.com/s/roboto.svg";
    network.respond(font, Response::new(200, "<svg/>"));

    dispatcher
      .handle(&Request::get(Url::parse(font).unwrap()))
      .await
      .unwrap();

    assert_eq!(
      store.keys(&config.partition_name("image")).unwrap(),
      vec![font.to_string()]
    );
  }

  #[tokio::test]
  async fn test_warm_all_or_nothing_writes_nothing_on_failure() {
    let (dispatcher, network, store, config) = setup();
    network.respond(url(&config, "/index.html").as_str(), Response::new(200, "<html/>"));
    network.respond(url(&config, "/").as_str(), Response::new(200, "<html/>"));
    // manifest.json unreachable

    let result = dispatcher
      .warm_all_or_nothing(ResourceClass::Static, &config.essential_resources)
      .await;

    assert!(result.is_err());
    assert!(store
      .keys(&config.partition_name("static"))
      .unwrap()
      .is_empty());
  }
}
