//! The gateway: named lifecycle hooks and the per-request interception
//! state machine.

use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheManager, CacheStorage, SqliteStorage};
use crate::config::{Config, OfflineFallback};
use crate::event::ControlMessage;
use crate::queue::{self, QueueStore};
use crate::sync::{DrainReport, SyncDrainer};

use super::fetch::{Fetch, HttpFetcher};
use super::types::{FetchResult, Request, Response};

/// Sits between the application and the network.
///
/// Reads are cache-first with network fallback; writes are network-first
/// with a durable local fallback. Each lifecycle signal maps to one named
/// hook; the gateway itself keeps no per-request state.
pub struct Gateway<S: CacheStorage = SqliteStorage> {
  config: Config,
  cache: CacheManager<S>,
  fetcher: Arc<dyn Fetch>,
  /// Queue store handle, opened lazily at most once. Concurrent early
  /// callers await the same pending open instead of racing to create it.
  queue: OnceCell<QueueStore>,
}

impl Gateway<SqliteStorage> {
  pub fn new(config: Config) -> Result<Self> {
    let storage = SqliteStorage::open()?;
    let fetcher = Arc::new(HttpFetcher::new()?);
    Ok(Self::with_parts(config, storage, fetcher))
  }
}

impl<S: CacheStorage> Gateway<S> {
  pub fn with_parts(config: Config, storage: S, fetcher: Arc<dyn Fetch>) -> Self {
    let cache = CacheManager::new(storage, config.cache_version.clone());
    Self {
      config,
      cache,
      fetcher,
      queue: OnceCell::new(),
    }
  }

  /// Use a pre-opened queue store instead of the default on-disk one.
  #[allow(dead_code)]
  pub fn with_queue(mut self, queue: QueueStore) -> Self {
    self.queue = OnceCell::new_with(Some(queue));
    self
  }

  async fn queue(&self) -> Result<&QueueStore> {
    self
      .queue
      .get_or_try_init(|| async { QueueStore::open() })
      .await
  }

  /// Install: eagerly populate the configured cache version. An error here
  /// means the new version must not become active.
  pub async fn handle_install(&self) -> Result<()> {
    self
      .cache
      .initialize(&self.config.origin, &self.config.assets, self.fetcher.as_ref())
      .await
  }

  /// Activate: evict every cache version except the current one.
  pub async fn handle_activate(&self) -> Result<()> {
    self.cache.reclaim()
  }

  /// Inbound control message from the hosting application.
  pub async fn handle_message(&self, message: ControlMessage) -> Result<()> {
    match message {
      ControlMessage::SkipWaiting => {
        debug!("skip-waiting received, activating immediately");
        self.handle_activate().await
      }
    }
  }

  /// Reconnect signal: drain the retry queue if the tag is ours.
  pub async fn handle_sync(&self, tag: &str) -> Result<DrainReport> {
    if tag != self.config.sync_tag {
      debug!(tag, "ignoring sync signal for unknown tag");
      return Ok(DrainReport::default());
    }

    let queue = self.queue().await?;
    let drainer = SyncDrainer::new(
      self.fetcher.clone(),
      self.config.endpoint.clone(),
      self.config.policy.write_body_encoding.content_type(),
    );
    drainer.drain(queue).await
  }

  /// Intercept one outgoing request.
  ///
  /// Infallible by design: network and storage failures are converted into
  /// one of the terminal outcomes, never surfaced to the caller.
  pub async fn handle_fetch(&self, request: Request) -> FetchResult {
    if request.method.is_read() {
      self.read_path(request).await
    } else {
      self.write_path(request).await
    }
  }

  async fn read_path(&self, request: Request) -> FetchResult {
    let key = request.key();

    match self.cache.lookup(&key) {
      Ok(Some(response)) => return FetchResult::from_cache(response),
      Ok(None) => {}
      Err(e) => warn!(key = %key, error = %e, "cache lookup failed, falling through to network"),
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if self.should_cache(&response) {
          if let Err(e) = self.cache.store(&key, &response) {
            warn!(key = %key, error = %e, "failed to cache network response");
          }
        }
        FetchResult::from_network(response)
      }
      Err(e) => {
        debug!(key = %key, error = %e, "network unavailable, serving offline response");
        FetchResult::offline(self.offline_response())
      }
    }
  }

  async fn write_path(&self, request: Request) -> FetchResult {
    // Clone for the network attempt; the original keeps the payload for
    // queueing if delivery fails.
    match self.fetcher.fetch(request.clone()).await {
      Ok(response) => FetchResult::delivered(response),
      Err(e) => {
        debug!(url = %request.url, error = %e, "write failed, queueing for retry");
        match self.enqueue(&request).await {
          Ok(queue_key) => {
            debug!(key = %queue_key, "write queued");
            FetchResult::queued(Response::saved_offline())
          }
          Err(store_err) => {
            warn!(error = %store_err, "failed to queue offline write");
            FetchResult::offline(self.offline_response())
          }
        }
      }
    }
  }

  async fn enqueue(&self, request: &Request) -> Result<String> {
    let queue = self.queue().await?;
    let key = queue::next_key();
    queue.put(&key, &request.body)?;
    Ok(key)
  }

  /// Dynamic-caching policy: only successful same-origin responses that are
  /// not the remote endpoint itself.
  fn should_cache(&self, response: &Response) -> bool {
    if !self.config.policy.dynamic_caching || response.status != 200 {
      return false;
    }

    let Ok(url) = Url::parse(&response.url) else {
      return false;
    };

    self.same_origin(&url) && !self.touches_endpoint(&response.url)
  }

  fn same_origin(&self, url: &Url) -> bool {
    let origin = &self.config.origin;
    url.scheme() == origin.scheme()
      && url.host_str() == origin.host_str()
      && url.port_or_known_default() == origin.port_or_known_default()
  }

  fn touches_endpoint(&self, url: &str) -> bool {
    match self.config.endpoint.host_str() {
      Some(host) => url.contains(host),
      None => false,
    }
  }

  fn offline_response(&self) -> Response {
    match self.config.policy.offline_fallback {
      OfflineFallback::Placeholder => Response::offline_placeholder(),
      OfflineFallback::CachedDocument => {
        let root = match self.config.origin.join("/") {
          Ok(url) => Request::get(url).key(),
          Err(_) => return Response::offline_placeholder(),
        };
        match self.cache.lookup(&root) {
          Ok(Some(response)) => response,
          _ => Response::offline_placeholder(),
        }
      }
    }
  }

  pub fn cache(&self) -> &CacheManager<S> {
    &self.cache
  }

  pub async fn queued_keys(&self) -> Result<Vec<String>> {
    self.queue().await?.list_keys()
  }
}

#[cfg(test)]
mod tests {
  use color_eyre::eyre::eyre;

  use super::*;
  use crate::config::{test_config, OfflineFallback, WriteBodyEncoding};
  use crate::gateway::fetch::testing::{ok_response, StubFetcher};
  use crate::gateway::types::{Method, Outcome, OFFLINE_PLACEHOLDER};

  fn gateway(
    config: Config,
    fetcher: Arc<StubFetcher>,
  ) -> Gateway<SqliteStorage> {
    Gateway::with_parts(config, SqliteStorage::open_in_memory().unwrap(), fetcher)
      .with_queue(QueueStore::open_in_memory().unwrap())
  }

  /// Storage backend where every operation fails, as a wedged disk would.
  struct FailingStorage;

  impl CacheStorage for FailingStorage {
    fn list_stores(&self) -> Result<Vec<String>> {
      Err(eyre!("disk I/O error"))
    }

    fn delete_store(&self, _name: &str) -> Result<()> {
      Err(eyre!("disk I/O error"))
    }

    fn get(&self, _store: &str, _key: &str) -> Result<Option<Response>> {
      Err(eyre!("disk I/O error"))
    }

    fn put(&self, _store: &str, _key: &str, _response: &Response) -> Result<()> {
      Err(eyre!("disk I/O error"))
    }

    fn entry_count(&self, _store: &str) -> Result<u64> {
      Err(eyre!("disk I/O error"))
    }
  }

  fn get(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap())
  }

  fn post(url: &str, body: &[u8]) -> Request {
    Request::post(
      Url::parse(url).unwrap(),
      "application/x-www-form-urlencoded",
      body.to_vec(),
    )
  }

  #[tokio::test]
  async fn test_cached_read_makes_no_network_call() {
    let fetcher = Arc::new(StubFetcher::always_ok());
    let gw = gateway(test_config(), fetcher.clone());

    gw.handle_install().await.unwrap();
    let install_calls = fetcher.call_count();

    let result = gw.handle_fetch(get("https://example.app/index.html")).await;

    assert_eq!(result.outcome, Outcome::ServedFromCache);
    assert_eq!(fetcher.call_count(), install_calls);
  }

  #[tokio::test]
  async fn test_read_miss_goes_to_network() {
    let fetcher = Arc::new(StubFetcher::always_ok());
    let gw = gateway(test_config(), fetcher.clone());

    let result = gw.handle_fetch(get("https://example.app/data")).await;

    assert_eq!(result.outcome, Outcome::ServedFromNetwork);
    assert_eq!(fetcher.call_count(), 1);
  }

  #[tokio::test]
  async fn test_read_miss_offline_serves_placeholder() {
    let gw = gateway(test_config(), Arc::new(StubFetcher::always_offline()));

    let result = gw.handle_fetch(get("https://example.app/data")).await;

    assert_eq!(result.outcome, Outcome::ServedOffline);
    assert_eq!(result.response.body, OFFLINE_PLACEHOLDER.as_bytes());
  }

  #[tokio::test]
  async fn test_cached_document_fallback_serves_root() {
    use std::sync::atomic::{AtomicBool, Ordering};

    let mut config = test_config();
    config.policy.offline_fallback = OfflineFallback::CachedDocument;

    // Network that can be taken down after install
    let offline = Arc::new(AtomicBool::new(false));
    let flag = offline.clone();
    let fetcher = Arc::new(StubFetcher::new(move |req| {
      if flag.load(Ordering::SeqCst) {
        Err(eyre!("network unreachable"))
      } else {
        Ok(ok_response(req.url.as_str()))
      }
    }));

    let gw = gateway(config, fetcher);
    gw.handle_install().await.unwrap();
    offline.store(true, Ordering::SeqCst);

    let result = gw.handle_fetch(get("https://example.app/uncached")).await;

    assert_eq!(result.outcome, Outcome::ServedOffline);
    // Served the cached root document rather than the placeholder text
    assert_eq!(result.response.body, b"content of https://example.app/");
  }

  #[tokio::test]
  async fn test_dynamic_caching_stores_and_serves_second_read() {
    let mut config = test_config();
    config.policy.dynamic_caching = true;

    let fetcher = Arc::new(StubFetcher::always_ok());
    let gw = gateway(config, fetcher.clone());

    let first = gw.handle_fetch(get("https://example.app/data")).await;
    assert_eq!(first.outcome, Outcome::ServedFromNetwork);

    let second = gw.handle_fetch(get("https://example.app/data")).await;
    assert_eq!(second.outcome, Outcome::ServedFromCache);
    assert_eq!(fetcher.call_count(), 1);
  }

  #[tokio::test]
  async fn test_dynamic_caching_disabled_never_stores() {
    let fetcher = Arc::new(StubFetcher::always_ok());
    let gw = gateway(test_config(), fetcher.clone());

    gw.handle_fetch(get("https://example.app/data")).await;
    let second = gw.handle_fetch(get("https://example.app/data")).await;

    assert_eq!(second.outcome, Outcome::ServedFromNetwork);
    assert_eq!(fetcher.call_count(), 2);
  }

  #[tokio::test]
  async fn test_dynamic_caching_skips_cross_origin() {
    let mut config = test_config();
    config.policy.dynamic_caching = true;

    let fetcher = Arc::new(StubFetcher::always_ok());
    let gw = gateway(config, fetcher.clone());

    gw.handle_fetch(get("https://other.example.net/data")).await;
    let second = gw.handle_fetch(get("https://other.example.net/data")).await;

    assert_eq!(second.outcome, Outcome::ServedFromNetwork);
  }

  #[tokio::test]
  async fn test_dynamic_caching_skips_endpoint_url() {
    let mut config = test_config();
    config.policy.dynamic_caching = true;

    let fetcher = Arc::new(StubFetcher::always_ok());
    let gw = gateway(config, fetcher.clone());

    // Same-origin, but the URL mentions the endpoint host
    let url = "https://example.app/relay/sink.example.com/exec";
    gw.handle_fetch(get(url)).await;
    let second = gw.handle_fetch(get(url)).await;

    assert_eq!(second.outcome, Outcome::ServedFromNetwork);
    assert_eq!(fetcher.call_count(), 2);
  }

  #[tokio::test]
  async fn test_dynamic_caching_skips_non_200() {
    let mut config = test_config();
    config.policy.dynamic_caching = true;

    let fetcher = Arc::new(StubFetcher::new(|req| {
      let mut resp = ok_response(req.url.as_str());
      resp.status = 404;
      Ok(resp)
    }));
    let gw = gateway(config, fetcher.clone());

    gw.handle_fetch(get("https://example.app/missing")).await;
    let second = gw.handle_fetch(get("https://example.app/missing")).await;

    assert_eq!(second.outcome, Outcome::ServedFromNetwork);
    assert_eq!(fetcher.call_count(), 2);
  }

  #[tokio::test]
  async fn test_write_success_passes_response_through() {
    let fetcher = Arc::new(StubFetcher::new(|req| {
      let mut resp = ok_response(req.url.as_str());
      resp.status = 201;
      resp.body = b"created".to_vec();
      Ok(resp)
    }));
    let gw = gateway(test_config(), fetcher);

    let result = gw
      .handle_fetch(post("https://sink.example.com/exec", b"name=alice"))
      .await;

    assert_eq!(result.outcome, Outcome::Delivered);
    assert_eq!(result.response.status, 201);
    assert_eq!(result.response.body, b"created");
    assert!(gw.queued_keys().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_failed_write_queues_exactly_one_entry() {
    let gw = gateway(test_config(), Arc::new(StubFetcher::always_offline()));

    let result = gw
      .handle_fetch(post("https://sink.example.com/exec", b"name=alice"))
      .await;

    assert_eq!(result.outcome, Outcome::QueuedForRetry);
    let ack: serde_json::Value = serde_json::from_slice(&result.response.body).unwrap();
    assert_eq!(ack, serde_json::json!({ "status": "saved_offline" }));
    assert_eq!(result.response.content_type.as_deref(), Some("application/json"));

    let keys = gw.queued_keys().await.unwrap();
    assert_eq!(keys.len(), 1);
  }

  #[tokio::test]
  async fn test_queued_payload_is_raw_body() {
    let gw = gateway(test_config(), Arc::new(StubFetcher::always_offline()));

    gw.handle_fetch(post("https://sink.example.com/exec", b"name=alice&age=3"))
      .await;

    let keys = gw.queued_keys().await.unwrap();
    let queue = gw.queue().await.unwrap();
    assert_eq!(queue.get(&keys[0]).unwrap().unwrap(), b"name=alice&age=3");
  }

  #[tokio::test]
  async fn test_read_survives_cache_lookup_failure() {
    let fetcher = Arc::new(StubFetcher::always_ok());
    let gw = Gateway::with_parts(test_config(), FailingStorage, fetcher.clone())
      .with_queue(QueueStore::open_in_memory().unwrap());

    let result = gw.handle_fetch(get("https://example.app/data")).await;

    assert_eq!(result.outcome, Outcome::ServedFromNetwork);
    assert_eq!(fetcher.call_count(), 1);
  }

  #[tokio::test]
  async fn test_failed_write_with_broken_queue_serves_placeholder() {
    let queue = QueueStore::open_in_memory().unwrap();
    queue.break_storage();

    let gw = Gateway::with_parts(
      test_config(),
      SqliteStorage::open_in_memory().unwrap(),
      Arc::new(StubFetcher::always_offline()),
    )
    .with_queue(queue);

    let result = gw
      .handle_fetch(post("https://sink.example.com/exec", b"name=alice"))
      .await;

    assert_eq!(result.outcome, Outcome::ServedOffline);
    assert_eq!(result.response.body, OFFLINE_PLACEHOLDER.as_bytes());
  }

  #[tokio::test]
  async fn test_sync_with_unknown_tag_is_ignored() {
    let fetcher = Arc::new(StubFetcher::always_ok());
    let gw = gateway(test_config(), fetcher.clone());

    let report = gw.handle_sync("some-other-queue").await.unwrap();

    assert_eq!(report, DrainReport::default());
    assert_eq!(fetcher.call_count(), 0);
  }

  #[tokio::test]
  async fn test_queued_write_is_replayed_on_sync() {
    // Go offline, queue a submission
    let offline_gw = gateway(test_config(), Arc::new(StubFetcher::always_offline()));
    offline_gw
      .handle_fetch(post("https://sink.example.com/exec", b"name=alice"))
      .await;
    assert_eq!(offline_gw.queued_keys().await.unwrap().len(), 1);

    let report = offline_gw.handle_sync("sync-form-data").await;
    // Still offline: drain aborts, nothing lost
    assert_eq!(report.unwrap(), DrainReport { delivered: 0, remaining: 1 });
    assert_eq!(offline_gw.queued_keys().await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_skip_waiting_triggers_activation() {
    let fetcher = Arc::new(StubFetcher::always_ok());
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put("stale-v0", "k", &ok_response("https://example.app/")).unwrap();

    let gw = Gateway::with_parts(test_config(), storage, fetcher)
      .with_queue(QueueStore::open_in_memory().unwrap());
    gw.handle_install().await.unwrap();

    gw.handle_message(ControlMessage::SkipWaiting).await.unwrap();

    let stores = gw.cache().stores().unwrap();
    assert_eq!(stores.len(), 1);
    assert_eq!(stores[0].0, "v1");
  }

  #[tokio::test]
  async fn test_head_takes_read_path() {
    let fetcher = Arc::new(StubFetcher::always_offline());
    let gw = gateway(test_config(), fetcher);

    let mut request = get("https://example.app/data");
    request.method = Method::Head;

    let result = gw.handle_fetch(request).await;
    assert_eq!(result.outcome, Outcome::ServedOffline);
    assert!(gw.queued_keys().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_sync_replays_with_configured_encoding() {
    let mut config = test_config();
    config.policy.write_body_encoding = WriteBodyEncoding::Json;

    let fetcher = Arc::new(StubFetcher::new(|req| {
      assert_eq!(req.content_type.as_deref(), Some("application/json"));
      Ok(ok_response(req.url.as_str()))
    }));
    let gw = gateway(config, fetcher);

    let queue = gw.queue().await.unwrap();
    queue.put("req-100", br#"{"name":"alice"}"#).unwrap();

    let report = gw.handle_sync("sync-form-data").await.unwrap();
    assert_eq!(report, DrainReport { delivered: 1, remaining: 0 });
  }
}
