//! Versioned cache manager: eager population, stale-version eviction, lookups.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::gateway::fetch::Fetch;
use crate::gateway::types::{Request, Response};

use super::storage::CacheStorage;

/// Owns the current cache version on top of a storage backend.
///
/// Exactly one version is read from or written to at a time; everything else
/// is deleted on `reclaim`.
pub struct CacheManager<S: CacheStorage> {
  storage: Arc<S>,
  version: String,
}

impl<S: CacheStorage> CacheManager<S> {
  pub fn new(storage: S, version: impl Into<String>) -> Self {
    Self {
      storage: Arc::new(storage),
      version: version.into(),
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  /// Eagerly populate the current version with the core asset set.
  ///
  /// All-or-nothing: every asset is fetched before anything is written, so a
  /// failed install never leaves a half-filled version behind, and a failed
  /// re-install of the active version name never disturbs the store already
  /// serving. A write error mid-population deletes the store, since its
  /// contents are no longer coherent.
  pub async fn initialize(
    &self,
    origin: &Url,
    assets: &[String],
    fetcher: &dyn Fetch,
  ) -> Result<()> {
    let mut entries = Vec::with_capacity(assets.len());
    for asset in assets {
      let url = origin
        .join(asset)
        .map_err(|e| eyre!("Invalid asset path {}: {}", asset, e))?;
      let request = Request::get(url);

      match fetcher.fetch(request.clone()).await {
        Ok(response) if response.is_success() => entries.push((request.key(), response)),
        Ok(response) => {
          return Err(eyre!(
            "Asset {} returned status {} during install",
            request.url,
            response.status
          ))
        }
        Err(e) => return Err(e),
      }
    }

    for (key, response) in &entries {
      if let Err(e) = self.storage.put(&self.version, key, response) {
        self.storage.delete_store(&self.version)?;
        return Err(e);
      }
    }

    debug!(version = %self.version, assets = entries.len(), "cache populated");
    Ok(())
  }

  /// Delete every store except the current version. Idempotent.
  pub fn reclaim(&self) -> Result<()> {
    for store in self.storage.list_stores()? {
      if store != self.version {
        debug!(store = %store, "reclaiming stale cache version");
        self.storage.delete_store(&store)?;
      }
    }
    Ok(())
  }

  /// Read-only match against the current store. Never touches the network.
  pub fn lookup(&self, key: &str) -> Result<Option<Response>> {
    self.storage.get(&self.version, key)
  }

  /// Write or overwrite an entry in the current store.
  pub fn store(&self, key: &str, response: &Response) -> Result<()> {
    self.storage.put(&self.version, key, response)
  }

  /// Store names with entry counts, for status reporting.
  pub fn stores(&self) -> Result<Vec<(String, u64)>> {
    let mut out = Vec::new();
    for name in self.storage.list_stores()? {
      let count = self.storage.entry_count(&name)?;
      out.push((name, count));
    }
    Ok(out)
  }
}

#[cfg(test)]
mod tests {
  use color_eyre::eyre::eyre;

  use super::*;
  use crate::cache::storage::SqliteStorage;
  use crate::gateway::fetch::testing::{ok_response, StubFetcher};

  fn origin() -> Url {
    Url::parse("https://example.app").unwrap()
  }

  fn assets() -> Vec<String> {
    vec!["/".to_string(), "/index.html".to_string()]
  }

  #[tokio::test]
  async fn test_initialize_populates_all_assets() {
    let manager = CacheManager::new(SqliteStorage::open_in_memory().unwrap(), "v1");
    let fetcher = StubFetcher::always_ok();

    manager.initialize(&origin(), &assets(), &fetcher).await.unwrap();

    assert!(manager.lookup("GET https://example.app/").unwrap().is_some());
    assert!(manager.lookup("GET https://example.app/index.html").unwrap().is_some());
    assert_eq!(fetcher.call_count(), 2);
  }

  #[tokio::test]
  async fn test_initialize_failure_leaves_no_partial_store() {
    let manager = CacheManager::new(SqliteStorage::open_in_memory().unwrap(), "v1");
    let fetcher = StubFetcher::new(|req| {
      if req.url.path() == "/index.html" {
        Err(eyre!("network unreachable"))
      } else {
        Ok(ok_response(req.url.as_str()))
      }
    });

    let result = manager.initialize(&origin(), &assets(), &fetcher).await;

    assert!(result.is_err());
    assert!(manager.stores().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_initialize_rejects_non_success_asset() {
    let manager = CacheManager::new(SqliteStorage::open_in_memory().unwrap(), "v1");
    let fetcher = StubFetcher::new(|req| {
      let mut resp = ok_response(req.url.as_str());
      if req.url.path() == "/index.html" {
        resp.status = 404;
      }
      Ok(resp)
    });

    assert!(manager.initialize(&origin(), &assets(), &fetcher).await.is_err());
    assert!(manager.stores().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_reinstall_failure_leaves_existing_store_intact() {
    let manager = CacheManager::new(SqliteStorage::open_in_memory().unwrap(), "v1");
    manager.initialize(&origin(), &assets(), &StubFetcher::always_ok()).await.unwrap();

    // Transient outage during a re-install of the already-active version
    let result = manager.initialize(&origin(), &assets(), &StubFetcher::always_offline()).await;

    assert!(result.is_err());
    assert!(manager.lookup("GET https://example.app/index.html").unwrap().is_some());
    assert_eq!(manager.stores().unwrap(), vec![("v1".to_string(), 2)]);
  }

  #[tokio::test]
  async fn test_reclaim_keeps_only_current_version() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.put("v1", "k", &ok_response("https://example.app/")).unwrap();

    let manager = CacheManager::new(storage, "v2");
    manager.store("k", &ok_response("https://example.app/")).unwrap();

    manager.reclaim().unwrap();

    let stores = manager.stores().unwrap();
    assert_eq!(stores.len(), 1);
    assert_eq!(stores[0].0, "v2");

    // Second reclaim is a no-op
    manager.reclaim().unwrap();
    assert_eq!(manager.stores().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_failed_install_then_reclaim_preserves_previous_version() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let old = CacheManager::new(storage, "v1");
    old.initialize(&origin(), &assets(), &StubFetcher::always_ok()).await.unwrap();

    // New version fails to install against the same storage
    let new = CacheManager {
      storage: Arc::clone(&old.storage),
      version: "v2".to_string(),
    };
    let result = new.initialize(&origin(), &assets(), &StubFetcher::always_offline()).await;
    assert!(result.is_err());

    // v2 never became active, so reclaim still runs for v1
    old.reclaim().unwrap();
    let stores = old.stores().unwrap();
    assert_eq!(stores.len(), 1);
    assert_eq!(stores[0].0, "v1");
    assert!(old.lookup("GET https://example.app/index.html").unwrap().is_some());
  }
}
