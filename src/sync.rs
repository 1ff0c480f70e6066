//! Sequential replay of queued payloads to the remote endpoint.

use color_eyre::Result;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use crate::gateway::fetch::Fetch;
use crate::gateway::types::Request;
use crate::queue::QueueStore;

/// Summary of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Items delivered to the endpoint and deleted from the queue
  pub delivered: usize,
  /// Items still queued after this pass
  pub remaining: usize,
}

/// Replays queued payloads to the fixed remote endpoint.
///
/// Items are processed one at a time to bound endpoint load and keep failure
/// attribution simple. A key is deleted only after the endpoint returned HTTP
/// success; the first failure aborts the pass and leaves the remainder queued
/// for the next reconnect signal. Delivery is at-least-once: a replay that
/// reaches the endpoint but fails before the delete stays queued.
pub struct SyncDrainer {
  fetcher: Arc<dyn Fetch>,
  endpoint: Url,
  content_type: String,
}

impl SyncDrainer {
  pub fn new(fetcher: Arc<dyn Fetch>, endpoint: Url, content_type: impl Into<String>) -> Self {
    Self {
      fetcher,
      endpoint,
      content_type: content_type.into(),
    }
  }

  pub async fn drain(&self, queue: &QueueStore) -> Result<DrainReport> {
    let keys = queue.list_keys()?;
    let mut delivered = 0;

    for key in keys {
      // A key can disappear if a previous pass raced us; just move on.
      let Some(payload) = queue.get(&key)? else {
        continue;
      };

      let request = Request::post(self.endpoint.clone(), self.content_type.clone(), payload);

      match self.fetcher.fetch(request).await {
        Ok(response) if response.is_success() => {
          queue.delete(&key)?;
          delivered += 1;
          debug!(key = %key, "queued request delivered");
        }
        Ok(response) => {
          warn!(key = %key, status = response.status, "endpoint rejected queued request, aborting drain");
          break;
        }
        Err(e) => {
          warn!(key = %key, error = %e, "replay failed, aborting drain");
          break;
        }
      }
    }

    // Recount rather than subtract: keys that vanished mid-pass are not
    // remaining work.
    Ok(DrainReport {
      delivered,
      remaining: queue.list_keys()?.len(),
    })
  }
}
