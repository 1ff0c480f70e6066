//! Request/response model shared by the interceptor, cache, and drainer.

use serde::{Deserialize, Serialize};
use url::Url;

/// Fixed body served for reads that miss the cache while offline.
pub const OFFLINE_PLACEHOLDER: &str = "⚠️ You are offline. Some data may not be sent yet.";

/// HTTP methods the gateway distinguishes between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  /// Read methods take the cache-first path; everything else is a write.
  pub fn is_read(&self) -> bool {
    matches!(self, Method::Get | Method::Head)
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }
}

/// An outgoing request as seen by the interceptor.
///
/// The body is owned bytes rather than a stream, so the write path can clone
/// the request for the network attempt and still hold the original payload
/// for queueing.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::Get,
      url,
      content_type: None,
      body: Vec::new(),
    }
  }

  pub fn head(url: Url) -> Self {
    Self {
      method: Method::Head,
      url,
      content_type: None,
      body: Vec::new(),
    }
  }

  pub fn post(url: Url, content_type: impl Into<String>, body: Vec<u8>) -> Self {
    Self {
      method: Method::Post,
      url,
      content_type: Some(content_type.into()),
      body,
    }
  }

  /// Normalized cache key: `METHOD url` with the fragment stripped.
  pub fn key(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    format!("{} {}", self.method.as_str(), url)
  }
}

/// A response, either fetched from the network or materialized locally.
///
/// Serializable so cache stores can persist it as a blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub url: String,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Synthetic response for reads that cannot be served from cache or network.
  pub fn offline_placeholder() -> Self {
    Self {
      status: 200,
      url: String::new(),
      content_type: Some("text/plain; charset=utf-8".to_string()),
      body: OFFLINE_PLACEHOLDER.as_bytes().to_vec(),
    }
  }

  /// Synthetic acknowledgement for writes that were queued for retry.
  pub fn saved_offline() -> Self {
    Self {
      status: 200,
      url: String::new(),
      content_type: Some("application/json".to_string()),
      body: serde_json::to_vec(&serde_json::json!({ "status": "saved_offline" }))
        .unwrap_or_else(|_| br#"{"status":"saved_offline"}"#.to_vec()),
    }
  }
}

/// Terminal states of an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
  /// Read served from the current cache store, no network call made
  ServedFromCache,
  /// Read served from a live network fetch
  ServedFromNetwork,
  /// Read served a synthetic offline response
  ServedOffline,
  /// Write delivered to the network, response passed through unmodified
  Delivered,
  /// Write failed, payload persisted to the retry queue
  QueuedForRetry,
}

/// A resolved fetch, carrying the response and where it came from.
#[derive(Debug, Clone)]
pub struct FetchResult {
  pub response: Response,
  pub outcome: Outcome,
}

impl FetchResult {
  pub fn from_cache(response: Response) -> Self {
    Self {
      response,
      outcome: Outcome::ServedFromCache,
    }
  }

  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      outcome: Outcome::ServedFromNetwork,
    }
  }

  pub fn offline(response: Response) -> Self {
    Self {
      response,
      outcome: Outcome::ServedOffline,
    }
  }

  pub fn delivered(response: Response) -> Self {
    Self {
      response,
      outcome: Outcome::Delivered,
    }
  }

  pub fn queued(response: Response) -> Self {
    Self {
      response,
      outcome: Outcome::QueuedForRetry,
    }
  }
}
