//! Network seam: the `Fetch` trait and its reqwest-backed implementation.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;

use super::types::{Method, Request, Response};

/// Abstraction over the network so the interceptor, cache population, and
/// drainer can be exercised without real connectivity.
///
/// An `Err` means the network was unreachable. HTTP-level failures (4xx/5xx)
/// resolve to `Ok` with the status carried on the response.
pub trait Fetch: Send + Sync {
  fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response>>;
}

/// Real network fetcher backed by a shared reqwest client.
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Fetch for HttpFetcher {
  fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response>> {
    Box::pin(async move {
      let method = match request.method {
        Method::Get => reqwest::Method::GET,
        Method::Head => reqwest::Method::HEAD,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
      };

      let mut builder = self.client.request(method, request.url.clone());
      if let Some(content_type) = &request.content_type {
        builder = builder.header(reqwest::header::CONTENT_TYPE, content_type);
      }
      if !request.body.is_empty() {
        builder = builder.body(request.body);
      }

      let response = builder
        .send()
        .await
        .map_err(|e| eyre!("Network fetch failed for {}: {}", request.url, e))?;

      let status = response.status().as_u16();
      let url = response.url().to_string();
      let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

      let body = response
        .bytes()
        .await
        .map_err(|e| eyre!("Failed to read response body from {}: {}", url, e))?
        .to_vec();

      Ok(Response {
        status,
        url,
        content_type,
        body,
      })
    })
  }
}
