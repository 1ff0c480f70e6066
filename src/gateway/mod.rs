//! Request interception: classify, resolve from cache or network, queue
//! failed writes.

pub mod fetch;
mod interceptor;
pub mod types;

pub use fetch::{Fetch, HttpFetcher};
pub use interceptor::Gateway;
