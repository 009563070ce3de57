//! Extension seams
//!
//! - `CacheCodec`: payload serialization used inside the envelope
//! - `Connector`: the external data source behind the cold fetcher gate
//! - `Warmer`: the read path the prefetch scheduler drives
//!
//! # Example: Custom Connector
//!
//! ```rust,ignore
//! use market_data_cache::{Connector, FetchError, FetchResponse, Params, async_trait};
//!
//! struct QuotesApi { http: reqwest::Client }
//!
//! #[async_trait]
//! impl Connector for QuotesApi {
//!     async fn fetch(&self, operation: &str, params: &Params) -> Result<FetchResponse, FetchError> {
//!         let body = self.call(operation, params).await.map_err(|e| FetchError::Transient(e.to_string()))?;
//!         Ok(FetchResponse::new(body))
//!     }
//!
//!     fn name(&self) -> &'static str {
//!         "quotes-api"
//!     }
//! }
//! ```

use crate::error::{CacheResult, FetchError};
use crate::key::Params;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;

/// Trait for cache value serialization/deserialization
///
/// The envelope records the codec's [`id`](CacheCodec::id) in its header and
/// refuses to decode bytes written by a different codec.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync + Debug` to support concurrent access across async tasks
/// and provide debugging capabilities.
pub trait CacheCodec: Send + Sync + Debug {
    /// Serialize a value to bytes
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be represented by this codec.
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> anyhow::Result<Vec<u8>>;

    /// Deserialize bytes to a value
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid encoding of `T`.
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> anyhow::Result<T>;

    /// Stable one-byte identifier written into every envelope header
    fn id(&self) -> u8;

    /// Get the name of the codec, for logging
    fn name(&self) -> &'static str;
}

/// Successful connector response.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    /// Payload to cache and return
    pub value: serde_json::Value,
    /// Upstream version or content tag (ETag, revision id), when the source has one
    pub version_tag: Option<String>,
}

impl FetchResponse {
    #[must_use]
    pub const fn new(value: serde_json::Value) -> Self {
        Self {
            value,
            version_tag: None,
        }
    }

    #[must_use]
    pub fn with_version(mut self, tag: impl Into<String>) -> Self {
        self.version_tag = Some(tag.into());
        self
    }
}

/// External data source, one per `source_id`.
///
/// Connectors own request construction, authentication and response
/// parsing. They report failures through [`FetchError`] so the gate can
/// tell a retryable hiccup from a permanent rejection or an upstream 429.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Perform one upstream request
    ///
    /// # Errors
    ///
    /// `Transient`, `Permanent` or `RateLimited` as classified by the connector.
    async fn fetch(&self, operation: &str, params: &Params) -> Result<FetchResponse, FetchError>;

    /// Connector name for logging
    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// What happened to one prefetch target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmOutcome {
    /// A live entry already existed; no cold call was made
    AlreadyWarm,
    /// The value was fetched (or joined an in-flight fetch) and written back
    Fetched,
}

/// Read path used by the prefetch scheduler.
#[async_trait]
pub trait Warmer: Send + Sync {
    /// Whether a live (unexpired) warm-tier entry exists for the request
    async fn is_warm(&self, source_id: &str, operation: &str, params: &Params) -> bool;

    /// Populate the tiers for one request, skipping it if already warm
    ///
    /// # Errors
    ///
    /// Propagates cold fetch failures.
    async fn warm(&self, source_id: &str, operation: &str, params: &Params) -> CacheResult<WarmOutcome>;
}
