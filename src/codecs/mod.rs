//! Cache Codec Implementations
//!
//! Built-in implementations of the [`CacheCodec`](crate::traits::CacheCodec) trait.
//! Market-data payloads are JSON documents, so JSON is the only codec shipped.

mod json;
pub use json::JsonCodec;
