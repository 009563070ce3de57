//! Cache tier storage
//!
//! - **Hot** ([`HotTier`]): in-process moka cache bounded by a byte budget,
//!   evicting least-recently-used entries
//! - **Warm** ([`WarmTier`]): SQLite database in WAL mode; durable across
//!   restarts, concurrent readers, one writer
//!
//! The cold tier is not storage; see [`crate::cold_fetcher`].

mod hot_tier;
mod warm_tier;

pub use hot_tier::{HotEntry, HotTier, HotTierStats};
pub use warm_tier::{SourceSummary, WarmStorage, WarmTier};
