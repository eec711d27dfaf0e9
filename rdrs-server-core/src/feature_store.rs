//! Feature vector lookups over feature views.
//!
//! A feature view joins columns of several feature group tables. A lookup
//! resolves the view's metadata, reads one row per feature group and lays the
//! values out in the view's feature order.

pub mod avro;
pub mod cache;
mod handlers;
pub mod metadata;
pub mod planner;

pub use cache::{CachedFeatureViewStore, FEATURE_VIEW_CACHE_TTL, FeatureViewStore};
pub use handlers::{BatchFeatureStoreHandler, FeatureStoreHandler};
pub use metadata::{FeatureMetadata, FeatureViewMetadata};
