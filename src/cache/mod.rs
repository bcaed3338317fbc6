//! Persistent formula cache.
//!
//! Rendered markup is stored in a single SQLite file scoped to the project,
//! keyed by a digest of the trimmed formula and its display mode:
//!
//! ```toml
//! [cache]
//! enabled = true
//! path = ".cache/plugin/katex-ssr/cache.db"
//! ```

mod keys;
mod lock;
mod store;

pub use keys::CacheKey;
pub(crate) use lock::mutex_lock;
pub use store::{CacheError, CacheStore};
