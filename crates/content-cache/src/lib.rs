//! Content-addressed blob cache
//!
//! Every blob is stored under the BLAKE3 digest of its bytes. Identical content
//! maps to the same digest and is stored once, so both sides of a connection
//! can compare digests to decide whether bytes need to cross the network.
//!
//! # Example
//!
//! ```rust,no_run
//! use content_cache::ContentCache;
//! use std::path::Path;
//!
//! # fn example() -> Result<(), content_cache::CacheError> {
//! let cache = ContentCache::new(Path::new("/tmp/termite-cache"))?;
//!
//! let hash = cache.put(b"hello world")?;
//! assert!(cache.has(&hash));
//!
//! let data = cache.get(&hash)?.unwrap();
//! assert_eq!(data, b"hello world");
//! # Ok(())
//! # }
//! ```
//!
//! # Layout
//!
//! ```text
//! {dir}/
//! ├── objects/
//! │   └── ab/
//! │       └── cdef0123...   # blob bytes, named by the rest of the digest
//! └── staging/              # temp files being hashed, renamed into objects/
//! ```
//!
//! Objects are write-once: a blob is never modified after it lands in
//! `objects/`, which makes concurrent readers safe without locking.

mod cache;
mod error;
mod hash;

pub use cache::{CacheUsage, ContentCache, PruneStats, MEMORY_BLOB_LIMIT};
pub use error::{CacheError, Result};
pub use hash::{ContentHash, HashError};
