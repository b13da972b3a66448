//! # Slotloader Caching infrastructure
//!
//! Every resource that finished loading ends up in the [`CacheStore`], so a later request for the
//! same key can be served synchronously without going through the loader again.
//!
//! ## Weights and eviction
//!
//! Each entry has a weight computed by the configured [`Weigher`]. The store keeps the sum of all
//! weights at or below its maximum weight: before every insert, the least recently used entries are
//! evicted until the new entry fits. Reads through [`CacheStore::get`] count as a use, inserts
//! count as a use of the inserted entry. Entries that were never read are evicted in insertion
//! order.
//!
//! The entry that was just inserted is never evicted by its own insert. A single entry that on its
//! own exceeds the maximum weight thus stays in the cache until the next insert pushes it out.
//!
//! ## Absent results
//!
//! A load can finish without producing a resource. Such a result is cached as [`None`] with a
//! weight of `0`, which means a subsequent request is served from the cache and does not invoke the
//! loader again. Callers that want to retry those keys can either [`remove`](CacheStore::remove)
//! the entry explicitly, or configure [`AbsentResults::Retry`](crate::config::AbsentResults::Retry).
//!
//! ## Concurrency
//!
//! The store is shared between the coordinating context and all the worker threads running loads.
//! All accesses go through one mutex, which makes the check-then-insert-then-evict sequence of
//! [`CacheStore::put_if_absent`] atomic: when two loads for the same key race, the first one to
//! finish wins and the second result is dropped.
//!
//! ### Metrics
//!
//! - `cache.insert`: Successful inserts.
//! - `cache.evicted`: Entries removed to make room for an insert.
//! - `cache.weight`: A gauge of the total cached weight after each insert.

mod store;

pub use store::{CacheStore, CacheStoreBuilder, Cached, Weigher};
