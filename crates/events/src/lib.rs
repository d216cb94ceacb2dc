//! Lock activity log.
//!
//! [`ActivityBuffer`] keeps the most recent raw activity events in memory,
//! persists them through a [`BlobStore`](lockly_store::BlobStore) with a
//! debounced writer, and serves a deduplicated newest-first view.

pub mod activity;

pub use activity::{ActivityBuffer, DEFAULT_CAPACITY, DEFAULT_RECENT, SAVE_DEBOUNCE};
