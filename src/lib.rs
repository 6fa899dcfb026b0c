//! Read-ahead byte-stream cache.
//!
//! [`cache::CachedSource`] sits between a slow, seekable [`source::DataSource`]
//! (typically an HTTP-range-capable object) and a consumer doing positional
//! reads at arbitrary offsets (typically a media demuxer). A background
//! fetcher prefetches ahead of the consumer into a bounded window of pages,
//! hides transient upstream failures behind bounded retries, and keeps the
//! upstream connection warm while idle.

pub mod cache;
pub mod config;
mod fetcher;
mod pages;
pub mod source;

pub use cache::{CacheOptions, CachedSource, StreamStatus};
pub use config::{CacheConfig, ConfigError};
pub use source::{DataSource, FileSource, SourceError, SourceFlags};
