//! Shared cache discovery: on-disk structures and the multi-file scanner.

pub mod scanner;
pub mod structs;

pub use scanner::{fast_backing_cache_count, scan_cache, CacheScan, LocalSymbolsLocation};
pub use structs::CacheFormat;
