//! dscload - a dyld shared cache loader.
//!
//! This library presents the contents of Apple's dyld shared cache (one
//! primary file plus any number of sub-caches) as individually loadable
//! Mach-O images to a reverse-engineering host. It handles:
//!
//! - Multi-file cache discovery across the four on-disk layouts
//! - A virtual-memory index stitching cache addresses onto memory-mapped
//!   files, with bounded file-descriptor pressure
//! - Slide-info fixups (v2, v3, v5) rewriting chained pointers in place
//! - On-demand image materialization: segments, sections, functions and
//!   symbols streamed into the host, with controller state persisted as
//!   view metadata so re-opens skip the initial scan
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use dscload::{CapturingHost, FilePool, LoadSettings, SharedCacheController};
//!
//! fn main() -> dscload::Result<()> {
//!     let mut host = CapturingHost::new(1);
//!     let pool = Arc::new(FilePool::default());
//!     let mut cache = SharedCacheController::new(
//!         &mut host,
//!         "/path/to/dyld_shared_cache_arm64e",
//!         pool,
//!         LoadSettings::default(),
//!     )?;
//!
//!     cache.load_image_with_install_name(&mut host, "/usr/lib/libobjc.A.dylib", false);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod controller;
pub mod error;
pub mod host;
pub mod macho;
pub mod pool;
pub mod serialize;
pub mod slide;
pub mod trie;
pub mod util;
pub mod vm;

// Re-export main types
pub use cache::CacheFormat;
pub use controller::{
    fast_get_backing_cache_count, load_progress, BackingCache, CacheImage, MemoryRegion,
    SharedCacheController, State, ViewState, SHARED_CACHE_METADATA_TAG,
};
pub use error::{Error, Result};
pub use host::{
    CapturingHost, HostView, LoadProgress, LoadSettings, RegionFlags, SectionSemantics, Symbol,
    SymbolKind,
};
pub use macho::ImageHeader;
pub use pool::{FilePool, LazyFile, MappedFile, SessionId};
pub use vm::{Vm, VmReader};
