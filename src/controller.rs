//! The shared cache controller.
//!
//! Owns the whole loader state tree: backing caches, the image catalog,
//! parsed headers, and every memory region known to the view. The first
//! construction against a host performs the initial scan; afterwards the
//! state round-trips through view metadata so re-opens skip it. All
//! mutation is copy-on-write against a shared snapshot.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use zerocopy::FromBytes;

use crate::cache::structs::DyldCacheMappingInfo;
use crate::cache::{scan_cache, CacheFormat};
use crate::error::Result;
use crate::host::{
    HostView, LoadProgress, LoadSettings, RegionFlags, SectionSemantics, Symbol, SymbolKind,
};
use crate::macho::constants::*;
use crate::macho::structs::{Nlist64, Section64};
use crate::macho::{load_image_header, ImageHeader};
use crate::pool::{FilePool, MappedFile, PostAllocFn, SessionId};
use crate::serialize;
use crate::slide::apply_slide_info;
use crate::trie::parse_export_trie;
use crate::util::{base_name, read_uleb128};
use crate::vm::{Vm, VmReader};

/// Metadata tag the serialized state is stored under, on the view and both
/// of its parent views.
pub const SHARED_CACHE_METADATA_TAG: &str = "SHAREDCACHE-SharedCacheData";

const DEFAULT_PAGE_SIZE: u64 = 0x1000;

// =============================================================================
// View State
// =============================================================================

/// Lifecycle of a cache view. Transitions are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewState {
    /// No state loaded yet
    #[default]
    Unloaded,
    /// Initial scan complete
    Loaded,
    /// At least one image materialized
    LoadedWithImages,
}

impl From<ViewState> for u8 {
    fn from(state: ViewState) -> u8 {
        match state {
            ViewState::Unloaded => 0,
            ViewState::Loaded => 1,
            ViewState::LoadedWithImages => 2,
        }
    }
}

impl TryFrom<u8> for ViewState {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            0 => Ok(ViewState::Unloaded),
            1 => Ok(ViewState::Loaded),
            2 => Ok(ViewState::LoadedWithImages),
            other => Err(other),
        }
    }
}

// =============================================================================
// Data Model
// =============================================================================

/// A contiguous loadable region of the cache address space.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryRegion {
    /// Display name, `<prefix>::<suffix>`
    #[serde(rename = "prettyName")]
    pub pretty_name: String,
    /// Start address
    pub start: u64,
    /// Size in bytes
    pub size: u64,
    /// True once materialized into the host view
    pub loaded: bool,
    /// Placement in the host raw view; meaningful only when loaded
    #[serde(rename = "rawViewOffsetIfLoaded")]
    pub raw_view_offset_if_loaded: u64,
    /// Protection flags, persisted as raw bits
    #[serde(with = "serialize::region_flags_as_u64")]
    pub flags: RegionFlags,
    /// True once header typing ran for this region; runtime only
    #[serde(skip)]
    pub header_initialized: bool,
}

impl MemoryRegion {
    /// Creates an unloaded region.
    pub fn new(pretty_name: String, start: u64, size: u64, flags: RegionFlags) -> Self {
        Self {
            pretty_name,
            start,
            size,
            flags,
            ..Self::default()
        }
    }

    /// Returns true if the region covers `addr`.
    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.start + self.size
    }
}

/// One on-disk file contributing mappings to the logical cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackingCache {
    /// File path
    pub path: PathBuf,
    /// True for the primary cache; exactly one per controller
    #[serde(rename = "isPrimary")]
    pub is_primary: bool,
    /// Mappings this file contributes
    pub mappings: Vec<DyldCacheMappingInfo>,
}

/// One Mach-O image of the cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheImage {
    /// Install name (unique key)
    #[serde(rename = "installName")]
    pub install_name: String,
    /// Address of the Mach-O header
    #[serde(rename = "headerLocation")]
    pub header_location: u64,
    /// One region per segment
    pub regions: Vec<MemoryRegion>,
}

/// The persisted controller state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct State {
    /// Lifecycle state
    #[serde(rename = "m_viewState", with = "serialize::view_state_as_u8")]
    pub view_state: ViewState,
    /// Detected cache format
    #[serde(rename = "m_cacheFormat", with = "serialize::cache_format_as_u8")]
    pub cache_format: CacheFormat,
    /// Install name to header address
    #[serde(rename = "m_imageStarts")]
    pub image_starts: BTreeMap<String, u64>,
    /// Path of the primary cache file
    #[serde(rename = "m_baseFilePath")]
    pub base_file_path: PathBuf,
    /// Parsed image headers keyed by header address
    #[serde(with = "serialize::header_table")]
    pub headers: BTreeMap<u64, ImageHeader>,
    /// Export trie symbols keyed by image base
    #[serde(rename = "exportInfos", with = "serialize::symbol_map")]
    pub export_infos: BTreeMap<u64, Vec<Symbol>>,
    /// Symbol table symbols keyed by image base
    #[serde(rename = "symbolInfos", with = "serialize::symbol_map")]
    pub symbol_infos: BTreeMap<u64, Vec<Symbol>>,
    /// All backing caches, primary first
    #[serde(rename = "backingCaches")]
    pub backing_caches: Vec<BackingCache>,
    /// Branch stub island regions
    #[serde(rename = "stubIslands")]
    pub stub_islands: Vec<MemoryRegion>,
    /// Image catalog
    pub images: Vec<CacheImage>,
    /// Regions materialized into the host view, in load order
    #[serde(rename = "regionsMappedIntoMemory")]
    pub regions_mapped_into_memory: Vec<MemoryRegion>,
    /// Read-only dyld data regions
    #[serde(rename = "dyldDataSections")]
    pub dyld_data_regions: Vec<MemoryRegion>,
    /// Mapping-derived regions not belonging to any image
    #[serde(rename = "nonImageRegions")]
    pub non_image_regions: Vec<MemoryRegion>,
    /// ObjC optimization data range; rediscovered on each initial load
    #[serde(skip)]
    pub objc_optimization_range: Option<(u64, u64)>,
}

impl State {
    /// The minimum mapping address across all backing caches.
    pub fn base_address(&self) -> u64 {
        self.backing_caches
            .iter()
            .flat_map(|cache| cache.mappings.iter())
            .map(|mapping| mapping.address)
            .min()
            .unwrap_or(0)
    }
}

// =============================================================================
// Per-View Registry
// =============================================================================

/// State shared by all controllers of one view.
pub struct ViewSpecificState {
    /// Serializes operations that influence persisted metadata.
    ops_mutex: Mutex<()>,
    progress: AtomicU8,
    cached_state: Mutex<Option<Arc<State>>>,
}

impl ViewSpecificState {
    fn new() -> Self {
        Self {
            ops_mutex: Mutex::new(()),
            progress: AtomicU8::new(LoadProgress::NotStarted as u8),
            cached_state: Mutex::new(None),
        }
    }

    fn set_progress(&self, progress: LoadProgress) {
        self.progress.store(progress as u8, Ordering::SeqCst);
    }
}

fn view_specific_registry() -> &'static Mutex<HashMap<u64, Weak<ViewSpecificState>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<u64, Weak<ViewSpecificState>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn view_specific_state_for(session: u64) -> Arc<ViewSpecificState> {
    let mut registry = view_specific_registry().lock().unwrap();
    if let Some(existing) = registry.get(&session).and_then(Weak::upgrade) {
        return existing;
    }

    let state = Arc::new(ViewSpecificState::new());
    registry.insert(session, Arc::downgrade(&state));
    registry.retain(|_, weak| weak.strong_count() > 0);
    state
}

/// Returns the load progress of a session's initial scan.
pub fn load_progress(session: SessionId) -> LoadProgress {
    let registry = view_specific_registry().lock().unwrap();
    registry
        .get(&session)
        .and_then(Weak::upgrade)
        .map(|state| LoadProgress::from(state.progress.load(Ordering::SeqCst)))
        .unwrap_or(LoadProgress::NotStarted)
}

// =============================================================================
// Helpers
// =============================================================================

/// Derives region flags from Mach-O protections.
pub fn region_flags_from_protections(init_prot: u32, max_prot: u32) -> RegionFlags {
    let mut flags = RegionFlags::empty();
    if init_prot & VM_PROT_READ != 0 {
        flags |= RegionFlags::READABLE;
    }
    if init_prot & VM_PROT_WRITE != 0 {
        flags |= RegionFlags::WRITABLE;
    }
    if init_prot & VM_PROT_EXECUTE != 0 {
        flags |= RegionFlags::EXECUTABLE;
    }
    if init_prot & VM_PROT_WRITE == 0 && max_prot & VM_PROT_WRITE == 0 {
        flags |= RegionFlags::DENY_WRITE;
    }
    if init_prot & VM_PROT_EXECUTE == 0 && max_prot & VM_PROT_EXECUTE == 0 {
        flags |= RegionFlags::DENY_EXECUTE;
    }
    flags
}

/// Splits every region overlapping one of `segments` into the fragments
/// remaining before and after the segment.
fn split_regions_around_segments(regions: &mut Vec<MemoryRegion>, segments: &[(u64, u64)]) {
    if regions.is_empty() {
        return;
    }
    for &(seg_start, seg_end) in segments {
        let mut result = Vec::with_capacity(regions.len());
        for region in regions.drain(..) {
            let region_start = region.start;
            let region_end = region.start + region.size;
            if seg_start < region_end && seg_end > region_start {
                if region_start < seg_start {
                    let mut before = region.clone();
                    before.size = seg_start - region_start;
                    result.push(before);
                }
                if region_end > seg_end {
                    let mut after = region.clone();
                    after.start = seg_end;
                    after.size = region_end - seg_end;
                    result.push(after);
                }
            } else {
                result.push(region);
            }
        }
        *regions = result;
    }
}

/// Maps section flags and well-known names onto host semantics and a type
/// string.
fn section_semantics(section: &Section64) -> (&'static str, SectionSemantics) {
    use SectionSemantics::*;

    let (type_name, mut semantics) = match section.flags & SECTION_TYPE_MASK {
        S_REGULAR => {
            if section.flags & S_ATTR_PURE_INSTRUCTIONS != 0 {
                ("PURE_CODE", ReadOnlyCode)
            } else if section.flags & S_ATTR_SOME_INSTRUCTIONS != 0 {
                ("CODE", ReadOnlyCode)
            } else {
                ("REGULAR", Default)
            }
        }
        S_ZEROFILL => ("ZEROFILL", ReadWriteData),
        S_CSTRING_LITERALS => ("CSTRING_LITERALS", ReadOnlyData),
        S_4BYTE_LITERALS => ("4BYTE_LITERALS", Default),
        S_8BYTE_LITERALS => ("8BYTE_LITERALS", Default),
        S_LITERAL_POINTERS => ("LITERAL_POINTERS", ReadOnlyData),
        S_NON_LAZY_SYMBOL_POINTERS => ("NON_LAZY_SYMBOL_POINTERS", ReadOnlyData),
        S_LAZY_SYMBOL_POINTERS => ("LAZY_SYMBOL_POINTERS", ReadOnlyData),
        S_SYMBOL_STUBS => ("SYMBOL_STUBS", ReadOnlyCode),
        S_MOD_INIT_FUNC_POINTERS => ("MOD_INIT_FUNC_POINTERS", ReadOnlyData),
        S_MOD_TERM_FUNC_POINTERS => ("MOD_TERM_FUNC_POINTERS", ReadOnlyData),
        S_COALESCED => ("COALESCED", Default),
        S_GB_ZEROFILL => ("GB_ZEROFILL", ReadWriteData),
        S_INTERPOSING => ("INTERPOSING", Default),
        S_16BYTE_LITERALS => ("16BYTE_LITERALS", Default),
        S_DTRACE_DOF => ("DTRACE_DOF", Default),
        S_LAZY_DYLIB_SYMBOL_POINTERS => ("LAZY_DYLIB_SYMBOL_POINTERS", ReadOnlyData),
        S_THREAD_LOCAL_REGULAR => ("THREAD_LOCAL_REGULAR", Default),
        S_THREAD_LOCAL_ZEROFILL => ("THREAD_LOCAL_ZEROFILL", Default),
        S_THREAD_LOCAL_VARIABLES => ("THREAD_LOCAL_VARIABLES", Default),
        S_THREAD_LOCAL_VARIABLE_POINTERS => ("THREAD_LOCAL_VARIABLE_POINTERS", Default),
        S_THREAD_LOCAL_INIT_FUNCTION_POINTERS => ("THREAD_LOCAL_INIT_FUNCTION_POINTERS", Default),
        _ => ("UNKNOWN", Default),
    };

    if &section.sectname[..7] == b"__text\0" {
        semantics = ReadOnlyCode;
    } else if &section.sectname[..8] == b"__const\0" {
        semantics = ReadOnlyData;
    } else if &section.sectname[..7] == b"__data\0" {
        semantics = ReadWriteData;
    }
    if &section.segname[..13] == b"__DATA_CONST\0" {
        semantics = ReadOnlyData;
    }

    (type_name, semantics)
}

/// The subset of a region initialize-header cares about.
#[derive(Debug, Clone, Copy)]
struct RegionSlice {
    start: u64,
    size: u64,
    header_initialized: bool,
}

impl RegionSlice {
    #[inline]
    fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.start + self.size
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Presents a dyld shared cache as individually loadable images to a host.
pub struct SharedCacheController {
    session: SessionId,
    pool: Arc<FilePool>,
    state: Arc<State>,
    state_is_shared: bool,
    metadata_valid: bool,
    view_specific: Arc<ViewSpecificState>,
    settings: LoadSettings,
}

impl SharedCacheController {
    /// Creates a controller for the cache at `path`, adopting persisted
    /// state from the host when present and valid, or performing the
    /// initial load.
    pub fn new(
        host: &mut dyn HostView,
        path: impl AsRef<Path>,
        pool: Arc<FilePool>,
        settings: LoadSettings,
    ) -> Result<Self> {
        let path = path.as_ref();
        let session = host.session_id();
        let view_specific = view_specific_state_for(session);

        let mut controller = Self {
            session,
            pool,
            state: Arc::new(State::default()),
            state_is_shared: false,
            metadata_valid: false,
            view_specific,
            settings,
        };

        controller.deserialize_from_view(host);

        if controller.state.view_state != ViewState::Unloaded {
            controller
                .view_specific
                .set_progress(LoadProgress::Finished);
            return Ok(controller);
        }

        {
            let view_specific = Arc::clone(&controller.view_specific);
            let _guard = view_specific.ops_mutex.lock().unwrap();
            controller.perform_initial_load(host, path)?;
        }

        if controller.settings.auto_load_lib_system {
            let lib_system = controller
                .state
                .headers
                .values()
                .find(|header| header.install_name.contains("libsystem_c.dylib"))
                .map(|header| header.install_name.clone());
            if let Some(install_name) = lib_system {
                info!("loading core libsystem_c.dylib library");
                controller.load_image_with_install_name(host, &install_name, false);
            }
        }

        Ok(controller)
    }

    // ==================== State Plumbing ====================

    /// Adopts state from the view-specific snapshot or serialized metadata.
    fn deserialize_from_view(&mut self, host: &dyn HostView) {
        let Some(json) = host.query_metadata(SHARED_CACHE_METADATA_TAG) else {
            self.metadata_valid = true;
            return;
        };

        if let Some(cached) = self.view_specific.cached_state.lock().unwrap().clone() {
            self.state = cached;
            self.state_is_shared = true;
            self.metadata_valid = true;
            return;
        }

        match serialize::from_versioned_json::<State>(&json) {
            Ok(state) => {
                self.state = Arc::new(state);
                self.state_is_shared = false;
                self.metadata_valid = true;
            }
            Err(e) => {
                error!(error = %e, "failed to deserialize shared cache metadata");
                self.metadata_valid = false;
                self.will_mutate_state();
                self.state_mut().view_state = ViewState::Unloaded;
            }
        }
    }

    /// Ensures the state is uniquely owned, cloning a shared snapshot.
    ///
    /// Must precede the first `state_mut` after state was adopted or
    /// published. Safe to call repeatedly.
    fn will_mutate_state(&mut self) {
        if self.state_is_shared {
            self.state = Arc::new((*self.state).clone());
            self.state_is_shared = false;
        }
    }

    /// Mutable state access.
    ///
    /// # Panics
    ///
    /// Panics when the state is still shared; mutating a published
    /// snapshot is a programmer error.
    fn state_mut(&mut self) -> &mut State {
        assert!(
            !self.state_is_shared,
            "attempted to mutate shared controller state without WillMutateState"
        );
        Arc::get_mut(&mut self.state).expect("unshared state has a unique owner")
    }

    /// Serializes the state into view metadata and republishes it as the
    /// shared snapshot.
    pub fn save_to_view(&mut self, host: &mut dyn HostView) -> bool {
        let json = match serialize::to_versioned_json(&*self.state) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "failed to serialize shared cache state");
                return false;
            }
        };
        host.store_metadata(SHARED_CACHE_METADATA_TAG, &json);

        *self.view_specific.cached_state.lock().unwrap() = Some(Arc::clone(&self.state));
        self.state_is_shared = true;
        self.metadata_valid = true;
        true
    }

    /// Builds the VM over every backing cache mapping, wiring the
    /// slide-info hook into each file's first touch.
    fn build_vm(&self) -> Result<Vm> {
        let mut vm = Vm::new(Arc::clone(&self.pool), self.session, DEFAULT_PAGE_SIZE);
        let base = self.state.base_address();

        for cache in &self.state.backing_caches {
            for mapping in &cache.mappings {
                let hook: PostAllocFn = Arc::new(move |file: &mut MappedFile| {
                    if let Err(e) = apply_slide_info(file, base) {
                        warn!(path = %file.path().display(), error = %e, "slide info application failed");
                    }
                });
                vm.map_pages(
                    mapping.address,
                    mapping.file_offset,
                    mapping.size,
                    &cache.path,
                    Some(hook),
                )?;
            }
        }
        Ok(vm)
    }

    // ==================== Initial Load ====================

    fn perform_initial_load(&mut self, host: &mut dyn HostView, path: &Path) -> Result<()> {
        info!(path = %path.display(), "performing initial load of shared cache");
        self.view_specific.set_progress(LoadProgress::LoadingCaches);

        let scan = scan_cache(&self.pool, self.session, path)?;

        self.will_mutate_state();
        {
            let state = self.state_mut();
            state.base_file_path = path.to_path_buf();
            state.cache_format = scan.format;
            state.objc_optimization_range = scan.objc_optimization_range;
            state.backing_caches = scan.backing_caches;
            state.stub_islands = scan.stub_islands;
            state.dyld_data_regions = scan.dyld_data_regions;
            for (name, address) in scan.image_starts {
                state.image_starts.insert(name, address);
            }
        }

        self.view_specific.set_progress(LoadProgress::LoadingImages);
        let vm = self.build_vm()?;

        // Regular-format branch pools are tiny Mach-Os of their own.
        let mut pool_islands: Vec<MemoryRegion> = Vec::new();
        for (i, &address) in scan.regular_branch_pools.iter().enumerate() {
            let name = format!("dyld_shared_cache_branch_islands_{}", i + 1);
            match load_image_header(&vm, address, &name) {
                Ok(header) => {
                    for segment in &header.segments {
                        pool_islands.push(MemoryRegion::new(
                            format!("{name}::{}", segment.name()),
                            segment.vmaddr,
                            segment.filesize,
                            RegionFlags::READABLE | RegionFlags::EXECUTABLE,
                        ));
                    }
                }
                Err(e) => error!(%name, error = %e, "failed to parse branch pool"),
            }
        }

        // Parse every image header and derive its regions.
        let starts: Vec<(String, u64)> = self
            .state
            .image_starts
            .iter()
            .map(|(name, &address)| (name.clone(), address))
            .collect();

        let mut headers: BTreeMap<u64, ImageHeader> = BTreeMap::new();
        let mut images: Vec<CacheImage> = Vec::new();

        for (install_name, address) in starts {
            let mut header = match load_image_header(&vm, address, &install_name) {
                Ok(header) => header,
                Err(e) => {
                    error!(%install_name, error = %e, "failed to load Mach-O header");
                    continue;
                }
            };

            if header.linkedit_present && vm.address_is_mapped(header.linkedit_segment.vmaddr) {
                let (mapping, _) = vm.mapping_at(header.linkedit_segment.vmaddr)?;
                header.export_trie_path = mapping.file.path().to_string_lossy().into_owned();
            }

            let mut image = CacheImage {
                install_name,
                header_location: address,
                regions: Vec::with_capacity(header.segments.len()),
            };
            for segment in &header.segments {
                let mut flags = region_flags_from_protections(segment.initprot, segment.maxprot);
                // A known entry point inside the segment forces it
                // executable, which helps kernel-style images.
                for &entry in &header.entry_points {
                    if segment.vmaddr <= entry && entry < segment.vmaddr + segment.filesize {
                        flags |= RegionFlags::EXECUTABLE;
                    }
                }
                image.regions.push(MemoryRegion::new(
                    format!("{}::{}", header.identifier_prefix, segment.name()),
                    segment.vmaddr,
                    segment.vmsize,
                    flags,
                ));
            }

            headers.insert(address, header);
            images.push(image);
        }

        info!(count = headers.len(), "loaded Mach-O headers");

        // Mapping-derived regions not claimed by any image.
        let mut non_image_regions: Vec<MemoryRegion> = Vec::new();
        for cache in &self.state.backing_caches {
            let prefix = base_name(&cache.path.to_string_lossy()).to_string();
            for (i, mapping) in cache.mappings.iter().enumerate() {
                non_image_regions.push(MemoryRegion::new(
                    format!("{prefix}::{i}"),
                    mapping.address,
                    mapping.size,
                    region_flags_from_protections(mapping.init_prot, mapping.max_prot),
                ));
            }
        }

        let segment_ranges: Vec<(u64, u64)> = headers
            .values()
            .flat_map(|header| header.segments.iter())
            .map(|segment| (segment.vmaddr, segment.vmaddr + segment.vmsize))
            .collect();

        {
            let state = self.state_mut();
            state.headers = headers;
            state.images = images;
            state.stub_islands.extend(pool_islands);
            state.non_image_regions = non_image_regions;
            split_regions_around_segments(&mut state.dyld_data_regions, &segment_ranges);
            split_regions_around_segments(&mut state.non_image_regions, &segment_ranges);
            state.view_state = ViewState::Loaded;
        }

        self.save_to_view(host);
        debug!("finished initial load of shared cache");
        self.view_specific.set_progress(LoadProgress::Finished);
        Ok(())
    }

    // ==================== Image Loading ====================

    /// Materializes every not-yet-loaded region of an image into the host
    /// view, then synthesizes its sections, functions and symbols.
    ///
    /// Idempotent per region; returns false when nothing could be loaded.
    pub fn load_image_with_install_name(
        &mut self,
        host: &mut dyn HostView,
        install_name: &str,
        skip_objc: bool,
    ) -> bool {
        let view_specific = Arc::clone(&self.view_specific);
        let _guard = view_specific.ops_mutex.lock().unwrap();

        self.deserialize_from_view(host);
        self.will_mutate_state();

        info!(%install_name, "loading image");

        let vm = match self.build_vm() {
            Ok(vm) => vm,
            Err(e) => {
                error!(error = %e, "failed to map VM pages");
                return false;
            }
        };

        let Some(image_idx) = self
            .state
            .images
            .iter()
            .position(|image| image.install_name == install_name)
        else {
            error!(%install_name, "image not found");
            return false;
        };
        let header_location = self.state.images[image_idx].header_location;
        if !self.state.headers.contains_key(&header_location) {
            return false;
        }

        let undo = host.begin_undo_actions();
        self.state_mut().view_state = ViewState::LoadedWithImages;

        let region_count = self.state.images[image_idx].regions.len();
        let mut loaded: Vec<RegionSlice> = Vec::new();

        for r in 0..region_count {
            let region = self.state.images[image_idx].regions[r].clone();

            if region.pretty_name.contains("__LINKEDIT") && !self.settings.allow_loading_linkedit {
                continue;
            }
            if region.loaded {
                debug!(region = %region.pretty_name, "region already loaded");
                continue;
            }

            let buffer = match vm.read_buffer(region.start, region.size) {
                Ok(buffer) => buffer,
                Err(e) => {
                    error!(region = %region.pretty_name, error = %e, "failed to read region");
                    return false;
                }
            };

            let raw_offset = host.raw_view_end();
            host.append_raw(&buffer);
            host.add_auto_segment(raw_offset, region.size, raw_offset, region.size, region.flags);
            host.add_user_segment(region.start, region.size, raw_offset, region.size, region.flags);
            host.write_virtual(region.start, &buffer);

            let state = self.state_mut();
            let stored = &mut state.images[image_idx].regions[r];
            stored.loaded = true;
            stored.raw_view_offset_if_loaded = raw_offset;
            let snapshot = stored.clone();
            state.regions_mapped_into_memory.push(snapshot);

            loaded.push(RegionSlice {
                start: region.start,
                size: region.size,
                header_initialized: false,
            });
        }

        if loaded.is_empty() {
            warn!(%install_name, "no regions to load");
            return false;
        }

        self.save_to_view(host);

        let header = match load_image_header(&vm, header_location, install_name) {
            Ok(mut header) => {
                // Preserve the linkedit file discovered during the scan.
                if let Some(known) = self.state.headers.get(&header_location) {
                    header.export_trie_path = known.export_trie_path.clone();
                }
                header
            }
            Err(e) => {
                error!(%install_name, error = %e, "failed to re-parse image header");
                return false;
            }
        };

        self.initialize_header(host, &vm, &header, &loaded);
        {
            self.will_mutate_state();
            let state = self.state_mut();
            for slice in &loaded {
                for region in &mut state.images[image_idx].regions {
                    if region.start == slice.start {
                        region.header_initialized = true;
                    }
                }
            }
        }

        if !skip_objc {
            host.process_objc_image(
                install_name,
                self.settings.process_objc,
                self.settings.process_cf_strings,
            );
        }

        host.add_analysis_option("linearsweep");
        host.update_analysis();
        host.commit_undo_actions(undo);

        self.save_to_view(host);
        true
    }

    /// Loads the image whose segments cover `addr`.
    pub fn load_image_containing_address(
        &mut self,
        host: &mut dyn HostView,
        addr: u64,
        skip_objc: bool,
    ) -> bool {
        let install_name = self.state.headers.values().find_map(|header| {
            header
                .segment_containing(addr)
                .map(|_| header.install_name.clone())
        });

        match install_name {
            Some(install_name) => self.load_image_with_install_name(host, &install_name, skip_objc),
            None => false,
        }
    }

    /// Loads the single region (image segment, stub island, dyld data or
    /// non-image region) containing `addr`.
    pub fn load_section_at_address(&mut self, host: &mut dyn HostView, addr: u64) -> bool {
        let view_specific = Arc::clone(&self.view_specific);
        let _guard = view_specific.ops_mutex.lock().unwrap();

        self.deserialize_from_view(host);
        self.will_mutate_state();

        let vm = match self.build_vm() {
            Ok(vm) => vm,
            Err(e) => {
                error!(error = %e, "failed to map VM pages");
                return false;
            }
        };

        // Image segments take precedence over synthetic regions.
        let target = self.state.images.iter().enumerate().find_map(|(i, image)| {
            image
                .regions
                .iter()
                .position(|region| region.contains(addr))
                .map(|r| (i, r))
        });

        if let Some((image_idx, region_idx)) = target {
            return self.load_image_segment(host, &vm, image_idx, region_idx);
        }

        for kind in [
            PlainRegionKind::StubIsland,
            PlainRegionKind::DyldData,
            PlainRegionKind::NonImage,
        ] {
            let found = self
                .plain_regions(kind)
                .iter()
                .position(|region| region.contains(addr));
            if let Some(idx) = found {
                return self.load_plain_region(host, &vm, kind, idx);
            }
        }

        error!(addr = format_args!("{addr:#x}"), "no region contains address");
        false
    }

    /// Loads one segment region of an image and runs header typing for it.
    fn load_image_segment(
        &mut self,
        host: &mut dyn HostView,
        vm: &Vm,
        image_idx: usize,
        region_idx: usize,
    ) -> bool {
        let region = self.state.images[image_idx].regions[region_idx].clone();
        if region.loaded {
            return true;
        }
        let header_location = self.state.images[image_idx].header_location;
        let Some(header) = self.state.headers.get(&header_location).cloned() else {
            return false;
        };

        debug!(install_name = %header.install_name, region = %region.pretty_name, "partial image load");

        let buffer = match vm.read_buffer(region.start, region.size) {
            Ok(buffer) => buffer,
            Err(e) => {
                error!(region = %region.pretty_name, error = %e, "failed to read region");
                return false;
            }
        };

        let undo = host.begin_undo_actions();
        let raw_offset = host.raw_view_end();
        host.append_raw(&buffer);
        host.add_auto_segment(
            raw_offset,
            region.size,
            raw_offset,
            region.size,
            RegionFlags::READABLE,
        );
        host.add_user_segment(region.start, region.size, raw_offset, region.size, region.flags);
        host.write_virtual(region.start, &buffer);

        {
            let state = self.state_mut();
            let stored = &mut state.images[image_idx].regions[region_idx];
            stored.loaded = true;
            stored.raw_view_offset_if_loaded = raw_offset;
            let snapshot = stored.clone();
            state.regions_mapped_into_memory.push(snapshot);
        }

        self.save_to_view(host);

        if !self.state.images[image_idx].regions[region_idx].header_initialized {
            let slice = RegionSlice {
                start: region.start,
                size: region.size,
                header_initialized: false,
            };
            self.initialize_header(host, vm, &header, &[slice]);
            self.will_mutate_state();
            self.state_mut().images[image_idx].regions[region_idx].header_initialized = true;
        }

        host.add_analysis_option("linearsweep");
        host.update_analysis();
        host.commit_undo_actions(undo);
        true
    }

    fn plain_regions(&self, kind: PlainRegionKind) -> &[MemoryRegion] {
        match kind {
            PlainRegionKind::StubIsland => &self.state.stub_islands,
            PlainRegionKind::DyldData => &self.state.dyld_data_regions,
            PlainRegionKind::NonImage => &self.state.non_image_regions,
        }
    }

    /// Loads a stub island, dyld data or non-image region.
    fn load_plain_region(
        &mut self,
        host: &mut dyn HostView,
        vm: &Vm,
        kind: PlainRegionKind,
        idx: usize,
    ) -> bool {
        let region = self.plain_regions(kind)[idx].clone();
        if region.loaded {
            return true;
        }
        info!(region = %region.pretty_name, kind = ?kind, "loading region");

        let buffer = match vm.read_buffer(region.start, region.size) {
            Ok(buffer) => buffer,
            Err(e) => {
                error!(region = %region.pretty_name, error = %e, "failed to read region");
                return false;
            }
        };

        let (flags, semantics) = match kind {
            PlainRegionKind::StubIsland => (
                RegionFlags::READABLE | RegionFlags::EXECUTABLE,
                SectionSemantics::ReadOnlyCode,
            ),
            PlainRegionKind::DyldData => (RegionFlags::READABLE, SectionSemantics::ReadOnlyData),
            PlainRegionKind::NonImage => (
                region.flags,
                if region.flags.contains(RegionFlags::DENY_EXECUTE) {
                    SectionSemantics::ReadOnlyData
                } else {
                    SectionSemantics::ReadOnlyCode
                },
            ),
        };

        let raw_offset = host.raw_view_end();
        host.append_raw(&buffer);
        host.add_auto_segment(raw_offset, region.size, raw_offset, region.size, flags);
        host.add_user_segment(region.start, region.size, raw_offset, region.size, flags);
        host.add_user_section(&region.pretty_name, region.start, region.size, semantics, "", 1);
        host.write_virtual(region.start, &buffer);

        {
            let state = self.state_mut();
            let stored = match kind {
                PlainRegionKind::StubIsland => &mut state.stub_islands[idx],
                PlainRegionKind::DyldData => &mut state.dyld_data_regions[idx],
                PlainRegionKind::NonImage => &mut state.non_image_regions[idx],
            };
            stored.loaded = true;
            stored.raw_view_offset_if_loaded = raw_offset;
            let snapshot = stored.clone();
            state.regions_mapped_into_memory.push(snapshot);
        }

        self.save_to_view(host);
        host.add_analysis_option("linearsweep");
        host.update_analysis();
        true
    }

    // ==================== Header Initialization ====================

    /// Runs section creation, header typing, function starts, symbol table
    /// synthesis and export trie synthesis for the freshly loaded regions
    /// of one image.
    fn initialize_header(
        &mut self,
        host: &mut dyn HostView,
        vm: &Vm,
        header: &ImageHeader,
        regions_to_load: &[RegionSlice],
    ) {
        for (i, section) in header.sections.iter().enumerate() {
            if i >= header.section_names.len() {
                break;
            }
            let skip = regions_to_load
                .iter()
                .find(|slice| slice.contains(section.addr))
                .is_some_and(|slice| slice.header_initialized);
            if section.size == 0 || skip {
                continue;
            }

            let (type_name, semantics) = section_semantics(section);
            host.add_user_section(
                &header.section_names[i],
                section.addr,
                section.size,
                semantics,
                type_name,
                1 << section.align.min(63),
            );
        }

        let apply_header_types = regions_to_load
            .iter()
            .find(|slice| slice.contains(header.text_base))
            .is_some_and(|slice| !slice.header_initialized);
        if apply_header_types {
            if let Err(e) = self.apply_header_types(host, vm, header) {
                error!(text_base = format_args!("{:#x}", header.text_base), error = %e, "failed to apply Mach-O header types");
            }
        }

        let linkedit_mapped =
            header.linkedit_present && vm.address_is_mapped(header.linkedit_segment.vmaddr);

        if self.settings.process_function_starts
            && header.function_starts_present
            && linkedit_mapped
        {
            if let Err(e) = self.apply_function_starts(host, vm, header, regions_to_load) {
                error!(error = %e, "failed to process function starts");
            }
        }

        host.begin_bulk_modify_symbols();

        if header.symtab.symoff != 0 && linkedit_mapped {
            match self.synthesize_symtab_symbols(host, vm, header) {
                Ok(symbols) => {
                    self.will_mutate_state();
                    self.state_mut()
                        .symbol_infos
                        .insert(header.text_base, symbols);
                }
                Err(e) => error!(error = %e, "failed to process symbol table"),
            }
        }

        if header.export_trie_present && linkedit_mapped {
            match self.linkedit_file(vm, header) {
                Ok(file) => {
                    let symbols = parse_export_trie(&file, header, host);
                    for symbol in &symbols {
                        if !host.import_type_object(&header.install_name, &symbol.name, symbol.address)
                        {
                            host.define_auto_symbol(symbol);
                        }
                        if symbol.kind == SymbolKind::Function {
                            host.add_function_for_analysis(symbol.address);
                        }
                    }
                    self.will_mutate_state();
                    self.state_mut()
                        .export_infos
                        .insert(header.text_base, symbols);
                }
                Err(e) => error!(error = %e, "failed to open linkedit file"),
            }
        }

        host.end_bulk_modify_symbols();
    }

    fn linkedit_file(&self, vm: &Vm, header: &ImageHeader) -> Result<Arc<MappedFile>> {
        let (mapping, _) = vm.mapping_at(header.linkedit_segment.vmaddr)?;
        mapping.file.lock()
    }

    /// Types the Mach-O header and load commands in the host view.
    fn apply_header_types(
        &mut self,
        host: &mut dyn HostView,
        vm: &Vm,
        header: &ImageHeader,
    ) -> Result<()> {
        host.define_data_variable(header.text_base, "mach_header_64");
        host.define_auto_symbol(&Symbol::new(
            SymbolKind::Data,
            format!("__macho_header::{}", header.identifier_prefix),
            header.text_base,
        ));

        let mut reader = VmReader::new(vm);
        reader.seek(header.load_command_offset);
        let mut section_num = 0usize;

        for i in 0..header.ident.ncmds {
            let cur_offset = reader.offset();
            let cmd = reader.read_u32()?;
            let cmdsize = reader.read_u32()?;
            let next_offset = cur_offset + cmdsize as u64;

            let type_name = match cmd {
                LC_SEGMENT_64 => {
                    host.define_data_variable(cur_offset, "segment_command_64");
                    reader.seek_relative(7 * 8);
                    let nsects = reader.read_u32()?;
                    reader.seek_relative(4);
                    for _ in 0..nsects {
                        host.define_data_variable(reader.offset(), "section_64");
                        host.define_user_symbol(&Symbol::new(
                            SymbolKind::Data,
                            format!(
                                "__macho_section_64::{}_[{}]",
                                header.identifier_prefix, section_num
                            ),
                            reader.offset(),
                        ));
                        section_num += 1;
                        reader.seek_relative(10 * 8);
                    }
                    None
                }
                LC_SYMTAB => Some("symtab"),
                LC_DYSYMTAB => Some("dysymtab"),
                LC_UUID => Some("uuid"),
                LC_ID_DYLIB | LC_LOAD_DYLIB | LC_REEXPORT_DYLIB | LC_LOAD_WEAK_DYLIB
                | LC_LOAD_UPWARD_DYLIB => Some("dylib_command"),
                LC_CODE_SIGNATURE | LC_SEGMENT_SPLIT_INFO | LC_FUNCTION_STARTS
                | LC_DATA_IN_CODE | LC_DYLIB_CODE_SIGN_DRS | LC_DYLD_EXPORTS_TRIE
                | LC_DYLD_CHAINED_FIXUPS => Some("linkedit_data"),
                LC_ENCRYPTION_INFO => Some("encryption_info"),
                LC_VERSION_MIN_MACOSX | LC_VERSION_MIN_IPHONEOS => Some("version_min"),
                LC_DYLD_INFO | LC_DYLD_INFO_ONLY => Some("dyld_info"),
                _ => Some("load_command"),
            };
            if let Some(type_name) = type_name {
                host.define_data_variable(cur_offset, type_name);
            }

            host.define_auto_symbol(&Symbol::new(
                SymbolKind::Data,
                format!("__macho_load_command::{}_[{}]", header.identifier_prefix, i),
                cur_offset,
            ));
            reader.seek(next_offset);
        }
        Ok(())
    }

    /// Registers analysis functions from the `LC_FUNCTION_STARTS` stream.
    fn apply_function_starts(
        &mut self,
        host: &mut dyn HostView,
        vm: &Vm,
        header: &ImageHeader,
        regions_to_load: &[RegionSlice],
    ) -> Result<()> {
        let file = self.linkedit_file(vm, header)?;
        let stream = file.read_buffer(
            header.function_starts.dataoff as u64,
            header.function_starts.datasize as u64,
        )?;

        let mut cursor = 0usize;
        let mut current = header.text_base;
        while cursor < stream.len() {
            let Some((delta, consumed)) = read_uleb128(&stream[cursor..]) else {
                break;
            };
            cursor += consumed;
            if delta == 0 {
                break;
            }
            current += delta;

            let add = regions_to_load
                .iter()
                .find(|slice| slice.contains(current))
                .is_some_and(|slice| !slice.header_initialized);
            if add {
                host.add_function_for_analysis(current);
            }
        }
        Ok(())
    }

    /// Synthesizes symbols from the image's nlist symbol table.
    fn synthesize_symtab_symbols(
        &mut self,
        host: &mut dyn HostView,
        vm: &Vm,
        header: &ImageHeader,
    ) -> Result<Vec<Symbol>> {
        let file = self.linkedit_file(vm, header)?;
        let strtab = file.read_buffer(header.symtab.stroff as u64, header.symtab.strsize as u64)?;

        let mut symbols: Vec<Symbol> = Vec::new();
        for i in 0..header.symtab.nsyms as u64 {
            let mut buf = [0u8; Nlist64::SIZE];
            file.read_into(&mut buf, header.symtab.symoff as u64 + i * Nlist64::SIZE as u64)?;
            let mut sym = Nlist64::read_from_bytes(&buf).expect("sized buffer");

            if sym.n_strx >= header.symtab.strsize || sym.n_type & N_TYPE == N_INDR {
                continue;
            }
            let name_bytes = &strtab[sym.n_strx as usize..];
            let end = crate::util::memchr_null(name_bytes);
            let name = String::from_utf8_lossy(&name_bytes[..end]).into_owned();
            if name == "<redacted>" || name.is_empty() {
                continue;
            }

            let mut kind = SymbolKind::Data;
            if sym.n_type & N_TYPE == N_SECT
                && sym.n_sect > 0
                && (sym.n_sect as usize - 1) < header.sections.len()
            {
            } else if sym.n_type & N_TYPE == N_ABS {
            } else if sym.n_type & N_EXT != 0 {
                kind = SymbolKind::External;
            } else {
                continue;
            }

            if kind != SymbolKind::External {
                let flags = header.section_flags_at(sym.n_value).unwrap_or(0);
                kind = if flags & (S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS) != 0 {
                    SymbolKind::Function
                } else {
                    SymbolKind::Data
                };
            }
            if sym.n_desc & N_ARM_THUMB_DEF != 0 {
                sym.n_value += 1;
            }

            let symbol = Symbol::new(kind, name, sym.n_value);
            if symbol.kind == SymbolKind::Function {
                host.add_function_for_analysis(symbol.address);
            }
            if !host.import_type_object(&header.install_name, &symbol.name, symbol.address) {
                host.define_auto_symbol(&symbol);
            }
            symbols.push(symbol);
        }
        Ok(symbols)
    }

    // ==================== Symbols ====================

    /// Walks every image's export trie, synchronously, aggregating all
    /// exported symbols. The result is also persisted per image.
    pub fn load_all_symbols_and_wait(&mut self, host: &mut dyn HostView) -> Vec<(String, Symbol)> {
        let view_specific = Arc::clone(&self.view_specific);
        let _guard = view_specific.ops_mutex.lock().unwrap();

        self.will_mutate_state();

        let images: Vec<(String, u64)> = self
            .state
            .images
            .iter()
            .map(|image| (image.install_name.clone(), image.header_location))
            .collect();

        let mut all_symbols: Vec<(String, Symbol)> = Vec::new();
        for (install_name, header_location) in images {
            let Some(header) = self.state.headers.get(&header_location).cloned() else {
                continue;
            };

            let file = match self
                .pool
                .open(self.session, &header.export_trie_path, None)
                .and_then(|lazy| lazy.lock())
            {
                Ok(file) => file,
                Err(e) => {
                    warn!(
                        %install_name,
                        path = %header.export_trie_path,
                        error = %e,
                        "failed to open export trie file"
                    );
                    continue;
                }
            };

            let symbols = parse_export_trie(&file, &header, host);
            self.state_mut()
                .export_infos
                .insert(header.text_base, symbols.clone());
            all_symbols.extend(symbols.into_iter().map(|s| (install_name.clone(), s)));
        }

        self.save_to_view(host);
        all_symbols
    }

    /// Copies the symbol at `symbol_location` onto `target_location`,
    /// prefixed with `j_` when the addresses differ. Types from the image's
    /// type library are applied when available.
    pub fn find_symbol_at_addr_and_apply_to_addr(
        &mut self,
        host: &mut dyn HostView,
        symbol_location: u64,
        target_location: u64,
        trigger_reanalysis: bool,
    ) {
        self.will_mutate_state();

        let prefix = if symbol_location != target_location {
            "j_"
        } else {
            ""
        };
        if let Some(existing) = host.symbol_at(target_location) {
            if existing.name.contains("j_") {
                return;
            }
        }

        let undo = host.begin_undo_actions();
        if let Some(found) = host.symbol_at(symbol_location) {
            let kind = if host.has_function_at(target_location) {
                SymbolKind::Function
            } else {
                found.kind
            };
            host.define_user_symbol(&Symbol::new(
                kind,
                format!("{prefix}{}", found.name),
                target_location,
            ));
        }
        host.forget_undo_actions(undo);

        let Some(header) = self.macho_header_for_address(symbol_location) else {
            return;
        };

        let file = match self
            .pool
            .open(self.session, &header.export_trie_path, None)
            .and_then(|lazy| lazy.lock())
        {
            Ok(file) => file,
            Err(e) => {
                warn!(install_name = %header.install_name, error = %e, "failed to open export trie file");
                return;
            }
        };

        let symbols = parse_export_trie(&file, &header, host);
        let undo = host.begin_undo_actions();
        host.begin_bulk_modify_symbols();
        for symbol in &symbols {
            if symbol.address != symbol_location {
                continue;
            }
            let kind = if host.has_function_at(target_location) {
                SymbolKind::Function
            } else {
                symbol.kind
            };
            host.define_user_symbol(&Symbol::new(
                kind,
                format!("{prefix}{}", symbol.name),
                target_location,
            ));
            host.import_type_object(&header.install_name, &symbol.name, target_location);
            if trigger_reanalysis {
                host.update_analysis();
            }
            break;
        }
        host.end_bulk_modify_symbols();
        host.forget_undo_actions(undo);

        let view_specific = Arc::clone(&self.view_specific);
        let _guard = view_specific.ops_mutex.lock().unwrap();
        self.state_mut()
            .export_infos
            .insert(header.text_base, symbols);
    }

    // ==================== Lookups ====================

    /// Returns the parsed header of the image whose segments cover `addr`.
    pub fn macho_header_for_address(&self, addr: u64) -> Option<ImageHeader> {
        self.state
            .headers
            .values()
            .find(|header| header.segment_containing(addr).is_some())
            .cloned()
    }

    /// Returns the parsed header of the named image.
    pub fn macho_header_for_name(&self, install_name: &str) -> Option<ImageHeader> {
        let address = self.state.image_starts.get(install_name)?;
        self.state.headers.get(address).cloned()
    }

    /// Returns the region or section name covering `addr`, or an empty
    /// string.
    pub fn name_for_address(&self, addr: u64) -> String {
        for region in self
            .state
            .stub_islands
            .iter()
            .chain(&self.state.dyld_data_regions)
            .chain(&self.state.non_image_regions)
        {
            if region.contains(addr) {
                return region.pretty_name.clone();
            }
        }

        if let Some(header) = self.macho_header_for_address(addr) {
            if let Some(section) = header.section_containing(addr) {
                return format!("{}::{}", header.identifier_prefix, section.name());
            }
        }
        String::new()
    }

    /// Returns the identifier prefix of the image covering `addr`, or an
    /// empty string.
    pub fn image_name_for_address(&self, addr: u64) -> String {
        self.macho_header_for_address(addr)
            .map(|header| header.identifier_prefix)
            .unwrap_or_default()
    }

    /// Returns the header address of the named image.
    pub fn image_start(&self, install_name: &str) -> Option<u64> {
        self.state.image_starts.get(install_name).copied()
    }

    /// Returns the parsed headers of all images, keyed by header address.
    pub fn image_headers(&self) -> &BTreeMap<u64, ImageHeader> {
        &self.state.headers
    }

    /// Returns all known install names.
    pub fn get_available_images(&self) -> Vec<String> {
        self.state
            .headers
            .values()
            .map(|header| header.install_name.clone())
            .collect()
    }

    /// Returns the backing caches, primary first.
    pub fn backing_caches(&self) -> &[BackingCache] {
        &self.state.backing_caches
    }

    /// Returns the image catalog.
    pub fn images(&self) -> &[CacheImage] {
        &self.state.images
    }

    /// Returns the regions materialized into the host so far.
    pub fn mapped_regions(&self) -> Vec<MemoryRegion> {
        self.state.regions_mapped_into_memory.clone()
    }

    /// Returns the view lifecycle state.
    pub fn view_state(&self) -> ViewState {
        self.state.view_state
    }

    /// Returns the ObjC optimization data range recorded during the scan.
    pub fn objc_optimization_range(&self) -> Option<(u64, u64)> {
        self.state.objc_optimization_range
    }

    /// Returns true when the prior metadata round-trip succeeded.
    pub fn metadata_valid(&self) -> bool {
        self.metadata_valid
    }

    /// Returns the load settings this controller runs with.
    pub fn settings(&self) -> &LoadSettings {
        &self.settings
    }
}

impl std::fmt::Debug for SharedCacheController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedCacheController")
            .field("session", &self.session)
            .field("view_state", &self.state.view_state)
            .field("images", &self.state.images.len())
            .field("state_is_shared", &self.state_is_shared)
            .finish()
    }
}

/// Counts backing caches without a full scan. See
/// [`crate::cache::fast_backing_cache_count`].
pub fn fast_get_backing_cache_count(
    pool: &FilePool,
    session: SessionId,
    path: impl AsRef<Path>,
) -> u64 {
    match crate::cache::fast_backing_cache_count(pool, session, path.as_ref()) {
        Ok(count) => count,
        Err(e) => {
            error!(path = %path.as_ref().display(), error = %e, "failed to preload cache");
            0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlainRegionKind {
    StubIsland,
    DyldData,
    NonImage,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(name: &str, start: u64, size: u64) -> MemoryRegion {
        MemoryRegion::new(name.to_string(), start, size, RegionFlags::READABLE)
    }

    #[test]
    fn test_region_flags_from_protections() {
        let rx = region_flags_from_protections(VM_PROT_READ | VM_PROT_EXECUTE, VM_PROT_READ | VM_PROT_EXECUTE);
        assert!(rx.contains(RegionFlags::READABLE));
        assert!(rx.contains(RegionFlags::EXECUTABLE));
        assert!(rx.contains(RegionFlags::DENY_WRITE));
        assert!(!rx.contains(RegionFlags::DENY_EXECUTE));

        let rw = region_flags_from_protections(VM_PROT_READ | VM_PROT_WRITE, VM_PROT_READ | VM_PROT_WRITE);
        assert!(rw.contains(RegionFlags::WRITABLE));
        assert!(rw.contains(RegionFlags::DENY_EXECUTE));
        assert!(!rw.contains(RegionFlags::DENY_WRITE));
    }

    #[test]
    fn test_split_region_middle_overlap() {
        let mut regions = vec![region("r", 0x1000, 0x3000)];
        split_regions_around_segments(&mut regions, &[(0x2000, 0x3000)]);

        assert_eq!(regions.len(), 2);
        assert_eq!((regions[0].start, regions[0].size), (0x1000, 0x1000));
        assert_eq!((regions[1].start, regions[1].size), (0x3000, 0x1000));
    }

    #[test]
    fn test_split_region_full_cover() {
        let mut regions = vec![region("r", 0x2000, 0x1000)];
        split_regions_around_segments(&mut regions, &[(0x1000, 0x4000)]);
        assert!(regions.is_empty());
    }

    #[test]
    fn test_split_region_no_overlap() {
        let mut regions = vec![region("r", 0x1000, 0x1000)];
        split_regions_around_segments(&mut regions, &[(0x8000, 0x9000)]);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].start, 0x1000);
    }

    #[test]
    fn test_split_region_multiple_segments() {
        let mut regions = vec![region("r", 0x0, 0x10000)];
        split_regions_around_segments(&mut regions, &[(0x1000, 0x2000), (0x8000, 0x9000)]);

        assert_eq!(regions.len(), 3);
        assert_eq!((regions[0].start, regions[0].size), (0x0, 0x1000));
        assert_eq!((regions[1].start, regions[1].size), (0x2000, 0x6000));
        assert_eq!((regions[2].start, regions[2].size), (0x9000, 0x7000));
    }

    #[test]
    fn test_state_base_address() {
        let mut state = State::default();
        assert_eq!(state.base_address(), 0);

        state.backing_caches.push(BackingCache {
            path: "/a".into(),
            is_primary: true,
            mappings: vec![DyldCacheMappingInfo {
                address: 0x2_0000_0000,
                size: 0x1000,
                file_offset: 0,
                max_prot: 5,
                init_prot: 5,
            }],
        });
        state.backing_caches.push(BackingCache {
            path: "/b".into(),
            is_primary: false,
            mappings: vec![DyldCacheMappingInfo {
                address: 0x1_8000_0000,
                size: 0x1000,
                file_offset: 0,
                max_prot: 3,
                init_prot: 3,
            }],
        });
        assert_eq!(state.base_address(), 0x1_8000_0000);
    }

    #[test]
    fn test_state_round_trip() {
        let mut state = State {
            view_state: ViewState::Loaded,
            cache_format: CacheFormat::Split,
            base_file_path: "/tmp/cache".into(),
            ..State::default()
        };
        state.image_starts.insert("/usr/lib/libtest.dylib".into(), 0x1_8000_0000);
        state.export_infos.insert(
            0x1_8000_0000,
            vec![Symbol::new(SymbolKind::Function, "_main", 0x1_8000_1000)],
        );
        state
            .stub_islands
            .push(region("stubs::_stubs", 0x1_9000_0000, 0x4000));

        let json = serialize::to_versioned_json(&state).unwrap();
        for field in [
            "metadataVersion",
            "m_viewState",
            "m_cacheFormat",
            "m_imageStarts",
            "m_baseFilePath",
            "headers",
            "exportInfos",
            "symbolInfos",
            "backingCaches",
            "stubIslands",
            "images",
            "regionsMappedIntoMemory",
            "dyldDataSections",
            "nonImageRegions",
        ] {
            assert!(json.contains(field), "missing field {field} in {json}");
        }

        let back: State = serialize::from_versioned_json(&json).unwrap();
        let json_again = serialize::to_versioned_json(&back).unwrap();
        assert_eq!(json, json_again);
    }

    #[test]
    #[should_panic(expected = "attempted to mutate shared controller state")]
    fn test_mutating_shared_state_panics() {
        let mut controller = SharedCacheController {
            session: 0,
            pool: Arc::new(FilePool::default()),
            state: Arc::new(State::default()),
            state_is_shared: true,
            metadata_valid: true,
            view_specific: Arc::new(ViewSpecificState::new()),
            settings: LoadSettings::default(),
        };
        let _ = controller.state_mut();
    }
}
