//! End-to-end tests against synthetic cache files.
//!
//! Each builder assembles a minimal but structurally honest cache on disk:
//! real header offsets, real mapping/image tables, and a real Mach-O with a
//! `__TEXT` segment, a `__LINKEDIT` segment and an export trie. The
//! controller then runs against an in-memory host.

use std::mem::offset_of;
use std::path::PathBuf;
use std::sync::Arc;

use dscload::cache::structs::DyldCacheHeader;
use dscload::slide::apply_slide_info;
use dscload::{
    fast_get_backing_cache_count, CapturingHost, FilePool, HostView, LoadSettings, RegionFlags,
    SharedCacheController, ViewState, SHARED_CACHE_METADATA_TAG,
};

const TEXT_BASE: u64 = 0x1_0000_0000;
const IMAGE_VA: u64 = 0x1_0000_4000;
const LINKEDIT_VA: u64 = 0x1_0000_8000;
const INSTALL_NAME: &str = "/usr/lib/libtest.dylib";

const MH_MAGIC_64: u32 = 0xFEEDFACF;
const CPU_TYPE_ARM64: u32 = 0x0100_000C;
const LC_SEGMENT_64: u32 = 0x19;
const LC_DYLD_EXPORTS_TRIE: u32 = 0x8000_0033;

// =============================================================================
// Byte Builder
// =============================================================================

fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn put_bytes(buf: &mut [u8], offset: usize, bytes: &[u8]) {
    buf[offset..offset + bytes.len()].copy_from_slice(bytes);
}

fn write_file(name: &str, contents: &[u8]) -> PathBuf {
    let path = std::env::temp_dir().join(format!("dscload-it-{}-{}", std::process::id(), name));
    std::fs::write(&path, contents).unwrap();
    path
}

/// Writes a basic mapping entry (address, size, file offset, max/init prot).
fn put_mapping(buf: &mut [u8], offset: usize, address: u64, size: u64, file_offset: u64, prot: u32) {
    put_u64(buf, offset, address);
    put_u64(buf, offset + 8, size);
    put_u64(buf, offset + 16, file_offset);
    put_u32(buf, offset + 24, prot);
    put_u32(buf, offset + 28, prot);
}

/// `_a`, `_ab`, `_abc` at image offsets 0x10, 0x20, 0x30.
fn trie_bytes() -> [u8; 24] {
    [
        0x00, 0x01, b'_', b'a', 0x00, 6, // root -> "_a"
        0x02, 0x00, 0x10, 0x01, b'b', 0x00, 13, // "_a" @ 0x10 -> "b"
        0x02, 0x00, 0x20, 0x01, b'c', 0x00, 20, // "_ab" @ 0x20 -> "c"
        0x02, 0x00, 0x30, 0x00, // "_abc" @ 0x30
    ]
}

/// Writes a dylib Mach-O at `offset`: `__TEXT`, `__LINKEDIT`, export trie.
fn write_macho(buf: &mut [u8], offset: usize) {
    put_u32(buf, offset, MH_MAGIC_64);
    put_u32(buf, offset + 4, CPU_TYPE_ARM64);
    put_u32(buf, offset + 8, 0); // cpusubtype
    put_u32(buf, offset + 12, 0x6); // MH_DYLIB
    put_u32(buf, offset + 16, 3); // ncmds
    put_u32(buf, offset + 20, 72 + 72 + 16); // sizeofcmds
    put_u32(buf, offset + 24, 0); // flags
    put_u32(buf, offset + 28, 0); // reserved

    let seg = |buf: &mut [u8], off: usize, name: &[u8], vmaddr: u64, fileoff: u64, prot: u32| {
        put_u32(buf, off, LC_SEGMENT_64);
        put_u32(buf, off + 4, 72);
        put_bytes(buf, off + 8, name);
        put_u64(buf, off + 24, vmaddr);
        put_u64(buf, off + 32, 0x1000); // vmsize
        put_u64(buf, off + 40, fileoff);
        put_u64(buf, off + 48, 0x1000); // filesize
        put_u32(buf, off + 56, prot); // maxprot
        put_u32(buf, off + 60, prot); // initprot
        put_u32(buf, off + 64, 0); // nsects
        put_u32(buf, off + 68, 0); // flags
    };

    seg(buf, offset + 32, b"__TEXT", IMAGE_VA, 0x4000, 0x5);
    seg(buf, offset + 104, b"__LINKEDIT", LINKEDIT_VA, 0x8000, 0x1);

    put_u32(buf, offset + 176, LC_DYLD_EXPORTS_TRIE);
    put_u32(buf, offset + 180, 16);
    put_u32(buf, offset + 184, 0x8000); // dataoff
    put_u32(buf, offset + 188, trie_bytes().len() as u32); // datasize
}

/// A single-file regular-format cache with one image.
fn build_regular_cache() -> Vec<u8> {
    let mut buf = vec![0u8; 0x10000];
    put_bytes(&mut buf, 0, b"dyld_v0   arm64\0");

    let mapping_offset = 344u32;
    let images_offset = mapping_offset + 32;
    let path_offset = images_offset + 32;

    put_u32(&mut buf, offset_of!(DyldCacheHeader, mapping_offset), mapping_offset);
    put_u32(&mut buf, offset_of!(DyldCacheHeader, mapping_count), 1);
    put_u32(&mut buf, offset_of!(DyldCacheHeader, images_offset_old), images_offset);
    put_u32(&mut buf, offset_of!(DyldCacheHeader, images_count_old), 1);

    put_mapping(&mut buf, mapping_offset as usize, TEXT_BASE, 0x10000, 0, 0x5);

    put_u64(&mut buf, images_offset as usize, IMAGE_VA);
    put_u32(&mut buf, images_offset as usize + 24, path_offset);
    put_bytes(&mut buf, path_offset as usize, INSTALL_NAME.as_bytes());

    write_macho(&mut buf, 0x4000);
    put_bytes(&mut buf, 0x8000, &trie_bytes());
    buf
}

/// A split-format primary: modern header, one sub-cache entry, `.symbols`.
fn build_split_primary() -> Vec<u8> {
    let mut buf = vec![0u8; 0x10000];
    put_bytes(&mut buf, 0, b"dyld_v1   arm64\0");

    let header_size = std::mem::size_of::<DyldCacheHeader>() as u32;
    let mapping_offset = header_size;
    let images_offset = mapping_offset + 32;
    let path_offset = images_offset + 32;

    put_u32(&mut buf, offset_of!(DyldCacheHeader, mapping_offset), mapping_offset);
    put_u32(&mut buf, offset_of!(DyldCacheHeader, mapping_count), 1);
    put_u64(&mut buf, offset_of!(DyldCacheHeader, cache_type), 1);
    put_u32(&mut buf, offset_of!(DyldCacheHeader, sub_cache_array_count), 1);
    put_u32(&mut buf, offset_of!(DyldCacheHeader, images_offset), images_offset);
    put_u32(&mut buf, offset_of!(DyldCacheHeader, images_count), 1);

    put_mapping(&mut buf, mapping_offset as usize, TEXT_BASE, 0x10000, 0, 0x5);

    put_u64(&mut buf, images_offset as usize, IMAGE_VA);
    put_u32(&mut buf, images_offset as usize + 24, path_offset);
    put_bytes(&mut buf, path_offset as usize, INSTALL_NAME.as_bytes());

    write_macho(&mut buf, 0x4000);
    put_bytes(&mut buf, 0x8000, &trie_bytes());
    buf
}

/// A sub-cache with exactly one mapping and no images: a stub island.
fn build_stub_island_sub_cache(address: u64) -> Vec<u8> {
    let mut buf = vec![0u8; 0x4000];
    put_bytes(&mut buf, 0, b"dyld_v1   arm64\0");

    let header_size = std::mem::size_of::<DyldCacheHeader>() as u32;
    put_u32(&mut buf, offset_of!(DyldCacheHeader, mapping_offset), header_size);
    put_u32(&mut buf, offset_of!(DyldCacheHeader, mapping_count), 1);
    put_mapping(&mut buf, header_size as usize, address, 0x4000, 0, 0x5);
    buf
}

/// A mapping-less `.symbols` sibling.
fn build_symbols_sub_cache() -> Vec<u8> {
    let mut buf = vec![0u8; 0x1000];
    put_bytes(&mut buf, 0, b"dyld_v1   arm64\0");
    put_u32(
        &mut buf,
        offset_of!(DyldCacheHeader, mapping_offset),
        std::mem::size_of::<DyldCacheHeader>() as u32,
    );
    buf
}

fn open(
    path: &PathBuf,
    session: u64,
) -> (CapturingHost, SharedCacheController) {
    let mut host = CapturingHost::new(session);
    let settings = LoadSettings {
        auto_load_lib_system: false,
        ..LoadSettings::default()
    };
    let controller =
        SharedCacheController::new(&mut host, path, Arc::new(FilePool::default()), settings)
            .unwrap();
    (host, controller)
}

// =============================================================================
// Scenario 1: regular cache discovery
// =============================================================================

#[test]
fn regular_cache_initial_load() {
    let path = write_file("regular-initial", &build_regular_cache());
    let pool = FilePool::default();
    assert_eq!(fast_get_backing_cache_count(&pool, 100, &path), 1);

    let (host, controller) = open(&path, 100);

    assert_eq!(controller.view_state(), ViewState::Loaded);
    assert_eq!(controller.get_available_images(), vec![INSTALL_NAME.to_string()]);
    assert_eq!(controller.image_headers().len(), 1);
    assert_eq!(controller.backing_caches().len(), 1);
    assert!(controller.backing_caches()[0].is_primary);
    assert_eq!(controller.image_start(INSTALL_NAME), Some(IMAGE_VA));

    let header = controller.macho_header_for_name(INSTALL_NAME).unwrap();
    assert_eq!(header.text_base, IMAGE_VA);
    assert_eq!(header.segments.len(), 2);
    assert!(header.linkedit_present);
    assert!(header.export_trie_present);
    assert_eq!(header.export_trie_path, path.to_string_lossy());

    // The initial scan persisted metadata on the view.
    assert!(host.metadata.contains_key(SHARED_CACHE_METADATA_TAG));

    std::fs::remove_file(&path).ok();
}

#[test]
fn regular_cache_region_disjointness() {
    let path = write_file("regular-disjoint", &build_regular_cache());
    let (_host, controller) = open(&path, 101);

    // No non-image region may overlap an image segment.
    let header = controller.macho_header_for_name(INSTALL_NAME).unwrap();
    let segments: Vec<(u64, u64)> = header
        .segments
        .iter()
        .map(|seg| (seg.vmaddr, seg.vmaddr + seg.vmsize))
        .collect();

    let json = serde_json::from_str::<serde_json::Value>(
        &_host.metadata[SHARED_CACHE_METADATA_TAG],
    )
    .unwrap();
    for region in json["nonImageRegions"].as_array().unwrap() {
        let start = region["start"].as_u64().unwrap();
        let end = start + region["size"].as_u64().unwrap();
        for &(seg_start, seg_end) in &segments {
            assert!(
                end <= seg_start || start >= seg_end,
                "non-image region {start:#x}..{end:#x} overlaps segment {seg_start:#x}..{seg_end:#x}"
            );
        }
    }

    std::fs::remove_file(&path).ok();
}

// =============================================================================
// Scenario 2: image load
// =============================================================================

#[test]
fn regular_cache_image_load() {
    let path = write_file("regular-load", &build_regular_cache());
    let (mut host, mut controller) = open(&path, 102);

    assert!(controller.load_image_with_install_name(&mut host, INSTALL_NAME, true));
    assert_eq!(controller.view_state(), ViewState::LoadedWithImages);

    // __TEXT is loaded; __LINKEDIT is excluded by default.
    let regions = controller.mapped_regions();
    assert_eq!(regions.len(), 1);
    assert_eq!(regions[0].pretty_name, "libtest.dylib::__TEXT");
    assert!(regions[0].loaded);

    // The image bytes are observable at their cache address.
    let magic = host.read_virtual(IMAGE_VA, 4).unwrap();
    assert_eq!(magic, MH_MAGIC_64.to_le_bytes());

    // Mach-O header typing ran at the image base.
    assert_eq!(host.data_variables.get(&IMAGE_VA).unwrap(), "mach_header_64");
    assert!(host
        .auto_symbols
        .get(&IMAGE_VA)
        .unwrap()
        .name
        .starts_with("__macho_header::"));

    // Export trie symbols were synthesized against the loaded image.
    assert!(host.auto_symbols.values().any(|s| s.name == "_abc"));

    std::fs::remove_file(&path).ok();
}

#[test]
fn regular_cache_image_load_idempotent() {
    let path = write_file("regular-idem", &build_regular_cache());
    let (mut host, mut controller) = open(&path, 103);

    assert!(controller.load_image_with_install_name(&mut host, INSTALL_NAME, true));
    let segments = host.segments.len();
    let symbols = host.auto_symbols.len();
    let mapped = controller.mapped_regions().len();

    // Everything is already loaded: the second call changes nothing.
    controller.load_image_with_install_name(&mut host, INSTALL_NAME, true);
    assert_eq!(host.segments.len(), segments);
    assert_eq!(host.auto_symbols.len(), symbols);
    assert_eq!(controller.mapped_regions().len(), mapped);

    std::fs::remove_file(&path).ok();
}

#[test]
fn reopen_adopts_persisted_state() {
    let path = write_file("regular-reopen", &build_regular_cache());
    let (mut host, mut controller) = open(&path, 104);
    assert!(controller.load_image_with_install_name(&mut host, INSTALL_NAME, true));

    // A second controller over the same view adopts the snapshot instead of
    // rescanning.
    let settings = LoadSettings {
        auto_load_lib_system: false,
        ..LoadSettings::default()
    };
    let reopened =
        SharedCacheController::new(&mut host, &path, Arc::new(FilePool::default()), settings)
            .unwrap();
    assert_eq!(reopened.view_state(), ViewState::LoadedWithImages);
    assert_eq!(reopened.get_available_images(), vec![INSTALL_NAME.to_string()]);
    assert_eq!(reopened.mapped_regions().len(), 1);

    std::fs::remove_file(&path).ok();
}

#[test]
fn metadata_round_trips() {
    let path = write_file("regular-roundtrip", &build_regular_cache());
    let (host, _controller) = open(&path, 105);

    let json = host.metadata.get(SHARED_CACHE_METADATA_TAG).unwrap();
    let state: dscload::State = dscload::serialize::from_versioned_json(json).unwrap();
    let json_again = dscload::serialize::to_versioned_json(&state).unwrap();
    assert_eq!(json, &json_again);

    std::fs::remove_file(&path).ok();
}

// =============================================================================
// Scenario 3 and 6: split cache with a stub island
// =============================================================================

const ISLAND_VA: u64 = 0x1_0002_0000;

fn build_split_cache(tag: &str) -> PathBuf {
    let primary = write_file(&format!("split-{tag}"), &build_split_primary());

    let mut sub1 = primary.clone().into_os_string();
    sub1.push(".1");
    std::fs::write(&sub1, build_stub_island_sub_cache(ISLAND_VA)).unwrap();

    let mut symbols = primary.clone().into_os_string();
    symbols.push(".symbols");
    std::fs::write(&symbols, build_symbols_sub_cache()).unwrap();

    primary
}

fn remove_split_cache(primary: &PathBuf) {
    for suffix in ["", ".1", ".symbols"] {
        let mut path = primary.clone().into_os_string();
        path.push(suffix);
        std::fs::remove_file(PathBuf::from(path)).ok();
    }
}

#[test]
fn split_cache_discovery() {
    let primary = build_split_cache("discovery");
    let pool = FilePool::default();
    assert_eq!(fast_get_backing_cache_count(&pool, 110, &primary), 3);

    let (_host, controller) = open(&primary, 110);

    let caches = controller.backing_caches();
    assert_eq!(caches.len(), 3);
    assert!(caches[0].is_primary);
    assert!(!caches[1].is_primary);
    assert!(!caches[2].is_primary);
    assert!(caches[1].path.to_string_lossy().ends_with(".1"));
    assert!(caches[2].path.to_string_lossy().ends_with(".symbols"));

    assert_eq!(controller.get_available_images(), vec![INSTALL_NAME.to_string()]);

    remove_split_cache(&primary);
}

#[test]
fn split_cache_stub_island_section_load() {
    let primary = build_split_cache("island");
    let (mut host, mut controller) = open(&primary, 111);

    // The imageless single-mapping sub-cache became a stub island region.
    let name = controller.name_for_address(ISLAND_VA + 0x1000);
    assert!(name.ends_with("::_stubs"), "unexpected region name {name}");

    assert!(controller.load_section_at_address(&mut host, ISLAND_VA + 0x1000));

    let regions = controller.mapped_regions();
    assert_eq!(regions.len(), 1);
    assert_eq!(
        regions[0].flags,
        RegionFlags::READABLE | RegionFlags::EXECUTABLE
    );
    assert!(regions[0].loaded);
    assert!(host.is_valid_offset(ISLAND_VA));

    // Persisted: the metadata knows the island is loaded.
    let json = host.metadata.get(SHARED_CACHE_METADATA_TAG).unwrap();
    assert!(json.contains("\"loaded\":true"));

    // Idempotent: a second call succeeds without further mutation.
    let segments = host.segments.len();
    assert!(controller.load_section_at_address(&mut host, ISLAND_VA + 0x1000));
    assert_eq!(host.segments.len(), segments);
    assert_eq!(controller.mapped_regions().len(), 1);

    remove_split_cache(&primary);
}

// =============================================================================
// Scenario 4: slide info v3
// =============================================================================

/// A cache file carrying a v3 slide table over one data page with two
/// chained authenticated pointers.
fn build_slide_v3_file() -> Vec<u8> {
    let mut buf = vec![0u8; 0x2000];
    put_bytes(&mut buf, 0, b"dyld_v1   arm64\0");

    let header_size = std::mem::size_of::<DyldCacheHeader>() as u32;
    put_u32(&mut buf, offset_of!(DyldCacheHeader, mapping_offset), header_size);
    put_u32(&mut buf, offset_of!(DyldCacheHeader, mapping_count), 1);
    put_u32(&mut buf, offset_of!(DyldCacheHeader, mapping_with_slide_offset), header_size + 32);
    put_u32(&mut buf, offset_of!(DyldCacheHeader, mapping_with_slide_count), 1);

    put_mapping(&mut buf, header_size as usize, TEXT_BASE, 0x2000, 0, 0x3);

    // Extended mapping: the data page at +0x1000, slide table at 0x800.
    let ext = (header_size + 32) as usize;
    put_u64(&mut buf, ext, TEXT_BASE + 0x1000);
    put_u64(&mut buf, ext + 8, 0x1000); // size
    put_u64(&mut buf, ext + 16, 0x1000); // file offset
    put_u64(&mut buf, ext + 24, 0x800); // slide info file offset
    put_u64(&mut buf, ext + 32, 0x100); // slide info file size
    put_u64(&mut buf, ext + 40, 0); // flags
    put_u32(&mut buf, ext + 48, 0x3);
    put_u32(&mut buf, ext + 52, 0x3);

    // Slide info v3 header + one page start.
    put_u32(&mut buf, 0x800, 3); // version
    put_u32(&mut buf, 0x804, 0x1000); // page size
    put_u32(&mut buf, 0x808, 1); // page starts count
    put_u64(&mut buf, 0x810, 0xDEAD); // auth_value_add, replaced by the base
    put_u16(&mut buf, 0x818, 0); // page start: first pointer at offset 0

    // Chain: auth pointer at +0, next = 2 strides; auth pointer at +0x10.
    put_u64(&mut buf, 0x1000, (1u64 << 63) | (2u64 << 51) | 0x1000);
    put_u64(&mut buf, 0x1010, (1u64 << 63) | 0x2000);
    buf
}

#[test]
fn slide_v3_rewrites_chained_pointers() {
    let path = write_file("slide-v3", &build_slide_v3_file());
    let pool = FilePool::default();

    let lazy = pool
        .open(
            120,
            &path,
            Some(Arc::new(|file: &mut dscload::MappedFile| {
                apply_slide_info(file, TEXT_BASE).unwrap();
            })),
        )
        .unwrap();
    let file = lazy.lock().unwrap();

    assert_eq!(file.read_u64(0x1000).unwrap(), 0x1_0000_1000);
    assert_eq!(file.read_u64(0x1010).unwrap(), 0x1_0000_2000);
    assert!(file.slide_info_was_applied());

    std::fs::remove_file(&path).ok();
}

#[test]
fn slide_apply_is_idempotent() {
    let path = write_file("slide-idem", &build_slide_v3_file());
    let pool = FilePool::default();

    let lazy = pool
        .open(
            121,
            &path,
            Some(Arc::new(|file: &mut dscload::MappedFile| {
                apply_slide_info(file, TEXT_BASE).unwrap();
                let snapshot = file.read_buffer(0x1000, 0x20).unwrap();
                apply_slide_info(file, TEXT_BASE).unwrap();
                assert_eq!(snapshot, file.read_buffer(0x1000, 0x20).unwrap());
            })),
        )
        .unwrap();
    let file = lazy.lock().unwrap();
    assert_eq!(file.read_u64(0x1000).unwrap(), 0x1_0000_1000);

    std::fs::remove_file(&path).ok();
}

// =============================================================================
// Slide info v2, legacy single-mapping dispatch
// =============================================================================

/// A legacy cache: `slideInfoOffsetUnused` set, v2 table covering the
/// second mapping.
fn build_slide_v2_legacy_file() -> Vec<u8> {
    let mut buf = vec![0u8; 0x2000];
    put_bytes(&mut buf, 0, b"dyld_v0   arm64\0");

    let mapping_offset = 344u32;
    put_u32(&mut buf, offset_of!(DyldCacheHeader, mapping_offset), mapping_offset);
    put_u32(&mut buf, offset_of!(DyldCacheHeader, mapping_count), 2);
    put_u64(&mut buf, offset_of!(DyldCacheHeader, slide_info_offset_unused), 0x800);
    put_u64(&mut buf, offset_of!(DyldCacheHeader, slide_info_size_unused), 0x100);

    // First mapping: text. Second: the data mapping the table covers.
    put_mapping(&mut buf, mapping_offset as usize, TEXT_BASE, 0x1000, 0, 0x5);
    put_mapping(&mut buf, mapping_offset as usize + 32, TEXT_BASE + 0x1000, 0x1000, 0x1000, 0x3);

    // Slide info v2.
    put_u32(&mut buf, 0x800, 2); // version
    put_u32(&mut buf, 0x804, 0x1000); // page size
    put_u32(&mut buf, 0x808, 40); // page starts offset
    put_u32(&mut buf, 0x80C, 1); // page starts count
    put_u32(&mut buf, 0x810, 0); // page extras offset
    put_u32(&mut buf, 0x814, 0); // page extras count
    put_u64(&mut buf, 0x818, 0x00FF_0000_0000_0000); // delta mask
    put_u64(&mut buf, 0x820, TEXT_BASE); // value add
    put_u16(&mut buf, 0x828, 0); // page start 0 (offset 0 words)

    // Chain at +0: delta 0x10 bytes to the next pointer, value 0x1000.
    // delta_shift = trailing_zeros(mask) - 2 = 46.
    put_u64(&mut buf, 0x1000, (0x10u64 << 46) | 0x1000);
    // Terminal pointer: delta 0, value 0x2000.
    put_u64(&mut buf, 0x1010, 0x2000);
    // Not part of the chain; must stay untouched.
    put_u64(&mut buf, 0x1008, 0);
    buf
}

#[test]
fn slide_v2_legacy_rewrites() {
    let path = write_file("slide-v2", &build_slide_v2_legacy_file());
    let pool = FilePool::default();

    let lazy = pool
        .open(
            122,
            &path,
            Some(Arc::new(|file: &mut dscload::MappedFile| {
                apply_slide_info(file, TEXT_BASE).unwrap();
            })),
        )
        .unwrap();
    let file = lazy.lock().unwrap();

    assert_eq!(file.read_u64(0x1000).unwrap(), TEXT_BASE + 0x1000);
    assert_eq!(file.read_u64(0x1010).unwrap(), TEXT_BASE + 0x2000);
    assert_eq!(file.read_u64(0x1008).unwrap(), 0);

    std::fs::remove_file(&path).ok();
}

// =============================================================================
// Scenario 5: LoadAllSymbolsAndWait
// =============================================================================

#[test]
fn load_all_symbols() {
    let path = write_file("symbols", &build_regular_cache());
    let (mut host, mut controller) = open(&path, 130);

    let symbols = controller.load_all_symbols_and_wait(&mut host);

    let pairs: Vec<(&str, &str, u64)> = symbols
        .iter()
        .map(|(install, sym)| (install.as_str(), sym.name.as_str(), sym.address))
        .collect();
    assert_eq!(
        pairs,
        vec![
            (INSTALL_NAME, "_a", IMAGE_VA + 0x10),
            (INSTALL_NAME, "_ab", IMAGE_VA + 0x20),
            (INSTALL_NAME, "_abc", IMAGE_VA + 0x30),
        ]
    );

    // Export info was persisted.
    let json = host.metadata.get(SHARED_CACHE_METADATA_TAG).unwrap();
    assert!(json.contains("_abc"));

    std::fs::remove_file(&path).ok();
}

// =============================================================================
// Address naming
// =============================================================================

#[test]
fn name_and_image_lookup() {
    let path = write_file("naming", &build_regular_cache());
    let (_host, controller) = open(&path, 131);

    assert_eq!(controller.image_name_for_address(IMAGE_VA + 0x100), "libtest.dylib");
    assert_eq!(controller.image_name_for_address(0x9_0000_0000), "");

    // Outside any image, the mapping-derived region name wins.
    let name = controller.name_for_address(TEXT_BASE);
    assert!(name.ends_with("::0"), "unexpected region name {name}");

    std::fs::remove_file(&path).ok();
}
