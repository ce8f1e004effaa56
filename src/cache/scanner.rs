//! Cache header scanner.
//!
//! Given the primary cache file, detects which of the four on-disk layouts
//! the cache uses, then enumerates backing caches, mappings, images, branch
//! pools and sub-cache entries into a unified catalog the controller builds
//! its state from.

use std::mem::{offset_of, size_of};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use zerocopy::FromBytes;

use super::structs::*;
use crate::controller::{BackingCache, MemoryRegion};
use crate::error::{Error, Result};
use crate::host::RegionFlags;
use crate::pool::{FilePool, MappedFile, SessionId};
use crate::util::base_name;

/// Where local symbols live, for diagnostics.
#[derive(Debug, Clone)]
pub struct LocalSymbolsLocation {
    /// File holding the local symbols chunk
    pub path: PathBuf,
    /// Offset of the chunk within that file
    pub offset: u64,
    /// Parsed chunk header
    pub info: DyldCacheLocalSymbolsInfo,
}

/// The unified catalog produced by scanning a cache.
#[derive(Debug, Default)]
pub struct CacheScan {
    /// Detected layout family
    pub format: CacheFormat,
    /// Backing caches, primary first
    pub backing_caches: Vec<BackingCache>,
    /// Install name to Mach-O header address
    pub image_starts: Vec<(String, u64)>,
    /// Branch pool addresses (Regular format only; parsed as Mach-Os later)
    pub regular_branch_pools: Vec<u64>,
    /// Stub island regions from single-mapping imageless sub-caches
    pub stub_islands: Vec<MemoryRegion>,
    /// Read-only dyld data regions from `.dylddata` sub-caches
    pub dyld_data_regions: Vec<MemoryRegion>,
    /// ObjC optimization data range (offset, size) if declared
    pub objc_optimization_range: Option<(u64, u64)>,
    /// Local symbols chunk location, if any
    pub local_symbols: Option<LocalSymbolsLocation>,
}

/// Reads a cache header clamped to the size the file declares at offset 16.
///
/// Fields past the declared end stay zeroed, which the presence helpers on
/// [`DyldCacheHeader`] account for.
pub(crate) fn read_clamped_header(file: &MappedFile) -> Result<DyldCacheHeader> {
    let magic = file.read_u32(0)?;
    if magic.to_le_bytes() != *DYLD_CACHE_MAGIC_PREFIX {
        return Err(Error::UnknownMagic { addr: 0, magic });
    }

    let declared = file.read_u32(16)? as usize;
    let take = declared.min(size_of::<DyldCacheHeader>());
    if declared > size_of::<DyldCacheHeader>() {
        debug!(
            declared,
            known = size_of::<DyldCacheHeader>(),
            "header larger than known layout, clamping"
        );
    }

    let mut buf = [0u8; size_of::<DyldCacheHeader>()];
    file.read_into(&mut buf[..take], 0)?;
    Ok(DyldCacheHeader::read_from_bytes(&buf).expect("header buffer is exactly sized"))
}

/// Builds a sibling path by appending a suffix to the primary's file name.
fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Sub-cache entry extensions are appended verbatim when they already carry
/// a dot, otherwise one is inserted.
fn extension_suffix(extension: &str) -> String {
    if extension.contains('.') {
        extension.to_string()
    } else {
        format!(".{extension}")
    }
}

/// Applies the format detection decision table.
fn detect_format(header: &DyldCacheHeader, path: &Path) -> CacheFormat {
    let mut format = CacheFormat::Regular;

    if (header.mapping_offset as usize) > offset_of!(DyldCacheHeader, sub_cache_array_offset) {
        if header.cache_type == 2 {
            format = CacheFormat::Ios16;
        } else if sibling_path(path, ".01").exists() {
            format = CacheFormat::Large;
        } else {
            format = CacheFormat::Split;
        }
    }

    format
}

fn read_mappings(file: &MappedFile, header: &DyldCacheHeader) -> Result<Vec<DyldCacheMappingInfo>> {
    let mut mappings = Vec::with_capacity(header.mapping_count as usize);
    for i in 0..header.mapping_count as u64 {
        let offset = header.mapping_offset as u64 + i * size_of::<DyldCacheMappingInfo>() as u64;
        let mut buf = [0u8; size_of::<DyldCacheMappingInfo>()];
        file.read_into(&mut buf, offset)?;
        mappings.push(DyldCacheMappingInfo::read_from_bytes(&buf).expect("sized buffer"));
    }
    Ok(mappings)
}

fn read_image_starts(file: &MappedFile, header: &DyldCacheHeader) -> Result<Vec<(String, u64)>> {
    let (count, offset) = if header.uses_new_images_offset() {
        (header.images_count as u64, header.images_offset as u64)
    } else {
        (header.images_count_old as u64, header.images_offset_old as u64)
    };

    let mut starts = Vec::with_capacity(count as usize);
    for i in 0..count {
        let entry_offset = offset + i * size_of::<DyldCacheImageInfo>() as u64;
        let mut buf = [0u8; size_of::<DyldCacheImageInfo>()];
        file.read_into(&mut buf, entry_offset)?;
        let info = DyldCacheImageInfo::read_from_bytes(&buf).expect("sized buffer");
        let name = file.read_null_terminated_string(info.path_file_offset as u64)?;
        starts.push((name, info.address));
    }
    Ok(starts)
}

fn read_branch_pools(file: &MappedFile, header: &DyldCacheHeader) -> Result<Vec<u64>> {
    let mut pools = Vec::with_capacity(header.branch_pools_count as usize);
    for i in 0..header.branch_pools_count as u64 {
        pools.push(file.read_u64(header.branch_pools_offset as u64 + i * 8)?);
    }
    Ok(pools)
}

/// A sub-cache consisting of exactly one mapping and no images is a branch
/// stub island.
fn is_stub_island(header: &DyldCacheHeader) -> bool {
    header.mapping_count == 1
        && header.images_count_old == 0
        && header.images_count == 0
        && header.images_text_offset == 0
}

/// Opens one sub-cache file, appending its catalog contributions.
fn scan_sub_cache(
    pool: &FilePool,
    session: SessionId,
    scan: &mut CacheScan,
    sub_path: &Path,
    display_name: &str,
) -> Result<()> {
    let file = pool.open(session, sub_path, None)?.lock()?;
    let header = read_clamped_header(&file)?;
    let mappings = read_mappings(&file, &header)?;

    if sub_path.to_string_lossy().contains(".dylddata") {
        for (j, mapping) in mappings.iter().enumerate() {
            scan.dyld_data_regions.push(MemoryRegion::new(
                format!("{display_name}::_data{j}"),
                mapping.address,
                mapping.size,
                RegionFlags::READABLE,
            ));
        }
    }

    if is_stub_island(&header) {
        let mapping = &mappings[0];
        scan.stub_islands.push(MemoryRegion::new(
            format!("{display_name}::_stubs"),
            mapping.address,
            mapping.size,
            RegionFlags::READABLE | RegionFlags::EXECUTABLE,
        ));
    }

    scan.backing_caches.push(BackingCache {
        path: sub_path.to_path_buf(),
        is_primary: false,
        mappings,
    });
    Ok(())
}

/// Appends the optional `.symbols` sibling, shared by every format.
fn scan_symbols_sibling(
    pool: &FilePool,
    session: SessionId,
    scan: &mut CacheScan,
    path: &Path,
) -> Result<()> {
    let symbols_path = sibling_path(path, ".symbols");
    let lazy = match pool.open(session, &symbols_path, None) {
        Ok(lazy) => lazy,
        Err(Error::FileMissing { .. }) => {
            debug!(path = %symbols_path.display(), "no .symbols sibling");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let file = lazy.lock()?;
    let header = read_clamped_header(&file)?;
    let mappings = read_mappings(&file, &header)?;

    if header.local_symbols_offset != 0 && scan.local_symbols.is_none() {
        scan.local_symbols = read_local_symbols(&file, header.local_symbols_offset, &symbols_path)?;
    }

    scan.backing_caches.push(BackingCache {
        path: symbols_path,
        is_primary: false,
        mappings,
    });
    Ok(())
}

fn read_local_symbols(
    file: &MappedFile,
    offset: u64,
    path: &Path,
) -> Result<Option<LocalSymbolsLocation>> {
    let mut buf = [0u8; size_of::<DyldCacheLocalSymbolsInfo>()];
    if file.read_into(&mut buf, offset).is_err() {
        warn!(offset, "local symbols info lies outside the file");
        return Ok(None);
    }
    let info = DyldCacheLocalSymbolsInfo::read_from_bytes(&buf).expect("sized buffer");
    Ok(Some(LocalSymbolsLocation {
        path: path.to_path_buf(),
        offset,
        info,
    }))
}

/// Scans a cache starting from its primary file.
pub fn scan_cache(pool: &FilePool, session: SessionId, path: &Path) -> Result<CacheScan> {
    let base_file = pool.open(session, path, None)?.lock()?;
    let header = read_clamped_header(&base_file)?;

    let mut scan = CacheScan {
        format: detect_format(&header, path),
        ..CacheScan::default()
    };

    if header.contains_field(offset_of!(DyldCacheHeader, objc_opts_size))
        && header.objc_opts_offset != 0
        && header.objc_opts_size != 0
    {
        scan.objc_optimization_range = Some((header.objc_opts_offset, header.objc_opts_size));
    }

    scan.backing_caches.push(BackingCache {
        path: path.to_path_buf(),
        is_primary: true,
        mappings: read_mappings(&base_file, &header)?,
    });

    scan.image_starts = read_image_starts(&base_file, &header)?;
    info!(images = scan.image_starts.len(), format = %scan.format, "scanned primary cache");

    let branch_pools = read_branch_pools(&base_file, &header)?;
    if !branch_pools.is_empty() {
        debug!(pools = branch_pools.len(), "found branch pools");
        match scan.format {
            CacheFormat::Regular => scan.regular_branch_pools = branch_pools,
            _ => {
                for (i, address) in branch_pools.into_iter().enumerate() {
                    scan.image_starts
                        .push((format!("dyld_shared_cache_branch_islands_{i}"), address));
                }
            }
        }
    }

    if header.local_symbols_offset != 0 && header.local_symbols_size != 0 {
        scan.local_symbols = read_local_symbols(&base_file, header.local_symbols_offset, path)?;
    }

    let display_base = base_name(&path.to_string_lossy()).to_string();

    match scan.format {
        CacheFormat::Regular => {}
        CacheFormat::Split => {
            // Numbered siblings carry no entry table metadata worth reading.
            drop(base_file);
            for i in 1..=header.sub_cache_array_count as u64 {
                let sub_path = sibling_path(path, &format!(".{i}"));
                let display = format!("{display_base}.{i}");
                scan_sub_cache(pool, session, &mut scan, &sub_path, &display)?;
            }
        }
        CacheFormat::Large | CacheFormat::Ios16 => {
            let mut entries = Vec::with_capacity(header.sub_cache_array_count as usize);
            for i in 0..header.sub_cache_array_count as u64 {
                let offset =
                    header.sub_cache_array_offset as u64 + i * size_of::<DyldSubcacheEntry2>() as u64;
                let mut buf = [0u8; size_of::<DyldSubcacheEntry2>()];
                base_file.read_into(&mut buf, offset)?;
                entries.push(DyldSubcacheEntry2::read_from_bytes(&buf).expect("sized buffer"));
            }
            drop(base_file);

            for entry in &entries {
                let suffix = extension_suffix(entry.extension());
                let sub_path = sibling_path(path, &suffix);
                let display = format!("{display_base}{suffix}");
                scan_sub_cache(pool, session, &mut scan, &sub_path, &display)?;
            }
        }
    }

    // A missing .symbols sibling is common and harmless; a broken one is not.
    if let Err(e) = scan_symbols_sibling(pool, session, &mut scan, path) {
        warn!(error = %e, "failed to load .symbols sibling");
    }

    Ok(scan)
}

/// Counts backing caches without enumerating anything else.
///
/// Used by hosts to answer "is this a cache worth opening" before committing
/// to the initial scan.
pub fn fast_backing_cache_count(pool: &FilePool, session: SessionId, path: &Path) -> Result<u64> {
    let file = pool.open(session, path, None)?.lock()?;
    let header = read_clamped_header(&file)?;
    let count = header.sub_cache_array_count as u64;

    Ok(match detect_format(&header, path) {
        CacheFormat::Regular => 1,
        CacheFormat::Large => count + 1,
        CacheFormat::Split | CacheFormat::Ios16 => count + 2,
    })
}
