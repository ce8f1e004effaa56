//! Slide-info fixups.
//!
//! Shared cache pointers are stored as per-page chains whose links encode
//! both the unslid target and the distance to the next pointer. This module
//! walks the v2, v3 and v5 page-start tables of one backing cache file and
//! rewrites every chained pointer in the private mapping to its unslid
//! value.
//!
//! Chain walks are side-effect-free iterators over `(file_offset, value)`
//! pairs; all writes happen in a second pass. A torn read mid-chain is
//! logged and ends that chain only.

use std::mem::size_of;

use tracing::{debug, error, warn};
use zerocopy::FromBytes;

use crate::cache::scanner::read_clamped_header;
use crate::cache::structs::*;
use crate::error::{Error, Result};
use crate::pool::MappedFile;

/// One slide table paired with the mapping it covers.
#[derive(Debug, Clone)]
struct SlideMapping {
    /// VA/size/file-offset of the covered mapping
    info: DyldCacheMappingInfo,
    /// File offset of the slide table
    table_offset: u64,
    table: SlideTable,
}

#[derive(Debug, Clone, Copy)]
enum SlideTable {
    V2(DyldCacheSlideInfo2),
    V3(DyldCacheSlideInfo3),
    V5(DyldCacheSlideInfo5),
}

fn read_struct<T: FromBytes>(file: &MappedFile, offset: u64) -> Result<T> {
    let span = file.read_span(offset, size_of::<T>() as u64)?;
    Ok(T::read_from_bytes(span).expect("span is exactly sized"))
}

// =============================================================================
// Chain Walkers
// =============================================================================

/// v2 chain: byte deltas packed into the pointer itself.
struct ChainV2<'a> {
    file: &'a MappedFile,
    delta_mask: u64,
    delta_shift: u32,
    value_add: u64,
    offset: u64,
    done: bool,
}

impl Iterator for ChainV2<'_> {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<(u64, u64)> {
        if self.done {
            return None;
        }
        let raw = match self.file.read_u64(self.offset) {
            Ok(raw) => raw,
            Err(e) => {
                error!(offset = self.offset, error = %e, "failed to read v2 slide pointer");
                self.done = true;
                return None;
            }
        };

        let delta = (raw & self.delta_mask) >> self.delta_shift;
        let mut value = raw & !self.delta_mask;
        if value != 0 {
            value += self.value_add;
        }

        let item = (self.offset, value);
        if delta == 0 {
            self.done = true;
        } else {
            self.offset += delta;
        }
        Some(item)
    }
}

/// v3 chain: 8-byte strides, authenticated and plain encodings.
struct ChainV3<'a> {
    file: &'a MappedFile,
    auth_value_add: u64,
    offset: u64,
    done: bool,
}

impl Iterator for ChainV3<'_> {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<(u64, u64)> {
        if self.done {
            return None;
        }
        let raw = match self.file.read_u64(self.offset) {
            Ok(raw) => raw,
            Err(e) => {
                error!(offset = self.offset, error = %e, "failed to read v3 slide pointer");
                self.done = true;
                return None;
            }
        };

        let ptr = SlidePointer3(raw);
        let value = if ptr.is_auth() {
            ptr.offset_from_shared_cache_base() + self.auth_value_add
        } else {
            ptr.plain_value()
        };

        let item = (self.offset, value);
        let delta = ptr.offset_to_next_pointer();
        if delta == 0 {
            self.done = true;
        } else {
            self.offset += delta * 8;
        }
        Some(item)
    }
}

/// v5 chain: 8-byte strides, value is always base plus runtime offset.
struct ChainV5<'a> {
    file: &'a MappedFile,
    value_add: u64,
    offset: u64,
    done: bool,
}

impl Iterator for ChainV5<'_> {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<(u64, u64)> {
        if self.done {
            return None;
        }
        let raw = match self.file.read_u64(self.offset) {
            Ok(raw) => raw,
            Err(e) => {
                error!(offset = self.offset, error = %e, "failed to read v5 slide pointer");
                self.done = true;
                return None;
            }
        };

        let ptr = SlidePointer5(raw);
        let value = self.value_add + ptr.runtime_offset();

        let item = (self.offset, value);
        let delta = ptr.next();
        if delta == 0 {
            self.done = true;
        } else {
            self.offset += delta * 8;
        }
        Some(item)
    }
}

// =============================================================================
// Table Collection
// =============================================================================

/// Collects the slide tables the file's header references.
///
/// `base` is the minimum mapping address across all backing caches; v3 and
/// v5 tables carry it as their add value in the modern layout.
fn collect_mappings(file: &MappedFile, base: u64) -> Result<Vec<SlideMapping>> {
    let header = read_clamped_header(file)?;
    let mut mappings = Vec::new();

    if header.slide_info_offset_unused != 0 {
        // Legacy single-mapping cache: the table covers the second mapping,
        // per Apple convention, and carries its own add values.
        let table_offset = header.slide_info_offset_unused;
        let version = file.read_u32(table_offset)?;
        let info: DyldCacheMappingInfo = read_struct(
            file,
            header.mapping_offset as u64 + size_of::<DyldCacheMappingInfo>() as u64,
        )?;

        let table = match version {
            2 => SlideTable::V2(read_struct(file, table_offset)?),
            3 => SlideTable::V3(read_struct(file, table_offset)?),
            _ => {
                return Err(Error::UnknownSlideInfoVersion {
                    version,
                    offset: table_offset,
                })
            }
        };
        mappings.push(SlideMapping {
            info,
            table_offset,
            table,
        });
        return Ok(mappings);
    }

    if !header.has_mappings_with_slide() || header.mapping_with_slide_count == 0 {
        debug!(path = %file.path().display(), "no mappings with slide info");
        return Ok(mappings);
    }

    for i in 0..header.mapping_with_slide_count as u64 {
        let entry: DyldCacheMappingAndSlideInfo = read_struct(
            file,
            header.mapping_with_slide_offset as u64
                + i * size_of::<DyldCacheMappingAndSlideInfo>() as u64,
        )?;
        if entry.slide_info_file_offset == 0 || entry.size == 0 {
            continue;
        }

        let table_offset = entry.slide_info_file_offset;
        let version = file.read_u32(table_offset)?;
        let table = match version {
            2 => SlideTable::V2(read_struct(file, table_offset)?),
            3 => {
                let mut table: DyldCacheSlideInfo3 = read_struct(file, table_offset)?;
                table.auth_value_add = base;
                SlideTable::V3(table)
            }
            5 => {
                let mut table: DyldCacheSlideInfo5 = read_struct(file, table_offset)?;
                table.value_add = base;
                SlideTable::V5(table)
            }
            _ => {
                error!(
                    version,
                    offset = table_offset,
                    "unknown slide info version, skipping mapping"
                );
                continue;
            }
        };

        mappings.push(SlideMapping {
            info: DyldCacheMappingInfo {
                address: entry.address,
                size: entry.size,
                file_offset: entry.file_offset,
                max_prot: entry.max_prot,
                init_prot: entry.init_prot,
            },
            table_offset,
            table,
        });
    }

    Ok(mappings)
}

// =============================================================================
// Per-Version Walks
// =============================================================================

fn walk_v2(
    file: &MappedFile,
    mapping: &SlideMapping,
    table: &DyldCacheSlideInfo2,
    rewrites: &mut Vec<(u64, u64)>,
) {
    let page_size = table.page_size as u64;
    let starts_offset = mapping.table_offset + table.page_starts_offset as u64;
    let extras_offset = mapping.table_offset + table.page_extras_offset as u64;

    for i in 0..table.page_starts_count as u64 {
        let start = match file.read_u16(starts_offset + i * 2) {
            Ok(start) => start,
            Err(e) => {
                error!(page = i, error = %e, "failed to read v2 page start");
                continue;
            }
        };
        if start == DYLD_CACHE_SLIDE_PAGE_ATTR_NO_REBASE {
            continue;
        }

        let page = mapping.info.file_offset + page_size * i;
        let chain = |start_offset: u64| ChainV2 {
            file,
            delta_mask: table.delta_mask,
            delta_shift: table.delta_shift(),
            value_add: table.value_add,
            offset: page + start_offset,
            done: false,
        };

        if start & DYLD_CACHE_SLIDE_PAGE_ATTR_EXTRA != 0 {
            let mut j = (start & 0x3FFF) as u64;
            loop {
                let extra = match file.read_u16(extras_offset + j * 2) {
                    Ok(extra) => extra,
                    Err(e) => {
                        error!(index = j, error = %e, "failed to read v2 page extra");
                        break;
                    }
                };
                rewrites.extend(chain(((extra & 0x3FFF) as u64) * 4));
                if extra & DYLD_CACHE_SLIDE_PAGE_ATTR_END != 0 {
                    break;
                }
                j += 1;
            }
        } else {
            rewrites.extend(chain((start as u64) * 4));
        }
    }
}

fn walk_v3(
    file: &MappedFile,
    mapping: &SlideMapping,
    table: &DyldCacheSlideInfo3,
    rewrites: &mut Vec<(u64, u64)>,
) {
    let page_size = table.page_size as u64;
    let starts_offset = mapping.table_offset + size_of::<DyldCacheSlideInfo3>() as u64;

    for i in 0..table.page_starts_count as u64 {
        let start = match file.read_u16(starts_offset + i * 2) {
            Ok(start) => start,
            Err(e) => {
                error!(page = i, error = %e, "failed to read v3 page start");
                continue;
            }
        };
        if start == DYLD_CACHE_SLIDE_V3_PAGE_ATTR_NO_REBASE {
            continue;
        }

        rewrites.extend(ChainV3 {
            file,
            auth_value_add: table.auth_value_add,
            offset: mapping.info.file_offset + page_size * i + start as u64,
            done: false,
        });
    }
}

fn walk_v5(
    file: &MappedFile,
    mapping: &SlideMapping,
    table: &DyldCacheSlideInfo5,
    rewrites: &mut Vec<(u64, u64)>,
) {
    let page_size = table.page_size as u64;
    let starts_offset = mapping.table_offset + size_of::<DyldCacheSlideInfo5>() as u64;

    for i in 0..table.page_starts_count as u64 {
        let start = match file.read_u16(starts_offset + i * 2) {
            Ok(start) => start,
            Err(e) => {
                error!(page = i, error = %e, "failed to read v5 page start");
                continue;
            }
        };
        if start == DYLD_CACHE_SLIDE_V5_PAGE_ATTR_NO_REBASE {
            continue;
        }

        rewrites.extend(ChainV5 {
            file,
            value_add: table.value_add,
            offset: mapping.info.file_offset + page_size * i + start as u64,
            done: false,
        });
    }
}

// =============================================================================
// Entry Point
// =============================================================================

/// Rewrites every chained pointer in `file` to its unslid target.
///
/// Idempotent: the first call does the work and flags the mapping, later
/// calls return immediately. Runs inside the pool's post-allocation hook, so
/// the mapping is exclusively owned and no reader can observe a
/// half-rebased file.
pub fn apply_slide_info(file: &mut MappedFile, base: u64) -> Result<()> {
    if file.slide_info_was_applied() {
        return Ok(());
    }

    let mappings = collect_mappings(file, base)?;
    if mappings.is_empty() {
        file.set_slide_info_was_applied(true);
        return Ok(());
    }

    let mut rewrites: Vec<(u64, u64)> = Vec::new();
    for mapping in &mappings {
        match &mapping.table {
            SlideTable::V2(table) => walk_v2(file, mapping, table, &mut rewrites),
            SlideTable::V3(table) => walk_v3(file, mapping, table, &mut rewrites),
            SlideTable::V5(table) => walk_v5(file, mapping, table, &mut rewrites),
        }
    }

    for &(offset, value) in &rewrites {
        if let Err(e) = file.write_u64(offset, value) {
            warn!(offset, error = %e, "slide rewrite outside mapping");
        }
    }

    debug!(
        path = %file.path().display(),
        rewrites = rewrites.len(),
        "applied slide info"
    );
    file.set_slide_info_was_applied(true);
    Ok(())
}
