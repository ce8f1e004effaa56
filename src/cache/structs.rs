//! Dyld shared cache binary structures.
//!
//! These structures match the on-disk format of Apple's dyld shared cache.
//! They are designed for zero-copy parsing using the `zerocopy` crate and
//! are little-endian by construction.

use std::fmt;
use std::mem::offset_of;

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, KnownLayout};

/// The magic string prefix for all dyld caches.
pub const DYLD_CACHE_MAGIC_PREFIX: &[u8; 4] = b"dyld";

// =============================================================================
// Slide Info Constants
// =============================================================================

/// v2: index redirects into the extras array.
pub const DYLD_CACHE_SLIDE_PAGE_ATTR_EXTRA: u16 = 0x8000;
/// v2: page has no rebasing.
pub const DYLD_CACHE_SLIDE_PAGE_ATTR_NO_REBASE: u16 = 0x4000;
/// v2: last chain entry for the page (in the extras array).
pub const DYLD_CACHE_SLIDE_PAGE_ATTR_END: u16 = 0x8000;
/// v3: page has no rebasing.
pub const DYLD_CACHE_SLIDE_V3_PAGE_ATTR_NO_REBASE: u16 = 0xFFFF;
/// v5: page has no rebasing.
pub const DYLD_CACHE_SLIDE_V5_PAGE_ATTR_NO_REBASE: u16 = 0xFFFF;

// =============================================================================
// Cache Format
// =============================================================================

/// The on-disk layout family of a cache, determined once per controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheFormat {
    /// Single-file cache (pre-iOS 15 era), images in the legacy table.
    #[default]
    Regular,
    /// Primary plus numbered `.1`..`.N` sibling files.
    Split,
    /// Primary plus `.01`-style sibling files described by sub-cache entries.
    Large,
    /// Multi-cache layout (`cacheType == 2`), iOS 16 and later.
    Ios16,
}

impl From<CacheFormat> for u8 {
    fn from(format: CacheFormat) -> u8 {
        match format {
            CacheFormat::Regular => 0,
            CacheFormat::Split => 1,
            CacheFormat::Large => 2,
            CacheFormat::Ios16 => 3,
        }
    }
}

impl TryFrom<u8> for CacheFormat {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            0 => Ok(CacheFormat::Regular),
            1 => Ok(CacheFormat::Split),
            2 => Ok(CacheFormat::Large),
            3 => Ok(CacheFormat::Ios16),
            other => Err(other),
        }
    }
}

impl fmt::Display for CacheFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CacheFormat::Regular => "regular",
            CacheFormat::Split => "split",
            CacheFormat::Large => "large",
            CacheFormat::Ios16 => "iOS16",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Header Structures
// =============================================================================

/// The main dyld shared cache header.
///
/// This is a variable-length structure: `mapping_offset` marks where the
/// mapping table begins, and fields at or beyond that offset do not exist in
/// older caches. Always read through a clamped copy and gate field access on
/// [`DyldCacheHeader::contains_field`].
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheHeader {
    /// Magic identifier, e.g. "dyld_v1   arm64e"
    pub magic: [u8; 16],
    /// File offset to first `DyldCacheMappingInfo`
    pub mapping_offset: u32,
    /// Number of mapping entries
    pub mapping_count: u32,
    /// Legacy file offset to the image info array
    pub images_offset_old: u32,
    /// Legacy number of images
    pub images_count_old: u32,
    /// Base address of dyld when cache was built
    pub dyld_base_address: u64,
    /// File offset of code signature
    pub code_signature_offset: u64,
    /// Size of code signature
    pub code_signature_size: u64,
    /// Legacy whole-cache slide info offset; nonzero only in single-mapping caches
    pub slide_info_offset_unused: u64,
    /// Legacy whole-cache slide info size
    pub slide_info_size_unused: u64,
    /// File offset of local symbols info
    pub local_symbols_offset: u64,
    /// Size of local symbols info
    pub local_symbols_size: u64,
    /// UUID of this cache file
    pub uuid: [u8; 16],
    /// Cache type: 0 development, 1 production, 2 multi-cache
    pub cache_type: u64,
    /// Offset to table of branch pool addresses
    pub branch_pools_offset: u32,
    /// Number of branch pool addresses
    pub branch_pools_count: u32,
    /// Unslid address of the in-cache dyld mach_header
    pub dyld_in_cache_mh: u64,
    /// Unslid address of the in-cache dyld entry point
    pub dyld_in_cache_entry: u64,
    /// File offset to the image text info array
    pub images_text_offset: u64,
    /// Number of image text info entries
    pub images_text_count: u64,
    /// Address of patch info
    pub patch_info_addr: u64,
    /// Size of patch info
    pub patch_info_size: u64,
    /// Unused
    pub other_image_group_addr_unused: u64,
    /// Unused
    pub other_image_group_size_unused: u64,
    /// Address of program launch closures
    pub prog_closures_addr: u64,
    /// Size of program launch closures
    pub prog_closures_size: u64,
    /// Address of program closures trie
    pub prog_closures_trie_addr: u64,
    /// Size of program closures trie
    pub prog_closures_trie_size: u64,
    /// Platform number
    pub platform: u32,
    /// Format version byte followed by bit flags
    pub format_version_and_flags: u32,
    /// Base load address of the cache if not slid
    pub shared_region_start: u64,
    /// Size required to map the cache and all sub-caches
    pub shared_region_size: u64,
    /// Maximum runtime slide
    pub max_slide: u64,
    /// Address of the dylibs image array
    pub dylibs_image_array_addr: u64,
    /// Size of the dylibs image array
    pub dylibs_image_array_size: u64,
    /// Address of the dylibs trie
    pub dylibs_trie_addr: u64,
    /// Size of the dylibs trie
    pub dylibs_trie_size: u64,
    /// Address of the other-image array
    pub other_image_array_addr: u64,
    /// Size of the other-image array
    pub other_image_array_size: u64,
    /// Address of the other-image trie
    pub other_trie_addr: u64,
    /// Size of the other-image trie
    pub other_trie_size: u64,
    /// File offset to first `DyldCacheMappingAndSlideInfo`
    pub mapping_with_slide_offset: u32,
    /// Number of extended mapping entries
    pub mapping_with_slide_count: u32,
    /// Unused
    pub dylibs_pbl_state_array_addr_unused: u64,
    /// Address of the dylibs PrebuiltLoaderSet
    pub dylibs_pbl_set_addr: u64,
    /// Address of the per-program PrebuiltLoaderSet pool
    pub programs_pbl_set_pool_addr: u64,
    /// Size of the per-program PrebuiltLoaderSet pool
    pub programs_pbl_set_pool_size: u64,
    /// Address of the program path trie
    pub program_trie_addr: u64,
    /// Size of the program path trie
    pub program_trie_size: u32,
    /// OS version for the main platform
    pub os_version: u32,
    /// Alternative platform (e.g. iOSMac on macOS)
    pub alt_platform: u32,
    /// Alternative OS version
    pub alt_os_version: u32,
    /// VM offset to the Swift optimizations header
    pub swift_opts_offset: u64,
    /// Size of the Swift optimizations header
    pub swift_opts_size: u64,
    /// File offset to first sub-cache entry
    pub sub_cache_array_offset: u32,
    /// Number of sub-cache entries
    pub sub_cache_array_count: u32,
    /// UUID of the `.symbols` sub-cache file
    pub symbol_file_uuid: [u8; 16],
    /// Address of the Rosetta read-only region
    pub rosetta_read_only_addr: u64,
    /// Size of the Rosetta read-only region
    pub rosetta_read_only_size: u64,
    /// Address of the Rosetta read-write region
    pub rosetta_read_write_addr: u64,
    /// Size of the Rosetta read-write region
    pub rosetta_read_write_size: u64,
    /// File offset to the image info array
    pub images_offset: u32,
    /// Number of images
    pub images_count: u32,
    /// Sub-cache type when `cache_type` is multi-cache
    pub cache_sub_type: u32,
    /// Padding
    pub _pad1: u32,
    /// VM offset to the ObjC optimizations header
    pub objc_opts_offset: u64,
    /// Size of the ObjC optimizations header
    pub objc_opts_size: u64,
    /// VM offset to the embedded cache atlas
    pub cache_atlas_offset: u64,
    /// Size of the embedded cache atlas
    pub cache_atlas_size: u64,
    /// VM offset to the dynamic data header
    pub dynamic_data_offset: u64,
    /// Maximum size reserved for dynamic data
    pub dynamic_data_max_size: u64,
    /// File offset to the first TPRO mapping entry
    pub tpro_mappings_offset: u32,
    /// Number of TPRO mapping entries
    pub tpro_mappings_count: u32,
}

impl DyldCacheHeader {
    /// Returns the architecture suffix from the magic string.
    pub fn architecture(&self) -> &str {
        let magic_str = std::str::from_utf8(&self.magic).unwrap_or("");
        magic_str
            .trim_start_matches("dyld_v0")
            .trim_start_matches("dyld_v1")
            .trim_matches(['\0', ' '])
    }

    /// Checks if a header field exists based on `mapping_offset`.
    pub fn contains_field(&self, field_offset: usize) -> bool {
        field_offset < self.mapping_offset as usize
    }

    /// Returns true if this is a valid dyld cache header.
    pub fn is_valid(&self) -> bool {
        &self.magic[..4] == DYLD_CACHE_MAGIC_PREFIX
    }

    /// Returns true when the header declares the sub-cache entry table.
    pub fn has_sub_cache_array(&self) -> bool {
        self.contains_field(offset_of!(Self, sub_cache_array_offset))
    }

    /// Returns true when the header declares extended mappings.
    pub fn has_mappings_with_slide(&self) -> bool {
        self.contains_field(offset_of!(Self, mapping_with_slide_offset))
            && self.mapping_with_slide_offset != 0
    }

    /// Returns true when the image table moved to its modern location.
    pub fn uses_new_images_offset(&self) -> bool {
        self.contains_field(offset_of!(Self, images_offset)) && self.images_offset != 0
    }
}

impl fmt::Display for DyldCacheHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DyldCache {{ magic: {:?}, arch: {} }}",
            std::str::from_utf8(&self.magic).unwrap_or("???"),
            self.architecture(),
        )
    }
}

// =============================================================================
// Mapping Structures
// =============================================================================

/// Basic mapping entry.
///
/// Also the persisted form of a backing cache mapping in view metadata.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromBytes, KnownLayout, Immutable, Serialize, Deserialize,
)]
#[repr(C)]
pub struct DyldCacheMappingInfo {
    /// Virtual memory address
    pub address: u64,
    /// Size in bytes
    pub size: u64,
    /// File offset
    pub file_offset: u64,
    /// Maximum memory protection
    pub max_prot: u32,
    /// Initial memory protection
    pub init_prot: u32,
}

impl DyldCacheMappingInfo {
    /// Returns true if this mapping contains the given virtual address.
    #[inline]
    pub fn contains_addr(&self, addr: u64) -> bool {
        addr >= self.address && addr < self.address + self.size
    }
}

/// Extended mapping entry with per-mapping slide info.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheMappingAndSlideInfo {
    /// Virtual memory address
    pub address: u64,
    /// Size in bytes
    pub size: u64,
    /// File offset
    pub file_offset: u64,
    /// Slide info file offset (0 if none)
    pub slide_info_file_offset: u64,
    /// Slide info file size (0 if none)
    pub slide_info_file_size: u64,
    /// Mapping flags
    pub flags: u64,
    /// Maximum memory protection
    pub max_prot: u32,
    /// Initial memory protection
    pub init_prot: u32,
}

// =============================================================================
// Image Structures
// =============================================================================

/// Information about a dylib in the cache.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheImageInfo {
    /// Address of the Mach-O header
    pub address: u64,
    /// Modification time
    pub mod_time: u64,
    /// Inode
    pub inode: u64,
    /// Offset to the path string
    pub path_file_offset: u32,
    /// Padding
    pub pad: u32,
}

// =============================================================================
// Slide Info Structures
// =============================================================================

/// Slide info version 2 (standard arm64).
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheSlideInfo2 {
    /// Version (2)
    pub version: u32,
    /// Page size
    pub page_size: u32,
    /// Offset to the page starts array
    pub page_starts_offset: u32,
    /// Number of page start entries
    pub page_starts_count: u32,
    /// Offset to the page extras array
    pub page_extras_offset: u32,
    /// Number of page extras entries
    pub page_extras_count: u32,
    /// Mask for the delta field in each pointer
    pub delta_mask: u64,
    /// Value added to rebased pointers
    pub value_add: u64,
}

impl DyldCacheSlideInfo2 {
    /// Returns the mask for the value portion of a pointer.
    #[inline]
    pub fn value_mask(&self) -> u64 {
        !self.delta_mask
    }

    /// Returns the shift amount turning the masked delta into a byte delta.
    #[inline]
    pub fn delta_shift(&self) -> u32 {
        self.delta_mask.trailing_zeros() - 2
    }
}

/// Slide info version 3 (arm64e with pointer authentication).
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheSlideInfo3 {
    /// Version (3)
    pub version: u32,
    /// Page size
    pub page_size: u32,
    /// Number of page start entries
    pub page_starts_count: u32,
    /// Padding
    pub _pad: u32,
    /// Value added to authenticated pointers
    pub auth_value_add: u64,
    // Followed by page_starts array of u16
}

/// Slide info version 5 (arm64e, iOS 18+).
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheSlideInfo5 {
    /// Version (5)
    pub version: u32,
    /// Page size
    pub page_size: u32,
    /// Number of page start entries
    pub page_starts_count: u32,
    /// Padding for 8-byte alignment of value_add
    pub _pad: u32,
    /// Value added to rebased pointers
    pub value_add: u64,
    // Followed by page_starts array of u16
}

/// Encoded chained pointer for slide info v3.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct SlidePointer3(pub u64);

impl SlidePointer3 {
    /// Returns true for an authenticated pointer.
    #[inline]
    pub fn is_auth(&self) -> bool {
        (self.0 >> 63) & 1 != 0
    }

    /// Offset to the next chained pointer, in 8-byte strides.
    #[inline]
    pub fn offset_to_next_pointer(&self) -> u64 {
        (self.0 >> 51) & 0x7FF
    }

    /// Authenticated pointers: offset from the shared cache base.
    #[inline]
    pub fn offset_from_shared_cache_base(&self) -> u64 {
        self.0 & 0xFFFF_FFFF
    }

    /// Plain pointers: reconstruct the value from the top-8 and bottom-43
    /// bit fields of the 51-bit packed value.
    #[inline]
    pub fn plain_value(&self) -> u64 {
        let value51 = self.0 & 0x0007_FFFF_FFFF_FFFF;
        let top8 = value51 & 0x0007_F800_0000_0000;
        let bottom43 = value51 & 0x0000_07FF_FFFF_FFFF;
        (top8 << 13) | bottom43
    }
}

/// Encoded chained pointer for slide info v5.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct SlidePointer5(pub u64);

impl SlidePointer5 {
    /// Returns true for an authenticated pointer.
    #[inline]
    pub fn is_auth(&self) -> bool {
        (self.0 >> 63) & 1 != 0
    }

    /// Offset to the next chained pointer, in 8-byte strides.
    #[inline]
    pub fn next(&self) -> u64 {
        (self.0 >> 51) & 0x7FF
    }

    /// Runtime offset from the shared cache base (both variants).
    #[inline]
    pub fn runtime_offset(&self) -> u64 {
        self.0 & 0x0003_FFFF_FFFF
    }
}

// =============================================================================
// Subcache Structures
// =============================================================================

/// Sub-cache entry (first generation, without an explicit extension).
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldSubcacheEntry {
    /// UUID of the sub-cache
    pub uuid: [u8; 16],
    /// VM offset from the main cache
    pub cache_vm_offset: u64,
}

/// Sub-cache entry (second generation, with an explicit file extension).
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldSubcacheEntry2 {
    /// UUID of the sub-cache
    pub uuid: [u8; 16],
    /// VM offset from the main cache
    pub cache_vm_offset: u64,
    /// File extension (e.g. ".01", ".dylddata")
    pub file_extension: [u8; 32],
}

impl DyldSubcacheEntry2 {
    /// Returns the file extension as a string.
    pub fn extension(&self) -> &str {
        let end = self
            .file_extension
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.file_extension.len());
        std::str::from_utf8(&self.file_extension[..end]).unwrap_or("")
    }
}

// =============================================================================
// Local Symbols
// =============================================================================

/// Local symbols information header.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheLocalSymbolsInfo {
    /// Offset into this chunk of the nlist array
    pub nlist_offset: u32,
    /// Number of nlist entries
    pub nlist_count: u32,
    /// Offset into this chunk of the string pool
    pub strings_offset: u32,
    /// Byte count of the string pool
    pub strings_size: u32,
    /// Offset into this chunk of the per-dylib entries
    pub entries_offset: u32,
    /// Number of per-dylib entries
    pub entries_count: u32,
}

// =============================================================================
// ObjC Optimizations
// =============================================================================

/// Header of the ObjC optimization data referenced by the cache header.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ObjcOptimizationHeader {
    /// Version
    pub version: u32,
    /// Flags
    pub flags: u32,
    /// Cache offset of the read-only header info
    pub header_info_ro_cache_offset: u64,
    /// Cache offset of the read-write header info
    pub header_info_rw_cache_offset: u64,
    /// Cache offset of the selector hash table
    pub selector_hash_table_cache_offset: u64,
    /// Cache offset of the class hash table
    pub class_hash_table_cache_offset: u64,
    /// Cache offset of the protocol hash table
    pub protocol_hash_table_cache_offset: u64,
    /// Cache offset of the relative method selector base
    pub relative_method_selector_base_address_offset: u64,
}
